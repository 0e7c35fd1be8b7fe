//! Container log files and debug dumps.
//!
//! Detached containers log through the json-file driver: one JSON object per
//! line, `{"log": "...", "stream": "stdout", "time": "..."}`, stored at
//! `<data_store>/containers/<namespace>/<id>/<id>-json.log`.

use crate::{CoreError, Driver};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub time: String,
}

pub fn log_path(data_store: &Path, namespace: &str, id: &str) -> PathBuf {
    data_store
        .join("containers")
        .join(namespace)
        .join(id)
        .join(format!("{id}-json.log"))
}

/// Copy the `log` field of every entry in `reader` to `sink`, returning the
/// number of entries written. Blank lines are skipped; a malformed line is an
/// error.
pub async fn copy_json_log<R, W>(reader: R, sink: &mut W) -> Result<usize, CoreError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut lines = reader.lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_str(&line)?;
        sink.write_all(entry.log.as_bytes()).await?;
        count += 1;
    }
    Ok(count)
}

/// Inspect entries as an indented JSON array.
fn pretty_json<T: Serialize>(entries: &[T]) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    entries.serialize(&mut ser)?;
    Ok(buf)
}

impl Driver {
    /// Path of the json-file log for container `id` in this driver's
    /// namespace.
    pub fn log_path(&self, id: &str) -> PathBuf {
        log_path(&self.data_store, &self.namespace, id)
    }

    /// Write the inspect data and the full log of a container to `sink`.
    ///
    /// The inspect section is written even when the log file turns out to be
    /// missing, in which case [`CoreError::LogUnavailable`] is returned.
    pub async fn debug_info<W>(&self, container: &str, sink: &mut W) -> Result<(), CoreError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let record = self.resolve_one(container).await?;
        let inspect = self.inspect_record(&record).await?;

        sink.write_all(b"Inspected the container:\n").await?;
        sink.write_all(&pretty_json(&[inspect])?).await?;
        sink.write_all(b"\n").await?;

        let path = self.log_path(&record.id);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(source) => {
                warn!("no log file for container {}: {source}", record.id);
                sink.flush().await?;
                return Err(CoreError::LogUnavailable { path, source });
            }
        };

        sink.write_all(b"Got logs from the container:\n").await?;
        let count = copy_json_log(BufReader::new(file), sink).await?;
        sink.flush().await?;
        debug!("wrote {count} log entries of container {}", record.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_layout() {
        let path = log_path(Path::new("/var/lib/nerdctl/1935db59"), "default", "abc");
        assert_eq!(
            path,
            Path::new("/var/lib/nerdctl/1935db59/containers/default/abc/abc-json.log")
        );
    }

    #[tokio::test]
    async fn copies_log_fields_in_order() {
        let input = concat!(
            r#"{"log":"starting\n","stream":"stdout","time":"2024-01-01T00:00:00Z"}"#,
            "\n\n",
            r#"{"log":"oops\n","stream":"stderr","time":"2024-01-01T00:00:01Z"}"#,
            "\n",
        );
        let mut out = Vec::new();
        let n = copy_json_log(input.as_bytes(), &mut out).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(String::from_utf8(out).unwrap(), "starting\noops\n");
    }

    #[tokio::test]
    async fn malformed_line_is_an_error() {
        let mut out = Vec::new();
        let err = copy_json_log("not json\n".as_bytes(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Json(_)));
    }

    #[test]
    fn pretty_json_uses_four_spaces() {
        let out = pretty_json(&[serde_json::json!({"Id": "abc"})]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[\n    {\n        \"Id\": \"abc\"\n    }\n]"
        );
    }
}
