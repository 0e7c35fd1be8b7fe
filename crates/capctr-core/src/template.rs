//! Go-style format strings rendered with handlebars.
//!
//! The driver's formats use a small part of Go `text/template` syntax:
//! `{{.A.B}}` field paths, `{{range .Path}}...{{end}}`, `{{json .Path}}`,
//! trim markers (`{{-`, `-}}`) and the bare `json` alias. [`Template::parse`]
//! translates that into a strict-mode handlebars template, so a missing field
//! is an error rather than an empty string.
//!
//! Rendering has two stages. [`render_with_fallback`] first renders the data's
//! serialized form as is, where a null endpoint inside a `range` fails the
//! render. It then retries on a copy with null entries pruned, so `range`
//! only visits present values.

use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

const TEMPLATE_NAME: &str = "format";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("template syntax error: {0}")]
    Syntax(#[from] Box<handlebars::TemplateError>),
    #[error("template execution error: {0}")]
    Render(String),
}

impl TemplateError {
    fn parse(offset: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            message: message.into(),
        }
    }

    /// Execution-class errors are the ones the pruned-data retry can recover.
    pub fn is_exec(&self) -> bool {
        matches!(self, Self::Render(_))
    }
}

impl From<RenderError> for TemplateError {
    fn from(e: RenderError) -> Self {
        Self::Render(e.to_string())
    }
}

/// A compiled format string.
pub struct Template {
    source: String,
    registry: Handlebars<'static>,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let translated = translate(source)?;
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("json", Box::new(json_helper));
        registry
            .register_template_string(TEMPLATE_NAME, &translated)
            .map_err(Box::new)?;
        Ok(Self {
            source: translated,
            registry,
        })
    }

    /// The handlebars form of the template.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render<T: Serialize>(&self, data: &T) -> Result<String, TemplateError> {
        Ok(self.registry.render(TEMPLATE_NAME, data)?)
    }
}

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h
        .param(0)
        .map(|p| p.value())
        .ok_or_else(|| RenderError::new("json needs one argument"))?;
    out.write(&value.to_string())?;
    Ok(())
}

/// Rewrite Go template actions as handlebars expressions.
fn translate(source: &str) -> Result<String, TemplateError> {
    if source == "json" {
        return Ok("{{json this}}".to_owned());
    }

    let mut out = String::with_capacity(source.len());
    // Byte offsets of the open `range` actions.
    let mut open_ranges: Vec<usize> = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        let close = rest[open..]
            .find("}}")
            .map(|i| open + i)
            .ok_or_else(|| TemplateError::parse(offset + open, "unclosed action"))?;
        out.push_str(&rest[..open]);

        let at = offset + open;
        let mut action = &rest[open + 2..close];
        let trim_before = action.starts_with("- ");
        if trim_before {
            action = &action[1..];
        }
        let trim_after = action.ends_with(" -");
        if trim_after {
            action = &action[..action.len() - 1];
        }
        let action = action.trim();

        let expr = if action == "end" {
            open_ranges
                .pop()
                .ok_or_else(|| TemplateError::parse(at, "unexpected {{end}}"))?;
            "/each".to_owned()
        } else if let Some(arg) = keyword_arg(action, "range") {
            open_ranges.push(at);
            format!("#each {}", field_path(arg, at)?)
        } else if let Some(arg) = keyword_arg(action, "json") {
            format!("json {}", field_path(arg, at)?)
        } else if action.starts_with('.') {
            field_path(action, at)?
        } else {
            let name = action.split_whitespace().next().unwrap_or_default();
            return Err(TemplateError::parse(
                at,
                format!("function \"{name}\" not defined"),
            ));
        };

        out.push_str("{{");
        if trim_before {
            out.push('~');
        }
        out.push_str(&expr);
        if trim_after {
            out.push('~');
        }
        out.push_str("}}");

        offset += close + 2;
        rest = &rest[close + 2..];
    }
    out.push_str(rest);

    if let Some(at) = open_ranges.last() {
        return Err(TemplateError::parse(*at, "unexpected EOF, missing {{end}}"));
    }
    Ok(out)
}

/// Argument of `keyword` in `action`; `range.X` and `range .X` are both
/// accepted.
fn keyword_arg<'a>(action: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = action.strip_prefix(keyword)?;
    if rest.is_empty() {
        return Some(".");
    }
    if rest.starts_with('.') || rest.starts_with(char::is_whitespace) {
        return Some(rest.trim());
    }
    None
}

/// `.A.B` becomes `this.A.B`, which never resolves to a helper.
fn field_path(raw: &str, at: usize) -> Result<String, TemplateError> {
    if raw == "." {
        return Ok("this".to_owned());
    }
    let Some(fields) = raw.strip_prefix('.') else {
        return Err(TemplateError::parse(at, format!("expected field path, got '{raw}'")));
    };
    let valid = fields
        .split('.')
        .all(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !valid {
        return Err(TemplateError::parse(at, format!("bad field path '{raw}'")));
    }
    Ok(format!("this.{fields}"))
}

/// Drop null object entries and array elements at every depth.
fn prune_nulls(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, prune_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(prune_nulls)
                .collect(),
        ),
        other => other,
    }
}

/// Render `data`, retrying on its null-pruned JSON tree when the first
/// render fails at execution time.
pub fn render_with_fallback<T: Serialize>(
    template: &Template,
    data: &T,
) -> Result<String, TemplateError> {
    let tree = serde_json::to_value(data)
        .map_err(|e| TemplateError::Render(format!("unable to read inspect data: {e}")))?;
    match template.render(&tree) {
        Err(e) if e.is_exec() => {
            debug!("template execution failed ({e}), retrying without null entries");
            template.render(&prune_nulls(tree))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn translates_go_actions() {
        let t = Template::parse("{{range.NetworkSettings.Networks}}{{.IPAddress}}{{end}}")
            .unwrap();
        assert_eq!(
            t.source(),
            "{{#each this.NetworkSettings.Networks}}{{this.IPAddress}}{{/each}}"
        );
        let t = Template::parse("{{- json . -}}").unwrap();
        assert_eq!(t.source(), "{{~json this~}}");
    }

    #[test]
    fn renders_fields_and_ranges_over_json() {
        let data = json!({
            "NetworkSettings": {"Networks": {
                "b-net": {"IPAddress": "10.0.0.3"},
                "a-net": {"IPAddress": "172.18.0.2"}
            }}
        });
        let t = Template::parse("{{range.NetworkSettings.Networks}}{{.IPAddress}}{{end}}")
            .unwrap();
        // Object keys are visited in sorted order.
        assert_eq!(t.render(&data).unwrap(), "172.18.0.210.0.0.3");
    }

    #[test]
    fn null_entries_fail_then_are_pruned() {
        let data = json!({"Networks": {"a": null, "b": {"IPAddress": "10.0.0.9"}}});
        let t = Template::parse("{{range .Networks}}[{{.IPAddress}}]{{end}}").unwrap();
        assert!(t.render(&data).unwrap_err().is_exec());
        assert_eq!(render_with_fallback(&t, &data).unwrap(), "[10.0.0.9]");
    }

    #[test]
    fn missing_key_is_exec_error() {
        let data = json!({"Networks": {"a": {"Gateway": "10.0.0.1"}}});
        let t = Template::parse("{{range .Networks}}{{.IPAddress}}{{end}}").unwrap();
        let err = render_with_fallback(&t, &data).unwrap_err();
        assert!(err.is_exec());
    }

    #[test]
    fn text_is_not_escaped_and_trim_markers_apply() {
        let data = json!({"Name": "<node-0>", "Id": "a&b"});
        let t = Template::parse("name={{.Name}}   {{- .Id}}").unwrap();
        assert_eq!(t.render(&data).unwrap(), "name=<node-0>a&b");
    }

    #[test]
    fn scalars_render_as_text() {
        let data = json!({"State": {"Pid": 4242, "Running": true}});
        let t = Template::parse("{{.State.Pid}}/{{.State.Running}}").unwrap();
        assert_eq!(t.render(&data).unwrap(), "4242/true");
    }

    #[test]
    fn json_function_and_alias() {
        let data = json!({"Labels": {"a": "1"}});
        let t = Template::parse("{{json .Labels}}").unwrap();
        assert_eq!(t.render(&data).unwrap(), r#"{"a":"1"}"#);
        let t = Template::parse("json").unwrap();
        assert_eq!(t.render(&data).unwrap(), r#"{"Labels":{"a":"1"}}"#);
    }

    #[test]
    fn field_named_like_a_helper_is_a_field() {
        let data = json!({"json": "x", "log": "y"});
        let t = Template::parse("{{.json}}{{.log}}").unwrap();
        assert_eq!(t.render(&data).unwrap(), "xy");
    }

    #[test]
    fn parse_errors() {
        for bad in ["{{range .A}}x", "x{{end}}", "{{.A", "{{upper .A}}", "{{.A..B}}"] {
            let err = Template::parse(bad).unwrap_err();
            assert!(
                matches!(err, TemplateError::Parse { .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn nested_ranges() {
        let data = json!({"Ports": {"80/tcp": [{"HostPort": "8080"}, {"HostPort": "8081"}]}});
        let t = Template::parse("{{range .Ports}}{{range .}}{{.HostPort}},{{end}}{{end}}")
            .unwrap();
        assert_eq!(t.render(&data).unwrap(), "8080,8081,");
    }

    #[test]
    fn parse_errors_do_not_fall_back() {
        let err = Template::parse("{{range .X}}").unwrap_err();
        assert!(!err.is_exec());
    }

    #[derive(Serialize)]
    struct Endpoint {
        #[serde(rename = "IPAddress")]
        ip: String,
    }

    #[derive(Serialize)]
    struct Settings {
        #[serde(rename = "Networks")]
        networks: std::collections::BTreeMap<String, Option<Endpoint>>,
    }

    #[test]
    fn typed_data_with_absent_entry_renders_after_retry() {
        let settings = Settings {
            networks: [
                ("a".to_owned(), None),
                (
                    "b".to_owned(),
                    Some(Endpoint {
                        ip: "10.1.0.4".to_owned(),
                    }),
                ),
            ]
            .into_iter()
            .collect(),
        };
        let t = Template::parse("{{range .Networks}}{{.IPAddress}}{{end}}").unwrap();
        assert!(t.render(&settings).unwrap_err().is_exec());
        assert_eq!(render_with_fallback(&t, &settings).unwrap(), "10.1.0.4");
    }
}
