//! Signal parsing and forwarding to exec processes.

use nix::sys::signal::Signal;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

/// Signals relayed from the driver's process to a running exec process.
/// `SIGKILL` and `SIGSTOP` cannot be caught and are absent.
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
];

const RELAY_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid signal '{0}'")]
    Invalid(String),
    #[error("failed to listen for {signal}: {source}")]
    Listen {
        signal: Signal,
        #[source]
        source: std::io::Error,
    },
}

/// Parse `SIGTERM`, `TERM`, `term` or a signal number such as `15`.
pub fn parse_signal(raw: &str) -> Result<Signal, SignalError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SignalError::Invalid(raw.to_owned()));
    }
    if let Ok(num) = trimmed.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| SignalError::Invalid(raw.to_owned()));
    }
    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| SignalError::Invalid(raw.to_owned()))
}

/// Receiving end of a signal subscription. Listening stops when the relay is
/// dropped.
pub struct SignalRelay {
    rx: mpsc::Receiver<Signal>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalRelay {
    fn new(rx: mpsc::Receiver<Signal>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { rx, tasks }
    }

    /// Next received signal, or `None` once every listener is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Where an exec session gets the signals it forwards.
pub trait SignalSource: Send + Sync {
    fn subscribe(&self) -> Result<SignalRelay, SignalError>;
}

/// Listens to [`FORWARDED_SIGNALS`] delivered to this process. Must be
/// subscribed from within a tokio runtime with signal handling enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignalSource;

impl SignalSource for OsSignalSource {
    fn subscribe(&self) -> Result<SignalRelay, SignalError> {
        use tokio::signal::unix::{signal, SignalKind};

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(FORWARDED_SIGNALS.len());
        for &sig in FORWARDED_SIGNALS {
            let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
                Ok(s) => s,
                Err(source) => {
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(SignalError::Listen {
                        signal: sig,
                        source,
                    });
                }
            };
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    debug!("received {sig}");
                    if tx.send(sig).await.is_err() {
                        break;
                    }
                }
            }));
        }
        Ok(SignalRelay::new(rx, tasks))
    }
}

/// Signals injected through [`ChannelSignalSource::send`], fanned out to
/// every live subscription.
#[derive(Debug, Clone)]
pub struct ChannelSignalSource {
    tx: broadcast::Sender<Signal>,
}

impl Default for ChannelSignalSource {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(RELAY_BUFFER);
        Self { tx }
    }
}

impl ChannelSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `signal` to current subscribers; returns how many got it.
    pub fn send(&self, signal: Signal) -> usize {
        self.tx.send(signal).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SignalSource for ChannelSignalSource {
    fn subscribe(&self) -> Result<SignalRelay, SignalError> {
        let mut sub = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let task = tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(sig) => {
                        if tx.send(sig).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("signal relay lagged, {n} signals dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(SignalRelay::new(rx, vec![task]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal(" sigusr1 ").unwrap(), Signal::SIGUSR1);
    }

    #[test]
    fn rejects_unknown_signals() {
        assert!(matches!(parse_signal("SIGFOO"), Err(SignalError::Invalid(_))));
        assert!(matches!(parse_signal(""), Err(SignalError::Invalid(_))));
        assert!(matches!(parse_signal("999"), Err(SignalError::Invalid(_))));
    }

    #[tokio::test]
    async fn channel_source_fans_out() {
        let source = ChannelSignalSource::new();
        let mut a = source.subscribe().unwrap();
        let mut b = source.subscribe().unwrap();
        assert_eq!(source.subscriber_count(), 2);

        assert_eq!(source.send(Signal::SIGINT), 2);
        assert_eq!(a.recv().await, Some(Signal::SIGINT));
        assert_eq!(b.recv().await, Some(Signal::SIGINT));
    }

    #[tokio::test]
    async fn dropping_relay_unsubscribes() {
        let source = ChannelSignalSource::new();
        let relay = source.subscribe().unwrap();
        assert_eq!(source.subscriber_count(), 1);
        drop(relay);
        // Aborted forwarding task releases its receiver on the next poll.
        for _ in 0..100 {
            if source.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(source.send(Signal::SIGTERM), 0);
    }
}
