//! Subprocess upstream transport.
//!
//! Spawns the configured command and frames JSON-RPC as one envelope per line
//! on stdin/stdout. Stderr is drained and surfaced as diagnostic log lines.
//! When the child exits, the transport reports closed and pending requests
//! fail upstream-closed.

use crate::error::{ProxyError, Result};
use crate::protocol::Envelope;
use crate::upstream::{TransportEvent, UpstreamTransport};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Upper bound on a single stdout frame. Anything larger is a framing bug on
/// the upstream side, not a legitimate message.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    shell: bool,
    stdin: Option<Mutex<ChildStdin>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: CancellationToken,
}

impl StdioTransport {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        shell: bool,
    ) -> Self {
        StdioTransport {
            command,
            args,
            env,
            shell,
            stdin: None,
            events: None,
            shutdown: CancellationToken::new(),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = if self.shell {
            let joined = std::iter::once(self.command.as_str())
                .chain(self.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            #[cfg(windows)]
            let mut cmd = {
                let mut c = Command::new("cmd");
                c.arg("/C").arg(joined);
                c
            };
            #[cfg(not(windows))]
            let mut cmd = {
                let mut c = Command::new("/bin/sh");
                c.arg("-c").arg(joined);
                c
            };
            cmd.kill_on_drop(true);
            cmd
        } else {
            let mut cmd = Command::new(&self.command);
            cmd.args(&self.args);
            cmd.kill_on_drop(true);
            cmd
        };
        // Environment is inherited; configured entries overlay it.
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl UpstreamTransport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut child = self.build_command().spawn().map_err(|e| {
            ProxyError::TransportSetup(format!("failed to spawn '{}': {e}", self.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::TransportSetup("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::TransportSetup("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProxyError::TransportSetup("child stderr unavailable".into()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // stdout: newline-delimited JSON envelopes.
        let stdout_tx = events_tx.clone();
        let command = self.command.clone();
        tokio::spawn(async move {
            let mut lines =
                FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(command = %command, error = %e, "stdout framing error");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Envelope::decode(line.as_bytes()) {
                    Ok(envelope) => {
                        if stdout_tx.send(TransportEvent::Message(envelope)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(command = %command, error = %e, "skipping undecodable stdout line");
                    }
                }
            }
        });

        // stderr: diagnostics only.
        let command = self.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(command = %command, line = %line, "upstream stderr");
            }
        });

        // Exit watcher: kills on close, reports Closed on exit.
        let shutdown = self.shutdown.clone();
        let command = self.command.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(command = %command, error = %e, "failed to kill child");
                    }
                }
                status = child.wait() => {
                    match status {
                        Ok(status) => {
                            tracing::info!(command = %command, code = ?status.code(), "upstream process exited");
                        }
                        Err(e) => {
                            tracing::warn!(command = %command, error = %e, "failed to reap upstream process");
                        }
                    }
                }
            }
            let _ = events_tx.send(TransportEvent::Closed);
        });

        self.stdin = Some(Mutex::new(stdin));
        self.events = Some(events_rx);
        tracing::info!(command = %self.command, args = ?self.args, shell = self.shell, "spawned stdio upstream");
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let stdin = self
            .stdin
            .as_ref()
            .ok_or(ProxyError::UpstreamClosed)?;
        let mut frame = envelope.encode();
        frame.push('\n');
        let mut guard = stdin.lock().await;
        guard
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| ProxyError::UpstreamIo(format!("stdin write failed: {e}")))?;
        guard
            .flush()
            .await
            .map_err(|e| ProxyError::UpstreamIo(format!("stdin flush failed: {e}")))
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }

    fn describe(&self) -> String {
        format!("stdio:{}", self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamConnection;
    use crate::protocol::{Request, RequestId, Version2};
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn echoes_over_newline_framing() {
        // `cat` echoes each request line back; a request therefore comes back
        // as a request, which the connection broadcasts as server traffic.
        let transport = StdioTransport::new("cat".into(), vec![], HashMap::new(), false);
        let conn = UpstreamConnection::establish(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();
        let mut server_rx = conn.subscribe();

        let envelope = Envelope::Request(Request {
            jsonrpc: Version2,
            id: RequestId::Number(1),
            method: "ping".into(),
            params: None,
        });
        conn.send(&envelope).await.unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, envelope);
        conn.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_closes_the_connection() {
        let transport = StdioTransport::new("true".into(), vec![], HashMap::new(), false);
        let conn = UpstreamConnection::establish(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();
        let closed = conn.closed_token();
        tokio::time::timeout(Duration::from_secs(5), closed.cancelled())
            .await
            .unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn spawn_failure_is_transport_setup() {
        let mut transport = StdioTransport::new(
            "definitely-not-a-real-binary-xyz".into(),
            vec![],
            HashMap::new(),
            false,
        );
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, ProxyError::TransportSetup(_)));
    }
}
