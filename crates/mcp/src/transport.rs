//! Stdio transport: spawn a child process and exchange newline-delimited
//! JSON-RPC over its stdin/stdout.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    switchboard_common::AbortOnDrop,
    switchboard_protocol::JsonRpcMessage,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::Mutex,
    },
    tracing::{debug, info, warn},
};

use crate::{
    error::{TransportError, TransportResult},
    traits::{EventSender, McpTransport, TransportEvent},
};

/// Stdio-based transport for an MCP server process.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    alive: Arc<AtomicBool>,
    tasks: Mutex<Vec<AbortOnDrop>>,
}

impl StdioTransport {
    /// Describe the process to run. Nothing is spawned until `start`.
    pub fn new(command: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn start(&self, events: EventSender) -> TransportResult<()> {
        info!(
            command = %self.command,
            args = ?self.args,
            "spawning MCP server process"
        );

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(command = %self.command, pid = ?child.id(), "MCP server process spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Closed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Closed("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();

        let mut tasks = Vec::new();

        // stderr is diagnostics only, never protocol data.
        if let Some(stderr) = stderr {
            let events = events.clone();
            tasks.push(AbortOnDrop::new(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        let _ = events.send(TransportEvent::Diagnostic(trimmed.to_string()));
                    }
                }
            })));
        }

        let alive = Arc::clone(&self.alive);
        tasks.push(AbortOnDrop::new(tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            let reason = loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("MCP server stdout closed");
                        break TransportError::ProcessExited;
                    },
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        debug!(raw = %trimmed, "MCP server -> client");
                        match JsonRpcMessage::parse(trimmed) {
                            Ok(message) => {
                                let _ = events.send(TransportEvent::Message(message));
                            },
                            Err(e) => {
                                debug!(error = %e, line = %trimmed, "MCP server sent a non-JSON-RPC line");
                            },
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "error reading from MCP server stdout");
                        break TransportError::Io(e);
                    },
                }
            };
            alive.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Closed(reason));
        })));

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        *self.tasks.lock().await = tasks;
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        let mut payload = serde_json::to_string(&message)?;
        payload.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed("process not running".into()))?;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.tasks.lock().await.clear();
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            debug!(error = %e, "MCP server process already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        serde_json::json,
        std::time::Duration,
        switchboard_protocol::{JsonRpcNotification, JsonRpcRequest},
        tokio::sync::mpsc,
    };

    fn sh(script: &str) -> StdioTransport {
        StdioTransport::new("sh", vec!["-c".into(), script.into()], HashMap::new())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn echoes_frames_through_cat() {
        let transport = StdioTransport::new("cat", Vec::new(), HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).await.unwrap();
        assert!(transport.is_alive());

        let request = JsonRpcRequest::new(1, "ping", Some(json!({})));
        transport.send(request.clone().into()).await.unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Message(JsonRpcMessage::Request(echoed)) => assert_eq!(echoed, request),
            other => panic!("unexpected event {other:?}"),
        }

        transport.close().await;
        assert!(!transport.is_alive());
        assert!(transport.send(JsonRpcNotification::new("x", None).into()).await.is_err());
    }

    #[tokio::test]
    async fn stderr_is_diagnostic_and_exit_closes() {
        let transport = sh("echo 'booting' >&2; echo 'not json'; echo '{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}'");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).await.unwrap();

        let mut saw_diagnostic = false;
        let mut saw_message = false;
        loop {
            match next_event(&mut rx).await {
                TransportEvent::Diagnostic(line) => {
                    assert_eq!(line, "booting");
                    saw_diagnostic = true;
                },
                TransportEvent::Message(msg) => {
                    assert_eq!(msg.method(), Some("notifications/message"));
                    saw_message = true;
                },
                TransportEvent::Closed(TransportError::ProcessExited) => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_message);
        assert!(!transport.is_alive());
        // stderr may be drained after stdout closes.
        if !saw_diagnostic {
            assert!(matches!(
                next_event(&mut rx).await,
                TransportEvent::Diagnostic(line) if line == "booting"
            ));
        }
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let transport = StdioTransport::new("nonexistent_command_xyz_42", Vec::new(), HashMap::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(transport.start(tx).await, Err(TransportError::Io(_))));
        assert!(!transport.is_alive());
    }
}
