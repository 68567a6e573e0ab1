//! Serve one session over newline-delimited JSON on stdin/stdout.

use std::sync::Arc;

use {
    switchboard_protocol::{JsonRpcError, JsonRpcMessage, JsonRpcResponse, error_codes, methods},
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
        sync::mpsc,
    },
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    context::Outbound,
    error::Result,
    handler::McpHandler,
    session::{SessionSettings, SessionTransport, StreamableSession},
};

/// Serve `handler` on the process's stdin/stdout until stdin closes.
pub async fn serve_stdio(handler: Arc<dyn McpHandler>, settings: SessionSettings) -> Result<()> {
    serve_stream(tokio::io::stdin(), tokio::io::stdout(), handler, settings).await
}

/// Serve one session over any line-oriented byte stream pair.
pub async fn serve_stream<R, W>(
    reader: R,
    writer: W,
    handler: Arc<dyn McpHandler>,
    settings: SessionSettings,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Arc::new(StreamableSession::new(
        Uuid::new_v4().to_string(),
        handler,
        settings,
    ));
    info!(session_id = %session.session_id(), "stdio session started");

    let (tx, rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = match JsonRpcMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable frame on stdin");
                let error = JsonRpcError::new(error_codes::PARSE_ERROR, e.to_string());
                let _ = tx.send(JsonRpcResponse::failure(None, error).into());
                continue;
            },
        };

        // Requests run concurrently so responses to our own sampling and
        // elicitation requests can be read while a tool is waiting on them.
        // The handshake stays in order.
        match message {
            JsonRpcMessage::Request(request) if request.method != methods::INITIALIZE => {
                let session = Arc::clone(&session);
                let tx = tx.clone();
                tokio::spawn(async move {
                    dispatch(&session, JsonRpcMessage::Request(request), tx).await;
                });
            },
            other => dispatch(&session, other, tx.clone()).await,
        }
    }

    debug!(session_id = %session.session_id(), "stdin closed");
    session.close().await?;
    drop(tx);
    if let Err(e) = writer_task.await {
        warn!(error = %e, "stdout writer task failed");
    }
    info!(session_id = %session.session_id(), "stdio session ended");
    Ok(())
}

async fn dispatch(session: &StreamableSession, message: JsonRpcMessage, tx: Outbound) {
    match session.handle_message(message, Some(tx.clone())).await {
        Ok(Some(response)) => {
            let _ = tx.send(response.into());
        },
        Ok(None) => {},
        Err(e) => warn!(error = %e, "failed to handle frame"),
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<JsonRpcMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize outgoing frame");
                continue;
            },
        };
        payload.push('\n');
        if let Err(e) = writer.write_all(payload.as_bytes()).await {
            warn!(error = %e, "stdout closed");
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "stdout flush failed");
            return;
        }
    }
}
