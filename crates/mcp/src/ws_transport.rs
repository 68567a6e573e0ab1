//! WebSocket transport: one JSON-RPC message per text frame.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    switchboard_common::AbortOnDrop,
    switchboard_protocol::JsonRpcMessage,
    tokio::sync::{Mutex, mpsc},
    tokio_tungstenite::{
        connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            http::{HeaderName, HeaderValue},
        },
    },
    tracing::{debug, info, warn},
};

use crate::{
    error::{TransportError, TransportResult},
    traits::{EventSender, McpTransport, TransportEvent},
};

pub struct WebSocketTransport {
    url: String,
    headers: HashMap<String, String>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<AbortOnDrop>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            url: url.into(),
            headers,
            write_tx: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        }
    }
}

#[async_trait]
impl McpTransport for WebSocketTransport {
    async fn start(&self, events: EventSender) -> TransportResult<()> {
        info!(url = %self.url, "connecting to MCP server via WebSocket");

        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Closed(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Closed(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws_stream, _response) = connect_async(request).await?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();

        // Ends once every sender is gone or after writing a close frame.
        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = ws_sink.send(message).await {
                    debug!(error = %e, "WebSocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let alive = Arc::clone(&self.alive);
        let pong_tx = write_tx.clone();
        let reader = AbortOnDrop::new(tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => match JsonRpcMessage::parse(text.as_str()) {
                        Ok(message) => {
                            let _ = events.send(TransportEvent::Message(message));
                        },
                        Err(e) => warn!(error = %e, "ignoring malformed WebSocket frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "WebSocket closed by server");
                        break TransportError::Closed("closed by server".into());
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => break TransportError::from(e),
                    None => break TransportError::Closed("WebSocket stream ended".into()),
                }
            };
            alive.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Closed(reason));
        }));

        *self.write_tx.lock().await = Some(write_tx);
        *self.reader.lock().await = Some(reader);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.is_alive() {
            return Err(TransportError::Closed("WebSocket not connected".into()));
        }
        let json = serde_json::to_string(&message)?;
        let guard = self.write_tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| TransportError::Closed("WebSocket not connected".into()))?;
        tx.send(Message::Text(json.into()))
            .map_err(|_| TransportError::Closed("WebSocket writer stopped".into()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.write_tx.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.reader.lock().await.take();
    }
}
