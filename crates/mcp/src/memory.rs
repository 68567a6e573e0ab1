//! In-process transport pair, for embedding a server in the same process and
//! for deterministic tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    switchboard_protocol::JsonRpcMessage,
    tokio::sync::{Mutex, mpsc},
};

use crate::{
    error::{TransportError, TransportResult},
    traits::{EventSender, McpTransport, TransportEvent},
};

/// Client half: frames sent here arrive at the paired [`MemoryServer`].
pub struct MemoryTransport {
    to_server: mpsc::UnboundedSender<JsonRpcMessage>,
    events: Arc<Mutex<Option<EventSender>>>,
    alive: AtomicBool,
}

/// Server half of a [`MemoryTransport`].
pub struct MemoryServer {
    from_client: mpsc::UnboundedReceiver<JsonRpcMessage>,
    events: Arc<Mutex<Option<EventSender>>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryServer) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let events = Arc::new(Mutex::new(None));
        (
            Self {
                to_server,
                events: Arc::clone(&events),
                alive: AtomicBool::new(false),
            },
            MemoryServer {
                from_client,
                events,
            },
        )
    }
}

#[async_trait]
impl McpTransport for MemoryTransport {
    async fn start(&self, events: EventSender) -> TransportResult<()> {
        *self.events.lock().await = Some(events);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("memory transport not started".into()));
        }
        self.to_server
            .send(message)
            .map_err(|_| TransportError::Closed("memory server dropped".into()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.events.lock().await.take();
    }
}

impl MemoryServer {
    /// Next frame written by the client. `None` once the client half is dropped.
    pub async fn recv(&mut self) -> Option<JsonRpcMessage> {
        self.from_client.recv().await
    }

    /// Deliver a frame to the client. Returns `false` when nobody is listening.
    pub async fn send(&self, message: impl Into<JsonRpcMessage>) -> bool {
        self.emit(TransportEvent::Message(message.into())).await
    }

    /// Simulate the channel dropping.
    pub async fn disconnect(&self, reason: &str) -> bool {
        self.emit(TransportEvent::Closed(TransportError::Closed(reason.to_string())))
            .await
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        match self.events.lock().await.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}
