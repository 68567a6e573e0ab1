//! Request engine shared by every transport.
//!
//! Owns the pending-request table, id allocation, per-call timeouts and
//! progress routing. A response whose id is not pending (unknown, already
//! settled, or timed out) is dropped.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use {
    serde_json::{Value, json},
    switchboard_protocol::{
        JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, methods,
        types::{CancelledNotificationParams, ProgressNotificationParams},
    },
    tokio::{
        sync::{Mutex, mpsc, oneshot},
        time::Instant,
    },
    tracing::{debug, trace, warn},
};

use crate::{
    error::{Error, Result, TransportError},
    traits::McpTransport,
};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub type ProgressCallback = Arc<dyn Fn(&ProgressNotificationParams) + Send + Sync>;

/// Per-request timing and progress options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Time allowed without a response. Defaults to the connector's timeout.
    pub timeout: Option<Duration>,
    /// Hard ceiling from the moment of sending, regardless of progress.
    pub max_total_timeout: Option<Duration>,
    /// Restart the `timeout` clock whenever a progress notification arrives.
    pub reset_timeout_on_progress: bool,
    pub on_progress: Option<ProgressCallback>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_total_timeout(mut self, timeout: Duration) -> Self {
        self.max_total_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn reset_on_progress(mut self) -> Self {
        self.reset_timeout_on_progress = true;
        self
    }

    #[must_use]
    pub fn on_progress(
        mut self,
        callback: impl Fn(&ProgressNotificationParams) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    fn wants_progress(&self) -> bool {
        self.on_progress.is_some() || self.reset_timeout_on_progress
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("max_total_timeout", &self.max_total_timeout)
            .field("reset_timeout_on_progress", &self.reset_timeout_on_progress)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Options for `Connector::call_tool`.
pub type CallToolOptions = RequestOptions;

type Outcome = std::result::Result<JsonRpcResponse, TransportError>;

struct Pending {
    tx: oneshot::Sender<Outcome>,
    progress: Option<mpsc::UnboundedSender<ProgressNotificationParams>>,
}

pub struct Peer {
    transport: Arc<dyn McpTransport>,
    pending: Mutex<HashMap<RequestId, Pending>>,
    next_id: AtomicI64,
    connected: AtomicBool,
    default_timeout: Duration,
}

impl Peer {
    pub fn new(transport: Arc<dyn McpTransport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
            default_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn McpTransport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send a request and wait for its result, honoring `options`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let params = if options.wants_progress() {
            Some(with_progress_token(params, &id))
        } else {
            params
        };

        let (tx, mut rx) = oneshot::channel();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut progress_open = options.wants_progress();
        self.pending.lock().await.insert(id.clone(), Pending {
            tx,
            progress: progress_open.then_some(progress_tx),
        });

        debug!(method = %method, id = %id, "client -> server");
        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.transport.send(request.into()).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let total_deadline = options.max_total_timeout.map(|t| started + t);
        let mut deadline = started + timeout;

        loop {
            let wake = total_deadline.map_or(deadline, |total| total.min(deadline));
            tokio::select! {
                outcome = &mut rx => {
                    return match outcome {
                        Ok(Ok(response)) => response.into_result().map_err(|error| Error::Rpc {
                            method: method.to_string(),
                            error,
                        }),
                        Ok(Err(e)) => Err(e.into()),
                        Err(_) => Err(TransportError::Closed("request dropped".into()).into()),
                    };
                },
                progress = progress_rx.recv(), if progress_open => match progress {
                    Some(progress) => {
                        trace!(id = %id, progress = progress.progress, "progress");
                        if let Some(callback) = &options.on_progress {
                            callback(&progress);
                        }
                        if options.reset_timeout_on_progress {
                            deadline = Instant::now() + timeout;
                        }
                    },
                    None => progress_open = false,
                },
                () = tokio::time::sleep_until(wake) => {
                    self.abandon(&id, "request timed out").await;
                    return Err(Error::Timeout {
                        method: method.to_string(),
                        id,
                        elapsed: started.elapsed(),
                    });
                },
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        trace!(method = %method, "client -> server (notification)");
        self.transport
            .send(JsonRpcNotification::new(method, params).into())
            .await?;
        Ok(())
    }

    pub async fn respond(&self, response: JsonRpcResponse) -> Result<()> {
        self.transport.send(JsonRpcMessage::Response(response)).await?;
        Ok(())
    }

    /// Settle the pending request matching `response.id`.
    pub async fn handle_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            warn!(error = ?response.error, "server sent an error without a request id");
            return;
        };
        match self.pending.lock().await.remove(&id) {
            Some(pending) => {
                let _ = pending.tx.send(Ok(response));
            },
            None => debug!(id = %id, "dropping response for unknown or settled request"),
        }
    }

    /// Route a progress notification to the request whose token it carries.
    pub async fn handle_progress(&self, progress: ProgressNotificationParams) {
        let pending = self.pending.lock().await;
        if let Some(tx) = pending
            .get(&progress.progress_token)
            .and_then(|p| p.progress.as_ref())
        {
            let _ = tx.send(progress);
        }
    }

    /// Fail one pending request.
    pub async fn fail(&self, id: &RequestId, error: TransportError) {
        if let Some(pending) = self.pending.lock().await.remove(id) {
            let _ = pending.tx.send(Err(error));
        }
    }

    /// Mark the channel dead and fail every pending request.
    pub async fn fail_all(&self, reason: &str) {
        self.set_connected(false);
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), reason, "failing pending requests");
        }
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(TransportError::Closed(reason.to_string())));
        }
    }

    /// Forget a request and tell the server, best-effort, that we gave up on it.
    async fn abandon(&self, id: &RequestId, reason: &str) {
        self.pending.lock().await.remove(id);
        let params = CancelledNotificationParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let notification = JsonRpcNotification::new(methods::CANCELLED, serde_json::to_value(params).ok());
            if let Err(e) = transport.send(notification.into()).await {
                debug!(error = %e, "failed to send cancellation");
            }
        });
    }
}

/// Insert `_meta.progressToken` into request params.
fn with_progress_token(params: Option<Value>, id: &RequestId) -> Value {
    let mut params = match params {
        Some(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    };
    if let Some(obj) = params.as_object_mut() {
        let meta = obj.entry("_meta").or_insert_with(|| json!({}));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("progressToken".into(), json!(id));
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::memory::{MemoryServer, MemoryTransport},
        std::sync::atomic::AtomicUsize,
    };

    async fn connected_peer(timeout: Duration) -> (Peer, MemoryServer) {
        let (transport, server) = MemoryTransport::pair();
        let peer = Peer::new(Arc::new(transport), timeout);
        let (tx, _rx) = mpsc::unbounded_channel();
        peer.transport().start(tx).await.unwrap();
        peer.set_connected(true);
        (peer, server)
    }

    #[test]
    fn progress_token_is_injected() {
        let params = with_progress_token(Some(json!({"name": "x"})), &RequestId::Number(4));
        assert_eq!(params["_meta"]["progressToken"], 4);
        assert_eq!(params["name"], "x");

        let params = with_progress_token(None, &RequestId::Number(5));
        assert_eq!(params["_meta"]["progressToken"], 5);
    }

    #[tokio::test]
    async fn request_before_connect_is_not_connected() {
        let (transport, _server) = MemoryTransport::pair();
        let peer = Peer::new(Arc::new(transport), DEFAULT_REQUEST_TIMEOUT);
        let err = peer
            .request("ping", None, &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_pending_and_sends_cancel() {
        let (peer, mut server) = connected_peer(Duration::from_millis(50)).await;
        let err = peer
            .request("tools/call", None, &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(peer.pending_count().await, 0);

        let sent = server.recv().await.unwrap();
        assert_eq!(sent.method(), Some("tools/call"));
        let cancel = server.recv().await.unwrap();
        assert_eq!(cancel.method(), Some(methods::CANCELLED));

        // A late response is dropped.
        peer.handle_response(JsonRpcResponse::success(RequestId::Number(1), json!({})))
            .await;
        assert_eq!(peer.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_timeout_until_ceiling() {
        let (peer, mut server) = connected_peer(DEFAULT_REQUEST_TIMEOUT).await;
        let peer = Arc::new(peer);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let options = RequestOptions::default()
            .with_timeout(Duration::from_millis(100))
            .with_max_total_timeout(Duration::from_millis(450))
            .reset_on_progress()
            .on_progress(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let call = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.request("slow", None, &options).await })
        };

        let request = server.recv().await.unwrap();
        let token = match &request {
            JsonRpcMessage::Request(req) => req.progress_token().unwrap(),
            other => panic!("expected request, got {other:?}"),
        };
        let started = Instant::now();
        for step in 1..=8 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            peer.handle_progress(ProgressNotificationParams {
                progress_token: token.clone(),
                progress: f64::from(step),
                total: None,
                message: None,
            })
            .await;
        }

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        // Progress kept the call alive past the 100ms timeout, the ceiling ended it.
        assert!(started.elapsed() >= Duration::from_millis(440));
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn fail_all_rejects_pending_and_disconnects() {
        let (peer, mut server) = connected_peer(DEFAULT_REQUEST_TIMEOUT).await;
        let peer = Arc::new(peer);
        let call = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                peer.request("tools/list", None, &RequestOptions::default())
                    .await
            })
        };
        server.recv().await.unwrap();
        peer.fail_all("socket closed").await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Closed(_))));
        assert!(!peer.is_connected());
    }
}
