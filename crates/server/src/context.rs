//! Per-call execution context handed to tool handlers.
//!
//! Built from the request being served (session id, request id, progress
//! token) and the channel back to the client that carried it. Nothing here
//! looks sessions up; the owning session is threaded in explicitly.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use {
    serde_json::Value,
    switchboard_common::IntervalHandle,
    switchboard_protocol::{
        JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, LoggingLevel,
        ProgressToken, RequestId, methods, should_log,
        types::{
            CreateMessageParams, CreateMessageResult, ElicitAction, ElicitRequestParams,
            ElicitResult, LoggingMessageParams, ProgressNotificationParams,
        },
    },
    tokio::{
        sync::{Mutex, mpsc, oneshot},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::error::{Error, Result};

/// Default interval between sampling heartbeats.
pub const DEFAULT_SAMPLING_HEARTBEAT: Duration = Duration::from_secs(5);

/// Frames the server writes back to the client on the live connection.
pub type Outbound = mpsc::UnboundedSender<JsonRpcMessage>;

/// Server-initiated requests awaiting the client's response.
#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicI64,
    waiting: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub async fn register(&self) -> (RequestId, oneshot::Receiver<JsonRpcResponse>) {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id.clone(), tx);
        (id, rx)
    }

    /// Hand a client response to its waiter. `false` for unknown ids.
    pub async fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        match self.waiting.lock().await.remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub async fn forget(&self, id: &RequestId) {
        self.waiting.lock().await.remove(id);
    }

    /// Drop every waiter; their requests fail with a transport error.
    pub async fn clear(&self) {
        self.waiting.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.waiting.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.waiting.lock().await.is_empty()
    }
}

/// The session's way back to the client for one request.
#[derive(Clone)]
pub struct ClientChannel {
    outbound: Outbound,
    pending: Arc<PendingRequests>,
}

impl ClientChannel {
    pub fn new(outbound: Outbound, pending: Arc<PendingRequests>) -> Self {
        Self { outbound, pending }
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.outbound
            .send(JsonRpcNotification::new(method, params).into())
            .map_err(|_| Error::NoClientChannel)
    }

    /// Send a request to the client and wait for its answer.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (id, rx) = self.pending.register().await;
        debug!(method, id = %id, "server -> client request");
        if self
            .outbound
            .send(JsonRpcRequest::new(id.clone(), method, params).into())
            .is_err()
        {
            self.pending.forget(&id).await;
            return Err(Error::NoClientChannel);
        }

        let started = Instant::now();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.forget(&id).await;
                    return Err(Error::Timeout {
                        operation: method.to_string(),
                        elapsed: started.elapsed(),
                    });
                },
            },
            None => rx.await,
        };
        let response = outcome.map_err(|_| Error::Transport("session closed".into()))?;
        Ok(response.into_result()?)
    }
}

/// Identity of the request a tool handler is serving.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub session_id: String,
    pub request_id: RequestId,
    pub progress_token: Option<ProgressToken>,
}

pub type SampleProgressCallback = Arc<dyn Fn(Duration) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SampleOptions {
    /// Overall bound on the round-trip. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Heartbeat period. `None` uses the session's configured interval.
    pub progress_interval: Option<Duration>,
    /// Called with the elapsed time on each heartbeat.
    pub on_progress: Option<SampleProgressCallback>,
}

impl fmt::Debug for SampleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleOptions")
            .field("timeout", &self.timeout)
            .field("progress_interval", &self.progress_interval)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ElicitOptions {
    pub timeout: Option<Duration>,
}

/// Tool-call context with sampling, elicitation, progress and logging.
#[derive(Clone)]
pub struct ExecutionContext {
    request: RequestContext,
    channel: Option<ClientChannel>,
    min_log_level: String,
    heartbeat: Duration,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(request: RequestContext, channel: Option<ClientChannel>) -> Self {
        Self {
            request,
            channel,
            min_log_level: LoggingLevel::Debug.as_str().to_string(),
            heartbeat: DEFAULT_SAMPLING_HEARTBEAT,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_min_log_level(mut self, level: impl Into<String>) -> Self {
        self.min_log_level = level.into();
        self
    }

    /// Heartbeat for `sample()` calls that do not set their own.
    #[must_use]
    pub fn with_sampling_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    pub fn session_id(&self) -> &str {
        &self.request.session_id
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.request.progress_token.as_ref()
    }

    /// Cancelled when the client sends `notifications/cancelled` for this call.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the client's model for a completion.
    ///
    /// A progress heartbeat runs while the request is outstanding and stops
    /// on every exit path.
    pub async fn sample(
        &self,
        params: impl Into<CreateMessageParams>,
        options: SampleOptions,
    ) -> Result<CreateMessageResult> {
        let channel = self.channel.as_ref().ok_or(Error::NoClientChannel)?;
        let params = serde_json::to_value(params.into())?;

        let interval = options.progress_interval.unwrap_or(self.heartbeat);
        let started = Instant::now();
        let _heartbeat = {
            let ctx = self.clone();
            let on_progress = options.on_progress.clone();
            IntervalHandle::spawn(interval, move || {
                let ctx = ctx.clone();
                let on_progress = on_progress.clone();
                async move {
                    let elapsed = started.elapsed();
                    let secs = elapsed.as_secs();
                    ctx.report_progress(
                        secs as f64,
                        None,
                        Some(format!("Waiting for LLM response... ({secs}s elapsed)")),
                    );
                    if let Some(callback) = on_progress {
                        callback(elapsed);
                    }
                }
            })
        };

        let value = channel
            .request(methods::SAMPLING_CREATE_MESSAGE, Some(params), options.timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ask the user for input, in form or URL mode.
    ///
    /// Accepted form content is checked against the requested schema.
    pub async fn elicit(
        &self,
        params: ElicitRequestParams,
        options: ElicitOptions,
    ) -> Result<ElicitResult> {
        let channel = self.channel.as_ref().ok_or(Error::NoClientChannel)?;
        let schema = params.schema().cloned();

        let value = channel
            .request(
                methods::ELICITATION_CREATE,
                Some(serde_json::to_value(&params)?),
                options.timeout,
            )
            .await?;
        let result: ElicitResult = serde_json::from_value(value)?;

        if result.action == ElicitAction::Accept
            && let Some(schema) = schema
        {
            validate_content(&schema, result.content.as_ref().unwrap_or(&Value::Null))?;
        }
        Ok(result)
    }

    /// Send `notifications/progress` for this call. Silently does nothing
    /// without a progress token or a client channel.
    pub fn report_progress(&self, progress: f64, total: Option<f64>, message: Option<String>) {
        let (Some(token), Some(channel)) = (&self.request.progress_token, &self.channel) else {
            return;
        };
        let params = ProgressNotificationParams {
            progress_token: token.clone(),
            progress,
            total,
            message,
        };
        let sent = serde_json::to_value(params)
            .map_err(Error::from)
            .and_then(|params| channel.notify(methods::PROGRESS, Some(params)));
        if let Err(e) = sent {
            debug!(session_id = %self.request.session_id, error = %e, "dropping progress notification");
        }
    }

    /// Send `notifications/message` unless `level` ranks below the
    /// session's minimum. Unknown levels go out as `info`.
    pub fn log(&self, level: &str, message: impl Into<String>, logger: Option<&str>) {
        if !should_log(level, &self.min_log_level) {
            return;
        }
        let Some(channel) = &self.channel else {
            return;
        };
        let params = LoggingMessageParams {
            level: level.parse().unwrap_or(LoggingLevel::Info),
            logger: logger.map(str::to_string),
            data: Value::String(message.into()),
        };
        let sent = serde_json::to_value(params)
            .map_err(Error::from)
            .and_then(|params| channel.notify(methods::MESSAGE, Some(params)));
        if let Err(e) = sent {
            warn!(session_id = %self.request.session_id, error = %e, "dropping log notification");
        }
    }
}

fn validate_content(schema: &Value, content: &Value) -> Result<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| Error::message(format!("invalid elicitation schema: {e}")))?;
    if validator.is_valid(content) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(content).map(|e| e.to_string()).collect();
    Err(Error::ElicitationValidation { errors })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        serde_json::json,
        std::sync::atomic::AtomicUsize,
        switchboard_protocol::{JsonRpcError, types::Content},
    };

    fn request_ctx(token: Option<&str>) -> RequestContext {
        RequestContext {
            session_id: "session-1".into(),
            request_id: RequestId::from(9),
            progress_token: token.map(RequestId::from),
        }
    }

    fn connected(token: Option<&str>) -> (ExecutionContext, mpsc::UnboundedReceiver<JsonRpcMessage>, Arc<PendingRequests>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingRequests::default());
        let ctx = ExecutionContext::new(
            request_ctx(token),
            Some(ClientChannel::new(tx, Arc::clone(&pending))),
        );
        (ctx, rx, pending)
    }

    /// Answer the next server request on `rx` with `result`.
    fn answer_next(
        mut rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
        pending: Arc<PendingRequests>,
        result: std::result::Result<Value, JsonRpcError>,
    ) -> tokio::task::JoinHandle<(JsonRpcRequest, Vec<JsonRpcNotification>)> {
        tokio::spawn(async move {
            let mut notifications = Vec::new();
            loop {
                match rx.recv().await.unwrap() {
                    JsonRpcMessage::Request(req) => {
                        let response = match result {
                            Ok(value) => JsonRpcResponse::success(req.id.clone(), value),
                            Err(error) => JsonRpcResponse::failure(Some(req.id.clone()), error),
                        };
                        assert!(pending.resolve(response).await);
                        return (req, notifications);
                    },
                    JsonRpcMessage::Notification(n) => notifications.push(n),
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        })
    }

    fn sample_reply() -> Value {
        json!({"role": "assistant", "content": {"type": "text", "text": "hi"}, "model": "m"})
    }

    #[test]
    fn report_progress_without_token_or_channel_is_a_no_op() {
        ExecutionContext::new(request_ctx(None), None).report_progress(1.0, Some(2.0), None);
        ExecutionContext::new(request_ctx(Some("t")), None).report_progress(1.0, None, None);

        let (ctx, mut rx, _) = connected(None);
        ctx.report_progress(1.0, None, Some("ignored".into()));
        assert!(rx.try_recv().is_err());

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ctx = ExecutionContext::new(
            request_ctx(Some("t")),
            Some(ClientChannel::new(tx, Arc::new(PendingRequests::default()))),
        );
        ctx.report_progress(1.0, None, None);
    }

    #[test]
    fn report_progress_carries_token() {
        let (ctx, mut rx, _) = connected(Some("tok"));
        ctx.report_progress(3.0, Some(10.0), Some("step 3".into()));
        let JsonRpcMessage::Notification(n) = rx.try_recv().unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(n.method, methods::PROGRESS);
        let params: ProgressNotificationParams = serde_json::from_value(n.params.unwrap()).unwrap();
        assert_eq!(params.progress_token, RequestId::from("tok"));
        assert_eq!(params.total, Some(10.0));
    }

    #[test]
    fn log_respects_minimum_and_fails_open() {
        let (ctx, mut rx, _) = connected(None);
        let ctx = ctx.with_min_log_level("warning");

        ctx.log("info", "hidden", None);
        assert!(rx.try_recv().is_err());

        ctx.log("error", "shown", Some("db"));
        let JsonRpcMessage::Notification(n) = rx.try_recv().unwrap() else {
            panic!("expected notification");
        };
        let params: LoggingMessageParams = serde_json::from_value(n.params.unwrap()).unwrap();
        assert_eq!(params.level, LoggingLevel::Error);
        assert_eq!(params.logger.as_deref(), Some("db"));

        ctx.log("verbose", "unknown level", None);
        let JsonRpcMessage::Notification(n) = rx.try_recv().unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(n.params.unwrap()["level"], "info");

        let ctx = ctx.with_min_log_level("loud");
        ctx.log("debug", "unknown minimum", None);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn sample_round_trip() {
        let (ctx, rx, pending) = connected(None);
        let server = answer_next(rx, Arc::clone(&pending), Ok(sample_reply()));

        let result = ctx.sample("Summarize", SampleOptions::default()).await.unwrap();
        assert_eq!(result.model, "m");
        assert_eq!(result.content, Content::text("hi"));

        let (req, _) = server.await.unwrap();
        assert_eq!(req.method, methods::SAMPLING_CREATE_MESSAGE);
        assert_eq!(req.params.unwrap()["messages"][0]["content"]["text"], "Summarize");
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_heartbeat_reports_elapsed_time() {
        let (ctx, mut rx, pending) = connected(Some("tok"));
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        let options = SampleOptions {
            on_progress: Some(Arc::new(move |_: Duration| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..SampleOptions::default()
        };

        let client = tokio::spawn(async move {
            let mut heartbeats = Vec::new();
            let mut request_id = None;
            while let Some(message) = rx.recv().await {
                match message {
                    JsonRpcMessage::Request(req) => request_id = Some(req.id),
                    JsonRpcMessage::Notification(n) => {
                        heartbeats.push(n.params.unwrap()["message"].as_str().unwrap().to_string());
                        if heartbeats.len() == 2 {
                            let id = request_id.clone().unwrap();
                            pending.resolve(JsonRpcResponse::success(id, sample_reply())).await;
                        }
                    },
                    JsonRpcMessage::Response(_) => {},
                }
            }
            heartbeats
        });

        ctx.sample("slow", options).await.unwrap();
        drop(ctx);
        let heartbeats = client.await.unwrap();
        assert_eq!(heartbeats, [
            "Waiting for LLM response... (5s elapsed)",
            "Waiting for LLM response... (10s elapsed)",
        ]);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_times_out_and_stops_heartbeat() {
        let (ctx, mut rx, pending) = connected(Some("tok"));
        let options = SampleOptions {
            timeout: Some(Duration::from_secs(12)),
            ..SampleOptions::default()
        };

        let err = ctx.sample("never answered", options).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err}");
        assert_eq!(pending.len().await, 0);

        let mut heartbeats = 0;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, JsonRpcMessage::Notification(_)) {
                heartbeats += 1;
            }
        }
        assert_eq!(heartbeats, 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sample_without_channel_fails() {
        let ctx = ExecutionContext::new(request_ctx(None), None);
        assert!(matches!(
            ctx.sample("x", SampleOptions::default()).await,
            Err(Error::NoClientChannel)
        ));
    }

    #[tokio::test]
    async fn sample_surfaces_client_errors() {
        let (ctx, rx, pending) = connected(None);
        answer_next(rx, pending, Err(JsonRpcError::method_not_found("sampling/createMessage")));
        let err = ctx.sample("x", SampleOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(_)));
    }

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
            "required": ["name", "age"]
        })
    }

    #[tokio::test]
    async fn elicit_validates_accepted_content() {
        let (ctx, rx, pending) = connected(None);
        answer_next(rx, pending, Ok(json!({"action": "accept", "content": {"name": "Ada"}})));

        let err = ctx
            .elicit(ElicitRequestParams::form("Who are you?", person_schema()), ElicitOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::ElicitationValidation { errors } => {
                assert!(errors.iter().any(|e| e.contains("age")), "{errors:?}");
            },
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[tokio::test]
    async fn elicit_accepts_valid_content() {
        let (ctx, rx, pending) = connected(None);
        let server = answer_next(
            rx,
            pending,
            Ok(json!({"action": "accept", "content": {"name": "Ada", "age": 36}})),
        );

        let result = ctx
            .elicit(ElicitRequestParams::form("Who are you?", person_schema()), ElicitOptions::default())
            .await
            .unwrap();
        assert_eq!(result.content.unwrap()["age"], 36);

        let (req, _) = server.await.unwrap();
        let params = req.params.unwrap();
        assert_eq!(params["mode"], "form");
        assert_eq!(params["requestedSchema"]["required"][1], "age");
    }

    #[tokio::test]
    async fn elicit_decline_and_url_mode_pass_through() {
        let (ctx, rx, pending) = connected(None);
        answer_next(rx, pending, Ok(json!({"action": "decline"})));
        let result = ctx
            .elicit(ElicitRequestParams::form("Who?", person_schema()), ElicitOptions::default())
            .await
            .unwrap();
        assert_eq!(result.action, ElicitAction::Decline);

        let (ctx, rx, pending) = connected(None);
        let server = answer_next(rx, pending, Ok(json!({"action": "accept"})));
        let result = ctx
            .elicit(
                ElicitRequestParams::url("Sign in", "https://example.com/login", "el-1"),
                ElicitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.action, ElicitAction::Accept);
        let (req, _) = server.await.unwrap();
        assert_eq!(req.params.unwrap()["url"], "https://example.com/login");
    }

    #[tokio::test(start_paused = true)]
    async fn elicit_timeout() {
        let (ctx, _rx, _pending) = connected(None);
        let err = ctx
            .elicit(
                ElicitRequestParams::form("Who?", person_schema()),
                ElicitOptions {
                    timeout: Some(Duration::from_secs(1)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn closed_session_fails_waiters() {
        let (ctx, _rx, pending) = connected(None);
        let call = tokio::spawn(async move { ctx.sample("x", SampleOptions::default()).await });
        while pending.len().await == 0 {
            tokio::task::yield_now().await;
        }
        pending.clear().await;
        assert!(matches!(call.await.unwrap(), Err(Error::Transport(_))));
    }
}
