//! Server-side session transport.
//!
//! A [`SessionTransport`] decodes the frames of one client session and
//! produces responses. [`StreamableSession`] is the implementation behind
//! both the HTTP endpoint and the stdio loop; it is framing-agnostic and
//! writes server-initiated traffic to whatever [`Outbound`] the caller
//! supplies with each frame.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::de::DeserializeOwned,
    serde_json::{Value, json},
    switchboard_protocol::{
        JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
        LATEST_PROTOCOL_VERSION, LoggingLevel, RequestId, methods, negotiate_protocol_version,
        types::{
            CallToolParams, CallToolResult, CancelledNotificationParams, ClientCapabilities,
            GetPromptParams, Implementation, InitializeParams, InitializeResult,
            ListPromptsResult, ListResourcesResult, ListToolsResult, ReadResourceParams,
            SetLevelParams,
        },
    },
    tokio::sync::{Mutex, RwLock},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    context::{
        ClientChannel, DEFAULT_SAMPLING_HEARTBEAT, ExecutionContext, Outbound, PendingRequests,
        RequestContext,
    },
    error::{Error, Result},
    handler::McpHandler,
};

/// One client session's protocol endpoint.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    fn session_id(&self) -> &str;

    /// Process one inbound frame. Requests yield a response; notifications
    /// and client responses yield `None`. Server-initiated frames raised
    /// while handling go to `outbound`.
    async fn handle_message(
        &self,
        message: JsonRpcMessage,
        outbound: Option<Outbound>,
    ) -> Result<Option<JsonRpcResponse>>;

    /// Bring a fresh transport to the initialized state without a client
    /// handshake. Used when recreating a session under an expired id.
    async fn initialize_session(&self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Whether the transport has shut itself down.
    fn is_closed(&self) -> bool {
        false
    }

    /// Release the session. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Builds the transport for a new session id.
pub trait TransportFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Arc<dyn SessionTransport>;
}

/// Per-session defaults taken from the server configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub min_log_level: String,
    pub sampling_heartbeat: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            min_log_level: LoggingLevel::Info.as_str().to_string(),
            sampling_heartbeat: DEFAULT_SAMPLING_HEARTBEAT,
        }
    }
}

#[derive(Default)]
struct ClientState {
    info: Option<Implementation>,
    capabilities: ClientCapabilities,
    protocol_version: Option<String>,
}

pub struct StreamableSession {
    session_id: String,
    handler: Arc<dyn McpHandler>,
    settings: SessionSettings,
    pending: Arc<PendingRequests>,
    client: RwLock<ClientState>,
    min_log_level: RwLock<String>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl StreamableSession {
    pub fn new(
        session_id: impl Into<String>,
        handler: Arc<dyn McpHandler>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            handler,
            pending: Arc::new(PendingRequests::default()),
            client: RwLock::new(ClientState::default()),
            min_log_level: RwLock::new(settings.min_log_level.clone()),
            in_flight: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            settings,
        }
    }

    pub async fn client_info(&self) -> Option<Implementation> {
        self.client.read().await.info.clone()
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.client.read().await.protocol_version.clone()
    }

    pub async fn min_log_level(&self) -> String {
        self.min_log_level.read().await.clone()
    }

    async fn handle_request(&self, request: JsonRpcRequest, outbound: Option<Outbound>) -> JsonRpcResponse {
        let id = request.id.clone();
        let method = request.method.clone();
        debug!(session_id = %self.session_id, method = %method, id = %id, "client -> server");
        match self.dispatch(request, outbound).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                debug!(session_id = %self.session_id, method = %method, error = %e, "request failed");
                JsonRpcResponse::failure(Some(id), e.to_rpc_error())
            },
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest, outbound: Option<Outbound>) -> Result<Value> {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        match method.as_str() {
            methods::INITIALIZE => return self.initialize(parse_params(params)?).await,
            methods::PING => return Ok(json!({})),
            _ => {},
        }
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        match method.as_str() {
            methods::TOOLS_LIST => to_value(ListToolsResult {
                tools: self.handler.list_tools().await?,
                next_cursor: None,
            }),
            methods::TOOLS_CALL => {
                let params: CallToolParams = parse_params(params)?;
                to_value(self.call_tool(id, params, outbound).await?)
            },
            methods::RESOURCES_LIST => to_value(ListResourcesResult {
                resources: self.handler.list_resources().await?,
                next_cursor: None,
            }),
            methods::RESOURCES_READ => {
                let params: ReadResourceParams = parse_params(params)?;
                to_value(self.handler.read_resource(&params.uri).await?)
            },
            methods::PROMPTS_LIST => to_value(ListPromptsResult {
                prompts: self.handler.list_prompts().await?,
                next_cursor: None,
            }),
            methods::PROMPTS_GET => {
                let params: GetPromptParams = parse_params(params)?;
                to_value(self.handler.get_prompt(&params.name, params.arguments).await?)
            },
            methods::LOGGING_SET_LEVEL => {
                let params: SetLevelParams = parse_params(params)?;
                *self.min_log_level.write().await = params.level.as_str().to_string();
                info!(session_id = %self.session_id, level = %params.level.as_str(), "client log level set");
                Ok(json!({}))
            },
            other => Err(JsonRpcError::method_not_found(other).into()),
        }
    }

    async fn initialize(&self, params: InitializeParams) -> Result<Value> {
        self.handler.on_initialize(&params).await?;
        let version = negotiate_protocol_version(&params.protocol_version);
        {
            let mut client = self.client.write().await;
            client.info = Some(params.client_info.clone());
            client.capabilities = params.capabilities;
            client.protocol_version = Some(version.to_string());
        }
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            session_id = %self.session_id,
            client = %params.client_info.name,
            requested = %params.protocol_version,
            negotiated = %version,
            "session initialized"
        );
        to_value(InitializeResult {
            protocol_version: version.to_string(),
            capabilities: self.handler.capabilities(),
            server_info: self.handler.server_info(),
            instructions: self.handler.instructions(),
        })
    }

    async fn call_tool(
        &self,
        id: RequestId,
        params: CallToolParams,
        outbound: Option<Outbound>,
    ) -> Result<CallToolResult> {
        let cancel = CancellationToken::new();
        self.in_flight.lock().await.insert(id.clone(), cancel.clone());

        let ctx = ExecutionContext::new(
            RequestContext {
                session_id: self.session_id.clone(),
                request_id: id.clone(),
                progress_token: params.progress_token().cloned(),
            },
            outbound.map(|tx| ClientChannel::new(tx, Arc::clone(&self.pending))),
        )
        .with_min_log_level(self.min_log_level().await)
        .with_sampling_heartbeat(self.settings.sampling_heartbeat)
        .with_cancellation(cancel.clone());

        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let outcome = tokio::select! {
            result = self.handler.call_tool(&params.name, arguments, ctx) => result,
            () = cancel.cancelled() => Err(Error::message("request cancelled by client")),
        };
        self.in_flight.lock().await.remove(&id);

        match outcome {
            Ok(result) => Ok(result),
            Err(e @ (Error::ToolNotFound(_) | Error::Rpc(_))) => Err(e),
            Err(e) => {
                warn!(session_id = %self.session_id, tool = %params.name, error = %e, "tool call failed");
                Ok(CallToolResult::error(e.to_string()))
            },
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            methods::INITIALIZED => {
                debug!(session_id = %self.session_id, "client confirmed initialization");
            },
            methods::CANCELLED => {
                let Some(params) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledNotificationParams>(p).ok())
                else {
                    return;
                };
                if let Some(token) = self.in_flight.lock().await.get(&params.request_id) {
                    info!(
                        session_id = %self.session_id,
                        id = %params.request_id,
                        reason = params.reason.as_deref().unwrap_or(""),
                        "client cancelled request"
                    );
                    token.cancel();
                }
            },
            other => debug!(session_id = %self.session_id, method = %other, "client notification"),
        }
    }
}

#[async_trait]
impl SessionTransport for StreamableSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn handle_message(
        &self,
        message: JsonRpcMessage,
        outbound: Option<Outbound>,
    ) -> Result<Option<JsonRpcResponse>> {
        if self.is_closed() {
            return Err(Error::Transport(format!("session {} is closed", self.session_id)));
        }
        match message {
            JsonRpcMessage::Request(request) => Ok(Some(self.handle_request(request, outbound).await)),
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await;
                Ok(None)
            },
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(response).await {
                    debug!(session_id = %self.session_id, id = ?id, "dropping response to unknown server request");
                }
                Ok(None)
            },
        }
    }

    async fn initialize_session(&self) -> Result<()> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::new("switchboard-auto-init", env!("CARGO_PKG_VERSION")),
        };
        let request = JsonRpcRequest::new("auto-init", methods::INITIALIZE, Some(to_value(params)?));
        let response = self.handle_request(request, None).await;
        response.into_result().map_err(|e| Error::AutoInitialization {
            session_id: self.session_id.clone(),
            reason: e.message,
        })?;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.clear().await;
        for (_, token) in self.in_flight.lock().await.drain() {
            token.cancel();
        }
        info!(session_id = %self.session_id, "session closed");
        Ok(())
    }
}

/// Creates a [`StreamableSession`] per session id, all sharing one handler.
pub struct StreamableSessionFactory {
    handler: Arc<dyn McpHandler>,
    settings: SessionSettings,
}

impl StreamableSessionFactory {
    pub fn new(handler: Arc<dyn McpHandler>, settings: SessionSettings) -> Self {
        Self { handler, settings }
    }
}

impl TransportFactory for StreamableSessionFactory {
    fn create(&self, session_id: &str) -> Arc<dyn SessionTransport> {
        Arc::new(StreamableSession::new(
            session_id,
            Arc::clone(&self.handler),
            self.settings.clone(),
        ))
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()).into())
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
