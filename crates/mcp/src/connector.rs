//! Connector: one MCP server connection over any [`McpTransport`].
//!
//! Lifecycle is `Unconnected → Connected → Initialized → Disconnected`.
//! Tool, resource and prompt lists are cached by `initialize()` and kept
//! fresh by `*/list_changed` notifications.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
    time::Duration,
};

use {
    serde::de::DeserializeOwned,
    serde_json::{Value, json},
    switchboard_common::AbortOnDrop,
    switchboard_config::{ClientConfig, McpServerConfig, TransportKind},
    switchboard_protocol::{
        JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
        LATEST_PROTOCOL_VERSION, methods,
        types::{
            CallToolParams, CallToolResult, ClientCapabilities, CreateMessageParams,
            ElicitRequestParams, GetPromptParams, GetPromptResult, Implementation,
            InitializeParams, InitializeResult, ListChangedCapability, ListPromptsResult,
            ListResourcesResult, ListRootsResult, ListToolsResult, PaginatedParams,
            ProgressNotificationParams, Prompt, ReadResourceParams, ReadResourceResult, Resource,
            Root, ServerCapabilities, Tool,
        },
    },
    tokio::sync::{Mutex, RwLock, mpsc},
    tracing::{debug, info, warn},
};

use crate::{
    error::{Context, Error, Result},
    http_transport::HttpTransport,
    peer::{CallToolOptions, DEFAULT_REQUEST_TIMEOUT, Peer, RequestOptions},
    traits::{ElicitationHandler, McpTransport, SamplingHandler, TransportEvent},
    transport::StdioTransport,
    ws_transport::WebSocketTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Unconnected,
    Connected,
    Initialized,
    Disconnected,
}

/// Callback for server notifications. Errors are logged, never propagated.
pub type NotificationHandler = Arc<dyn Fn(&JsonRpcNotification) -> Result<()> + Send + Sync>;

/// Identity and defaults for a connector.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub client_info: Implementation,
    pub request_timeout: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("switchboard", env!("CARGO_PKG_VERSION")),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Cache {
    tools: Option<Vec<Tool>>,
    resources: Option<Vec<Resource>>,
    prompts: Option<Vec<Prompt>>,
}

struct Shared {
    state: ConnectorState,
    server: Option<InitializeResult>,
    cache: Cache,
    roots: Vec<Root>,
    handlers: Vec<NotificationHandler>,
    sampling: Option<Arc<dyn SamplingHandler>>,
    elicitation: Option<Arc<dyn ElicitationHandler>>,
}

struct Inner {
    name: String,
    options: ConnectorOptions,
    peer: Peer,
    shared: RwLock<Shared>,
    dispatch: Mutex<Option<AbortOnDrop>>,
}

/// A connection to one MCP server. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    pub fn new(name: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        Self::with_options(name, transport, ConnectorOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        transport: Arc<dyn McpTransport>,
        options: ConnectorOptions,
    ) -> Self {
        let peer = Peer::new(transport, options.request_timeout);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                peer,
                shared: RwLock::new(Shared {
                    state: ConnectorState::Unconnected,
                    server: None,
                    cache: Cache::default(),
                    roots: Vec::new(),
                    handlers: Vec::new(),
                    sampling: None,
                    elicitation: None,
                }),
                dispatch: Mutex::new(None),
            }),
        }
    }

    /// Build the transport a server entry describes.
    pub fn from_config(name: &str, server: &McpServerConfig, client: &ClientConfig) -> Result<Self> {
        let transport: Arc<dyn McpTransport> = match server.transport_kind() {
            TransportKind::Stdio => {
                let command = server
                    .command
                    .as_deref()
                    .with_context(|| format!("stdio transport for '{name}' requires a command"))?;
                Arc::new(StdioTransport::new(
                    command,
                    server.args.clone(),
                    server.env.clone(),
                ))
            },
            TransportKind::Http => {
                let url = server
                    .url
                    .as_deref()
                    .with_context(|| format!("http transport for '{name}' requires a url"))?;
                Arc::new(HttpTransport::new(url, server.headers.clone())?)
            },
            TransportKind::Websocket => {
                let url = server
                    .url
                    .as_deref()
                    .with_context(|| format!("websocket transport for '{name}' requires a url"))?;
                Arc::new(WebSocketTransport::new(url, server.headers.clone()))
            },
        };
        Ok(Self::with_options(name, transport, ConnectorOptions {
            client_info: Implementation::new(client.name.clone(), env!("CARGO_PKG_VERSION")),
            request_timeout: client.request_timeout(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn state(&self) -> ConnectorState {
        self.inner.shared.read().await.state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.peer.is_connected()
    }

    /// Open the transport. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut dispatch = self.inner.dispatch.lock().await;
        if self.inner.peer.is_connected() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.peer.transport().start(tx).await?;
        self.inner.peer.set_connected(true);
        *dispatch = Some(AbortOnDrop::new(tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            rx,
        ))));
        self.inner.shared.write().await.state = ConnectorState::Connected;

        info!(server = %self.inner.name, "MCP transport connected");
        Ok(())
    }

    /// Capability handshake, then populate the tool/resource/prompt caches.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let inner = &self.inner;
        if !inner.peer.is_connected() {
            return Err(Error::NotConnected);
        }

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.into(),
            capabilities: self.client_capabilities().await,
            client_info: inner.options.client_info.clone(),
        };
        let value = inner
            .peer
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                &RequestOptions::default(),
            )
            .await?;
        let result: InitializeResult =
            serde_json::from_value(value).context("failed to parse initialize result")?;

        inner.peer.notify(methods::INITIALIZED, None).await?;
        inner.peer.transport().on_initialized().await;

        info!(
            server = %inner.name,
            protocol = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );

        let caps = &result.capabilities;
        let tools = match caps.tools {
            Some(_) => inner.fetch_tools().await?,
            None => Vec::new(),
        };
        let resources = match caps.resources {
            Some(_) => inner.fetch_resources().await?,
            None => Vec::new(),
        };
        let prompts = match caps.prompts {
            Some(_) => inner.fetch_prompts().await?,
            None => Vec::new(),
        };
        debug!(
            server = %inner.name,
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "populated MCP caches"
        );

        let mut shared = inner.shared.write().await;
        shared.cache = Cache {
            tools: Some(tools),
            resources: Some(resources),
            prompts: Some(prompts),
        };
        shared.server = Some(result.clone());
        shared.state = ConnectorState::Initialized;
        Ok(result)
    }

    async fn client_capabilities(&self) -> ClientCapabilities {
        let shared = self.inner.shared.read().await;
        ClientCapabilities {
            roots: Some(ListChangedCapability { list_changed: true }),
            sampling: shared.sampling.as_ref().map(|_| json!({})),
            elicitation: shared.elicitation.as_ref().map(|_| json!({})),
            experimental: None,
        }
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.inner.peer.is_connected()
            && self.inner.shared.read().await.state == ConnectorState::Initialized
        {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        let shared = self.inner.shared.read().await;
        shared.server.as_ref().map(|s| s.capabilities.clone())
    }

    pub async fn server_info(&self) -> Option<Implementation> {
        let shared = self.inner.shared.read().await;
        shared.server.as_ref().map(|s| s.server_info.clone())
    }

    /// Cached tools from the last `initialize()` or refresh.
    pub async fn tools(&self) -> Result<Vec<Tool>> {
        self.inner.shared.read().await.cache.tools.clone().ok_or(Error::NotInitialized)
    }

    pub async fn resources(&self) -> Result<Vec<Resource>> {
        self.inner.shared.read().await.cache.resources.clone().ok_or(Error::NotInitialized)
    }

    pub async fn prompts(&self) -> Result<Vec<Prompt>> {
        self.inner.shared.read().await.cache.prompts.clone().ok_or(Error::NotInitialized)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        options: CallToolOptions,
    ) -> Result<CallToolResult> {
        self.ensure_initialized().await?;
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
            meta: None,
        };
        let value = self
            .inner
            .peer
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(&params)?), &options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch every tool page and refresh the cache.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.ensure_initialized().await?;
        let tools = self.inner.fetch_tools().await?;
        self.inner.shared.write().await.cache.tools = Some(tools.clone());
        Ok(tools)
    }

    /// One page of resources.
    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.ensure_initialized().await?;
        self.inner.list_page(methods::RESOURCES_LIST, cursor).await
    }

    /// Every resource, following `nextCursor` until the server stops sending one.
    pub async fn list_all_resources(&self) -> Result<Vec<Resource>> {
        self.ensure_initialized().await?;
        let resources = self.inner.fetch_resources().await?;
        self.inner.shared.write().await.cache.resources = Some(resources.clone());
        Ok(resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.ensure_initialized().await?;
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.inner
            .call(methods::RESOURCES_READ, serde_json::to_value(&params)?)
            .await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.ensure_initialized().await?;
        let prompts = self.inner.fetch_prompts().await?;
        self.inner.shared.write().await.cache.prompts = Some(prompts.clone());
        Ok(prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        self.ensure_initialized().await?;
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.inner
            .call(methods::PROMPTS_GET, serde_json::to_value(&params)?)
            .await
    }

    pub async fn ping(&self) -> Result<()> {
        if !self.inner.peer.is_connected() {
            return Err(Error::NotConnected);
        }
        self.inner
            .peer
            .request(methods::PING, None, &RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Replace the declared roots, telling the server when connected.
    pub async fn set_roots(&self, roots: Vec<Root>) -> Result<()> {
        self.inner.shared.write().await.roots = roots;
        if self.inner.peer.is_connected() {
            self.inner
                .peer
                .notify(methods::ROOTS_LIST_CHANGED, None)
                .await?;
        }
        Ok(())
    }

    pub async fn roots(&self) -> Vec<Root> {
        self.inner.shared.read().await.roots.clone()
    }

    pub async fn on_notification(
        &self,
        handler: impl Fn(&JsonRpcNotification) -> Result<()> + Send + Sync + 'static,
    ) {
        self.inner.shared.write().await.handlers.push(Arc::new(handler));
    }

    /// Register the handler for `sampling/createMessage`. Advertised on the
    /// next `initialize()`.
    pub async fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        self.inner.shared.write().await.sampling = Some(handler);
    }

    pub async fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        self.inner.shared.write().await.elicitation = Some(handler);
    }

    /// Close the transport and fail every in-flight request.
    pub async fn disconnect(&self) {
        let dispatch = self.inner.dispatch.lock().await.take();
        self.inner.peer.fail_all("disconnected").await;
        self.inner.peer.transport().close().await;
        drop(dispatch);
        self.inner.mark_disconnected().await;
        info!(server = %self.inner.name, "MCP connector disconnected");
    }
}

impl Inner {
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self
            .peer
            .request(method, Some(params), &RequestOptions::default())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_page<T: DeserializeOwned>(&self, method: &str, cursor: Option<String>) -> Result<T> {
        self.call(method, serde_json::to_value(PaginatedParams { cursor })?)
            .await
    }

    async fn fetch_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListToolsResult = self.list_page(methods::TOOLS_LIST, cursor).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    async fn fetch_resources(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListResourcesResult =
                self.list_page(methods::RESOURCES_LIST, cursor).await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(resources),
            }
        }
    }

    async fn fetch_prompts(&self) -> Result<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListPromptsResult = self.list_page(methods::PROMPTS_LIST, cursor).await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(prompts),
            }
        }
    }

    async fn mark_disconnected(&self) {
        let mut shared = self.shared.write().await;
        if shared.state != ConnectorState::Unconnected {
            shared.state = ConnectorState::Disconnected;
        }
        shared.cache = Cache::default();
    }

    async fn handle_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        debug!(server = %self.name, method = %notification.method, "MCP server notification");
        match notification.method.as_str() {
            methods::PROGRESS => {
                match notification
                    .params
                    .clone()
                    .map(serde_json::from_value::<ProgressNotificationParams>)
                {
                    Some(Ok(progress)) => self.peer.handle_progress(progress).await,
                    _ => warn!(server = %self.name, "malformed progress notification"),
                }
                self.run_handlers(&notification).await;
            },
            methods::TOOLS_LIST_CHANGED
            | methods::RESOURCES_LIST_CHANGED
            | methods::PROMPTS_LIST_CHANGED => {
                // The refresh needs this dispatch loop to deliver its responses.
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.refresh_cache(&notification.method).await;
                    inner.run_handlers(&notification).await;
                });
            },
            _ => self.run_handlers(&notification).await,
        }
    }

    async fn refresh_cache(&self, method: &str) {
        let outcome = match method {
            methods::TOOLS_LIST_CHANGED => self.fetch_tools().await.map(|tools| {
                Cache {
                    tools: Some(tools),
                    ..Cache::default()
                }
            }),
            methods::RESOURCES_LIST_CHANGED => self.fetch_resources().await.map(|resources| Cache {
                resources: Some(resources),
                ..Cache::default()
            }),
            _ => self.fetch_prompts().await.map(|prompts| Cache {
                prompts: Some(prompts),
                ..Cache::default()
            }),
        };
        match outcome {
            Ok(fresh) => {
                let mut shared = self.shared.write().await;
                if shared.state != ConnectorState::Initialized {
                    return;
                }
                if fresh.tools.is_some() {
                    shared.cache.tools = fresh.tools;
                }
                if fresh.resources.is_some() {
                    shared.cache.resources = fresh.resources;
                }
                if fresh.prompts.is_some() {
                    shared.cache.prompts = fresh.prompts;
                }
                debug!(server = %self.name, method, "refreshed MCP cache");
            },
            Err(e) => warn!(server = %self.name, method, error = %e, "failed to refresh MCP cache"),
        }
    }

    async fn run_handlers(&self, notification: &JsonRpcNotification) {
        let handlers = self.shared.read().await.handlers.clone();
        for handler in handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(notification))) {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    warn!(server = %self.name, method = %notification.method, error = %e, "notification handler failed");
                },
                Err(_) => {
                    warn!(server = %self.name, method = %notification.method, "notification handler panicked");
                },
            }
        }
    }

    async fn handle_server_request(&self, request: JsonRpcRequest) {
        debug!(server = %self.name, method = %request.method, id = %request.id, "MCP server request");
        let outcome = self.answer(&request).await;
        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::failure(Some(request.id), error),
        };
        if let Err(e) = self.peer.respond(response).await {
            warn!(server = %self.name, error = %e, "failed to answer server request");
        }
    }

    async fn answer(&self, request: &JsonRpcRequest) -> std::result::Result<Value, JsonRpcError> {
        let params = request.params.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            methods::PING => Ok(json!({})),
            methods::ROOTS_LIST => {
                let roots = self.shared.read().await.roots.clone();
                to_result(&ListRootsResult { roots })
            },
            methods::SAMPLING_CREATE_MESSAGE => {
                let handler = self.shared.read().await.sampling.clone();
                let Some(handler) = handler else {
                    return Err(JsonRpcError::method_not_found(&request.method));
                };
                let params: CreateMessageParams = serde_json::from_value(params)
                    .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
                let result = handler
                    .create_message(params)
                    .await
                    .map_err(|e| JsonRpcError::internal(e.to_string()))?;
                to_result(&result)
            },
            methods::ELICITATION_CREATE => {
                let handler = self.shared.read().await.elicitation.clone();
                let Some(handler) = handler else {
                    return Err(JsonRpcError::method_not_found(&request.method));
                };
                let params: ElicitRequestParams = serde_json::from_value(params)
                    .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
                let result = handler
                    .elicit(params)
                    .await
                    .map_err(|e| JsonRpcError::internal(e.to_string()))?;
                to_result(&result)
            },
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal(e.to_string()))
}

async fn dispatch_loop(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(JsonRpcMessage::Response(response)) => {
                inner.peer.handle_response(response).await;
            },
            TransportEvent::Message(JsonRpcMessage::Notification(notification)) => {
                inner.handle_notification(notification).await;
            },
            TransportEvent::Message(JsonRpcMessage::Request(request)) => {
                tokio::spawn(async move { inner.handle_server_request(request).await });
            },
            TransportEvent::Diagnostic(line) => {
                warn!(server = %inner.name, stderr = %line, "MCP server stderr");
            },
            TransportEvent::Failed { id, error } => {
                debug!(server = %inner.name, id = %id, error = %error, "request failed in transport");
                inner.peer.fail(&id, error).await;
            },
            TransportEvent::Closed(reason) => {
                warn!(server = %inner.name, reason = %reason, "MCP transport closed");
                inner.peer.fail_all(&reason.to_string()).await;
                inner.mark_disconnected().await;
                break;
            },
        }
    }
}
