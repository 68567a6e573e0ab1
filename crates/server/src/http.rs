//! Streamable HTTP endpoint.
//!
//! - `POST {path}`: one JSON-RPC frame per request. Requests are answered
//!   with an SSE stream when the client accepts one, otherwise with a JSON
//!   body. Notifications and client responses get `202 Accepted`.
//! - `GET {path}`: no standalone stream is offered (`405`).
//! - `DELETE {path}`: terminate the session named by `mcp-session-id`.

use std::{convert::Infallible, future::Future, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, HeaderValue, StatusCode, header},
        response::{
            IntoResponse, Response,
            sse::{Event, KeepAlive, Sse},
        },
        routing::{get, post},
    },
    futures::StreamExt,
    switchboard_config::ServerConfig,
    switchboard_protocol::{
        JsonRpcError, JsonRpcMessage, JsonRpcResponse, RequestId, SESSION_ID_HEADER,
        error_codes,
    },
    tokio::sync::mpsc,
    tokio_stream::wrappers::UnboundedReceiverStream,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    handler::McpHandler,
    manager::{SessionManager, SessionManagerOptions},
    registry::SessionRecord,
    security::{TransportSecurity, get_transport_config},
    session::{SessionSettings, StreamableSessionFactory},
};

const EVENT_STREAM: &str = "text/event-stream";

/// Shared state of the HTTP endpoint.
#[derive(Clone)]
pub struct HttpState {
    pub sessions: Arc<SessionManager>,
    pub security: Arc<TransportSecurity>,
}

impl HttpState {
    pub fn new(sessions: Arc<SessionManager>, security: TransportSecurity) -> Self {
        Self {
            sessions,
            security: Arc::new(security),
        }
    }

    pub fn from_config(config: &ServerConfig, handler: Arc<dyn McpHandler>) -> Self {
        let settings = SessionSettings {
            min_log_level: config.min_log_level.clone(),
            sampling_heartbeat: config.sampling_heartbeat(),
        };
        let factory = Arc::new(StreamableSessionFactory::new(handler, settings));
        let sessions = Arc::new(SessionManager::new(
            factory,
            SessionManagerOptions::from(config),
        ));
        let security = get_transport_config(
            config.production,
            &config.allowed_origins,
            &config.allowed_hosts,
        );
        Self::new(sessions, security)
    }
}

/// Build the MCP router mounted at `path`, plus `/health`.
pub fn router(state: HttpState, path: &str) -> Router {
    Router::new()
        .route(path, post(handle_post).get(handle_get).delete(handle_delete))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind, serve until `shutdown` resolves, then close every session.
pub async fn serve_with_shutdown<F>(
    config: &ServerConfig,
    handler: Arc<dyn McpHandler>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = HttpState::from_config(config, handler);
    let sessions = Arc::clone(&state.sessions);
    sessions.start_idle_cleanup(config.idle_timeout()).await;

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        path = %config.path,
        dns_rebinding_protection = state.security.enable_dns_rebinding_protection,
        "MCP server listening"
    );
    axum::serve(listener, router(state, &config.path))
        .with_graceful_shutdown(shutdown)
        .await?;

    sessions.stop_idle_cleanup().await;
    sessions.close_all().await;
    info!("MCP server stopped");
    Ok(())
}

/// [`serve_with_shutdown`] stopping on Ctrl-C.
pub async fn serve(config: &ServerConfig, handler: Arc<dyn McpHandler>) -> Result<()> {
    serve_with_shutdown(config, handler, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: String) -> Response {
    if let Err(e) = state
        .security
        .check(header_str(&headers, header::ORIGIN), header_str(&headers, header::HOST))
    {
        warn!(error = %e, "rejected request");
        return error_response(&e, None);
    }

    let accept = header_str(&headers, header::ACCEPT).unwrap_or("application/json");
    if !accepts(accept, "application/json") && !accepts(accept, EVENT_STREAM) {
        return (StatusCode::NOT_ACCEPTABLE, "accept application/json or text/event-stream")
            .into_response();
    }

    if body.trim_start().starts_with('[') {
        let error = JsonRpcError::new(error_codes::INVALID_REQUEST, "batch requests are not supported");
        return (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::failure(None, error))).into_response();
    }
    let message = match JsonRpcMessage::parse(&body) {
        Ok(message) => message,
        Err(e) => {
            let error = JsonRpcError::new(error_codes::PARSE_ERROR, e.to_string());
            return (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::failure(None, error)))
                .into_response();
        },
    };

    let is_initialize = message.is_initialize_request();
    let session_id = header_str(&headers, SESSION_ID_HEADER);
    let request_id = message.id().cloned();
    let record = match state
        .sessions
        .get_or_create_transport(session_id, is_initialize)
        .await
    {
        Ok(record) => record,
        Err(e) => {
            debug!(session_id = session_id.unwrap_or(""), error = %e, "no session for request");
            return error_response(&e, request_id);
        },
    };

    let mut response = if is_initialize {
        initialize(&state, &record, message).await
    } else if let JsonRpcMessage::Request(request) = message {
        let progress_token = request.progress_token();
        let message = JsonRpcMessage::Request(request);
        if accepts(accept, EVENT_STREAM) {
            stream_response(record.clone(), message, progress_token)
        } else {
            json_response(&record, message).await
        }
    } else {
        match record.transport().handle_message(message, None).await {
            Ok(_) => StatusCode::ACCEPTED.into_response(),
            Err(e) => error_response(&e, None),
        }
    };

    if !record.is_closed()
        && let Ok(value) = HeaderValue::from_str(record.session_id())
    {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

/// Initialize is answered as plain JSON so a failed handshake can evict the
/// session before the client ever learns its id.
async fn initialize(state: &HttpState, record: &Arc<SessionRecord>, message: JsonRpcMessage) -> Response {
    match record.transport().handle_message(message, None).await {
        Ok(Some(response)) if response.error.is_none() => {
            info!(session_id = %record.session_id(), "session established");
            Json(response).into_response()
        },
        Ok(Some(response)) => {
            state.sessions.discard(record).await;
            (StatusCode::BAD_REQUEST, Json(response)).into_response()
        },
        Ok(None) => {
            state.sessions.discard(record).await;
            StatusCode::BAD_REQUEST.into_response()
        },
        Err(e) => {
            state.sessions.discard(record).await;
            error_response(&e, None)
        },
    }
}

async fn json_response(record: &SessionRecord, message: JsonRpcMessage) -> Response {
    let id = message.id().cloned();
    match record.transport().handle_message(message, None).await {
        Ok(Some(response)) => Json(response).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(&e, id),
    }
}

/// Serve one request as an SSE stream carrying the server's notifications
/// and requests raised while handling it, then its response.
fn stream_response(
    record: Arc<SessionRecord>,
    message: JsonRpcMessage,
    progress_token: Option<RequestId>,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    let id = message.id().cloned();

    tokio::spawn(async move {
        if let Some(id) = &id {
            record.bind(id.clone(), progress_token, tx.clone()).await;
        }
        let outcome = record.transport().handle_message(message, Some(tx.clone())).await;
        if let Some(id) = &id {
            record.unbind(id).await;
        }
        let response = match outcome {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => JsonRpcResponse::failure(id, e.to_rpc_error()),
        };
        let _ = tx.send(response.into());
    });

    let events = UnboundedReceiverStream::new(rx).map(|message| {
        Ok::<_, Infallible>(
            Event::default()
                .event("message")
                .json_data(&message)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
        )
    });
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_get(headers: HeaderMap) -> Response {
    debug!(
        session_id = header_str(&headers, SESSION_ID_HEADER).unwrap_or(""),
        "standalone event stream requested"
    );
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST, DELETE")],
    )
        .into_response()
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> StatusCode {
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return StatusCode::BAD_REQUEST;
    };
    if state.sessions.close_session(session_id).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len().await,
    }))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn header_str<K: header::AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn accepts(accept: &str, media_type: &str) -> bool {
    let (kind, _) = media_type.split_once('/').unwrap_or((media_type, ""));
    accept.split(',').any(|part| {
        let range = part.split(';').next().unwrap_or("").trim();
        range == media_type || range == "*/*" || range == format!("{kind}/*")
    })
}

fn error_response(error: &Error, id: Option<RequestId>) -> Response {
    let body = JsonRpcResponse::failure(id, error.to_rpc_error());
    (error.status_code(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_matching() {
        assert!(accepts("application/json, text/event-stream", EVENT_STREAM));
        assert!(accepts("application/json", "application/json"));
        assert!(!accepts("application/json", EVENT_STREAM));
        assert!(accepts("*/*", EVENT_STREAM));
        assert!(accepts("text/*;q=0.5", EVENT_STREAM));
        assert!(!accepts("image/png", "application/json"));
    }

    #[test]
    fn errors_carry_status_and_rpc_code() {
        let response = error_response(
            &Error::session_not_found(Some("gone")),
            Some(RequestId::from(3)),
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
