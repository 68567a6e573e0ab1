//! Streamable HTTP transport for remote MCP servers.
//!
//! Every client frame is a POST. Responses to requests come back either as a
//! single JSON body or as an SSE stream that may interleave notifications and
//! server requests before the final response. Servers that reject streaming
//! (406/415) switch the transport to JSON-only mode for the rest of its life.

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
    futures::StreamExt,
    reqwest::{Client, StatusCode},
    switchboard_protocol::{
        JsonRpcMessage, LATEST_PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, RequestId,
        SESSION_ID_HEADER,
    },
    tokio::sync::{Mutex, RwLock},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{TransportError, TransportResult},
    traits::{EventSender, McpTransport, TransportEvent},
};

const STREAMABLE_ACCEPT: &str = "application/json, text/event-stream";
const JSON_ACCEPT: &str = "application/json";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP transport for a streamable MCP endpoint.
pub struct HttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: RwLock<Option<String>>,
    json_only: AtomicBool,
    alive: AtomicBool,
    events: Mutex<Option<EventSender>>,
    cancel: Mutex<CancellationToken>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> TransportResult<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url: url.into(),
                headers,
                session_id: RwLock::new(None),
                json_only: AtomicBool::new(false),
                alive: AtomicBool::new(false),
                events: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// Whether the server refused streaming and responses are plain JSON.
    pub fn is_json_only(&self) -> bool {
        self.inner.json_only.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn with_session_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req.header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION);
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        if let Some(session_id) = self.session_id.read().await.clone() {
            req = req.header(SESSION_ID_HEADER, session_id);
        }
        req
    }

    async fn post_once(
        &self,
        message: &JsonRpcMessage,
        accept: &str,
    ) -> TransportResult<reqwest::Response> {
        let req = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, accept);
        Ok(self.with_session_headers(req).await.json(message).send().await?)
    }

    /// POST one frame, falling back to JSON-only mode if streaming is refused.
    async fn post(&self, message: &JsonRpcMessage) -> TransportResult<reqwest::Response> {
        let accept = if self.json_only.load(Ordering::SeqCst) {
            JSON_ACCEPT
        } else {
            STREAMABLE_ACCEPT
        };
        let resp = self.post_once(message, accept).await?;
        if matches!(
            resp.status(),
            StatusCode::NOT_ACCEPTABLE | StatusCode::UNSUPPORTED_MEDIA_TYPE
        ) && !self.json_only.swap(true, Ordering::SeqCst)
        {
            info!(url = %self.url, status = %resp.status(), "server refused streaming, switching to JSON responses");
            return self.post_once(message, JSON_ACCEPT).await;
        }
        Ok(resp)
    }

    async fn store_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return;
        };

        let mut slot = self.session_id.write().await;
        if slot.as_deref() != Some(session_id) {
            debug!(url = %self.url, session_id = %session_id, "updated MCP session id");
            *slot = Some(session_id.to_string());
        }
    }

    /// Turn a non-success status into a typed error.
    async fn check_status(&self, resp: reqwest::Response) -> TransportResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND
            && let Some(session_id) = self.session_id.read().await.clone()
        {
            return Err(TransportError::SessionExpired { session_id });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn post_checked(&self, message: &JsonRpcMessage) -> TransportResult<reqwest::Response> {
        let resp = self.post(message).await?;
        self.store_session_id(&resp).await;
        self.check_status(resp).await
    }

    /// POST a request and deliver whatever its response body carries.
    async fn exchange(
        &self,
        message: JsonRpcMessage,
        id: RequestId,
        events: EventSender,
        cancel: CancellationToken,
    ) {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return,
            outcome = async {
                let resp = self.post_checked(&message).await?;
                read_body(resp, Some(&id), &events).await
            } => outcome,
        };
        if let Err(error) = outcome {
            let _ = events.send(TransportEvent::Failed { id, error });
        }
    }

    /// Read the standalone GET stream carrying server-initiated messages.
    async fn listen(&self, events: EventSender, cancel: CancellationToken) {
        let req = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let resp = tokio::select! {
            () = cancel.cancelled() => return,
            resp = async { self.with_session_headers(req).await.send().await } => resp,
        };
        let resp = match resp {
            Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => {
                debug!(url = %self.url, "server does not offer a standalone event stream");
                return;
            },
            Ok(resp) if !resp.status().is_success() => {
                warn!(url = %self.url, status = %resp.status(), "standalone event stream rejected");
                return;
            },
            Ok(resp) => resp,
            Err(e) => {
                debug!(url = %self.url, error = %e, "standalone event stream unavailable");
                return;
            },
        };
        tokio::select! {
            () = cancel.cancelled() => {},
            outcome = read_body(resp, None, &events) => {
                if let Err(e) = outcome {
                    debug!(url = %self.url, error = %e, "standalone event stream ended");
                }
            },
        }
    }

    async fn channel(&self) -> TransportResult<(EventSender, CancellationToken)> {
        let events = self
            .events
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::Closed("transport not started".into()))?;
        Ok((events, self.cancel.lock().await.clone()))
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn start(&self, events: EventSender) -> TransportResult<()> {
        let inner = &self.inner;
        url::Url::parse(&inner.url)
            .map_err(|e| TransportError::Closed(format!("invalid url {}: {e}", inner.url)))?;
        *inner.events.lock().await = Some(events);
        *inner.cancel.lock().await = CancellationToken::new();
        inner.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        let (events, cancel) = self.inner.channel().await?;

        if let JsonRpcMessage::Request(req) = &message {
            debug!(method = %req.method, id = %req.id, url = %self.inner.url, "HTTP client -> server");
            let id = req.id.clone();
            // The response arrives when the server is done; never hold the caller.
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.exchange(message, id, events, cancel).await });
            return Ok(());
        }

        let resp = self.inner.post_checked(&message).await?;
        if resp.status() != StatusCode::ACCEPTED {
            tokio::spawn(async move {
                if let Err(e) = read_body(resp, None, &events).await {
                    debug!(error = %e, "discarding unreadable body");
                }
            });
        }
        Ok(())
    }

    async fn on_initialized(&self) {
        let Ok((events, cancel)) = self.inner.channel().await else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.listen(events, cancel).await });
    }

    async fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().await.clone()
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let inner = &self.inner;
        inner.alive.store(false, Ordering::SeqCst);
        inner.cancel.lock().await.cancel();
        inner.events.lock().await.take();

        let Some(session_id) = inner.session_id.write().await.take() else {
            return;
        };
        let mut req = inner
            .client
            .delete(&inner.url)
            .timeout(CLOSE_TIMEOUT)
            .header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION)
            .header(SESSION_ID_HEADER, session_id);
        for (name, value) in &inner.headers {
            req = req.header(name, value);
        }
        if let Err(e) = req.send().await {
            warn!(url = %inner.url, error = %e, "failed to close MCP HTTP session");
        }
    }
}

fn is_event_stream(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|base| base.trim() == "text/event-stream")
}

/// Forward every message in a response body. When `expect` is set, the body
/// must contain the response to that request id.
async fn read_body(
    resp: reqwest::Response,
    expect: Option<&RequestId>,
    events: &EventSender,
) -> TransportResult<()> {
    let mut answered = false;
    let mut deliver = |payload: &str| match JsonRpcMessage::parse_batch(payload) {
        Ok(messages) => {
            for message in messages {
                if let JsonRpcMessage::Response(r) = &message
                    && r.id.as_ref() == expect
                {
                    answered = true;
                }
                let _ = events.send(TransportEvent::Message(message));
            }
        },
        Err(e) => warn!(error = %e, "ignoring malformed JSON-RPC payload"),
    };

    if is_event_stream(&resp) {
        let mut parser = SseParser::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Stream(e.to_string()))?;
            for payload in parser.feed(&chunk) {
                deliver(&payload);
            }
        }
        if let Some(payload) = parser.finish() {
            deliver(&payload);
        }
    } else {
        let body = resp.text().await?;
        if !body.trim().is_empty() {
            deliver(&body);
        }
    }

    if expect.is_some() && !answered {
        return Err(TransportError::Stream(
            "response body ended without a JSON-RPC response".into(),
        ));
    }
    Ok(())
}

/// Incremental server-sent-events decoder yielding `data` payloads.
#[derive(Default)]
struct SseParser {
    buf: Vec<u8>,
    data: String,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.line(&String::from_utf8_lossy(&line), &mut payloads);
        }
        payloads
    }

    fn finish(&mut self) -> Option<String> {
        let mut payloads = Vec::new();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.line(&String::from_utf8_lossy(&rest), &mut payloads);
        }
        if !self.data.is_empty() {
            payloads.push(std::mem::take(&mut self.data));
        }
        payloads.pop()
    }

    fn line(&mut self, raw: &str, payloads: &mut Vec<String>) {
        let line = raw.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            if !self.data.is_empty() {
                payloads.push(std::mem::take(&mut self.data));
            }
            return;
        }
        // `event:`, `id:`, `retry:` and `:` comments carry nothing we route on.
        if let Some(rest) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
}
