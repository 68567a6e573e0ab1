//! Session records and the registry mapping session ids to them.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    switchboard_protocol::{JsonRpcMessage, JsonRpcNotification, ProgressToken, RequestId},
    tokio::{
        sync::{Mutex, RwLock, watch},
        time::Instant,
    },
    tracing::{debug, warn},
};

use crate::{
    context::Outbound,
    error::{Error, Result},
    session::SessionTransport,
};

/// Whether a freshly registered session may serve traffic yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// Event stream of one in-flight request.
struct BoundStream {
    request_id: RequestId,
    progress_token: Option<ProgressToken>,
    outbound: Outbound,
}

/// One live session: its transport plus bookkeeping.
pub struct SessionRecord {
    session_id: String,
    transport: Arc<dyn SessionTransport>,
    last_accessed_at: Mutex<Instant>,
    /// In bind order; each request removes only its own entry.
    streams: Mutex<Vec<BoundStream>>,
    ready: watch::Sender<Readiness>,
    closed: AtomicBool,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("session_id", &self.session_id)
            .field("readiness", &*self.ready.borrow())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionRecord {
    pub fn new(transport: Arc<dyn SessionTransport>, readiness: Readiness) -> Self {
        let (ready, _) = watch::channel(readiness);
        Self {
            session_id: transport.session_id().to_string(),
            transport,
            last_accessed_at: Mutex::new(Instant::now()),
            streams: Mutex::new(Vec::new()),
            ready,
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transport(&self) -> Arc<dyn SessionTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn touch(&self) {
        *self.last_accessed_at.lock().await = Instant::now();
    }

    pub async fn last_accessed_at(&self) -> Instant {
        *self.last_accessed_at.lock().await
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_accessed_at.lock().await.elapsed()
    }

    /// Attach the event stream of an in-flight request. Rebinding the same
    /// request id replaces its entry.
    pub async fn bind(
        &self,
        request_id: RequestId,
        progress_token: Option<ProgressToken>,
        outbound: Outbound,
    ) {
        let mut streams = self.streams.lock().await;
        streams.retain(|s| s.request_id != request_id);
        streams.push(BoundStream {
            request_id,
            progress_token,
            outbound,
        });
    }

    /// Detach the stream of `request_id`, leaving other requests bound.
    pub async fn unbind(&self, request_id: &RequestId) {
        self.streams
            .lock()
            .await
            .retain(|s| &s.request_id != request_id);
    }

    pub async fn progress_token(&self, request_id: &RequestId) -> Option<ProgressToken> {
        self.streams
            .lock()
            .await
            .iter()
            .find(|s| &s.request_id == request_id)
            .and_then(|s| s.progress_token.clone())
    }

    pub async fn bound_requests(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Push a session-level notification over the oldest open stream.
    /// Streams whose receiver is gone are dropped. Returns whether any
    /// stream took it.
    pub async fn notify(&self, notification: JsonRpcNotification) -> bool {
        let message = JsonRpcMessage::from(notification);
        let mut streams = self.streams.lock().await;
        streams.retain(|s| !s.outbound.is_closed());
        streams
            .first()
            .is_some_and(|s| s.outbound.send(message).is_ok())
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(Readiness::Ready);
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.ready.send_replace(Readiness::Failed(reason.into()));
    }

    /// Wait until the session leaves [`Readiness::Pending`].
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let state = rx
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map_err(|_| Error::session_not_found(Some(&self.session_id)))?
            .clone();
        match state {
            Readiness::Failed(reason) => Err(Error::AutoInitialization {
                session_id: self.session_id.clone(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    /// Closed through [`Self::close`] or by the transport itself.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.transport.is_closed()
    }

    /// Close the transport. Only the first call reaches it.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.streams.lock().await.clear();
        self.transport.close().await
    }
}

/// Owned map of session id to record.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Insert `record`, returning whatever it displaced.
    pub async fn insert(&self, record: Arc<SessionRecord>) -> Option<Arc<SessionRecord>> {
        self.sessions
            .write()
            .await
            .insert(record.session_id().to_string(), record)
    }

    /// Return the existing record for `session_id`, or insert the one built
    /// by `make`. The flag is true when `make` ran.
    pub async fn get_or_insert_with(
        &self,
        session_id: &str,
        make: impl FnOnce() -> Arc<SessionRecord>,
    ) -> (Arc<SessionRecord>, bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            return (Arc::clone(existing), false);
        }
        let record = make();
        sessions.insert(session_id.to_string(), Arc::clone(&record));
        (record, true)
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Remove `record` only if it is still the one registered under its id.
    pub async fn remove_if_same(&self, record: &Arc<SessionRecord>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(record.session_id()) {
            Some(current) if Arc::ptr_eq(current, record) => {
                sessions.remove(record.session_id());
                true
            },
            _ => false,
        }
    }

    pub async fn drain(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions.write().await.drain().map(|(_, r)| r).collect()
    }

    /// Sorted ids.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn records(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove every record idle for longer than `idle_timeout`. Expiry is
    /// checked again under the write lock so a request that touched the
    /// record after the scan keeps it alive.
    pub async fn remove_expired(&self, idle_timeout: Duration) -> Vec<Arc<SessionRecord>> {
        let mut candidates = Vec::new();
        for record in self.records().await {
            if record.idle_for().await > idle_timeout {
                candidates.push(record);
            }
        }
        if candidates.is_empty() {
            return candidates;
        }

        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::with_capacity(candidates.len());
        for record in candidates {
            let still_registered = sessions
                .get(record.session_id())
                .is_some_and(|current| Arc::ptr_eq(current, &record));
            if !still_registered {
                continue;
            }
            if record.idle_for().await > idle_timeout {
                sessions.remove(record.session_id());
                expired.push(record);
            } else {
                debug!(session_id = %record.session_id(), "session touched during sweep, keeping");
            }
        }
        expired
    }

    /// Remove records whose transport reports itself closed.
    pub async fn remove_closed(&self) -> Vec<Arc<SessionRecord>> {
        let mut sessions = self.sessions.write().await;
        let closed: Vec<String> = sessions
            .iter()
            .filter(|(_, record)| record.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        closed
            .into_iter()
            .filter_map(|id| {
                let record = sessions.remove(&id);
                if record.is_some() {
                    warn!(session_id = %id, "removing session whose transport closed");
                }
                record
            })
            .collect()
    }
}
