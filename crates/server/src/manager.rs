//! Session lifecycle: creation on initialize, reuse by id, compatibility
//! recreation of expired ids, and the idle sweep.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use {
    switchboard_common::IntervalHandle,
    switchboard_config::ServerConfig,
    switchboard_protocol::JsonRpcNotification,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    error::{Error, Result},
    registry::{Readiness, SessionRecord, SessionRegistry},
    session::TransportFactory,
};

#[derive(Debug, Clone)]
pub struct SessionManagerOptions {
    /// Rebuild a session under an unknown id instead of answering not found.
    pub auto_create_session_on_invalid_id: bool,
    /// Upper bound on the idle sweep period.
    pub sweep_interval: Duration,
}

impl Default for SessionManagerOptions {
    fn default() -> Self {
        Self {
            auto_create_session_on_invalid_id: true,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&ServerConfig> for SessionManagerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            auto_create_session_on_invalid_id: config.auto_create_session_on_invalid_id,
            sweep_interval: config.sweep_interval(),
        }
    }
}

pub struct SessionManager {
    registry: SessionRegistry,
    factory: Arc<dyn TransportFactory>,
    options: SessionManagerOptions,
    cleanup: Mutex<Option<IntervalHandle>>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, options: SessionManagerOptions) -> Self {
        Self {
            registry: SessionRegistry::new(),
            factory,
            options,
            cleanup: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &SessionManagerOptions {
        &self.options
    }

    /// Resolve the session a request belongs to.
    ///
    /// Initialize always gets a fresh transport under a new id, closing any
    /// live session the client named. Other requests reuse the session for
    /// their id; an unknown id is recreated in place when auto-create is on.
    /// A request without an id is never given a session.
    pub async fn get_or_create_transport(
        &self,
        session_id: Option<&str>,
        is_initialize: bool,
    ) -> Result<Arc<SessionRecord>> {
        if is_initialize {
            return Ok(self.create_for_initialize(session_id).await);
        }

        let Some(session_id) = session_id else {
            return Err(Error::session_not_found(None));
        };

        if let Some(record) = self.registry.get(session_id).await {
            record.touch().await;
            record.wait_ready().await?;
            return Ok(record);
        }

        if !self.options.auto_create_session_on_invalid_id {
            debug!(session_id, "unknown session id");
            return Err(Error::session_not_found(Some(session_id)));
        }
        self.recreate(session_id).await
    }

    async fn create_for_initialize(&self, previous: Option<&str>) -> Arc<SessionRecord> {
        if let Some(previous) = previous
            && let Some(old) = self.registry.remove(previous).await
        {
            info!(session_id = %previous, "initialize replaces existing session");
            close_record(&old).await;
        }

        let session_id = Uuid::new_v4().to_string();
        let record = Arc::new(SessionRecord::new(
            self.factory.create(&session_id),
            Readiness::Ready,
        ));
        if let Some(displaced) = self.registry.insert(Arc::clone(&record)).await {
            close_record(&displaced).await;
        }
        debug!(session_id = %session_id, "session created");
        record
    }

    async fn recreate(&self, session_id: &str) -> Result<Arc<SessionRecord>> {
        let (record, created) = self
            .registry
            .get_or_insert_with(session_id, || {
                Arc::new(SessionRecord::new(
                    self.factory.create(session_id),
                    Readiness::Pending,
                ))
            })
            .await;

        if !created {
            record.touch().await;
            record.wait_ready().await?;
            return Ok(record);
        }

        info!(session_id, "recreating session for unknown id");
        match record.transport().initialize_session().await {
            Ok(()) => {
                record.mark_ready();
                Ok(record)
            },
            Err(e) => {
                let reason = match e {
                    Error::AutoInitialization { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(session_id, reason = %reason, "session auto-initialization failed");
                record.mark_failed(reason.clone());
                self.registry.remove_if_same(&record).await;
                close_record(&record).await;
                Err(Error::AutoInitialization {
                    session_id: session_id.to_string(),
                    reason,
                })
            },
        }
    }

    /// Evict `record` if it is still registered, and close it.
    pub async fn discard(&self, record: &Arc<SessionRecord>) {
        self.registry.remove_if_same(record).await;
        close_record(record).await;
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.registry.get(session_id).await
    }

    /// Close and remove one session. Returns whether it existed.
    pub async fn close_session(&self, session_id: &str) -> bool {
        match self.registry.remove(session_id).await {
            Some(record) => {
                close_record(&record).await;
                info!(session_id, "session closed by client");
                true
            },
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let records = self.registry.drain().await;
        let count = records.len();
        for record in records {
            close_record(&record).await;
        }
        if count > 0 {
            info!(count, "closed all sessions");
        }
    }

    /// Drop registry entries whose transport reported closure. Those
    /// transports are already closed and are not closed again.
    pub async fn remove_closed(&self) -> usize {
        self.registry.remove_closed().await.len()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.registry.ids().await
    }

    pub async fn len(&self) -> usize {
        self.registry.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.is_empty().await
    }

    /// Send `notification` to every session with an open request stream.
    /// Returns how many sessions took it.
    pub async fn broadcast(&self, notification: JsonRpcNotification) -> usize {
        let mut delivered = 0;
        for record in self.registry.records().await {
            if record.notify(notification.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close and evict every session idle for longer than `idle_timeout`.
    pub async fn sweep_idle_sessions(&self, idle_timeout: Duration) -> usize {
        let expired = self.registry.remove_expired(idle_timeout).await;
        for record in &expired {
            info!(session_id = %record.session_id(), "closing idle session");
            close_record(record).await;
        }
        expired.len()
    }

    /// Run [`Self::remove_closed`] and [`Self::sweep_idle_sessions`] on a
    /// fixed period until stopped. A zero timeout disables the sweep. Restarting replaces any running
    /// sweep.
    pub async fn start_idle_cleanup(self: &Arc<Self>, idle_timeout: Duration) {
        let mut cleanup = self.cleanup.lock().await;
        cleanup.take();
        if idle_timeout.is_zero() {
            debug!("idle session cleanup disabled");
            return;
        }

        let period = self.options.sweep_interval.min(idle_timeout);
        let manager: Weak<Self> = Arc::downgrade(self);
        *cleanup = Some(IntervalHandle::spawn(period, move || {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    let dropped = manager.remove_closed().await;
                    let removed = manager.sweep_idle_sessions(idle_timeout).await;
                    if removed > 0 || dropped > 0 {
                        debug!(removed, dropped, "idle sweep finished");
                    }
                }
            }
        }));
        info!(
            idle_timeout_ms = idle_timeout.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "idle session cleanup started"
        );
    }

    pub async fn stop_idle_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().await.take() {
            handle.cancel();
            info!("idle session cleanup stopped");
        }
    }

    pub async fn is_cleanup_running(&self) -> bool {
        self.cleanup
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_cancelled())
    }
}

async fn close_record(record: &SessionRecord) {
    if let Err(e) = record.close().await {
        warn!(session_id = %record.session_id(), error = %e, "failed to close session transport");
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{context::Outbound, session::SessionTransport},
        async_trait::async_trait,
        std::sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        switchboard_protocol::{JsonRpcMessage, JsonRpcResponse, RequestId},
        tokio::sync::mpsc,
    };

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        inits: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeTransport {
        id: String,
        counters: Arc<Counters>,
        fail_init: bool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl SessionTransport for FakeTransport {
        fn session_id(&self) -> &str {
            &self.id
        }

        async fn handle_message(
            &self,
            _message: JsonRpcMessage,
            _outbound: Option<Outbound>,
        ) -> Result<Option<JsonRpcResponse>> {
            Ok(None)
        }

        async fn initialize_session(&self) -> Result<()> {
            self.counters.inits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_init {
                return Err(Error::message("handler refused"));
            }
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            true
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory {
        counters: Arc<Counters>,
        fail_init: bool,
    }

    impl TransportFactory for FakeFactory {
        fn create(&self, session_id: &str) -> Arc<dyn SessionTransport> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(FakeTransport {
                id: session_id.to_string(),
                counters: Arc::clone(&self.counters),
                fail_init: self.fail_init,
                closed: AtomicBool::new(false),
            })
        }
    }

    fn manager(auto_create: bool, fail_init: bool) -> (Arc<SessionManager>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory = Arc::new(FakeFactory {
            counters: Arc::clone(&counters),
            fail_init,
        });
        let options = SessionManagerOptions {
            auto_create_session_on_invalid_id: auto_create,
            ..SessionManagerOptions::default()
        };
        (Arc::new(SessionManager::new(factory, options)), counters)
    }

    #[tokio::test]
    async fn initialize_always_creates_a_new_session() {
        let (manager, counters) = manager(true, false);
        let first = manager.get_or_create_transport(None, true).await.unwrap();
        let first_id = first.session_id().to_string();

        let second = manager
            .get_or_create_transport(Some(&first_id), true)
            .await
            .unwrap();
        assert_ne!(second.session_id(), first_id);
        assert!(first.is_closed());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_ids().await, [second.session_id().to_string()]);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn known_ids_are_reused() {
        let (manager, counters) = manager(false, false);
        let created = manager.get_or_create_transport(None, true).await.unwrap();
        let reused = manager
            .get_or_create_transport(Some(created.session_id()), false)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&created, &reused));
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_id_is_never_a_session() {
        let (manager, _) = manager(true, false);
        assert!(matches!(
            manager.get_or_create_transport(None, false).await,
            Err(Error::SessionNotFound { session_id: None })
        ));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_id_without_auto_create_is_not_found() {
        let (manager, counters) = manager(false, false);
        assert!(matches!(
            manager.get_or_create_transport(Some("gone"), false).await,
            Err(Error::SessionNotFound { session_id: Some(id) }) if id == "gone"
        ));
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_auto_create_shares_one_transport() {
        let (manager, counters) = manager(true, false);
        let (a, b) = tokio::join!(
            manager.get_or_create_transport(Some("stale-id"), false),
            manager.get_or_create_transport(Some("stale-id"), false),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.session_id(), "stale-id");
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_auto_initialize_evicts() {
        let (manager, counters) = manager(true, true);
        let err = manager
            .get_or_create_transport(Some("stale-id"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AutoInitialization { ref session_id, ref reason }
                if session_id == "stale-id" && reason == "handler refused"
        ));
        assert!(manager.is_empty().await);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_evicts_then_recreates_or_refuses() {
        for auto_create in [false, true] {
            let (manager, counters) = manager(auto_create, false);
            manager.start_idle_cleanup(Duration::from_millis(1000)).await;
            assert!(manager.is_cleanup_running().await);

            let record = manager.get_or_create_transport(None, true).await.unwrap();
            let id = record.session_id().to_string();

            tokio::time::sleep(Duration::from_millis(1500)).await;
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert!(manager.get(&id).await.is_none());
            assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

            let next = manager.get_or_create_transport(Some(&id), false).await;
            if auto_create {
                assert_eq!(next.unwrap().session_id(), id);
                assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
            } else {
                assert!(matches!(next, Err(Error::SessionNotFound { .. })));
            }

            manager.stop_idle_cleanup().await;
            assert!(!manager.is_cleanup_running().await);
            manager.close_all().await;
            assert_eq!(
                counters.closes.load(Ordering::SeqCst),
                if auto_create { 2 } else { 1 }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn active_sessions_survive_the_sweep() {
        let (manager, _) = manager(false, false);
        manager.start_idle_cleanup(Duration::from_millis(1000)).await;
        let record = manager.get_or_create_transport(None, true).await.unwrap();
        let id = record.session_id().to_string();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(400)).await;
            manager.get_or_create_transport(Some(&id), false).await.unwrap();
        }
        assert_eq!(manager.session_ids().await, [id]);
    }

    #[tokio::test]
    async fn zero_timeout_disables_cleanup() {
        let (manager, _) = manager(true, false);
        manager.start_idle_cleanup(Duration::ZERO).await;
        assert!(!manager.is_cleanup_running().await);
    }

    #[tokio::test]
    async fn close_session_and_remove_closed() {
        let (manager, counters) = manager(false, false);
        let a = manager.get_or_create_transport(None, true).await.unwrap();
        let b = manager.get_or_create_transport(None, true).await.unwrap();

        assert!(manager.close_session(a.session_id()).await);
        assert!(!manager.close_session(a.session_id()).await);

        b.transport().close().await.unwrap();
        assert_eq!(manager.remove_closed().await, 1);
        assert!(manager.is_empty().await);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_tick_drops_self_closed_transports() {
        let (manager, counters) = manager(false, false);
        manager.start_idle_cleanup(Duration::from_secs(60)).await;
        let record = manager.get_or_create_transport(None, true).await.unwrap();

        record.transport().close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(manager.is_empty().await);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        manager.stop_idle_cleanup().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_requests_still_in_flight() {
        let (manager, _) = manager(false, false);
        let busy = manager.get_or_create_transport(None, true).await.unwrap();
        let idle = manager.get_or_create_transport(None, true).await.unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        busy.bind(RequestId::Number(1), None, tx_a).await;
        busy.bind(RequestId::Number(2), None, tx_b).await;
        busy.unbind(&RequestId::Number(1)).await;

        let note = JsonRpcNotification::new("notifications/tools/list_changed", None);
        assert_eq!(manager.broadcast(note).await, 1);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert_eq!(idle.bound_requests().await, 0);
    }
}
