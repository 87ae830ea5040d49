use crate::health::{HealthCache, HealthProbe};
use crate::idle::IdleScheduler;
use crate::messages::{MessageContext, MessageKind};
use crate::registry::Registry;
use crate::router::{Directive, Router};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(90);

/// How a wait session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The target became healthy and the client was sent there.
    Connected,
    TimedOut,
    ClientGone,
    /// A newer session replaced this one, or it was canceled.
    Superseded,
    UnknownTarget,
}

struct Session {
    id: u64,
    target: String,
    handle: AbortHandle,
}

enum Poll {
    Pending,
    Done(WaitOutcome),
}

/// Per-client "wait for the target to come up, then send them" sessions.
///
/// At most one session per client. The ready notice is sent at most once
/// per session.
#[derive(Clone)]
pub struct WaitManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    health: Arc<HealthCache>,
    router: Arc<dyn Router>,
    probe: Arc<dyn HealthProbe>,
    idle: IdleScheduler,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, Session>>,
    /// Clients already told "ready" in their current session.
    announced: Mutex<HashSet<String>>,
}

impl WaitManager {
    pub fn new(
        registry: Arc<Registry>,
        health: Arc<HealthCache>,
        router: Arc<dyn Router>,
        probe: Arc<dyn HealthProbe>,
        idle: IdleScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                health,
                router,
                probe,
                idle,
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
                announced: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Start waiting for `target` on behalf of `client`, replacing any
    /// session the client already had.
    pub fn begin(&self, client: &str, target: &str) -> u64 {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        inner.announced().remove(client);
        let mut sessions = inner.sessions();
        let task_inner = inner.clone();
        let task_client = client.to_string();
        let task_target = target.to_string();
        let handle = tokio::spawn(async move {
            let outcome = task_inner.run(&task_client, &task_target, id, started).await;
            tracing::info!(
                client = %task_client,
                backend = %task_target,
                ?outcome,
                "wait session ended"
            );
        })
        .abort_handle();

        let session = Session {
            id,
            target: target.to_string(),
            handle,
        };
        if let Some(previous) = sessions.insert(client.to_string(), session) {
            previous.handle.abort();
            tracing::info!(
                client = %client,
                from = %previous.target,
                to = %target,
                "wait superseded"
            );
        } else {
            tracing::info!(client = %client, backend = %target, "waiting for backend");
        }
        id
    }

    pub fn target_of(&self, client: &str) -> Option<String> {
        self.inner
            .sessions()
            .get(client)
            .map(|s| s.target.clone())
    }

    pub fn is_waiting(&self, client: &str) -> bool {
        self.inner.sessions().contains_key(client)
    }

    pub fn cancel(&self, client: &str) -> bool {
        match self.inner.sessions().remove(client) {
            Some(session) => {
                session.handle.abort();
                tracing::debug!(client = %client, backend = %session.target, "wait canceled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, session) in self.inner.sessions().drain() {
            session.handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn announced(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.announced.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, client: &str, id: u64) -> bool {
        self.sessions().get(client).is_some_and(|s| s.id == id)
    }

    /// Drop the session if it is still `id`, without aborting its task.
    fn finish(&self, client: &str, id: u64) -> bool {
        let mut sessions = self.sessions();
        if sessions.get(client).is_some_and(|s| s.id == id) {
            sessions.remove(client);
            true
        } else {
            false
        }
    }

    fn tell(&self, client: &str, backend: &str, kind: MessageKind) {
        let text = self
            .registry
            .config()
            .messages
            .render(kind, MessageContext::backend(backend).with_client(client));
        self.router.send(Directive::Message {
            client: client.to_string(),
            text,
        });
    }

    async fn run(
        self: &Arc<Self>,
        client: &str,
        target: &str,
        id: u64,
        started: Instant,
    ) -> WaitOutcome {
        loop {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            if let Poll::Done(outcome) = self.poll(client, target, id, started).await {
                return outcome;
            }
        }
    }

    async fn poll(self: &Arc<Self>, client: &str, target: &str, id: u64, started: Instant) -> Poll {
        if !self.router.is_online(client) {
            self.finish(client, id);
            return Poll::Done(WaitOutcome::ClientGone);
        }
        if !self.is_current(client, id) {
            return Poll::Done(WaitOutcome::Superseded);
        }
        let Some(config) = self.registry.backend_config(target) else {
            self.finish(client, id);
            self.tell(client, target, MessageKind::UnknownTarget);
            return Poll::Done(WaitOutcome::UnknownTarget);
        };

        if started.elapsed() > WAIT_TIMEOUT {
            self.finish(client, id);
            self.tell(client, target, MessageKind::TimedOut);
            self.release_abandoned(target).await;
            return Poll::Done(WaitOutcome::TimedOut);
        }

        let inner = self.clone();
        let client = client.to_string();
        let target = target.to_string();
        tokio::spawn(async move {
            match inner.probe.probe(&target, &config).await {
                Ok(()) => {
                    inner.health.mark_healthy(&target);
                    inner.on_ready(&client, &target, id);
                }
                Err(e) => {
                    tracing::debug!(backend = %target, client = %client, "not ready yet: {e}");
                }
            }
        });
        Poll::Pending
    }

    fn on_ready(&self, client: &str, target: &str, id: u64) {
        let handle = {
            let mut sessions = self.sessions();
            match sessions.get(client) {
                Some(s) if s.id == id && s.target == target => {}
                _ => return,
            }
            if !self.announced().insert(client.to_string()) {
                return;
            }
            if !self.router.is_online(client) {
                return;
            }
            sessions.remove(client).map(|s| s.handle)
        };

        self.idle.cancel_backend(target);
        self.tell(client, target, MessageKind::ReadySending);
        self.router.send(Directive::Connect {
            client: client.to_string(),
            backend: target.to_string(),
        });
        tracing::info!(
            client = %client,
            backend = %target,
            outcome = ?WaitOutcome::Connected,
            "wait session ended"
        );
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Nobody came; stop the target unless someone is on it or it is held.
    async fn release_abandoned(&self, target: &str) {
        if self.router.occupancy(target) > 0 || !self.registry.is_running(target) {
            return;
        }
        if self.registry.is_hold_active(target) {
            tracing::info!(backend = %target, "wait timed out, leaving held backend running");
            return;
        }
        tracing::info!(backend = %target, "wait timed out, stopping unused backend");
        if let Err(e) = self.registry.stop(target).await {
            tracing::warn!(backend = %target, "stop after timeout failed: {e}");
        }
        self.health.mark_unhealthy(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, parse_config};
    use crate::health::ProbeError;
    use crate::router::TrackedRouter;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;

    /// Always healthy, but takes longer than one poll interval to say so.
    #[derive(Default)]
    struct SlowProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn probe(&self, _name: &str, _config: &BackendConfig) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok(())
        }
    }

    fn setup() -> (WaitManager, Arc<TrackedRouter>, Arc<SlowProbe>) {
        let config = parse_config(
            r#"
[backends.lobby]
primary = true
command = "sh -c 'read line'"
address = "127.0.0.1:25566"

[backends.smp]
command = "sh -c 'read line'"
address = "127.0.0.1:25567"

[backends.creative]
command = "sh -c 'read line'"
address = "127.0.0.1:25569"
"#,
        )
        .unwrap();
        let registry = Arc::new(Registry::new(config, None));
        let health = Arc::new(HealthCache::new());
        let router = Arc::new(TrackedRouter::new());
        let probe = Arc::new(SlowProbe::default());
        let idle = IdleScheduler::new(registry.clone(), health.clone(), router.clone());
        let waits = WaitManager::new(registry, health, router.clone(), probe.clone(), idle);
        (waits, router, probe)
    }

    fn drain(rx: &mut broadcast::Receiver<Directive>) -> Vec<Directive> {
        let mut out = Vec::new();
        while let Ok(directive) = rx.try_recv() {
            out.push(directive);
        }
        out
    }

    fn ready(client: &str, backend: &str) -> Vec<Directive> {
        vec![
            Directive::Message {
                client: client.to_string(),
                text: format!("{backend} is ready, sending you now."),
            },
            Directive::Connect {
                client: client.to_string(),
                backend: backend.to_string(),
            },
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_health_checks_send_one_notice() {
        let (waits, router, probe) = setup();
        router.login("alice");
        router.connected("alice", "lobby");
        let mut rx = router.subscribe();

        waits.begin("alice", "smp");
        tokio::time::sleep(Duration::from_secs(5)).await;

        // The second poll fired while the first probe was still running.
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(drain(&mut rx), ready("alice", "smp"));
        assert!(!waits.is_waiting("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ready_is_ignored() {
        let (waits, router, _probe) = setup();
        router.login("alice");
        router.connected("alice", "lobby");
        let mut rx = router.subscribe();

        let old = waits.begin("alice", "smp");
        let current = waits.begin("alice", "creative");
        assert_eq!(waits.target_of("alice").as_deref(), Some("creative"));

        waits.inner.on_ready("alice", "smp", old);
        waits.inner.on_ready("alice", "smp", current);
        waits.inner.on_ready("alice", "creative", old);
        assert!(drain(&mut rx).is_empty());
        assert!(waits.is_waiting("alice"));

        waits.inner.on_ready("alice", "creative", current);
        waits.inner.on_ready("alice", "creative", current);
        assert_eq!(drain(&mut rx), ready("alice", "creative"));
        assert!(!waits.is_waiting("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_session() {
        let (waits, router, _probe) = setup();
        router.login("alice");
        let mut rx = router.subscribe();

        waits.begin("alice", "smp");
        assert!(waits.cancel("alice"));
        assert!(!waits.cancel("alice"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(waits.is_empty());
    }
}
