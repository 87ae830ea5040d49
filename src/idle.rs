use crate::health::HealthCache;
use crate::registry::Registry;
use crate::router::Router;
use crate::ticket::{TicketId, TicketMap};
use std::sync::Arc;
use std::time::Duration;

/// Delay between "the fleet may be empty" and actually checking.
pub const FLEET_DEBOUNCE: Duration = Duration::from_secs(2);

/// Stops backends nobody is using after the configured grace period.
///
/// One ticket per backend and one fleet-wide ticket at most. Every fire
/// re-checks occupancy and holds before stopping anything.
#[derive(Clone)]
pub struct IdleScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    health: Arc<HealthCache>,
    router: Arc<dyn Router>,
    backends: TicketMap<String>,
    fleet: TicketMap<()>,
    fleet_debounce: TicketMap<()>,
}

impl IdleScheduler {
    pub fn new(registry: Arc<Registry>, health: Arc<HealthCache>, router: Arc<dyn Router>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                health,
                router,
                backends: TicketMap::new(),
                fleet: TicketMap::new(),
                fleet_debounce: TicketMap::new(),
            }),
        }
    }

    pub fn has_backend_ticket(&self, name: &str) -> bool {
        self.inner.backends.contains(&name.to_string())
    }

    pub fn has_fleet_ticket(&self) -> bool {
        self.inner.fleet.contains(&())
    }

    /// Arm a stop for `name` if it is known, empty, unheld and not already armed.
    pub fn schedule_if_empty(&self, name: &str) -> bool {
        let inner = &self.inner;
        if !inner.registry.is_known(name) || inner.router.occupancy(name) > 0 {
            return false;
        }
        if inner.registry.is_hold_active(name) {
            tracing::debug!(backend = %name, "held, not scheduling idle stop");
            return false;
        }

        let grace = Duration::from_secs(inner.registry.config().stop_grace_seconds);
        let task_inner = inner.clone();
        let key = name.to_string();
        let scheduled = inner
            .backends
            .insert_if_absent(key.clone(), move |id| async move {
                tokio::time::sleep(grace).await;
                task_inner.fire_backend(key, id).await;
            })
            .is_some();
        if scheduled {
            tracing::info!(backend = %name, grace_secs = grace.as_secs(), "idle stop scheduled");
        }
        scheduled
    }

    pub fn cancel_backend(&self, name: &str) -> bool {
        let canceled = self.inner.backends.cancel(&name.to_string());
        if canceled {
            tracing::debug!(backend = %name, "idle stop canceled");
        }
        canceled
    }

    /// After the debounce, arm a fleet-wide stop if nobody is connected.
    pub fn schedule_fleet_if_empty(&self) {
        let inner = self.inner.clone();
        self.inner
            .fleet_debounce
            .insert_if_absent((), move |id| async move {
                tokio::time::sleep(FLEET_DEBOUNCE).await;
                if inner.fleet_debounce.remove_if(&(), id) {
                    inner.arm_fleet();
                }
            });
    }

    pub fn cancel_fleet(&self) {
        self.inner.fleet_debounce.cancel(&());
        if self.inner.fleet.cancel(&()) {
            tracing::debug!("fleet stop canceled");
        }
    }

    pub fn shutdown(&self) {
        self.inner.backends.cancel_all();
        self.inner.fleet.cancel_all();
        self.inner.fleet_debounce.cancel_all();
    }
}

impl Inner {
    fn is_idle(&self, name: &str) -> bool {
        self.registry.is_known(name)
            && self.router.occupancy(name) == 0
            && !self.registry.is_hold_active(name)
    }

    async fn fire_backend(&self, name: String, id: TicketId) {
        if !self.backends.remove_if(&name, id) {
            return;
        }
        if !self.is_idle(&name) {
            tracing::debug!(backend = %name, "idle stop skipped, backend in use or held");
            return;
        }
        if !self.registry.is_running(&name) {
            self.health.mark_unhealthy(&name);
            return;
        }
        tracing::info!(backend = %name, "stopping idle backend");
        if let Err(e) = self.registry.stop(&name).await {
            tracing::warn!(backend = %name, "idle stop failed: {e}");
        }
        self.health.mark_unhealthy(&name);
    }

    fn arm_fleet(self: &Arc<Self>) {
        if self.router.connected_clients() > 0 {
            return;
        }
        let config = self.registry.config();
        let startup_grace = Duration::from_secs(config.startup_grace_seconds);
        let grace_active = self.registry.any_recently_started(startup_grace);
        let mut delay = Duration::from_secs(config.stop_grace_seconds);
        if grace_active {
            delay = delay.saturating_add(startup_grace);
        }

        let inner = self.clone();
        let armed = self.fleet.insert_if_absent((), move |id| async move {
            tokio::time::sleep(delay).await;
            inner.fire_fleet(id, grace_active, startup_grace).await;
        });
        if armed.is_some() {
            tracing::info!(
                delay_secs = delay.as_secs(),
                startup_grace = grace_active,
                "fleet empty, stop scheduled"
            );
        }
    }

    async fn fire_fleet(&self, id: TicketId, grace_active: bool, startup_grace: Duration) {
        if !self.fleet.remove_if(&(), id) {
            return;
        }
        if self.router.connected_clients() > 0 {
            return;
        }
        if grace_active && self.registry.any_recently_started(startup_grace) {
            tracing::info!("fleet stop skipped, a backend is still inside its startup grace");
            return;
        }

        let mut stops = tokio::task::JoinSet::new();
        for name in self.registry.names() {
            if !self.registry.is_running(&name) || self.registry.is_hold_active(&name) {
                continue;
            }
            tracing::info!(backend = %name, "fleet empty, stopping backend");
            let registry = self.registry.clone();
            let health = self.health.clone();
            stops.spawn(async move {
                if let Err(e) = registry.stop(&name).await {
                    tracing::warn!(backend = %name, "fleet stop failed: {e}");
                }
                health.mark_unhealthy(&name);
            });
        }
        while stops.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::hold::HoldDuration;
    use crate::router::TrackedRouter;

    const CONFIG: &str = r#"
startup_grace_seconds = 15
stop_grace_seconds = 60

[backends.lobby]
primary = true
command = "sh -c 'read line'"
address = "127.0.0.1:25566"

[backends.smp]
command = "sh -c 'read line'"
address = "127.0.0.1:25567"
"#;

    fn setup() -> (Arc<Registry>, Arc<TrackedRouter>, IdleScheduler) {
        let registry = Arc::new(Registry::new(parse_config(CONFIG).unwrap(), None));
        let router = Arc::new(TrackedRouter::new());
        let idle = IdleScheduler::new(
            registry.clone(),
            Arc::new(HealthCache::new()),
            router.clone(),
        );
        (registry, router, idle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_ticket_per_backend() {
        let (_registry, _router, idle) = setup();
        assert!(idle.schedule_if_empty("smp"));
        assert!(!idle.schedule_if_empty("smp"));
        assert!(idle.has_backend_ticket("smp"));
        assert!(idle.cancel_backend("smp"));
        assert!(!idle.has_backend_ticket("smp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_scheduled_when_occupied_held_or_unknown() {
        let (registry, router, idle) = setup();
        router.connected("alice", "smp");
        assert!(!idle.schedule_if_empty("smp"));

        registry.hold("lobby", HoldDuration::Forever).unwrap();
        assert!(!idle.schedule_if_empty("lobby"));

        assert!(!idle.schedule_if_empty("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_removes_ticket_even_when_skipped() {
        let (_registry, router, idle) = setup();
        assert!(idle.schedule_if_empty("smp"));
        router.connected("alice", "smp");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!idle.has_backend_ticket("smp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_debounce_then_ticket() {
        let (_registry, _router, idle) = setup();
        idle.schedule_fleet_if_empty();
        assert!(!idle.has_fleet_ticket());

        tokio::time::sleep(FLEET_DEBOUNCE + Duration::from_millis(10)).await;
        assert!(idle.has_fleet_ticket());

        idle.cancel_fleet();
        assert!(!idle.has_fleet_ticket());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_not_armed_with_clients() {
        let (_registry, router, idle) = setup();
        router.login("alice");
        idle.schedule_fleet_if_empty();
        tokio::time::sleep(FLEET_DEBOUNCE * 2).await;
        assert!(!idle.has_fleet_ticket());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (_registry, _router, idle) = setup();
        idle.schedule_if_empty("lobby");
        idle.schedule_if_empty("smp");
        idle.schedule_fleet_if_empty();
        idle.shutdown();
        assert!(!idle.has_backend_ticket("lobby"));
        assert!(!idle.has_backend_ticket("smp"));
        tokio::time::sleep(FLEET_DEBOUNCE * 2).await;
        assert!(!idle.has_fleet_ticket());
    }
}
