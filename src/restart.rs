use crate::health::HealthCache;
use crate::messages::{MessageContext, MessageKind};
use crate::registry::Registry;
use crate::router::{Directive, Router};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

const WARN_LONG: Duration = Duration::from_secs(60);
const WARN_SHORT: Duration = Duration::from_secs(5);

struct Schedule {
    id: u64,
    restart_at: Instant,
    tickets: Vec<AbortHandle>,
}

impl Schedule {
    fn abort(self) {
        for ticket in self.tickets {
            ticket.abort();
        }
    }
}

/// Periodically restarts backends that are held forever, warning their
/// clients a minute and five seconds beforehand.
#[derive(Clone)]
pub struct RestartScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    health: Arc<HealthCache>,
    router: Arc<dyn Router>,
    next_id: AtomicU64,
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl RestartScheduler {
    pub fn new(registry: Arc<Registry>, health: Arc<HealthCache>, router: Arc<dyn Router>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                health,
                router,
                next_id: AtomicU64::new(1),
                schedules: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// When `name` will next be restarted, if a schedule exists.
    pub fn restart_at(&self, name: &str) -> Option<Instant> {
        self.inner.schedules().get(name).map(|s| s.restart_at)
    }

    /// Bring the schedule for `name` in line with its running and hold state.
    pub fn refresh(&self, name: &str) {
        let inner = &self.inner;
        let interval = inner
            .registry
            .backend_config(name)
            .and_then(|c| c.auto_restart_hold_minutes)
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)));
        let Some(interval) = interval.filter(|_| inner.is_eligible(name)) else {
            self.cancel(name);
            return;
        };

        let now = Instant::now();
        let mut schedules = inner.schedules();
        if schedules.get(name).is_some_and(|s| s.restart_at > now) {
            return;
        }
        let Some(restart_at) = now.checked_add(interval) else {
            tracing::warn!(backend = %name, "restart interval too large, not scheduling");
            return;
        };

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut tickets = Vec::with_capacity(3);
        if interval > WARN_LONG {
            let at = restart_at - WARN_LONG;
            tickets.push(inner.spawn_warning(name, id, at, MessageKind::RestartWarning1m));
        }
        if interval > WARN_SHORT {
            let at = restart_at - WARN_SHORT;
            tickets.push(inner.spawn_warning(name, id, at, MessageKind::RestartWarning5s));
        }
        let task_inner = inner.clone();
        let key = name.to_string();
        tickets.push(
            tokio::spawn(async move {
                tokio::time::sleep_until(restart_at).await;
                task_inner.fire_restart(&key, id).await;
            })
            .abort_handle(),
        );

        if let Some(previous) = schedules.insert(
            name.to_string(),
            Schedule {
                id,
                restart_at,
                tickets,
            },
        ) {
            previous.abort();
        }
        tracing::info!(
            backend = %name,
            interval_secs = interval.as_secs(),
            "auto-restart scheduled"
        );
    }

    pub fn cancel(&self, name: &str) {
        if let Some(schedule) = self.inner.schedules().remove(name) {
            schedule.abort();
            tracing::debug!(backend = %name, "auto-restart canceled");
        }
    }

    pub fn cancel_all(&self) {
        for (_, schedule) in self.inner.schedules().drain() {
            schedule.abort();
        }
    }
}

impl Inner {
    fn schedules(&self) -> std::sync::MutexGuard<'_, HashMap<String, Schedule>> {
        self.schedules.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A schedule may only exist while the backend runs under a forever hold.
    fn is_eligible(&self, name: &str) -> bool {
        self.registry.is_running(name) && self.registry.is_held_forever(name)
    }

    /// True if schedule `id` is still current and its backend still eligible.
    /// A stale or ineligible schedule is dropped.
    fn still_due(&self, name: &str, id: u64) -> bool {
        let eligible = self.is_eligible(name);
        let mut schedules = self.schedules();
        if !schedules.get(name).is_some_and(|s| s.id == id) {
            return false;
        }
        if !eligible {
            tracing::info!(
                backend = %name,
                "backend no longer held forever, dropping auto-restart"
            );
            if let Some(schedule) = schedules.remove(name) {
                schedule.abort();
            }
            return false;
        }
        true
    }

    fn spawn_warning(
        self: &Arc<Self>,
        name: &str,
        id: u64,
        at: Instant,
        kind: MessageKind,
    ) -> AbortHandle {
        let inner = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if inner.still_due(&name, id) {
                inner.broadcast(&name, kind);
            }
        })
        .abort_handle()
    }

    fn broadcast(&self, name: &str, kind: MessageKind) {
        let config = self.registry.config();
        for client in self.router.clients_on(name) {
            let text = config
                .messages
                .render(kind, MessageContext::backend(name).with_client(&client));
            self.router.send(Directive::Message { client, text });
        }
    }

    async fn fire_restart(&self, name: &str, id: u64) {
        let eligible = self.is_eligible(name);
        {
            let mut schedules = self.schedules();
            if !schedules.get(name).is_some_and(|s| s.id == id) {
                return;
            }
            schedules.remove(name);
        }
        if !eligible {
            tracing::info!(
                backend = %name,
                "backend no longer held forever, skipping auto-restart"
            );
            return;
        }

        tracing::info!(backend = %name, "auto-restarting held backend");
        self.broadcast(name, MessageKind::RestartingNow);
        if let Err(e) = self.registry.stop(name).await {
            tracing::warn!(backend = %name, "auto-restart stop failed: {e}");
        }
        self.health.mark_unhealthy(name);
        if let Err(e) = self.registry.start(name).await {
            tracing::error!(backend = %name, "auto-restart start failed: {e}");
        }
    }
}
