use crate::config::Config;
use crate::gate::{Access, AccessGate};
use crate::health::{HealthCache, HealthProbe};
use crate::hold::HoldDuration;
use crate::idle::IdleScheduler;
use crate::messages::{MessageContext, MessageKind};
use crate::process::{StartOutcome, StopOutcome};
use crate::protocol::{BackendInfo, BackendStatus, Decision, PingReply};
use crate::registry::{Registry, RegistryError, ReloadSummary};
use crate::restart::RestartScheduler;
use crate::router::{Directive, Router};
use crate::wait::WaitManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

pub const SWEEP_WARMUP: Duration = Duration::from_secs(1);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Where a connect request should go, and what to tell the client while it boots.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Resolved {
    backend: String,
    kick_message: Option<String>,
}

/// Turns router events and operator commands into backend lifecycle actions.
pub struct Orchestrator {
    registry: Arc<Registry>,
    health: Arc<HealthCache>,
    router: Arc<dyn Router>,
    probe: Arc<dyn HealthProbe>,
    gate: RwLock<Arc<dyn AccessGate>>,
    idle: IdleScheduler,
    restart: RestartScheduler,
    waits: WaitManager,
    /// Last backend each client was seen on.
    last_known: Mutex<HashMap<String, String>>,
    sweep: Mutex<Option<AbortHandle>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<dyn Router>,
        probe: Arc<dyn HealthProbe>,
        gate: Arc<dyn AccessGate>,
    ) -> Arc<Self> {
        let health = Arc::new(HealthCache::new());
        let idle = IdleScheduler::new(registry.clone(), health.clone(), router.clone());
        let restart = RestartScheduler::new(registry.clone(), health.clone(), router.clone());
        let waits = WaitManager::new(
            registry.clone(),
            health.clone(),
            router.clone(),
            probe.clone(),
            idle.clone(),
        );
        Arc::new(Self {
            registry,
            health,
            router,
            probe,
            gate: RwLock::new(gate),
            idle,
            restart,
            waits,
            last_known: Mutex::new(HashMap::new()),
            sweep: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthCache> {
        &self.health
    }

    pub fn idle(&self) -> &IdleScheduler {
        &self.idle
    }

    pub fn restart(&self) -> &RestartScheduler {
        &self.restart
    }

    pub fn waits(&self) -> &WaitManager {
        &self.waits
    }

    pub fn set_gate(&self, gate: Arc<dyn AccessGate>) {
        *self.gate.write().unwrap_or_else(|e| e.into_inner()) = gate;
    }

    fn gate(&self) -> Arc<dyn AccessGate> {
        self.gate.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn last_known(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.last_known.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn render(&self, kind: MessageKind, backend: &str, client: &str) -> String {
        self.registry
            .config()
            .messages
            .render(kind, MessageContext::backend(backend).with_client(client))
    }

    fn tell(&self, client: &str, text: String) {
        self.router.send(Directive::Message {
            client: client.to_string(),
            text,
        });
    }

    // -----------------------------------------------------------------------
    // Health sweep
    // -----------------------------------------------------------------------

    /// Begin the periodic health sweep. Calling it again restarts the loop.
    pub fn start_sweep(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(SWEEP_WARMUP).await;
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.sweep_once();
            }
        })
        .abort_handle();

        if let Some(previous) = self
            .sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
    }

    /// One pass over every backend: restart schedule, idle stop, probe.
    pub fn sweep_once(&self) {
        for name in self.registry.names() {
            self.restart.refresh(&name);

            if !self.registry.is_running(&name) {
                self.health.mark_unhealthy(&name);
                continue;
            }
            if self.router.occupancy(&name) == 0 && !self.registry.is_hold_active(&name) {
                self.idle.schedule_if_empty(&name);
            }

            let Some(config) = self.registry.backend_config(&name) else {
                continue;
            };
            let probe = self.probe.clone();
            let health = self.health.clone();
            tokio::spawn(async move {
                match probe.probe(&name, &config).await {
                    Ok(()) => health.mark_healthy(&name),
                    Err(e) => {
                        tracing::debug!(backend = %name, "health probe failed: {e}");
                        health.mark_unhealthy(&name);
                    }
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Router events
    // -----------------------------------------------------------------------

    /// A client joined the network.
    pub fn on_login(&self, client: &str) -> Access {
        self.idle.cancel_fleet();
        self.waits.cancel(client);
        let access = self.gate().check(client);
        if let Access::Denied { ref reason } = access {
            tracing::info!(client = %client, %reason, "login denied");
        }
        access
    }

    fn resolve(
        &self,
        config: &Config,
        target: Option<&str>,
        virtual_host: Option<&str>,
    ) -> Option<Resolved> {
        let forced = virtual_host.and_then(|host| config.forced_host(host));
        if let Some(target) = target {
            let kick_message = forced
                .filter(|f| f.backend == target)
                .and_then(|f| f.kick_message.clone());
            return Some(Resolved {
                backend: target.to_string(),
                kick_message,
            });
        }
        if let Some(forced) = forced {
            return Some(Resolved {
                backend: forced.backend.clone(),
                kick_message: forced.kick_message.clone(),
            });
        }
        config.primary().map(|primary| Resolved {
            backend: primary.to_string(),
            kick_message: None,
        })
    }

    /// Deny `client`: as a chat message if it is on a backend, else as the
    /// disconnect reason.
    fn deny(&self, client: &str, text: String) -> Decision {
        if self.router.current_backend(client).is_some() {
            self.tell(client, text);
            Decision::Deny { reason: None }
        } else {
            Decision::Deny { reason: Some(text) }
        }
    }

    /// What a client listing the network through `virtual_host` is shown.
    ///
    /// Resolves the host like a connect would, but starts nothing.
    pub fn ping(&self, virtual_host: Option<&str>) -> PingReply {
        let config = self.registry.config();
        let overrides = virtual_host
            .and_then(|host| config.forced_host(host))
            .and_then(|forced| forced.status_lines.as_ref());
        let backend = self
            .resolve(&config, None, virtual_host)
            .map(|r| r.backend)
            .filter(|name| self.registry.is_known(name));
        let status = match backend.as_deref() {
            Some(name) => {
                let stopping = self
                    .registry
                    .supervisor(name)
                    .is_ok_and(|s| s.is_stopping());
                BackendStatus::derive(
                    self.registry.is_running(name),
                    stopping,
                    self.health.get(name),
                )
            }
            None => BackendStatus::Offline,
        };
        let template = config.status_lines.template(status, overrides);
        let text = crate::messages::render_template(
            template,
            MessageContext::backend(backend.as_deref().unwrap_or("")),
        );
        PingReply {
            backend,
            status,
            text,
        }
    }

    /// A client wants to join a backend.
    pub async fn on_pre_connect(
        &self,
        client: &str,
        target: Option<&str>,
        virtual_host: Option<&str>,
    ) -> Decision {
        let config = self.registry.config();
        let Some(resolved) = self.resolve(&config, target, virtual_host) else {
            return self.deny(client, self.render(MessageKind::UnknownTarget, "", client));
        };
        let backend = resolved.backend.as_str();

        if !self.registry.is_known(backend) {
            tracing::info!(client = %client, backend = %backend, "connect to unknown backend");
            return self.deny(client, self.render(MessageKind::UnknownTarget, backend, client));
        }

        if let Access::Denied { reason } = self.gate().check(client) {
            tracing::info!(client = %client, backend = %backend, %reason, "connect denied by gate");
            return self.deny(client, reason);
        }

        if self.registry.is_running(backend) && self.health.is_healthy(backend) {
            return Decision::Allow {
                backend: backend.to_string(),
            };
        }

        if self.router.current_backend(client).is_none() {
            return self.start_for_new_client(client, backend, resolved.kick_message, &config).await;
        }

        if self.waits.target_of(client).as_deref() == Some(backend) {
            return Decision::Deny { reason: None };
        }

        match self.registry.start(backend).await {
            Ok(outcome) => {
                if outcome == StartOutcome::Started {
                    self.health.mark_unhealthy(backend);
                }
                self.tell(client, self.render(MessageKind::StartingQueued, backend, client));
                self.waits.begin(client, backend);
            }
            Err(e) => {
                tracing::error!(backend = %backend, client = %client, "start failed: {e}");
                self.tell(client, self.render(MessageKind::StartFailed, backend, client));
            }
        }
        Decision::Deny { reason: None }
    }

    async fn start_for_new_client(
        &self,
        client: &str,
        backend: &str,
        kick_message: Option<String>,
        config: &Config,
    ) -> Decision {
        let reason = match self.registry.start(backend).await {
            Ok(outcome) => {
                if outcome == StartOutcome::Started {
                    self.health.mark_unhealthy(backend);
                }
                let template = kick_message.unwrap_or_else(|| config.kick_message.clone());
                crate::messages::render_template(
                    &template,
                    MessageContext::backend(backend).with_client(client),
                )
            }
            Err(e) => {
                tracing::error!(backend = %backend, client = %client, "start failed: {e}");
                self.render(MessageKind::StartFailed, backend, client)
            }
        };
        self.router.send(Directive::Disconnect {
            client: client.to_string(),
            reason: reason.clone(),
        });
        self.idle.schedule_fleet_if_empty();
        Decision::Deny {
            reason: Some(reason),
        }
    }

    /// A client finished switching onto `backend`.
    pub fn on_connected(&self, client: &str, backend: &str, previous: Option<&str>) {
        self.idle.cancel_fleet();
        self.idle.cancel_backend(backend);
        self.last_known()
            .insert(client.to_string(), backend.to_string());
        if let Some(previous) = previous
            && previous != backend
        {
            self.idle.schedule_if_empty(previous);
        }
    }

    /// A client left the network.
    pub fn on_disconnect(&self, client: &str, backend: Option<&str>) {
        self.waits.cancel(client);
        if let Some(backend) = backend {
            self.idle.schedule_if_empty(backend);
        }
        let last = self.last_known().remove(client);
        if let Some(last) = last
            && Some(last.as_str()) != backend
        {
            self.idle.schedule_if_empty(&last);
        }
        self.idle.schedule_fleet_if_empty();
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    pub async fn start(&self, name: &str) -> Result<StartOutcome, RegistryError> {
        let outcome = self.registry.start(name).await?;
        if outcome == StartOutcome::Started {
            self.health.mark_unhealthy(name);
        }
        Ok(outcome)
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome, RegistryError> {
        if !self.registry.is_known(name) {
            return Err(RegistryError::UnknownBackend(name.to_string()));
        }
        self.restart.cancel(name);
        self.idle.cancel_backend(name);
        let outcome = self.registry.stop(name).await?;
        self.health.mark_unhealthy(name);
        Ok(outcome)
    }

    pub fn hold(&self, name: &str, duration: HoldDuration) -> Result<(), RegistryError> {
        if duration == HoldDuration::Seconds(0) {
            self.clear_hold(name)?;
            return Ok(());
        }
        self.registry.hold(name, duration)?;
        self.idle.cancel_backend(name);
        tracing::info!(backend = %name, hold = %duration, "hold set");
        self.restart.refresh(name);
        Ok(())
    }

    /// Returns whether a hold was removed.
    pub fn clear_hold(&self, name: &str) -> Result<bool, RegistryError> {
        if !self.registry.is_known(name) {
            return Err(RegistryError::UnknownBackend(name.to_string()));
        }
        let cleared = self.registry.clear_hold(name);
        self.restart.cancel(name);
        if self.registry.is_running(name) {
            self.idle.schedule_if_empty(name);
        }
        tracing::info!(backend = %name, cleared, "hold cleared");
        Ok(cleared)
    }

    pub async fn send_command(&self, name: &str, line: &str) -> Result<(), RegistryError> {
        self.registry.send_command(name, line).await
    }

    pub fn status(&self) -> Vec<BackendInfo> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|snap| BackendInfo {
                status: BackendStatus::derive(
                    snap.running,
                    snap.stopping,
                    self.health.get(&snap.name),
                ),
                primary: snap.primary,
                pid: snap.pid,
                uptime: snap.uptime.map(|d| d.as_secs()),
                clients: self.router.occupancy(&snap.name),
                hold: snap.hold,
                idle_stop_pending: self.idle.has_backend_ticket(&snap.name),
                name: snap.name,
            })
            .collect()
    }

    pub async fn reload(&self, config: Config) -> ReloadSummary {
        let summary = self.registry.reload(config).await;
        for name in &summary.removed {
            self.idle.cancel_backend(name);
            self.restart.cancel(name);
            self.health.forget(name);
        }
        for name in &summary.kept {
            self.restart.refresh(name);
        }
        summary
    }

    /// Cancel every timer and stop every backend.
    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.idle.shutdown();
        self.restart.cancel_all();
        self.waits.cancel_all();
        self.registry.stop_all().await;
        tracing::info!("all backends stopped");
    }
}
