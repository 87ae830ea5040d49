use crate::config::{BackendConfig, Config};
use crate::hold::{HoldDuration, HoldEntry};
use crate::process::{ProcessError, StartOutcome, StopOutcome, Supervisor};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("backend {backend}: {source}")]
    Process {
        backend: String,
        #[source]
        source: ProcessError,
    },
}

/// Names added, removed, and kept by a reload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub kept: Vec<String>,
}

/// Point-in-time view of one backend's runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSnapshot {
    pub name: String,
    pub primary: bool,
    pub running: bool,
    pub starting: bool,
    pub stopping: bool,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub hold: Option<HoldDuration>,
}

/// Every configured backend, its supervisor, and its hold.
pub struct Registry {
    config: RwLock<Arc<Config>>,
    supervisors: RwLock<BTreeMap<String, Arc<Supervisor>>>,
    holds: Mutex<HashMap<String, HoldEntry>>,
    holds_file: Option<PathBuf>,
}

impl Registry {
    /// Build supervisors for `config`. Forever holds found in `holds_file`
    /// are restored for names that are still configured.
    pub fn new(config: Config, holds_file: Option<PathBuf>) -> Self {
        let supervisors = config
            .backends
            .iter()
            .map(|(name, backend)| {
                (
                    name.clone(),
                    Arc::new(Supervisor::new(name.clone(), backend.clone())),
                )
            })
            .collect();

        let mut holds = HashMap::new();
        if let Some(ref path) = holds_file {
            for name in load_forever_holds(path) {
                if config.backends.contains_key(&name) {
                    tracing::info!(backend = %name, "restored hold: forever");
                    holds.insert(name, HoldEntry::Forever);
                } else {
                    tracing::warn!(backend = %name, "dropping persisted hold for unknown backend");
                }
            }
        }

        Self {
            config: RwLock::new(Arc::new(config)),
            supervisors: RwLock::new(supervisors),
            holds: Mutex::new(holds),
            holds_file,
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn supervisors(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Supervisor>>> {
        self.supervisors.read().unwrap_or_else(|e| e.into_inner())
    }

    fn holds(&self) -> std::sync::MutexGuard<'_, HashMap<String, HoldEntry>> {
        self.holds.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn supervisor(&self, name: &str) -> Result<Arc<Supervisor>, RegistryError> {
        self.supervisors()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.supervisors().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.supervisors().keys().cloned().collect()
    }

    pub fn primary(&self) -> Option<String> {
        self.config().primary().map(str::to_string)
    }

    pub fn backend_config(&self, name: &str) -> Option<BackendConfig> {
        self.supervisors().get(name).map(|s| s.config())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.supervisors()
            .get(name)
            .is_some_and(|s| s.is_running())
    }

    pub fn is_any_running(&self) -> bool {
        self.supervisors().values().any(|s| s.is_running())
    }

    pub fn any_recently_started(&self, window: Duration) -> bool {
        self.supervisors()
            .values()
            .any(|s| s.recently_started(window))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn start(&self, name: &str) -> Result<StartOutcome, RegistryError> {
        let supervisor = self.supervisor(name)?;
        supervisor
            .start()
            .await
            .map_err(|source| RegistryError::Process {
                backend: name.to_string(),
                source,
            })
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome, RegistryError> {
        let supervisor = self.supervisor(name)?;
        Ok(supervisor.stop_gracefully().await)
    }

    pub async fn send_command(&self, name: &str, line: &str) -> Result<(), RegistryError> {
        let supervisor = self.supervisor(name)?;
        supervisor
            .send_command(line)
            .await
            .map_err(|source| RegistryError::Process {
                backend: name.to_string(),
                source,
            })
    }

    /// Stop every backend concurrently and wait for all of them.
    pub async fn stop_all(&self) {
        let supervisors: Vec<_> = self.supervisors().values().cloned().collect();
        let mut tasks = tokio::task::JoinSet::new();
        for supervisor in supervisors {
            tasks.spawn(async move { supervisor.stop_gracefully().await });
        }
        while tasks.join_next().await.is_some() {}
    }

    // -----------------------------------------------------------------------
    // Holds
    // -----------------------------------------------------------------------

    /// Keep `name` running for `duration`. `Seconds(0)` clears the hold.
    pub fn hold(&self, name: &str, duration: HoldDuration) -> Result<(), RegistryError> {
        if !self.is_known(name) {
            return Err(RegistryError::UnknownBackend(name.to_string()));
        }
        let mut holds = self.holds();
        match HoldEntry::from_duration(Instant::now(), duration) {
            Some(entry) => {
                holds.insert(name.to_string(), entry);
            }
            None => {
                holds.remove(name);
            }
        }
        self.persist_locked(&holds);
        Ok(())
    }

    /// Returns whether a hold was present.
    pub fn clear_hold(&self, name: &str) -> bool {
        let mut holds = self.holds();
        let removed = holds.remove(name);
        if removed.is_some() {
            self.persist_locked(&holds);
        }
        removed.is_some_and(|entry| entry.is_active(Instant::now()))
    }

    pub fn is_hold_active(&self, name: &str) -> bool {
        self.hold_remaining(name).is_some()
    }

    pub fn is_held_forever(&self, name: &str) -> bool {
        self.hold_remaining(name) == Some(HoldDuration::Forever)
    }

    pub fn hold_remaining(&self, name: &str) -> Option<HoldDuration> {
        let now = Instant::now();
        let mut holds = self.holds();
        let entry = *holds.get(name)?;
        match entry.remaining(now) {
            Some(left) => Some(left),
            None => {
                holds.remove(name);
                None
            }
        }
    }

    fn persist_locked(&self, holds: &HashMap<String, HoldEntry>) {
        let Some(ref path) = self.holds_file else {
            return;
        };
        let mut names: Vec<&str> = holds
            .iter()
            .filter(|(_, entry)| matches!(entry, HoldEntry::Forever))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_by_key(|name| name.to_lowercase());
        if let Err(e) = save_forever_holds(path, &names) {
            tracing::warn!(path = %path.display(), "could not persist holds: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Status and reload
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let supervisors: Vec<_> = self.supervisors().values().cloned().collect();
        supervisors
            .into_iter()
            .map(|s| BackendSnapshot {
                name: s.name().to_string(),
                primary: s.config().primary,
                running: s.is_running(),
                starting: s.is_starting(),
                stopping: s.is_stopping(),
                pid: s.pid(),
                uptime: s.uptime(),
                hold: self.hold_remaining(s.name()),
            })
            .collect()
    }

    /// Apply a new configuration without disturbing backends that remain.
    pub async fn reload(&self, new_config: Config) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut removed = Vec::new();
        {
            let mut supervisors = self.supervisors.write().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<String> = supervisors
                .keys()
                .filter(|name| !new_config.backends.contains_key(*name))
                .cloned()
                .collect();
            for name in stale {
                if let Some(supervisor) = supervisors.remove(&name) {
                    removed.push(supervisor);
                }
                summary.removed.push(name);
            }

            for (name, backend) in &new_config.backends {
                match supervisors.get(name) {
                    Some(existing) => {
                        existing.replace_config(backend.clone());
                        summary.kept.push(name.clone());
                    }
                    None => {
                        supervisors.insert(
                            name.clone(),
                            Arc::new(Supervisor::new(name.clone(), backend.clone())),
                        );
                        summary.added.push(name.clone());
                    }
                }
            }
        }

        {
            let mut holds = self.holds();
            holds.retain(|name, _| new_config.backends.contains_key(name));
            self.persist_locked(&holds);
        }
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(new_config);

        for supervisor in removed {
            tracing::info!(backend = %supervisor.name(), "backend removed from config, stopping");
            supervisor.stop_gracefully().await;
        }

        tracing::info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            kept = summary.kept.len(),
            "configuration reloaded"
        );
        summary
    }
}

// ---------------------------------------------------------------------------
// holds.txt
// ---------------------------------------------------------------------------

pub fn load_forever_holds(path: &Path) -> Vec<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "could not read holds: {e}");
            return Vec::new();
        }
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn save_forever_holds(path: &Path, names: &[&str]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = String::from("# backends held forever, one per line\n");
    for name in names {
        content.push_str(name);
        content.push('\n');
    }
    std::fs::write(path, content)
}
