use crate::gate::AccessConfig;
use crate::messages::{Messages, StatusLineOverrides, StatusLines};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_KICK_MESSAGE: &str = "Server starting, reconnect in a moment";
pub const DEFAULT_STARTUP_GRACE_SECS: u64 = 15;
pub const DEFAULT_STOP_GRACE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub command: String,
    pub address: String,
    pub primary: bool,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub stop_command: Option<String>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u64>,
    pub health_check: Option<String>,
    pub log_file: Option<String>,
    pub log_date_format: Option<String>,
    pub auto_restart_hold_minutes: Option<u64>,
}

impl BackendConfig {
    pub fn new(command: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            address: address.into(),
            primary: false,
            cwd: None,
            env: None,
            stop_command: None,
            stop_signal: None,
            stop_timeout: None,
            health_check: None,
            log_file: None,
            log_date_format: None,
            auto_restart_hold_minutes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForcedHost {
    pub backend: String,
    pub kick_message: Option<String>,
    #[serde(default)]
    pub status_lines: Option<StatusLineOverrides>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub kick_message: String,
    pub startup_grace_seconds: u64,
    pub stop_grace_seconds: u64,
    pub backends: BTreeMap<String, BackendConfig>,
    /// Keyed by normalized host name.
    pub forced_hosts: HashMap<String, ForcedHost>,
    pub messages: Messages,
    pub status_lines: StatusLines,
    pub access: AccessConfig,
}

impl Config {
    /// The backend new clients land on. Validation guarantees exactly one.
    pub fn primary(&self) -> Option<&str> {
        self.backends
            .iter()
            .find(|(_, b)| b.primary)
            .map(|(name, _)| name.as_str())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    pub fn forced_host(&self, raw_host: &str) -> Option<&ForcedHost> {
        let host = normalize_host(raw_host)?;
        self.forced_hosts.get(&host)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    kick_message: Option<String>,
    startup_grace_seconds: Option<u64>,
    stop_grace_seconds: Option<u64>,
    #[serde(default)]
    backends: HashMap<String, toml::Value>,
    #[serde(default)]
    forced_hosts: HashMap<String, ForcedHost>,
    #[serde(default)]
    messages: Messages,
    #[serde(default)]
    status_lines: StatusLines,
    #[serde(default)]
    access: AccessConfig,
}

#[derive(Debug, Deserialize)]
struct RawBackendConfig {
    command: String,
    address: String,
    #[serde(default)]
    primary: bool,
    cwd: Option<String>,
    env: Option<HashMap<String, String>>,
    stop_command: Option<String>,
    stop_signal: Option<String>,
    stop_timeout: Option<u64>,
    health_check: Option<String>,
    log_file: Option<String>,
    log_date_format: Option<String>,
    auto_restart_hold_minutes: Option<u64>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file is empty")]
    Empty,
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("unknown field `{field}` in backend `{backend}`")]
    UnknownField { backend: String, field: String },
    #[error("define at least one backend under [backends]")]
    NoBackends,
    #[error("exactly one backend must set `primary = true` (found {0})")]
    PrimaryCount(usize),
    #[error("forced host `{host}` points at unknown backend `{backend}`")]
    UnknownForcedHostBackend { host: String, backend: String },
    #[error("invalid forced host `{0}`")]
    InvalidHost(String),
    #[error("{0}")]
    IoError(String),
}

pub fn load_config(path: &std::path::Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let raw: RawConfig =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    let mut backends = BTreeMap::new();
    for (name, value) in raw.backends {
        let backend: RawBackendConfig = value
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::TomlParse(e.to_string()))?;

        if let Some(field) = backend.extra.keys().min() {
            return Err(ConfigError::UnknownField {
                backend: name,
                field: field.clone(),
            });
        }

        backends.insert(
            name,
            BackendConfig {
                command: backend.command,
                address: backend.address,
                primary: backend.primary,
                cwd: backend.cwd,
                env: backend.env,
                stop_command: backend.stop_command,
                stop_signal: backend.stop_signal,
                stop_timeout: backend.stop_timeout,
                health_check: backend.health_check,
                log_file: backend.log_file,
                log_date_format: backend.log_date_format,
                auto_restart_hold_minutes: backend.auto_restart_hold_minutes,
            },
        );
    }

    if backends.is_empty() {
        return Err(ConfigError::NoBackends);
    }

    let primaries = backends.values().filter(|b| b.primary).count();
    if primaries != 1 {
        return Err(ConfigError::PrimaryCount(primaries));
    }

    let mut forced_hosts = HashMap::new();
    for (host, forced) in raw.forced_hosts {
        if !backends.contains_key(&forced.backend) {
            return Err(ConfigError::UnknownForcedHostBackend {
                host,
                backend: forced.backend,
            });
        }
        let Some(normalized) = normalize_host(&host) else {
            return Err(ConfigError::InvalidHost(host));
        };
        forced_hosts.insert(normalized, forced);
    }

    Ok(Config {
        kick_message: raw
            .kick_message
            .unwrap_or_else(|| DEFAULT_KICK_MESSAGE.to_string()),
        startup_grace_seconds: raw
            .startup_grace_seconds
            .unwrap_or(DEFAULT_STARTUP_GRACE_SECS),
        stop_grace_seconds: raw.stop_grace_seconds.unwrap_or(DEFAULT_STOP_GRACE_SECS),
        backends,
        forced_hosts,
        messages: raw.messages,
        status_lines: raw.status_lines,
        access: raw.access,
    })
}

/// Reduce a client-supplied virtual host to a bare lowercase host name.
///
/// Routers forward the handshake host verbatim, which may carry a port, a
/// trailing dot, a path, or NUL-separated forwarding data.
pub fn normalize_host(host: &str) -> Option<String> {
    let mut value = host.trim();
    if let Some(idx) = value.find('\0') {
        value = &value[..idx];
    }
    if let Some(idx) = value.find('/') {
        value = &value[..idx];
    }
    value = value.trim();
    if let Some(idx) = value.find(':') {
        value = &value[..idx];
    }
    let value = value.strip_suffix('.').unwrap_or(value);
    if value.is_empty() {
        return None;
    }
    Some(value.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
[backends.lobby]
primary = true
command = "./start.sh"
address = "127.0.0.1:25566"
"#;

    #[test]
    fn test_valid_toml_parses() {
        let input = r#"
kick_message = "Booting"
startup_grace_seconds = 5
stop_grace_seconds = 30

[backends.lobby]
primary = true
command = "java -jar paper.jar nogui"
address = "127.0.0.1:25566"
cwd = "../lobby"
env = { JAVA_HOME = "/opt/jdk" }
stop_command = "stop"
stop_timeout = 10
health_check = "tcp://127.0.0.1:25566"
log_file = "logs/managed.log"
log_date_format = "%H:%M:%S"
auto_restart_hold_minutes = 360

[backends.smp]
command = "./start.sh"
address = "127.0.0.1:25567"
stop_signal = "SIGINT"

[forced_hosts."SMP.Example.com."]
backend = "smp"
kick_message = "SMP is waking up"

[forced_hosts."SMP.Example.com.".status_lines]
online = "SMP is open"

[messages]
timed_out = "{backend} is slow today"

[status_lines]
offline = "{backend} sleeps"

[access]
allow = ["alice"]

[access.bans]
mallory = "griefing"
"#;
        let config = parse_config(input).unwrap();
        assert_eq!(config.kick_message, "Booting");
        assert_eq!(config.startup_grace_seconds, 5);
        assert_eq!(config.stop_grace_seconds, 30);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.primary(), Some("lobby"));

        let lobby = config.backend("lobby").unwrap();
        assert_eq!(lobby.command, "java -jar paper.jar nogui");
        assert_eq!(lobby.cwd.as_deref(), Some("../lobby"));
        assert_eq!(
            lobby.env.as_ref().unwrap().get("JAVA_HOME").unwrap(),
            "/opt/jdk"
        );
        assert_eq!(lobby.stop_command.as_deref(), Some("stop"));
        assert_eq!(lobby.stop_timeout, Some(10));
        assert_eq!(lobby.health_check.as_deref(), Some("tcp://127.0.0.1:25566"));
        assert_eq!(lobby.log_file.as_deref(), Some("logs/managed.log"));
        assert_eq!(lobby.log_date_format.as_deref(), Some("%H:%M:%S"));
        assert_eq!(lobby.auto_restart_hold_minutes, Some(360));

        let smp = config.backend("smp").unwrap();
        assert!(!smp.primary);
        assert_eq!(smp.stop_signal.as_deref(), Some("SIGINT"));

        let forced = config.forced_host("smp.example.com:25565").unwrap();
        assert_eq!(forced.backend, "smp");
        assert_eq!(forced.kick_message.as_deref(), Some("SMP is waking up"));
        let overrides = forced.status_lines.as_ref().unwrap();
        assert_eq!(overrides.online.as_deref(), Some("SMP is open"));
        assert!(overrides.offline.is_none());
        assert_eq!(config.status_lines.offline, "{backend} sleeps");
        assert_eq!(config.status_lines.online, StatusLines::default().online);

        assert_eq!(config.messages.timed_out, "{backend} is slow today");
        assert_eq!(config.access.allow, Some(vec!["alice".to_string()]));
        assert_eq!(config.access.bans.get("mallory").unwrap(), "griefing");
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.kick_message, DEFAULT_KICK_MESSAGE);
        assert_eq!(config.startup_grace_seconds, DEFAULT_STARTUP_GRACE_SECS);
        assert_eq!(config.stop_grace_seconds, DEFAULT_STOP_GRACE_SECS);
        assert!(config.forced_hosts.is_empty());
        assert_eq!(config.messages, Messages::default());
        assert_eq!(config.status_lines, StatusLines::default());
        assert!(config.access.allow.is_none());

        let lobby = config.backend("lobby").unwrap();
        assert!(lobby.cwd.is_none());
        assert!(lobby.stop_command.is_none());
        assert!(lobby.auto_restart_hold_minutes.is_none());
    }

    #[test]
    fn test_empty_file_errors() {
        assert_eq!(parse_config("").unwrap_err(), ConfigError::Empty);
        assert_eq!(parse_config("  \n").unwrap_err(), ConfigError::Empty);
    }

    #[test]
    fn test_no_backends_errors() {
        let result = parse_config("stop_grace_seconds = 10\n");
        assert_eq!(result.unwrap_err(), ConfigError::NoBackends);
    }

    #[test]
    fn test_missing_command_errors() {
        let input = r#"
[backends.lobby]
primary = true
address = "127.0.0.1:25566"
"#;
        assert!(matches!(
            parse_config(input).unwrap_err(),
            ConfigError::TomlParse(_)
        ));
    }

    #[test]
    fn test_unknown_backend_field_errors() {
        let input = r#"
[backends.lobby]
primary = true
command = "./start.sh"
address = "127.0.0.1:25566"
bogus_field = "x"
"#;
        assert_eq!(
            parse_config(input).unwrap_err(),
            ConfigError::UnknownField {
                backend: "lobby".to_string(),
                field: "bogus_field".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_top_level_field_errors() {
        let input = format!("bogus = 1\n{MINIMAL}");
        assert!(matches!(
            parse_config(&input).unwrap_err(),
            ConfigError::TomlParse(_)
        ));
    }

    #[test]
    fn test_primary_required() {
        let input = r#"
[backends.lobby]
command = "./start.sh"
address = "127.0.0.1:25566"
"#;
        assert_eq!(parse_config(input).unwrap_err(), ConfigError::PrimaryCount(0));
    }

    #[test]
    fn test_two_primaries_rejected() {
        let input = r#"
[backends.lobby]
primary = true
command = "./start.sh"
address = "127.0.0.1:25566"

[backends.hub]
primary = true
command = "./start.sh"
address = "127.0.0.1:25567"
"#;
        assert_eq!(parse_config(input).unwrap_err(), ConfigError::PrimaryCount(2));
    }

    #[test]
    fn test_forced_host_unknown_backend() {
        let input = format!("{MINIMAL}\n[forced_hosts.\"a.example.com\"]\nbackend = \"nope\"\n");
        assert_eq!(
            parse_config(&input).unwrap_err(),
            ConfigError::UnknownForcedHostBackend {
                host: "a.example.com".to_string(),
                backend: "nope".to_string(),
            }
        );
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Play.Example.COM").as_deref(), Some("play.example.com"));
        assert_eq!(normalize_host("play.example.com:25565").as_deref(), Some("play.example.com"));
        assert_eq!(normalize_host("play.example.com.").as_deref(), Some("play.example.com"));
        assert_eq!(
            normalize_host("play.example.com\0FML2\0").as_deref(),
            Some("play.example.com")
        );
        assert_eq!(normalize_host(" play.example.com/x ").as_deref(), Some("play.example.com"));
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host(":25565"), None);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lazyhost.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.primary(), Some("lobby"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempdir().unwrap();
        let result = load_config(&dir.path().join("missing.toml"));
        assert!(matches!(result.unwrap_err(), ConfigError::IoError(_)));
    }
}
