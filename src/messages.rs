use crate::protocol::BackendStatus;
use serde::{Deserialize, Serialize};

/// Every user-facing notice the orchestrator can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    StartingQueued,
    StartFailed,
    ReadySending,
    TimedOut,
    UnknownTarget,
    RestartWarning1m,
    RestartWarning5s,
    RestartingNow,
    NotPermitted,
    Banned,
}

/// Templates for each [`MessageKind`]. Placeholders: `{backend}`, `{client}`
/// and `{reason}`; `{server}` and `{player}` are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Messages {
    pub starting_queued: String,
    pub start_failed: String,
    pub ready_sending: String,
    pub timed_out: String,
    pub unknown_target: String,
    pub restart_warning_1m: String,
    pub restart_warning_5s: String,
    pub restarting_now: String,
    pub not_permitted: String,
    pub banned: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            starting_queued: "Starting {backend}... you'll be sent there automatically.".into(),
            start_failed: "Could not start {backend}. Please try again later.".into(),
            ready_sending: "{backend} is ready, sending you now.".into(),
            timed_out: "{backend} took too long to start. Please try again.".into(),
            unknown_target: "There is no server called {backend}.".into(),
            restart_warning_1m: "{backend} restarts in 1 minute.".into(),
            restart_warning_5s: "{backend} restarts in 5 seconds.".into(),
            restarting_now: "{backend} is restarting now.".into(),
            not_permitted: "You are not on the allow list.".into(),
            banned: "You are banned: {reason}".into(),
        }
    }
}

/// Status line shown to clients browsing the network, one per backend state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusLines {
    pub offline: String,
    pub starting: String,
    pub online: String,
}

impl Default for StatusLines {
    fn default() -> Self {
        Self {
            offline: "{backend} is asleep, join to wake it up".into(),
            starting: "{backend} is starting, please wait".into(),
            online: "{backend} is online".into(),
        }
    }
}

/// Per-host replacements for [`StatusLines`]; unset lines use the global ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusLineOverrides {
    pub offline: Option<String>,
    pub starting: Option<String>,
    pub online: Option<String>,
}

impl StatusLines {
    /// Template for `status`. A blank starting line falls back to the online
    /// line, then the offline one.
    pub fn template<'a>(
        &'a self,
        status: BackendStatus,
        overrides: Option<&'a StatusLineOverrides>,
    ) -> &'a str {
        let pick = |over: Option<&'a String>, base: &'a str| -> &'a str {
            over.map(String::as_str).unwrap_or(base)
        };
        let offline = pick(overrides.and_then(|o| o.offline.as_ref()), &self.offline);
        let online = pick(overrides.and_then(|o| o.online.as_ref()), &self.online);
        match status {
            BackendStatus::Online => online,
            BackendStatus::Starting => {
                let starting = pick(overrides.and_then(|o| o.starting.as_ref()), &self.starting);
                [starting, online, offline]
                    .into_iter()
                    .find(|line| !line.trim().is_empty())
                    .unwrap_or("")
            }
            BackendStatus::Offline | BackendStatus::Stopping => offline,
        }
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageContext<'a> {
    pub backend: Option<&'a str>,
    pub client: Option<&'a str>,
    pub reason: Option<&'a str>,
}

impl<'a> MessageContext<'a> {
    pub fn backend(backend: &'a str) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    pub fn with_client(mut self, client: &'a str) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_reason(mut self, reason: &'a str) -> Self {
        self.reason = Some(reason);
        self
    }
}

impl Messages {
    pub fn template(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::StartingQueued => &self.starting_queued,
            MessageKind::StartFailed => &self.start_failed,
            MessageKind::ReadySending => &self.ready_sending,
            MessageKind::TimedOut => &self.timed_out,
            MessageKind::UnknownTarget => &self.unknown_target,
            MessageKind::RestartWarning1m => &self.restart_warning_1m,
            MessageKind::RestartWarning5s => &self.restart_warning_5s,
            MessageKind::RestartingNow => &self.restarting_now,
            MessageKind::NotPermitted => &self.not_permitted,
            MessageKind::Banned => &self.banned,
        }
    }

    pub fn render(&self, kind: MessageKind, ctx: MessageContext<'_>) -> String {
        render_template(self.template(kind), ctx)
    }
}

/// Substitute placeholders. Unknown placeholders are left as written.
pub fn render_template(template: &str, ctx: MessageContext<'_>) -> String {
    let backend = ctx.backend.unwrap_or("");
    let client = ctx.client.unwrap_or("");
    let reason = ctx.reason.unwrap_or("");
    template
        .replace("{backend}", backend)
        .replace("{server}", backend)
        .replace("{client}", client)
        .replace("{player}", client)
        .replace("{reason}", reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_default_templates() {
        let messages = Messages::default();
        assert_eq!(
            messages.render(MessageKind::ReadySending, MessageContext::backend("smp")),
            "smp is ready, sending you now."
        );
        assert_eq!(
            messages.render(
                MessageKind::Banned,
                MessageContext::default().with_reason("griefing")
            ),
            "You are banned: griefing"
        );
    }

    #[test]
    fn test_render_aliases() {
        let ctx = MessageContext::backend("smp").with_client("alice");
        assert_eq!(
            render_template("{player} -> {server} ({client} -> {backend})", ctx),
            "alice -> smp (alice -> smp)"
        );
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        assert_eq!(
            render_template("{backend} {motd}", MessageContext::backend("lobby")),
            "lobby {motd}"
        );
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let messages: Messages = toml::from_str("timed_out = \"slow {backend}\"").unwrap();
        assert_eq!(messages.timed_out, "slow {backend}");
        assert_eq!(messages.banned, Messages::default().banned);
    }

    #[test]
    fn test_status_line_overrides() {
        let lines = StatusLines::default();
        assert_eq!(
            lines.template(BackendStatus::Stopping, None),
            "{backend} is asleep, join to wake it up"
        );

        let overrides = StatusLineOverrides {
            online: Some("SMP is up".to_string()),
            ..StatusLineOverrides::default()
        };
        assert_eq!(
            lines.template(BackendStatus::Online, Some(&overrides)),
            "SMP is up"
        );
        assert_eq!(
            lines.template(BackendStatus::Starting, Some(&overrides)),
            "{backend} is starting, please wait"
        );
    }

    #[test]
    fn test_blank_starting_line_falls_back() {
        let lines = StatusLines {
            starting: " ".to_string(),
            ..StatusLines::default()
        };
        assert_eq!(
            lines.template(BackendStatus::Starting, None),
            "{backend} is online"
        );

        let overrides = StatusLineOverrides {
            online: Some(String::new()),
            ..StatusLineOverrides::default()
        };
        assert_eq!(
            lines.template(BackendStatus::Starting, Some(&overrides)),
            "{backend} is asleep, join to wake it up"
        );
    }
}
