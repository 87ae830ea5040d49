use crate::messages::{MessageContext, MessageKind, Messages};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied { reason: String },
}

/// Decides whether a client may use the network at all.
pub trait AccessGate: Send + Sync {
    fn check(&self, client: &str) -> Access;
}

/// `[access]` table: optional allow list plus bans with a reason each.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessConfig {
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub bans: HashMap<String, String>,
}

/// Case-insensitive allow/ban lists.
#[derive(Debug, Clone, Default)]
pub struct ListGate {
    allow: Option<Vec<String>>,
    bans: HashMap<String, String>,
    messages: Messages,
}

impl ListGate {
    pub fn new(config: &AccessConfig, messages: &Messages) -> Self {
        Self {
            allow: config
                .allow
                .as_ref()
                .map(|names| names.iter().map(|n| n.to_lowercase()).collect()),
            bans: config
                .bans
                .iter()
                .map(|(name, reason)| (name.to_lowercase(), reason.clone()))
                .collect(),
            messages: messages.clone(),
        }
    }

    /// A gate that lets everyone in.
    pub fn open() -> Self {
        Self::default()
    }
}

impl AccessGate for ListGate {
    fn check(&self, client: &str) -> Access {
        let key = client.to_lowercase();
        let ctx = MessageContext::default().with_client(client);
        if let Some(reason) = self.bans.get(&key) {
            return Access::Denied {
                reason: self
                    .messages
                    .render(MessageKind::Banned, ctx.with_reason(reason)),
            };
        }
        if let Some(ref allow) = self.allow
            && !allow.contains(&key)
        {
            return Access::Denied {
                reason: self.messages.render(MessageKind::NotPermitted, ctx),
            };
        }
        Access::Allowed
    }
}
