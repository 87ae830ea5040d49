use crate::health::Health;
use crate::hold::HoldDuration;
use crate::router::Directive;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    // operator
    Status,
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Hold {
        name: String,
        /// `30m`, `2h`, `forever`, `clear`; absent means forever.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
    },
    Send {
        name: String,
        line: String,
    },
    Reload,
    Kill,

    // router
    Login {
        client: String,
    },
    Connect {
        client: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        virtual_host: Option<String>,
    },
    Connected {
        client: String,
        backend: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<String>,
    },
    Disconnect {
        client: String,
    },
    /// A client is listing the network; no login happens.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        virtual_host: Option<String>,
    },
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    BackendList {
        backends: Vec<BackendInfo>,
    },
    Decision {
        decision: Decision,
    },
    Directive {
        directive: Directive,
    },
    Ping {
        ping: PingReply,
    },
}

/// State of the backend a virtual host leads to, and the line to show for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub status: BackendStatus,
    pub text: String,
}

/// Answer to a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Decision {
    Allow {
        backend: String,
    },
    Deny {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Offline,
    Starting,
    Online,
    Stopping,
}

impl BackendStatus {
    pub fn derive(running: bool, stopping: bool, health: Health) -> Self {
        match (running, stopping, health) {
            (false, _, _) => BackendStatus::Offline,
            (true, true, _) => BackendStatus::Stopping,
            (true, false, Health::Healthy) => BackendStatus::Online,
            (true, false, _) => BackendStatus::Starting,
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendStatus::Offline => write!(f, "offline"),
            BackendStatus::Starting => write!(f, "starting"),
            BackendStatus::Online => write!(f, "online"),
            BackendStatus::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub status: BackendStatus,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub clients: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<HoldDuration>,
    #[serde(default)]
    pub idle_stop_pending: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(req)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Err(ProtocolError::Malformed("empty request".to_string()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(resp)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    let trimmed = line.trim_end();
    Ok(serde_json::from_str(trimmed)?)
}
