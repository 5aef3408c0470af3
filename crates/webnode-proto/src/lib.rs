//! Message shapes shared by the webnode client and anything that needs to speak
//! to (or impersonate) the task service. The HTTP API wraps every payload in an
//! [`ApiEnvelope`]; the node WebSocket carries bare JSON frames.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub mod agent;

pub use agent::{random_user_agent, USER_AGENTS};

/// Application-level status code the service uses for success.
pub const SUCCESS_CODE: i64 = 0;

pub const LOGIN_PATH: &str = "api/auth/login";
pub const REFRESH_PATH: &str = "api/auth/refresh-token";
pub const REGISTER_PATH: &str = "api/webnodes/register";
pub const NODE_SOCKET_PATH: &str = "api/public/webnodes/ws";

/// `{code, data, msg}` wrapper returned by every HTTP endpoint. The transport
/// status alone does not signal success; `code` must equal [`SUCCESS_CODE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    pub data: Option<T>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Returns the payload only when the envelope reports success.
    pub fn into_data(self) -> Option<T> {
        if self.is_success() {
            self.data
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginData {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshData {
    pub access_token: String,
}

/// Node announcement posted once per access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub ext_version: String,
    pub language: String,
    pub user_script_enabled: bool,
    pub device_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub install_time: OffsetDateTime,
}

pub const HEARTBEAT_CMD: u32 = 1;
pub const HEARTBEAT_ECHO: &str = "echo me";

/// Liveness frame sent on the node socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatFrame {
    pub cmd: u32,
    pub echo: String,
    pub job_report: JobReport,
}

impl HeartbeatFrame {
    pub fn new(report: JobReport) -> Self {
        Self {
            cmd: HEARTBEAT_CMD,
            echo: HEARTBEAT_ECHO.to_string(),
            job_report: report,
        }
    }
}

/// Opaque work counters carried by every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub cfgcnt: u32,
    pub jobcnt: u32,
}

impl Default for JobReport {
    fn default() -> Self {
        Self {
            cfgcnt: 2,
            jobcnt: 0,
        }
    }
}

/// Frame received on the node socket. Only `userDataUpdate` is understood; any
/// other field is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_update: Option<UserDataUpdate>,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserDataUpdate {
    pub today_points: f64,
    pub total_points: f64,
}
