use std::fmt;

use time::OffsetDateTime;
use uuid::Uuid;
use webnode_proto::random_user_agent;

use crate::config::NodeConfig;

/// Account credentials plus the per-process device id announced to the service.
#[derive(Clone)]
pub struct Identity {
    principal: String,
    secret: String,
    device_id: Uuid,
}

impl Identity {
    /// Mints a fresh device id; it stays fixed for the lifetime of the value.
    pub fn generate(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_device_id(principal, secret, Uuid::new_v4())
    }

    pub fn with_device_id(
        principal: impl Into<String>,
        secret: impl Into<String>,
        device_id: Uuid,
    ) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
            device_id,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Client description sent with registration and presented on every request.
#[derive(Debug, Clone)]
pub struct ClientMetadata {
    pub ext_version: String,
    pub language: String,
    pub user_script_enabled: bool,
    pub install_time: OffsetDateTime,
    pub user_agent: String,
}

impl ClientMetadata {
    /// Captures the install time and picks a user agent once per process.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            ext_version: config.ext_version.clone(),
            language: config.language.clone(),
            user_script_enabled: true,
            install_time: OffsetDateTime::now_utc(),
            user_agent: random_user_agent().to_string(),
        }
    }
}
