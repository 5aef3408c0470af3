use thiserror::Error;
use tracing::{info, warn};
use webnode_proto::RegisterRequest;

use crate::auth::AccessCredential;
use crate::gate::{GateError, TaskGateClient};
use crate::identity::{ClientMetadata, Identity};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GateError),
    #[error("rejected by service (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

/// Announces the node to the service. Repeated announcements for the same
/// device id are accepted by the service, so this runs once per access token.
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    gate: TaskGateClient,
    metadata: ClientMetadata,
}

impl RegistrationClient {
    pub fn new(gate: TaskGateClient, metadata: ClientMetadata) -> Self {
        Self { gate, metadata }
    }

    pub fn request_for(&self, identity: &Identity) -> RegisterRequest {
        RegisterRequest {
            ext_version: self.metadata.ext_version.clone(),
            language: self.metadata.language.clone(),
            user_script_enabled: self.metadata.user_script_enabled,
            device_id: identity.device_id(),
            install_time: self.metadata.install_time,
        }
    }

    pub async fn announce(
        &self,
        access: &AccessCredential,
        identity: &Identity,
    ) -> Result<(), RegistrationError> {
        let request = self.request_for(identity);
        let envelope = self.gate.register(access.expose(), &request).await?;
        if let Some(envelope) = envelope.filter(|envelope| !envelope.is_success()) {
            let err = RegistrationError::Rejected {
                code: envelope.code,
                message: envelope.msg.unwrap_or_else(|| "registration rejected".into()),
            };
            warn!(target: "webnode::register", device_id = %identity.device_id(), error = %err, "registration rejected");
            return Err(err);
        }
        info!(
            target: "webnode::register",
            device_id = %identity.device_id(),
            ext_version = %request.ext_version,
            "node registered"
        );
        Ok(())
    }
}
