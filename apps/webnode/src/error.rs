use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::register::RegistrationError;
use crate::session::{CloseReason, TransportError};

/// Everything that can end (or interrupt) one pass of the node lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("credential exchange failed: {0}")]
    Login(#[source] AuthError),
    #[error("access token refresh failed: {0}")]
    Refresh(#[source] AuthError),
    #[error("node registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error("node socket fault: {0}")]
    Transport(#[from] TransportError),
    #[error("node socket closed ({0})")]
    Closed(CloseReason),
    #[error("gave up after {attempts} consecutive reconnect attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },
}
