use thiserror::Error;

use crate::gate::GateError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GateError),
    #[error("rejected by service (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("service reported success without a {0}")]
    MissingCredential(&'static str),
}

impl AuthError {
    /// The service refused the credential, as opposed to the request failing.
    pub fn is_rejection(&self) -> bool {
        match self {
            AuthError::Rejected { .. } | AuthError::MissingCredential(_) => true,
            AuthError::Gateway(err) => err.is_unauthorized(),
        }
    }
}
