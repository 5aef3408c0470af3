//! Client runtime for a webnode: exchanges account credentials for a refresh
//! token, keeps a short-lived access token fresh, announces the node and holds a
//! heartbeat WebSocket open, rebuilding the whole chain whenever the socket dies.

pub mod auth;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod register;
pub mod session;
pub mod supervisor;
pub mod telemetry;

pub use auth::{AccessCredential, RefreshCredential, TokenManager};
pub use config::{NodeConfig, RetryPolicy};
pub use error::SessionError;
pub use identity::{ClientMetadata, Identity};
pub use session::{LogObserver, PointsObserver, SessionEnd, SessionHandle};
pub use supervisor::{SessionState, Supervisor, SupervisorHandle};
