//! Integrations that talk to the outside world.
//!
//! The pools and the executor only see the traits defined here
//! ([`LoginProvider`], [`ProxySupplier`], [`TargetProbe`]); the reqwest-backed
//! adapters are the default wiring used by the gateway.

pub mod login;
pub mod probe;
pub mod supply;
pub mod transport;

pub use login::{Account, FormLoginProvider, LoginProvider, load_accounts};
pub use probe::{HttpTargetProbe, ProbeRoute, TargetProbe};
pub use supply::{HttpProxySupplier, ProxySupplier};
pub use transport::{TargetResponse, browser_headers, build_client, classify_response};

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("collaborator misconfigured: {0}")]
    Config(String),
}

impl CollaboratorError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            CollaboratorError::Timeout(timeout)
        } else if err.is_decode() {
            CollaboratorError::Decode(err.to_string())
        } else if err.is_builder() {
            CollaboratorError::Config(err.to_string())
        } else {
            CollaboratorError::Transport(err.to_string())
        }
    }
}
