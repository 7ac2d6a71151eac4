//! Error taxonomy shared by the bridge.

use thiserror::Error;

use crate::config::ConfigError;
use crate::matrix::CallEventError;
use crate::rpc::RemoteError;
use crate::types::CallId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid user id: {0}")]
    InvalidUserId(String),
    #[error("invalid identity template {template}: {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("{0} does not match any puppet template")]
    NotAPuppet(String),
    #[error("no puppet template configured")]
    NoTemplate,
}

/// Failures of the bridge, grouped by how they are handled.
///
/// Everything except [`BridgeError::Login`] and [`BridgeError::Config`] is
/// contained to a single call.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("protocol validation failed: {0}")]
    ProtocolValidation(#[from] CallEventError),

    #[error("no identity mapping for {0}")]
    IdentityResolution(String),

    #[error("remote platform error: {0}")]
    RemoteRpc(#[from] RemoteError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no call {0}")]
    DuplicateNotification(CallId),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("login to the media server failed: {0}")]
    Login(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
