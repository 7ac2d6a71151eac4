//! The chat side of the bridge: the homeserver client, one [`ChatEndpoint`]
//! per call, and the [`MatrixManager`] that turns pushed transactions into
//! call lifecycle notifications.

pub mod client;
pub mod endpoint;
pub mod manager;
#[cfg(test)]
pub mod mock;

pub use client::{ChatClient, ChatError, HomeserverClient};
pub use endpoint::ChatEndpoint;
pub use manager::MatrixManager;
