//! Protocol-neutral core of the call-signaling bridge.
//!
//! Holds the signaling value types, the endpoint contract shared by both
//! adapters, wire codecs for both protocols and the configuration model.
//! Nothing in here performs I/O.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod listeners;
pub mod matrix;
pub mod mxid;
pub mod net;
pub mod rpc;
pub mod transaction;
pub mod types;

pub use endpoint::{CallLifecycle, ClosedListener, Endpoint, EndpointCore, SignalingListener};
pub use error::{BridgeError, IdentityError};
pub use types::{CallId, CallInfo, Side, SignalingEvent};
