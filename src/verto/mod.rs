//! The media-server side of the bridge: a FreeSWITCH Verto session.
//!
//! - [`RpcClient`]: JSON-RPC request/response correlation over the websocket
//! - [`VoipEndpoint`]: one call on the session, with candidate aggregation
//! - [`VertoManager`]: login, the endpoint table and server-initiated calls

mod client;
mod endpoint;
mod manager;

pub use client::{RpcClient, RpcError, RpcHandler};
pub use endpoint::{REMOTE_ERROR_REASON, VoipEndpoint, VoipState, append_candidates};
pub use manager::VertoManager;
