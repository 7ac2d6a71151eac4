//! A call-signaling bridge between Matrix `m.call.*` events and a
//! FreeSWITCH Verto session.
//!
//! Each bridged call pairs a [`matrix::ChatEndpoint`] with a
//! [`verto::VoipEndpoint`] under a [`call::Call`]. The [`bridge::Bridge`]
//! creates those pairs as calls appear on either side.

pub mod appservice;
pub mod bridge;
pub mod call;
pub mod config;
pub mod matrix;
mod reaper;
pub mod transport;
pub mod verto;

pub use bridge::Bridge;
pub use bridge_core::{BridgeError, CallId, CallInfo, Side, SignalingEvent};
