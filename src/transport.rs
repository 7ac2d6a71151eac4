pub use bridge_core::net::{Transport, TransportEvent, TransportFactory};
pub use voip_bridge_tokio_transport::TokioWebSocketTransportFactory;
