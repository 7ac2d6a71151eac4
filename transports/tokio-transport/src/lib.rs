/// Tokio-based WebSocket transport implementation for voip-bridge
///
/// This crate provides a concrete implementation of the Transport trait
/// using tokio-tungstenite. Each websocket text message is one control
/// channel message.
use async_trait::async_trait;
use bridge_core::net::{Transport, TransportEvent, TransportFactory};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Tokio-based WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, message: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        debug!(target: "Transport", "--> {message}");
        sink.send(Message::text(message.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(target: "Transport", "Error while closing websocket: {e}");
            }
        }
    }
}

/// Factory for creating Tokio WebSocket transports to one URL
pub struct TokioWebSocketTransportFactory {
    url: String,
}

impl TokioWebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Transport", "Dialing {}", self.url);
        let (client, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::task::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(target: "Transport", "<-- {}", text.as_str());
                if event_tx
                    .send(TransportEvent::MessageReceived(text.as_str().to_string()))
                    .await
                    .is_err()
                {
                    warn!(target: "Transport", "Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!(target: "Transport", "Received close frame: {frame:?}");
                break;
            }
            Some(Ok(other)) => {
                trace!(target: "Transport", "Ignoring non-text message: {other:?}");
            }
            Some(Err(e)) => {
                error!(target: "Transport", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
