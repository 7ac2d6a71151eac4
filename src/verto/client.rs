use async_trait::async_trait;
use bridge_core::net::{Transport, TransportEvent};
use bridge_core::rpc::{self, METHOD_NOT_FOUND_CODE, RemoteError, RpcMessage, VertoMethod};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

/// Custom error types for control channel requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("control channel is closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{method} request timed out")]
    Timeout { method: String },
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Receives the server-initiated side of the control channel.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handles one server request. The outcome is sent back when the request
    /// carried an id.
    async fn on_request(&self, method: VertoMethod, params: Value) -> Result<(), RemoteError>;

    /// Called once after the channel closed and every pending request failed.
    async fn on_close(&self);
}

struct InboundRequest {
    id: Option<Value>,
    method: String,
    params: Value,
}

type Waiter = oneshot::Sender<Result<Value, RpcError>>;

/// One logged-in session on the Verto control channel.
///
/// Outbound requests are correlated with their responses by a strictly
/// increasing integer id. Server requests are handed to the [`RpcHandler`]
/// one at a time, off the task that reads responses.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    session_id: String,
    next_id: AtomicU64,
    pending: DashMap<u64, Waiter>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    handler: RwLock<Option<Weak<dyn RpcHandler>>>,
    request_timeout: Duration,
}

fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            session_id: generate_session_id(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            closed_tx,
            handler: RwLock::new(None),
            request_timeout,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_handler(&self, handler: Weak<dyn RpcHandler>) {
        *self.handler.write().expect("RwLock should not be poisoned") = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn RpcHandler>> {
        self.handler
            .read()
            .expect("RwLock should not be poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the control channel has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Starts reading transport events. Must be called once, before the
    /// first request.
    pub fn start(self: &Arc<Self>, events: mpsc::Receiver<TransportEvent>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().read_loop(events, requests_tx));
        tokio::spawn(self.clone().dispatch_requests(requests_rx));
    }

    async fn read_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        requests_tx: mpsc::UnboundedSender<InboundRequest>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => {
                    debug!(target: "Verto/RPC", "Control channel connected");
                }
                TransportEvent::MessageReceived(text) => {
                    self.handle_message(&text, &requests_tx);
                }
                TransportEvent::Disconnected => {
                    info!(target: "Verto/RPC", "Control channel disconnected");
                    break;
                }
            }
        }
        self.close().await;
    }

    fn handle_message(&self, text: &str, requests_tx: &mpsc::UnboundedSender<InboundRequest>) {
        match rpc::decode(text) {
            Ok(RpcMessage::Response { id, result }) => self.resolve(id, Ok(result)),
            Ok(RpcMessage::Error { id, error }) => self.resolve(id, Err(RpcError::Remote(error))),
            Ok(RpcMessage::Request { id, method, params }) => {
                if requests_tx
                    .send(InboundRequest { id, method, params })
                    .is_err()
                {
                    warn!(target: "Verto/RPC", "Request dispatcher is gone, dropping server request");
                }
            }
            Err(e) => {
                warn!(target: "Verto/RPC", "Ignoring undecodable message: {e}");
            }
        }
    }

    fn resolve(&self, id: u64, outcome: Result<Value, RpcError>) {
        match self.pending.remove(&id) {
            Some((_, waiter)) => {
                if waiter.send(outcome).is_err() {
                    warn!(target: "Verto/RPC", "Response for request {id} arrived after its caller gave up");
                }
            }
            None => {
                warn!(target: "Verto/RPC", "Received response for unknown request id {id}");
            }
        }
    }

    async fn dispatch_requests(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<InboundRequest>) {
        while let Some(request) = requests.recv().await {
            debug!(target: "Verto/RPC", "<-- server request {}", request.method);
            let method = VertoMethod::parse(&request.method);
            let outcome = match self.handler() {
                Some(handler) => handler.on_request(method, request.params).await,
                None => Err(RemoteError::new(METHOD_NOT_FOUND_CODE, "no handler")),
            };

            let Some(id) = request.id else {
                continue;
            };
            let reply = match outcome {
                Ok(()) => rpc::encode_result(&id, json!({ "method": request.method })),
                Err(e) => {
                    warn!(target: "Verto/RPC", "Server request {} failed: {e}", request.method);
                    rpc::encode_error(&id, e.code, &e.message)
                }
            };
            if let Err(e) = self.transport.send(&reply).await {
                warn!(target: "Verto/RPC", "Failed to reply to {}: {e}", request.method);
            }
        }
    }

    /// Sends a request and waits for its result.
    pub async fn send_request(&self, method: VertoMethod, params: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // Dropped on every exit path, including cancellation of this future.
        let _cleanup = scopeguard::guard(id, |id| {
            self.pending.remove(&id);
        });

        // close() may have drained the table between the check above and the insert.
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let text = rpc::encode_request(id, method.as_str(), &params);
        debug!(target: "Verto/RPC", "--> {method} (id {id})");
        self.transport
            .send(&text)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => Err(RpcError::Timeout {
                method: method.to_string(),
            }),
        }
    }

    pub async fn login(&self, login: &str, password: &str) -> Result<Value, RpcError> {
        let params = json!({
            "login": login,
            "passwd": password,
            "sessid": self.session_id,
        });
        self.send_request(VertoMethod::Login, params).await
    }

    /// Closes the channel and fails every pending request. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "Verto/RPC", "Closing control channel session {}", self.session_id);

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(RpcError::Closed));
            }
        }

        self.transport.disconnect().await;
        self.closed_tx.send_replace(true);

        if let Some(handler) = self.handler() {
            handler.on_close().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
