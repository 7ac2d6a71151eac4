use async_trait::async_trait;
use bridge_core::config::BridgeConfig;
use bridge_core::endpoint::{CallLifecycle, Endpoint};
use bridge_core::error::BridgeError;
use bridge_core::rpc::{HANDLER_ERROR_CODE, METHOD_NOT_FOUND_CODE, RemoteError, VertoMethod};
use bridge_core::types::{CallId, CallInfo, Side};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::time::timeout;

use super::client::{RpcClient, RpcHandler};
use super::endpoint::VoipEndpoint;
use crate::reaper::{CallTable, Reaper};
use crate::transport::TransportFactory;

/// Hangup causes that mean an ordinary end of call rather than a failure.
const NORMAL_CAUSES: [&str; 2] = ["NORMAL_CLEARING", "ORIGINATOR_CANCEL"];

/// Owns the control-channel session and every VoIP endpoint on it.
pub struct VertoManager {
    client: Arc<RpcClient>,
    login: String,
    candidate_delay: Duration,
    invite_lifetime_ms: i64,
    endpoints: Arc<CallTable<VoipEndpoint>>,
    lifecycle: RwLock<Option<Weak<dyn CallLifecycle>>>,
}

impl VertoManager {
    /// Connects and logs in. A failed login is fatal to the bridge.
    pub async fn connect(
        config: &BridgeConfig,
        factory: &dyn TransportFactory,
    ) -> Result<Arc<Self>, BridgeError> {
        let (transport, events) = factory
            .create_transport()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        let client = RpcClient::new(transport, config.verto.request_timeout());

        let manager = Arc::new(Self {
            client: client.clone(),
            login: config.verto.login.clone(),
            candidate_delay: config.call.candidate_delay(),
            invite_lifetime_ms: config.call.invite_lifetime_ms,
            endpoints: Arc::new(DashMap::new()),
            lifecycle: RwLock::new(None),
        });
        let handler: Weak<dyn RpcHandler> = Arc::downgrade(&manager) as Weak<dyn RpcHandler>;
        client.set_handler(handler);
        client.start(events);

        info!(target: "Verto", "Logging in as {}", config.verto.login);
        let login = client.login(&config.verto.login, &config.verto.password);
        match timeout(config.verto.login_timeout(), login).await {
            Ok(Ok(_)) => {
                info!(target: "Verto", "Logged in, session {}", client.session_id());
                Ok(manager)
            }
            Ok(Err(e)) => {
                client.close().await;
                Err(BridgeError::Login(e.to_string()))
            }
            Err(_) => {
                client.close().await;
                Err(BridgeError::Login("login timed out".to_string()))
            }
        }
    }

    pub fn set_lifecycle(&self, lifecycle: Weak<dyn CallLifecycle>) {
        *self.lifecycle.write().expect("RwLock should not be poisoned") = Some(lifecycle);
    }

    fn lifecycle(&self) -> Option<Arc<dyn CallLifecycle>> {
        self.lifecycle
            .read()
            .expect("RwLock should not be poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    /// Resolves once the control channel has closed.
    pub async fn closed(&self) {
        self.client.closed().await;
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<VoipEndpoint>> {
        self.endpoints.get(call_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn new_endpoint(&self, call_id: CallId, remote_id: &str) -> Arc<VoipEndpoint> {
        let endpoint = VoipEndpoint::new(
            call_id,
            remote_id,
            self.client.clone(),
            self.login.clone(),
            self.candidate_delay,
        );
        endpoint.add_closed_listener(Reaper::new(&self.endpoints, &endpoint));
        endpoint
    }

    /// Returns the endpoint for `call_id`, creating one that calls `remote_id`.
    pub fn endpoint(
        &self,
        call_id: &CallId,
        remote_id: &str,
    ) -> Result<Arc<VoipEndpoint>, BridgeError> {
        if self.client.is_closed() {
            return Err(BridgeError::Transport(
                "control channel is closed".to_string(),
            ));
        }
        let endpoint = self
            .endpoints
            .entry(call_id.clone())
            .or_insert_with(|| self.new_endpoint(call_id.clone(), remote_id))
            .clone();
        Ok(endpoint)
    }

    async fn on_invite(&self, params: &Value) -> Result<(), RemoteError> {
        let call_id = field(params, "callID")
            .ok_or_else(|| RemoteError::new(HANDLER_ERROR_CODE, "invite without callID"))?;
        let sdp = params
            .get("sdp")
            .and_then(Value::as_str)
            .filter(|sdp| !sdp.is_empty())
            .ok_or_else(|| RemoteError::new(HANDLER_ERROR_CODE, "invite without sdp"))?;
        let caller = field(params, "caller_id_number").unwrap_or_default();
        let callee = field(params, "callee_id_number")
            .or_else(|| field(params, "destination_number"))
            .unwrap_or_default();
        let call_id = CallId::new(call_id);

        let endpoint = match self.endpoints.entry(call_id.clone()) {
            Entry::Occupied(_) => {
                info!(target: "Verto", "Call {call_id}: duplicate invite, ignoring");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                let endpoint = self.new_endpoint(call_id.clone(), caller);
                slot.insert(endpoint.clone());
                endpoint
            }
        };
        info!(target: "Verto", "Call {call_id}: incoming from {caller} to {callee}");

        match self.lifecycle() {
            Some(lifecycle) => {
                let info = CallInfo::new(
                    call_id,
                    Side::Voip,
                    self.client.session_id(),
                    caller,
                    callee,
                );
                lifecycle.on_call_created(endpoint.clone(), info).await;
            }
            None => {
                warn!(target: "Verto", "Call {call_id}: nobody handles calls, rejecting");
                endpoint.close().await;
                return Ok(());
            }
        }

        endpoint
            .inject_invite(sdp.to_string(), self.invite_lifetime_ms)
            .await;
        Ok(())
    }

    fn known_endpoint(&self, params: &Value) -> Option<Arc<VoipEndpoint>> {
        let call_id = CallId::new(field(params, "callID")?);
        let endpoint = self.get(&call_id);
        if endpoint.is_none() {
            warn!(target: "Verto", "Call {call_id}: unknown call, ignoring");
        }
        endpoint
    }

    async fn on_bye(&self, params: &Value) {
        let Some(call_id) = field(params, "callID").map(CallId::new) else {
            warn!(target: "Verto", "bye without callID, ignoring");
            return;
        };
        let Some((_, endpoint)) = self.endpoints.remove(&call_id) else {
            info!(target: "Verto", "Call {call_id}: bye for unknown call, ignoring");
            return;
        };
        let reason = field(params, "cause")
            .filter(|cause| !NORMAL_CAUSES.contains(cause))
            .map(str::to_string);
        info!(target: "Verto", "Call {call_id}: remote hangup ({reason:?})");
        endpoint.inject_bye(reason).await;
        if let Some(lifecycle) = self.lifecycle() {
            lifecycle.on_call_destroyed(&call_id).await;
        }
    }

    /// Closes every endpoint. Called when the control channel goes away.
    pub async fn close_all(&self) {
        let endpoints: Vec<Arc<VoipEndpoint>> =
            self.endpoints.iter().map(|e| e.value().clone()).collect();
        for endpoint in endpoints {
            endpoint.close().await;
        }
    }
}

/// A top-level parameter, or the same key inside `dialogParams`.
fn field<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .or_else(|| params.get("dialogParams").and_then(|d| d.get(key)))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl RpcHandler for VertoManager {
    async fn on_request(&self, method: VertoMethod, params: Value) -> Result<(), RemoteError> {
        match method {
            VertoMethod::Invite => self.on_invite(&params).await,
            VertoMethod::Media => {
                if let (Some(endpoint), Some(sdp)) = (
                    self.known_endpoint(&params),
                    params.get("sdp").and_then(Value::as_str),
                ) {
                    debug!(target: "Verto", "Call {}: early media", endpoint.call_id());
                    endpoint.inject_media(sdp.to_string());
                }
                Ok(())
            }
            VertoMethod::Answer => {
                if let Some(endpoint) = self.known_endpoint(&params) {
                    let sdp = params
                        .get("sdp")
                        .and_then(Value::as_str)
                        .filter(|sdp| !sdp.is_empty())
                        .map(str::to_string);
                    endpoint.inject_answer(sdp).await;
                }
                Ok(())
            }
            VertoMethod::Bye => {
                self.on_bye(&params).await;
                Ok(())
            }
            VertoMethod::ClientReady | VertoMethod::Display => {
                debug!(target: "Verto", "{method}: {params}");
                Ok(())
            }
            VertoMethod::Punt => {
                warn!(target: "Verto", "Media server dropped our session");
                self.client.close().await;
                Ok(())
            }
            VertoMethod::Login | VertoMethod::Other(_) => Err(RemoteError::new(
                METHOD_NOT_FOUND_CODE,
                format!("unsupported method {method}"),
            )),
        }
    }

    async fn on_close(&self) {
        warn!(target: "Verto", "Control channel closed, ending {} call(s)", self.len());
        self.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_are_read_from_params_or_dialog_params() {
        let params = json!({
            "callID": "top",
            "sdp": "v=0",
            "dialogParams": {"callID": "nested", "caller_id_number": "5551234", "cause": ""}
        });
        assert_eq!(field(&params, "callID"), Some("top"));
        assert_eq!(field(&params, "caller_id_number"), Some("5551234"));
        assert_eq!(field(&params, "cause"), None);
        assert_eq!(field(&params, "missing"), None);
    }
}
