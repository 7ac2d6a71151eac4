use async_trait::async_trait;
use bridge_core::endpoint::{CallLifecycle, Endpoint};
use bridge_core::error::BridgeError;
use bridge_core::identity::IdentityMapper;
use bridge_core::types::{CallId, CallInfo, Side};
use log::{debug, info, warn};
use std::sync::{Arc, Weak};

use crate::call::CallRegistry;
use crate::matrix::MatrixManager;
use crate::verto::VertoManager;

/// Pairs every call that appears on one side with a leg on the other.
pub struct Bridge {
    matrix: Arc<MatrixManager>,
    verto: Arc<VertoManager>,
    identities: Arc<dyn IdentityMapper>,
    calls: CallRegistry,
}

impl Bridge {
    /// Creates the bridge and subscribes it to both managers.
    pub fn new(
        matrix: Arc<MatrixManager>,
        verto: Arc<VertoManager>,
        identities: Arc<dyn IdentityMapper>,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            matrix,
            verto,
            identities,
            calls: CallRegistry::new(),
        });
        let lifecycle: Weak<dyn CallLifecycle> = Arc::downgrade(&bridge) as Weak<dyn CallLifecycle>;
        bridge.matrix.set_lifecycle(lifecycle.clone());
        bridge.verto.set_lifecycle(lifecycle);
        bridge
    }

    pub fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    /// A chat user called a puppet: dial the carrier identity behind it.
    async fn bridge_from_chat(
        &self,
        chat: Arc<dyn Endpoint>,
        info: CallInfo,
    ) -> Result<(), BridgeError> {
        let remote_id = self
            .identities
            .resolve_remote_identity(&info.callee)?
            .ok_or_else(|| BridgeError::IdentityResolution(info.callee.clone()))?;
        let voip = self.verto.endpoint(&info.call_id, &remote_id)?;
        info!(target: "Bridge", "Call {}: {} -> {remote_id}", info.call_id, info.caller);
        self.register(info, chat, voip).await;
        Ok(())
    }

    /// The carrier delivered a call: ring the chat user it is routed to.
    async fn bridge_from_voip(
        &self,
        voip: Arc<dyn Endpoint>,
        info: CallInfo,
    ) -> Result<(), BridgeError> {
        let target = self
            .identities
            .resolve_chat_user(&info.callee)?
            .ok_or_else(|| BridgeError::IdentityResolution(info.callee.clone()))?;
        let chat = self
            .matrix
            .direct_channel_endpoint(&info.caller, &target, &info.call_id)
            .await?;
        info!(target: "Bridge", "Call {}: {} -> {target}", info.call_id, info.caller);
        self.register(info, chat, voip).await;
        Ok(())
    }

    async fn register(&self, info: CallInfo, chat: Arc<dyn Endpoint>, voip: Arc<dyn Endpoint>) {
        let call_id = info.call_id.clone();
        if let Err(existing) = self.calls.register(info, chat, voip).await {
            debug!(
                target: "Bridge",
                "Call {call_id}: already bridged ({} call)",
                existing.info().origin
            );
        }
    }

    /// Terminates every bridged call.
    pub async fn shutdown(&self) {
        for call in self.calls.calls() {
            call.terminate(Some("bridge shutting down".to_string())).await;
        }
    }
}

#[async_trait]
impl CallLifecycle for Bridge {
    async fn on_call_created(&self, endpoint: Arc<dyn Endpoint>, info: CallInfo) {
        let call_id = info.call_id.clone();
        let origin = info.origin;
        let result = match origin {
            Side::Chat => self.bridge_from_chat(endpoint.clone(), info).await,
            Side::Voip => self.bridge_from_voip(endpoint.clone(), info).await,
        };
        if let Err(e) = result {
            warn!(target: "Bridge", "Call {call_id}: cannot bridge {origin} call: {e}");
            endpoint.close().await;
        }
    }

    async fn on_call_destroyed(&self, call_id: &CallId) {
        match self.calls.remove(call_id) {
            Some(call) => call.terminate(None).await,
            None => {
                info!(target: "Bridge", "{}", BridgeError::DuplicateNotification(call_id.clone()));
            }
        }
    }
}
