//! The contract both signaling adapters implement.
//!
//! An endpoint is the bridge's local proxy for one side of one call. Outbound
//! signaling enters through the `handle_*` methods; inbound signaling leaves
//! through the listeners registered on its [`EndpointCore`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::listeners::Listeners;
use crate::types::{
    AnswerEvent, CallId, CallInfo, CandidatesEvent, HangupEvent, InviteEvent, SignalingEvent,
};

/// Receives signaling observed on an endpoint's own protocol.
#[async_trait]
pub trait SignalingListener: Send + Sync {
    async fn on_signal(&self, event: SignalingEvent) -> anyhow::Result<()>;
}

/// Receives the single "closed" notification of an endpoint.
#[async_trait]
pub trait ClosedListener: Send + Sync {
    async fn on_closed(&self, call_id: &CallId);
}

/// State shared by every endpoint variant.
pub struct EndpointCore {
    call_id: CallId,
    channel_id: String,
    user_id: String,
    signal_listeners: Listeners<dyn SignalingListener>,
    closed_listeners: Listeners<dyn ClosedListener>,
}

impl EndpointCore {
    pub fn new(call_id: CallId, channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            call_id,
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            signal_listeners: Listeners::new(),
            closed_listeners: Listeners::new(),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// The room id (chat side) or control session id (VoIP side).
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The puppet user id (chat side) or the remote identity (VoIP side).
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn add_signal_listener(&self, listener: Arc<dyn SignalingListener>) {
        self.signal_listeners.add(listener);
    }

    pub fn add_closed_listener(&self, listener: Arc<dyn ClosedListener>) {
        self.closed_listeners.add(listener);
    }

    pub async fn fire_signal(&self, event: SignalingEvent) {
        self.signal_listeners
            .dispatch(event.kind(), |listener| {
                let event = event.clone();
                async move { listener.on_signal(event).await }
            })
            .await;
    }

    pub async fn fire_hangup(&self, reason: Option<String>) {
        self.fire_signal(HangupEvent::new(self.call_id.clone(), reason).into())
            .await;
    }

    pub async fn fire_closed(&self) {
        self.closed_listeners
            .dispatch("closed", |listener| {
                let call_id = self.call_id.clone();
                async move {
                    listener.on_closed(&call_id).await;
                    Ok(())
                }
            })
            .await;
    }
}

/// One side of a bridged call.
///
/// Every `handle_*` method is a silent no-op once the endpoint is closed, and
/// `close` is idempotent.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn core(&self) -> &EndpointCore;

    fn call_id(&self) -> &CallId {
        self.core().call_id()
    }

    fn add_signal_listener(&self, listener: Arc<dyn SignalingListener>) {
        self.core().add_signal_listener(listener);
    }

    fn add_closed_listener(&self, listener: Arc<dyn ClosedListener>) {
        self.core().add_closed_listener(listener);
    }

    fn is_closed(&self) -> bool;

    async fn handle_invite(&self, event: InviteEvent);

    async fn handle_candidates(&self, event: CandidatesEvent);

    async fn handle_answer(&self, event: AnswerEvent);

    async fn handle_hangup(&self, event: HangupEvent);

    async fn close(&self);

    async fn handle(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Invite(ev) => self.handle_invite(ev).await,
            SignalingEvent::Candidates(ev) => self.handle_candidates(ev).await,
            SignalingEvent::Answer(ev) => self.handle_answer(ev).await,
            SignalingEvent::Hangup(ev) => self.handle_hangup(ev).await,
        }
    }
}

/// Notified by a signaling manager when calls appear and disappear on its side.
#[async_trait]
pub trait CallLifecycle: Send + Sync {
    async fn on_call_created(&self, endpoint: Arc<dyn Endpoint>, info: CallInfo);

    async fn on_call_destroyed(&self, call_id: &CallId);
}
