use async_trait::async_trait;
use bridge_core::endpoint::{Endpoint, EndpointCore};
use bridge_core::matrix::call_event_content;
use bridge_core::types::{
    AnswerEvent, CallId, CandidatesEvent, HangupEvent, InviteEvent, SignalingEvent,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::client::ChatClient;

/// The Matrix side of one call: a puppet user talking in one room.
pub struct ChatEndpoint {
    core: EndpointCore,
    client: Mutex<Option<Arc<dyn ChatClient>>>,
    hangup_exchanged: AtomicBool,
}

impl ChatEndpoint {
    pub fn new(
        call_id: CallId,
        room_id: impl Into<String>,
        puppet: impl Into<String>,
        client: Arc<dyn ChatClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: EndpointCore::new(call_id, room_id, puppet),
            client: Mutex::new(Some(client)),
            hangup_exchanged: AtomicBool::new(false),
        })
    }

    pub fn room_id(&self) -> &str {
        self.core.channel_id()
    }

    pub fn puppet(&self) -> &str {
        self.core.user_id()
    }

    fn client(&self) -> Option<Arc<dyn ChatClient>> {
        self.client
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    /// Signaling received from the room, handed on to the listeners.
    pub async fn inject(&self, event: SignalingEvent) {
        if self.is_closed() {
            return;
        }
        if event.is_hangup() {
            self.hangup_exchanged.store(true, Ordering::SeqCst);
        }
        self.core.fire_signal(event).await;
    }

    async fn send(&self, event: SignalingEvent) {
        let Some(client) = self.client() else {
            return;
        };
        let (event_type, content) = call_event_content(&event);
        debug!(target: "Matrix/Call", "Call {}: sending {event_type} to {}", self.call_id(), self.room_id());
        let result = client
            .send_event(self.puppet(), self.room_id(), event_type, content)
            .await;

        let Err(e) = result else {
            return;
        };
        warn!(target: "Matrix/Call", "Call {}: sending {event_type} failed: {e}", self.call_id());
        if !event.is_hangup() {
            self.hangup_exchanged.store(true, Ordering::SeqCst);
            self.core.fire_hangup(Some(e.to_string())).await;
        }
        self.close().await;
    }
}

#[async_trait]
impl Endpoint for ChatEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.core
    }

    fn is_closed(&self) -> bool {
        self.client
            .lock()
            .expect("Mutex should not be poisoned")
            .is_none()
    }

    async fn handle_invite(&self, event: InviteEvent) {
        self.send(event.into()).await;
    }

    async fn handle_candidates(&self, event: CandidatesEvent) {
        self.send(event.into()).await;
    }

    async fn handle_answer(&self, event: AnswerEvent) {
        self.send(event.into()).await;
    }

    async fn handle_hangup(&self, event: HangupEvent) {
        if self.is_closed() || self.hangup_exchanged.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send(event.into()).await;
    }

    async fn close(&self) {
        let Some(client) = self
            .client
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        else {
            return;
        };

        if !self.hangup_exchanged.swap(true, Ordering::SeqCst) {
            let (event_type, content) =
                call_event_content(&HangupEvent::new(self.call_id().clone(), None).into());
            if let Err(e) = client
                .send_event(self.puppet(), self.room_id(), event_type, content)
                .await
            {
                debug!(target: "Matrix/Call", "Call {}: final hangup not delivered: {e}", self.call_id());
            }
        }
        info!(target: "Matrix/Call", "Call {}: closed", self.call_id());
        self.core.fire_closed().await;
    }
}
