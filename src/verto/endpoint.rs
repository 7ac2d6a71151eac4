use async_trait::async_trait;
use bridge_core::endpoint::{Endpoint, EndpointCore};
use bridge_core::rpc::VertoMethod;
use bridge_core::types::{AnswerEvent, CallId, CandidatesEvent, HangupEvent, InviteEvent};
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

use super::client::RpcClient;

/// Reason given to the other side when the media server rejects a request.
pub const REMOTE_ERROR_REASON: &str = "Remote Error";

/// Progress of one call on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoipState {
    New,
    /// An offer or answer is waiting for the candidate quiet period to end.
    AwaitingCandidates,
    Inviting,
    Answering,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdpKind {
    Invite,
    Answer,
}

/// An SDP body being held back while ICE candidates trickle in.
#[derive(Debug)]
struct CandidateAccumulator {
    kind: SdpKind,
    sdp: String,
    lines: Vec<String>,
    last_update: Option<Instant>,
}

/// Appends candidate lines to an SDP body, one CRLF-terminated line each.
pub fn append_candidates(sdp: &str, lines: &[String]) -> String {
    let mut body = sdp.to_string();
    if lines.is_empty() {
        return body;
    }
    if !body.is_empty() && !body.ends_with('\n') {
        body.push_str("\r\n");
    }
    for line in lines {
        body.push_str(line);
        body.push_str("\r\n");
    }
    body
}

/// The Verto side of one call.
pub struct VoipEndpoint {
    core: EndpointCore,
    this: Weak<VoipEndpoint>,
    client: Mutex<Option<Arc<RpcClient>>>,
    login: String,
    candidate_delay: Duration,
    state: Mutex<VoipState>,
    accumulator: Mutex<Option<CandidateAccumulator>>,
    early_sdp: Mutex<Option<String>>,
    hangup_exchanged: AtomicBool,
}

impl VoipEndpoint {
    /// `remote_id` is the carrier identity on the other end of this leg.
    pub fn new(
        call_id: CallId,
        remote_id: impl Into<String>,
        client: Arc<RpcClient>,
        login: impl Into<String>,
        candidate_delay: Duration,
    ) -> Arc<Self> {
        let session_id = client.session_id().to_string();
        Arc::new_cyclic(|this| Self {
            core: EndpointCore::new(call_id, session_id, remote_id),
            this: this.clone(),
            client: Mutex::new(Some(client)),
            login: login.into(),
            candidate_delay,
            state: Mutex::new(VoipState::New),
            accumulator: Mutex::new(None),
            early_sdp: Mutex::new(None),
            hangup_exchanged: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> VoipState {
        *self.state.lock().expect("Mutex should not be poisoned")
    }

    fn set_state(&self, state: VoipState) {
        let mut current = self.state.lock().expect("Mutex should not be poisoned");
        if *current != VoipState::Closed {
            *current = state;
        }
    }

    fn client(&self) -> Option<Arc<RpcClient>> {
        self.client
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    fn remote_id(&self) -> &str {
        self.core.user_id()
    }

    fn dialog_params(&self, kind: SdpKind) -> Value {
        match kind {
            SdpKind::Invite => json!({
                "callID": self.call_id().as_str(),
                "destination_number": self.remote_id(),
                "remote_caller_id_number": self.login,
            }),
            SdpKind::Answer => json!({ "callID": self.call_id().as_str() }),
        }
    }

    /// Holds an offer or answer back until the candidate quiet period ends.
    fn start_collecting(&self, kind: SdpKind, sdp: String) {
        {
            let mut accumulator = self
                .accumulator
                .lock()
                .expect("Mutex should not be poisoned");
            if accumulator.is_some() {
                warn!(target: "Verto/Call", "Call {}: SDP already pending, ignoring new {kind:?}", self.call_id());
                return;
            }
            *accumulator = Some(CandidateAccumulator {
                kind,
                sdp,
                lines: Vec::new(),
                last_update: None,
            });
        }
        self.set_state(VoipState::AwaitingCandidates);
        debug!(target: "Verto/Call", "Call {}: collecting candidates for {:?}", self.call_id(), self.candidate_delay);
        tokio::spawn(Self::collect_candidates(self.this.clone(), self.candidate_delay));
    }

    /// Sleeps until no candidate has arrived for a full `delay`, then sends.
    async fn collect_candidates(this: Weak<Self>, delay: Duration) {
        let mut deadline = Instant::now() + delay;
        loop {
            sleep_until(deadline).await;
            let Some(endpoint) = this.upgrade() else {
                return;
            };
            let ready = {
                let mut accumulator = endpoint
                    .accumulator
                    .lock()
                    .expect("Mutex should not be poisoned");
                let Some(pending) = accumulator.as_ref() else {
                    // Closed or hung up while waiting.
                    return;
                };
                let last_update = pending.last_update;
                match last_update {
                    Some(last) if last + delay > Instant::now() => {
                        deadline = last + delay;
                        None
                    }
                    _ => accumulator.take(),
                }
            };
            if let Some(pending) = ready {
                endpoint.send_sdp(pending).await;
                return;
            }
        }
    }

    async fn send_sdp(&self, pending: CandidateAccumulator) {
        let Some(client) = self.client() else {
            return;
        };
        let (method, state) = match pending.kind {
            SdpKind::Invite => (VertoMethod::Invite, VoipState::Inviting),
            SdpKind::Answer => (VertoMethod::Answer, VoipState::Answering),
        };
        self.set_state(state);

        let sdp = append_candidates(&pending.sdp, &pending.lines);
        info!(
            target: "Verto/Call",
            "Call {}: sending {method} with {} candidate(s)",
            self.call_id(),
            pending.lines.len()
        );
        let params = json!({
            "sessid": client.session_id(),
            "sdp": sdp,
            "dialogParams": self.dialog_params(pending.kind),
        });

        match client.send_request(method.clone(), params).await {
            Ok(_) => {
                if pending.kind == SdpKind::Answer {
                    self.set_state(VoipState::Connected);
                }
            }
            Err(e) => {
                warn!(target: "Verto/Call", "Call {}: {method} failed: {e}", self.call_id());
                self.hangup_exchanged.store(true, Ordering::SeqCst);
                self.core
                    .fire_hangup(Some(REMOTE_ERROR_REASON.to_string()))
                    .await;
            }
        }
    }

    /// Sends `verto.bye` in the background; its outcome does not matter.
    fn send_bye(&self, client: Arc<RpcClient>) {
        let params = json!({
            "sessid": client.session_id(),
            "dialogParams": { "callID": self.call_id().as_str() },
        });
        let call_id = self.call_id().clone();
        tokio::spawn(async move {
            if let Err(e) = client.send_request(VertoMethod::Bye, params).await {
                debug!(target: "Verto/Call", "Call {call_id}: bye not acknowledged: {e}");
            }
        });
    }

    /// An invite from the media server.
    pub async fn inject_invite(&self, sdp: String, lifetime_ms: i64) {
        if self.is_closed() {
            return;
        }
        self.core
            .fire_signal(InviteEvent::new(self.call_id().clone(), sdp, lifetime_ms).into())
            .await;
    }

    /// Early media: the SDP the media server will answer with.
    pub fn inject_media(&self, sdp: String) {
        *self.early_sdp.lock().expect("Mutex should not be poisoned") = Some(sdp);
    }

    /// The callee picked up. Falls back to the early media SDP.
    pub async fn inject_answer(&self, sdp: Option<String>) {
        if self.is_closed() {
            return;
        }
        let sdp = sdp.or_else(|| {
            self.early_sdp
                .lock()
                .expect("Mutex should not be poisoned")
                .take()
        });
        let Some(sdp) = sdp else {
            warn!(target: "Verto/Call", "Call {}: answer without SDP, ignoring", self.call_id());
            return;
        };
        self.set_state(VoipState::Connected);
        self.core
            .fire_signal(AnswerEvent::new(self.call_id().clone(), sdp).into())
            .await;
    }

    /// The media server hung up.
    pub async fn inject_bye(&self, reason: Option<String>) {
        if self.is_closed() {
            return;
        }
        self.hangup_exchanged.store(true, Ordering::SeqCst);
        self.core.fire_hangup(reason).await;
        self.close().await;
    }
}

#[async_trait]
impl Endpoint for VoipEndpoint {
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
        if self.is_closed() {
            return;
        }
        self.start_collecting(SdpKind::Invite, event.sdp().to_string());
    }

    async fn handle_candidates(&self, event: CandidatesEvent) {
        if self.is_closed() {
            return;
        }
        let mut accumulator = self
            .accumulator
            .lock()
            .expect("Mutex should not be poisoned");
        match accumulator.as_mut() {
            Some(pending) => {
                pending.lines.extend(event.sdp_lines());
                pending.last_update = Some(Instant::now());
            }
            None => {
                debug!(
                    target: "Verto/Call",
                    "Call {}: dropping {} late candidate(s)",
                    self.call_id(),
                    event.candidates.len()
                );
            }
        }
    }

    async fn handle_answer(&self, event: AnswerEvent) {
        if self.is_closed() {
            return;
        }
        self.start_collecting(SdpKind::Answer, event.sdp().to_string());
    }

    async fn handle_hangup(&self, event: HangupEvent) {
        let Some(client) = self.client() else {
            return;
        };
        if self.hangup_exchanged.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accumulator
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        info!(target: "Verto/Call", "Call {}: hanging up ({:?})", self.call_id(), event.reason);
        self.send_bye(client);
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
        self.set_state(VoipState::Closed);
        self.accumulator
            .lock()
            .expect("Mutex should not be poisoned")
            .take();

        if !self.hangup_exchanged.swap(true, Ordering::SeqCst) {
            self.send_bye(client);
        }
        info!(target: "Verto/Call", "Call {}: closed", self.call_id());
        self.core.fire_closed().await;
    }
}
