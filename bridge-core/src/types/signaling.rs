//! Signaling payloads exchanged between the two sides of a call.
//!
//! These are the protocol-neutral value objects the endpoints hand to a call
//! and receive back from it. Field names follow the chat-side wire shape so
//! the same structs double as `m.call.*` event content.

use serde::{Deserialize, Serialize};

use super::call::CallId;

pub const INVITE_MARKER: &str = "invite";
pub const OFFER_MARKER: &str = "offer";
pub const ANSWER_MARKER: &str = "answer";

/// An SDP body plus its type marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

impl SessionDescription {
    pub fn new(kind: &str, sdp: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.to_string()),
            sdp: Some(sdp.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(&self.kind, Some(k) if !k.is_empty()) && matches!(&self.sdp, Some(s) if !s.is_empty())
    }

    /// The SDP body, or an empty string when absent.
    pub fn sdp(&self) -> &str {
        self.sdp.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteEvent {
    pub call_id: CallId,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub lifetime: Option<i64>,
}

impl InviteEvent {
    /// Builds an invite, stamping the offer with the `invite` marker.
    pub fn new(call_id: CallId, sdp: impl Into<String>, lifetime_ms: i64) -> Self {
        Self {
            call_id,
            offer: Some(SessionDescription::new(INVITE_MARKER, sdp)),
            lifetime: Some(lifetime_ms),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.call_id.is_empty()
            && self.offer.as_ref().is_some_and(SessionDescription::is_valid)
            && self.lifetime.is_some_and(|l| l > 0)
    }

    pub fn sdp(&self) -> &str {
        self.offer.as_ref().map(SessionDescription::sdp).unwrap_or_default()
    }
}

/// One ICE candidate as carried by `m.call.candidates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    /// The candidate as an SDP attribute line, without line terminator.
    pub fn sdp_line(&self) -> String {
        if self.candidate.starts_with("a=") {
            self.candidate.clone()
        } else {
            format!("a={}", self.candidate)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatesEvent {
    pub call_id: CallId,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl CandidatesEvent {
    pub fn new(call_id: CallId, candidates: Vec<Candidate>) -> Self {
        Self {
            call_id,
            candidates,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.call_id.is_empty() && self.candidates.iter().all(|c| !c.candidate.is_empty())
    }

    pub fn sdp_lines(&self) -> impl Iterator<Item = String> + '_ {
        self.candidates.iter().map(Candidate::sdp_line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerEvent {
    pub call_id: CallId,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
}

impl AnswerEvent {
    /// Builds an answer, stamping the `answer` marker.
    pub fn new(call_id: CallId, sdp: impl Into<String>) -> Self {
        Self {
            call_id,
            answer: Some(SessionDescription::new(ANSWER_MARKER, sdp)),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.call_id.is_empty() && self.answer.as_ref().is_some_and(SessionDescription::is_valid)
    }

    pub fn sdp(&self) -> &str {
        self.answer.as_ref().map(SessionDescription::sdp).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangupEvent {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HangupEvent {
    pub fn new(call_id: CallId, reason: Option<String>) -> Self {
        Self { call_id, reason }
    }

    pub fn is_valid(&self) -> bool {
        !self.call_id.is_empty()
    }
}

/// Any of the four call-signaling events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Invite(InviteEvent),
    Candidates(CandidatesEvent),
    Answer(AnswerEvent),
    Hangup(HangupEvent),
}

impl SignalingEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Invite(ev) => &ev.call_id,
            Self::Candidates(ev) => &ev.call_id,
            Self::Answer(ev) => &ev.call_id,
            Self::Hangup(ev) => &ev.call_id,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::Invite(ev) => ev.is_valid(),
            Self::Candidates(ev) => ev.is_valid(),
            Self::Answer(ev) => ev.is_valid(),
            Self::Hangup(ev) => ev.is_valid(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invite(_) => "invite",
            Self::Candidates(_) => "candidates",
            Self::Answer(_) => "answer",
            Self::Hangup(_) => "hangup",
        }
    }

    pub fn is_hangup(&self) -> bool {
        matches!(self, Self::Hangup(_))
    }
}

impl From<InviteEvent> for SignalingEvent {
    fn from(ev: InviteEvent) -> Self {
        Self::Invite(ev)
    }
}

impl From<CandidatesEvent> for SignalingEvent {
    fn from(ev: CandidatesEvent) -> Self {
        Self::Candidates(ev)
    }
}

impl From<AnswerEvent> for SignalingEvent {
    fn from(ev: AnswerEvent) -> Self {
        Self::Answer(ev)
    }
}

impl From<HangupEvent> for SignalingEvent {
    fn from(ev: HangupEvent) -> Self {
        Self::Hangup(ev)
    }
}
