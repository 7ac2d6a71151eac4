//! Wire codec for `m.call.*` room events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::signaling::{ANSWER_MARKER, OFFER_MARKER};
use crate::types::{
    AnswerEvent, CandidatesEvent, HangupEvent, InviteEvent, SessionDescription,
    SignalingEvent,
};

pub const CALL_INVITE: &str = "m.call.invite";
pub const CALL_CANDIDATES: &str = "m.call.candidates";
pub const CALL_ANSWER: &str = "m.call.answer";
pub const CALL_HANGUP: &str = "m.call.hangup";
pub const CALL_EVENT_PREFIX: &str = "m.call.";

pub const ROOM_MEMBER: &str = "m.room.member";
pub const ROOM_MESSAGE: &str = "m.room.message";

/// The only call-event version this bridge speaks.
pub const CALL_VERSION: i64 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallEventError {
    #[error("unsupported call event type {0}")]
    UnknownType(String),
    #[error("call event has no version")]
    MissingVersion,
    #[error("unsupported call event version {0}")]
    UnsupportedVersion(i64),
    #[error("malformed call event content: {0}")]
    Malformed(String),
    #[error("invalid {0} event")]
    Invalid(&'static str),
}

/// A room event as pushed by the homeserver to an application service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub origin_server_ts: Option<i64>,
    #[serde(default)]
    pub unsigned: Option<Value>,
    /// Older homeservers put `age` at the top level instead of in `unsigned`.
    #[serde(default)]
    pub age: Option<i64>,
}

impl RoomEvent {
    pub fn is_call_event(&self) -> bool {
        self.kind.starts_with(CALL_EVENT_PREFIX)
    }

    /// Milliseconds since the event was sent, as reported by the homeserver.
    pub fn age(&self) -> i64 {
        self.unsigned
            .as_ref()
            .and_then(|u| u.get("age"))
            .and_then(Value::as_i64)
            .or(self.age)
            .unwrap_or(0)
    }

    /// The `membership` value of an `m.room.member` event.
    pub fn membership(&self) -> Option<&str> {
        self.content.get("membership").and_then(Value::as_str)
    }
}

#[derive(Deserialize)]
struct Versioned {
    #[serde(default)]
    version: Option<i64>,
}

/// Decodes the content of an `m.call.*` event.
///
/// The returned event has already passed its validity predicate.
pub fn parse_call_event(kind: &str, content: &Value) -> Result<SignalingEvent, CallEventError> {
    let versioned: Versioned = serde_json::from_value(content.clone())
        .map_err(|e| CallEventError::Malformed(e.to_string()))?;
    match versioned.version {
        None => return Err(CallEventError::MissingVersion),
        Some(CALL_VERSION) => {}
        Some(v) => return Err(CallEventError::UnsupportedVersion(v)),
    }

    let event: SignalingEvent = match kind {
        CALL_INVITE => decode::<InviteEvent>(content)?.into(),
        CALL_CANDIDATES => decode::<CandidatesEvent>(content)?.into(),
        CALL_ANSWER => decode::<AnswerEvent>(content)?.into(),
        CALL_HANGUP => decode::<HangupEvent>(content)?.into(),
        other => return Err(CallEventError::UnknownType(other.to_string())),
    };

    if !event.is_valid() {
        return Err(CallEventError::Invalid(event.kind()));
    }
    Ok(event)
}

fn decode<T: for<'de> Deserialize<'de>>(content: &Value) -> Result<T, CallEventError> {
    serde_json::from_value(content.clone()).map_err(|e| CallEventError::Malformed(e.to_string()))
}

/// The event type and content to send for an outbound signaling event.
///
/// Offers and answers are re-stamped with the markers the chat protocol
/// expects, whatever marker the other side used.
pub fn call_event_content(event: &SignalingEvent) -> (&'static str, Value) {
    let (kind, content) = match event {
        SignalingEvent::Invite(ev) => {
            let mut ev = ev.clone();
            ev.offer = Some(SessionDescription::new(OFFER_MARKER, ev.sdp()));
            (CALL_INVITE, serde_json::to_value(ev))
        }
        SignalingEvent::Candidates(ev) => (CALL_CANDIDATES, serde_json::to_value(ev)),
        SignalingEvent::Answer(ev) => {
            let mut ev = ev.clone();
            ev.answer = Some(SessionDescription::new(ANSWER_MARKER, ev.sdp()));
            (CALL_ANSWER, serde_json::to_value(ev))
        }
        SignalingEvent::Hangup(ev) => (CALL_HANGUP, serde_json::to_value(ev)),
    };

    let mut content = match content {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("call_id".into(), Value::String(event.call_id().to_string()));
            map
        }
    };
    content.insert("version".into(), Value::from(CALL_VERSION));
    (kind, Value::Object(content))
}
