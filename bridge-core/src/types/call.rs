use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cross-protocol correlation key for the signaling of one call.
///
/// Supplied by whichever side originates the call and reused verbatim by the
/// other side, so it is never generated by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which signaling side an endpoint or a call originated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Chat,
    Voip,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Chat => f.write_str("chat"),
            Side::Voip => f.write_str("voip"),
        }
    }
}

/// Describes a freshly discovered inbound call.
///
/// For a chat-originated call `caller` is the chat user placing the call and
/// `callee` is the puppet user they called. For a carrier-originated call
/// both are carrier identities (numbers).
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub origin: Side,
    /// Room id on the chat side, control session id on the VoIP side.
    pub channel_id: String,
    pub caller: String,
    pub callee: String,
    pub created_at: DateTime<Utc>,
}

impl CallInfo {
    pub fn new(
        call_id: CallId,
        origin: Side,
        channel_id: impl Into<String>,
        caller: impl Into<String>,
        callee: impl Into<String>,
    ) -> Self {
        Self {
            call_id,
            origin,
            channel_id: channel_id.into(),
            caller: caller.into(),
            callee: callee.into(),
            created_at: Utc::now(),
        }
    }
}
