//! Matrix user ids and the localpart encoding used for puppet users.

use std::fmt;

use crate::error::IdentityError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatrixId {
    localpart: String,
    domain: String,
}

impl MatrixId {
    pub fn new(localpart: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            localpart: localpart.into(),
            domain: domain.into(),
        }
    }

    /// Parses `@localpart:domain`. The domain may carry a port.
    pub fn parse(id: &str) -> Result<Self, IdentityError> {
        let rest = id
            .strip_prefix('@')
            .ok_or_else(|| IdentityError::InvalidUserId(id.to_string()))?;
        let (localpart, domain) = rest
            .split_once(':')
            .ok_or_else(|| IdentityError::InvalidUserId(id.to_string()))?;
        if localpart.is_empty() || domain.is_empty() {
            return Err(IdentityError::InvalidUserId(id.to_string()));
        }
        Ok(Self::new(localpart, domain))
    }

    pub fn localpart(&self) -> &str {
        &self.localpart
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}:{}", self.localpart, self.domain)
    }
}

/// Encodes an arbitrary identifier into the localpart character set.
///
/// Lowercase letters, digits and `.-/` are kept, uppercase letters become `_`
/// followed by their lowercase form, `_` becomes `__`, and every other byte
/// becomes `=` followed by two lowercase hex digits.
pub fn encode_localpart(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'/' => out.push(byte as char),
            b'A'..=b'Z' => {
                out.push('_');
                out.push(byte.to_ascii_lowercase() as char);
            }
            b'_' => out.push_str("__"),
            other => out.push_str(&format!("={other:02x}")),
        }
    }
    out
}

/// Reverses [`encode_localpart`]. Returns `None` for malformed input.
pub fn decode_localpart(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let next = *bytes.get(i + 1)?;
                match next {
                    b'_' => out.push(b'_'),
                    b'a'..=b'z' => out.push(next.to_ascii_uppercase()),
                    _ => return None,
                }
                i += 2;
            }
            b'=' => {
                let hex = value.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}
