//! Validated notification payloads.

use std::fmt;

use crate::wire::{WireDecode, WireEncode, WireError, WireReader, WireWriter};

/// The text of a published notification, 1–128 bytes.  Immutable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifMessage(String);

const MIN_LEN: usize = 1;
const MAX_LEN: usize = 128;

impl NotifMessage {
    pub fn new(content: impl Into<String>) -> Result<Self, InvalidNotifMessage> {
        let content = content.into();
        if content.len() < MIN_LEN {
            return Err(InvalidNotifMessage {
                content,
                why: "notification is too short",
            });
        }
        if content.len() > MAX_LEN {
            return Err(InvalidNotifMessage {
                content,
                why: "notification is too long",
            });
        }
        Ok(NotifMessage(content))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotifMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl WireEncode for NotifMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.0);
    }
}

impl WireDecode for NotifMessage {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let content = r.take_string()?;
        NotifMessage::new(content).map_err(|e| WireError::InvalidValue(e.to_string()))
    }
}

/// The candidate payload violated the length rules.
#[derive(Debug, Clone, thiserror::Error)]
#[error("\"{content}\": {why}")]
pub struct InvalidNotifMessage {
    pub content: String,
    pub why: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized() {
        assert!(NotifMessage::new("").is_err());
        let oversized = "0123456789abcdef".repeat(8) + "0";
        assert_eq!(oversized.len(), 129);
        assert!(NotifMessage::new(oversized).is_err());
    }

    #[test]
    fn accepts_boundaries() {
        assert!(NotifMessage::new("x").is_ok());
        assert!(NotifMessage::new("0123456789abcdef".repeat(8)).is_ok());
        assert!(NotifMessage::new("Hello, World!").is_ok());
    }
}
