//! Validated user handles.

use std::fmt;

use crate::wire::{WireDecode, WireEncode, WireError, WireReader, WireWriter};

/// A user handle such as `@helloworld`.
///
/// Total length is 5–21 bytes including the mandatory leading `@`.  The
/// first name byte must be an ASCII letter or underscore; the remaining
/// name bytes may also be digits.  Immutable once constructed, so a clone
/// is always a valid handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Username(String);

/// Name length limits, excluding the `@` prefix.
const MIN_NAME_LEN: usize = 4;
const MAX_NAME_LEN: usize = 20;

impl Username {
    pub fn new(content: impl Into<String>) -> Result<Self, InvalidUsername> {
        let content = content.into();
        let fail = |why| {
            Err(InvalidUsername {
                content: content.clone(),
                why,
            })
        };

        if content.len() < MIN_NAME_LEN + 1 {
            return fail("username is too short");
        }
        if content.len() > MAX_NAME_LEN + 1 {
            return fail("username is too long");
        }
        let bytes = content.as_bytes();
        if bytes[0] != b'@' {
            return fail("usernames must be prefixed with '@'");
        }
        if !bytes[1].is_ascii_alphabetic() && bytes[1] != b'_' {
            return fail("first username character must be an ASCII letter or underscore");
        }
        if !bytes[2..]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            return fail("username characters must be ASCII letters, digits or underscores");
        }

        Ok(Username(content))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl WireEncode for Username {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.0);
    }
}

impl WireDecode for Username {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let content = r.take_string()?;
        Username::new(content).map_err(|e| WireError::InvalidValue(e.to_string()))
    }
}

/// The candidate string violated the username rules.
#[derive(Debug, Clone, thiserror::Error)]
#[error("\"{content}\": {why}")]
pub struct InvalidUsername {
    pub content: String,
    pub why: &'static str,
}
