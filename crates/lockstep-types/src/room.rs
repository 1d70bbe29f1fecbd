//! Room identifiers.
//!
//! A room is the unit of isolation for timelines: every event belongs to
//! exactly one room, and watchers subscribe per room. Identifiers must be
//! non-empty strings of hexadecimal digits (`^[0-9a-fA-F]+$`). Validation
//! happens at construction and during deserialization, so a [`RoomId`]
//! value is always well-formed.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced when a string is not a valid room identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    /// The identifier was empty.
    #[error("room_id must not be empty")]
    Empty,

    /// The identifier contained a non-hexadecimal character.
    #[error("room_id must contain only hexadecimal characters, found {found:?}")]
    InvalidCharacter {
        /// The first offending character.
        found: char,
    },
}

/// A validated room identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RoomIdError`] if `raw` is empty or contains anything
    /// other than ASCII hexadecimal digits.
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        validate(raw)?;
        Ok(Self(raw.to_owned()))
    }

    /// Return the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `raw` would be accepted by [`RoomId::parse`].
    pub fn is_valid(raw: &str) -> bool {
        validate(raw).is_ok()
    }
}

fn validate(raw: &str) -> Result<(), RoomIdError> {
    if raw.is_empty() {
        return Err(RoomIdError::Empty);
    }
    match raw.chars().find(|c| !c.is_ascii_hexdigit()) {
        Some(found) => Err(RoomIdError::InvalidCharacter { found }),
        None => Ok(()),
    }
}

impl core::fmt::Display for RoomId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value))
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_mixed_case_hex() {
        let id = RoomId::parse("a1B2c3").unwrap();
        assert_eq!(id.as_str(), "a1B2c3");
        assert_eq!(id.to_string(), "a1B2c3");
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(RoomId::parse(""), Err(RoomIdError::Empty));
    }

    #[test]
    fn rejects_non_hex() {
        assert_eq!(
            RoomId::parse("abcz"),
            Err(RoomIdError::InvalidCharacter { found: 'z' })
        );
        assert!(!RoomId::is_valid("room-1"));
        assert!(!RoomId::is_valid(" ab"));
    }

    #[test]
    fn deserialization_validates() {
        let ok: RoomId = serde_json::from_str("\"ff00\"").unwrap();
        assert_eq!(ok.as_str(), "ff00");

        let bad: Result<RoomId, _> = serde_json::from_str("\"not hex\"");
        assert!(bad.is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = RoomId::parse("beef").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"beef\"");
    }
}
