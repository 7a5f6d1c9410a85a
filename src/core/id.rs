//! Payload identifiers.
//!
//! A payload id is an opaque 16-byte value. New ids are generated as
//! RFC 4122 v4 UUIDs; equality is bytewise. On the wire and on disk the
//! canonical form is the 36-character dashed lowercase hex rendering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::{Error, Result};

/// Opaque 16-byte payload identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadId(Uuid);

impl PayloadId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw 16-byte value.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Canonical 36-character dashed lowercase form.
    ///
    /// This is the fixed rendering used for disk file names and database
    /// key columns.
    pub fn canonical(&self) -> String {
        self.0.hyphenated().to_string()
    }

    /// Parse client-supplied text. Accepts the canonical dashed form and
    /// the 32-character undashed form; anything else is rejected before
    /// reaching a backend.
    pub fn parse(text: &str) -> Result<Self> {
        if text.len() != 36 && text.len() != 32 {
            return Err(Error::InvalidArgument(format!(
                "payload id must be 32 or 36 characters, got {}",
                text.len()
            )));
        }
        Uuid::parse_str(text)
            .map(Self)
            .map_err(|e| Error::InvalidArgument(format!("payload id: {}", e)))
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PayloadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Uuid> for PayloadId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}
