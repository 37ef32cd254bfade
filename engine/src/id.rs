//! Record identifiers.
//!
//! A record is either known to the remote store or was minted on this device
//! and has not been committed yet. The distinction lives in the type so the
//! sync worker can match on it; on the wire a local id is [`LOCAL_PREFIX`]
//! followed by an opaque token, and a remote id is stored verbatim.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved prefix marking a locally minted identifier in serialized form.
pub const LOCAL_PREFIX: &str = "local-";

/// Identifier of a store or payment record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RecordId {
    /// Minted on this device; the remote store has never seen it.
    Local(String),
    /// Assigned by the remote store.
    Remote(String),
}

impl RecordId {
    /// Create a local identifier from an opaque token (without the prefix).
    pub fn local(token: impl Into<String>) -> Self {
        RecordId::Local(token.into())
    }

    /// Create a remote identifier.
    pub fn remote(id: impl Into<String>) -> Self {
        RecordId::Remote(id.into())
    }

    /// Parse the serialized form.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.strip_prefix(LOCAL_PREFIX) {
            Some("") => Err(Error::InvalidRecordId(raw.to_string())),
            Some(token) => Ok(RecordId::Local(token.to_string())),
            None if raw.trim().is_empty() => Err(Error::InvalidRecordId(raw.to_string())),
            None => Ok(RecordId::Remote(raw.to_string())),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RecordId::Local(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, RecordId::Remote(_))
    }

    /// The remote id, if the record has been committed.
    pub fn as_remote(&self) -> Option<&str> {
        match self {
            RecordId::Remote(id) => Some(id),
            RecordId::Local(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Local(token) => write!(f, "{LOCAL_PREFIX}{token}"),
            RecordId::Remote(id) => f.write_str(id),
        }
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RecordId::parse(s)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RecordId {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        RecordId::parse(&raw)
    }
}
