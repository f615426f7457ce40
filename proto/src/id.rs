use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use ulid::Ulid;

use crate::error::DecodeError;

/// Globally unique, time-sortable operation identifier.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Ulid);

impl OpId {
    pub fn new() -> Self { OpId(Ulid::new()) }

    pub fn from_ulid(ulid: Ulid) -> Self { OpId(ulid) }

    pub fn to_bytes(&self) -> [u8; 16] { self.0.to_bytes() }

    pub fn from_bytes(bytes: [u8; 16]) -> Self { OpId(Ulid::from_bytes(bytes)) }

    /// Milliseconds since the epoch encoded in the id
    pub fn timestamp_ms(&self) -> u64 { self.0.timestamp_ms() }

    /// last 6 characters, for log output
    pub fn to_short(&self) -> String {
        let value = self.0.to_string();
        value[value.len() - 6..].to_string()
    }
}

impl Default for OpId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        if f.alternate() {
            write!(f, "{}", self.to_short())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> { write!(f, "OpId({})", self.0) }
}

impl FromStr for OpId {
    type Err = DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Ok(OpId(Ulid::from_string(s)?)) }
}

impl TryFrom<&str> for OpId {
    type Error = DecodeError;
    fn try_from(id: &str) -> Result<Self, Self::Error> { id.parse() }
}

/// Identifies one replica (device or tab). Each client only ever increments its own clock entry.
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self { ClientId(id.into()) }

    /// A fresh random client id
    pub fn generate() -> Self { ClientId(format!("c{}", Ulid::new().to_string().to_lowercase())) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ClientId({})", self.0) }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self { ClientId(s.to_string()) }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self { ClientId(s) }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str { &self.0 }
}
