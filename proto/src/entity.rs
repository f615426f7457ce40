use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Entity id used for singleton state slices
pub const SINGLETON_ID: &str = "*";

/// `"ENTITY_TYPE:entityId"`. Reversible by splitting on the first `:`, so ids may themselves contain colons.
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(entity_type: &str, entity_id: &str) -> Self { EntityKey(format!("{}:{}", entity_type, entity_id)) }

    pub fn entity_type(&self) -> &str { self.split().0 }

    pub fn entity_id(&self) -> &str { self.split().1 }

    pub fn split(&self) -> (&str, &str) {
        // constructors guarantee the separator is present
        self.0.split_once(':').unwrap_or((self.0.as_str(), ""))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl FromStr for EntityKey {
    type Err = DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((ty, _)) if !ty.is_empty() => Ok(EntityKey(s.to_string())),
            _ => Err(DecodeError::InvalidEntityKey(s.to_string())),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "EntityKey({})", self.0) }
}
