use serde::{Deserialize, Serialize};

use crate::{clock::VectorClock, entity::EntityKey, id::ClientId, id::OpId};

/// Schema version assumed for operations that predate the field
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Entity type of full-state operations, which touch every entity
pub const ALL_ENTITY_TYPE: &str = "ALL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "CRT")]
    Create,
    #[serde(rename = "UPD")]
    Update,
    #[serde(rename = "DEL")]
    Delete,
    #[serde(rename = "SYNC_IMPORT")]
    SyncImport,
    #[serde(rename = "BACKUP_IMPORT")]
    BackupImport,
    /// Produced by state repair; structurally a full-state import
    #[serde(rename = "REPAIR")]
    Repair,
}

impl OpType {
    /// Full-state ops replace the whole state and bypass conflict detection
    pub fn is_full_state(&self) -> bool { matches!(self, OpType::SyncImport | OpType::BackupImport | OpType::Repair) }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpType::Create => "CRT",
            OpType::Update => "UPD",
            OpType::Delete => "DEL",
            OpType::SyncImport => "SYNC_IMPORT",
            OpType::BackupImport => "BACKUP_IMPORT",
            OpType::Repair => "REPAIR",
        };
        write!(f, "{}", s)
    }
}

pub(crate) fn default_schema_version() -> u32 { DEFAULT_SCHEMA_VERSION }

/// An immutable, causally timestamped mutation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OpId,
    pub client_id: ClientId,
    pub action_type: String,
    pub op_type: OpType,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub vector_clock: VectorClock,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl Operation {
    pub fn is_full_state(&self) -> bool { self.op_type.is_full_state() }

    /// All entity ids this operation touches, `entity_ids` taking precedence over `entity_id`
    pub fn entity_id_list(&self) -> Vec<&str> {
        match (&self.entity_ids, &self.entity_id) {
            (Some(ids), _) if !ids.is_empty() => ids.iter().map(|s| s.as_str()).collect(),
            (_, Some(id)) => vec![id.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn entity_keys(&self) -> Vec<EntityKey> {
        self.entity_id_list().into_iter().map(|id| EntityKey::new(&self.entity_type, id)).collect()
    }

    pub fn primary_entity_key(&self) -> Option<EntityKey> { self.entity_id_list().first().map(|id| EntityKey::new(&self.entity_type, id)) }
}

/// Current wall clock time in milliseconds since the epoch
pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }
