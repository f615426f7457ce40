//! Schema versioning of operations and snapshots.
//!
//! Every remote op passes through the [`SchemaGate`] before anything else sees it. Ops from
//! older supported schemas are upgraded step by step through the registered
//! [`SchemaMigration`]s; ops outside the supported window abort the sync.

use std::sync::atomic::{AtomicBool, Ordering};

use oplog_proto::{EntityKey, Operation};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::SchemaConfig, error::MigrationError};

pub type StateMigrationFn = fn(Value) -> Result<Value, String>;

/// Returning `Ok(None)` drops an op that no longer has meaning under the new schema
pub type OperationMigrationFn = fn(Operation) -> Result<Option<Operation>, String>;

/// One step of the schema chain, always `from_version + 1 == to_version`
#[derive(Clone)]
pub struct SchemaMigration {
    pub from_version: u32,
    pub to_version: u32,
    pub description: &'static str,
    pub migrate_state: StateMigrationFn,
    /// Ops that need no rewriting for this step leave this unset
    pub migrate_operation: Option<OperationMigrationFn>,
}

impl std::fmt::Debug for SchemaMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SchemaMigration(v{} -> v{}: {})", self.from_version, self.to_version, self.description)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Current,
    /// Older but supported; needs migrating
    Older,
    NewerWithinSkip,
    Unsupported,
    TooOld,
}

#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    config: SchemaConfig,
    migrations: Vec<SchemaMigration>,
}

impl SchemaMigrator {
    /// Validates that the registry is a contiguous chain from the minimum supported version up to
    /// the current one
    pub fn new(config: SchemaConfig, mut migrations: Vec<SchemaMigration>) -> Result<Self, MigrationError> {
        migrations.sort_by_key(|m| m.from_version);
        for m in &migrations {
            if m.to_version != m.from_version + 1 {
                return Err(MigrationError::InvalidRegistry(format!("{:?} must advance exactly one version", m)));
            }
        }
        for pair in migrations.windows(2) {
            if pair[0].to_version != pair[1].from_version {
                return Err(MigrationError::InvalidRegistry(format!("gap between {:?} and {:?}", pair[0], pair[1])));
            }
        }
        match (migrations.first(), migrations.last()) {
            (Some(first), Some(last)) => {
                if last.to_version != config.current_version {
                    return Err(MigrationError::InvalidRegistry(format!("chain ends at v{}, current is v{}", last.to_version, config.current_version)));
                }
                if first.from_version > config.min_supported_version {
                    return Err(MigrationError::InvalidRegistry(format!(
                        "chain starts at v{}, minimum supported is v{}",
                        first.from_version, config.min_supported_version
                    )));
                }
            }
            _ if config.min_supported_version < config.current_version => {
                return Err(MigrationError::InvalidRegistry(format!(
                    "no migrations registered but v{} through v{} are supported",
                    config.min_supported_version, config.current_version
                )));
            }
            _ => {}
        }
        Ok(Self { config, migrations })
    }

    /// A migrator with no migrations, for a schema that has never changed
    pub fn identity(config: SchemaConfig) -> Result<Self, MigrationError> { Self::new(config, Vec::new()) }

    pub fn current_version(&self) -> u32 { self.config.current_version }

    pub fn check_version(&self, version: u32) -> VersionCheck {
        let SchemaConfig { current_version, min_supported_version, max_version_skip } = self.config;
        if version < min_supported_version {
            VersionCheck::TooOld
        } else if version < current_version {
            VersionCheck::Older
        } else if version == current_version {
            VersionCheck::Current
        } else if version - current_version <= max_version_skip {
            VersionCheck::NewerWithinSkip
        } else {
            VersionCheck::Unsupported
        }
    }

    fn step(&self, from: u32) -> Result<&SchemaMigration, MigrationError> {
        self.migrations.iter().find(|m| m.from_version == from).ok_or(MigrationError::Failed { from, reason: "no migration registered".into() })
    }

    /// Upgrade `op` to the current schema. Ops at or above the current version pass untouched.
    pub fn migrate_operation(&self, mut op: Operation) -> Result<Option<Operation>, MigrationError> {
        while op.schema_version < self.config.current_version {
            let from = op.schema_version;
            let step = self.step(from)?;
            if let Some(migrate) = step.migrate_operation {
                match migrate(op).map_err(|reason| MigrationError::Failed { from, reason })? {
                    Some(next) => op = next,
                    None => return Ok(None),
                }
            }
            op.schema_version = step.to_version;
        }
        Ok(Some(op))
    }

    /// Upgrade snapshot state written under `from_version`
    pub fn migrate_state(&self, mut state: Value, from_version: u32) -> Result<Value, MigrationError> {
        let mut version = from_version;
        while version < self.config.current_version {
            let step = self.step(version)?;
            debug!("migrating snapshot state: {}", step.description);
            state = (step.migrate_state)(state).map_err(|reason| MigrationError::Failed { from: version, reason })?;
            version = step.to_version;
        }
        Ok(state)
    }
}

#[derive(Debug, Default)]
pub struct GateOutcome {
    pub ops: Vec<Operation>,
    /// Entities whose ops were dropped by a migration; later ops citing them may not apply
    pub dropped_entities: Vec<EntityKey>,
    /// Set the first time per session that ops from a newer schema are seen
    pub newer_version: Option<u32>,
}

/// Version gate applied to every incoming remote batch
#[derive(Debug)]
pub struct SchemaGate {
    migrator: SchemaMigrator,
    warned_newer: AtomicBool,
}

impl SchemaGate {
    pub fn new(migrator: SchemaMigrator) -> Self { Self { migrator, warned_newer: AtomicBool::new(false) } }

    pub fn migrator(&self) -> &SchemaMigrator { &self.migrator }

    /// Abort on any op outside the supported window, otherwise migrate the batch
    pub fn apply(&self, ops: Vec<Operation>) -> Result<GateOutcome, MigrationError> {
        let current = self.migrator.current_version();
        let mut outcome = GateOutcome { ops: Vec::with_capacity(ops.len()), ..Default::default() };

        for op in ops {
            match self.migrator.check_version(op.schema_version) {
                VersionCheck::TooOld => {
                    return Err(MigrationError::VersionTooOld { found: op.schema_version, min: self.migrator.config.min_supported_version })
                }
                VersionCheck::Unsupported => return Err(MigrationError::VersionUnsupported { found: op.schema_version, current }),
                VersionCheck::NewerWithinSkip => {
                    if !self.warned_newer.swap(true, Ordering::SeqCst) {
                        warn!("received ops from schema v{} (this client is v{}); an update is available", op.schema_version, current);
                        outcome.newer_version = Some(op.schema_version);
                    }
                }
                VersionCheck::Current | VersionCheck::Older => {}
            }

            let keys = op.entity_keys();
            let id = op.id;
            match self.migrator.migrate_operation(op)? {
                Some(migrated) => outcome.ops.push(migrated),
                None => {
                    debug!("migration dropped op {:#}", id);
                    outcome.dropped_entities.extend(keys);
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::op;
    use oplog_proto::OpType;
    use serde_json::json;

    fn rename_title(mut op: Operation) -> Result<Option<Operation>, String> {
        if let Some(title) = op.payload.as_object_mut().and_then(|p| p.remove("title")) {
            op.payload["name"] = title;
        }
        Ok(Some(op))
    }

    fn drop_tags(op: Operation) -> Result<Option<Operation>, String> { Ok((op.entity_type != "TAG").then_some(op)) }

    fn add_flag(mut state: Value) -> Result<Value, String> {
        state["migrated"] = json!(true);
        Ok(state)
    }

    fn config(current: u32, min: u32) -> SchemaConfig { SchemaConfig { current_version: current, min_supported_version: min, max_version_skip: 2 } }

    fn migrator() -> SchemaMigrator {
        SchemaMigrator::new(
            config(3, 1),
            vec![
                SchemaMigration { from_version: 2, to_version: 3, description: "drop tags", migrate_state: add_flag, migrate_operation: Some(drop_tags) },
                SchemaMigration { from_version: 1, to_version: 2, description: "rename", migrate_state: add_flag, migrate_operation: Some(rename_title) },
            ],
        )
        .unwrap()
    }

    fn versioned(entity_type: &str, version: u32) -> Operation {
        let mut o = op("B", OpType::Update, entity_type, "x", [("B", 1)]);
        o.schema_version = version;
        o
    }

    #[test]
    fn registry_must_be_contiguous_and_reach_current() {
        let step = |from, to| SchemaMigration { from_version: from, to_version: to, description: "", migrate_state: add_flag, migrate_operation: None };
        assert!(SchemaMigrator::new(config(3, 1), vec![step(1, 2)]).is_err());
        assert!(SchemaMigrator::new(config(3, 1), vec![step(1, 3)]).is_err());
        assert!(SchemaMigrator::new(config(3, 2), vec![step(2, 3)]).is_ok());
        assert!(SchemaMigrator::identity(config(2, 1)).is_err());
        assert!(SchemaMigrator::identity(config(1, 1)).is_ok());
    }

    #[test]
    fn version_window() {
        let m = migrator();
        assert_eq!(m.check_version(0), VersionCheck::TooOld);
        assert_eq!(m.check_version(1), VersionCheck::Older);
        assert_eq!(m.check_version(3), VersionCheck::Current);
        assert_eq!(m.check_version(5), VersionCheck::NewerWithinSkip);
        assert_eq!(m.check_version(6), VersionCheck::Unsupported);
    }

    #[test]
    fn operations_walk_the_chain() {
        let m = migrator();
        let migrated = m.migrate_operation(versioned("TASK", 1)).unwrap().unwrap();
        assert_eq!(migrated.schema_version, 3);
        assert!(migrated.payload.get("name").is_some());
        assert!(migrated.payload.get("title").is_none());

        assert!(m.migrate_operation(versioned("TAG", 1)).unwrap().is_none());
        assert_eq!(m.migrate_state(json!({}), 1).unwrap(), json!({"migrated": true}));
    }

    #[test]
    fn gate_tracks_dropped_entities_and_warns_once() {
        let gate = SchemaGate::new(migrator());
        let outcome = gate.apply(vec![versioned("TAG", 2), versioned("TASK", 4), versioned("TASK", 4)]).unwrap();
        assert_eq!(outcome.ops.len(), 2);
        assert_eq!(outcome.dropped_entities, vec![EntityKey::new("TAG", "x")]);
        assert_eq!(outcome.newer_version, Some(4));

        let again = gate.apply(vec![versioned("TASK", 5)]).unwrap();
        assert_eq!(again.newer_version, None);
    }

    #[test]
    fn gate_aborts_outside_the_window() {
        let gate = SchemaGate::new(migrator());
        assert!(matches!(gate.apply(vec![versioned("TASK", 0)]), Err(MigrationError::VersionTooOld { found: 0, min: 1 })));
        assert!(matches!(gate.apply(vec![versioned("TASK", 3), versioned("TASK", 9)]), Err(MigrationError::VersionUnsupported { found: 9, .. })));
    }
}
