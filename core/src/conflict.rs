//! Causal classification of incoming remote operations.
//!
//! For every entity key a remote op touches, the local frontier is
//! `baseline ⊔ clocks of pending local ops`, where the baseline is the applied frontier for the
//! key, or the snapshot clock if the entity existed when the snapshot was taken, or empty.
//! The remote clock is then compared against it:
//!
//! | local vs remote | no pending local ops | pending local ops |
//! |-----------------|----------------------|-------------------|
//! | LessThan        | apply                | apply             |
//! | GreaterThan     | skip (stale)         | skip (stale)      |
//! | Equal           | skip (duplicate)     | skip (duplicate)  |
//! | Concurrent      | apply                | conflict          |

use std::collections::{BTreeMap, BTreeSet, HashMap};

use oplog_proto::{ClockOrdering, EntityKey, Operation, VectorClock};

/// Which side a last-write-wins decision favours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already dominated by what this client knows
    Stale,
    /// Identical clock to the local frontier
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityConflict {
    pub key: EntityKey,
    pub local_ops: Vec<Operation>,
    pub remote_ops: Vec<Operation>,
    pub suggested_resolution: Resolution,
}

impl EntityConflict {
    pub fn entity_type(&self) -> &str { self.key.entity_type() }

    pub fn entity_id(&self) -> &str { self.key.entity_id() }
}

#[derive(Debug, Default)]
pub struct ConflictResult {
    /// Safe to apply directly, in arrival order
    pub non_conflicting: Vec<Operation>,
    pub conflicts: Vec<EntityConflict>,
    pub skipped: Vec<(Operation, SkipReason)>,
}

/// Local causal state the detector compares against
#[derive(Debug, Default, Clone)]
pub struct DetectionContext {
    pub applied_frontier: HashMap<EntityKey, VectorClock>,
    pub pending_by_entity: BTreeMap<EntityKey, Vec<Operation>>,
    pub snapshot_clock: Option<VectorClock>,
    /// `None` when the snapshot predates entity-key tracking
    pub snapshot_entity_keys: Option<BTreeSet<EntityKey>>,
}

impl DetectionContext {
    fn baseline(&self, key: &EntityKey) -> VectorClock {
        if let Some(clock) = self.applied_frontier.get(key) {
            return clock.clone();
        }
        let Some(snapshot_clock) = &self.snapshot_clock else {
            return VectorClock::new();
        };
        // without tracked keys we cannot tell, so assume the entity existed
        let existed = self.snapshot_entity_keys.as_ref().map_or(true, |keys| keys.contains(key));
        if existed {
            snapshot_clock.clone()
        } else {
            VectorClock::new()
        }
    }

    fn pending(&self, key: &EntityKey) -> &[Operation] { self.pending_by_entity.get(key).map(Vec::as_slice).unwrap_or(&[]) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyVerdict {
    Apply,
    Skip(SkipReason),
    Conflict,
}

fn classify_key(ctx: &DetectionContext, key: &EntityKey, remote: &VectorClock) -> KeyVerdict {
    let pending = ctx.pending(key);
    let baseline = ctx.baseline(key);
    if pending.is_empty() && baseline.is_empty() {
        return KeyVerdict::Apply;
    }

    let mut local = baseline;
    for op in pending {
        local.merge(&op.vector_clock);
    }
    match local.compare(remote) {
        ClockOrdering::LessThan => KeyVerdict::Apply,
        ClockOrdering::GreaterThan => KeyVerdict::Skip(SkipReason::Stale),
        ClockOrdering::Equal => KeyVerdict::Skip(SkipReason::Duplicate),
        ClockOrdering::Concurrent if pending.is_empty() => KeyVerdict::Apply,
        ClockOrdering::Concurrent => KeyVerdict::Conflict,
    }
}

/// Classify each remote op against the local frontier.
///
/// A multi-entity op conflicts if any of its keys conflicts, and is skipped only if every key
/// says skip.
pub fn detect_conflicts(remote_ops: Vec<Operation>, ctx: &DetectionContext) -> ConflictResult {
    let mut result = ConflictResult::default();
    let mut conflicts: BTreeMap<EntityKey, Vec<Operation>> = BTreeMap::new();

    for op in remote_ops {
        let keys = op.entity_keys();
        let verdicts: Vec<(EntityKey, KeyVerdict)> = keys.into_iter().map(|k| (k.clone(), classify_key(ctx, &k, &op.vector_clock))).collect();

        let conflicting: Vec<EntityKey> = verdicts.iter().filter(|(_, v)| *v == KeyVerdict::Conflict).map(|(k, _)| k.clone()).collect();
        if !conflicting.is_empty() {
            for key in conflicting {
                conflicts.entry(key).or_default().push(op.clone());
            }
            continue;
        }

        let first_skip = verdicts.iter().find_map(|(_, v)| match v {
            KeyVerdict::Skip(reason) => Some(*reason),
            _ => None,
        });
        let all_skip = !verdicts.is_empty() && verdicts.iter().all(|(_, v)| matches!(v, KeyVerdict::Skip(_)));
        match first_skip {
            Some(reason) if all_skip => result.skipped.push((op, reason)),
            _ => result.non_conflicting.push(op),
        }
    }

    result.conflicts = conflicts
        .into_iter()
        .map(|(key, remote_ops)| {
            let local_ops = ctx.pending(&key).to_vec();
            let suggested_resolution = lww_winner(&local_ops, &remote_ops);
            EntityConflict { key, local_ops, remote_ops, suggested_resolution }
        })
        .collect();
    result
}

/// Last-write-wins between two sides of a conflict.
///
/// Each side is represented by its op with the greatest `(timestamp, client_id)`. The later
/// timestamp wins; equal timestamps go to the lexicographically greater client id, so every
/// replica reaches the same decision.
pub fn lww_winner(local_ops: &[Operation], remote_ops: &[Operation]) -> Resolution {
    let latest = |ops: &[Operation]| ops.iter().map(|op| (op.timestamp, op.client_id.clone())).max();
    match (latest(local_ops), latest(remote_ops)) {
        (Some(local), Some(remote)) if local > remote => Resolution::Local,
        (Some(_), None) => Resolution::Local,
        _ => Resolution::Remote,
    }
}
