//! Pluggable conflict resolution (C7).
//!
//! Conflicts are never silently dropped (§7, invariant `EXPLICIT_CONFLICTS`):
//! every concurrent pair is recorded in `sync_conflicts` by [`crate::import`]
//! before a [`ConflictPolicy`] is consulted for what, if anything, to apply.
//! A policy that declines leaves the conflict row unresolved for manual
//! handling.

use std::fmt;
use std::sync::Arc;

use crate::clock::Hlc;
use crate::codec::{decode_map, Value, ValueMap};
use crate::error::Result;
use crate::log::operation::{OperationType, SyncOperation};

/// The two concurrent operations a policy is asked to adjudicate, plus the
/// decoded column maps so policies don't each re-implement the codec calls.
pub struct ConflictContext<'a> {
    pub local_op: &'a SyncOperation,
    pub remote_op: &'a SyncOperation,
}

impl<'a> ConflictContext<'a> {
    pub fn new(local_op: &'a SyncOperation, remote_op: &'a SyncOperation) -> Self {
        ConflictContext { local_op, remote_op }
    }

    fn local_hlc(&self) -> Result<Hlc> {
        self.local_op.hlc()
    }

    fn remote_hlc(&self) -> Result<Hlc> {
        self.remote_op.hlc()
    }

    /// `true` if the remote operation's HLC strictly postdates the local one.
    fn remote_wins(&self) -> Result<bool> {
        Ok(self.remote_hlc()? > self.local_hlc()?)
    }

    fn decode(values: &Option<Vec<u8>>) -> Result<ValueMap> {
        match values {
            Some(bytes) => decode_map(bytes),
            None => Ok(ValueMap::new()),
        }
    }
}

/// What a resolved conflict resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// Upsert the row with these column values.
    Apply(ValueMap),
    /// Delete the row.
    Delete,
    /// Leave the conflict unresolved; no change is applied.
    Decline,
}

/// A conflict resolution strategy.
///
/// `RowLevelLww` and `ColumnLevelLww` cover the built-in strategies; `Manual`
/// always declines (the embedding application resolves out of band via
/// [`crate::replica::Replica::resolve_conflict`]); `Custom` wraps an
/// application-supplied callback for anything else.
#[derive(Clone)]
pub enum ConflictPolicy {
    RowLevelLww,
    ColumnLevelLww,
    Manual,
    Custom(Arc<dyn Fn(&ConflictContext<'_>) -> Result<ResolutionOutcome> + Send + Sync>),
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ConflictPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictPolicy::RowLevelLww => "ROW_LEVEL_LWW",
            ConflictPolicy::ColumnLevelLww => "COLUMN_LEVEL_LWW",
            ConflictPolicy::Manual => "MANUAL",
            ConflictPolicy::Custom(_) => "CUSTOM",
        }
    }

    /// Whether this policy resolves automatically, or always defers to a
    /// human/operator decision. Surfaced for callers deciding whether to
    /// page someone when conflicts pile up.
    pub fn auto_resolve(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    pub fn resolve(&self, ctx: &ConflictContext<'_>) -> Result<ResolutionOutcome> {
        match self {
            ConflictPolicy::RowLevelLww => row_level_lww(ctx),
            ConflictPolicy::ColumnLevelLww => column_level_lww(ctx),
            ConflictPolicy::Manual => Ok(ResolutionOutcome::Decline),
            ConflictPolicy::Custom(f) => f(ctx),
        }
    }
}

/// A DELETE is a row-level, HLC-timestamped operation (Design Notes §9):
/// whichever side carries the later HLC wins outright, whether that side is
/// the DELETE or the surviving UPDATE/INSERT.
fn row_level_lww(ctx: &ConflictContext<'_>) -> Result<ResolutionOutcome> {
    let remote_wins = ctx.remote_wins()?;
    let winner = if remote_wins { ctx.remote_op } else { ctx.local_op };

    if winner.op_type == OperationType::Delete {
        return Ok(ResolutionOutcome::Delete);
    }
    Ok(ResolutionOutcome::Apply(ConflictContext::decode(&winner.new_values)?))
}

/// Column-level LWW: for each column touched by either side, the side that
/// touched it alone wins; a column touched by both falls back to the
/// row-level HLC winner. DELETE and INSERT-vs-INSERT both collapse to the
/// row-level rule, since neither has a meaningful "changed columns" diff
/// against a prior state on both sides.
fn column_level_lww(ctx: &ConflictContext<'_>) -> Result<ResolutionOutcome> {
    if ctx.local_op.op_type == OperationType::Delete || ctx.remote_op.op_type == OperationType::Delete {
        return row_level_lww(ctx);
    }
    if ctx.local_op.op_type == OperationType::Insert && ctx.remote_op.op_type == OperationType::Insert {
        return row_level_lww(ctx);
    }

    let local_new = ConflictContext::decode(&ctx.local_op.new_values)?;
    let local_old = ConflictContext::decode(&ctx.local_op.old_values)?;
    let remote_new = ConflictContext::decode(&ctx.remote_op.new_values)?;
    let remote_old = ConflictContext::decode(&ctx.remote_op.old_values)?;

    let local_changes = changed_columns(&local_new, &local_old);
    let remote_changes = changed_columns(&remote_new, &remote_old);
    let remote_wins = ctx.remote_wins()?;

    let mut merged = local_new.clone();
    let mut all_keys: Vec<&String> = local_new.keys().chain(remote_new.keys()).collect();
    all_keys.sort();
    all_keys.dedup();

    for key in all_keys {
        let changed_by_local = local_changes.contains(key);
        let changed_by_remote = remote_changes.contains(key);

        if !merged.contains_key(key) {
            if let Some(v) = remote_new.get(key) {
                merged.insert(key.clone(), v.clone());
            }
        }

        if changed_by_remote {
            if !changed_by_local {
                if let Some(v) = remote_new.get(key) {
                    merged.insert(key.clone(), v.clone());
                }
            } else if remote_wins {
                if let Some(v) = remote_new.get(key) {
                    merged.insert(key.clone(), v.clone());
                }
            }
        }
    }

    Ok(ResolutionOutcome::Apply(merged))
}

fn changed_columns(new_vals: &ValueMap, old_vals: &ValueMap) -> std::collections::HashSet<String> {
    new_vals
        .iter()
        .filter(|(k, v)| old_vals.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Id;

    fn op(
        id: Id,
        op_type: OperationType,
        hlc: &str,
        old: Option<ValueMap>,
        new: Option<ValueMap>,
    ) -> SyncOperation {
        SyncOperation::new(
            id,
            [1; 16],
            None,
            "{}".to_string(),
            hlc.to_string(),
            "items".to_string(),
            op_type,
            vec![9],
            old.map(|m| crate::codec::value::encode_map(&m).unwrap()),
            new.map(|m| crate::codec::value::encode_map(&m).unwrap()),
            1,
            0,
            true,
            None,
        )
        .unwrap()
    }

    fn map(pairs: &[(&str, Value)]) -> ValueMap {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn row_level_lww_picks_later_hlc() {
        let local = op(
            [1; 16],
            OperationType::Update,
            "100:0:a",
            Some(map(&[("name", Value::Text("old".into()))])),
            Some(map(&[("name", Value::Text("local".into()))])),
        );
        let remote = op(
            [2; 16],
            OperationType::Update,
            "200:0:b",
            Some(map(&[("name", Value::Text("old".into()))])),
            Some(map(&[("name", Value::Text("remote".into()))])),
        );
        let ctx = ConflictContext::new(&local, &remote);
        let outcome = row_level_lww(&ctx).unwrap();
        assert_eq!(
            outcome,
            ResolutionOutcome::Apply(map(&[("name", Value::Text("remote".into()))]))
        );
    }

    #[test]
    fn row_level_lww_delete_wins_by_hlc() {
        let local = op(
            [1; 16],
            OperationType::Update,
            "50:0:a",
            Some(map(&[("name", Value::Text("old".into()))])),
            Some(map(&[("name", Value::Text("local".into()))])),
        );
        let remote = op(
            [2; 16],
            OperationType::Delete,
            "200:0:b",
            Some(map(&[("name", Value::Text("old".into()))])),
            None,
        );
        let ctx = ConflictContext::new(&local, &remote);
        assert_eq!(row_level_lww(&ctx).unwrap(), ResolutionOutcome::Delete);
    }

    #[test]
    fn row_level_lww_update_survives_stale_delete() {
        let local = op(
            [1; 16],
            OperationType::Delete,
            "10:0:a",
            Some(map(&[("name", Value::Text("old".into()))])),
            None,
        );
        let remote = op(
            [2; 16],
            OperationType::Update,
            "200:0:b",
            Some(map(&[("name", Value::Text("old".into()))])),
            Some(map(&[("name", Value::Text("remote".into()))])),
        );
        let ctx = ConflictContext::new(&local, &remote);
        assert_eq!(
            row_level_lww(&ctx).unwrap(),
            ResolutionOutcome::Apply(map(&[("name", Value::Text("remote".into()))]))
        );
    }

    #[test]
    fn column_level_lww_keeps_disjoint_changes_from_both_sides() {
        let old = map(&[
            ("name", Value::Text("orig".into())),
            ("age", Value::Int(1)),
        ]);
        let local = op(
            [1; 16],
            OperationType::Update,
            "50:0:a",
            Some(old.clone()),
            Some(map(&[("name", Value::Text("local".into())), ("age", Value::Int(1))])),
        );
        let remote = op(
            [2; 16],
            OperationType::Update,
            "200:0:b",
            Some(old),
            Some(map(&[("name", Value::Text("orig".into())), ("age", Value::Int(2))])),
        );
        let ctx = ConflictContext::new(&local, &remote);
        let outcome = column_level_lww(&ctx).unwrap();
        assert_eq!(
            outcome,
            ResolutionOutcome::Apply(map(&[
                ("name", Value::Text("local".into())),
                ("age", Value::Int(2)),
            ]))
        );
    }

    #[test]
    fn column_level_lww_both_changed_same_column_uses_hlc() {
        let old = map(&[("name", Value::Text("orig".into()))]);
        let local = op(
            [1; 16],
            OperationType::Update,
            "200:0:a",
            Some(old.clone()),
            Some(map(&[("name", Value::Text("local".into()))])),
        );
        let remote = op(
            [2; 16],
            OperationType::Update,
            "50:0:b",
            Some(old),
            Some(map(&[("name", Value::Text("remote".into()))])),
        );
        let ctx = ConflictContext::new(&local, &remote);
        let outcome = column_level_lww(&ctx).unwrap();
        assert_eq!(
            outcome,
            ResolutionOutcome::Apply(map(&[("name", Value::Text("local".into()))]))
        );
    }

    #[test]
    fn column_level_lww_insert_vs_insert_falls_back_to_row_level() {
        let local = op(
            [1; 16],
            OperationType::Insert,
            "50:0:a",
            None,
            Some(map(&[("name", Value::Text("local".into()))])),
        );
        let remote = op(
            [2; 16],
            OperationType::Insert,
            "200:0:b",
            None,
            Some(map(&[("name", Value::Text("remote".into()))])),
        );
        let ctx = ConflictContext::new(&local, &remote);
        let outcome = column_level_lww(&ctx).unwrap();
        assert_eq!(
            outcome,
            ResolutionOutcome::Apply(map(&[("name", Value::Text("remote".into()))]))
        );
    }

    #[test]
    fn manual_policy_always_declines() {
        let local = op([1; 16], OperationType::Update, "1:0:a", None, Some(ValueMap::new()));
        let remote = op([2; 16], OperationType::Update, "2:0:b", None, Some(ValueMap::new()));
        let ctx = ConflictContext::new(&local, &remote);
        assert_eq!(ConflictPolicy::Manual.resolve(&ctx).unwrap(), ResolutionOutcome::Decline);
        assert!(!ConflictPolicy::Manual.auto_resolve());
    }

    #[test]
    fn custom_policy_invokes_callback() {
        let policy = ConflictPolicy::Custom(Arc::new(|_ctx: &ConflictContext<'_>| {
            Ok(ResolutionOutcome::Apply(map(&[("chosen", Value::Bool(true))])))
        }));
        let local = op([1; 16], OperationType::Update, "1:0:a", None, Some(ValueMap::new()));
        let remote = op([2; 16], OperationType::Update, "2:0:b", None, Some(ValueMap::new()));
        let ctx = ConflictContext::new(&local, &remote);
        assert_eq!(
            policy.resolve(&ctx).unwrap(),
            ResolutionOutcome::Apply(map(&[("chosen", Value::Bool(true))]))
        );
    }
}
