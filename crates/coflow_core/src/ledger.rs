//! Undo/redo ledger of reversible patches.
//!
//! Local edits are recorded as forward + inverse patch pairs, independent of
//! the CRDT transport. Consecutive edits to the same field squash into one
//! entry so a whole typing burst undoes in a single step, while edits to
//! different fields stay separately undoable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoflowError, Result};
use crate::model::{Edge, Job, Position, Trigger, WorkflowState};

/// Minimum path depth for squashing: collection / item id / field.
/// Whole-item inserts and removals (2 segments) never squash.
const SQUASH_MIN_PATH_LEN: usize = 3;

/// A single reversible edit operation addressed by path.
///
/// Paths are `[collection, item_id]` for whole-item operations and
/// `[collection, item_id, field]` for field updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub path: Vec<String>,
    pub op: PatchOp,
}

/// The operation a patch performs at its path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum PatchOp {
    /// Replace the value at the path.
    Set(Value),
    /// Insert a new item (whole-item paths only).
    Insert(Value),
    /// Remove the item at the path.
    Remove,
}

impl Patch {
    pub fn set(path: Vec<String>, value: Value) -> Self {
        Self {
            path,
            op: PatchOp::Set(value),
        }
    }

    pub fn insert(path: Vec<String>, value: Value) -> Self {
        Self {
            path,
            op: PatchOp::Insert(value),
        }
    }

    pub fn remove(path: Vec<String>) -> Self {
        Self {
            path,
            op: PatchOp::Remove,
        }
    }
}

/// One undoable ledger entry: a forward patch set and its inverse.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub id: u64,
    pub forward: Vec<Patch>,
    pub inverse: Vec<Patch>,
}

/// The undo/redo stack for one document session.
///
/// Scoped to a single workflow: must be cleared when switching documents so
/// undo history never leaks across unrelated workflows.
#[derive(Debug, Default)]
pub struct ChangeLedger {
    undo: Vec<PendingChange>,
    redo: Vec<PendingChange>,
    disabled: bool,
    next_id: u64,
}

impl ChangeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a forward/inverse pair.
    ///
    /// A new edit always clears the redo stack. If the ledger is disabled
    /// (read-only or soft-deleted workflow) nothing is recorded. When the new
    /// entry's first patch targets the same field-level path as the previous
    /// entry's first patch, the entries merge per path: forward patches are
    /// replaced last-write-wins, while each path keeps the oldest inverse it
    /// has seen, so one undo restores every touched field to its value before
    /// the whole burst.
    pub fn record(&mut self, forward: Vec<Patch>, inverse: Vec<Patch>) {
        if self.disabled {
            return;
        }
        self.redo.clear();

        if let Some(last) = self.undo.last_mut()
            && let (Some(prev_first), Some(new_first)) = (last.forward.first(), forward.first())
            && prev_first.path == new_first.path
            && new_first.path.len() >= SQUASH_MIN_PATH_LEN
        {
            for patch in forward {
                match last.forward.iter_mut().find(|p| p.path == patch.path) {
                    Some(existing) => existing.op = patch.op,
                    None => last.forward.push(patch),
                }
            }
            for patch in inverse {
                if !last.inverse.iter().any(|p| p.path == patch.path) {
                    last.inverse.push(patch);
                }
            }
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.undo.push(PendingChange {
            id,
            forward,
            inverse,
        });
    }

    /// The entry [`undo`](Self::undo) would pop next, without moving it.
    /// Lets the caller attempt the replay first and keep the stacks
    /// untouched if it fails.
    pub fn peek_undo(&self) -> Option<&PendingChange> {
        self.undo.last()
    }

    /// The entry [`redo`](Self::redo) would pop next, without moving it.
    pub fn peek_redo(&self) -> Option<&PendingChange> {
        self.redo.last()
    }

    /// Pop the most recent entry for undoing. The caller applies the
    /// returned entry's inverse patches; the entry moves to the redo stack.
    pub fn undo(&mut self) -> Option<PendingChange> {
        let change = self.undo.pop()?;
        self.redo.push(change.clone());
        Some(change)
    }

    /// Pop the most recently undone entry for redoing. The caller applies
    /// the returned entry's forward patches; the entry moves back to undo.
    pub fn redo(&mut self) -> Option<PendingChange> {
        let change = self.redo.pop()?;
        self.undo.push(change.clone());
        Some(change)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Disable recording (e.g. read-only session). Undo/redo of existing
    /// entries remains possible.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Drop all history. Called when the session switches documents.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

// ===========================================================================
// Patch application against the materialized state
// ===========================================================================

/// Apply a patch to a materialized workflow state.
///
/// Collections are updated with structural copy-on-write at the call site
/// (the state passed in is the next version being built); items are
/// round-tripped through JSON for field-level sets so the patch format stays
/// uniform across item kinds.
pub fn apply_patch(state: &mut WorkflowState, patch: &Patch) -> Result<()> {
    let collection = patch
        .path
        .first()
        .ok_or_else(|| CoflowError::Integrity("empty patch path".into()))?;
    let id = patch
        .path
        .get(1)
        .ok_or_else(|| CoflowError::Integrity("patch path is missing an item id".into()))
        .and_then(|s| {
            Uuid::parse_str(s)
                .map_err(|_| CoflowError::Integrity(format!("'{s}' is not a valid id")))
        })?;
    let field = patch.path.get(2).map(String::as_str);

    match collection.as_str() {
        "jobs" => apply_item_patch(&mut state.jobs, id, field, &patch.op, "job"),
        "triggers" => apply_item_patch(&mut state.triggers, id, field, &patch.op, "trigger"),
        "edges" => apply_item_patch(&mut state.edges, id, field, &patch.op, "edge"),
        "positions" => apply_position_patch(state, id, &patch.op),
        other => Err(CoflowError::Integrity(format!(
            "unknown collection '{other}'"
        ))),
    }
}

fn apply_item_patch<T>(
    items: &mut indexmap::IndexMap<Uuid, T>,
    id: Uuid,
    field: Option<&str>,
    op: &PatchOp,
    kind: &str,
) -> Result<()>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    match (field, op) {
        (None, PatchOp::Insert(value)) | (None, PatchOp::Set(value)) => {
            let item: T = serde_json::from_value(value.clone())
                .map_err(|e| CoflowError::Integrity(format!("malformed {kind}: {e}")))?;
            items.insert(id, item);
            Ok(())
        }
        (None, PatchOp::Remove) => {
            items
                .shift_remove(&id)
                .ok_or_else(|| CoflowError::Integrity(format!("{kind} {id} does not exist")))?;
            Ok(())
        }
        (Some(field), PatchOp::Set(value)) => {
            let item = items
                .get(&id)
                .ok_or_else(|| CoflowError::Integrity(format!("{kind} {id} does not exist")))?;
            let mut json = serde_json::to_value(item)
                .map_err(|e| CoflowError::Integrity(format!("serialize {kind}: {e}")))?;
            match &mut json {
                Value::Object(map) => {
                    map.insert(field.to_string(), value.clone());
                }
                _ => return Err(CoflowError::Integrity(format!("{kind} is not an object"))),
            }
            let updated: T = serde_json::from_value(json)
                .map_err(|e| CoflowError::Integrity(format!("malformed {kind} field: {e}")))?;
            items.insert(id, updated);
            Ok(())
        }
        (Some(field), _) => Err(CoflowError::Integrity(format!(
            "field path '{field}' only supports set"
        ))),
    }
}

fn apply_position_patch(state: &mut WorkflowState, id: Uuid, op: &PatchOp) -> Result<()> {
    match op {
        PatchOp::Set(value) | PatchOp::Insert(value) => {
            let pos: Position = serde_json::from_value(value.clone())
                .map_err(|e| CoflowError::Integrity(format!("malformed position: {e}")))?;
            state.positions.insert(id, pos);
            Ok(())
        }
        PatchOp::Remove => {
            state.positions.remove(&id);
            Ok(())
        }
    }
}

/// Apply a patch list in order, stopping at the first failure.
pub fn apply_patches(state: &mut WorkflowState, patches: &[Patch]) -> Result<()> {
    for patch in patches {
        apply_patch(state, patch)?;
    }
    Ok(())
}

// Convenience constructors used by the command layer.

/// `[collection, id]` path.
pub fn item_path(collection: &str, id: Uuid) -> Vec<String> {
    vec![collection.to_string(), id.to_string()]
}

/// `[collection, id, field]` path.
pub fn field_path(collection: &str, id: Uuid, field: &str) -> Vec<String> {
    vec![collection.to_string(), id.to_string(), field.to_string()]
}

/// Serialize a model item to its patch value, panicking only on
/// programmer error (all model types serialize infallibly).
fn to_value<T: Serialize>(item: &T) -> Value {
    serde_json::to_value(item).unwrap_or(Value::Null)
}

pub fn job_value(job: &Job) -> Value {
    to_value(job)
}

pub fn trigger_value(trigger: &Trigger) -> Value {
    to_value(trigger)
}

pub fn edge_value(edge: &Edge) -> Value {
    to_value(edge)
}

pub fn position_value(pos: &Position) -> Value {
    to_value(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Job;
    use serde_json::json;

    fn job() -> Job {
        Job::new("fetch", "@openfn/language-http@6.0.0")
    }

    fn insert_job(state: &mut WorkflowState, job: &Job) {
        apply_patch(
            state,
            &Patch::insert(item_path("jobs", job.id), job_value(job)),
        )
        .unwrap();
    }

    #[test]
    fn test_insert_and_remove_job() {
        let mut state = WorkflowState::default();
        let job = job();
        insert_job(&mut state, &job);
        assert_eq!(state.jobs.len(), 1);

        apply_patch(&mut state, &Patch::remove(item_path("jobs", job.id))).unwrap();
        assert!(state.jobs.is_empty());
    }

    #[test]
    fn test_field_set() {
        let mut state = WorkflowState::default();
        let job = job();
        insert_job(&mut state, &job);

        apply_patch(
            &mut state,
            &Patch::set(field_path("jobs", job.id, "name"), json!("renamed")),
        )
        .unwrap();
        assert_eq!(state.jobs[&job.id].name, "renamed");
        assert_eq!(state.jobs[&job.id].adaptor, job.adaptor);
    }

    #[test]
    fn test_patch_unknown_item_rejected() {
        let mut state = WorkflowState::default();
        let err = apply_patch(
            &mut state,
            &Patch::set(field_path("jobs", Uuid::new_v4(), "name"), json!("x")),
        )
        .unwrap_err();
        assert!(matches!(err, CoflowError::Integrity(_)));
    }

    #[test]
    fn test_ledger_records_and_undoes() {
        let mut ledger = ChangeLedger::new();
        let mut state = WorkflowState::default();
        let job = job();
        let before_name = job.name.clone();
        insert_job(&mut state, &job);

        let forward = vec![Patch::set(
            field_path("jobs", job.id, "name"),
            json!("edited"),
        )];
        let inverse = vec![Patch::set(
            field_path("jobs", job.id, "name"),
            json!(before_name.clone()),
        )];
        apply_patches(&mut state, &forward).unwrap();
        ledger.record(forward, inverse);

        let change = ledger.undo().unwrap();
        apply_patches(&mut state, &change.inverse).unwrap();
        assert_eq!(state.jobs[&job.id].name, before_name);
        assert!(ledger.can_redo());

        let change = ledger.redo().unwrap();
        apply_patches(&mut state, &change.forward).unwrap();
        assert_eq!(state.jobs[&job.id].name, "edited");
    }

    #[test]
    fn test_squash_consecutive_same_field() {
        let mut ledger = ChangeLedger::new();
        let id = Uuid::new_v4();

        let entry = |value: &str, prior: &str| {
            (
                vec![Patch::set(field_path("jobs", id, "name"), json!(value))],
                vec![Patch::set(field_path("jobs", id, "name"), json!(prior))],
            )
        };

        let (f, i) = entry("a", "");
        ledger.record(f, i);
        let (f, i) = entry("ab", "a");
        ledger.record(f, i);
        let (f, i) = entry("abc", "ab");
        ledger.record(f, i);

        // One entry: undoing restores the pre-burst value, redoing the final.
        assert_eq!(ledger.undo_depth(), 1);
        let change = ledger.undo().unwrap();
        assert_eq!(change.inverse[0].op, PatchOp::Set(json!("")));
        assert_eq!(change.forward[0].op, PatchOp::Set(json!("abc")));
    }

    #[test]
    fn test_squash_keeps_inverse_for_fields_added_mid_burst() {
        let mut ledger = ChangeLedger::new();
        let id = Uuid::new_v4();

        // First edit touches only the name; the second touches name and body.
        // Both lead with the name path, so they squash.
        ledger.record(
            vec![Patch::set(field_path("jobs", id, "name"), json!("a"))],
            vec![Patch::set(field_path("jobs", id, "name"), json!(""))],
        );
        ledger.record(
            vec![
                Patch::set(field_path("jobs", id, "name"), json!("ab")),
                Patch::set(field_path("jobs", id, "body"), json!("fn(s => s)")),
            ],
            vec![
                Patch::set(field_path("jobs", id, "name"), json!("a")),
                Patch::set(field_path("jobs", id, "body"), json!("")),
            ],
        );

        assert_eq!(ledger.undo_depth(), 1);
        let change = ledger.undo().unwrap();

        // Forward carries the latest value per path.
        let forward_name = change
            .forward
            .iter()
            .find(|p| p.path.last().map(String::as_str) == Some("name"))
            .unwrap();
        assert_eq!(forward_name.op, PatchOp::Set(json!("ab")));
        // The inverse covers the body too, with its pre-burst value, and the
        // name keeps its oldest value.
        let inverse_name = change
            .inverse
            .iter()
            .find(|p| p.path.last().map(String::as_str) == Some("name"))
            .unwrap();
        assert_eq!(inverse_name.op, PatchOp::Set(json!("")));
        let inverse_body = change
            .inverse
            .iter()
            .find(|p| p.path.last().map(String::as_str) == Some("body"))
            .unwrap();
        assert_eq!(inverse_body.op, PatchOp::Set(json!("")));
    }

    #[test]
    fn test_no_squash_across_fields() {
        let mut ledger = ChangeLedger::new();
        let id = Uuid::new_v4();

        ledger.record(
            vec![Patch::set(field_path("jobs", id, "name"), json!("a"))],
            vec![Patch::set(field_path("jobs", id, "name"), json!(""))],
        );
        ledger.record(
            vec![Patch::set(field_path("jobs", id, "adaptor"), json!("x"))],
            vec![Patch::set(field_path("jobs", id, "adaptor"), json!("y"))],
        );
        assert_eq!(ledger.undo_depth(), 2);
    }

    #[test]
    fn test_no_squash_for_whole_item_paths() {
        let mut ledger = ChangeLedger::new();
        let id = Uuid::new_v4();

        // Two-segment paths (whole-item) never merge even when equal.
        ledger.record(
            vec![Patch::insert(item_path("jobs", id), json!({}))],
            vec![Patch::remove(item_path("jobs", id))],
        );
        ledger.record(
            vec![Patch::insert(item_path("jobs", id), json!({}))],
            vec![Patch::remove(item_path("jobs", id))],
        );
        assert_eq!(ledger.undo_depth(), 2);
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut ledger = ChangeLedger::new();
        let id = Uuid::new_v4();

        ledger.record(
            vec![Patch::set(field_path("jobs", id, "name"), json!("a"))],
            vec![Patch::set(field_path("jobs", id, "name"), json!(""))],
        );
        ledger.undo().unwrap();
        assert!(ledger.can_redo());

        ledger.record(
            vec![Patch::set(field_path("jobs", id, "adaptor"), json!("x"))],
            vec![Patch::set(field_path("jobs", id, "adaptor"), json!("y"))],
        );
        assert!(!ledger.can_redo());
    }

    #[test]
    fn test_disabled_ledger_records_nothing() {
        let mut ledger = ChangeLedger::new();
        ledger.set_disabled(true);
        ledger.record(
            vec![Patch::set(
                field_path("jobs", Uuid::new_v4(), "name"),
                json!("a"),
            )],
            vec![],
        );
        assert!(!ledger.can_undo());
    }

    #[test]
    fn test_clear_drops_both_stacks() {
        let mut ledger = ChangeLedger::new();
        let id = Uuid::new_v4();
        ledger.record(
            vec![Patch::set(field_path("jobs", id, "name"), json!("a"))],
            vec![Patch::set(field_path("jobs", id, "name"), json!(""))],
        );
        ledger.undo().unwrap();
        ledger.record(
            vec![Patch::set(field_path("jobs", id, "name"), json!("b"))],
            vec![Patch::set(field_path("jobs", id, "name"), json!(""))],
        );

        ledger.clear();
        assert!(!ledger.can_undo());
        assert!(!ledger.can_redo());
    }
}
