//! Command layer: validated, undoable mutations of the workflow.
//!
//! Every user-facing edit goes through [`WorkflowStore`]: inputs are
//! validated first, the edit is expressed as a forward/inverse patch pair,
//! applied through the active backend, recorded in the undo ledger and
//! materialized into a fresh snapshot. The same command surface runs
//! against a local-only state (no collaboration) or a shared CRDT document;
//! undo history is tracked identically in both modes, so a session that
//! goes collaborative keeps its semantics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;
use uuid::Uuid;

use crate::doc::{DirtyMask, DocOp, UpdateOrigin, WorkflowDoc};
use crate::error::{CoflowError, Result};
use crate::ledger::{
    ChangeLedger, Patch, PatchOp, apply_patches, edge_value, field_path, item_path, job_value,
    position_value, trigger_value,
};
use crate::model::{
    Edge, EdgeCondition, Job, Position, SelectedNode, Trigger, TriggerKind, WorkflowState,
};
use crate::snapshot::{Snapshot, SnapshotStore, SubscriptionId};
use crate::validate;

/// Queue of locally-produced CRDT updates awaiting broadcast. Shared with
/// the sync bridge, which drains it on every tick (and replays it in order
/// after an offline stretch).
pub type Outbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Where committed patches land.
enum Backend {
    /// Local-only editing: the materialized state is canonical.
    Local,
    /// Collaborative editing: the shared CRDT document is canonical and the
    /// materialized state mirrors it.
    Crdt(Arc<WorkflowDoc>),
}

/// Partial update of a job. `None` fields are left untouched; for the
/// credential references, `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub adaptor: Option<String>,
    pub body: Option<String>,
    pub project_credential_id: Option<Option<Uuid>>,
    pub keychain_credential_id: Option<Option<Uuid>>,
}

/// Partial update of a trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerUpdate {
    pub kind: Option<TriggerKind>,
    pub enabled: Option<bool>,
}

/// Partial update of an edge.
#[derive(Debug, Clone, Default)]
pub struct EdgeUpdate {
    pub target_job_id: Option<Uuid>,
    pub condition_type: Option<EdgeCondition>,
    pub condition_expression: Option<Option<String>>,
    pub enabled: Option<bool>,
}

/// The workflow editing store: command entry point, undo ledger and
/// snapshot source for one open workflow.
pub struct WorkflowStore {
    backend: Backend,
    state: WorkflowState,
    ledger: ChangeLedger,
    snapshots: SnapshotStore,
    outbox: Outbox,
}

impl WorkflowStore {
    /// A store editing purely local state, no collaboration attached.
    pub fn new_local() -> Self {
        Self {
            backend: Backend::Local,
            state: WorkflowState::default(),
            ledger: ChangeLedger::new(),
            snapshots: SnapshotStore::new(),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// A store backed by a shared CRDT document. The document may already
    /// hold state (e.g. after the initial sync); it is materialized
    /// immediately.
    pub fn new_collaborative(doc: Arc<WorkflowDoc>) -> Self {
        let state = doc.to_state();
        doc.take_dirty();
        let mut snapshots = SnapshotStore::new();
        snapshots.refresh(&state, DirtyMask::all());
        Self {
            backend: Backend::Crdt(doc),
            state,
            ledger: ChangeLedger::new(),
            snapshots,
            outbox: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn is_collaborative(&self) -> bool {
        matches!(self.backend, Backend::Crdt(_))
    }

    /// The materialized state. In collaborative mode this mirrors the CRDT
    /// document after every commit and remote merge.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.get_snapshot()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.snapshots.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.snapshots.unsubscribe(id);
    }

    /// Handle to the outbound update queue, shared with the sync bridge.
    pub fn outbox(&self) -> Outbox {
        Arc::clone(&self.outbox)
    }

    pub fn set_collaborating(&mut self, collaborating: bool) {
        self.snapshots.set_collaborating(collaborating);
    }

    /// Disable undo recording (read-only sessions).
    pub fn set_ledger_disabled(&mut self, disabled: bool) {
        self.ledger.set_disabled(disabled);
    }

    /// Drop undo history. Must be called when switching documents.
    pub fn clear_history(&mut self) {
        self.ledger.clear();
    }

    // ==================== Job commands ====================

    pub fn add_job(&mut self, job: Job, position: Position) -> Result<()> {
        validate::job_name(&job.name)?;
        validate::adaptor(&job.adaptor)?;
        validate::credentials(job.project_credential_id, job.keychain_credential_id)?;
        if self.state.node_exists(job.id) {
            return Err(CoflowError::Integrity(format!(
                "node {} already exists",
                job.id
            )));
        }

        let forward = vec![
            Patch::insert(item_path("jobs", job.id), job_value(&job)),
            Patch::set(position_path(job.id), position_value(&position)),
        ];
        let inverse = vec![
            Patch::remove(position_path(job.id)),
            Patch::remove(item_path("jobs", job.id)),
        ];
        self.commit(forward, inverse, true)
    }

    pub fn update_job(&mut self, id: Uuid, update: JobUpdate) -> Result<()> {
        let current = self
            .state
            .jobs
            .get(&id)
            .ok_or_else(|| CoflowError::Integrity(format!("job {id} does not exist")))?
            .clone();

        let mut forward = Vec::new();
        let mut inverse = Vec::new();
        let mut field = |name: &str, new: serde_json::Value, old: serde_json::Value| {
            if new != old {
                forward.push(Patch::set(field_path("jobs", id, name), new));
                inverse.push(Patch::set(field_path("jobs", id, name), old));
            }
        };

        if let Some(name) = &update.name {
            validate::job_name(name)?;
            field("name", json!(name), json!(current.name));
        }
        if let Some(adaptor) = &update.adaptor {
            validate::adaptor(adaptor)?;
            field("adaptor", json!(adaptor), json!(current.adaptor));
        }
        if let Some(body) = &update.body {
            field("body", json!(body), json!(current.body));
        }
        let project = update
            .project_credential_id
            .unwrap_or(current.project_credential_id);
        let keychain = update
            .keychain_credential_id
            .unwrap_or(current.keychain_credential_id);
        validate::credentials(project, keychain)?;
        if update.project_credential_id.is_some() {
            field(
                "project_credential_id",
                json!(project),
                json!(current.project_credential_id),
            );
        }
        if update.keychain_credential_id.is_some() {
            field(
                "keychain_credential_id",
                json!(keychain),
                json!(current.keychain_credential_id),
            );
        }

        if forward.is_empty() {
            return Ok(());
        }
        self.commit(forward, inverse, true)
    }

    /// Remove a job together with every edge touching it and its diagram
    /// position, as one undoable step. Cascading locally keeps the graph
    /// free of dangling edges from this client's own edits.
    pub fn remove_job(&mut self, id: Uuid) -> Result<()> {
        let job = self
            .state
            .jobs
            .get(&id)
            .ok_or_else(|| CoflowError::Integrity(format!("job {id} does not exist")))?
            .clone();
        let edges: Vec<Edge> = self
            .state
            .edges_touching_job(id)
            .iter()
            .map(|edge_id| self.state.edges[edge_id].clone())
            .collect();
        let position = self.state.positions.get(&id).copied();

        let mut forward = Vec::new();
        let mut inverse = vec![Patch::insert(item_path("jobs", id), job_value(&job))];
        for edge in &edges {
            forward.push(Patch::remove(item_path("edges", edge.id)));
            inverse.push(Patch::insert(item_path("edges", edge.id), edge_value(edge)));
        }
        forward.push(Patch::remove(item_path("jobs", id)));
        if let Some(pos) = position {
            forward.push(Patch::remove(position_path(id)));
            inverse.push(Patch::set(position_path(id), position_value(&pos)));
        }
        self.commit(forward, inverse, true)
    }

    // ==================== Trigger commands ====================

    pub fn add_trigger(&mut self, trigger: Trigger, position: Position) -> Result<()> {
        validate::trigger_kind(&trigger.kind)?;
        if self.state.node_exists(trigger.id) {
            return Err(CoflowError::Integrity(format!(
                "node {} already exists",
                trigger.id
            )));
        }

        let forward = vec![
            Patch::insert(item_path("triggers", trigger.id), trigger_value(&trigger)),
            Patch::set(position_path(trigger.id), position_value(&position)),
        ];
        let inverse = vec![
            Patch::remove(position_path(trigger.id)),
            Patch::remove(item_path("triggers", trigger.id)),
        ];
        self.commit(forward, inverse, true)
    }

    pub fn update_trigger(&mut self, id: Uuid, update: TriggerUpdate) -> Result<()> {
        let current = self
            .state
            .triggers
            .get(&id)
            .ok_or_else(|| CoflowError::Integrity(format!("trigger {id} does not exist")))?
            .clone();

        let mut next = current.clone();
        if let Some(kind) = update.kind {
            validate::trigger_kind(&kind)?;
            next.kind = kind;
        }
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if next == current {
            return Ok(());
        }

        let forward = vec![Patch::set(item_path("triggers", id), trigger_value(&next))];
        let inverse = vec![Patch::set(
            item_path("triggers", id),
            trigger_value(&current),
        )];
        self.commit(forward, inverse, true)
    }

    /// Remove a trigger together with its outgoing edges and position.
    pub fn remove_trigger(&mut self, id: Uuid) -> Result<()> {
        let trigger = self
            .state
            .triggers
            .get(&id)
            .ok_or_else(|| CoflowError::Integrity(format!("trigger {id} does not exist")))?
            .clone();
        let edges: Vec<Edge> = self
            .state
            .edges_from_trigger(id)
            .iter()
            .map(|edge_id| self.state.edges[edge_id].clone())
            .collect();
        let position = self.state.positions.get(&id).copied();

        let mut forward = Vec::new();
        let mut inverse = vec![Patch::insert(
            item_path("triggers", id),
            trigger_value(&trigger),
        )];
        for edge in &edges {
            forward.push(Patch::remove(item_path("edges", edge.id)));
            inverse.push(Patch::insert(item_path("edges", edge.id), edge_value(edge)));
        }
        forward.push(Patch::remove(item_path("triggers", id)));
        if let Some(pos) = position {
            forward.push(Patch::remove(position_path(id)));
            inverse.push(Patch::set(position_path(id), position_value(&pos)));
        }
        self.commit(forward, inverse, true)
    }

    // ==================== Edge commands ====================

    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        validate::edge_shape(&edge)?;
        self.check_edge_endpoints(&edge)?;
        if self.state.node_exists(edge.id) {
            return Err(CoflowError::Integrity(format!(
                "node {} already exists",
                edge.id
            )));
        }

        let forward = vec![Patch::insert(item_path("edges", edge.id), edge_value(&edge))];
        let inverse = vec![Patch::remove(item_path("edges", edge.id))];
        self.commit(forward, inverse, true)
    }

    pub fn update_edge(&mut self, id: Uuid, update: EdgeUpdate) -> Result<()> {
        let current = self
            .state
            .edges
            .get(&id)
            .ok_or_else(|| CoflowError::Integrity(format!("edge {id} does not exist")))?
            .clone();

        let mut next = current.clone();
        if let Some(target) = update.target_job_id {
            next.target_job_id = target;
        }
        if let Some(condition) = update.condition_type {
            next.condition_type = condition;
        }
        if let Some(expression) = update.condition_expression {
            next.condition_expression = expression;
        }
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if next == current {
            return Ok(());
        }
        validate::edge_shape(&next)?;
        self.check_edge_endpoints(&next)?;

        let forward = vec![Patch::set(item_path("edges", id), edge_value(&next))];
        let inverse = vec![Patch::set(item_path("edges", id), edge_value(&current))];
        self.commit(forward, inverse, true)
    }

    pub fn remove_edge(&mut self, id: Uuid) -> Result<()> {
        let edge = self
            .state
            .edges
            .get(&id)
            .ok_or_else(|| CoflowError::Integrity(format!("edge {id} does not exist")))?
            .clone();

        let forward = vec![Patch::remove(item_path("edges", id))];
        let inverse = vec![Patch::insert(item_path("edges", id), edge_value(&edge))];
        self.commit(forward, inverse, true)
    }

    fn check_edge_endpoints(&self, edge: &Edge) -> Result<()> {
        if !self.state.jobs.contains_key(&edge.target_job_id) {
            return Err(CoflowError::Integrity(format!(
                "edge target job {} does not exist",
                edge.target_job_id
            )));
        }
        if let Some(source) = edge.source_job_id
            && !self.state.jobs.contains_key(&source)
        {
            return Err(CoflowError::Integrity(format!(
                "edge source job {source} does not exist"
            )));
        }
        if let Some(source) = edge.source_trigger_id
            && !self.state.triggers.contains_key(&source)
        {
            return Err(CoflowError::Integrity(format!(
                "edge source trigger {source} does not exist"
            )));
        }
        Ok(())
    }

    // ==================== Positions & selection ====================

    pub fn set_position(&mut self, id: Uuid, position: Position) -> Result<()> {
        if !self.state.node_exists(id) {
            return Err(CoflowError::Integrity(format!("node {id} does not exist")));
        }
        let previous = self.state.positions.get(&id).copied();

        let forward = vec![Patch::set(position_path(id), position_value(&position))];
        let inverse = vec![match previous {
            Some(prev) => Patch::set(position_path(id), position_value(&prev)),
            None => Patch::remove(position_path(id)),
        }];
        self.commit(forward, inverse, true)
    }

    /// Change the selection. Not recorded in the undo ledger and not
    /// synchronized; purely a local view concern.
    pub fn select(&mut self, selection: Option<SelectedNode>) {
        self.snapshots.set_selection(&self.state, selection);
    }

    // ==================== Undo / redo ====================

    pub fn can_undo(&self) -> bool {
        self.ledger.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.ledger.can_redo()
    }

    /// Undo the latest ledger entry by replaying its inverse through the
    /// active backend. In collaborative mode the inverse becomes a regular
    /// CRDT transaction, so remote peers converge on the undone state.
    ///
    /// The entry moves to the redo stack only once the replay commits: a
    /// failed replay (e.g. the inverse targets a node a peer removed
    /// concurrently) leaves both the document and the ledger as they were.
    ///
    /// Returns false when there is nothing to undo.
    pub fn undo(&mut self) -> Result<bool> {
        let Some(patches) = self.ledger.peek_undo().map(|c| c.inverse.clone()) else {
            return Ok(false);
        };
        self.commit(patches, Vec::new(), false)?;
        self.ledger.undo();
        Ok(true)
    }

    pub fn redo(&mut self) -> Result<bool> {
        let Some(patches) = self.ledger.peek_redo().map(|c| c.forward.clone()) else {
            return Ok(false);
        };
        self.commit(patches, Vec::new(), false)?;
        self.ledger.redo();
        Ok(true)
    }

    // ==================== Remote merges ====================

    /// Apply an update received from a remote peer and rematerialize.
    /// The undo ledger is untouched: undo never reverts other people's
    /// edits.
    pub fn apply_remote_update(&mut self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let Backend::Crdt(doc) = &self.backend else {
            return Err(CoflowError::Integrity(
                "remote updates require a collaborative store".into(),
            ));
        };
        let doc = Arc::clone(doc);
        doc.apply_update(update, origin)?;
        self.state = doc.to_state();
        let dirty = doc.take_dirty();
        self.snapshots.refresh(&self.state, dirty);
        Ok(())
    }

    // ==================== Commit pipeline ====================

    fn commit(&mut self, forward: Vec<Patch>, inverse: Vec<Patch>, record: bool) -> Result<()> {
        let dirty = match &self.backend {
            Backend::Local => {
                // Apply to a scratch copy so a failing patch list leaves the
                // state untouched.
                let mut next = self.state.clone();
                apply_patches(&mut next, &forward)?;
                let dirty = dirty_from_patches(&forward);
                self.state = next;
                dirty
            }
            Backend::Crdt(doc) => {
                let doc = Arc::clone(doc);
                let ops = patches_to_ops(&forward)?;
                let update = doc.transact(&ops)?;
                if !update.is_empty() {
                    self.outbox.lock().unwrap().push_back(update);
                }
                self.state = doc.to_state();
                doc.take_dirty()
            }
        };

        if record {
            self.ledger.record(forward, inverse);
        }
        self.snapshots.refresh(&self.state, dirty);
        Ok(())
    }
}

/// Positions use a three-segment path so consecutive drag updates of the
/// same node squash into one undo step; the trailing segment is ignored
/// when applying.
fn position_path(id: Uuid) -> Vec<String> {
    field_path("positions", id, "coords")
}

fn dirty_from_patches(patches: &[Patch]) -> DirtyMask {
    let mut dirty = DirtyMask::default();
    for patch in patches {
        match patch.path.first().map(String::as_str) {
            Some("jobs") => dirty.jobs = true,
            Some("triggers") => dirty.triggers = true,
            Some("edges") => dirty.edges = true,
            Some("positions") => dirty.positions = true,
            _ => {}
        }
    }
    dirty
}

/// Translate ledger patches into CRDT document operations. Patches are the
/// undo ledger's currency; the document speaks typed ops, so undo replay in
/// collaborative mode goes through this mapping.
fn patches_to_ops(patches: &[Patch]) -> Result<Vec<DocOp>> {
    patches.iter().map(patch_to_op).collect()
}

fn patch_to_op(patch: &Patch) -> Result<DocOp> {
    let malformed = |detail: &str| CoflowError::Integrity(format!("untranslatable patch: {detail}"));
    let collection = patch.path.first().ok_or_else(|| malformed("empty path"))?;
    let id = patch
        .path
        .get(1)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| malformed("missing item id"))?;
    let field = patch.path.get(2).map(String::as_str);

    match (collection.as_str(), field, &patch.op) {
        ("jobs", None, PatchOp::Insert(value)) => {
            let job: Job = serde_json::from_value(value.clone())
                .map_err(|e| malformed(&format!("job: {e}")))?;
            Ok(DocOp::InsertJob(job))
        }
        ("jobs", None, PatchOp::Remove) => Ok(DocOp::RemoveJob(id)),
        ("jobs", Some(field), PatchOp::Set(value)) => {
            let mut op = DocOp::UpdateJob {
                id,
                name: None,
                adaptor: None,
                body: None,
                project_credential_id: None,
                keychain_credential_id: None,
            };
            if let DocOp::UpdateJob {
                name,
                adaptor,
                body,
                project_credential_id,
                keychain_credential_id,
                ..
            } = &mut op
            {
                match field {
                    "name" => {
                        *name = Some(as_string(value).ok_or_else(|| malformed("name"))?);
                    }
                    "adaptor" => {
                        *adaptor = Some(as_string(value).ok_or_else(|| malformed("adaptor"))?);
                    }
                    "body" => {
                        *body = Some(as_string(value).ok_or_else(|| malformed("body"))?);
                    }
                    "project_credential_id" => {
                        *project_credential_id = Some(as_optional_uuid(value)?);
                    }
                    "keychain_credential_id" => {
                        *keychain_credential_id = Some(as_optional_uuid(value)?);
                    }
                    other => return Err(malformed(&format!("unknown job field '{other}'"))),
                }
            }
            Ok(op)
        }
        ("triggers", None, PatchOp::Insert(value)) => {
            let trigger: Trigger = serde_json::from_value(value.clone())
                .map_err(|e| malformed(&format!("trigger: {e}")))?;
            Ok(DocOp::InsertTrigger(trigger))
        }
        ("triggers", None, PatchOp::Set(value)) => {
            let trigger: Trigger = serde_json::from_value(value.clone())
                .map_err(|e| malformed(&format!("trigger: {e}")))?;
            Ok(DocOp::UpdateTrigger {
                id: trigger.id,
                kind: Some(trigger.kind),
                enabled: Some(trigger.enabled),
            })
        }
        ("triggers", None, PatchOp::Remove) => Ok(DocOp::RemoveTrigger(id)),
        ("edges", None, PatchOp::Insert(value)) => {
            let edge: Edge = serde_json::from_value(value.clone())
                .map_err(|e| malformed(&format!("edge: {e}")))?;
            Ok(DocOp::InsertEdge(edge))
        }
        ("edges", None, PatchOp::Set(value)) => {
            let edge: Edge = serde_json::from_value(value.clone())
                .map_err(|e| malformed(&format!("edge: {e}")))?;
            Ok(DocOp::UpdateEdge(edge))
        }
        ("edges", None, PatchOp::Remove) => Ok(DocOp::RemoveEdge(id)),
        ("positions", _, PatchOp::Set(value)) | ("positions", _, PatchOp::Insert(value)) => {
            let position: Position = serde_json::from_value(value.clone())
                .map_err(|e| malformed(&format!("position: {e}")))?;
            Ok(DocOp::SetPosition { id, position })
        }
        ("positions", _, PatchOp::Remove) => Ok(DocOp::RemovePosition(id)),
        (collection, field, _) => Err(malformed(&format!(
            "unsupported op at {collection}/{field:?}"
        ))),
    }
}

fn as_string(value: &serde_json::Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn as_optional_uuid(value: &serde_json::Value) -> Result<Option<Uuid>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Uuid::parse_str(s)
            .map(Some)
            .map_err(|_| CoflowError::Integrity(format!("'{s}' is not a valid id"))),
        _ => Err(CoflowError::Integrity(
            "credential reference must be an id or null".into(),
        )),
    }
}
