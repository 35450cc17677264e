//! Shared workflow CRDT document.
//!
//! This module provides [`WorkflowDoc`], which wraps a yrs [`Doc`] holding
//! the canonical workflow graph so concurrent edits from multiple clients
//! converge without central locking.
//!
//! # Structure
//!
//! ```text
//! Y.Doc
//! ├── Y.Array "jobs"      → [Y.Map { id, name, adaptor, body: Y.Text, ... }]
//! ├── Y.Array "triggers"  → [Y.Map { id, kind, enabled }]
//! ├── Y.Array "edges"     → [Y.Map { id, source_*, target_job_id, ... }]
//! └── Y.Map  "positions"  → { node_id → "{\"x\":..,\"y\":..}" }
//! ```
//!
//! Scalar fields merge last-writer-wins; the collection arrays and job
//! bodies merge as sequences, so two clients inserting jobs concurrently
//! both survive in the merged array.
//!
//! # Transactions
//!
//! All mutation goes through [`WorkflowDoc::transact`], which applies a
//! batch of [`DocOp`]s atomically: every op is resolved against the current
//! document before anything mutates, so a failing batch leaves the document
//! untouched and observers never see a partial state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Array, ArrayRef, DeepObservable, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn,
    StateVector, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
};

use crate::error::{CoflowError, Result};
use crate::model::{Edge, Job, Position, Trigger, TriggerKind, WorkflowState};

const JOBS_ARRAY_NAME: &str = "jobs";
const TRIGGERS_ARRAY_NAME: &str = "triggers";
const EDGES_ARRAY_NAME: &str = "edges";
const POSITIONS_MAP_NAME: &str = "positions";

/// Origin of a document update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Update originated from a local command
    Local,
    /// Update received from a remote peer
    Remote,
    /// Update from the initial sync handshake
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

/// One of the document's root collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Jobs,
    Triggers,
    Edges,
    Positions,
}

/// Which collections a transaction touched. Drives partial snapshot
/// rebuilds: a clean collection keeps its previous materialized slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyMask {
    pub jobs: bool,
    pub triggers: bool,
    pub edges: bool,
    pub positions: bool,
}

impl DirtyMask {
    /// Mask with every collection marked dirty.
    pub fn all() -> Self {
        Self {
            jobs: true,
            triggers: true,
            edges: true,
            positions: true,
        }
    }

    pub fn any(&self) -> bool {
        self.jobs || self.triggers || self.edges || self.positions
    }

    pub fn merge(&mut self, other: DirtyMask) {
        self.jobs |= other.jobs;
        self.triggers |= other.triggers;
        self.edges |= other.edges;
        self.positions |= other.positions;
    }
}

/// A single field-level mutation staged into a document transaction.
#[derive(Debug, Clone)]
pub enum DocOp {
    InsertJob(Job),
    UpdateJob {
        id: Uuid,
        name: Option<String>,
        adaptor: Option<String>,
        body: Option<String>,
        /// `Some(None)` clears the reference, `None` leaves it untouched.
        project_credential_id: Option<Option<Uuid>>,
        keychain_credential_id: Option<Option<Uuid>>,
    },
    RemoveJob(Uuid),
    InsertTrigger(Trigger),
    UpdateTrigger {
        id: Uuid,
        kind: Option<TriggerKind>,
        enabled: Option<bool>,
    },
    RemoveTrigger(Uuid),
    InsertEdge(Edge),
    /// Rewrite an edge's scalar fields from the given value.
    UpdateEdge(Edge),
    RemoveEdge(Uuid),
    SetPosition {
        id: Uuid,
        position: Position,
    },
    RemovePosition(Uuid),
}

#[derive(Default)]
struct DirtyFlags {
    jobs: AtomicBool,
    triggers: AtomicBool,
    edges: AtomicBool,
    positions: AtomicBool,
}

/// A CRDT document holding one workflow graph.
pub struct WorkflowDoc {
    doc: Doc,
    jobs: ArrayRef,
    triggers: ArrayRef,
    edges: ArrayRef,
    positions: MapRef,

    dirty: Arc<DirtyFlags>,
    applying_remote: Arc<AtomicBool>,

    // Keep the deep observers alive for the document's lifetime.
    _subscriptions: Vec<yrs::Subscription>,
}

impl WorkflowDoc {
    /// Create a new empty workflow document.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create a document with a fixed client id (deterministic merge
    /// tie-breaks, mainly for tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let jobs = doc.get_or_insert_array(JOBS_ARRAY_NAME);
        let triggers = doc.get_or_insert_array(TRIGGERS_ARRAY_NAME);
        let edges = doc.get_or_insert_array(EDGES_ARRAY_NAME);
        let positions = doc.get_or_insert_map(POSITIONS_MAP_NAME);

        let dirty = Arc::new(DirtyFlags::default());
        let mut subscriptions = Vec::with_capacity(4);

        let flags = Arc::clone(&dirty);
        subscriptions.push(jobs.observe_deep(move |_txn, _events| {
            flags.jobs.store(true, Ordering::SeqCst);
        }));
        let flags = Arc::clone(&dirty);
        subscriptions.push(triggers.observe_deep(move |_txn, _events| {
            flags.triggers.store(true, Ordering::SeqCst);
        }));
        let flags = Arc::clone(&dirty);
        subscriptions.push(edges.observe_deep(move |_txn, _events| {
            flags.edges.store(true, Ordering::SeqCst);
        }));
        let flags = Arc::clone(&dirty);
        subscriptions.push(positions.observe_deep(move |_txn, _events| {
            flags.positions.store(true, Ordering::SeqCst);
        }));

        Self {
            doc,
            jobs,
            triggers,
            edges,
            positions,
            dirty,
            applying_remote: Arc::new(AtomicBool::new(false)),
            _subscriptions: subscriptions,
        }
    }

    /// The underlying yrs client id.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // ==================== Transactions ====================

    /// Apply a batch of operations atomically.
    ///
    /// Every op is first resolved (target lookup, body diff computation)
    /// against the document; only if all resolve does anything mutate, so a
    /// failing batch never partially applies. Observers fire once for the
    /// whole batch, per collection touched.
    ///
    /// Returns the encoded incremental update for broadcasting, empty if the
    /// batch was a no-op.
    pub fn transact(&self, ops: &[DocOp]) -> Result<Vec<u8>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();

            // Resolve phase: reads only. Any failure aborts before mutation.
            let resolved = ops
                .iter()
                .map(|op| self.resolve(&txn, op))
                .collect::<Result<Vec<_>>>()?;

            for op in resolved {
                self.apply_resolved(&mut txn, op);
            }
        }

        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };
        Ok(update)
    }

    /// Apply a batch built up by the given closure.
    ///
    /// Convenience wrapper over [`transact`](Self::transact): the closure
    /// stages ops and may fail, in which case nothing is applied.
    pub fn transact_with<F>(&self, f: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut Vec<DocOp>) -> Result<()>,
    {
        let mut ops = Vec::new();
        f(&mut ops)?;
        self.transact(&ops)
    }

    fn resolve(&self, txn: &TransactionMut, op: &DocOp) -> Result<ResolvedOp> {
        let missing = |kind: &str, id: Uuid| {
            CoflowError::Integrity(format!("{kind} {id} does not exist in the document"))
        };
        match op {
            DocOp::InsertJob(job) => Ok(ResolvedOp::InsertJob(job.clone())),
            DocOp::UpdateJob {
                id,
                name,
                adaptor,
                body,
                project_credential_id,
                keychain_credential_id,
            } => {
                let (_, map) = find_item(txn, &self.jobs, *id).ok_or_else(|| missing("job", *id))?;
                let splice = match body {
                    Some(content) => {
                        let text = map
                            .get(txn, "body")
                            .and_then(|v| v.cast::<TextRef>().ok())
                            .ok_or_else(|| {
                                CoflowError::Crdt(format!("job {id} has no body text"))
                            })?;
                        let current = text.get_string(txn);
                        Some((text, diff_splice(&current, content)))
                    }
                    None => None,
                };
                Ok(ResolvedOp::UpdateJob {
                    map,
                    name: name.clone(),
                    adaptor: adaptor.clone(),
                    splice,
                    project_credential_id: *project_credential_id,
                    keychain_credential_id: *keychain_credential_id,
                })
            }
            DocOp::RemoveJob(id) => {
                let (index, _) =
                    find_item(txn, &self.jobs, *id).ok_or_else(|| missing("job", *id))?;
                Ok(ResolvedOp::RemoveAt(self.jobs.clone(), index))
            }
            DocOp::InsertTrigger(trigger) => Ok(ResolvedOp::InsertTrigger(trigger.clone())),
            DocOp::UpdateTrigger { id, kind, enabled } => {
                let (_, map) =
                    find_item(txn, &self.triggers, *id).ok_or_else(|| missing("trigger", *id))?;
                Ok(ResolvedOp::UpdateTrigger {
                    map,
                    kind: kind.clone(),
                    enabled: *enabled,
                })
            }
            DocOp::RemoveTrigger(id) => {
                let (index, _) =
                    find_item(txn, &self.triggers, *id).ok_or_else(|| missing("trigger", *id))?;
                Ok(ResolvedOp::RemoveAt(self.triggers.clone(), index))
            }
            DocOp::InsertEdge(edge) => Ok(ResolvedOp::InsertEdge(edge.clone())),
            DocOp::UpdateEdge(edge) => {
                let (_, map) =
                    find_item(txn, &self.edges, edge.id).ok_or_else(|| missing("edge", edge.id))?;
                Ok(ResolvedOp::UpdateEdge {
                    map,
                    edge: edge.clone(),
                })
            }
            DocOp::RemoveEdge(id) => {
                let (index, _) =
                    find_item(txn, &self.edges, *id).ok_or_else(|| missing("edge", *id))?;
                Ok(ResolvedOp::RemoveAt(self.edges.clone(), index))
            }
            DocOp::SetPosition { id, position } => Ok(ResolvedOp::SetPosition(*id, *position)),
            DocOp::RemovePosition(id) => Ok(ResolvedOp::RemovePosition(*id)),
        }
    }

    fn apply_resolved(&self, txn: &mut TransactionMut, op: ResolvedOp) {
        match op {
            ResolvedOp::InsertJob(job) => {
                let map: MapRef = self.jobs.push_back(txn, MapPrelim::default());
                map.insert(txn, "id", job.id.to_string());
                map.insert(txn, "name", job.name);
                map.insert(txn, "adaptor", job.adaptor);
                if let Some(cred) = job.project_credential_id {
                    map.insert(txn, "project_credential_id", cred.to_string());
                }
                if let Some(cred) = job.keychain_credential_id {
                    map.insert(txn, "keychain_credential_id", cred.to_string());
                }
                let text: TextRef = map.insert(txn, "body", TextPrelim::new(""));
                if !job.body.is_empty() {
                    text.insert(txn, 0, &job.body);
                }
            }
            ResolvedOp::UpdateJob {
                map,
                name,
                adaptor,
                splice,
                project_credential_id,
                keychain_credential_id,
            } => {
                if let Some(name) = name {
                    map.insert(txn, "name", name);
                }
                if let Some(adaptor) = adaptor {
                    map.insert(txn, "adaptor", adaptor);
                }
                if let Some((text, splice)) = splice {
                    apply_splice(txn, &text, &splice);
                }
                if let Some(cred) = project_credential_id {
                    set_optional_id(txn, &map, "project_credential_id", cred);
                }
                if let Some(cred) = keychain_credential_id {
                    set_optional_id(txn, &map, "keychain_credential_id", cred);
                }
            }
            ResolvedOp::InsertTrigger(trigger) => {
                let map: MapRef = self.triggers.push_back(txn, MapPrelim::default());
                map.insert(txn, "id", trigger.id.to_string());
                map.insert(txn, "enabled", trigger.enabled);
                map.insert(txn, "kind", kind_json(&trigger.kind));
            }
            ResolvedOp::UpdateTrigger { map, kind, enabled } => {
                if let Some(kind) = kind {
                    map.insert(txn, "kind", kind_json(&kind));
                }
                if let Some(enabled) = enabled {
                    map.insert(txn, "enabled", enabled);
                }
            }
            ResolvedOp::InsertEdge(edge) => {
                let map: MapRef = self.edges.push_back(txn, MapPrelim::default());
                map.insert(txn, "id", edge.id.to_string());
                write_edge_fields(txn, &map, &edge);
            }
            ResolvedOp::UpdateEdge { map, edge } => {
                write_edge_fields(txn, &map, &edge);
            }
            ResolvedOp::RemoveAt(array, index) => {
                array.remove(txn, index);
            }
            ResolvedOp::SetPosition(id, position) => {
                let json = serde_json::to_string(&position).unwrap_or_default();
                self.positions.insert(txn, id.to_string(), json);
            }
            ResolvedOp::RemovePosition(id) => {
                self.positions.remove(txn, &id.to_string());
            }
        }
    }

    // ==================== Reads ====================

    /// Flatten the whole document into a plain [`WorkflowState`].
    ///
    /// Items that fail to parse (e.g. half-written by an older client) are
    /// skipped with a warning rather than failing the whole read.
    pub fn to_state(&self) -> WorkflowState {
        let txn = self.doc.transact();
        let mut state = WorkflowState::default();

        for value in self.jobs.iter(&txn) {
            match read_job(&txn, value) {
                Some(job) => {
                    state.jobs.insert(job.id, job);
                }
                None => log::warn!("skipping unparseable job entry"),
            }
        }
        for value in self.triggers.iter(&txn) {
            match read_trigger(&txn, value) {
                Some(trigger) => {
                    state.triggers.insert(trigger.id, trigger);
                }
                None => log::warn!("skipping unparseable trigger entry"),
            }
        }
        for value in self.edges.iter(&txn) {
            match read_edge(&txn, value) {
                Some(edge) => {
                    state.edges.insert(edge.id, edge);
                }
                None => log::warn!("skipping unparseable edge entry"),
            }
        }
        for (key, value) in self.positions.iter(&txn) {
            let parsed = Uuid::parse_str(key).ok().zip(
                value
                    .cast::<String>()
                    .ok()
                    .and_then(|json| serde_json::from_str::<Position>(&json).ok()),
            );
            match parsed {
                Some((id, pos)) => {
                    state.positions.insert(id, pos);
                }
                None => log::warn!("skipping unparseable position entry '{key}'"),
            }
        }
        state
    }

    /// Read a single job's body text.
    pub fn job_body(&self, id: Uuid) -> Option<String> {
        let txn = self.doc.transact();
        let (_, map) = find_item(&txn, &self.jobs, id)?;
        let text = map.get(&txn, "body")?.cast::<TextRef>().ok()?;
        Some(text.get_string(&txn))
    }

    pub fn job_count(&self) -> usize {
        let txn = self.doc.transact();
        self.jobs.len(&txn) as usize
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for the sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full document state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only the updates a remote peer is missing, given its state
    /// vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| CoflowError::Crdt(format!("failed to decode state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a remote peer or the sync handshake.
    ///
    /// Remote-origin updates are flagged so the local-update observer does
    /// not echo them back out.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| CoflowError::Crdt(format!("failed to decode update: {e}")))?;

        if origin != UpdateOrigin::Local {
            self.applying_remote.store(true, Ordering::SeqCst);
        }
        let result = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| CoflowError::Crdt(format!("failed to apply update: {e}")))
        };
        self.applying_remote.store(false, Ordering::SeqCst);
        log::debug!("applied {} byte update ({origin})", update.len());
        result
    }

    // ==================== Observers ====================

    /// Take and clear the dirty mask accumulated since the last call.
    ///
    /// Deep observers on each root collection mark it dirty once per
    /// transaction touching its subtree; callers drain the mask after each
    /// `transact`/`apply_update` to rebuild only affected snapshot slices.
    pub fn take_dirty(&self) -> DirtyMask {
        DirtyMask {
            jobs: self.dirty.jobs.swap(false, Ordering::SeqCst),
            triggers: self.dirty.triggers.swap(false, Ordering::SeqCst),
            edges: self.dirty.edges.swap(false, Ordering::SeqCst),
            positions: self.dirty.positions.swap(false, Ordering::SeqCst),
        }
    }

    /// Subscribe to locally-originated update payloads for outbound
    /// broadcast. Updates applied via [`apply_update`](Self::apply_update)
    /// with a non-local origin are suppressed to avoid echo loops.
    pub fn observe_local_updates<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let applying_remote = Arc::clone(&self.applying_remote);
        self.doc
            .observe_update_v1(move |_txn, event| {
                if !applying_remote.load(Ordering::SeqCst) {
                    callback(&event.update);
                }
            })
            .expect("failed to observe document updates")
    }
}

impl Default for WorkflowDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDoc")
            .field("client_id", &self.doc.client_id())
            .field("job_count", &self.job_count())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Resolved operations and field helpers
// ===========================================================================

enum ResolvedOp {
    InsertJob(Job),
    UpdateJob {
        map: MapRef,
        name: Option<String>,
        adaptor: Option<String>,
        splice: Option<(TextRef, Splice)>,
        project_credential_id: Option<Option<Uuid>>,
        keychain_credential_id: Option<Option<Uuid>>,
    },
    InsertTrigger(Trigger),
    UpdateTrigger {
        map: MapRef,
        kind: Option<TriggerKind>,
        enabled: Option<bool>,
    },
    InsertEdge(Edge),
    UpdateEdge {
        map: MapRef,
        edge: Edge,
    },
    RemoveAt(ArrayRef, u32),
    SetPosition(Uuid, Position),
    RemovePosition(Uuid),
}

/// A minimal text replacement: delete `delete_len` chars at `start`, then
/// insert `insert` there.
struct Splice {
    start: u32,
    delete_len: u32,
    insert: String,
}

/// Compute the minimal splice turning `current` into `next` using the
/// common prefix/suffix. Applying only the changed middle keeps CRDT
/// operation ids stable for untouched content, so concurrent edits to the
/// same body merge properly.
fn diff_splice(current: &str, next: &str) -> Splice {
    let current_chars: Vec<char> = current.chars().collect();
    let next_chars: Vec<char> = next.chars().collect();

    let common_prefix = current_chars
        .iter()
        .zip(next_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let remaining_current = current_chars.len() - common_prefix;
    let remaining_next = next_chars.len() - common_prefix;
    let common_suffix = current_chars[common_prefix..]
        .iter()
        .rev()
        .zip(next_chars[common_prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .take(remaining_current.min(remaining_next))
        .count();

    Splice {
        start: common_prefix as u32,
        delete_len: (current_chars.len() - common_suffix - common_prefix) as u32,
        insert: next_chars[common_prefix..next_chars.len() - common_suffix]
            .iter()
            .collect(),
    }
}

fn apply_splice(txn: &mut TransactionMut, text: &TextRef, splice: &Splice) {
    if splice.delete_len > 0 {
        text.remove_range(txn, splice.start, splice.delete_len);
    }
    if !splice.insert.is_empty() {
        text.insert(txn, splice.start, &splice.insert);
    }
}

fn set_optional_id(txn: &mut TransactionMut, map: &MapRef, key: &str, value: Option<Uuid>) {
    match value {
        Some(id) => {
            map.insert(txn, key, id.to_string());
        }
        None => {
            map.remove(txn, key);
        }
    }
}

fn kind_json(kind: &TriggerKind) -> String {
    serde_json::to_string(kind).unwrap_or_default()
}

fn condition_str(edge: &Edge) -> String {
    match serde_json::to_value(edge.condition_type) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "always".to_string(),
    }
}

fn write_edge_fields(txn: &mut TransactionMut, map: &MapRef, edge: &Edge) {
    set_optional_id(txn, map, "source_job_id", edge.source_job_id);
    set_optional_id(txn, map, "source_trigger_id", edge.source_trigger_id);
    map.insert(txn, "target_job_id", edge.target_job_id.to_string());
    map.insert(txn, "condition_type", condition_str(edge));
    match &edge.condition_expression {
        Some(expr) => {
            map.insert(txn, "condition_expression", expr.clone());
        }
        None => {
            map.remove(txn, "condition_expression");
        }
    }
    map.insert(txn, "enabled", edge.enabled);
}

/// Find an item map by id within a collection array.
fn find_item<T: ReadTxn>(txn: &T, array: &ArrayRef, id: Uuid) -> Option<(u32, MapRef)> {
    let id = id.to_string();
    for (index, value) in array.iter(txn).enumerate() {
        if let Ok(map) = value.cast::<MapRef>()
            && map_string(txn, &map, "id").as_deref() == Some(id.as_str())
        {
            return Some((index as u32, map));
        }
    }
    None
}

fn map_string<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<String> {
    map.get(txn, key).and_then(|v| v.cast::<String>().ok())
}

fn map_bool<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<bool> {
    map.get(txn, key).and_then(|v| v.cast::<bool>().ok())
}

fn map_uuid<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<Uuid> {
    map_string(txn, map, key).and_then(|s| Uuid::parse_str(&s).ok())
}

fn read_job<T: ReadTxn>(txn: &T, value: Out) -> Option<Job> {
    let map = value.cast::<MapRef>().ok()?;
    let body = map
        .get(txn, "body")
        .and_then(|v| v.cast::<TextRef>().ok())
        .map(|text| text.get_string(txn))
        .unwrap_or_default();
    Some(Job {
        id: map_uuid(txn, &map, "id")?,
        name: map_string(txn, &map, "name")?,
        body,
        adaptor: map_string(txn, &map, "adaptor")?,
        project_credential_id: map_uuid(txn, &map, "project_credential_id"),
        keychain_credential_id: map_uuid(txn, &map, "keychain_credential_id"),
    })
}

fn read_trigger<T: ReadTxn>(txn: &T, value: Out) -> Option<Trigger> {
    let map = value.cast::<MapRef>().ok()?;
    let kind: TriggerKind = serde_json::from_str(&map_string(txn, &map, "kind")?).ok()?;
    Some(Trigger {
        id: map_uuid(txn, &map, "id")?,
        kind,
        enabled: map_bool(txn, &map, "enabled")?,
    })
}

fn read_edge<T: ReadTxn>(txn: &T, value: Out) -> Option<Edge> {
    let map = value.cast::<MapRef>().ok()?;
    let condition_type =
        serde_json::from_value(serde_json::Value::String(map_string(
            txn,
            &map,
            "condition_type",
        )?))
        .ok()?;
    Some(Edge {
        id: map_uuid(txn, &map, "id")?,
        source_job_id: map_uuid(txn, &map, "source_job_id"),
        source_trigger_id: map_uuid(txn, &map, "source_trigger_id"),
        target_job_id: map_uuid(txn, &map, "target_job_id")?,
        condition_type,
        condition_expression: map_string(txn, &map, "condition_expression"),
        enabled: map_bool(txn, &map, "enabled").unwrap_or(true),
    })
}
