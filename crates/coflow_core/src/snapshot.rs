//! Immutable snapshots of the workflow for rendering.
//!
//! The shared document is mutation-oriented; consumers want cheap,
//! immutable views they can diff by pointer. [`SnapshotStore`] materializes
//! [`Snapshot`]s from a [`WorkflowState`], rebuilding only the collections a
//! transaction touched: an untouched collection keeps the exact same `Arc`
//! slice across snapshots, so `Arc::ptr_eq` tells a subscriber whether
//! anything it cares about changed.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::doc::DirtyMask;
use crate::model::{Edge, Job, Position, SelectedNode, Trigger, WorkflowState};

/// An immutable view of the workflow at a point in time.
///
/// Cloning is cheap; collection slices are shared via `Arc` and reused
/// across snapshots when their collection did not change.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Jobs in CRDT sequence order.
    pub jobs: Arc<Vec<Job>>,
    /// Triggers in CRDT sequence order.
    pub triggers: Arc<Vec<Trigger>>,
    /// Edges in CRDT sequence order. Each edge's `enabled` carries the
    /// derived value: an edge leaving a disabled trigger reads disabled
    /// here even though its stored flag is untouched.
    pub edges: Arc<Vec<Edge>>,
    /// Diagram positions by node id.
    pub positions: Arc<HashMap<Uuid, Position>>,
    /// Edges whose endpoints no longer resolve, surfaced after remote
    /// merges for the consumer to repair or remove.
    pub dangling_edge_ids: Arc<Vec<Uuid>>,

    /// Current selection, already validated against the graph.
    pub selection: Option<SelectedNode>,
    /// Derived workflow enabled flag: `None` when no triggers exist.
    pub enabled: Option<bool>,
    /// Whether a live collaboration session is attached.
    pub is_collaborating: bool,

    version: u64,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            jobs: Arc::new(Vec::new()),
            triggers: Arc::new(Vec::new()),
            edges: Arc::new(Vec::new()),
            positions: Arc::new(HashMap::new()),
            dangling_edge_ids: Arc::new(Vec::new()),
            selection: None,
            enabled: None,
            is_collaborating: false,
            version: 0,
        }
    }

    /// Monotonic counter bumped whenever any part of the snapshot changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn job(&self, id: Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn trigger(&self, id: Uuid) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.id == id)
    }

    pub fn edge(&self, id: Uuid) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }
}

/// Handle returned by [`SnapshotStore::subscribe`]; pass back to
/// [`SnapshotStore::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(&Snapshot) + Send + Sync>;

/// Materializes snapshots from workflow state and fans them out to
/// subscribers.
pub struct SnapshotStore {
    current: Arc<Snapshot>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_listener_id: u64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Snapshot::empty()),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    /// The latest snapshot. Repeated calls without an intervening change
    /// return the same allocation, so `Arc::ptr_eq` on the snapshot itself
    /// answers "did anything change" in one comparison.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current)
    }

    /// Rebuild the snapshot from `state`, refreshing only the collections
    /// named dirty. Triggers feed two derived values (the workflow enabled
    /// flag and per-edge effective enabled), so a trigger change also
    /// rebuilds the edge slice.
    ///
    /// Notifies subscribers only if something actually changed.
    pub fn refresh(&mut self, state: &WorkflowState, dirty: DirtyMask) {
        if !dirty.any() {
            return;
        }
        let prev = &self.current;

        let jobs = if dirty.jobs {
            Arc::new(state.jobs.values().cloned().collect())
        } else {
            Arc::clone(&prev.jobs)
        };
        let triggers = if dirty.triggers {
            Arc::new(state.triggers.values().cloned().collect())
        } else {
            Arc::clone(&prev.triggers)
        };
        let edges = if dirty.edges || dirty.triggers {
            Arc::new(
                state
                    .edges
                    .values()
                    .map(|e| {
                        let mut edge = e.clone();
                        edge.enabled = state.edge_effective_enabled(e);
                        edge
                    })
                    .collect(),
            )
        } else {
            Arc::clone(&prev.edges)
        };
        let positions = if dirty.positions {
            Arc::new(state.positions.clone())
        } else {
            Arc::clone(&prev.positions)
        };
        let dangling_edge_ids = if dirty.jobs || dirty.triggers || dirty.edges {
            Arc::new(state.dangling_edge_ids())
        } else {
            Arc::clone(&prev.dangling_edge_ids)
        };

        // A selection pointing at a node a remote peer deleted is cleared
        // rather than left dangling.
        let selection = prev
            .selection
            .filter(|selected| state.selection_exists(selected));
        if prev.selection.is_some() && selection.is_none() {
            log::debug!("clearing selection: node no longer exists");
        }

        self.current = Arc::new(Snapshot {
            jobs,
            triggers,
            edges,
            positions,
            dangling_edge_ids,
            selection,
            enabled: state.derived_enabled(),
            is_collaborating: prev.is_collaborating,
            version: prev.version + 1,
        });
        self.notify();
    }

    /// Update the selection, validating it against `state`. Selecting a
    /// missing node clears the selection instead.
    pub fn set_selection(&mut self, state: &WorkflowState, selection: Option<SelectedNode>) {
        let selection = selection.filter(|s| state.selection_exists(s));
        if self.current.selection == selection {
            return;
        }
        let snap = Arc::make_mut(&mut self.current);
        snap.selection = selection;
        snap.version += 1;
        self.notify();
    }

    pub fn set_collaborating(&mut self, collaborating: bool) {
        if self.current.is_collaborating == collaborating {
            return;
        }
        let snap = Arc::make_mut(&mut self.current);
        snap.is_collaborating = collaborating;
        snap.version += 1;
        self.notify();
    }

    /// Register a listener invoked with each new snapshot.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    fn notify(&self) {
        for (_, listener) in &self.listeners {
            listener(&self.current);
        }
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Memoizes a value derived from one snapshot slice.
///
/// Recomputes only when the slice `Arc` pointer changes, so a consumer
/// deriving e.g. a sorted job list pays nothing while other collections
/// churn.
pub struct SliceSelector<T, O> {
    cached: Option<(Arc<T>, O)>,
}

impl<T, O: Clone> SliceSelector<T, O> {
    pub fn new() -> Self {
        Self { cached: None }
    }

    pub fn select<F>(&mut self, input: &Arc<T>, compute: F) -> O
    where
        F: FnOnce(&T) -> O,
    {
        if let Some((prev, out)) = &self.cached
            && Arc::ptr_eq(prev, input)
        {
            return out.clone();
        }
        let out = compute(input);
        self.cached = Some((Arc::clone(input), out.clone()));
        out
    }
}

impl<T, O: Clone> Default for SliceSelector<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeCondition, TriggerKind};
    use std::sync::Mutex;

    fn sample_state() -> (WorkflowState, Job, Trigger, Edge) {
        let mut state = WorkflowState::default();
        let job = Job::new("fetch", "@openfn/language-common@2.0.0");
        let trigger = Trigger::new(TriggerKind::Webhook);
        let edge = Edge::from_trigger(trigger.id, job.id, EdgeCondition::Always);
        state.jobs.insert(job.id, job.clone());
        state.triggers.insert(trigger.id, trigger.clone());
        state.edges.insert(edge.id, edge.clone());
        (state, job, trigger, edge)
    }

    #[test]
    fn test_refresh_materializes_state() {
        let (state, job, trigger, edge) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());

        let snap = store.get_snapshot();
        assert_eq!(snap.jobs.len(), 1);
        assert_eq!(snap.job(job.id).unwrap().name, "fetch");
        assert!(snap.trigger(trigger.id).is_some());
        assert!(snap.edge(edge.id).is_some());
        assert_eq!(snap.enabled, Some(true));
        assert!(snap.dangling_edge_ids.is_empty());
    }

    #[test]
    fn test_untouched_slices_keep_identity() {
        let (mut state, job, _, _) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());
        let before = store.get_snapshot();

        // Only a position moved.
        state.positions.insert(job.id, Position { x: 1.0, y: 2.0 });
        store.refresh(
            &state,
            DirtyMask {
                positions: true,
                ..Default::default()
            },
        );
        let after = store.get_snapshot();

        assert!(Arc::ptr_eq(&before.jobs, &after.jobs));
        assert!(Arc::ptr_eq(&before.triggers, &after.triggers));
        assert!(Arc::ptr_eq(&before.edges, &after.edges));
        assert!(!Arc::ptr_eq(&before.positions, &after.positions));
        assert!(after.version() > before.version());
    }

    #[test]
    fn test_snapshot_identity_stable_until_something_changes() {
        let (state, ..) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());

        // Reads and no-op refreshes hand out the same allocation.
        let a = store.get_snapshot();
        assert!(Arc::ptr_eq(&a, &store.get_snapshot()));
        store.refresh(&state, DirtyMask::default());
        assert!(Arc::ptr_eq(&a, &store.get_snapshot()));

        store.set_collaborating(true);
        let b = store.get_snapshot();
        assert!(!Arc::ptr_eq(&a, &b));
        // The outstanding snapshot is untouched by the change.
        assert!(!a.is_collaborating);
        assert!(b.is_collaborating);
    }

    #[test]
    fn test_trigger_change_rebuilds_edges_with_derived_enabled() {
        let (mut state, _, trigger, edge) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());

        state.triggers.get_mut(&trigger.id).unwrap().enabled = false;
        store.refresh(
            &state,
            DirtyMask {
                triggers: true,
                ..Default::default()
            },
        );

        let snap = store.get_snapshot();
        assert_eq!(snap.enabled, Some(false));
        // Stored flag stays true, but the snapshot reports the derived value.
        assert!(state.edges[&edge.id].enabled);
        assert!(!snap.edge(edge.id).unwrap().enabled);
    }

    #[test]
    fn test_dangling_edges_surfaced_after_merge() {
        let (mut state, job, _, edge) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());

        // A remote merge can delete a job an edge still targets.
        state.jobs.shift_remove(&job.id);
        store.refresh(
            &state,
            DirtyMask {
                jobs: true,
                ..Default::default()
            },
        );

        let snap = store.get_snapshot();
        assert_eq!(*snap.dangling_edge_ids, vec![edge.id]);
    }

    #[test]
    fn test_selection_cleared_when_node_removed() {
        let (mut state, job, _, _) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());
        store.set_selection(&state, Some(SelectedNode::Job(job.id)));
        assert_eq!(
            store.get_snapshot().selection,
            Some(SelectedNode::Job(job.id))
        );

        state.jobs.shift_remove(&job.id);
        store.refresh(
            &state,
            DirtyMask {
                jobs: true,
                ..Default::default()
            },
        );
        assert_eq!(store.get_snapshot().selection, None);
    }

    #[test]
    fn test_selecting_missing_node_is_noop() {
        let (state, ..) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());

        store.set_selection(&state, Some(SelectedNode::Job(Uuid::new_v4())));
        assert_eq!(store.get_snapshot().selection, None);
    }

    #[test]
    fn test_subscribers_notified_and_unsubscribed() {
        let (state, ..) = sample_state();
        let mut store = SnapshotStore::new();

        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = store.subscribe(move |snap| sink.lock().unwrap().push(snap.version()));

        store.refresh(&state, DirtyMask::all());
        assert_eq!(seen.lock().unwrap().len(), 1);

        store.unsubscribe(sub);
        store.set_collaborating(true);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_slice_selector_memoizes_on_pointer() {
        let (state, ..) = sample_state();
        let mut store = SnapshotStore::new();
        store.refresh(&state, DirtyMask::all());

        let mut selector: SliceSelector<Vec<Job>, Vec<String>> = SliceSelector::new();
        let mut computations = 0;
        let snap = store.get_snapshot();

        for _ in 0..3 {
            let names = selector.select(&snap.jobs, |jobs| {
                computations += 1;
                jobs.iter().map(|j| j.name.clone()).collect()
            });
            assert_eq!(names, vec!["fetch".to_string()]);
        }
        assert_eq!(computations, 1);
    }
}
