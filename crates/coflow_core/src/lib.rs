#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Command layer: validated, undoable workflow mutations
pub mod commands;

/// Shared CRDT workflow document
pub mod doc;

/// Error (common error types)
pub mod error;

/// Undo/redo ledger of reversible patches
pub mod ledger;

/// Workflow graph model (jobs, triggers, edges)
pub mod model;

/// Ephemeral presence/awareness tracking
pub mod presence;

/// Collaboration session lifecycle
pub mod session;

/// Immutable snapshots for rendering
pub mod snapshot;

/// Sync transport: wire protocol and client bridge
pub mod sync;

/// Field-level validation
pub mod validate;

pub use commands::{EdgeUpdate, JobUpdate, TriggerUpdate, WorkflowStore};
pub use doc::{DocOp, UpdateOrigin, WorkflowDoc};
pub use error::{CoflowError, Result, SerializableError};
pub use ledger::{ChangeLedger, Patch, PatchOp, PendingChange};
pub use model::{
    Edge, EdgeCondition, Job, KafkaConfig, Position, SaslConfig, SelectedNode, Trigger,
    TriggerKind, WorkflowState,
};
pub use presence::{AwarenessEntry, AwarenessTracker, CursorPosition, UserInfo};
pub use session::{CollabSession, SessionConfig};
pub use snapshot::{SliceSelector, Snapshot, SnapshotStore};
pub use sync::{BridgeEvent, SyncBridge, SyncStatus, Transport};
