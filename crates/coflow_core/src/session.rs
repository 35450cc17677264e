//! A collaboration session: the owning context for one open workflow.
//!
//! [`CollabSession`] wires the shared document, command store, sync bridge
//! and presence tracker together and drives them from a periodic tick. It
//! is created per document and torn down on close; undo history and
//! presence never leak across workflows because the session that owned
//! them is gone. There is no global store: callers hold the session and
//! pass it where needed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::commands::WorkflowStore;
use crate::doc::WorkflowDoc;
use crate::error::{CoflowError, Result};
use crate::model::SelectedNode;
use crate::presence::{AwarenessEntry, AwarenessTracker, CursorPosition, UserInfo};
use crate::snapshot::Snapshot;
use crate::sync::bridge::{BridgeEvent, SyncBridge, SyncStatus, Transport};

/// Per-session configuration supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity broadcast on the presence channel.
    pub user: UserInfo,
    /// The workflow this session edits, used for logging only; routing is
    /// the transport's concern.
    pub workflow_id: String,
    /// Read-only sessions keep editing commands disabled from recording
    /// undo history.
    pub read_only: bool,
}

/// The top-level handle for collaborative editing of one workflow.
pub struct CollabSession<T: Transport> {
    config: SessionConfig,
    doc: Arc<WorkflowDoc>,
    store: WorkflowStore,
    bridge: SyncBridge<T>,
    presence: AwarenessTracker,
    /// Resolved RPC results awaiting pickup by their callers.
    rpc_results: HashMap<u64, std::result::Result<serde_json::Value, CoflowError>>,
}

impl<T: Transport> CollabSession<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        let doc = Arc::new(WorkflowDoc::new());
        let mut store = WorkflowStore::new_collaborative(Arc::clone(&doc));
        if config.read_only {
            store.set_ledger_disabled(true);
        }
        let presence = AwarenessTracker::new(doc.client_id(), config.user.clone());
        let bridge = SyncBridge::new(Arc::clone(&doc), transport);
        log::info!("session opened for workflow {}", config.workflow_id);
        Self {
            config,
            doc,
            store,
            bridge,
            presence,
            rpc_results: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The command API for this session's workflow.
    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut WorkflowStore {
        &mut self.store
    }

    pub fn doc(&self) -> &Arc<WorkflowDoc> {
        &self.doc
    }

    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.store.get_snapshot()
    }

    pub fn status(&self) -> SyncStatus {
        self.bridge.status()
    }

    /// True once the initial handshake has completed. Consumers reading
    /// collaborative state should gate on this, not on mere connectedness:
    /// between Connected and Synced the document may be partially
    /// populated.
    pub fn is_synced(&self) -> bool {
        self.bridge.status() == SyncStatus::Synced
    }

    // ==================== Lifecycle ====================

    /// Open the transport and start syncing. Local editing works before,
    /// during and after; edits made while offline queue for replay.
    pub fn connect(&mut self) -> Result<()> {
        let events = self.bridge.connect()?;
        self.route(events);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        let leave = self.presence.leave_payload();
        let events = self.bridge.send_awareness(leave);
        self.route(events);
        let events = self.bridge.disconnect();
        self.route(events);
    }

    /// Periodic driver, called on the host's cadence (tens of ms). Pushes
    /// queued local updates out, processes inbound traffic and services the
    /// presence heartbeat.
    pub fn tick(&mut self, now_ms: u64) -> Result<()> {
        let outbound: Vec<Vec<u8>> = self.store.outbox().lock().unwrap().drain(..).collect();
        for update in outbound {
            let events = self.bridge.queue_local_update(update);
            self.route(events);
        }

        let events = self.bridge.poll()?;
        self.route(events);

        if let Some(payload) = self.presence.tick(now_ms) {
            let events = self.bridge.send_awareness(payload);
            self.route(events);
        }
        Ok(())
    }

    /// Tear the session down: announce departure, close the transport and
    /// drop undo history and presence.
    pub fn teardown(&mut self) {
        self.disconnect();
        self.store.clear_history();
        self.presence.reset();
        log::info!("session closed for workflow {}", self.config.workflow_id);
    }

    // ==================== Presence ====================

    pub fn set_cursor(&mut self, cursor: Option<CursorPosition>, now_ms: u64) {
        if let Some(payload) = self.presence.set_cursor(cursor, now_ms) {
            let events = self.bridge.send_awareness(payload);
            self.route(events);
        }
    }

    /// Select a node locally and announce it on the presence channel.
    pub fn select(&mut self, selection: Option<SelectedNode>, now_ms: u64) {
        self.store.select(selection);
        let payload = self.presence.set_selection(selection, now_ms);
        let events = self.bridge.send_awareness(payload);
        self.route(events);
    }

    pub fn peers(&self, now_ms: u64) -> Vec<&AwarenessEntry> {
        self.presence.peers(now_ms)
    }

    // ==================== RPC ====================

    /// Issue a server command (e.g. `save_workflow`). The result is
    /// collected later via [`take_rpc_result`](Self::take_rpc_result).
    pub fn call(&mut self, method: &str, params: serde_json::Value) -> Result<u64> {
        self.bridge.call(method, params)
    }

    /// Take the result of a finished RPC, if it has resolved.
    pub fn take_rpc_result(
        &mut self,
        id: u64,
    ) -> Option<std::result::Result<serde_json::Value, CoflowError>> {
        self.rpc_results.remove(&id)
    }

    // ==================== Event routing ====================

    fn route(&mut self, events: Vec<BridgeEvent>) {
        for event in events {
            match event {
                BridgeEvent::StatusChanged(status) => {
                    log::debug!("sync status: {status:?}");
                    self.store.set_collaborating(status == SyncStatus::Synced);
                }
                BridgeEvent::RemoteUpdate { update, origin } => {
                    if let Err(e) = self.store.apply_remote_update(&update, origin) {
                        log::error!("failed to apply remote update: {e}");
                    }
                }
                BridgeEvent::Awareness(payload) => {
                    if let Err(e) = self.presence.apply_remote(&payload) {
                        log::warn!("ignoring awareness payload: {e}");
                    }
                }
                BridgeEvent::RpcResolved { id, method, result } => {
                    if let Err(e) = &result {
                        log::warn!("rpc '{method}' failed: {e}");
                    }
                    self.rpc_results.insert(id, result);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, Position};
    use crate::sync::protocol::{ProtocolMessage, RpcReply, SyncMessage};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct StubTransport {
        connected: bool,
        sent: Vec<Vec<u8>>,
        inbound: VecDeque<Vec<u8>>,
    }

    impl Transport for StubTransport {
        fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }
        fn disconnect(&mut self) {
            self.connected = false;
        }
        fn send(&mut self, message: Vec<u8>) -> Result<()> {
            self.sent.push(message);
            Ok(())
        }
        fn receive(&mut self) -> Vec<Vec<u8>> {
            self.inbound.drain(..).collect()
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            user: UserInfo {
                id: "u1".into(),
                name: "alice".into(),
                color: "#aabbcc".into(),
            },
            workflow_id: "wf-1".into(),
            read_only: false,
        }
    }

    fn session() -> CollabSession<StubTransport> {
        CollabSession::new(config(), StubTransport::default())
    }

    fn sync_session(session: &mut CollabSession<StubTransport>) {
        session.connect().unwrap();
        session
            .bridge
            .transport_mut()
            .inbound
            .push_back(ProtocolMessage::Sync(SyncMessage::Step2(Vec::new())).encode());
        session.tick(0).unwrap();
    }

    fn sent_frames(session: &CollabSession<StubTransport>) -> Vec<ProtocolMessage> {
        session
            .bridge
            .transport()
            .sent
            .iter()
            .flat_map(|m| ProtocolMessage::decode_all(m).unwrap())
            .collect()
    }

    #[test]
    fn test_offline_edits_flow_out_after_sync() {
        let mut session = session();
        let job = Job::new("fetch", "@openfn/language-http@6.0.0");
        session
            .store_mut()
            .add_job(job.clone(), Position { x: 0.0, y: 0.0 })
            .unwrap();

        // Offline: tick moves the update from the outbox into the bridge
        // queue but nothing hits the wire.
        session.tick(0).unwrap();
        assert!(sent_frames(&session).is_empty());

        sync_session(&mut session);
        assert!(
            sent_frames(&session)
                .iter()
                .any(|f| matches!(f, ProtocolMessage::Sync(SyncMessage::Update(_))))
        );
    }

    #[test]
    fn test_sync_status_drives_is_collaborating() {
        let mut session = session();
        assert!(!session.get_snapshot().is_collaborating);

        sync_session(&mut session);
        assert!(session.is_synced());
        assert!(session.get_snapshot().is_collaborating);

        session.disconnect();
        assert!(!session.get_snapshot().is_collaborating);
    }

    #[test]
    fn test_remote_update_materializes_into_snapshot() {
        let mut session = session();
        sync_session(&mut session);

        let peer = WorkflowDoc::with_client_id(99);
        let job = Job::new("remote job", "@openfn/language-http@6.0.0");
        peer.transact(&[crate::doc::DocOp::InsertJob(job.clone())])
            .unwrap();
        session.bridge.transport_mut().inbound.push_back(
            ProtocolMessage::Sync(SyncMessage::Update(peer.encode_state_as_update())).encode(),
        );
        session.tick(0).unwrap();

        assert!(session.get_snapshot().job(job.id).is_some());
        // Remote edits never enter local undo history.
        assert!(!session.store().can_undo());
    }

    #[test]
    fn test_rpc_result_pickup() {
        let mut session = session();
        sync_session(&mut session);

        let id = session
            .call("save_workflow", serde_json::json!({}))
            .unwrap();
        assert!(session.take_rpc_result(id).is_none());

        session
            .bridge
            .transport_mut()
            .inbound
            .push_back(
                ProtocolMessage::RpcReply(RpcReply::Ok {
                    id,
                    payload: b"{\"ok\":true}".to_vec(),
                })
                .encode(),
            );
        session.tick(0).unwrap();

        let result = session.take_rpc_result(id).unwrap().unwrap();
        assert_eq!(result["ok"], true);
        // Consumed: a second take finds nothing.
        assert!(session.take_rpc_result(id).is_none());
    }

    #[test]
    fn test_select_updates_snapshot_and_broadcasts() {
        let mut session = session();
        sync_session(&mut session);
        let job = Job::new("fetch", "@openfn/language-http@6.0.0");
        session
            .store_mut()
            .add_job(job.clone(), Position { x: 0.0, y: 0.0 })
            .unwrap();

        session.select(Some(SelectedNode::Job(job.id)), 1_000);
        assert_eq!(
            session.get_snapshot().selection,
            Some(SelectedNode::Job(job.id))
        );
        assert!(
            sent_frames(&session)
                .iter()
                .any(|f| matches!(f, ProtocolMessage::Awareness(_)))
        );
    }

    #[test]
    fn test_teardown_announces_leave_and_clears_history() {
        let mut session = session();
        sync_session(&mut session);
        let job = Job::new("fetch", "@openfn/language-http@6.0.0");
        session
            .store_mut()
            .add_job(job, Position { x: 0.0, y: 0.0 })
            .unwrap();
        assert!(session.store().can_undo());

        session.teardown();
        assert!(!session.store().can_undo());
        assert_eq!(session.status(), SyncStatus::Disconnected);
        assert!(
            sent_frames(&session)
                .iter()
                .any(|f| matches!(f, ProtocolMessage::Awareness(_)))
        );
    }

    #[test]
    fn test_read_only_session_records_no_undo() {
        let mut cfg = config();
        cfg.read_only = true;
        let mut session = CollabSession::new(cfg, StubTransport::default());
        let job = Job::new("fetch", "@openfn/language-http@6.0.0");
        session
            .store_mut()
            .add_job(job, Position { x: 0.0, y: 0.0 })
            .unwrap();
        assert!(!session.store().can_undo());
    }
}
