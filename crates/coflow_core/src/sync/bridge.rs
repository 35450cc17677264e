//! Client-side bridge between the shared document and a sync transport.
//!
//! The bridge owns the connection lifecycle: it runs the y-sync handshake
//! after connecting, forwards live updates both ways, queues local updates
//! while offline and replays them in order once synced, and correlates
//! request/reply RPC traffic. It never mutates the document itself; remote
//! updates are handed back as [`BridgeEvent`]s so the owning session applies
//! them through its single materialization path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::doc::{UpdateOrigin, WorkflowDoc};
use crate::error::{CoflowError, Result};
use crate::sync::protocol::{ProtocolMessage, RpcReply, RpcRequest, SyncMessage};

/// Abstraction over the underlying connection (websocket, channel, test
/// double). Implementations are synchronous; an async transport pumps its
/// socket elsewhere and surfaces complete messages here.
pub trait Transport: Send {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self);
    /// Send one transport message (possibly several concatenated frames).
    fn send(&mut self, message: Vec<u8>) -> Result<()>;
    /// Drain inbound transport messages received since the last call.
    fn receive(&mut self) -> Vec<Vec<u8>>;
    fn is_connected(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }
    fn disconnect(&mut self) {
        (**self).disconnect()
    }
    fn send(&mut self, message: Vec<u8>) -> Result<()> {
        (**self).send(message)
    }
    fn receive(&mut self) -> Vec<Vec<u8>> {
        (**self).receive()
    }
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Connection lifecycle state.
///
/// Local editing is never blocked by this; it only gates when updates are
/// broadcast versus queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Disconnected,
    Connecting,
    /// Transport is up, initial handshake still in flight.
    Connected,
    /// Handshake complete; live updates flow both ways.
    Synced,
}

/// What the bridge observed while processing traffic. The owning session
/// routes these to the store, presence tracker and command callers.
#[derive(Debug)]
pub enum BridgeEvent {
    StatusChanged(SyncStatus),
    /// A document update to apply and rematerialize.
    RemoteUpdate {
        update: Vec<u8>,
        origin: UpdateOrigin,
    },
    /// A presence payload from another peer (JSON).
    Awareness(Vec<u8>),
    /// An RPC finished, successfully or not.
    RpcResolved {
        id: u64,
        method: String,
        result: std::result::Result<serde_json::Value, CoflowError>,
    },
}

/// Drives a [`Transport`] through connect/handshake/live phases for one
/// document.
pub struct SyncBridge<T: Transport> {
    transport: T,
    doc: Arc<WorkflowDoc>,
    status: SyncStatus,
    /// Local updates produced while not synced, flushed FIFO on sync.
    offline_queue: VecDeque<Vec<u8>>,
    pending_rpcs: HashMap<u64, String>,
    next_rpc_id: u64,
}

impl<T: Transport> SyncBridge<T> {
    pub fn new(doc: Arc<WorkflowDoc>, transport: T) -> Self {
        Self {
            transport,
            doc,
            status: SyncStatus::Disconnected,
            offline_queue: VecDeque::new(),
            pending_rpcs: HashMap::new(),
            next_rpc_id: 0,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn queued_update_count(&self) -> usize {
        self.offline_queue.len()
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Open the transport and start the handshake by sending our state
    /// vector. Completion (Synced) happens when the server's Step2 arrives.
    pub fn connect(&mut self) -> Result<Vec<BridgeEvent>> {
        if self.status != SyncStatus::Disconnected {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        self.set_status(SyncStatus::Connecting, &mut events);

        if let Err(e) = self.transport.connect() {
            self.set_status(SyncStatus::Disconnected, &mut events);
            return Err(e);
        }

        let step1 = ProtocolMessage::Sync(SyncMessage::Step1(self.doc.encode_state_vector()));
        self.send_or_drop(step1.encode(), &mut events)?;
        self.set_status(SyncStatus::Connected, &mut events);
        log::info!("sync transport connected");
        Ok(events)
    }

    /// Close the transport. Pending RPCs fail with a retryable transport
    /// error; queued offline updates are kept for the next session.
    pub fn disconnect(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        if self.status == SyncStatus::Disconnected {
            return events;
        }
        self.transport.disconnect();
        self.fail_pending_rpcs("connection closed", &mut events);
        self.set_status(SyncStatus::Disconnected, &mut events);
        log::info!("sync transport disconnected");
        events
    }

    /// Broadcast a local document update, or queue it while offline.
    pub fn queue_local_update(&mut self, update: Vec<u8>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        if self.status == SyncStatus::Synced {
            let frame = ProtocolMessage::Sync(SyncMessage::Update(update.clone())).encode();
            if self.send_or_drop(frame, &mut events).is_err() {
                // Keep the update; it flushes on the next successful sync.
                self.offline_queue.push_back(update);
            }
        } else {
            self.offline_queue.push_back(update);
        }
        events
    }

    /// Broadcast a presence payload. Presence is ephemeral: while offline
    /// it is simply dropped.
    pub fn send_awareness(&mut self, payload: Vec<u8>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        if self.status == SyncStatus::Connected || self.status == SyncStatus::Synced {
            let frame = ProtocolMessage::Awareness(payload).encode();
            let _ = self.send_or_drop(frame, &mut events);
        }
        events
    }

    /// Issue a request on the RPC side-channel. The reply arrives later as
    /// a [`BridgeEvent::RpcResolved`] carrying the returned id.
    pub fn call(&mut self, method: &str, params: serde_json::Value) -> Result<u64> {
        if self.status == SyncStatus::Disconnected || self.status == SyncStatus::Connecting {
            return Err(CoflowError::Transport(format!(
                "cannot call '{method}' while disconnected"
            )));
        }
        let id = self.next_rpc_id;
        self.next_rpc_id += 1;
        let frame = ProtocolMessage::RpcRequest(RpcRequest {
            id,
            method: method.to_string(),
            params: serde_json::to_vec(&params)
                .map_err(|e| CoflowError::Protocol(format!("unencodable rpc params: {e}")))?,
        })
        .encode();

        let mut events = Vec::new();
        self.send_or_drop(frame, &mut events)?;
        self.pending_rpcs.insert(id, method.to_string());
        Ok(id)
    }

    /// Drain the transport and process every inbound frame.
    pub fn poll(&mut self) -> Result<Vec<BridgeEvent>> {
        let messages = self.transport.receive();
        let mut events = Vec::new();
        for message in messages {
            if self.status == SyncStatus::Disconnected {
                // Stale delivery from a torn-down connection.
                log::warn!("dropping frame received while disconnected");
                continue;
            }
            self.handle_message(&message, &mut events)?;
        }
        Ok(events)
    }

    fn handle_message(&mut self, data: &[u8], events: &mut Vec<BridgeEvent>) -> Result<()> {
        for frame in ProtocolMessage::decode_all(data)? {
            match frame {
                ProtocolMessage::Sync(SyncMessage::Step1(remote_sv)) => {
                    let diff = self.doc.encode_diff(&remote_sv)?;
                    let reply = ProtocolMessage::Sync(SyncMessage::Step2(diff)).encode();
                    self.send_or_drop(reply, events)?;
                }
                ProtocolMessage::Sync(SyncMessage::Step2(update)) => {
                    events.push(BridgeEvent::RemoteUpdate {
                        update,
                        origin: UpdateOrigin::Sync,
                    });
                    if self.status == SyncStatus::Connected {
                        self.set_status(SyncStatus::Synced, events);
                        self.flush_offline_queue(events)?;
                    }
                }
                ProtocolMessage::Sync(SyncMessage::Update(update)) => {
                    events.push(BridgeEvent::RemoteUpdate {
                        update,
                        origin: UpdateOrigin::Remote,
                    });
                }
                ProtocolMessage::Awareness(payload) => {
                    events.push(BridgeEvent::Awareness(payload));
                }
                ProtocolMessage::RpcReply(reply) => {
                    let id = reply.id();
                    let Some(method) = self.pending_rpcs.remove(&id) else {
                        log::warn!("rpc reply for unknown id {id}");
                        continue;
                    };
                    let result = match reply {
                        RpcReply::Ok { payload, .. } => serde_json::from_slice(&payload)
                            .map_err(|e| {
                                CoflowError::Protocol(format!("malformed rpc payload: {e}"))
                            }),
                        RpcReply::Error { message, .. } => Err(CoflowError::Rpc {
                            method: method.clone(),
                            message,
                        }),
                        RpcReply::Unauthorized { message, .. } => {
                            Err(CoflowError::Unauthorized(message))
                        }
                    };
                    events.push(BridgeEvent::RpcResolved { id, method, result });
                }
                ProtocolMessage::RpcRequest(req) => {
                    log::warn!("ignoring inbound rpc request '{}'", req.method);
                }
            }
        }
        Ok(())
    }

    /// Replay updates queued while offline, oldest first, so edits made
    /// against a stale document reach peers in their original order.
    fn flush_offline_queue(&mut self, events: &mut Vec<BridgeEvent>) -> Result<()> {
        while let Some(update) = self.offline_queue.pop_front() {
            let frame = ProtocolMessage::Sync(SyncMessage::Update(update.clone())).encode();
            if let Err(e) = self.send_or_drop(frame, events) {
                self.offline_queue.push_front(update);
                return Err(e);
            }
        }
        Ok(())
    }

    fn send_or_drop(&mut self, frame: Vec<u8>, events: &mut Vec<BridgeEvent>) -> Result<()> {
        match self.transport.send(frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("transport send failed: {e}");
                self.transport.disconnect();
                self.fail_pending_rpcs("send failed", events);
                self.set_status(SyncStatus::Disconnected, events);
                Err(e)
            }
        }
    }

    fn fail_pending_rpcs(&mut self, reason: &str, events: &mut Vec<BridgeEvent>) {
        for (id, method) in self.pending_rpcs.drain() {
            events.push(BridgeEvent::RpcResolved {
                id,
                method: method.clone(),
                result: Err(CoflowError::Transport(format!(
                    "'{method}' abandoned: {reason}"
                ))),
            });
        }
    }

    fn set_status(&mut self, status: SyncStatus, events: &mut Vec<BridgeEvent>) {
        if self.status != status {
            self.status = status;
            events.push(BridgeEvent::StatusChanged(status));
        }
    }
}
