//! Collaboration transport: wire protocol and the client-side bridge.
//!
//! [`protocol`] defines the binary framing shared with the sync server;
//! [`bridge`] drives a [`Transport`](bridge::Transport) through the
//! connect/handshake/live-update lifecycle and carries the RPC and
//! awareness side-channels.

pub mod bridge;
pub mod protocol;

pub use bridge::{BridgeEvent, SyncBridge, SyncStatus, Transport};
pub use protocol::{ProtocolMessage, RpcReply, RpcRequest, SyncMessage};
