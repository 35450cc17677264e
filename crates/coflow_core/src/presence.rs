//! Ephemeral presence (awareness) tracking.
//!
//! Who else is editing, where their cursor is and what they have selected.
//! None of this belongs in the durable document: payloads travel on the
//! awareness side-channel and entries vanish when a peer leaves or goes
//! stale. Time is passed in explicitly (milliseconds) so coalescing,
//! heartbeat and expiry are deterministic under test.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoflowError, Result};
use crate::model::SelectedNode;

/// Minimum interval between transmitted cursor updates. Movement inside
/// the window is coalesced; the latest position wins.
pub const CURSOR_COALESCE_MS: u64 = 50;

/// How often the local entry's heartbeat is refreshed while connected.
pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Peers silent for this long are expired, since a disconnect is not
/// always reported synchronously.
pub const STALE_AFTER_MS: u64 = 3 * HEARTBEAT_INTERVAL_MS;

/// Identity shown next to a peer's cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    /// Display color assigned by the caller, e.g. `#f6a609`.
    pub color: String,
}

/// A cursor position in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// One client's ephemeral presence state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub user: UserInfo,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub selection: Option<SelectedNode>,
    /// Milliseconds timestamp of the peer's last broadcast.
    pub last_seen_ms: u64,
}

/// Wire payload on the awareness channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AwarenessMessage {
    Update(AwarenessEntry),
    Leave { client_id: u64 },
}

/// Tracks the local client's presence and merges peers' broadcasts.
pub struct AwarenessTracker {
    local: AwarenessEntry,
    peers: HashMap<u64, AwarenessEntry>,
    last_sent_ms: Option<u64>,
    cursor_pending: bool,
}

impl AwarenessTracker {
    pub fn new(client_id: u64, user: UserInfo) -> Self {
        Self {
            local: AwarenessEntry {
                client_id,
                user,
                cursor: None,
                selection: None,
                last_seen_ms: 0,
            },
            peers: HashMap::new(),
            last_sent_ms: None,
            cursor_pending: false,
        }
    }

    pub fn local(&self) -> &AwarenessEntry {
        &self.local
    }

    /// Currently-present peers, stale entries excluded. Absence of a given
    /// client means "not currently present", nothing more.
    pub fn peers(&self, now_ms: u64) -> Vec<&AwarenessEntry> {
        self.peers
            .values()
            .filter(|entry| !is_stale(entry, now_ms))
            .collect()
    }

    pub fn peer(&self, client_id: u64, now_ms: u64) -> Option<&AwarenessEntry> {
        self.peers
            .get(&client_id)
            .filter(|entry| !is_stale(entry, now_ms))
    }

    /// Move the local cursor. Returns a payload to broadcast, or `None`
    /// while inside the coalescing window (the position is kept and flushed
    /// by the next [`tick`](Self::tick)).
    pub fn set_cursor(&mut self, cursor: Option<CursorPosition>, now_ms: u64) -> Option<Vec<u8>> {
        self.local.cursor = cursor;
        let since_last = self.last_sent_ms.map(|sent| now_ms.saturating_sub(sent));
        if since_last.is_some_and(|elapsed| elapsed < CURSOR_COALESCE_MS) {
            self.cursor_pending = true;
            return None;
        }
        Some(self.broadcast(now_ms))
    }

    /// Change the local selection. Selection changes are rare; they always
    /// broadcast immediately.
    pub fn set_selection(&mut self, selection: Option<SelectedNode>, now_ms: u64) -> Vec<u8> {
        self.local.selection = selection;
        self.broadcast(now_ms)
    }

    /// Periodic driver: flushes a coalesced cursor move, refreshes the
    /// heartbeat when due and expires stale peers. Returns a payload to
    /// broadcast if anything needs sending.
    pub fn tick(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        self.prune(now_ms);

        let since_last = self.last_sent_ms.map(|sent| now_ms.saturating_sub(sent));
        let flush_cursor =
            self.cursor_pending && since_last.is_none_or(|e| e >= CURSOR_COALESCE_MS);
        let heartbeat_due = since_last.is_none_or(|e| e >= HEARTBEAT_INTERVAL_MS);

        if flush_cursor || heartbeat_due {
            Some(self.broadcast(now_ms))
        } else {
            None
        }
    }

    /// Drop peers whose heartbeat went quiet. Returns the expired ids.
    pub fn prune(&mut self, now_ms: u64) -> Vec<u64> {
        let expired: Vec<u64> = self
            .peers
            .values()
            .filter(|entry| is_stale(entry, now_ms))
            .map(|entry| entry.client_id)
            .collect();
        for id in &expired {
            self.peers.remove(id);
            log::debug!("presence entry {id} expired");
        }
        expired
    }

    /// Merge a payload received from the awareness channel. The local
    /// client's own echo is ignored.
    pub fn apply_remote(&mut self, payload: &[u8]) -> Result<()> {
        let message: AwarenessMessage = serde_json::from_slice(payload)
            .map_err(|e| CoflowError::Protocol(format!("malformed awareness payload: {e}")))?;
        match message {
            AwarenessMessage::Update(entry) => {
                if entry.client_id != self.local.client_id {
                    self.peers.insert(entry.client_id, entry);
                }
            }
            AwarenessMessage::Leave { client_id } => {
                self.peers.remove(&client_id);
            }
        }
        Ok(())
    }

    /// Payload announcing a clean departure, sent during teardown.
    pub fn leave_payload(&self) -> Vec<u8> {
        encode(&AwarenessMessage::Leave {
            client_id: self.local.client_id,
        })
    }

    /// Forget every peer. Called when the session switches documents.
    pub fn reset(&mut self) {
        self.peers.clear();
        self.last_sent_ms = None;
        self.cursor_pending = false;
    }

    fn broadcast(&mut self, now_ms: u64) -> Vec<u8> {
        self.local.last_seen_ms = now_ms;
        self.last_sent_ms = Some(now_ms);
        self.cursor_pending = false;
        encode(&AwarenessMessage::Update(self.local.clone()))
    }
}

fn is_stale(entry: &AwarenessEntry, now_ms: u64) -> bool {
    now_ms.saturating_sub(entry.last_seen_ms) > STALE_AFTER_MS
}

fn encode(message: &AwarenessMessage) -> Vec<u8> {
    // Presence payloads are plain data; serialization cannot fail.
    serde_json::to_vec(message).unwrap_or_default()
}
