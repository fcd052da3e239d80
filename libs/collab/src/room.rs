//! One room per open document: the authoritative yrs doc, the connected
//! peer set, and a tokio broadcast channel for fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;
use yrs::ReadTxn;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

use crate::protocol::PeerInfo;

/// Dirty-tracking for the debounced save.
#[derive(Default)]
struct RoomState {
    /// When the oldest unsaved change happened
    first_dirty: Option<Instant>,
    /// When the most recent change happened
    last_change: Option<Instant>,
    /// Last authenticated user who touched the document
    owner: Option<Uuid>,
}

pub struct Room {
    name: String,
    doc: yrs::Doc,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    state: Mutex<RoomState>,
}

impl Room {
    pub(crate) fn new(name: impl Into<String>, channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            name: name.into(),
            doc: yrs::Doc::new(),
            sender,
            peers: RwLock::new(HashMap::new()),
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Fan out an already-encoded frame to every subscribed peer.
    ///
    /// Receivers get the sender's own frames too; connection handlers drop
    /// frames whose peer id matches their own.
    pub fn broadcast_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }

    /// Apply a yrs v1 update to the authoritative doc.
    pub(crate) fn apply_update(&self, update: &[u8]) -> Result<(), String> {
        let parsed = yrs::Update::decode_v1(update).map_err(|e| e.to_string())?;
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        txn.apply_update(parsed).map_err(|e| e.to_string())
    }

    /// Apply a persisted state blob loaded on open.
    pub(crate) fn apply_snapshot(&self, snapshot: &[u8]) -> Result<(), String> {
        self.apply_update(snapshot)
    }

    /// Full document state as a yrs v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Diff against a remote state vector, for SyncRequest replies.
    pub(crate) fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, String> {
        let remote = yrs::StateVector::decode_v1(state_vector).map_err(|e| e.to_string())?;
        let txn = yrs::Transact::transact(&self.doc);
        Ok(txn.encode_diff_v1(&remote))
    }

    pub(crate) fn mark_dirty(&self, user: Option<Uuid>) {
        let mut state = self.state.lock().expect("room state lock poisoned");
        let now = Instant::now();
        state.first_dirty.get_or_insert(now);
        state.last_change = Some(now);
        if user.is_some() {
            state.owner = user;
        }
    }

    pub(crate) fn owner(&self) -> Option<Uuid> {
        self.state.lock().expect("room state lock poisoned").owner
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state
            .lock()
            .expect("room state lock poisoned")
            .first_dirty
            .is_some()
    }

    /// Clear the dirty window if the debounce says it is time to save.
    ///
    /// A save is due after `debounce` of quiet, or once the oldest unsaved
    /// change is older than `max_debounce` regardless of ongoing typing.
    pub(crate) fn take_dirty_if_due(&self, debounce: Duration, max_debounce: Duration) -> bool {
        let mut state = self.state.lock().expect("room state lock poisoned");
        let (Some(first), Some(last)) = (state.first_dirty, state.last_change) else {
            return false;
        };
        let now = Instant::now();
        if now.duration_since(last) >= debounce || now.duration_since(first) >= max_debounce {
            state.first_dirty = None;
            state.last_change = None;
            true
        } else {
            false
        }
    }

    /// Clear the dirty window unconditionally (close-time flush).
    pub(crate) fn take_dirty(&self) -> bool {
        let mut state = self.state.lock().expect("room state lock poisoned");
        let was_dirty = state.first_dirty.is_some();
        state.first_dirty = None;
        state.last_change = None;
        was_dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn text_update(content: &str) -> Vec<u8> {
        let doc = yrs::Doc::new();
        {
            let mut txn = yrs::Transact::transact_mut(&doc);
            let text = txn.get_or_insert_text("body");
            text.insert(&mut txn, 0, content);
        }
        let txn = yrs::Transact::transact(&doc);
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    #[tokio::test]
    async fn peers_join_and_leave() {
        let room = Room::new("doc", 16);
        let ada = PeerInfo::new("Ada");
        let id = ada.peer_id;

        let _rx = room.add_peer(ada).await;
        assert_eq!(room.peer_count().await, 1);

        room.remove_peer(&id).await;
        assert_eq!(room.peer_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let room = Room::new("doc", 16);
        let mut rx1 = room.add_peer(PeerInfo::new("Ada")).await;
        let mut rx2 = room.add_peer(PeerInfo::new("Grace")).await;

        let delivered = room.broadcast_raw(Arc::new(vec![7, 7, 7]));
        assert_eq!(delivered, 2);
        assert_eq!(*rx1.recv().await.unwrap(), vec![7, 7, 7]);
        assert_eq!(*rx2.recv().await.unwrap(), vec![7, 7, 7]);
    }

    #[test]
    fn updates_merge_into_state() {
        let room = Room::new("doc", 16);
        room.apply_update(&text_update("hello")).unwrap();

        let txn = yrs::Transact::transact(&room.doc);
        let text = txn.get_text("body").unwrap();
        assert_eq!(text.get_string(&txn), "hello");
    }

    #[test]
    fn malformed_update_is_rejected() {
        let room = Room::new("doc", 16);
        assert!(room.apply_update(&[0xDE, 0xAD]).is_err());
    }

    #[test]
    fn diff_answers_remote_state_vector() {
        let room = Room::new("doc", 16);
        room.apply_update(&text_update("shared text")).unwrap();

        let empty_sv = yrs::StateVector::default().encode_v1();
        let diff = room.encode_diff(&empty_sv).unwrap();

        // Applying the diff to a fresh doc reproduces the content.
        let other = Room::new("doc", 16);
        other.apply_update(&diff).unwrap();
        let txn = yrs::Transact::transact(&other.doc);
        assert_eq!(txn.get_text("body").unwrap().get_string(&txn), "shared text");
    }

    #[test]
    fn dirty_window_honors_quiet_period() {
        let room = Room::new("doc", 16);
        assert!(!room.is_dirty());

        room.mark_dirty(None);
        assert!(room.is_dirty());
        // Fresh change: neither the quiet period nor the cap has elapsed.
        assert!(!room.take_dirty_if_due(Duration::from_secs(5), Duration::from_secs(30)));
        assert!(room.is_dirty());

        // Zero debounce: due immediately, and the window resets.
        assert!(room.take_dirty_if_due(Duration::ZERO, Duration::from_secs(30)));
        assert!(!room.is_dirty());
    }

    #[test]
    fn dirty_cap_fires_while_typing_continues() {
        let room = Room::new("doc", 16);
        room.mark_dirty(None);
        room.mark_dirty(None);
        // Large quiet requirement, but a zero cap forces the save.
        assert!(room.take_dirty_if_due(Duration::from_secs(3600), Duration::ZERO));
    }

    #[test]
    fn owner_tracks_last_authenticated_editor() {
        let room = Room::new("doc", 16);
        let user = Uuid::new_v4();

        room.mark_dirty(None);
        assert_eq!(room.owner(), None);

        room.mark_dirty(Some(user));
        room.mark_dirty(None);
        assert_eq!(room.owner(), Some(user));
    }
}
