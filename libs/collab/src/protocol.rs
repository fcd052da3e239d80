//! Binary wire protocol for the collaboration endpoint.
//!
//! Every frame is a bincode-encoded [`SyncMessage`]. Documents are keyed by
//! name (the same name the REST document resource uses), so a frame carries
//! the document name rather than a numeric room id.
//!
//! A session starts with an `Open` frame whose payload holds the display
//! name and an optional JWT; the server answers with a `Sync` frame that
//! contains the full document state as a yrs v1 update. After that, peers
//! exchange `Update` and `Awareness` frames until they disconnect.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Session start: payload is a bincode [`OpenPayload`]
    Open,
    /// Full state or diff from the server: payload is a yrs v1 update
    Sync,
    /// Client asks for a diff: payload is a yrs v1 state vector
    SyncRequest,
    /// Incremental edit: payload is a yrs v1 update
    Update,
    /// Cursor/selection presence, relayed verbatim
    Awareness,
    /// Another peer entered the document: payload is a bincode [`PeerInfo`]
    PeerJoined,
    /// A peer left the document
    PeerLeft,
    Ping,
    Pong,
}

/// Handshake payload carried by an `Open` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPayload {
    pub display_name: String,
    /// JWT from the REST login. Missing or invalid tokens degrade the
    /// session to anonymous access instead of rejecting it.
    pub token: Option<String>,
}

/// Peer identity shared with the rest of the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    pub peer_id: Uuid,
    pub doc: String,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn open(peer_id: Uuid, doc: impl Into<String>, open: &OpenPayload) -> Self {
        let payload = bincode::serde::encode_to_vec(open, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageKind::Open,
            peer_id,
            doc: doc.into(),
            payload,
        }
    }

    pub fn sync(doc: impl Into<String>, state: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Sync,
            peer_id: Uuid::nil(),
            doc: doc.into(),
            payload: state,
        }
    }

    pub fn sync_request(peer_id: Uuid, doc: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncRequest,
            peer_id,
            doc: doc.into(),
            payload: state_vector,
        }
    }

    pub fn update(peer_id: Uuid, doc: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            peer_id,
            doc: doc.into(),
            payload: update,
        }
    }

    pub fn awareness(peer_id: Uuid, doc: impl Into<String>, state: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Awareness,
            peer_id,
            doc: doc.into(),
            payload: state,
        }
    }

    pub fn peer_joined(doc: impl Into<String>, info: &PeerInfo) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageKind::PeerJoined,
            peer_id: info.peer_id,
            doc: doc.into(),
            payload,
        }
    }

    pub fn peer_left(peer_id: Uuid, doc: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::PeerLeft,
            peer_id,
            doc: doc.into(),
            payload: Vec::new(),
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Ping,
            peer_id,
            doc: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Pong,
            peer_id,
            doc: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the handshake payload of an `Open` frame.
    pub fn open_payload(&self) -> Result<OpenPayload, ProtocolError> {
        if self.kind != MessageKind::Open {
            return Err(ProtocolError::WrongKind);
        }
        let (open, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(open)
    }

    /// Parse the peer payload of a `PeerJoined` frame.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.kind != MessageKind::PeerJoined {
            return Err(ProtocolError::WrongKind);
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(info)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("payload accessor called on the wrong frame kind")]
    WrongKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::update(peer, "physics-notes", vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc, "physics-notes");
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn open_roundtrip_with_token() {
        let peer = Uuid::new_v4();
        let open = OpenPayload {
            display_name: "Ada".to_string(),
            token: Some("header.payload.sig".to_string()),
        };
        let msg = SyncMessage::open(peer, "shared-doc", &open);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        let parsed = decoded.open_payload().unwrap();
        assert_eq!(parsed.display_name, "Ada");
        assert_eq!(parsed.token.as_deref(), Some("header.payload.sig"));
    }

    #[test]
    fn open_roundtrip_anonymous() {
        let open = OpenPayload {
            display_name: "Anonymous".to_string(),
            token: None,
        };
        let msg = SyncMessage::open(Uuid::new_v4(), "doc", &open);
        let parsed = SyncMessage::decode(&msg.encode().unwrap())
            .unwrap()
            .open_payload()
            .unwrap();
        assert!(parsed.token.is_none());
    }

    #[test]
    fn peer_joined_roundtrip() {
        let info = PeerInfo::new("Grace");
        let msg = SyncMessage::peer_joined("doc", &info);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::PeerJoined);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn payload_accessor_rejects_wrong_kind() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(msg.open_payload().is_err());
        assert!(msg.peer_info().is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(SyncMessage::decode(&[0xFF, 0x01, 0x02]).is_err());
    }

    #[test]
    fn sync_carries_server_nil_peer() {
        let msg = SyncMessage::sync("doc", vec![9, 9]);
        assert_eq!(msg.peer_id, Uuid::nil());
    }
}
