//! Real-time collaborative document sync.
//!
//! The engine relays CRDT updates between connected editors and persists
//! document state on a debounce: a quiet period of five seconds (or thirty
//! seconds of sustained typing) triggers a full-state upsert through the
//! [`DocumentStore`] seam. Merge and ordering semantics are delegated
//! entirely to yrs; nothing in this crate resolves conflicts itself.
//!
//! Transport is left to the caller: the engine hands out a broadcast
//! receiver per peer and accepts already-decoded wire frames, so it works
//! the same under an axum WebSocket upgrade or a bare TCP test harness.

mod engine;
mod protocol;
mod room;
mod store;

pub use engine::{CollabEngine, EngineConfig, EngineError, OpenSession};
pub use protocol::{MessageKind, OpenPayload, PeerInfo, ProtocolError, SyncMessage};
pub use room::Room;
pub use store::{DocumentStore, MemoryStore, StoreError};
