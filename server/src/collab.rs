//! WebSocket endpoint for collaborative editing, bridging sockets to the
//! sync engine, plus the diesel-backed document store the engine persists
//! through.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::Extension,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
};
use lumina_collab::{
    CollabEngine, DocumentStore, MessageKind, PeerInfo, StoreError, SyncMessage,
};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::auth;
use crate::db;

/// Document persistence on the `documents` table.
pub struct PostgresDocumentStore;

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        db::fetch_document_state(name).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn store(&self, name: &str, state: &[u8], owner: Option<Uuid>) -> Result<(), StoreError> {
        db::upsert_document_state(name, state, owner)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(engine): Extension<Arc<CollabEngine>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

async fn handle_socket(mut socket: WebSocket, engine: Arc<CollabEngine>) {
    // The handshake frame names the document, the display name, and an
    // optional token. A bad or missing token degrades the session to
    // anonymous editing rather than rejecting it.
    let Some(open_frame) = next_frame(&mut socket).await else {
        return;
    };
    if open_frame.kind != MessageKind::Open {
        tracing::debug!("connection opened with a {:?} frame, dropping", open_frame.kind);
        return;
    }
    let Ok(open) = open_frame.open_payload() else {
        tracing::debug!("undecodable open payload, dropping connection");
        return;
    };

    let doc = open_frame.doc.clone();
    let peer_id = open_frame.peer_id;
    let user = open.token.as_deref().and_then(auth::verify_token);
    if open.token.is_some() && user.is_none() {
        tracing::debug!("collab token rejected, continuing anonymously");
    }

    let peer = PeerInfo::with_id(peer_id, open.display_name);
    let mut session = match engine.open(&doc, peer).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("failed to open document {}: {}", doc, e);
            return;
        }
    };

    if send_frame(&mut socket, &SyncMessage::sync(&doc, session.initial_state.clone())).await.is_err() {
        engine.leave(&doc, peer_id).await;
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    Message::Binary(data) => {
                        let Ok(frame) = SyncMessage::decode(&data) else {
                            tracing::debug!("undecodable frame from peer {}", peer_id);
                            continue;
                        };
                        // A session is bound to the document it opened.
                        if matches!(frame.kind, MessageKind::Update | MessageKind::Awareness)
                            && frame.doc != doc
                        {
                            tracing::warn!(
                                "peer {} sent a frame for {} on a {} session, dropping",
                                peer_id, frame.doc, doc
                            );
                            continue;
                        }
                        match frame.kind {
                            MessageKind::Update => {
                                let raw = Arc::new(data.to_vec());
                                if let Err(e) = engine.apply_update(&session.room, &frame, raw, user).await {
                                    tracing::warn!("update from peer {} rejected: {}", peer_id, e);
                                }
                            }
                            MessageKind::Awareness => {
                                engine.relay(&session.room, Arc::new(data.to_vec())).await;
                            }
                            MessageKind::SyncRequest => {
                                match engine.diff(&session.room, &frame.payload) {
                                    Ok(diff) => {
                                        if send_frame(&mut socket, &SyncMessage::sync(&doc, diff)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => tracing::warn!("bad state vector from peer {}: {}", peer_id, e),
                                }
                            }
                            MessageKind::Ping => {
                                if send_frame(&mut socket, &SyncMessage::pong(peer_id)).await.is_err() {
                                    break;
                                }
                            }
                            other => {
                                tracing::debug!("ignoring {:?} frame from peer {}", other, peer_id);
                            }
                        }
                    }
                    Message::Close(_) => break,
                    // axum answers protocol-level pings itself
                    _ => {}
                }
            }
            fanned_out = session.receiver.recv() => {
                match fanned_out {
                    Ok(raw) => {
                        // Every subscriber gets every frame; drop our own.
                        match SyncMessage::decode(&raw) {
                            Ok(frame) if frame.peer_id == peer_id => {}
                            Ok(_) => {
                                if socket.send(Message::Binary(raw.as_ref().clone().into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("undecodable frame on room channel: {}", e),
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Too slow for incremental updates; resend full state.
                        tracing::warn!("peer {} lagged {} frames, resyncing", peer_id, missed);
                        let state = session.room.encode_state();
                        if send_frame(&mut socket, &SyncMessage::sync(&doc, state)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    engine.leave(&doc, peer_id).await;
    tracing::debug!("peer {} disconnected from {}", peer_id, doc);
}

/// Read frames until a decodable one arrives or the socket ends.
async fn next_frame(socket: &mut WebSocket) -> Option<SyncMessage> {
    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Binary(data) = message {
            match SyncMessage::decode(&data) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::debug!("dropping undecodable frame during handshake: {}", e);
                    return None;
                }
            }
        }
    }
    None
}

async fn send_frame(socket: &mut WebSocket, frame: &SyncMessage) -> Result<(), axum::Error> {
    match frame.encode() {
        Ok(bytes) => socket.send(Message::Binary(bytes.into())).await,
        Err(e) => {
            tracing::error!("failed to encode outbound frame: {}", e);
            Ok(())
        }
    }
}
