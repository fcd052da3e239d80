//! API-facing response shapes. Database rows are converted here so internal
//! fields (password hashes, raw state blobs) never reach a serializer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db;

/// The sanitized user object returned by every auth endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<db::User> for PublicUser {
    fn from(user: db::User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.display_name,
            avatar: user.avatar_url,
            created_at: user.created_at,
        }
    }
}

/// Document listing entry; the CRDT blob itself stays server-side.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDetail {
    pub name: String,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<db::Document> for DocumentDetail {
    fn from(doc: db::Document) -> Self {
        Self {
            name: doc.name,
            size_bytes: doc.state.len(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingNoteView {
    pub document_id: String,
    pub content: String,
    pub title: String,
    pub source_type: String,
}

impl From<db::PendingNote> for PendingNoteView {
    fn from(note: db::PendingNote) -> Self {
        Self {
            document_id: note.document_id,
            content: note.content,
            title: note.title,
            source_type: note.source_type,
        }
    }
}
