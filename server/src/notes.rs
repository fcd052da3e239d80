//! Ephemeral note staging: content dropped off by one surface (a video
//! page, a course chapter) and picked up by the editor within 24 hours.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::{CurrentUser, MaybeUser, optional_auth, require_auth};
use crate::db;
use crate::error::ApiError;
use crate::model::PendingNoteView;

const SOURCE_TYPES: [&str; 3] = ["video", "course", "manual"];
const NOTE_TTL_HOURS: i64 = 24;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn routes() -> Router {
    Router::new()
        .route("/pending", post(create_pending).layer(from_fn(require_auth)))
        .route(
            "/pending/{document_id}",
            get(get_pending).layer(from_fn(optional_auth)),
        )
        .route(
            "/pending/{document_id}",
            delete(delete_pending).layer(from_fn(require_auth)),
        )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePendingRequest {
    content: Option<String>,
    title: Option<String>,
    source_type: Option<String>,
    source_id: Option<String>,
}

async fn create_pending(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<CreatePendingRequest>,
) -> Result<Response, ApiError> {
    let content = payload.content.unwrap_or_default();
    let title = payload.title.unwrap_or_default();
    let source_type = payload.source_type.unwrap_or_default();

    if content.is_empty() || title.is_empty() {
        return Err(ApiError::bad_request("content and title are required"));
    }
    if !SOURCE_TYPES.contains(&source_type.as_str()) {
        return Err(ApiError::bad_request("Invalid sourceType"));
    }

    let document_id = generate_document_id(&source_type);
    let expires_at = Utc::now() + chrono::Duration::hours(NOTE_TTL_HOURS);

    let note = db::NewPendingNote {
        id: Uuid::new_v4(),
        document_id: document_id.clone(),
        content,
        title,
        source_type,
        source_id: payload.source_id,
        user_id: Some(user.id),
        expires_at,
    };
    db::insert_pending_note(&note)?;
    tracing::debug!("staged note {} for user {}", document_id, user.id);

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "documentId": document_id,
            "url": format!("/notes/{}", document_id),
            "expiresAt": expires_at,
        })),
    )
        .into_response())
}

async fn get_pending(
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(document_id): Path<String>,
) -> Result<Json<PendingNoteView>, ApiError> {
    let Some(note) = db::get_pending_note(&document_id, user.map(|u| u.id))? else {
        return Err(ApiError::not_found("Note not found or expired"));
    };

    Ok(Json(PendingNoteView::from(note)))
}

async fn delete_pending(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = db::delete_pending_note(&document_id, user.id)?;
    if deleted == 0 {
        return Err(ApiError::not_found("Note not found or expired"));
    }

    Ok(Json(serde_json::json!({ "message": "Note deleted" })))
}

/// Periodically reclaim expired rows. Reads already filter on `expires_at`,
/// so a sweep can lag without anyone seeing a stale note.
pub async fn run_expiry_sweeper() {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        match db::delete_expired_notes() {
            Ok(0) => {}
            Ok(count) => tracing::info!("swept {} expired pending notes", count),
            Err(e) => tracing::error!("pending note sweep failed: {}", e),
        }
    }
}

/// `{sourceType}-note-{millis in base36}-{8 random hex chars}`.
fn generate_document_id(source_type: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}-note-{}-{}", source_type, to_base36(millis), suffix)
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize] as char);
        n /= 36;
    }
    out.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_encodes() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(36 * 36 + 1), "101");
    }

    #[test]
    fn document_id_shape() {
        let id = generate_document_id("video");
        let parts: Vec<&str> = id.split('-').collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "video");
        assert_eq!(parts[1], "note");
        assert!(!parts[2].is_empty());
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn document_ids_are_unique() {
        let a = generate_document_id("manual");
        let b = generate_document_id("manual");
        assert_ne!(a, b);
    }

    #[test]
    fn source_types_are_closed() {
        assert!(SOURCE_TYPES.contains(&"video"));
        assert!(SOURCE_TYPES.contains(&"course"));
        assert!(SOURCE_TYPES.contains(&"manual"));
        assert!(!SOURCE_TYPES.contains(&"podcast"));
    }
}
