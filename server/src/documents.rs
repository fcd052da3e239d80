//! Read-side REST access to collaborative documents. Writes happen only
//! through the sync engine's debounced persistence.

use axum::{
    Json, Router,
    extract::{Extension, Path},
    middleware::from_fn,
    routing::{delete, get},
};

use crate::auth::{CurrentUser, require_auth};
use crate::db;
use crate::error::ApiError;
use crate::model::{DocumentDetail, DocumentSummary};

pub fn routes() -> Router {
    Router::new()
        .route("/", get(list_documents).layer(from_fn(require_auth)))
        .route("/{name}", get(get_document).layer(from_fn(require_auth)))
        .route("/{name}", delete(delete_document).layer(from_fn(require_auth)))
}

async fn list_documents(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<DocumentSummary>>, ApiError> {
    let docs = db::list_documents_for_owner(user.id)?
        .into_iter()
        .map(|(name, created_at, updated_at)| DocumentSummary {
            name,
            created_at,
            updated_at,
        })
        .collect();

    Ok(Json(docs))
}

async fn get_document(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(name): Path<String>,
) -> Result<Json<DocumentDetail>, ApiError> {
    let Some(doc) = db::get_document(&name, user.id)? else {
        return Err(ApiError::not_found("Document not found"));
    };

    Ok(Json(DocumentDetail::from(doc)))
}

async fn delete_document(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = db::delete_document(&name, user.id)?;
    if deleted == 0 {
        return Err(ApiError::not_found("Document not found"));
    }

    tracing::info!("user {} deleted document {}", user.id, name);
    Ok(Json(serde_json::json!({ "message": "Document deleted" })))
}
