mod schema;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::config;

pub use schema::{analytics_events, documents, pending_notes, users};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to the database: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub name: String,
    pub state: Vec<u8>,
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = pending_notes)]
pub struct PendingNote {
    pub id: Uuid,
    pub document_id: String,
    pub content: String,
    pub title: String,
    pub source_type: String,
    pub source_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = pending_notes)]
pub struct NewPendingNote {
    pub id: Uuid,
    pub document_id: String,
    pub content: String,
    pub title: String,
    pub source_type: String,
    pub source_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = analytics_events)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = analytics_events)]
pub struct NewAnalyticsEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub metadata: serde_json::Value,
}

pub fn create_user(new_user: &NewUser) -> Result<User, DbError> {
    let mut conn = get_connection()?;

    let user = diesel::insert_into(users::table)
        .values(new_user)
        .returning(User::as_returning())
        .get_result(&mut conn)?;

    Ok(user)
}

pub fn get_user_by_email(user_email: &str) -> Result<Option<User>, DbError> {
    let mut conn = get_connection()?;

    let user = users::table
        .filter(users::email.eq(user_email))
        .first::<User>(&mut conn)
        .optional()?;

    Ok(user)
}

pub fn get_user_by_id(user_id: Uuid) -> Result<Option<User>, DbError> {
    let mut conn = get_connection()?;

    let user = users::table
        .filter(users::id.eq(user_id))
        .first::<User>(&mut conn)
        .optional()?;

    Ok(user)
}

pub fn get_user_by_google_id(gid: &str) -> Result<Option<User>, DbError> {
    let mut conn = get_connection()?;

    let user = users::table
        .filter(users::google_id.eq(gid))
        .first::<User>(&mut conn)
        .optional()?;

    Ok(user)
}

/// Attach a Google identity (and avatar, when the account had none) to an
/// existing user found by email.
pub fn link_google_account(
    user_id: Uuid,
    gid: &str,
    avatar: Option<&str>,
) -> Result<User, DbError> {
    let mut conn = get_connection()?;

    let user = diesel::update(users::table.filter(users::id.eq(user_id)))
        .set((
            users::google_id.eq(gid),
            users::updated_at.eq(Utc::now()),
        ))
        .returning(User::as_returning())
        .get_result::<User>(&mut conn)?;

    if user.avatar_url.is_none() {
        if let Some(url) = avatar {
            let user = diesel::update(users::table.filter(users::id.eq(user_id)))
                .set(users::avatar_url.eq(url))
                .returning(User::as_returning())
                .get_result::<User>(&mut conn)?;
            return Ok(user);
        }
    }

    Ok(user)
}

/// Name plus timestamps for the caller's documents, newest first.
pub fn list_documents_for_owner(
    owner: Uuid,
) -> Result<Vec<(String, DateTime<Utc>, DateTime<Utc>)>, DbError> {
    let mut conn = get_connection()?;

    let docs = documents::table
        .filter(documents::owner_id.eq(owner))
        .select((documents::name, documents::created_at, documents::updated_at))
        .order(documents::updated_at.desc())
        .limit(100)
        .load(&mut conn)?;

    Ok(docs)
}

pub fn get_document(doc_name: &str, owner: Uuid) -> Result<Option<Document>, DbError> {
    let mut conn = get_connection()?;

    let doc = documents::table
        .filter(documents::name.eq(doc_name))
        .filter(documents::owner_id.eq(owner))
        .first::<Document>(&mut conn)
        .optional()?;

    Ok(doc)
}

pub fn delete_document(doc_name: &str, owner: Uuid) -> Result<usize, DbError> {
    let mut conn = get_connection()?;

    let deleted = diesel::delete(
        documents::table
            .filter(documents::name.eq(doc_name))
            .filter(documents::owner_id.eq(owner)),
    )
    .execute(&mut conn)?;

    Ok(deleted)
}

pub fn fetch_document_state(doc_name: &str) -> Result<Option<Vec<u8>>, DbError> {
    let mut conn = get_connection()?;

    let state = documents::table
        .filter(documents::name.eq(doc_name))
        .select(documents::state)
        .first::<Vec<u8>>(&mut conn)
        .optional()?;

    Ok(state)
}

/// Full-state upsert keyed by document name. An anonymous save never clears
/// a previously recorded owner.
pub fn upsert_document_state(
    doc_name: &str,
    state_blob: &[u8],
    owner: Option<Uuid>,
) -> Result<(), DbError> {
    let mut conn = get_connection()?;
    let now = Utc::now();

    match owner {
        Some(uid) => {
            diesel::insert_into(documents::table)
                .values((
                    documents::id.eq(Uuid::new_v4()),
                    documents::name.eq(doc_name),
                    documents::state.eq(state_blob),
                    documents::owner_id.eq(uid),
                ))
                .on_conflict(documents::name)
                .do_update()
                .set((
                    documents::state.eq(state_blob),
                    documents::owner_id.eq(uid),
                    documents::updated_at.eq(now),
                ))
                .execute(&mut conn)?;
        }
        None => {
            diesel::insert_into(documents::table)
                .values((
                    documents::id.eq(Uuid::new_v4()),
                    documents::name.eq(doc_name),
                    documents::state.eq(state_blob),
                ))
                .on_conflict(documents::name)
                .do_update()
                .set((
                    documents::state.eq(state_blob),
                    documents::updated_at.eq(now),
                ))
                .execute(&mut conn)?;
        }
    }

    Ok(())
}

pub fn insert_pending_note(note: &NewPendingNote) -> Result<(), DbError> {
    let mut conn = get_connection()?;

    diesel::insert_into(pending_notes::table)
        .values(note)
        .execute(&mut conn)?;

    Ok(())
}

/// Fetch a staging note that has not expired. When a user id is given the
/// note must belong to that user.
pub fn get_pending_note(doc_id: &str, user: Option<Uuid>) -> Result<Option<PendingNote>, DbError> {
    let mut conn = get_connection()?;

    let mut query = pending_notes::table
        .filter(pending_notes::document_id.eq(doc_id))
        .filter(pending_notes::expires_at.gt(Utc::now()))
        .into_boxed();

    if let Some(uid) = user {
        query = query.filter(pending_notes::user_id.eq(uid));
    }

    let note = query.first::<PendingNote>(&mut conn).optional()?;
    Ok(note)
}

pub fn delete_pending_note(doc_id: &str, user: Uuid) -> Result<usize, DbError> {
    let mut conn = get_connection()?;

    let deleted = diesel::delete(
        pending_notes::table
            .filter(pending_notes::document_id.eq(doc_id))
            .filter(pending_notes::user_id.eq(user)),
    )
    .execute(&mut conn)?;

    Ok(deleted)
}

/// Physically remove expired staging notes. Queries already filter them out,
/// so this only reclaims space.
pub fn delete_expired_notes() -> Result<usize, DbError> {
    let mut conn = get_connection()?;

    let deleted =
        diesel::delete(pending_notes::table.filter(pending_notes::expires_at.le(Utc::now())))
            .execute(&mut conn)?;

    Ok(deleted)
}

pub fn insert_analytics_event(event: &NewAnalyticsEvent) -> Result<Uuid, DbError> {
    let mut conn = get_connection()?;

    diesel::insert_into(analytics_events::table)
        .values(event)
        .execute(&mut conn)?;

    Ok(event.id)
}

pub fn count_events_by_type(user: Uuid) -> Result<Vec<(String, i64)>, DbError> {
    use diesel::dsl::count_star;

    let mut conn = get_connection()?;

    let counts = analytics_events::table
        .filter(analytics_events::user_id.eq(user))
        .group_by(analytics_events::event_type)
        .select((analytics_events::event_type, count_star()))
        .load::<(String, i64)>(&mut conn)?;

    Ok(counts)
}

pub fn load_events_for_user(user: Uuid) -> Result<Vec<AnalyticsEvent>, DbError> {
    let mut conn = get_connection()?;

    let events = analytics_events::table
        .filter(analytics_events::user_id.eq(user))
        .order(analytics_events::created_at.asc())
        .load::<AnalyticsEvent>(&mut conn)?;

    Ok(events)
}

pub fn load_event_times_since(
    user: Uuid,
    since: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, DbError> {
    let mut conn = get_connection()?;

    let times = analytics_events::table
        .filter(analytics_events::user_id.eq(user))
        .filter(analytics_events::created_at.ge(since))
        .select(analytics_events::created_at)
        .load::<DateTime<Utc>>(&mut conn)?;

    Ok(times)
}

/// Cheap liveness probe for the health endpoint.
pub fn ping() -> bool {
    match get_connection() {
        Ok(mut conn) => diesel::sql_query("SELECT 1").execute(&mut conn).is_ok(),
        Err(_) => false,
    }
}

fn get_connection() -> Result<PgConnection, DbError> {
    let database_url = config::database_url();
    Ok(PgConnection::establish(&database_url)?)
}
