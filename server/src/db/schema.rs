diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Text,
        password_hash -> Nullable<Text>,
        google_id -> Nullable<Text>,
        display_name -> Text,
        avatar_url -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    documents (id) {
        id -> Uuid,
        name -> Text,
        state -> Bytea,
        owner_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    pending_notes (id) {
        id -> Uuid,
        document_id -> Text,
        content -> Text,
        title -> Text,
        source_type -> Text,
        source_id -> Nullable<Text>,
        user_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    analytics_events (id) {
        id -> Uuid,
        user_id -> Uuid,
        event_type -> Text,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}
