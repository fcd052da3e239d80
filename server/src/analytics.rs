//! Event tracking and the dashboard aggregates built from it.
//!
//! Events are append-only. The write path stamps each one with its origin
//! (`web` for authenticated browser traffic, `api` otherwise) and the client
//! IP. The read path loads the caller's events and aggregates in process;
//! per-type counts come straight from a grouped query.

use std::collections::{HashMap, HashSet};

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_client_ip::ClientIp;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::{CurrentUser, MaybeUser, optional_auth, require_auth};
use crate::db;
use crate::error::ApiError;

/// Closed set of trackable events; anything else is a 400.
const EVENT_TYPES: [&str; 14] = [
    "page_view",
    "study_session",
    "course_created",
    "course_started",
    "chapter_completed",
    "course_completed",
    "roadmap_created",
    "roadmap_node_completed",
    "video_created",
    "video_watched",
    "quiz_completed",
    "flashcard_session",
    "note_created",
    "slides_created",
];

pub fn routes() -> Router {
    Router::new()
        .route("/track", post(track).layer(from_fn(optional_auth)))
        .route("/stats", get(stats).layer(from_fn(require_auth)))
        .route("/heatmap", get(heatmap).layer(from_fn(require_auth)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackRequest {
    user_id: Option<Uuid>,
    event_type: Option<String>,
    metadata: Option<serde_json::Value>,
}

async fn track(
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    ClientIp(client_ip): ClientIp,
    Json(payload): Json<TrackRequest>,
) -> Result<Response, ApiError> {
    let authenticated = user.is_some();
    let Some(user_id) = user.map(|u| u.id).or(payload.user_id) else {
        return Err(ApiError::bad_request("userId is required"));
    };

    let Some(event_type) = payload.event_type else {
        return Err(ApiError::bad_request("eventType is required"));
    };
    if !EVENT_TYPES.contains(&event_type.as_str()) {
        return Err(ApiError::bad_request("Invalid event type"));
    }

    let mut metadata = match payload.metadata {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    metadata.insert(
        "source".to_string(),
        serde_json::Value::String(if authenticated { "web" } else { "api" }.to_string()),
    );
    metadata.insert(
        "clientIp".to_string(),
        serde_json::Value::String(client_ip.to_string()),
    );

    let event = db::NewAnalyticsEvent {
        id: Uuid::new_v4(),
        user_id,
        event_type,
        metadata: serde_json::Value::Object(metadata),
    };
    let event_id = db::insert_analytics_event(&event)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "eventId": event_id })),
    )
        .into_response())
}

async fn stats(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Result<Response, ApiError> {
    let counts: HashMap<String, i64> = db::count_events_by_type(user.id)?.into_iter().collect();
    let events = db::load_events_for_user(user.id)?;
    let now = Utc::now();

    let count = |event_type: &str| counts.get(event_type).copied().unwrap_or(0);

    Ok(Json(serde_json::json!({
        "coursesCompleted": count("course_completed"),
        "coursesCreated": count("course_created"),
        "chaptersCompleted": count("chapter_completed"),
        "roadmapsCreated": count("roadmap_created"),
        "nodesCompleted": count("roadmap_node_completed"),
        "videosCreated": count("video_created"),
        "videosWatched": count("video_watched"),
        "quizzesCompleted": count("quiz_completed"),
        "flashcardSessions": count("flashcard_session"),
        "totalStudyMinutes": total_study_minutes(&events),
        "streak": streak_days(&events, now),
        "weeklyActivity": weekly_activity(&events, now),
        "quizScores": quiz_scores(&events, now),
    }))
    .into_response())
}

async fn heatmap(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Response, ApiError> {
    let now = Utc::now();
    let times = db::load_event_times_since(user.id, now - Duration::days(365))?;

    Ok(Json(serde_json::json!({ "heatmapData": heatmap_counts(&times) })).into_response())
}

/// Sum of `metadata.duration` over study sessions, in minutes.
fn total_study_minutes(events: &[db::AnalyticsEvent]) -> i64 {
    events
        .iter()
        .filter(|e| e.event_type == "study_session")
        .filter_map(|e| e.metadata.get("duration"))
        .filter_map(|d| d.as_f64())
        .sum::<f64>()
        .round() as i64
}

/// Consecutive active days ending today, or yesterday when today has no
/// activity yet.
fn streak_days(events: &[db::AnalyticsEvent], now: DateTime<Utc>) -> u32 {
    let active: HashSet<NaiveDate> = events.iter().map(|e| e.created_at.date_naive()).collect();

    let today = now.date_naive();
    let mut day = if active.contains(&today) {
        today
    } else if active.contains(&(today - Duration::days(1))) {
        today - Duration::days(1)
    } else {
        return 0;
    };

    let mut streak = 0;
    while active.contains(&day) {
        streak += 1;
        day = day - Duration::days(1);
    }
    streak
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Event counts for the past seven days as `{day, count}` pairs, Sun..Sat.
fn weekly_activity(events: &[db::AnalyticsEvent], now: DateTime<Utc>) -> Vec<serde_json::Value> {
    let cutoff = now - Duration::days(7);
    let mut counts = [0i64; 7];
    for event in events {
        if event.created_at >= cutoff && event.created_at <= now {
            counts[event.created_at.weekday().num_days_from_sunday() as usize] += 1;
        }
    }

    DAY_NAMES
        .iter()
        .zip(counts)
        .map(|(day, count)| serde_json::json!({ "day": day, "count": count }))
        .collect()
}

/// Quiz results from the past 30 days, oldest first, at most 20. A quiz
/// event without a recorded score counts as 0. Expects events in ascending
/// time order, which is how they are loaded.
fn quiz_scores(events: &[db::AnalyticsEvent], now: DateTime<Utc>) -> Vec<serde_json::Value> {
    let cutoff = now - Duration::days(30);
    events
        .iter()
        .filter(|e| e.event_type == "quiz_completed" && e.created_at >= cutoff)
        .take(20)
        .map(|e| {
            let score = e.metadata.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
            serde_json::json!({
                "date": e.created_at.format("%Y-%m-%d").to_string(),
                "score": score,
            })
        })
        .collect()
}

/// Per-day event counts, keyed `YYYY-MM-DD`.
fn heatmap_counts(times: &[DateTime<Utc>]) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    for time in times {
        *counts
            .entry(time.format("%Y-%m-%d").to_string())
            .or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_at(event_type: &str, at: DateTime<Utc>, metadata: serde_json::Value) -> db::AnalyticsEvent {
        db::AnalyticsEvent {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            metadata,
            created_at: at,
        }
    }

    fn noon(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn study_minutes_sums_durations() {
        let now = noon(2026, 3, 10);
        let events = vec![
            event_at("study_session", now, serde_json::json!({ "duration": 25 })),
            event_at("study_session", now, serde_json::json!({ "duration": 35.5 })),
            event_at("study_session", now, serde_json::json!({})),
            event_at("page_view", now, serde_json::json!({ "duration": 999 })),
        ];
        assert_eq!(total_study_minutes(&events), 61);
    }

    #[test]
    fn streak_counts_consecutive_days_ending_today() {
        let now = noon(2026, 3, 10);
        let events = vec![
            event_at("page_view", noon(2026, 3, 10), serde_json::json!({})),
            event_at("page_view", noon(2026, 3, 9), serde_json::json!({})),
            event_at("page_view", noon(2026, 3, 8), serde_json::json!({})),
            // gap on the 7th
            event_at("page_view", noon(2026, 3, 6), serde_json::json!({})),
        ];
        assert_eq!(streak_days(&events, now), 3);
    }

    #[test]
    fn streak_survives_an_inactive_today() {
        let now = noon(2026, 3, 10);
        let events = vec![
            event_at("page_view", noon(2026, 3, 9), serde_json::json!({})),
            event_at("page_view", noon(2026, 3, 8), serde_json::json!({})),
        ];
        assert_eq!(streak_days(&events, now), 2);
    }

    #[test]
    fn streak_is_zero_after_two_quiet_days() {
        let now = noon(2026, 3, 10);
        let events = vec![event_at("page_view", noon(2026, 3, 7), serde_json::json!({}))];
        assert_eq!(streak_days(&events, now), 0);
    }

    #[test]
    fn weekly_activity_buckets_by_weekday() {
        // 2026-03-10 is a Tuesday.
        let now = noon(2026, 3, 10);
        let events = vec![
            event_at("page_view", noon(2026, 3, 10), serde_json::json!({})), // Tue
            event_at("page_view", noon(2026, 3, 10), serde_json::json!({})), // Tue
            event_at("page_view", noon(2026, 3, 8), serde_json::json!({})),  // Sun
            event_at("page_view", noon(2026, 3, 1), serde_json::json!({})),  // outside window
        ];
        let buckets = weekly_activity(&events, now);

        assert_eq!(buckets.len(), 7);
        assert_eq!(buckets[0], serde_json::json!({ "day": "Sun", "count": 1 }));
        assert_eq!(buckets[2], serde_json::json!({ "day": "Tue", "count": 2 }));
        assert_eq!(buckets[6], serde_json::json!({ "day": "Sat", "count": 0 }));
    }

    #[test]
    fn weekly_activity_carries_day_labels_in_order() {
        let buckets = weekly_activity(&[], noon(2026, 3, 10));
        let labels: Vec<&str> = buckets.iter().map(|b| b["day"].as_str().unwrap()).collect();
        assert_eq!(labels, ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"]);
        assert!(buckets.iter().all(|b| b["count"] == 0));
    }

    #[test]
    fn quiz_scores_window_and_cap() {
        let now = noon(2026, 3, 10);
        let mut events = vec![event_at(
            "quiz_completed",
            noon(2026, 1, 1), // outside the 30 day window
            serde_json::json!({ "score": 10 }),
        )];
        for day in 1..=25 {
            events.push(event_at(
                "quiz_completed",
                noon(2026, 3, day),
                serde_json::json!({ "score": day }),
            ));
        }

        let scores = quiz_scores(&events, now);
        assert_eq!(scores.len(), 20);
        // Oldest first; the cap keeps the first twenty in the window.
        assert_eq!(scores[0]["score"], 1.0);
        assert_eq!(scores[19]["score"], 20.0);
    }

    #[test]
    fn quiz_without_score_counts_as_zero() {
        let now = noon(2026, 3, 10);
        let events = vec![
            event_at("quiz_completed", noon(2026, 3, 8), serde_json::json!({})),
            event_at("quiz_completed", noon(2026, 3, 9), serde_json::json!({ "score": 80 })),
        ];
        let scores = quiz_scores(&events, now);
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0]["score"], 0.0);
        assert_eq!(scores[1]["score"], 80.0);
    }

    #[test]
    fn heatmap_counts_per_day() {
        let times = vec![noon(2026, 3, 9), noon(2026, 3, 9), noon(2026, 3, 10)];
        let counts = heatmap_counts(&times);
        assert_eq!(counts.get("2026-03-09"), Some(&2));
        assert_eq!(counts.get("2026-03-10"), Some(&1));
    }

    #[test]
    fn event_type_list_is_closed() {
        assert!(EVENT_TYPES.contains(&"quiz_completed"));
        assert!(!EVENT_TYPES.contains(&"made_up_event"));
        assert_eq!(EVENT_TYPES.len(), 14);
    }
}
