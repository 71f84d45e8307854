use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use docent_feedback::{ExportFormat, FeedbackStats, SkillFeedback};
use docent_schema::FeedbackContentUpdate;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub days: Option<u32>,
    pub format: Option<String>,
}

#[derive(Serialize)]
pub struct SkillFeedbackResponse {
    pub skill_feedback: Vec<SkillFeedback>,
}

#[derive(Serialize)]
pub struct ContentUpdateResponse {
    pub updated: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/by-skill", get(by_skill))
        .route("/export", get(export))
        .route("/content", post(update_content))
}

async fn stats(State(state): State<AppState>, Query(q): Query<DaysQuery>) -> Json<FeedbackStats> {
    let days = q.days.unwrap_or(state.default_days);
    Json(state.feedback.get_feedback_stats(days).await)
}

async fn by_skill(
    State(state): State<AppState>,
    Query(q): Query<DaysQuery>,
) -> Json<SkillFeedbackResponse> {
    let days = q.days.unwrap_or(state.default_days);
    Json(SkillFeedbackResponse {
        skill_feedback: state.feedback.get_feedback_by_skill(days).await,
    })
}

async fn export(
    State(state): State<AppState>,
    Query(q): Query<ExportQuery>,
) -> Result<Response, StatusCode> {
    let days = q.days.unwrap_or(state.default_days);
    let format = ExportFormat::parse(q.format.as_deref().unwrap_or("json"))
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let body = state
        .feedback
        .export_feedback_data(days, format.extension())
        .await
        .map_err(|e| {
            tracing::error!("feedback export failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let disposition = format!(
        "attachment; filename=\"feedback_data_{days}days.{}\"",
        format.extension()
    );
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn update_content(
    State(state): State<AppState>,
    Json(update): Json<FeedbackContentUpdate>,
) -> Json<ContentUpdateResponse> {
    Json(ContentUpdateResponse {
        updated: state.feedback.update_feedback_content(update).await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use docent_schema::{FeedbackRecord, FeedbackType};
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .nest("/api/feedback", super::router())
            .with_state(state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn seeded_state() -> AppState {
        let state = AppState::for_tests();
        let mut liked = FeedbackRecord::new("M1", "C1", "U1", FeedbackType::Positive, "thumbsup");
        liked.skill_used = Some("docs".into());
        state.feedback.store_feedback(liked).await;
        state
            .feedback
            .store_feedback(FeedbackRecord::new("M2", "C1", "U2", FeedbackType::Negative, "x"))
            .await;
        state
    }

    #[tokio::test]
    async fn stats_on_empty_store() {
        let response = app(AppState::for_tests())
            .oneshot(
                Request::builder()
                    .uri("/api/feedback/stats?days=7")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("send request");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total_feedback"], 0);
        assert_eq!(body["positive_percentage"], 0.0);
        assert_eq!(body["days"], 7);
    }

    #[tokio::test]
    async fn by_skill_wraps_list() {
        let response = app(seeded_state().await)
            .oneshot(
                Request::builder()
                    .uri("/api/feedback/by-skill")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("send request");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let skills = body["skill_feedback"].as_array().expect("array");
        assert_eq!(skills.len(), 2);
    }

    #[tokio::test]
    async fn csv_export_sets_download_headers() {
        let response = app(seeded_state().await)
            .oneshot(
                Request::builder()
                    .uri("/api/feedback/export?days=14&format=csv")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("send request");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"feedback_data_14days.csv\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn export_defaults_to_json() {
        let response = app(seeded_state().await)
            .oneshot(
                Request::builder()
                    .uri("/api/feedback/export")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("send request");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"feedback_data_30days.json\""
        );
        let body = body_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn unknown_export_format_is_bad_request() {
        let response = app(AppState::for_tests())
            .oneshot(
                Request::builder()
                    .uri("/api/feedback/export?format=xml")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("send request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn content_update_reports_result() {
        let state = AppState::for_tests();
        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/feedback/content")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"message_id":"M1","channel_id":"C1","question":"what?"}"#,
                    ))
                    .expect("build request"),
            )
            .await
            .expect("send request");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["updated"], true);
        assert!(state
            .feedback
            .store()
            .pending("M1")
            .await
            .expect("query")
            .is_some());
    }
}
