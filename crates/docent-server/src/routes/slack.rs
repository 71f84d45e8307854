use axum::{extract::State, routing::post, Json, Router};
use docent_schema::ReactionEvent;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

/// Outer envelope of the Slack Events API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackEnvelope {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: Value,
    },
    #[serde(other)]
    Other,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/events", post(events))
}

async fn events(State(state): State<AppState>, Json(envelope): Json<SlackEnvelope>) -> Json<Value> {
    match envelope {
        SlackEnvelope::UrlVerification { challenge } => Json(json!({ "challenge": challenge })),
        SlackEnvelope::EventCallback { event } => {
            let reaction = match serde_json::from_value::<ReactionEvent>(event) {
                Ok(reaction) => reaction,
                Err(e) => {
                    tracing::debug!("ignoring non-reaction event: {e}");
                    return Json(json!({ "ok": true, "stored": false }));
                }
            };
            let stored = state.feedback.handle_reaction(&reaction).await;
            if let Some(record) = stored.as_ref().map(|s| &s.record) {
                if let Some(skill) = record.skill_used.as_deref().filter(|s| !s.is_empty()) {
                    state
                        .confidence
                        .record_feedback(&record.user_id, skill, record.feedback_type);
                }
            }
            Json(json!({
                "ok": true,
                "stored": stored.as_ref().is_some_and(|s| s.persisted),
                "feedback_type": stored.map(|s| s.record.feedback_type),
            }))
        }
        SlackEnvelope::Other => Json(json!({ "ok": true, "stored": false })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use docent_schema::FeedbackContentUpdate;
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .nest("/api/slack", super::router())
            .with_state(state)
    }

    fn post_json(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/slack/events")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("build request")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn reaction_callback(kind: &str, emoji: &str) -> Value {
        json!({
            "type": "event_callback",
            "event": {
                "type": kind,
                "user": "U1",
                "reaction": emoji,
                "item": {"type": "message", "channel": "C1", "ts": "1700000000.000200"},
                "event_ts": "1700000001.000000"
            }
        })
    }

    #[tokio::test]
    async fn url_verification_echoes_challenge() {
        let response = app(AppState::for_tests())
            .oneshot(post_json(json!({"type": "url_verification", "challenge": "abc123", "token": "t"})))
            .await
            .expect("send request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["challenge"], "abc123");
    }

    #[tokio::test]
    async fn reaction_added_is_stored() {
        let state = AppState::for_tests();
        let response = app(state.clone())
            .oneshot(post_json(reaction_callback("reaction_added", "thumbsdown")))
            .await
            .expect("send request");
        let body = body_json(response).await;
        assert_eq!(body["stored"], true);
        assert_eq!(body["feedback_type"], "negative");

        let row = state
            .feedback
            .store()
            .find("1700000000.000200", "U1", "thumbsdown")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(row.channel_id, "C1");
    }

    #[tokio::test]
    async fn reaction_on_answered_message_moves_confidence() {
        let state = AppState::for_tests();
        state
            .feedback
            .update_feedback_content(FeedbackContentUpdate {
                message_id: "1700000000.000200".into(),
                channel_id: "C1".into(),
                skill_used: Some("deploys".into()),
                ..Default::default()
            })
            .await;

        app(state.clone())
            .oneshot(post_json(reaction_callback("reaction_added", "thumbsup")))
            .await
            .expect("send request");
        assert!((state.confidence.get("U1", "deploys") - 0.55).abs() < 1e-6);
        assert_eq!(state.confidence.get("U2", "deploys"), 0.5);
    }

    #[tokio::test]
    async fn reaction_without_skill_leaves_confidence() {
        let state = AppState::for_tests();
        app(state.clone())
            .oneshot(post_json(reaction_callback("reaction_added", "thumbsup")))
            .await
            .expect("send request");
        assert_eq!(state.confidence.get("U1", "unknown"), 0.5);
    }

    #[tokio::test]
    async fn unrelated_events_are_acknowledged() {
        let state = AppState::for_tests();
        let message_event = json!({
            "type": "event_callback",
            "event": {"type": "message", "text": "hi", "channel": "C1"}
        });
        let response = app(state.clone())
            .oneshot(post_json(message_event))
            .await
            .expect("send request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["stored"], false);

        let response = app(state.clone())
            .oneshot(post_json(reaction_callback("reaction_added", "tada")))
            .await
            .expect("send request");
        assert_eq!(body_json(response).await["stored"], false);

        let response = app(state.clone())
            .oneshot(post_json(json!({"type": "app_rate_limited"})))
            .await
            .expect("send request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.feedback.store().count().await.expect("count"), 0);
    }
}
