pub mod ask;
pub mod feedback;
pub mod health;
pub mod slack;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/ask", ask::router())
        .nest("/feedback", feedback::router())
        .nest("/health", health::router())
        .nest("/slack", slack::router())
}
