use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{auth::admin_auth, state::AppState};

pub mod admin;
pub mod webhook;

/// Public webhook intake plus the token-protected admin API.
pub fn router(state: AppState) -> Router {
    let admin_router = Router::new()
        .route("/health", get(admin::health_handler))
        .route("/stats", get(admin::stats_handler))
        .route(
            "/dlq",
            get(admin::list_dead_letters_handler).delete(admin::clear_dead_letters_handler),
        )
        .route("/dlq/retry-all", post(admin::retry_all_handler))
        .route("/dlq/:id", get(admin::get_dead_letter_handler))
        .route("/dlq/:id/replay", post(admin::replay_dead_letter_handler))
        .route("/retries", get(admin::list_retries_handler))
        .route("/retries/process", post(admin::process_retries_handler))
        .route("/logs", get(admin::list_logs_handler))
        .route(
            "/logs/correlation/:id",
            get(admin::correlation_logs_handler),
        )
        .route("/circuit/reset", post(admin::reset_circuit_handler))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    Router::new()
        .route("/webhooks/identity", post(webhook::identity_webhook_handler))
        .nest("/admin", admin_router)
        .with_state(state)
}
