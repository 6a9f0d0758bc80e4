use axum::{
    Router,
    routing::{get, post},
};

pub mod commands;
pub mod streams;
pub mod system;
pub mod users;

/// Routes that run behind the auth middleware.
pub fn router() -> Router {
    Router::new()
        .route("/dispatch", post(commands::dispatch))
        .route("/streams/:aggregate_id", get(streams::load))
        .route("/users", get(users::find_by_email))
        .route("/users/:user_id", get(users::get))
}
