pub mod auth;
pub mod community;
pub mod config;
pub mod db;
pub mod error;
pub mod messages;
pub mod realtime;

use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::SqlitePool;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use realtime::Realtime;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub pool: SqlitePool,
    pub auth: auth::JwtKeys,
    pub realtime: Arc<Realtime>,
}

pub fn app(state: AppState) -> axum::Router {
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    axum::Router::new()
        .merge(realtime::router())
        .nest("/api/messages", messages::router())
        .nest("/api/community", community::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
