use std::sync::Arc;

use mentorhub::{AppState, Config, Realtime, auth, db};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mentorhub=debug,info")),
        )
        .init();

    let config = Config::from_env()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await?;
    db::migrate(&pool).await?;

    let state = AppState {
        pool,
        auth: auth::JwtKeys::new(&config.jwt_secret),
        realtime: Arc::new(Realtime::new()),
    };
    let app = mentorhub::app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
