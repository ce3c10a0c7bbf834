use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            database_url: dotenv::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://mentorhub.db?mode=rwc".to_owned()),
            jwt_secret: dotenv::var("JWT_SECRET").context("JWT_SECRET must be set")?,
        })
    }
}
