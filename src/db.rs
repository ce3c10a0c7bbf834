use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// A direct message between two users. Immutable once written except for
/// the read flag/timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }
}

/// Community feed post as it goes over the wire: `likes` and `comments`
/// are counts, not the underlying rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub category: String,
    pub tags: Vec<String>,
    pub likes: i64,
    pub comments: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub content: String,
    pub likes: i64,
    pub created_at: DateTime<Utc>,
}

/// Timestamps are stored as RFC 3339 text.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

pub async fn migrate(pool: &SqlitePool) -> sqlx::Result<()> {
    // raw_sql: the schema is a multi-statement batch
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id   TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'student'
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            sender_id   TEXT NOT NULL,
            receiver_id TEXT NOT NULL,
            content     TEXT NOT NULL,
            kind        TEXT NOT NULL DEFAULT 'text',
            read        INTEGER NOT NULL DEFAULT 0,
            read_at     TEXT,
            session_id  TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS posts (
            id         TEXT PRIMARY KEY,
            author_id  TEXT NOT NULL,
            content    TEXT NOT NULL,
            category   TEXT NOT NULL,
            tags       TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS comments (
            id         TEXT PRIMARY KEY,
            post_id    TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            author_id  TEXT NOT NULL,
            content    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS post_likes (
            post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            PRIMARY KEY (post_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS comment_likes (
            comment_id TEXT NOT NULL REFERENCES comments(id) ON DELETE CASCADE,
            user_id    TEXT NOT NULL,
            PRIMARY KEY (comment_id, user_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
