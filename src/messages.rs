use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState,
    auth::AuthUser,
    db::{self, Message},
    realtime::{Realtime, events::SendMessage, events::ServerEvent},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(send))
        .route("/{id}/read", post(read))
}

/// REST entry into the same pipeline the socket uses; the push goes to the
/// receiver's connection only, never broadcast wider.
#[debug_handler(state = AppState)]
async fn send(
    State(pool): State<SqlitePool>,
    State(realtime): State<Arc<Realtime>>,
    AuthUser(sender_id): AuthUser,
    Json(payload): Json<SendMessage>,
) -> AppResult<impl IntoResponse> {
    let message = send_message(&pool, &realtime, &sender_id, payload).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[debug_handler(state = AppState)]
async fn read(
    State(pool): State<SqlitePool>,
    State(realtime): State<Arc<Realtime>>,
    AuthUser(reader_id): AuthUser,
    Path(message_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let read_at = mark_read(&pool, &realtime, &reader_id, &message_id).await?;
    Ok(Json(serde_json::json!({
        "messageId": message_id,
        "readAt": read_at,
    })))
}

/// Persist first, then push to the receiver's current connection if there
/// is one. The persisted record is returned to the caller either way.
pub async fn send_message(
    pool: &SqlitePool,
    realtime: &Realtime,
    sender_id: &str,
    payload: SendMessage,
) -> AppResult<Message> {
    let receiver_id = payload
        .receiver_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("receiverId is required".to_owned()))?;
    let content = payload
        .content
        .filter(|content| !content.is_empty())
        .ok_or_else(|| AppError::Validation("content is required".to_owned()))?;

    let receiver: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE id=?")
        .bind(&receiver_id)
        .fetch_optional(pool)
        .await?;
    if receiver.is_none() {
        return Err(AppError::NotFound("receiver"));
    }

    let message = Message {
        id: Uuid::now_v7().to_string(),
        sender_id: sender_id.to_owned(),
        receiver_id,
        content,
        kind: payload.kind.unwrap_or_default(),
        read: false,
        read_at: None,
        session_id: payload.session_id,
        created_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO messages (id,sender_id,receiver_id,content,kind,read,session_id,created_at) \
         VALUES (?,?,?,?,?,0,?,?)",
    )
    .bind(&message.id)
    .bind(&message.sender_id)
    .bind(&message.receiver_id)
    .bind(&message.content)
    .bind(message.kind.as_str())
    .bind(&message.session_id)
    .bind(message.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    let delivered = realtime.send_to_user(
        &message.receiver_id,
        ServerEvent::NewMessage(message.clone()),
    );
    debug!(
        message_id = %message.id,
        receiver_id = %message.receiver_id,
        delivered,
        "message persisted"
    );

    Ok(message)
}

/// Only the receiver may mark a message read. Re-marking an already-read
/// message keeps the stored state but still attempts the receipt push; the
/// persisted record stays authoritative either way.
pub async fn mark_read(
    pool: &SqlitePool,
    realtime: &Realtime,
    reader_id: &str,
    message_id: &str,
) -> AppResult<DateTime<Utc>> {
    let row: Option<(String, String, bool, Option<String>)> =
        sqlx::query_as("SELECT sender_id,receiver_id,read,read_at FROM messages WHERE id=?")
            .bind(message_id)
            .fetch_optional(pool)
            .await?;

    let Some((sender_id, receiver_id, already_read, read_at)) = row else {
        return Err(AppError::NotFound("message"));
    };
    if receiver_id != reader_id {
        return Err(AppError::Forbidden(
            "only the receiver can mark a message read".to_owned(),
        ));
    }

    let read_at = match (already_read, read_at) {
        (true, Some(raw)) => db::parse_ts(&raw)?,
        _ => {
            let now = Utc::now();
            sqlx::query("UPDATE messages SET read=1, read_at=? WHERE id=?")
                .bind(now.to_rfc3339())
                .bind(message_id)
                .execute(pool)
                .await?;
            now
        }
    };

    realtime.send_to_user(
        &sender_id,
        ServerEvent::MessageRead {
            message_id: message_id.to_owned(),
            read_at,
        },
    );

    Ok(read_at)
}
