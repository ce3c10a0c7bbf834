use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState,
    auth::AuthUser,
    db::{Comment, Post},
    realtime::{
        Realtime,
        events::{AddComment, CreatePost, ServerEvent},
        rooms::COMMUNITY_ROOM,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/posts", post(create))
        .route("/posts/{id}/like", post(like))
        .route("/posts/{id}/comments", post(comment))
}

#[debug_handler(state = AppState)]
async fn create(
    State(pool): State<SqlitePool>,
    State(realtime): State<Arc<Realtime>>,
    AuthUser(author_id): AuthUser,
    Json(payload): Json<CreatePost>,
) -> AppResult<impl IntoResponse> {
    let post = create_post(&pool, &realtime, &author_id, payload).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

#[debug_handler(state = AppState)]
async fn like(
    State(pool): State<SqlitePool>,
    State(realtime): State<Arc<Realtime>>,
    AuthUser(user_id): AuthUser,
    Path(post_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let likes = toggle_like(&pool, &realtime, &user_id, &post_id).await?;
    Ok(Json(serde_json::json!({ "postId": post_id, "likes": likes })))
}

#[debug_handler(state = AppState)]
async fn comment(
    State(pool): State<SqlitePool>,
    State(realtime): State<Arc<Realtime>>,
    AuthUser(author_id): AuthUser,
    Path(post_id): Path<String>,
    Json(mut payload): Json<AddComment>,
) -> AppResult<impl IntoResponse> {
    payload.post_id = Some(post_id);
    let comment = add_comment(&pool, &realtime, &author_id, payload).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

/// Persist the post, then fan it out to everyone in the community room,
/// the author included.
pub async fn create_post(
    pool: &SqlitePool,
    realtime: &Realtime,
    author_id: &str,
    payload: CreatePost,
) -> AppResult<Post> {
    let content = payload
        .content
        .filter(|content| !content.is_empty())
        .ok_or_else(|| AppError::Validation("content is required".to_owned()))?;
    let category = payload
        .category
        .filter(|category| !category.is_empty())
        .ok_or_else(|| AppError::Validation("category is required".to_owned()))?;

    let post = Post {
        id: Uuid::now_v7().to_string(),
        author_id: author_id.to_owned(),
        content,
        category,
        tags: payload.tags,
        likes: 0,
        comments: 0,
        created_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO posts (id,author_id,content,category,tags,created_at) VALUES (?,?,?,?,?,?)",
    )
    .bind(&post.id)
    .bind(&post.author_id)
    .bind(&post.content)
    .bind(&post.category)
    .bind(serde_json::to_string(&post.tags)?)
    .bind(post.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    realtime
        .rooms
        .broadcast(COMMUNITY_ROOM, &ServerEvent::NewPost(post.clone()));
    debug!(post_id = %post.id, author_id, "post created");

    Ok(post)
}

/// Set-membership toggle on the like set: present → unlike, absent → like.
/// The primary key on (post_id, user_id) rules out duplicates. Returns the
/// resulting count.
pub async fn toggle_like(
    pool: &SqlitePool,
    realtime: &Realtime,
    user_id: &str,
    post_id: &str,
) -> AppResult<i64> {
    let post: Option<(String,)> = sqlx::query_as("SELECT id FROM posts WHERE id=?")
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    if post.is_none() {
        return Err(AppError::NotFound("post"));
    }

    let removed = sqlx::query("DELETE FROM post_likes WHERE post_id=? AND user_id=?")
        .bind(post_id)
        .bind(user_id)
        .execute(pool)
        .await?
        .rows_affected();
    if removed == 0 {
        sqlx::query("INSERT OR IGNORE INTO post_likes (post_id,user_id) VALUES (?,?)")
            .bind(post_id)
            .bind(user_id)
            .execute(pool)
            .await?;
    }

    let (likes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM post_likes WHERE post_id=?")
        .bind(post_id)
        .fetch_one(pool)
        .await?;

    realtime.rooms.broadcast(
        COMMUNITY_ROOM,
        &ServerEvent::PostLiked {
            post_id: post_id.to_owned(),
            likes,
            user_id: user_id.to_owned(),
        },
    );

    Ok(likes)
}

/// The comment row and its link to the post commit in one transaction;
/// the broadcast only happens after the commit, so a lost broadcast can
/// never leave the two records inconsistent.
pub async fn add_comment(
    pool: &SqlitePool,
    realtime: &Realtime,
    author_id: &str,
    payload: AddComment,
) -> AppResult<Comment> {
    let post_id = payload
        .post_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("postId is required".to_owned()))?;
    let content = payload
        .content
        .filter(|content| !content.is_empty())
        .ok_or_else(|| AppError::Validation("content is required".to_owned()))?;

    let comment = Comment {
        id: Uuid::now_v7().to_string(),
        post_id,
        author_id: author_id.to_owned(),
        content,
        likes: 0,
        created_at: Utc::now(),
    };

    let mut tx = pool.begin().await?;
    let post: Option<(String,)> = sqlx::query_as("SELECT id FROM posts WHERE id=?")
        .bind(&comment.post_id)
        .fetch_optional(&mut *tx)
        .await?;
    if post.is_none() {
        return Err(AppError::NotFound("post"));
    }
    sqlx::query(
        "INSERT INTO comments (id,post_id,author_id,content,created_at) VALUES (?,?,?,?,?)",
    )
    .bind(&comment.id)
    .bind(&comment.post_id)
    .bind(&comment.author_id)
    .bind(&comment.content)
    .bind(comment.created_at.to_rfc3339())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    realtime.rooms.broadcast(
        COMMUNITY_ROOM,
        &ServerEvent::NewComment {
            post_id: comment.post_id.clone(),
            comment: comment.clone(),
        },
    );

    Ok(comment)
}
