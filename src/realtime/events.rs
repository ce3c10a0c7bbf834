use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{Comment, Message, MessageKind, Post};

/// Inbound frame: `{"event": "<name>", "data": {...}}`. Required-field
/// checks that the client contract treats as soft validation errors
/// (e.g. a send-message without content) live in the pipelines, so the
/// payload structs keep those fields optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinChat { user_id: String },
    SendMessage(SendMessage),
    Typing { receiver_id: String },
    StopTyping { receiver_id: String },
    MarkRead { message_id: String },
    JoinCommunity,
    CreatePost(CreatePost),
    LikePost { post_id: String },
    AddComment(AddComment),
    JoinSession { session_id: String },
    LeaveSession { session_id: String },
    SessionMessage { session_id: String, message: Value },
    VideoOffer { session_id: String, offer: Value },
    VideoAnswer { session_id: String, answer: Value },
    IceCandidate { session_id: String, candidate: Value },
    SendNotification { user_id: String, notification: Value },
    UpdateProgress { module_id: String, progress: Value },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMessage {
    pub receiver_id: Option<String>,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<MessageKind>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreatePost {
    pub content: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddComment {
    pub post_id: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    NewMessage(Message),
    MessageSent(Message),
    MessageError { error: String },
    MessageRead { message_id: String, read_at: DateTime<Utc> },
    Typing { user_id: String },
    StopTyping { user_id: String },
    NewPost(Post),
    PostLiked { post_id: String, likes: i64, user_id: String },
    PostError { error: String },
    NewComment { post_id: String, comment: Comment },
    CommentError { error: String },
    UserJoinedSession { user_id: String },
    UserLeftSession { user_id: String },
    SessionMessage { user_id: String, message: Value, timestamp: DateTime<Utc> },
    VideoOffer { user_id: String, offer: Value },
    VideoAnswer { user_id: String, answer: Value },
    IceCandidate { user_id: String, candidate: Value },
    Notification(Value),
    UserOnline { user_id: String },
    UserOffline { user_id: String },
    StudentProgressUpdate { user_id: String, module_id: String, progress: Value },
    Error { error: String },
}
