use std::collections::HashSet;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{AppError, AppResult, AppState, auth, community, messages};

use super::{
    ConnHandle,
    events::{ClientEvent, ServerEvent},
    rooms,
};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// The upgrade handler. The credential is verified before `on_upgrade`, so
/// a bad handshake is turned away with 401 and no connection state is ever
/// created. Browsers cannot set headers on a WebSocket upgrade, hence the
/// `?token=` fallback.
pub async fn gateway(
    State(state): State<AppState>,
    Query(WsQuery { token }): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let token = token
        .or_else(|| auth::bearer_token(&headers))
        .ok_or_else(|| AppError::Auth("missing handshake credential".to_owned()))?;
    let claims = state.auth.verify(&token)?;

    Ok(ws.on_upgrade(move |socket| connection(socket, state, claims.sub)))
}

/// Per-connection state: the sending handle plus the rooms this connection
/// joined, so disconnect can clean up membership.
pub(crate) struct ConnCtx {
    pub(crate) handle: ConnHandle,
    pub(crate) joined: HashSet<String>,
}

impl ConnCtx {
    pub(crate) fn new(handle: ConnHandle) -> Self {
        Self {
            handle,
            joined: HashSet::new(),
        }
    }

    fn user_id(&self) -> &str {
        &self.handle.user_id
    }
}

async fn connection(socket: WebSocket, state: AppState, user_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut rx) = ConnHandle::new(&user_id);
    let conn_id = handle.conn_id;
    state.realtime.connect(handle.clone());
    info!(%user_id, %conn_id, "connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut ctx = ConnCtx::new(handle);
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch(&state, &mut ctx, event).await,
                Err(err) => ctx.handle.send(ServerEvent::Error {
                    error: format!("malformed event: {err}"),
                }),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    let joined: Vec<String> = ctx.joined.drain().collect();
    state.realtime.disconnect(&ctx.handle, &joined);
    writer.abort();
    info!(%user_id, %conn_id, "disconnected");
}

/// One inbound event. Pipeline failures become scoped error events on the
/// originating connection; nothing here tears the connection down.
pub(crate) async fn dispatch(state: &AppState, ctx: &mut ConnCtx, event: ClientEvent) {
    let realtime = &state.realtime;
    match event {
        ClientEvent::JoinChat { user_id } => {
            let room = rooms::direct_room_id(ctx.user_id(), &user_id);
            realtime.rooms.join(&room, &ctx.handle);
            ctx.joined.insert(room);
        }
        ClientEvent::SendMessage(payload) => {
            match messages::send_message(&state.pool, realtime, ctx.user_id(), payload).await {
                Ok(message) => ctx.handle.send(ServerEvent::MessageSent(message)),
                Err(err) => {
                    warn!(user_id = %ctx.user_id(), %err, "send-message failed");
                    ctx.handle.send(ServerEvent::MessageError {
                        error: err.to_string(),
                    });
                }
            }
        }
        ClientEvent::Typing { receiver_id } => {
            realtime.send_to_user(
                &receiver_id,
                ServerEvent::Typing {
                    user_id: ctx.user_id().to_owned(),
                },
            );
        }
        ClientEvent::StopTyping { receiver_id } => {
            realtime.send_to_user(
                &receiver_id,
                ServerEvent::StopTyping {
                    user_id: ctx.user_id().to_owned(),
                },
            );
        }
        ClientEvent::MarkRead { message_id } => {
            // the receipt itself goes to the original sender inside the pipeline
            if let Err(err) =
                messages::mark_read(&state.pool, realtime, ctx.user_id(), &message_id).await
            {
                ctx.handle.send(ServerEvent::MessageError {
                    error: err.to_string(),
                });
            }
        }
        ClientEvent::JoinCommunity => {
            realtime.rooms.join(rooms::COMMUNITY_ROOM, &ctx.handle);
            ctx.joined.insert(rooms::COMMUNITY_ROOM.to_owned());
        }
        ClientEvent::CreatePost(payload) => {
            if let Err(err) =
                community::create_post(&state.pool, realtime, ctx.user_id(), payload).await
            {
                ctx.handle.send(ServerEvent::PostError {
                    error: err.to_string(),
                });
            }
        }
        ClientEvent::LikePost { post_id } => {
            if let Err(err) =
                community::toggle_like(&state.pool, realtime, ctx.user_id(), &post_id).await
            {
                ctx.handle.send(ServerEvent::PostError {
                    error: err.to_string(),
                });
            }
        }
        ClientEvent::AddComment(payload) => {
            if let Err(err) =
                community::add_comment(&state.pool, realtime, ctx.user_id(), payload).await
            {
                ctx.handle.send(ServerEvent::CommentError {
                    error: err.to_string(),
                });
            }
        }
        ClientEvent::JoinSession { session_id } => {
            let room = rooms::session_room_id(&session_id);
            realtime.rooms.join(&room, &ctx.handle);
            realtime.rooms.broadcast_except(
                &room,
                ctx.handle.conn_id,
                &ServerEvent::UserJoinedSession {
                    user_id: ctx.user_id().to_owned(),
                },
            );
            debug!(user_id = %ctx.user_id(), %session_id, "joined session");
            ctx.joined.insert(room);
        }
        ClientEvent::LeaveSession { session_id } => {
            let room = rooms::session_room_id(&session_id);
            realtime.rooms.leave(&room, ctx.handle.conn_id);
            ctx.joined.remove(&room);
            realtime.rooms.broadcast(
                &room,
                &ServerEvent::UserLeftSession {
                    user_id: ctx.user_id().to_owned(),
                },
            );
        }
        ClientEvent::SessionMessage { session_id, message } => {
            relay(
                state,
                ctx,
                &session_id,
                ServerEvent::SessionMessage {
                    user_id: ctx.user_id().to_owned(),
                    message,
                    timestamp: Utc::now(),
                },
            );
        }
        ClientEvent::VideoOffer { session_id, offer } => {
            relay(
                state,
                ctx,
                &session_id,
                ServerEvent::VideoOffer {
                    user_id: ctx.user_id().to_owned(),
                    offer,
                },
            );
        }
        ClientEvent::VideoAnswer { session_id, answer } => {
            relay(
                state,
                ctx,
                &session_id,
                ServerEvent::VideoAnswer {
                    user_id: ctx.user_id().to_owned(),
                    answer,
                },
            );
        }
        ClientEvent::IceCandidate { session_id, candidate } => {
            relay(
                state,
                ctx,
                &session_id,
                ServerEvent::IceCandidate {
                    user_id: ctx.user_id().to_owned(),
                    candidate,
                },
            );
        }
        ClientEvent::SendNotification { user_id, notification } => {
            // dropped silently when the target is offline
            realtime.send_to_user(&user_id, ServerEvent::Notification(notification));
        }
        ClientEvent::UpdateProgress { module_id, progress } => {
            realtime.broadcast_all_except(
                Some(ctx.handle.conn_id),
                &ServerEvent::StudentProgressUpdate {
                    user_id: ctx.user_id().to_owned(),
                    module_id,
                    progress,
                },
            );
        }
    }
}

/// Signaling payloads are forwarded untouched to the other members of the
/// session room; the sender never hears its own relay.
fn relay(state: &AppState, ctx: &ConnCtx, session_id: &str, event: ServerEvent) {
    state.realtime.rooms.broadcast_except(
        &rooms::session_room_id(session_id),
        ctx.handle.conn_id,
        &event,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;
    use tokio::sync::mpsc;

    async fn connected(
        state: &AppState,
        user_id: &str,
    ) -> (ConnCtx, mpsc::UnboundedReceiver<ServerEvent>) {
        let (handle, rx) = ConnHandle::new(user_id);
        state.realtime.connect(handle.clone());
        (ConnCtx::new(handle), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn direct_message_reaches_the_receiver_and_acks_the_sender() {
        let state = test_util::state().await;
        let (mut sender, mut rx_sender) = connected(&state, "u1").await;
        let (_receiver, mut rx_receiver) = connected(&state, "u2").await;
        drain(&mut rx_sender);

        let frame = r#"{"event":"send-message","data":{"receiverId":"u2","content":"hi","type":"text"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        dispatch(&state, &mut sender, event).await;

        let delivered = drain(&mut rx_receiver);
        let [ServerEvent::NewMessage(received)] = delivered.as_slice() else {
            panic!("receiver got {delivered:?}");
        };
        assert_eq!(received.content, "hi");
        assert_eq!(received.sender_id, "u1");

        let acked = drain(&mut rx_sender);
        let [ServerEvent::MessageSent(ack)] = acked.as_slice() else {
            panic!("sender got {acked:?}");
        };
        assert_eq!(ack.id, received.id);
    }

    #[tokio::test]
    async fn invalid_send_produces_a_scoped_message_error() {
        let state = test_util::state().await;
        let (mut sender, mut rx_sender) = connected(&state, "u1").await;

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"send-message","data":{"receiverId":"u2"}}"#).unwrap();
        dispatch(&state, &mut sender, event).await;

        assert!(matches!(
            drain(&mut rx_sender).as_slice(),
            [ServerEvent::MessageError { .. }]
        ));
    }

    #[tokio::test]
    async fn ice_candidates_fan_out_to_the_other_session_members() {
        let state = test_util::state().await;
        let (mut u1, mut rx1) = connected(&state, "u1").await;
        let (mut u2, mut rx2) = connected(&state, "u2").await;
        let (mut u3, mut rx3) = connected(&state, "u3").await;

        for ctx in [&mut u1, &mut u2, &mut u3] {
            let join: ClientEvent =
                serde_json::from_str(r#"{"event":"join-session","data":{"sessionId":"s1"}}"#)
                    .unwrap();
            dispatch(&state, ctx, join).await;
        }
        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        let candidate: ClientEvent = serde_json::from_str(
            r#"{"event":"ice-candidate","data":{"sessionId":"s1","candidate":{"sdpMid":"0"}}}"#,
        )
        .unwrap();
        dispatch(&state, &mut u1, candidate).await;

        for rx in [&mut rx2, &mut rx3] {
            let events = drain(rx);
            let [ServerEvent::IceCandidate { user_id, candidate }] = events.as_slice() else {
                panic!("peer got {events:?}");
            };
            assert_eq!(user_id, "u1");
            assert_eq!(candidate["sdpMid"], "0");
        }
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn session_join_and_leave_notify_the_other_members_only() {
        let state = test_util::state().await;
        let (mut u1, mut rx1) = connected(&state, "u1").await;
        let (mut u2, mut rx2) = connected(&state, "u2").await;
        drain(&mut rx1);

        let join: ClientEvent =
            serde_json::from_str(r#"{"event":"join-session","data":{"sessionId":"s1"}}"#).unwrap();
        dispatch(&state, &mut u1, join.clone()).await;
        dispatch(&state, &mut u2, join).await;

        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [ServerEvent::UserJoinedSession { user_id }] if user_id == "u2"
        ));
        assert!(drain(&mut rx2).is_empty());

        let leave: ClientEvent =
            serde_json::from_str(r#"{"event":"leave-session","data":{"sessionId":"s1"}}"#).unwrap();
        dispatch(&state, &mut u2, leave).await;
        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [ServerEvent::UserLeftSession { user_id }] if user_id == "u2"
        ));
        assert!(drain(&mut rx2).is_empty());
        assert!(!u2.joined.contains("session:s1"));
    }

    #[tokio::test]
    async fn typing_goes_only_to_the_named_receiver() {
        let state = test_util::state().await;
        let (mut u1, _rx1) = connected(&state, "u1").await;
        let (_u2, mut rx2) = connected(&state, "u2").await;
        let (_u3, mut rx3) = connected(&state, "u3").await;
        drain(&mut rx2);
        drain(&mut rx3);

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"typing","data":{"receiverId":"u2"}}"#).unwrap();
        dispatch(&state, &mut u1, event).await;

        assert!(matches!(
            drain(&mut rx2).as_slice(),
            [ServerEvent::Typing { user_id }] if user_id == "u1"
        ));
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn progress_updates_broadcast_to_everyone_else() {
        let state = test_util::state().await;
        let (mut u1, mut rx1) = connected(&state, "u1").await;
        let (_u2, mut rx2) = connected(&state, "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"update-progress","data":{"moduleId":"mod-1","progress":80}}"#,
        )
        .unwrap();
        dispatch(&state, &mut u1, event).await;

        let events = drain(&mut rx2);
        let [ServerEvent::StudentProgressUpdate { user_id, module_id, progress }] =
            events.as_slice()
        else {
            panic!("peer got {events:?}");
        };
        assert_eq!(user_id, "u1");
        assert_eq!(module_id, "mod-1");
        assert_eq!(progress, &serde_json::json!(80));
        assert!(drain(&mut rx1).is_empty());
    }

    /// Sends a raw upgrade request against a live listener and returns the
    /// HTTP status line. `oneshot` cannot drive this path: the upgrade
    /// extension only exists on requests that came through a real server.
    async fn handshake_status(state: AppState, target: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::app(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {target} HTTP/1.1\r\n\
             host: localhost\r\n\
             connection: upgrade\r\n\
             upgrade: websocket\r\n\
             sec-websocket-version: 13\r\n\
             sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n])
            .lines()
            .next()
            .unwrap_or_default()
            .to_owned()
    }

    #[tokio::test]
    async fn unauthenticated_handshake_is_rejected_before_any_state_exists() {
        let state = test_util::state().await;

        let status = handshake_status(state.clone(), "/ws").await;
        assert!(status.contains("401"), "got {status}");

        let status = handshake_status(state.clone(), "/ws?token=not-a-jwt").await;
        assert!(status.contains("401"), "got {status}");

        assert_eq!(state.realtime.connection_count(), 0);
        assert!(!state.realtime.presence.is_online("u1"));
    }

    #[tokio::test]
    async fn a_valid_credential_lets_the_upgrade_proceed() {
        let state = test_util::state().await;
        let token = crate::auth::tests::token_for("u1");
        let status = handshake_status(state, &format!("/ws?token={token}")).await;
        assert!(status.contains("101"), "got {status}");
    }

    #[tokio::test]
    async fn notifications_are_dropped_for_offline_targets() {
        let state = test_util::state().await;
        let (mut u1, mut rx1) = connected(&state, "u1").await;

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"send-notification","data":{"userId":"ghost","notification":{"title":"hi"}}}"#,
        )
        .unwrap();
        dispatch(&state, &mut u1, event).await;
        assert!(drain(&mut rx1).is_empty());
    }
}
