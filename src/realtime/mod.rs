pub mod events;
pub mod presence;
pub mod rooms;
pub mod ws;

use axum::{Router, routing::get};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::AppState;
use events::ServerEvent;
use presence::Presence;
use rooms::Rooms;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::gateway))
}

/// Sending half of one live, authenticated connection. Cheap to clone;
/// sends are best-effort and become no-ops once the socket is gone.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub conn_id: Uuid,
    pub user_id: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnHandle {
    pub fn new(user_id: &str) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::now_v7(),
                user_id: user_id.to_owned(),
                tx,
            },
            rx,
        )
    }

    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

/// The hub every pipeline broadcasts through: all live connections, the
/// presence registry, and room membership. Injected via `AppState` so the
/// HTTP routes reach the exact same fan-out as the socket handlers.
#[derive(Debug, Default)]
pub struct Realtime {
    connections: DashMap<Uuid, ConnHandle>,
    pub presence: Presence,
    pub rooms: Rooms,
}

impl Realtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly authenticated connection and announces it to
    /// everyone else.
    pub fn connect(&self, handle: ConnHandle) {
        let conn_id = handle.conn_id;
        let user_id = handle.user_id.clone();
        self.connections.insert(conn_id, handle.clone());
        self.presence.register(handle);
        self.broadcast_all_except(
            Some(conn_id),
            &ServerEvent::UserOnline { user_id: user_id.clone() },
        );
        debug!(%user_id, "presence registered");
    }

    /// Tears a connection down. `user-offline` goes out only when this
    /// connection still owned the presence entry; a session superseded by a
    /// reconnect disappears silently.
    pub fn disconnect(&self, handle: &ConnHandle, joined_rooms: &[String]) {
        self.connections.remove(&handle.conn_id);
        for room in joined_rooms {
            self.rooms.leave(room, handle.conn_id);
        }
        if self.presence.unregister(&handle.user_id, handle.conn_id) {
            self.broadcast_all_except(
                None,
                &ServerEvent::UserOffline { user_id: handle.user_id.clone() },
            );
            debug!(user_id = %handle.user_id, "presence removed");
        }
    }

    /// Push to a user's current connection, if any. Returns whether a
    /// delivery was attempted.
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) -> bool {
        match self.presence.lookup(user_id) {
            Some(handle) => {
                handle.send(event);
                true
            }
            None => false,
        }
    }

    pub fn broadcast_all_except(&self, skip: Option<Uuid>, event: &ServerEvent) {
        for entry in self.connections.iter() {
            if Some(*entry.key()) != skip {
                entry.value().send(event.clone());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
