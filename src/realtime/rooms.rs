use std::collections::HashMap;

use dashmap::DashMap;
use uuid::Uuid;

use super::{ConnHandle, events::ServerEvent};

pub const COMMUNITY_ROOM: &str = "community";

/// Both participants derive the identical id regardless of who initiates.
pub fn direct_room_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}_{hi}")
}

pub fn session_room_id(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Named broadcast groups. Membership is per-connection and in-memory only;
/// clients re-join after every reconnect.
#[derive(Debug, Default)]
pub struct Rooms {
    members: DashMap<String, HashMap<Uuid, ConnHandle>>,
}

impl Rooms {
    pub fn join(&self, room: &str, handle: &ConnHandle) {
        self.members
            .entry(room.to_owned())
            .or_default()
            .insert(handle.conn_id, handle.clone());
    }

    pub fn leave(&self, room: &str, conn_id: Uuid) {
        let emptied = match self.members.get_mut(room) {
            Some(mut members) => {
                members.remove(&conn_id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.members.remove_if(room, |_, members| members.is_empty());
        }
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.members.get(room).map(|m| m.len()).unwrap_or(0)
    }

    pub fn broadcast(&self, room: &str, event: &ServerEvent) {
        if let Some(members) = self.members.get(room) {
            for handle in members.values() {
                handle.send(event.clone());
            }
        }
    }

    pub fn broadcast_except(&self, room: &str, conn_id: Uuid, event: &ServerEvent) {
        if let Some(members) = self.members.get(room) {
            for handle in members.values() {
                if handle.conn_id != conn_id {
                    handle.send(event.clone());
                }
            }
        }
    }
}
