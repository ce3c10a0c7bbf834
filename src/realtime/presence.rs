use dashmap::DashMap;
use uuid::Uuid;

use super::ConnHandle;

/// Process-wide user → live connection map. One entry per user; a fresh
/// connection for the same user displaces the old one.
#[derive(Debug, Default)]
pub struct Presence {
    online: DashMap<String, ConnHandle>,
}

impl Presence {
    /// Returns the handle that was displaced, if any.
    pub fn register(&self, handle: ConnHandle) -> Option<ConnHandle> {
        self.online.insert(handle.user_id.clone(), handle)
    }

    /// Compare-and-delete: removes the entry only while it still belongs to
    /// `conn_id`, so a stale disconnect cannot evict a newer session.
    pub fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        self.online
            .remove_if(user_id, |_, stored| stored.conn_id == conn_id)
            .is_some()
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnHandle> {
        self.online.get(user_id).map(|entry| entry.clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_last_wins() {
        let presence = Presence::default();
        let (first, _rx1) = ConnHandle::new("u1");
        let (second, _rx2) = ConnHandle::new("u1");

        assert!(presence.register(first.clone()).is_none());
        let displaced = presence.register(second.clone()).unwrap();
        assert_eq!(displaced.conn_id, first.conn_id);
        assert_eq!(presence.lookup("u1").unwrap().conn_id, second.conn_id);
    }

    #[test]
    fn stale_disconnect_cannot_evict_the_newer_session() {
        let presence = Presence::default();
        let (old, _rx1) = ConnHandle::new("u1");
        let (new, _rx2) = ConnHandle::new("u1");
        presence.register(old.clone());
        presence.register(new.clone());

        // the superseded connection's disconnect fires late
        assert!(!presence.unregister("u1", old.conn_id));
        assert_eq!(presence.lookup("u1").unwrap().conn_id, new.conn_id);

        // the live connection's own disconnect still works
        assert!(presence.unregister("u1", new.conn_id));
        assert!(presence.lookup("u1").is_none());
    }

    #[test]
    fn lookup_of_an_unknown_user_is_absent() {
        let presence = Presence::default();
        assert!(presence.lookup("ghost").is_none());
        assert!(!presence.is_online("ghost"));
        assert!(!presence.unregister("ghost", Uuid::now_v7()));
    }
}
