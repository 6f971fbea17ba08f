use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use confab_protocol::RoomInfo;

use crate::room::Room;

/// Registry of all active rooms. Rooms are created lazily on first
/// reference and live for the lifetime of the process.
///
/// The hub lock is never held across room operations.
pub struct Hub {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    max_history: usize,
    context_limit: usize,
}

impl Hub {
    pub fn new(max_history: usize, context_limit: usize) -> Self {
        let max_history = if max_history == 0 { 1000 } else { max_history };
        Self {
            rooms: Mutex::new(HashMap::new()),
            max_history,
            context_limit,
        }
    }

    /// Return the named room, creating it if needed.
    pub fn get_or_create(&self, name: &str) -> Arc<Room> {
        let mut rooms = self.rooms.lock().expect("hub state poisoned");
        rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Room::with_context_limit(
                    name,
                    self.max_history,
                    self.context_limit,
                ))
            })
            .clone()
    }

    /// Return the named room, or None if it does not exist.
    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.lock().expect("hub state poisoned");
        rooms.get(name).cloned()
    }

    /// Snapshot every active room.
    pub fn list(&self) -> Vec<RoomInfo> {
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.lock().expect("hub state poisoned");
            rooms.values().cloned().collect()
        };
        rooms.iter().map(|r| r.snapshot()).collect()
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.lock().expect("hub state poisoned");
        rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::SPAWN_CONTEXT_LIMIT;
    use confab_protocol::{msg_type, Payload};
    use std::collections::HashMap as Map;

    #[test]
    fn get_or_create_returns_same_room() {
        let hub = Hub::new(100, SPAWN_CONTEXT_LIMIT);
        let a = hub.get_or_create("dev");
        let b = hub.get_or_create("dev");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hub.room_count(), 1);
    }

    #[test]
    fn get_does_not_create() {
        let hub = Hub::new(100, SPAWN_CONTEXT_LIMIT);
        assert!(hub.get("nope").is_none());
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn list_snapshots_reflect_activity() {
        let hub = Hub::new(100, SPAWN_CONTEXT_LIMIT);
        let room = hub.get_or_create("dev");
        room.append("a", msg_type::TEXT, Payload::text("x"), Map::new());
        room.append("a", msg_type::TEXT, Payload::text("y"), Map::new());

        let list = hub.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "dev");
        assert_eq!(list[0].message_count, 2);
        assert_eq!(list[0].last_seq, 2);
        assert_eq!(list[0].clients, 0);
    }

    #[test]
    fn zero_history_falls_back_to_default() {
        let hub = Hub::new(0, SPAWN_CONTEXT_LIMIT);
        let room = hub.get_or_create("dev");
        for _ in 0..10 {
            room.append("a", msg_type::TEXT, Payload::text("x"), Map::new());
        }
        assert_eq!(room.latest(100).len(), 10);
    }
}
