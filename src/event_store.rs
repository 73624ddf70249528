//! Per-session event log backing SSE resumption.
//!
//! Every server-to-client payload is appended with a monotonically increasing
//! per-session id; the SSE transport replays from `Last-Event-ID` on
//! reconnect. Capacity is bounded; the oldest events are evicted first, and a
//! replay request that falls behind the retained window yields nothing so the
//! caller can resync.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct SessionEvents {
    next_id: u64,
    events: VecDeque<(u64, String)>,
}

#[derive(Debug)]
pub struct EventStore {
    capacity: usize,
    sessions: Mutex<HashMap<String, SessionEvents>>,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        EventStore {
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Append a payload for a session and return its assigned event id.
    /// Ids start at 1 and are never reused within a session.
    pub fn append(&self, session_id: &str, payload: String) -> u64 {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.next_id += 1;
        let id = entry.next_id;
        if entry.events.len() == self.capacity {
            entry.events.pop_front();
        }
        entry.events.push_back((id, payload));
        id
    }

    /// Events with ids strictly greater than `last_event_id`, in order.
    ///
    /// Returns an empty vec when `last_event_id` predates the retained
    /// window (events were evicted past it), so a resuming client is not
    /// handed a stream with a silent gap.
    pub fn replay_from(&self, session_id: &str, last_event_id: u64) -> Vec<(u64, String)> {
        let sessions = self.sessions.lock();
        let Some(entry) = sessions.get(session_id) else {
            return Vec::new();
        };
        if let Some(&(oldest, _)) = entry.events.front() {
            if last_event_id + 1 < oldest {
                return Vec::new();
            }
        }
        entry
            .events
            .iter()
            .filter(|(id, _)| *id > last_event_id)
            .cloned()
            .collect()
    }

    /// Oldest and newest retained event ids for a session, when any events
    /// are retained. Lets a replaying caller detect that its cursor fell
    /// behind the window and resync.
    pub fn retained_range(&self, session_id: &str) -> Option<(u64, u64)> {
        let sessions = self.sessions.lock();
        let entry = sessions.get(session_id)?;
        let oldest = entry.events.front()?.0;
        let newest = entry.events.back()?.0;
        Some((oldest, newest))
    }

    /// Drop all retained events for a session.
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

impl Default for EventStore {
    fn default() -> Self {
        EventStore::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_per_session() {
        let store = EventStore::new(8);
        assert_eq!(store.append("a", "1".into()), 1);
        assert_eq!(store.append("a", "2".into()), 2);
        assert_eq!(store.append("b", "x".into()), 1);
    }

    #[test]
    fn replay_is_strictly_after_cursor() {
        let store = EventStore::new(8);
        for i in 1..=5 {
            store.append("s", format!("e{i}"));
        }
        let got = store.replay_from("s", 3);
        assert_eq!(
            got,
            vec![(4, "e4".to_string()), (5, "e5".to_string())]
        );
        assert!(store.replay_from("s", 5).is_empty());
    }

    #[test]
    fn replay_behind_retained_window_is_empty() {
        let store = EventStore::new(3);
        for i in 1..=6 {
            store.append("s", format!("e{i}"));
        }
        // Retained window is ids 4..=6; a cursor of 1 has a gap.
        assert!(store.replay_from("s", 1).is_empty());
        // Cursor 3 is exactly the edge: 4 is the next event, no gap.
        assert_eq!(store.replay_from("s", 3).len(), 3);
    }

    #[test]
    fn unknown_session_replays_nothing() {
        let store = EventStore::default();
        assert!(store.replay_from("nope", 0).is_empty());
        assert!(store.retained_range("nope").is_none());
    }

    #[test]
    fn retained_range_tracks_the_window() {
        let store = EventStore::new(3);
        assert!(store.retained_range("s").is_none());
        for i in 1..=5 {
            store.append("s", format!("e{i}"));
        }
        assert_eq!(store.retained_range("s"), Some((3, 5)));
    }

    #[test]
    fn remove_session_forgets_history() {
        let store = EventStore::new(4);
        store.append("s", "e1".into());
        store.remove_session("s");
        assert!(store.replay_from("s", 0).is_empty());
        // A fresh session restarts id assignment.
        assert_eq!(store.append("s", "e1".into()), 1);
    }
}
