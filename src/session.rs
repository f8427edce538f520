use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

const ROOM_PREFIX: &str = "room-";
const USER_PREFIX: &str = "loadtest-";
const ECHO_PREFIX: &str = "test";

/// Process-wide iteration counter used to spread VUs over rooms.
///
/// It is incremented once per iteration and never reset. Only a rough
/// distribution over rooms is needed, so relaxed ordering is enough.
#[derive(Debug, Default)]
pub struct RunCounter(AtomicU64);

impl RunCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value and increments the counter.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Identity of one simulated chat client for the length of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room: String,
    pub user: String,
}

impl Session {
    pub fn next(counter: &RunCounter, rooms: u64) -> Self {
        let index = counter.next() % rooms.max(1);
        Self {
            room: format!("{}{}", ROOM_PREFIX, index),
            user: format!("{}{}", USER_PREFIX, rand::random::<f64>()),
        }
    }

    pub fn join_message(&self) -> JoinMessage<'_> {
        JoinMessage {
            room: &self.room,
            user: &self.user,
        }
    }

    /// Whether an inbound frame is one of this session's test messages coming back.
    ///
    /// The text is matched by prefix, so `"testing"` counts as well. Frames without
    /// a string `user` or `text` never match.
    pub fn is_echo(&self, message: &Value) -> bool {
        let user = message.get("user").and_then(Value::as_str);
        let text = message.get("text").and_then(Value::as_str);
        match (user, text) {
            (Some(user), Some(text)) => user == self.user && text.starts_with(ECHO_PREFIX),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JoinMessage<'a> {
    pub room: &'a str,
    pub user: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TextMessage {
    pub text: String,
}

impl TextMessage {
    pub fn numbered(i: usize) -> Self {
        Self {
            text: format!("test: {}", i),
        }
    }
}
