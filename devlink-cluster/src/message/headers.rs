use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Server id of the node that sent a point-to-point command
pub const SEND_FROM: &str = "sendFrom";
/// Server id of the node that produced a reply
pub const REPLY_FROM: &str = "replyFrom";
/// Parent message id shared by every fragment of one reply
pub const FRAGMENT_BODY_MESSAGE_ID: &str = "fragmentBodyMessageId";
/// Declared total number of fragments in the group
pub const FRAGMENT_NUMBER: &str = "fragmentNumber";
/// Marks the final fragment of a group
pub const FRAGMENT_LAST: &str = "fragmentLast";

/// Message headers carried on the wire as a flat JSON object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, Value>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Non-empty string value of `key`
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Integer value of `key`, accepting numeric strings from loosely typed peers
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn send_from(&self) -> Option<&str> {
        self.get_str(SEND_FROM)
    }

    #[must_use]
    pub fn reply_from(&self) -> Option<&str> {
        self.get_str(REPLY_FROM)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
