//! Messages exchanged between cluster nodes
//!
//! Everything here travels as JSON with camelCase field names. Payloads are
//! opaque to the broker; only ids and headers drive routing and correlation.

pub mod headers;
pub mod state;

use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use headers::Headers;
pub use state::{DeviceCheckRequest, DeviceCheckResponse, DeviceState, DeviceStateInfo};

/// Common view over every message kind the broker routes
pub trait Message {
    fn message_id(&self) -> &str;

    fn headers_mut(&mut self) -> &mut Headers;

    fn add_header(&mut self, key: &str, value: impl Into<Value>)
    where
        Self: Sized,
    {
        self.headers_mut().insert(key, value);
    }
}

fn new_message_id() -> String {
    nanoid::nanoid!(16)
}

/// Command addressed to a device owned by some server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    pub message_id: String,
    pub device_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub payload: Value,
}

impl DeviceMessage {
    pub fn new(device_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: new_message_id(),
            device_id: device_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            headers: Headers::new(),
            payload,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

impl Message for DeviceMessage {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// Answer (or one fragment of an answer) to a `DeviceMessage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessageReply {
    pub message_id: String,
    #[serde(default)]
    pub device_id: String,
    pub timestamp: i64,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub payload: Value,
}

const fn default_success() -> bool {
    true
}

impl DeviceMessageReply {
    pub fn new(message_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            device_id: device_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            success: true,
            code: None,
            message: None,
            headers: Headers::new(),
            payload: Value::Null,
        }
    }

    /// Successful reply correlated with `request`
    #[must_use]
    pub fn for_message(request: &DeviceMessage) -> Self {
        Self::new(request.message_id.clone(), request.device_id.clone())
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.success = false;
        self.code = Some(code.into());
        self.message = Some(message.into());
        self
    }

    /// Mark this reply as one fragment of the reply to `parent_message_id`
    #[must_use]
    pub fn with_fragment(mut self, parent_message_id: &str, total: u32, last: bool) -> Self {
        self.headers
            .insert(headers::FRAGMENT_BODY_MESSAGE_ID, parent_message_id);
        self.headers.insert(headers::FRAGMENT_NUMBER, total);
        if last {
            self.headers.insert(headers::FRAGMENT_LAST, true);
        }
        self
    }

    /// Parent message id when this reply is a fragment
    #[must_use]
    pub fn fragment_group(&self) -> Option<&str> {
        self.headers.get_str(headers::FRAGMENT_BODY_MESSAGE_ID)
    }

    /// Declared number of fragments in the group, 1 when absent
    #[must_use]
    pub fn fragment_total(&self) -> i64 {
        self.headers.get_i64(headers::FRAGMENT_NUMBER).unwrap_or(1)
    }

    #[must_use]
    pub fn is_last_fragment(&self) -> bool {
        self.headers
            .get_bool(headers::FRAGMENT_LAST)
            .unwrap_or(false)
    }
}

impl Message for DeviceMessageReply {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// Cluster-wide, uncorrelated notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub message_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastMessage {
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            message_id: new_message_id(),
            timestamp: Utc::now().timestamp_millis(),
            headers: Headers::new(),
            payload,
        }
    }
}

impl Message for BroadcastMessage {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// Encode an item for the bus
pub fn encode<T: Serialize>(item: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(item)?))
}

/// Decode an item received from the bus
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}
