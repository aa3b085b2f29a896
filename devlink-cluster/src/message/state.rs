use serde::{Deserialize, Serialize};

/// Connection state of a device as seen by its owning server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
    /// The owning server could not determine the state
    Unknown,
    /// Registered but never activated
    NotActive,
}

impl DeviceState {
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateInfo {
    pub device_id: String,
    pub state: DeviceState,
}

impl DeviceStateInfo {
    pub fn new(device_id: impl Into<String>, state: DeviceState) -> Self {
        Self {
            device_id: device_id.into(),
            state,
        }
    }
}

/// State query fanned out to the server owning `device_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCheckRequest {
    /// Server id expecting the answer on its result topic
    pub from: String,
    pub request_id: String,
    pub device_id: Vec<String>,
}

/// Complete answer to one `DeviceCheckRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCheckResponse {
    pub request_id: String,
    #[serde(default)]
    pub state_info_list: Vec<DeviceStateInfo>,
}
