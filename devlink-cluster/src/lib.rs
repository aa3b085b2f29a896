pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;

pub use broker::{
    DeviceOperationBroker, ListenerHandle, ReplyFailureHandler, ReplyStream, StateChecker,
};
pub use bus::{LocalBus, RedisBus, TopicBus};
pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use message::{
    BroadcastMessage, DeviceMessage, DeviceMessageReply, DeviceState, DeviceStateInfo, Headers,
};
