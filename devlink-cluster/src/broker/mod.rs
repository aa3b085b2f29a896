// Module: broker

pub mod correlation;
pub mod listener;
pub mod operation_broker;
pub mod reply;
pub mod router;
pub mod state_check;
pub mod topics;

pub use correlation::{CorrelationTable, Retain};
pub use listener::ListenerHandle;
pub use operation_broker::DeviceOperationBroker;
pub use reply::{LogReplyFailure, ReplyCorrelator, ReplyFailureHandler, ReplyStream};
pub use router::MessageRouter;
pub use state_check::{StateCheckCoordinator, StateChecker};
