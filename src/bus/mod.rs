//! 控制面消息总线：节点间发布/订阅

pub mod broker;
pub mod message;

pub use broker::{ControlBus, DEFAULT_CHANNEL_CAPACITY};
pub use message::{node_channel, NodeMessage, CHANNEL_ALL_NODES};
