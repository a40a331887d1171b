//! 通信总线：agent 之间的直接消息、主题广播与请求-响应

pub mod hub;
pub mod message;

pub use hub::{BroadcastReceipt, CommunicationBus, Mailbox};
pub use message::{DeliveryStatus, Message, MessageKind, Recipient};
