//! 消息总线模块：消息协议 + 发布/订阅

pub mod bus;
pub mod message;

pub use bus::{BusEvent, ChannelHandler, MessageBus, MessageHandler, SubscriptionId};
pub use message::{AgentMessage, MessageKind, MessageMetadata, Priority, BROADCAST};

/// 编排器统一的响应主题（各工作者宿主把响应与错误发到这里）
pub const RESPONSE_TOPIC: &str = "orchestrator.response";

/// 某工作者类型的请求主题
pub fn request_topic(worker_type: &str) -> String {
    format!("worker.{}.request", worker_type)
}
