//! 工作者抽象与总线侧宿主
//!
//! `Worker` 是领域逻辑的唯一接入点；`WorkerHost` 把某一工作者类型接到总线上：
//! 订阅该类型的请求主题，向池子租用实例、执行、把响应或分类后的错误发回
//! 编排器的响应主题。实例本身不进总线，消息里只有可序列化的负载。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::bus::{AgentMessage, MessageBus, MessageHandler, MessageKind, RESPONSE_TOPIC};
use crate::error::CoordError;
use crate::pool::WorkerPool;

/// 工作者执行错误（由实现方分类，宿主据此映射到协调层错误码）
#[derive(Error, Debug)]
pub enum WorkerError {
    /// 瞬时失败（超时、连接抖动），可退避重试
    #[error("transient: {0}")]
    Transient(String),

    /// 工作者自身失败
    #[error("failed: {0}")]
    Failed(String),

    /// 输出未通过校验
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    /// 合规违规
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    /// 映射到协调层错误分类
    pub fn into_coord(self) -> CoordError {
        match self {
            WorkerError::Transient(d) => CoordError::Transient(d),
            WorkerError::Failed(d) => CoordError::WorkerFailure(d),
            WorkerError::InvalidOutput(d) => CoordError::ValidationFailure(d),
            WorkerError::PolicyViolation(d) => CoordError::PolicyViolation(d),
            WorkerError::Other(d) => CoordError::Unclassified(d),
        }
    }
}

/// 工作者：处理一条请求消息，返回 JSON 结果
#[async_trait]
pub trait Worker: Send + Sync {
    /// 所属工作者类型
    fn worker_type(&self) -> &str;

    /// 处理请求。实现方不接触总线与池子，只看消息、还结果。
    async fn process(&self, message: &AgentMessage) -> Result<serde_json::Value, WorkerError>;
}

/// 工作者宿主：一个类型一个，消费请求主题并发回响应
///
/// 每条请求派生独立任务处理，池内多个实例可并行工作；等待租约不会阻塞投递。
pub struct WorkerHost {
    worker_type: String,
    pool: Arc<WorkerPool>,
    bus: Arc<MessageBus>,
}

impl WorkerHost {
    pub fn new(worker_type: impl Into<String>, pool: Arc<WorkerPool>, bus: Arc<MessageBus>) -> Self {
        Self {
            worker_type: worker_type.into(),
            pool,
            bus,
        }
    }

    /// 挂到总线上：订阅本类型的请求主题
    pub async fn start(self: Arc<Self>) -> crate::bus::SubscriptionId {
        let topic = crate::bus::request_topic(&self.worker_type);
        let bus = self.bus.clone();
        bus.subscribe(topic, self).await
    }
}

/// 租用 → 执行 → 发回。租约在执行结束后随作用域归还。
async fn dispatch(
    worker_type: String,
    pool: Arc<WorkerPool>,
    bus: Arc<MessageBus>,
    request: AgentMessage,
) {
    let lease = match pool.acquire(&worker_type).await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(
                worker_type = %worker_type,
                error = %e,
                "Failed to acquire worker instance"
            );
            publish_error(&worker_type, &bus, &request, &e).await;
            return;
        }
    };

    match lease.worker().process(&request).await {
        Ok(data) => {
            let response = AgentMessage::new(
                worker_type,
                request.sender.clone(),
                request.conversation_id.clone(),
                MessageKind::Response,
                json!({
                    "in_reply_to": request.message_id,
                    "data": data,
                }),
                request.metadata.ttl,
            );
            bus.publish(RESPONSE_TOPIC, response).await;
        }
        Err(e) => {
            tracing::warn!(
                worker_type = %worker_type,
                conversation_id = %request.conversation_id,
                error = %e,
                "Worker processing failed"
            );
            publish_error(&worker_type, &bus, &request, &e.into_coord()).await;
        }
    }
}

async fn publish_error(
    worker_type: &str,
    bus: &MessageBus,
    request: &AgentMessage,
    error: &CoordError,
) {
    let message = AgentMessage::new(
        worker_type,
        request.sender.clone(),
        request.conversation_id.clone(),
        MessageKind::Error,
        json!({
            "in_reply_to": request.message_id,
            "code": error.code(),
            "detail": error.to_string(),
        }),
        request.metadata.ttl,
    );
    bus.publish(RESPONSE_TOPIC, message).await;
}

#[async_trait]
impl MessageHandler for WorkerHost {
    async fn handle(&self, message: AgentMessage) -> Result<(), String> {
        if message.message_type != MessageKind::Request {
            return Ok(());
        }
        // 只处理点名本类型或广播的请求
        if message.recipient != self.worker_type && !message.is_broadcast() {
            return Ok(());
        }
        tokio::spawn(dispatch(
            self.worker_type.clone(),
            self.pool.clone(),
            self.bus.clone(),
            message,
        ));
        Ok(())
    }
}
