//! 总线消息协议定义
//!
//! 统一的消息格式，用于编排器与各工作者之间的通信。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 广播接收方标识
pub const BROADCAST: &str = "broadcast";

/// 消息种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// 请求
    Request,
    /// 响应
    Response,
    /// 事件
    Event,
    /// 错误
    Error,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Event => write!(f, "event"),
            MessageKind::Error => write!(f, "error"),
        }
    }
}

/// 消息优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// 消息元信息：优先级、TTL（秒）、重试计数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub priority: Priority,
    /// 存活时间（秒），投递时评估；0 表示立即过期
    pub ttl: u64,
    /// 重试计数（重试产生新消息，此值 +1）
    #[serde(default)]
    pub retry_count: u32,
}

/// 智能体消息（发布后不可变；重试以新消息表达）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// 消息 ID（UUID）
    pub message_id: String,
    /// 创建时间（ISO-8601）
    pub timestamp: DateTime<Utc>,
    /// 发送方类型
    pub sender: String,
    /// 接收方类型，或 "broadcast"
    pub recipient: String,
    /// 所属会话 ID（每条消息恰属于一个会话）
    pub conversation_id: String,
    /// 消息种类
    pub message_type: MessageKind,
    /// 不透明负载
    pub payload: serde_json::Value,
    pub metadata: MessageMetadata,
}

impl AgentMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        conversation_id: impl Into<String>,
        message_type: MessageKind,
        payload: serde_json::Value,
        ttl: u64,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            sender: sender.into(),
            recipient: recipient.into(),
            conversation_id: conversation_id.into(),
            message_type,
            payload,
            metadata: MessageMetadata {
                priority: Priority::Normal,
                ttl,
                retry_count: 0,
            },
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// 是否为广播消息
    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST
    }

    /// TTL 是否已到期（投递时评估；ttl=0 视为立即过期）
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.metadata.ttl == 0 {
            return true;
        }
        let deadline = self.timestamp + chrono::Duration::seconds(self.metadata.ttl as i64);
        now >= deadline
    }

    /// 派生一条重试消息：新 ID、新时间戳、retry_count+1，会话与负载不变
    pub fn retry_of(&self) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            conversation_id: self.conversation_id.clone(),
            message_type: self.message_type,
            payload: self.payload.clone(),
            metadata: MessageMetadata {
                priority: self.metadata.priority,
                ttl: self.metadata.ttl,
                retry_count: self.metadata.retry_count + 1,
            },
        }
    }
}
