//! 会话记录与会话表
//!
//! 会话在首条请求时创建；显式关闭或被闲置清扫关掉；升级对自动处理
//! 是终态。轮次正文在记忆层，这里只留有序的轮次 ID。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 会话 ID
pub type ConversationId = String;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Closed,
    Escalated,
}

/// 升级去向
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub target: String,
    pub reason: String,
}

/// 单个会话
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: String,
    pub status: ConversationStatus,
    /// 轮次 ID，按发生顺序
    pub turn_ids: Vec<String>,
    pub escalation: Option<Escalation>,
    pub created_at: Instant,
    pub last_active: Instant,
}

impl Conversation {
    fn new(user_id: &str) -> Self {
        Self {
            id: format!("conv_{}", uuid::Uuid::new_v4()),
            user_id: user_id.to_string(),
            status: ConversationStatus::Active,
            turn_ids: Vec::new(),
            escalation: None,
            created_at: Instant::now(),
            last_active: Instant::now(),
        }
    }

}

/// 会话表
pub struct ConversationStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    /// 用户当前活跃会话
    user_index: RwLock<HashMap<String, ConversationId>>,
    idle_timeout: Duration,
}

impl ConversationStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// 取用户的活跃会话，没有就建一个
    pub async fn get_or_create(&self, user_id: &str) -> ConversationId {
        // 锁序固定为 conversations → user_index，索引只做无锁下的快照查询
        let existing = self.user_index.read().await.get(user_id).cloned();
        if let Some(id) = existing {
            let mut conversations = self.conversations.write().await;
            if let Some(conv) = conversations.get_mut(&id) {
                if conv.status == ConversationStatus::Active {
                    conv.last_active = Instant::now();
                    return id;
                }
            }
        }

        let conv = Conversation::new(user_id);
        let id = conv.id.clone();
        tracing::debug!(conversation_id = %id, user_id = %user_id, "Created conversation");
        self.conversations.write().await.insert(id.clone(), conv);
        self.user_index
            .write()
            .await
            .insert(user_id.to_string(), id.clone());
        id
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    /// 追加一条轮次 ID 并刷新活跃时间
    pub async fn record_turn(&self, conversation_id: &str, turn_id: &str) {
        let mut conversations = self.conversations.write().await;
        if let Some(conv) = conversations.get_mut(conversation_id) {
            conv.turn_ids.push(turn_id.to_string());
            conv.last_active = Instant::now();
        }
    }

    /// 显式关闭
    pub async fn close(&self, conversation_id: &str) {
        let mut conversations = self.conversations.write().await;
        if let Some(conv) = conversations.get_mut(conversation_id) {
            conv.status = ConversationStatus::Closed;
            self.user_index.write().await.remove(&conv.user_id);
        }
    }

    /// 升级：终态，自动处理到此为止
    pub async fn escalate(&self, conversation_id: &str, target: &str, reason: &str) {
        let mut conversations = self.conversations.write().await;
        if let Some(conv) = conversations.get_mut(conversation_id) {
            conv.status = ConversationStatus::Escalated;
            conv.escalation = Some(Escalation {
                target: target.to_string(),
                reason: reason.to_string(),
            });
            self.user_index.write().await.remove(&conv.user_id);
            tracing::warn!(
                conversation_id = %conversation_id,
                target = %target,
                reason = %reason,
                "Conversation escalated"
            );
        }
    }

    /// 闲置清扫：关掉超时未活跃的会话；早已终态的闲置记录直接剔除。
    /// 返回本轮清扫到的会话 ID，调用方据此丢弃派生状态（锁、短期记忆）。
    pub async fn cleanup_idle(&self) -> Vec<ConversationId> {
        let mut conversations = self.conversations.write().await;
        let mut user_index = self.user_index.write().await;
        let timeout = self.idle_timeout;
        let mut swept = Vec::new();
        conversations.retain(|id, conv| {
            if conv.last_active.elapsed() <= timeout {
                return true;
            }
            swept.push(id.clone());
            match conv.status {
                ConversationStatus::Active => {
                    conv.status = ConversationStatus::Closed;
                    user_index.remove(&conv.user_id);
                    true
                }
                ConversationStatus::Closed | ConversationStatus::Escalated => false,
            }
        });
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "Swept idle conversations");
        }
        swept
    }

    pub async fn active_count(&self) -> usize {
        self.conversations
            .read()
            .await
            .values()
            .filter(|c| c.status == ConversationStatus::Active)
            .count()
    }
}
