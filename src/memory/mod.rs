//! 分层记忆：短期缓存、持久存储、相似度检索

pub mod durable;
pub mod manager;
pub mod short_term;
pub mod similarity;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use durable::{DurableStore, InMemoryStore, StoreError};
pub use manager::MemoryManager;
pub use short_term::ShortTermStore;
pub use similarity::{Embedder, HashEmbedder, InMemoryIndex, SimilarityHit, SimilarityIndex};

/// 一轮对话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// 轮次 ID（记忆三层共用的去重键）
    pub turn_id: String,
    /// 角色（user / assistant / worker 类型名）
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            turn_id: format!("turn_{}", uuid::Uuid::new_v4()),
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}
