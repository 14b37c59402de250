//! 持久层抽象：表 + 键 → JSON 记录
//!
//! 记忆管理器只依赖这个最小接口；真实部署可接数据库，测试与默认
//! 配置用进程内实现。每个会话的轮次列表存成一条记录。

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// 持久层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// 键值式持久存储
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// 写入（同键覆盖）
    async fn insert(&self, table: &str, key: &str, record: serde_json::Value)
        -> Result<(), StoreError>;

    /// 读取，不存在返回 None
    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
}

/// 进程内实现
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert(
        &self,
        table: &str,
        key: &str,
        record: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }
}
