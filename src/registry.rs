//! 工作者注册表
//!
//! 记录每种工作者类型的静态描述：接受的消息种类、可用工具、池容量、
//! 重试策略名与故障转移目标。实例通过依赖注入传递，没有全局注册表。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bus::MessageKind;
use crate::error::CoordError;

/// 工作者类型描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// 类型名（注册表键）
    pub worker_type: String,
    /// 人读描述
    #[serde(default)]
    pub description: String,
    /// 接受的消息种类
    pub accepted_kinds: Vec<MessageKind>,
    /// 该类型可调用的工具名
    #[serde(default)]
    pub tools: Vec<String>,
    /// 池容量
    pub pool_size: usize,
    /// 重试策略名（缺省用全局策略）
    #[serde(default)]
    pub retry_policy: Option<String>,
    /// 故障转移目标类型
    #[serde(default)]
    pub backup_worker_type: Option<String>,
}

impl WorkerDescriptor {
    pub fn new(worker_type: impl Into<String>, pool_size: usize) -> Self {
        Self {
            worker_type: worker_type.into(),
            description: String::new(),
            accepted_kinds: vec![MessageKind::Request],
            tools: Vec::new(),
            pool_size,
            retry_policy: None,
            backup_worker_type: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_backup(mut self, backup: impl Into<String>) -> Self {
        self.backup_worker_type = Some(backup.into());
        self
    }
}

/// 注册表：类型名 → 描述
pub struct WorkerRegistry {
    descriptors: RwLock<HashMap<String, WorkerDescriptor>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: RwLock::new(HashMap::new()),
        }
    }

    /// 登记一个类型；同名覆盖并记录警告
    pub async fn register(&self, descriptor: WorkerDescriptor) {
        let mut map = self.descriptors.write().await;
        if map.contains_key(&descriptor.worker_type) {
            tracing::warn!(
                worker_type = %descriptor.worker_type,
                "Overwriting existing worker descriptor"
            );
        }
        map.insert(descriptor.worker_type.clone(), descriptor);
    }

    /// 查找类型描述
    pub async fn resolve(&self, worker_type: &str) -> Result<WorkerDescriptor, CoordError> {
        self.descriptors
            .read()
            .await
            .get(worker_type)
            .cloned()
            .ok_or_else(|| CoordError::UnknownWorkerType(worker_type.to_string()))
    }

    /// 该类型是否接受某种消息
    pub async fn accepts(&self, worker_type: &str, kind: MessageKind) -> bool {
        self.descriptors
            .read()
            .await
            .get(worker_type)
            .map(|d| d.accepted_kinds.contains(&kind))
            .unwrap_or(false)
    }

    /// 故障转移目标（已注册才返回）
    pub async fn backup_of(&self, worker_type: &str) -> Option<String> {
        let map = self.descriptors.read().await;
        let backup = map.get(worker_type)?.backup_worker_type.clone()?;
        if map.contains_key(&backup) {
            Some(backup)
        } else {
            tracing::warn!(
                worker_type = %worker_type,
                backup = %backup,
                "Backup worker type is not registered"
            );
            None
        }
    }

    /// 全部已注册的类型名
    pub async fn worker_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.descriptors.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
