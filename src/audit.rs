//! 审计事件落地
//!
//! 升级、合规违规、工作流完成这类事件发给 AuditSink，发出即返回，
//! 落地失败不影响主流程。默认实现写结构化日志。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 审计事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Escalation,
    PolicyViolation,
    WorkflowCompleted,
    WorkflowFailed,
}

/// 一条审计记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub conversation_id: String,
    pub worker_type: Option<String>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, conversation_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            conversation_id: conversation_id.into(),
            worker_type: None,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = Some(worker_type.into());
        self
    }
}

/// 审计落地点（发后不管）
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// 结构化日志实现
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) {
        tracing::info!(
            kind = ?event.kind,
            conversation_id = %event.conversation_id,
            worker_type = event.worker_type.as_deref().unwrap_or("-"),
            detail = %event.detail,
            "Audit event"
        );
    }
}
