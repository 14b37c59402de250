//! 协调层错误分类
//!
//! 与 ResilienceController 配合：根据 CoordError 决定重试 / 故障转移 / 升级 / 终止。

use thiserror::Error;

/// 协调层运行过程中可能出现的错误（瞬时、工作者、校验、合规、容量、熔断等）
#[derive(Error, Debug, Clone)]
pub enum CoordError {
    /// 网络 / 超时类瞬时失败，可退避重试
    #[error("transient failure: {0}")]
    Transient(String),

    /// 工作者自身出错，计入熔断并尝试故障转移
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// 输出未通过 schema / 安全校验，允许一次更严格指令的重试
    #[error("output validation failed: {0}")]
    ValidationFailure(String),

    /// 合规 / 安全违规，不重试，直接升级并审计
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// 工作者池耗尽（容量失败，控制器不重试）
    #[error("worker pool exhausted for '{0}'")]
    PoolExhausted(String),

    /// 熔断器打开，未接触工作者即拒绝
    #[error("circuit open for '{0}'")]
    CircuitOpen(String),

    /// 注册表中不存在该工作者类型
    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),

    /// 消息 TTL 到期
    #[error("message expired: {0}")]
    MessageExpired(String),

    #[error("unclassified failure: {0}")]
    Unclassified(String),
}

impl CoordError {
    /// 错误码（写入总线 error 消息的 payload，对端据此重新分类）
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::Transient(_) => "transient",
            CoordError::WorkerFailure(_) => "worker_failure",
            CoordError::ValidationFailure(_) => "validation_failure",
            CoordError::PolicyViolation(_) => "policy_violation",
            CoordError::PoolExhausted(_) => "pool_exhausted",
            CoordError::CircuitOpen(_) => "circuit_open",
            CoordError::UnknownWorkerType(_) => "unknown_worker_type",
            CoordError::MessageExpired(_) => "message_expired",
            CoordError::Unclassified(_) => "unclassified",
        }
    }

    /// 从错误码还原分类（总线对端）
    pub fn from_code(code: &str, detail: &str) -> Self {
        let detail = detail.to_string();
        match code {
            "transient" => CoordError::Transient(detail),
            "worker_failure" => CoordError::WorkerFailure(detail),
            "validation_failure" => CoordError::ValidationFailure(detail),
            "policy_violation" => CoordError::PolicyViolation(detail),
            "pool_exhausted" => CoordError::PoolExhausted(detail),
            "circuit_open" => CoordError::CircuitOpen(detail),
            "unknown_worker_type" => CoordError::UnknownWorkerType(detail),
            "message_expired" => CoordError::MessageExpired(detail),
            _ => CoordError::Unclassified(detail),
        }
    }
}
