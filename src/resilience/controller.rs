//! 弹性控制器：失败分类 → 处置裁决
//!
//! 编排器把每次派发失败交给这里，拿回一个 Verdict：原地退避重试、
//! 转移到备份类型、一次更严格指令的重试、升级人工，或终止。
//! 熔断计数也在这里记——裁决与计数必须看到同一份事实。

use std::time::Duration;

use crate::error::CoordError;

use super::breaker::{CircuitBreaker, CircuitSnapshot};
use super::retry::RetryPolicy;

/// 失败处置裁决
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 退避后对同一工作者类型重试
    Retry { delay: Duration },
    /// 立即改派备份类型
    Failover { backup: String },
    /// 对同一类型做一次带严格指令的重试
    RetryStricter,
    /// 升级到人工处理
    Escalate { reason: String },
    /// 终止本次派发
    Fail { reason: String },
}

/// 弹性控制器
pub struct ResilienceController {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ResilienceController {
    pub fn new(breaker: CircuitBreaker, retry: RetryPolicy) -> Self {
        Self { breaker, retry }
    }

    /// 派发前的熔断检查
    pub fn admit(&self, worker_type: &str) -> Result<(), CoordError> {
        self.breaker.admit(worker_type)
    }

    /// 成功闭环：熔断计数清零
    pub fn record_success(&self, worker_type: &str) {
        self.breaker.record_success(worker_type);
    }

    /// 熔断状态快照
    pub fn snapshot(&self, worker_type: &str) -> CircuitSnapshot {
        self.breaker.snapshot(worker_type)
    }

    /// 对一次失败做出裁决。
    ///
    /// `retry_count` 是此前已做的重试次数；`backup` 是注册表里配置的
    /// 转移目标；`stricter_used` 表示严格重试是否已经用过一次。
    pub fn on_failure(
        &self,
        worker_type: &str,
        error: &CoordError,
        retry_count: u32,
        backup: Option<&str>,
        stricter_used: bool,
    ) -> Verdict {
        let verdict = match error {
            // 瞬时失败计入熔断并退避重试；预算耗尽再考虑转移
            CoordError::Transient(_) | CoordError::MessageExpired(_) => {
                self.breaker.record_failure(worker_type);
                if self.retry.allows(retry_count) {
                    Verdict::Retry {
                        delay: self.retry.delay(retry_count),
                    }
                } else if let Some(backup) = backup {
                    Verdict::Failover {
                        backup: backup.to_string(),
                    }
                } else {
                    Verdict::Fail {
                        reason: format!("retries exhausted for '{}'", worker_type),
                    }
                }
            }
            // 工作者失败计入熔断，有备份立即转移
            CoordError::WorkerFailure(detail) => {
                self.breaker.record_failure(worker_type);
                if let Some(backup) = backup {
                    Verdict::Failover {
                        backup: backup.to_string(),
                    }
                } else {
                    Verdict::Fail {
                        reason: format!("worker '{}' failed: {}", worker_type, detail),
                    }
                }
            }
            // 校验失败允许恰好一次严格重试。不计入熔断，但要结清
            // 可能在飞的 half_open 试探，否则后续 admit 全被拒。
            CoordError::ValidationFailure(detail) => {
                self.breaker.release_trial(worker_type);
                if stricter_used {
                    Verdict::Escalate {
                        reason: format!("output validation failed twice: {}", detail),
                    }
                } else {
                    Verdict::RetryStricter
                }
            }
            // 合规违规绝不重试
            CoordError::PolicyViolation(detail) => {
                self.breaker.release_trial(worker_type);
                Verdict::Escalate {
                    reason: format!("policy violation: {}", detail),
                }
            }
            // 容量不足原样上浮，控制器不替它重试
            CoordError::PoolExhausted(t) => {
                self.breaker.release_trial(worker_type);
                Verdict::Fail {
                    reason: format!("worker pool exhausted for '{}'", t),
                }
            }
            // 主类型熔断打开：有备份就转移（拒绝不算主类型的失败），没有才终止
            CoordError::CircuitOpen(t) => {
                if let Some(backup) = backup {
                    Verdict::Failover {
                        backup: backup.to_string(),
                    }
                } else {
                    Verdict::Fail {
                        reason: format!("circuit open for '{}'", t),
                    }
                }
            }
            CoordError::UnknownWorkerType(t) => {
                self.breaker.release_trial(worker_type);
                Verdict::Fail {
                    reason: format!("unknown worker type '{}'", t),
                }
            }
            CoordError::Unclassified(detail) => {
                self.breaker.release_trial(worker_type);
                Verdict::Escalate {
                    reason: format!("unclassified failure: {}", detail),
                }
            }
        };

        tracing::info!(
            worker_type = %worker_type,
            error = %error,
            retry_count,
            verdict = ?verdict,
            "Resilience verdict"
        );
        verdict
    }
}
