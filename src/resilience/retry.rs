//! 指数退避重试策略

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 重试策略：delay(n) = min(base · 2ⁿ, cap)，n 从 0 计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 首次退避（毫秒）
    pub base_delay_ms: u64,
    /// 退避上限（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次重试前的退避（attempt 从 0 计）
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// 已做 `retry_count` 次重试后是否还有预算
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
