//! 按工作者类型的熔断器
//!
//! 显式三态：closed → open（连续失败到阈值）→ half_open（恢复窗口后放行
//! 恰好一次试探）→ closed / open。全部状态在单把互斥锁内读改写。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CoordError;

/// 熔断相位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

/// 对外快照（编排器与测试只读这个）
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
}

struct CircuitCell {
    phase: CircuitPhase,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitCell {
    fn new() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// 熔断器：一个实例管所有工作者类型
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    cells: Mutex<HashMap<String, CircuitCell>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn with_cell<T>(&self, worker_type: &str, f: impl FnOnce(&mut CircuitCell) -> T) -> T {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let cell = cells
            .entry(worker_type.to_string())
            .or_insert_with(CircuitCell::new);
        f(cell)
    }

    /// 派发前询问：closed 放行；open 到点转 half_open 并放行一次试探，
    /// 否则拒绝；half_open 已有试探在飞也拒绝。
    pub fn admit(&self, worker_type: &str) -> Result<(), CoordError> {
        let recovery_timeout = self.recovery_timeout;
        self.with_cell(worker_type, |cell| match cell.phase {
            CircuitPhase::Closed => Ok(()),
            CircuitPhase::Open => {
                let elapsed = cell
                    .opened_at
                    .map(|at| at.elapsed() >= recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    cell.phase = CircuitPhase::HalfOpen;
                    cell.trial_in_flight = true;
                    tracing::info!(worker_type = %worker_type, "Circuit half-open, admitting trial");
                    Ok(())
                } else {
                    Err(CoordError::CircuitOpen(worker_type.to_string()))
                }
            }
            CircuitPhase::HalfOpen => {
                if cell.trial_in_flight {
                    Err(CoordError::CircuitOpen(worker_type.to_string()))
                } else {
                    cell.trial_in_flight = true;
                    Ok(())
                }
            }
        })
    }

    /// 成功：回 closed，失败计数清零
    pub fn record_success(&self, worker_type: &str) {
        self.with_cell(worker_type, |cell| {
            if cell.phase != CircuitPhase::Closed {
                tracing::info!(worker_type = %worker_type, "Circuit closed after successful trial");
            }
            cell.phase = CircuitPhase::Closed;
            cell.consecutive_failures = 0;
            cell.opened_at = None;
            cell.trial_in_flight = false;
        });
    }

    /// 失败：计数 +1；closed 到阈值转 open，half_open 的试探失败重新 open 并重置计时
    pub fn record_failure(&self, worker_type: &str) {
        let threshold = self.failure_threshold;
        self.with_cell(worker_type, |cell| {
            cell.consecutive_failures += 1;
            match cell.phase {
                CircuitPhase::Closed => {
                    if cell.consecutive_failures >= threshold {
                        cell.phase = CircuitPhase::Open;
                        cell.opened_at = Some(Instant::now());
                        tracing::warn!(
                            worker_type = %worker_type,
                            failures = cell.consecutive_failures,
                            "Circuit opened"
                        );
                    }
                }
                CircuitPhase::HalfOpen => {
                    cell.phase = CircuitPhase::Open;
                    cell.opened_at = Some(Instant::now());
                    cell.trial_in_flight = false;
                    tracing::warn!(worker_type = %worker_type, "Trial failed, circuit re-opened");
                }
                CircuitPhase::Open => {}
            }
        });
    }

    /// 试探以不计入熔断的失败收场（校验、容量等）：留在 half_open，
    /// 释放名额让下一次 admit 再放行一次试探
    pub fn release_trial(&self, worker_type: &str) {
        self.with_cell(worker_type, |cell| {
            if cell.phase == CircuitPhase::HalfOpen && cell.trial_in_flight {
                cell.trial_in_flight = false;
                tracing::debug!(worker_type = %worker_type, "Trial released without health verdict");
            }
        });
    }

    pub fn snapshot(&self, worker_type: &str) -> CircuitSnapshot {
        let threshold = self.failure_threshold;
        self.with_cell(worker_type, |cell| CircuitSnapshot {
            phase: cell.phase,
            consecutive_failures: cell.consecutive_failures,
            failure_threshold: threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.record_failure("w");
        }
        assert_eq!(breaker.snapshot("w").phase, CircuitPhase::Closed);
        assert!(breaker.admit("w").is_ok());

        breaker.record_failure("w");
        assert_eq!(breaker.snapshot("w").phase, CircuitPhase::Open);
        assert!(matches!(breaker.admit("w"), Err(CoordError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure("w");
        breaker.record_failure("w");
        breaker.record_success("w");
        assert_eq!(breaker.snapshot("w").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure("w");
        assert!(breaker.admit("w").is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;
        // 恢复窗口过后放行恰好一次
        assert!(breaker.admit("w").is_ok());
        assert_eq!(breaker.snapshot("w").phase, CircuitPhase::HalfOpen);
        assert!(breaker.admit("w").is_err());

        breaker.record_success("w");
        assert_eq!(breaker.snapshot("w").phase, CircuitPhase::Closed);
        assert!(breaker.admit("w").is_ok());
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(30));
        breaker.record_failure("w");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.admit("w").is_ok());
        breaker.record_failure("w");

        assert_eq!(breaker.snapshot("w").phase, CircuitPhase::Open);
        assert!(breaker.admit("w").is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.admit("w").is_ok());
    }

    #[tokio::test]
    async fn test_released_trial_admits_another() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure("w");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.admit("w").is_ok());
        assert!(breaker.admit("w").is_err());

        // 试探没给出健康判定：名额释放后立刻可以再试，不用等恢复窗口
        breaker.release_trial("w");
        assert_eq!(breaker.snapshot("w").phase, CircuitPhase::HalfOpen);
        assert!(breaker.admit("w").is_ok());
        assert!(breaker.admit("w").is_err());
    }

    #[test]
    fn test_types_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("a");
        assert!(breaker.admit("a").is_err());
        assert!(breaker.admit("b").is_ok());
    }
}
