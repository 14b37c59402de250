//! 弹性层：熔断、退避重试、失败裁决

pub mod breaker;
pub mod controller;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitPhase, CircuitSnapshot};
pub use controller::{ResilienceController, Verdict};
pub use retry::RetryPolicy;
