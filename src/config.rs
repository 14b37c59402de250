//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEELINE__*` 覆盖
//! （双下划线表示嵌套，如 `BEELINE__RESILIENCE__FAILURE_THRESHOLD=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::resilience::{CircuitBreaker, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub bus: BusSection,
    pub pool: PoolSection,
    pub resilience: ResilienceSection,
    pub memory: MemorySection,
    pub orchestrator: OrchestratorSection,
}

/// [bus] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// 新消息的默认 TTL（秒）
    pub default_ttl_secs: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
        }
    }
}

/// [pool] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// 租用实例的等待上限（毫秒）
    pub acquire_timeout_ms: u64,
    /// 描述未指定时的池容量
    pub default_pool_size: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,
            default_pool_size: 2,
        }
    }
}

impl PoolSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// [resilience] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    /// 连续失败多少次熔断
    pub failure_threshold: u32,
    /// 熔断后多久放试探（秒）
    pub recovery_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
        }
    }
}

impl ResilienceSection {
    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.failure_threshold,
            Duration::from_secs(self.recovery_timeout_secs),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 短期记忆 TTL（秒）
    pub short_term_ttl_secs: u64,
    /// 每个会话短期保留的轮数上限
    pub short_term_max_turns: usize,
    /// 向量维度
    pub embedding_dimension: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_ttl_secs: 900,
            short_term_max_turns: 50,
            embedding_dimension: 32,
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 请求消息 TTL（秒）
    pub message_ttl_secs: u64,
    /// 等响应的窗口（秒）
    pub response_timeout_secs: u64,
    /// 会话闲置多久被清扫（秒）
    pub idle_timeout_secs: u64,
    pub escalation_target: String,
    pub default_workflow: String,
    /// 候选工作者选序：first / round_robin
    pub tie_break: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            message_ttl_secs: 30,
            response_timeout_secs: 30,
            idle_timeout_secs: 1_800,
            escalation_target: "human_review".to_string(),
            default_workflow: "customer_support".to_string(),
            tie_break: "first".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEELINE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEELINE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEELINE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
