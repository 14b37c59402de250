//! Beeline - 对话式任务路由平台的智能体协调层
//!
//! 模块划分：
//! - **bus**: 消息总线（主题发布 / 订阅、TTL、总线事件）
//! - **pool**: 工作者实例池（公平租用、租约归还）
//! - **registry**: 工作者类型注册表（能力描述、故障转移目标）
//! - **worker**: Worker trait 与总线侧宿主
//! - **memory**: 分层记忆（短期 / 持久 / 相似度）
//! - **resilience**: 熔断、退避重试、失败裁决
//! - **orchestrator**: 会话、工作流状态机、分类路由、编排引擎
//! - **llm**: LLM 服务抽象与 Mock
//! - **audit**: 审计事件落地
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod audit;
pub mod bus;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod worker;

pub use error::CoordError;
pub use orchestrator::{Orchestrator, WorkflowOutcome};
