//! LLM 服务抽象
//!
//! 分类器与工作者通过 LlmService 调用模型：prompt + 工具描述 + 期望的响应
//! schema。真实后端在部署侧注入；自带的 Mock 按脚本应答，供测试与离线环境。

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// LLM 调用失败
#[derive(Error, Debug)]
pub enum LlmFailure {
    #[error("llm transport error: {0}")]
    Transport(String),

    #[error("llm returned malformed output: {0}")]
    Malformed(String),
}

/// 暴露给模型的工具描述（function-calling 形状）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema 形式的参数说明
    pub parameters: serde_json::Value,
}

/// LLM 服务：返回结构化 JSON
#[async_trait]
pub trait LlmService: Send + Sync {
    /// `response_schema` 给出时，实现方要求模型按该 schema 输出
    async fn generate(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
        response_schema: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, LlmFailure>;
}

/// 脚本化 Mock：按入队顺序吐出预置应答，耗尽后报传输错误
pub struct MockLlmService {
    responses: Mutex<VecDeque<Result<serde_json::Value, String>>>,
}

impl MockLlmService {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn enqueue(&self, response: serde_json::Value) {
        self.responses.lock().await.push_back(Ok(response));
    }

    pub async fn enqueue_error(&self, error: impl Into<String>) {
        self.responses.lock().await.push_back(Err(error.into()));
    }
}

impl Default for MockLlmService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn generate(
        &self,
        _prompt: &str,
        _tools: &[ToolSpec],
        _response_schema: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, LlmFailure> {
        match self.responses.lock().await.pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(LlmFailure::Transport(e)),
            None => Err(LlmFailure::Transport("mock responses exhausted".to_string())),
        }
    }
}
