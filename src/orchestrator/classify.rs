//! 请求分类与路由
//!
//! 三级：规则快速匹配（不动 LLM）→ LLM 结构化路由 → 配置的兜底工作流。
//! LLM 输出不合法或指向未知工作流时一律落到兜底，分类永远给出答案。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::Priority;
use crate::llm::LlmService;

/// 路由结论
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// 目标工作流名
    pub workflow: String,
    pub reasoning: String,
    #[serde(default)]
    pub priority: Priority,
    /// 分类阶段就能确定、要带进工作流的上下文
    #[serde(default)]
    pub context_to_pass: serde_json::Value,
}

/// 快速匹配规则：任一关键词命中即路由
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastRule {
    pub keywords: Vec<String>,
    pub workflow: String,
}

/// 分类器
pub struct Classifier {
    rules: Vec<FastRule>,
    llm: Arc<dyn LlmService>,
    /// 允许路由到的工作流名（LLM 输出要过这道校验）
    known_workflows: Vec<String>,
    default_workflow: String,
}

impl Classifier {
    pub fn new(
        rules: Vec<FastRule>,
        llm: Arc<dyn LlmService>,
        known_workflows: Vec<String>,
        default_workflow: impl Into<String>,
    ) -> Self {
        Self {
            rules,
            llm,
            known_workflows,
            default_workflow: default_workflow.into(),
        }
    }

    /// 分类一条用户输入；必然返回一个已知工作流
    pub async fn classify(&self, text: &str) -> RoutingDecision {
        if let Some(decision) = self.fast_match(text) {
            return decision;
        }
        match self.llm_route(text).await {
            Some(decision) => decision,
            None => self.fallback("no reliable routing signal"),
        }
    }

    /// 规则快速匹配：大小写不敏感的关键词包含
    fn fast_match(&self, text: &str) -> Option<RoutingDecision> {
        let lowered = text.to_lowercase();
        for rule in &self.rules {
            if rule.keywords.iter().any(|k| lowered.contains(&k.to_lowercase())) {
                tracing::debug!(workflow = %rule.workflow, "Fast-match routing hit");
                return Some(RoutingDecision {
                    workflow: rule.workflow.clone(),
                    reasoning: "keyword match".to_string(),
                    priority: Priority::Normal,
                    context_to_pass: json!({}),
                });
            }
        }
        None
    }

    /// LLM 结构化路由
    async fn llm_route(&self, text: &str) -> Option<RoutingDecision> {
        let schema = json!({
            "type": "object",
            "properties": {
                "target_workflow": { "type": "string", "enum": self.known_workflows },
                "reasoning": { "type": "string" },
                "priority": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                "context_to_pass": { "type": "object" }
            },
            "required": ["target_workflow", "reasoning"]
        });
        let prompt = format!(
            "Route the user request to one of the workflows: {}.\n\
             Respond with JSON only.\n\nUser request: {}",
            self.known_workflows.join(", "),
            text
        );

        let value = match self.llm.generate(&prompt, &[], Some(&schema)).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "LLM routing failed, using default workflow");
                return None;
            }
        };

        let workflow = value.get("target_workflow")?.as_str()?.to_string();
        if !self.known_workflows.contains(&workflow) {
            tracing::warn!(workflow = %workflow, "LLM routed to unknown workflow");
            return None;
        }
        let priority = value
            .get("priority")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();
        Some(RoutingDecision {
            workflow,
            reasoning: value
                .get("reasoning")
                .and_then(|r| r.as_str())
                .unwrap_or("llm routing")
                .to_string(),
            priority,
            context_to_pass: value.get("context_to_pass").cloned().unwrap_or(json!({})),
        })
    }

    fn fallback(&self, reason: &str) -> RoutingDecision {
        RoutingDecision {
            workflow: self.default_workflow.clone(),
            reasoning: reason.to_string(),
            priority: Priority::Normal,
            context_to_pass: json!({}),
        }
    }
}
