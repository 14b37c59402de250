//! 工作流定义与运行态
//!
//! 计划（WorkflowPlan）是静态的步骤序列；运行态（WorkflowRun）带着
//! 状态机位置和跨步骤累积的上下文。聚合规则决定一步里多个工作者
//! 的结果如何收拢。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CoordError;

/// 工作流状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Received,
    Classified,
    Dispatched,
    AwaitingResult,
    Aggregated,
    Completed,
    Escalated,
    Failed,
}

impl WorkflowState {
    /// 终态不再迁移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Escalated | WorkflowState::Failed
        )
    }

    /// 合法迁移表；escalated / failed 可从任何活跃状态进入
    pub fn may_advance_to(&self, next: WorkflowState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, WorkflowState::Escalated | WorkflowState::Failed) {
            return true;
        }
        matches!(
            (self, next),
            (WorkflowState::Received, WorkflowState::Classified)
                | (WorkflowState::Classified, WorkflowState::Dispatched)
                | (WorkflowState::Dispatched, WorkflowState::AwaitingResult)
                | (WorkflowState::AwaitingResult, WorkflowState::Aggregated)
                | (WorkflowState::Aggregated, WorkflowState::Dispatched)
                | (WorkflowState::Aggregated, WorkflowState::Completed)
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Received => "received",
            WorkflowState::Classified => "classified",
            WorkflowState::Dispatched => "dispatched",
            WorkflowState::AwaitingResult => "awaiting_result",
            WorkflowState::Aggregated => "aggregated",
            WorkflowState::Completed => "completed",
            WorkflowState::Escalated => "escalated",
            WorkflowState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// 一步里多个工作者结果的聚合规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationRule {
    /// 第一个成功即为步骤结果
    FirstSuccess,
    /// 过半成功才算成功
    Majority,
    /// 全部成功才算成功
    AllRequired,
}

/// 工作流中的一步
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    /// 本步候选 / 参与的工作者类型
    pub worker_types: Vec<String>,
    pub aggregation: AggregationRule,
}

/// 静态工作流计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowPlan {
    pub fn builder(name: impl Into<String>) -> WorkflowPlanBuilder {
        WorkflowPlanBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }
}

/// 计划构建器
pub struct WorkflowPlanBuilder {
    name: String,
    steps: Vec<WorkflowStep>,
}

impl WorkflowPlanBuilder {
    /// 单工作者步骤
    pub fn step(self, name: impl Into<String>, worker_type: impl Into<String>) -> Self {
        self.step_with(name, vec![worker_type.into()], AggregationRule::FirstSuccess)
    }

    /// 多工作者步骤，指定聚合规则
    pub fn step_with(
        mut self,
        name: impl Into<String>,
        worker_types: Vec<String>,
        aggregation: AggregationRule,
    ) -> Self {
        self.steps.push(WorkflowStep {
            name: name.into(),
            worker_types,
            aggregation,
        });
        self
    }

    pub fn build(self) -> WorkflowPlan {
        WorkflowPlan {
            name: self.name,
            steps: self.steps,
        }
    }
}

/// 工作流运行态
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub plan: WorkflowPlan,
    pub state: WorkflowState,
    pub step_index: usize,
    /// 跨步骤累积的上下文（JSON 对象；每步结果并入其中）
    pub context: Value,
}

impl WorkflowRun {
    pub fn new(plan: WorkflowPlan, initial_context: Value) -> Self {
        let context = if initial_context.is_object() {
            initial_context
        } else {
            json!({ "input": initial_context })
        };
        Self {
            plan,
            state: WorkflowState::Received,
            step_index: 0,
            context,
        }
    }

    /// 状态迁移；非法迁移是编排器的 bug，记错误并拒绝
    pub fn advance(&mut self, next: WorkflowState) -> Result<(), CoordError> {
        if !self.state.may_advance_to(next) {
            return Err(CoordError::Unclassified(format!(
                "illegal workflow transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// 把一步的结果并入累积上下文
    pub fn merge_step_result(&mut self, step_name: &str, result: &Value) {
        if let Value::Object(map) = &mut self.context {
            if let Value::Object(fields) = result {
                for (k, v) in fields {
                    map.insert(k.clone(), v.clone());
                }
            }
            map.insert(format!("step_{}", step_name), result.clone());
        }
    }

    pub fn current_step(&self) -> Option<&WorkflowStep> {
        self.plan.steps.get(self.step_index)
    }
}

/// 按规则聚合一步的各工作者结果。
/// 输入按工作者顺序排列；输出是步骤结果或步骤级失败。
pub fn aggregate(
    rule: AggregationRule,
    outcomes: Vec<Result<Value, CoordError>>,
) -> Result<Value, CoordError> {
    let total = outcomes.len();
    let mut oks = Vec::new();
    let mut first_err = None;
    for outcome in outcomes {
        match outcome {
            Ok(v) => oks.push(v),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    match rule {
        AggregationRule::FirstSuccess => oks.into_iter().next().ok_or_else(|| {
            first_err.unwrap_or_else(|| CoordError::Unclassified("empty step".to_string()))
        }),
        AggregationRule::Majority => {
            if oks.len() * 2 > total {
                Ok(json!({ "results": oks }))
            } else {
                Err(first_err.unwrap_or_else(|| {
                    CoordError::WorkerFailure("majority not reached".to_string())
                }))
            }
        }
        AggregationRule::AllRequired => {
            if let Some(e) = first_err {
                Err(e)
            } else {
                Ok(json!({ "results": oks }))
            }
        }
    }
}
