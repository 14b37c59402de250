//! 编排层：会话、工作流、分类、引擎

pub mod classify;
pub mod conversation;
pub mod engine;
pub mod workflow;

pub use classify::{Classifier, FastRule, RoutingDecision};
pub use conversation::{Conversation, ConversationId, ConversationStatus, ConversationStore, Escalation};
pub use engine::{Orchestrator, OrchestratorBuilder, TieBreak, WorkflowOutcome};
pub use workflow::{
    aggregate, AggregationRule, WorkflowPlan, WorkflowPlanBuilder, WorkflowRun, WorkflowState,
    WorkflowStep,
};
