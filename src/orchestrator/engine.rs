//! 编排引擎
//!
//! 驱动工作流状态机：received → classified → dispatched → awaiting_result →
//! aggregated →（下一步 | completed），escalated / failed 随时可达。
//! 同一会话持有一把互斥锁，步骤严格串行；响应按会话路由回来，
//! 用请求消息 ID 做对账。失败交给弹性控制器裁决。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::audit::{AuditEvent, AuditKind, AuditSink, LogAuditSink};
use crate::bus::{
    request_topic, AgentMessage, MessageBus, MessageHandler, MessageKind, Priority, RESPONSE_TOPIC,
};
use crate::error::CoordError;
use crate::memory::{MemoryManager, Turn};
use crate::registry::WorkerRegistry;
use crate::resilience::{CircuitSnapshot, ResilienceController, Verdict};

use super::classify::Classifier;
use super::conversation::{ConversationId, ConversationStore, Escalation};
use super::workflow::{aggregate, AggregationRule, WorkflowPlan, WorkflowRun, WorkflowState};

/// 同一步骤多个候选工作者时的选序策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// 按描述顺序（默认）
    First,
    /// 轮转起点
    RoundRobin,
}

/// 一次请求的最终结果
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub conversation_id: ConversationId,
    pub state: WorkflowState,
    pub result: Value,
    pub escalation: Option<Escalation>,
}

/// 一次派发的终止方式（聚合之外的短路路径）
enum StepFailure {
    Escalate { reason: String, error: CoordError },
    Fail { error: CoordError },
}

type PendingMap = Arc<Mutex<HashMap<ConversationId, mpsc::UnboundedSender<AgentMessage>>>>;

/// 把响应主题上的消息按会话转发给等待中的工作流
struct ResponseRouter {
    pending: PendingMap,
}

#[async_trait]
impl MessageHandler for ResponseRouter {
    async fn handle(&self, message: AgentMessage) -> Result<(), String> {
        let pending = self.pending.lock().await;
        if let Some(tx) = pending.get(&message.conversation_id) {
            let _ = tx.send(message);
        } else {
            tracing::debug!(
                conversation_id = %message.conversation_id,
                "Response for conversation with no waiter, dropping"
            );
        }
        Ok(())
    }
}

/// 编排器
pub struct Orchestrator {
    bus: Arc<MessageBus>,
    registry: Arc<WorkerRegistry>,
    resilience: Arc<ResilienceController>,
    memory: Arc<MemoryManager>,
    conversations: Arc<ConversationStore>,
    classifier: Arc<Classifier>,
    audit: Arc<dyn AuditSink>,
    workflows: HashMap<String, WorkflowPlan>,
    pending: PendingMap,
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
    tie_break: TieBreak,
    round_robin: AtomicUsize,
    message_ttl: u64,
    response_timeout: Duration,
    escalation_target: String,
}

impl Orchestrator {
    pub fn builder(
        bus: Arc<MessageBus>,
        registry: Arc<WorkerRegistry>,
        resilience: Arc<ResilienceController>,
        memory: Arc<MemoryManager>,
        classifier: Arc<Classifier>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(bus, registry, resilience, memory, classifier)
    }

    /// 挂到总线上：订阅响应主题
    pub async fn start(&self) {
        let router = Arc::new(ResponseRouter {
            pending: self.pending.clone(),
        });
        self.bus.subscribe(RESPONSE_TOPIC, router).await;
    }

    /// 处理一条用户请求，走完整个工作流
    pub async fn handle_request(&self, user_id: &str, text: &str) -> WorkflowOutcome {
        let conversation_id = self.conversations.get_or_create(user_id).await;
        let lock = self.conversation_lock(&conversation_id).await;
        let _guard = lock.lock().await;

        // 用户轮次先落记忆
        let turn = Turn::new("user", text);
        self.conversations
            .record_turn(&conversation_id, &turn.turn_id)
            .await;
        if let Err(e) = self.memory.store_turn(&conversation_id, turn).await {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "Failed to persist user turn"
            );
        }

        // 会话挂上响应通道，工作流结束即拆除
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(conversation_id.clone(), tx);
        let outcome = self.run_workflow(&conversation_id, text, &mut rx).await;
        self.pending.lock().await.remove(&conversation_id);

        outcome
    }

    async fn run_workflow(
        &self,
        conversation_id: &str,
        text: &str,
        rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    ) -> WorkflowOutcome {
        let decision = self.classifier.classify(text).await;
        tracing::info!(
            conversation_id = %conversation_id,
            workflow = %decision.workflow,
            reasoning = %decision.reasoning,
            "Request classified"
        );

        let Some(plan) = self.workflows.get(&decision.workflow).cloned() else {
            return self
                .fail(
                    conversation_id,
                    WorkflowState::Received,
                    format!("no plan registered for workflow '{}'", decision.workflow),
                )
                .await;
        };

        let mut context = json!({ "input": text });
        if let (Value::Object(ctx), Value::Object(extra)) =
            (&mut context, &decision.context_to_pass)
        {
            for (k, v) in extra {
                ctx.insert(k.clone(), v.clone());
            }
        }
        let mut run = WorkflowRun::new(plan, context);
        if let Err(e) = run.advance(WorkflowState::Classified) {
            return self.fail(conversation_id, run.state, e.to_string()).await;
        }

        while let Some(step) = run.current_step().cloned() {
            for next in [WorkflowState::Dispatched, WorkflowState::AwaitingResult] {
                if let Err(e) = run.advance(next) {
                    return self.fail(conversation_id, run.state, e.to_string()).await;
                }
            }

            let mut outcomes = Vec::new();
            for worker_type in self.ordered_workers(&step.worker_types) {
                let payload = json!({
                    "step": step.name,
                    "context": run.context,
                });
                match self
                    .dispatch_with_resilience(
                        conversation_id,
                        &worker_type,
                        payload,
                        decision.priority,
                        rx,
                    )
                    .await
                {
                    Ok(data) => {
                        outcomes.push(Ok(data));
                        if step.aggregation == AggregationRule::FirstSuccess {
                            break;
                        }
                    }
                    Err(StepFailure::Escalate { reason, error }) => {
                        return self
                            .escalate(conversation_id, &worker_type, &reason, &error)
                            .await;
                    }
                    Err(StepFailure::Fail { error }) => outcomes.push(Err(error)),
                }
            }

            if let Err(e) = run.advance(WorkflowState::Aggregated) {
                return self.fail(conversation_id, run.state, e.to_string()).await;
            }
            match aggregate(step.aggregation, outcomes) {
                Ok(result) => {
                    run.merge_step_result(&step.name, &result);
                    run.step_index += 1;
                }
                Err(e) => {
                    return self.fail(conversation_id, run.state, e.to_string()).await;
                }
            }
        }

        if let Err(e) = run.advance(WorkflowState::Completed) {
            return self.fail(conversation_id, run.state, e.to_string()).await;
        }

        // 结果作为助手轮次写回记忆
        let summary = run.context.to_string();
        let turn = Turn::new("assistant", summary);
        self.conversations
            .record_turn(conversation_id, &turn.turn_id)
            .await;
        if let Err(e) = self.memory.store_turn(conversation_id, turn).await {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "Failed to persist assistant turn"
            );
        }

        self.audit
            .record(AuditEvent::new(
                AuditKind::WorkflowCompleted,
                conversation_id,
                format!("workflow '{}' completed", run.plan.name),
            ))
            .await;

        WorkflowOutcome {
            conversation_id: conversation_id.to_string(),
            state: WorkflowState::Completed,
            result: run.context,
            escalation: None,
        }
    }

    /// 带弹性裁决的派发循环：熔断检查 → 发请求 → 等响应 → 按裁决走向
    async fn dispatch_with_resilience(
        &self,
        conversation_id: &str,
        initial_worker: &str,
        payload: Value,
        priority: Priority,
        rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    ) -> Result<Value, StepFailure> {
        let mut worker_type = initial_worker.to_string();
        let mut retry_count = 0u32;
        let mut strict = false;
        let mut stricter_used = false;
        let mut failed_over = false;
        // 重试是上一条请求派生的新消息；换目标或改指令时重新构造
        let mut retry_request: Option<AgentMessage> = None;

        loop {
            if self.registry.resolve(&worker_type).await.is_err() {
                return Err(StepFailure::Fail {
                    error: CoordError::UnknownWorkerType(worker_type),
                });
            }
            if !self.registry.accepts(&worker_type, MessageKind::Request).await {
                tracing::error!(
                    worker_type = %worker_type,
                    "Worker type does not accept request messages"
                );
                return Err(StepFailure::Fail {
                    error: CoordError::Unclassified(format!(
                        "worker '{}' does not accept request messages",
                        worker_type
                    )),
                });
            }

            let error = if let Err(rejected) = self.resilience.admit(&worker_type) {
                rejected
            } else {
                let request = match retry_request.take() {
                    Some(request) => request,
                    None => {
                        let mut payload = payload.clone();
                        if strict {
                            payload["strict"] = json!(true);
                        }
                        let mut request = AgentMessage::new(
                            "orchestrator",
                            worker_type.clone(),
                            conversation_id,
                            MessageKind::Request,
                            payload,
                            self.message_ttl,
                        )
                        .with_priority(priority);
                        request.metadata.retry_count = retry_count;
                        request
                    }
                };

                let request_id = request.message_id.clone();
                let sent = request.clone();
                self.bus.publish(&request_topic(&worker_type), request).await;

                match self.await_response(&request_id, rx).await {
                    Ok(data) => {
                        self.resilience.record_success(&worker_type);
                        return Ok(data);
                    }
                    Err(e) => {
                        retry_request = Some(sent.retry_of());
                        e
                    }
                }
            };

            let backup = if failed_over {
                None
            } else {
                self.registry.backup_of(&worker_type).await
            };
            let verdict = self.resilience.on_failure(
                &worker_type,
                &error,
                retry_count,
                backup.as_deref(),
                stricter_used,
            );
            match verdict {
                Verdict::Retry { delay } => {
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Verdict::Failover { backup } => {
                    tracing::warn!(
                        from = %worker_type,
                        to = %backup,
                        conversation_id = %conversation_id,
                        "Failing over to backup worker"
                    );
                    worker_type = backup;
                    retry_count = 0;
                    strict = false;
                    failed_over = true;
                    retry_request = None;
                }
                Verdict::RetryStricter => {
                    strict = true;
                    stricter_used = true;
                    retry_request = None;
                }
                Verdict::Escalate { reason } => {
                    return Err(StepFailure::Escalate { reason, error });
                }
                Verdict::Fail { reason } => {
                    tracing::warn!(
                        worker_type = %worker_type,
                        conversation_id = %conversation_id,
                        reason = %reason,
                        "Dispatch failed"
                    );
                    return Err(StepFailure::Fail { error });
                }
            }
        }
    }

    /// 等待对账的响应；TTL 窗口内没等到按瞬时失败处理
    async fn await_response(
        &self,
        request_id: &str,
        rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    ) -> Result<Value, CoordError> {
        loop {
            let message = tokio::time::timeout(self.response_timeout, rx.recv())
                .await
                .map_err(|_| {
                    CoordError::Transient(format!("no response for message '{}'", request_id))
                })?
                .ok_or_else(|| {
                    CoordError::Unclassified("response channel closed".to_string())
                })?;

            if message.payload.get("in_reply_to").and_then(|v| v.as_str()) != Some(request_id) {
                // 早先重试的迟到响应，丢弃继续等
                tracing::debug!(message_id = %message.message_id, "Stale response, ignoring");
                continue;
            }
            return match message.message_type {
                MessageKind::Response => {
                    Ok(message.payload.get("data").cloned().unwrap_or(Value::Null))
                }
                MessageKind::Error => {
                    let code = message
                        .payload
                        .get("code")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unclassified");
                    let detail = message
                        .payload
                        .get("detail")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    Err(CoordError::from_code(code, detail))
                }
                _ => continue,
            };
        }
    }

    async fn escalate(
        &self,
        conversation_id: &str,
        worker_type: &str,
        reason: &str,
        error: &CoordError,
    ) -> WorkflowOutcome {
        self.conversations
            .escalate(conversation_id, &self.escalation_target, reason)
            .await;

        if matches!(error, CoordError::PolicyViolation(_)) {
            self.audit
                .record(
                    AuditEvent::new(AuditKind::PolicyViolation, conversation_id, error.to_string())
                        .with_worker(worker_type),
                )
                .await;
        }
        self.audit
            .record(
                AuditEvent::new(AuditKind::Escalation, conversation_id, reason)
                    .with_worker(worker_type),
            )
            .await;

        WorkflowOutcome {
            conversation_id: conversation_id.to_string(),
            state: WorkflowState::Escalated,
            result: json!({ "reason": reason }),
            escalation: Some(Escalation {
                target: self.escalation_target.clone(),
                reason: reason.to_string(),
            }),
        }
    }

    async fn fail(
        &self,
        conversation_id: &str,
        from_state: WorkflowState,
        reason: String,
    ) -> WorkflowOutcome {
        tracing::warn!(
            conversation_id = %conversation_id,
            state = %from_state,
            reason = %reason,
            "Workflow failed"
        );
        // 自动处理到此为止：失败会话交给人工，带可读原因
        self.conversations
            .escalate(conversation_id, &self.escalation_target, &reason)
            .await;
        self.audit
            .record(AuditEvent::new(
                AuditKind::WorkflowFailed,
                conversation_id,
                reason.clone(),
            ))
            .await;
        WorkflowOutcome {
            conversation_id: conversation_id.to_string(),
            state: WorkflowState::Failed,
            result: json!({ "error": reason }),
            escalation: None,
        }
    }

    /// 候选工作者排序：First 保持描述顺序，RoundRobin 轮转起点
    fn ordered_workers(&self, worker_types: &[String]) -> Vec<String> {
        match self.tie_break {
            TieBreak::First => worker_types.to_vec(),
            TieBreak::RoundRobin => {
                if worker_types.is_empty() {
                    return Vec::new();
                }
                let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % worker_types.len();
                let mut ordered = Vec::with_capacity(worker_types.len());
                for i in 0..worker_types.len() {
                    ordered.push(worker_types[(start + i) % worker_types.len()].clone());
                }
                ordered
            }
        }
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 会话状态查询
    pub async fn conversation(&self, conversation_id: &str) -> Option<super::conversation::Conversation> {
        self.conversations.get(conversation_id).await
    }

    /// 会话历史（记忆层合并视图）
    pub async fn conversation_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, crate::memory::StoreError> {
        self.memory.retrieve_context(conversation_id, "", limit).await
    }

    /// 某工作者类型的熔断快照
    pub fn circuit_snapshot(&self, worker_type: &str) -> CircuitSnapshot {
        self.resilience.snapshot(worker_type)
    }

    /// 闲置清扫：关会话、丢弃其短期记忆与会话锁
    pub async fn sweep_idle(&self) -> usize {
        let swept = self.conversations.cleanup_idle().await;
        if !swept.is_empty() {
            let mut locks = self.locks.lock().await;
            for conversation_id in &swept {
                locks.remove(conversation_id);
            }
        }
        for conversation_id in &swept {
            self.memory.forget_short_term(conversation_id).await;
        }
        swept.len()
    }
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    bus: Arc<MessageBus>,
    registry: Arc<WorkerRegistry>,
    resilience: Arc<ResilienceController>,
    memory: Arc<MemoryManager>,
    classifier: Arc<Classifier>,
    conversations: Option<Arc<ConversationStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    workflows: HashMap<String, WorkflowPlan>,
    tie_break: TieBreak,
    message_ttl: u64,
    response_timeout: Duration,
    escalation_target: String,
}

impl OrchestratorBuilder {
    pub fn new(
        bus: Arc<MessageBus>,
        registry: Arc<WorkerRegistry>,
        resilience: Arc<ResilienceController>,
        memory: Arc<MemoryManager>,
        classifier: Arc<Classifier>,
    ) -> Self {
        Self {
            bus,
            registry,
            resilience,
            memory,
            classifier,
            conversations: None,
            audit: None,
            workflows: HashMap::new(),
            tie_break: TieBreak::First,
            message_ttl: 30,
            response_timeout: Duration::from_secs(30),
            escalation_target: "human_review".to_string(),
        }
    }

    pub fn with_workflow(mut self, plan: WorkflowPlan) -> Self {
        self.workflows.insert(plan.name.clone(), plan);
        self
    }

    pub fn with_conversations(mut self, conversations: Arc<ConversationStore>) -> Self {
        self.conversations = Some(conversations);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// 请求消息 TTL（秒），也是响应等待窗口的默认来源
    pub fn with_message_ttl(mut self, ttl: u64) -> Self {
        self.message_ttl = ttl;
        self.response_timeout = Duration::from_secs(ttl);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_escalation_target(mut self, target: impl Into<String>) -> Self {
        self.escalation_target = target.into();
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            bus: self.bus,
            registry: self.registry,
            resilience: self.resilience,
            memory: self.memory,
            conversations: self
                .conversations
                .unwrap_or_else(|| Arc::new(ConversationStore::new(Duration::from_secs(1800)))),
            classifier: self.classifier,
            audit: self.audit.unwrap_or_else(|| Arc::new(LogAuditSink)),
            workflows: self.workflows,
            pending: Arc::new(Mutex::new(HashMap::new())),
            locks: Mutex::new(HashMap::new()),
            tie_break: self.tie_break,
            round_robin: AtomicUsize::new(0),
            message_ttl: self.message_ttl,
            response_timeout: self.response_timeout,
            escalation_target: self.escalation_target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmService;
    use crate::memory::{HashEmbedder, InMemoryIndex, InMemoryStore, ShortTermStore};
    use crate::orchestrator::classify::FastRule;
    use crate::resilience::{CircuitBreaker, RetryPolicy};

    fn minimal_builder() -> OrchestratorBuilder {
        let bus = Arc::new(MessageBus::new());
        let registry = Arc::new(WorkerRegistry::new());
        let resilience = Arc::new(ResilienceController::new(
            CircuitBreaker::new(5, Duration::from_secs(60)),
            RetryPolicy::default(),
        ));
        let memory = Arc::new(MemoryManager::new(
            Arc::new(ShortTermStore::new(Duration::from_secs(60), 50)),
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::default()),
            Arc::new(InMemoryIndex::new()),
        ));
        let classifier = Arc::new(Classifier::new(
            vec![FastRule {
                keywords: vec!["hi".to_string()],
                workflow: "chat".to_string(),
            }],
            Arc::new(MockLlmService::new()),
            vec!["chat".to_string()],
            "chat",
        ));
        Orchestrator::builder(bus, registry, resilience, memory, classifier)
    }

    fn minimal_orchestrator(tie_break: TieBreak) -> Orchestrator {
        minimal_builder().with_tie_break(tie_break).build()
    }

    #[test]
    fn test_ordered_workers_first_keeps_order() {
        let orch = minimal_orchestrator(TieBreak::First);
        let types: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(orch.ordered_workers(&types), types);
        assert_eq!(orch.ordered_workers(&types), types);
    }

    #[test]
    fn test_ordered_workers_round_robin_rotates() {
        let orch = minimal_orchestrator(TieBreak::RoundRobin);
        let types: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(orch.ordered_workers(&types), vec!["a", "b", "c"]);
        assert_eq!(orch.ordered_workers(&types), vec!["b", "c", "a"]);
        assert_eq!(orch.ordered_workers(&types), vec!["c", "a", "b"]);
        assert_eq!(orch.ordered_workers(&types), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unknown_plan_fails_cleanly() {
        // 分类器会给出 "chat"，但没有注册任何同名计划
        let orch = minimal_orchestrator(TieBreak::First);
        orch.start().await;
        let outcome = orch.handle_request("user_1", "hi there").await;
        assert_eq!(outcome.state, WorkflowState::Failed);

        // 失败会话不留在 active，交人工收尾
        let conv = orch.conversation(&outcome.conversation_id).await.unwrap();
        assert_eq!(conv.status, crate::orchestrator::ConversationStatus::Escalated);
        assert!(!conv.escalation.unwrap().reason.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_idle_prunes_conversation_locks() {
        let orch = minimal_builder()
            .with_conversations(Arc::new(ConversationStore::new(Duration::from_millis(10))))
            .build();
        orch.start().await;

        let outcome = orch.handle_request("user_1", "hi there").await;
        assert!(orch.locks.lock().await.contains_key(&outcome.conversation_id));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(orch.sweep_idle().await, 1);
        assert!(!orch.locks.lock().await.contains_key(&outcome.conversation_id));
    }
}
