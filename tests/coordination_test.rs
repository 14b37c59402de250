//! 协调层集成测试：总线 + 池 + 注册表 + 记忆 + 弹性 + 编排器全链路

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use beeline::audit::{AuditEvent, AuditKind, AuditSink};
use beeline::bus::{AgentMessage, MessageBus};
use beeline::llm::MockLlmService;
use beeline::memory::{HashEmbedder, InMemoryIndex, InMemoryStore, MemoryManager, ShortTermStore};
use beeline::orchestrator::{
    Classifier, ConversationStatus, ConversationStore, FastRule, Orchestrator, WorkflowPlan,
    WorkflowState,
};
use beeline::pool::WorkerPool;
use beeline::registry::{WorkerDescriptor, WorkerRegistry};
use beeline::resilience::{CircuitBreaker, CircuitPhase, ResilienceController, RetryPolicy};
use beeline::worker::{Worker, WorkerError, WorkerHost};

struct CollectingSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

#[async_trait]
impl AuditSink for CollectingSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().await.push(event);
    }
}

/// 成功校验，结果进入后续步骤的上下文
struct ValidateWorker;

#[async_trait]
impl Worker for ValidateWorker {
    fn worker_type(&self) -> &str {
        "validate"
    }

    async fn process(&self, _message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
        Ok(json!({"validated": true}))
    }
}

/// 每次调用都报瞬时失败，并记录看到的重试计数
struct FlakyWorker {
    worker_type: String,
    calls: Arc<AtomicUsize>,
    seen_retry_counts: Arc<StdMutex<Vec<u32>>>,
}

#[async_trait]
impl Worker for FlakyWorker {
    fn worker_type(&self) -> &str {
        &self.worker_type
    }

    async fn process(&self, message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_retry_counts
            .lock()
            .unwrap()
            .push(message.metadata.retry_count);
        Err(WorkerError::Transient("upstream timeout".to_string()))
    }
}

/// 备份路径：直接成功
struct BackupReviewWorker;

#[async_trait]
impl Worker for BackupReviewWorker {
    fn worker_type(&self) -> &str {
        "review_backup"
    }

    async fn process(&self, _message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
        Ok(json!({"review": "approved_by_backup"}))
    }
}

/// 检索步骤：断言前序步骤的结果已经穿进上下文
struct SearchWorker;

#[async_trait]
impl Worker for SearchWorker {
    fn worker_type(&self) -> &str {
        "search"
    }

    async fn process(&self, message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
        let context = &message.payload["context"];
        if context["validated"] != json!(true) {
            return Err(WorkerError::Failed(
                "context missing validation result".to_string(),
            ));
        }
        Ok(json!({"matches": ["aspirin 100mg"]}))
    }
}

struct Harness {
    bus: Arc<MessageBus>,
    pool: Arc<WorkerPool>,
    registry: Arc<WorkerRegistry>,
    resilience: Arc<ResilienceController>,
    conversations: Arc<ConversationStore>,
    audit_events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl Harness {
    fn new(retry: RetryPolicy, failure_threshold: u32) -> Self {
        Self {
            bus: Arc::new(MessageBus::new()),
            pool: Arc::new(WorkerPool::new(Duration::from_millis(100))),
            registry: Arc::new(WorkerRegistry::new()),
            resilience: Arc::new(ResilienceController::new(
                CircuitBreaker::new(failure_threshold, Duration::from_secs(60)),
                retry,
            )),
            conversations: Arc::new(ConversationStore::new(Duration::from_secs(60))),
            audit_events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn add_worker(&self, descriptor: WorkerDescriptor, instances: Vec<Arc<dyn Worker>>) {
        let worker_type = descriptor.worker_type.clone();
        self.registry.register(descriptor).await;
        self.pool.register(worker_type.clone(), instances).await;
        let host = Arc::new(WorkerHost::new(worker_type, self.pool.clone(), self.bus.clone()));
        host.start().await;
    }

    async fn orchestrator(&self, plan: WorkflowPlan, route_keyword: &str) -> Orchestrator {
        let memory = Arc::new(MemoryManager::new(
            Arc::new(ShortTermStore::new(Duration::from_secs(60), 50)),
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::default()),
            Arc::new(InMemoryIndex::new()),
        ));
        let classifier = Arc::new(Classifier::new(
            vec![FastRule {
                keywords: vec![route_keyword.to_string()],
                workflow: plan.name.clone(),
            }],
            Arc::new(MockLlmService::new()),
            vec![plan.name.clone()],
            plan.name.clone(),
        ));
        let orchestrator = Orchestrator::builder(
            self.bus.clone(),
            self.registry.clone(),
            self.resilience.clone(),
            memory,
            classifier,
        )
        .with_workflow(plan)
        .with_conversations(self.conversations.clone())
        .with_audit(Arc::new(CollectingSink {
            events: self.audit_events.clone(),
        }))
        .with_response_timeout(Duration::from_secs(2))
        .build();
        orchestrator.start().await;
        orchestrator
    }
}

/// 三步工作流：第二步主工作者连续两次瞬时失败，重试预算用尽后
/// 转移到备份成功，整条工作流完成，主工作者熔断计数为 2、仍闭合。
#[tokio::test]
async fn test_three_step_workflow_with_failover() {
    let harness = Harness::new(
        RetryPolicy {
            max_retries: 1,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        5,
    );
    let review_calls = Arc::new(AtomicUsize::new(0));
    let review_retry_counts = Arc::new(StdMutex::new(Vec::new()));

    harness
        .add_worker(WorkerDescriptor::new("validate", 1), vec![Arc::new(ValidateWorker)])
        .await;
    harness
        .add_worker(
            WorkerDescriptor::new("review", 1).with_backup("review_backup"),
            vec![Arc::new(FlakyWorker {
                worker_type: "review".to_string(),
                calls: review_calls.clone(),
                seen_retry_counts: review_retry_counts.clone(),
            })],
        )
        .await;
    harness
        .add_worker(
            WorkerDescriptor::new("review_backup", 1),
            vec![Arc::new(BackupReviewWorker)],
        )
        .await;
    harness
        .add_worker(WorkerDescriptor::new("search", 1), vec![Arc::new(SearchWorker)])
        .await;

    let plan = WorkflowPlan::builder("pharmacy_flow")
        .step("validate", "validate")
        .step("review", "review")
        .step("search", "search")
        .build();
    let orchestrator = harness.orchestrator(plan, "pharmacy").await;

    let outcome = orchestrator
        .handle_request("user_1", "pharmacy: is aspirin in stock?")
        .await;

    assert_eq!(outcome.state, WorkflowState::Completed);
    assert_eq!(outcome.result["validated"], true);
    assert_eq!(outcome.result["review"], "approved_by_backup");
    assert_eq!(outcome.result["step_search"]["matches"][0], "aspirin 100mg");

    // 主工作者恰好被打了两次（首次 + 一次重试），重试是 retry_count+1 的新消息
    assert_eq!(review_calls.load(Ordering::SeqCst), 2);
    assert_eq!(*review_retry_counts.lock().unwrap(), vec![0, 1]);
    let snapshot = orchestrator.circuit_snapshot("review");
    assert_eq!(snapshot.consecutive_failures, 2);
    assert_eq!(snapshot.phase, CircuitPhase::Closed);
    assert_eq!(snapshot.failure_threshold, 5);

    // 用户轮次 + 助手轮次都记在会话上
    let conv = orchestrator.conversation(&outcome.conversation_id).await.unwrap();
    assert_eq!(conv.status, ConversationStatus::Active);
    assert_eq!(conv.turn_ids.len(), 2);

    let completed = harness
        .audit_events
        .lock()
        .await
        .iter()
        .filter(|e| e.kind == AuditKind::WorkflowCompleted)
        .count();
    assert_eq!(completed, 1);
}

/// 合规违规：不重试，立刻升级，审计里有违规与升级两条记录
#[tokio::test]
async fn test_policy_violation_escalates() {
    struct RestrictedWorker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for RestrictedWorker {
        fn worker_type(&self) -> &str {
            "restricted"
        }

        async fn process(&self, _message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WorkerError::PolicyViolation(
                "prescription required".to_string(),
            ))
        }
    }

    let harness = Harness::new(RetryPolicy::default(), 5);
    let calls = Arc::new(AtomicUsize::new(0));
    harness
        .add_worker(
            WorkerDescriptor::new("restricted", 1).with_backup("restricted"),
            vec![Arc::new(RestrictedWorker { calls: calls.clone() })],
        )
        .await;

    let plan = WorkflowPlan::builder("controlled_flow")
        .step("dispense", "restricted")
        .build();
    let orchestrator = harness.orchestrator(plan, "oxycodone").await;

    let outcome = orchestrator.handle_request("user_1", "buy oxycodone").await;

    assert_eq!(outcome.state, WorkflowState::Escalated);
    assert_eq!(outcome.escalation.as_ref().unwrap().target, "human_review");
    // 配了备份也不转移
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let conv = orchestrator.conversation(&outcome.conversation_id).await.unwrap();
    assert_eq!(conv.status, ConversationStatus::Escalated);

    let events = harness.audit_events.lock().await;
    assert!(events.iter().any(|e| e.kind == AuditKind::PolicyViolation));
    assert!(events.iter().any(|e| e.kind == AuditKind::Escalation));
}

/// 校验失败：恰好一次带 strict 指令的重试，第二次成功
#[tokio::test]
async fn test_validation_failure_gets_one_strict_retry() {
    struct StrictAwareWorker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for StrictAwareWorker {
        fn worker_type(&self) -> &str {
            "formatter"
        }

        async fn process(&self, message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.payload["strict"] == json!(true) {
                Ok(json!({"formatted": true}))
            } else {
                Err(WorkerError::InvalidOutput("schema mismatch".to_string()))
            }
        }
    }

    let harness = Harness::new(RetryPolicy::default(), 5);
    let calls = Arc::new(AtomicUsize::new(0));
    harness
        .add_worker(
            WorkerDescriptor::new("formatter", 1),
            vec![Arc::new(StrictAwareWorker { calls: calls.clone() })],
        )
        .await;

    let plan = WorkflowPlan::builder("format_flow")
        .step("format", "formatter")
        .build();
    let orchestrator = harness.orchestrator(plan, "format").await;

    let outcome = orchestrator.handle_request("user_1", "format my order").await;
    assert_eq!(outcome.state, WorkflowState::Completed);
    assert_eq!(outcome.result["formatted"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// 连续失败到阈值后熔断：后续派发未接触工作者即被拒绝
#[tokio::test]
async fn test_circuit_opens_and_rejects() {
    struct BrokenWorker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for BrokenWorker {
        fn worker_type(&self) -> &str {
            "broken"
        }

        async fn process(&self, _message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WorkerError::Failed("crash".to_string()))
        }
    }

    let harness = Harness::new(
        RetryPolicy {
            max_retries: 0,
            base_delay_ms: 10,
            max_delay_ms: 10,
        },
        2,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    harness
        .add_worker(
            WorkerDescriptor::new("broken", 1),
            vec![Arc::new(BrokenWorker { calls: calls.clone() })],
        )
        .await;

    let plan = WorkflowPlan::builder("broken_flow").step("only", "broken").build();
    let orchestrator = harness.orchestrator(plan, "broken").await;

    // 没配备份：每次请求一次失败。两次后熔断。
    for _ in 0..2 {
        let outcome = orchestrator.handle_request("user_1", "broken request").await;
        assert_eq!(outcome.state, WorkflowState::Failed);
    }
    assert_eq!(orchestrator.circuit_snapshot("broken").phase, CircuitPhase::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // 熔断打开：请求失败但工作者没有被打到
    let outcome = orchestrator.handle_request("user_1", "broken request").await;
    assert_eq!(outcome.state, WorkflowState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // 失败会话不留在 active，带可读原因转人工
    let conv = orchestrator.conversation(&outcome.conversation_id).await.unwrap();
    assert_eq!(conv.status, ConversationStatus::Escalated);
    let escalation = conv.escalation.unwrap();
    assert_eq!(escalation.target, "human_review");
    assert!(!escalation.reason.is_empty());
}

/// 主类型熔断打开时，配置了备份的派发转移到备份而不是整步失败
#[tokio::test]
async fn test_open_circuit_fails_over_to_backup() {
    struct FragileWorker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for FragileWorker {
        fn worker_type(&self) -> &str {
            "fragile"
        }

        async fn process(&self, _message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WorkerError::Failed("crash".to_string()))
        }
    }

    struct StableWorker;

    #[async_trait]
    impl Worker for StableWorker {
        fn worker_type(&self) -> &str {
            "stable"
        }

        async fn process(&self, _message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
            Ok(json!({"handled_by": "stable"}))
        }
    }

    let harness = Harness::new(RetryPolicy::default(), 2);
    let calls = Arc::new(AtomicUsize::new(0));
    harness
        .add_worker(
            WorkerDescriptor::new("fragile", 1).with_backup("stable"),
            vec![Arc::new(FragileWorker { calls: calls.clone() })],
        )
        .await;
    harness
        .add_worker(WorkerDescriptor::new("stable", 1), vec![Arc::new(StableWorker)])
        .await;

    let plan = WorkflowPlan::builder("order_flow").step("handle", "fragile").build();
    let orchestrator = harness.orchestrator(plan, "order").await;

    // 前两次：主失败计入熔断并立即转移，备份完成
    for _ in 0..2 {
        let outcome = orchestrator.handle_request("user_1", "order refill").await;
        assert_eq!(outcome.state, WorkflowState::Completed);
        assert_eq!(outcome.result["handled_by"], "stable");
    }
    assert_eq!(orchestrator.circuit_snapshot("fragile").phase, CircuitPhase::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // 熔断打开：admit 被拒也照样走备份，主工作者不再被打到
    let outcome = orchestrator.handle_request("user_1", "order refill").await;
    assert_eq!(outcome.state, WorkflowState::Completed);
    assert_eq!(outcome.result["handled_by"], "stable");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// 池耗尽：容量 1、等待超时后以容量失败收场，不重试
#[tokio::test]
async fn test_pool_exhaustion_surfaces() {
    struct SlowWorker;

    #[async_trait]
    impl Worker for SlowWorker {
        fn worker_type(&self) -> &str {
            "slow"
        }

        async fn process(&self, _message: &AgentMessage) -> Result<serde_json::Value, WorkerError> {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(json!({"done": true}))
        }
    }

    let harness = Harness::new(RetryPolicy::default(), 5);
    harness
        .add_worker(WorkerDescriptor::new("slow", 1), vec![Arc::new(SlowWorker)])
        .await;

    let plan = WorkflowPlan::builder("slow_flow").step("only", "slow").build();
    let orchestrator = Arc::new(harness.orchestrator(plan, "slow").await);

    // 两个会话同时打同一个容量为 1 的池；租用等待上限 100ms
    let a = {
        let orch = orchestrator.clone();
        tokio::spawn(async move { orch.handle_request("user_a", "slow job").await })
    };
    let b = {
        let orch = orchestrator.clone();
        tokio::spawn(async move { orch.handle_request("user_b", "slow job").await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    let mut states = vec![a.state, b.state];
    states.sort_by_key(|s| format!("{}", s));
    assert!(states.contains(&WorkflowState::Completed));
    assert!(states.contains(&WorkflowState::Failed));
}

/// 完成后的会话历史能从记忆层读回来
#[tokio::test]
async fn test_history_after_completion() {
    let harness = Harness::new(RetryPolicy::default(), 5);
    harness
        .add_worker(WorkerDescriptor::new("validate", 1), vec![Arc::new(ValidateWorker)])
        .await;

    let plan = WorkflowPlan::builder("quick_flow")
        .step("validate", "validate")
        .build();
    let orchestrator = harness.orchestrator(plan, "quick").await;

    let outcome = orchestrator.handle_request("user_1", "quick check").await;
    assert_eq!(outcome.state, WorkflowState::Completed);

    let history = orchestrator
        .conversation_history(&outcome.conversation_id, 10)
        .await
        .unwrap();
    assert!(history.len() >= 2);
    // 短期层最近在前：助手轮次先于用户轮次
    assert_eq!(history[0].role, "assistant");
    assert_eq!(history[1].role, "user");
}
