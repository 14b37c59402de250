//! 消息总线：按主题发布 / 订阅
//!
//! 每个订阅持有一条 FIFO 通道与一个独立的投递任务：publish 在消息进入所有
//! 订阅通道后即返回，实际投递异步进行（至少一次）。同一主题内按发布顺序投递，
//! 因此同一会话的消息天然保序。TTL 在投递时评估，过期消息不投递，
//! 以 MessageExpired 事件浮出；处理器报错被捕获记录，不影响其他订阅者。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};

use super::message::AgentMessage;

/// 订阅 ID
pub type SubscriptionId = String;

/// 消息处理器：每条投递的消息调用一次
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: AgentMessage) -> Result<(), String>;
}

/// 总线事件：过期丢弃与处理器错误都以事件浮出，供观测与测试
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// 消息在投递时已过期，被丢弃
    MessageExpired {
        topic: String,
        message_id: String,
        conversation_id: String,
    },
    /// 某个订阅的处理器返回错误（不影响其他订阅者）
    HandlerError {
        topic: String,
        subscription_id: String,
        message_id: String,
        error: String,
    },
}

/// 单个订阅：FIFO 发送端，投递任务持有接收端
struct Subscription {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<AgentMessage>,
}

/// 消息总线
pub struct MessageBus {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    events: broadcast::Sender<BusEvent>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            topics: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 订阅总线事件流（MessageExpired / HandlerError）
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// 注册处理器，返回订阅 ID；处理器对该主题之后的每条消息被调用，直到退订
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionId {
        let topic = topic.into();
        let id = format!("sub_{}", uuid::Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentMessage>();

        let events = self.events.clone();
        let task_topic = topic.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if msg.is_expired(Utc::now()) {
                    tracing::debug!(
                        topic = %task_topic,
                        message_id = %msg.message_id,
                        "Dropping expired message"
                    );
                    let _ = events.send(BusEvent::MessageExpired {
                        topic: task_topic.clone(),
                        message_id: msg.message_id.clone(),
                        conversation_id: msg.conversation_id.clone(),
                    });
                    continue;
                }
                let message_id = msg.message_id.clone();
                if let Err(e) = handler.handle(msg).await {
                    tracing::warn!(
                        topic = %task_topic,
                        subscription = %task_id,
                        error = %e,
                        "Handler error"
                    );
                    let _ = events.send(BusEvent::HandlerError {
                        topic: task_topic.clone(),
                        subscription_id: task_id.clone(),
                        message_id,
                        error: e,
                    });
                }
            }
        });

        self.topics
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(Subscription { id: id.clone(), tx });

        id
    }

    /// 退订：移除订阅并结束其投递任务
    pub async fn unsubscribe(&self, topic: &str, subscription_id: &str) {
        let mut topics = self.topics.write().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != subscription_id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// 发布消息：进入所有当前订阅者的通道后返回，返回接收该消息的订阅数
    pub async fn publish(&self, topic: &str, message: AgentMessage) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let topics = self.topics.read().await;
            if let Some(subs) = topics.get(topic) {
                for sub in subs {
                    if sub.tx.send(message.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(sub.id.clone());
                    }
                }
            }
        }

        // 投递任务已退出的订阅顺手清掉
        for id in dead {
            self.unsubscribe(topic, &id).await;
        }

        delivered
    }

    /// 某主题当前订阅数
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 通道式处理器：把投递的消息原样转发到 mpsc，供编排器与测试消费
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<AgentMessage>,
}

impl ChannelHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AgentMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: AgentMessage) -> Result<(), String> {
        self.tx
            .send(message)
            .map_err(|_| "channel receiver dropped".to_string())
    }
}
