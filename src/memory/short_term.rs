//! 短期记忆：按会话缓存近期轮次，TTL 过期即不可见
//!
//! 读路径永不返回已过期条目；物理清理在写入与读取时顺带进行。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::Turn;

/// 短期轮次缓存
pub struct ShortTermStore {
    ttl: Duration,
    max_turns: usize,
    entries: RwLock<HashMap<String, VecDeque<(Instant, Turn)>>>,
}

impl ShortTermStore {
    pub fn new(ttl: Duration, max_turns: usize) -> Self {
        Self {
            ttl,
            max_turns,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 写入一轮；顺带清掉该会话的过期轮次，超出上限丢最旧的
    pub async fn push(&self, conversation_id: &str, turn: Turn) {
        let mut entries = self.entries.write().await;
        let queue = entries.entry(conversation_id.to_string()).or_default();
        let now = Instant::now();
        queue.retain(|(at, _)| now.duration_since(*at) < self.ttl);
        queue.push_back((now, turn));
        while queue.len() > self.max_turns {
            queue.pop_front();
        }
    }

    /// 最近的至多 `limit` 轮，新的在前；过期条目一律不返回
    pub async fn recent(&self, conversation_id: &str, limit: usize) -> Vec<Turn> {
        let entries = self.entries.read().await;
        let Some(queue) = entries.get(conversation_id) else {
            return Vec::new();
        };
        let now = Instant::now();
        queue
            .iter()
            .rev()
            .filter(|(at, _)| now.duration_since(*at) < self.ttl)
            .take(limit)
            .map(|(_, turn)| turn.clone())
            .collect()
    }

    /// 该会话是否还有未过期的轮次
    pub async fn has_live(&self, conversation_id: &str) -> bool {
        let entries = self.entries.read().await;
        let Some(queue) = entries.get(conversation_id) else {
            return false;
        };
        let now = Instant::now();
        queue.iter().any(|(at, _)| now.duration_since(*at) < self.ttl)
    }

    /// 丢弃某会话的全部缓存（会话关闭时调用）
    pub async fn forget(&self, conversation_id: &str) {
        self.entries.write().await.remove(conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(id: &str, content: &str) -> Turn {
        Turn {
            turn_id: id.to_string(),
            role: "user".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_recent_is_most_recent_first() {
        let store = ShortTermStore::new(Duration::from_secs(60), 10);
        store.push("conv_1", turn("t1", "a")).await;
        store.push("conv_1", turn("t2", "b")).await;
        store.push("conv_1", turn("t3", "c")).await;

        let recent = store.recent("conv_1", 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].turn_id, "t3");
        assert_eq!(recent[1].turn_id, "t2");
    }

    #[tokio::test]
    async fn test_expired_turns_invisible() {
        let store = ShortTermStore::new(Duration::from_millis(20), 10);
        store.push("conv_1", turn("t1", "a")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.recent("conv_1", 5).await.is_empty());
        assert!(!store.has_live("conv_1").await);
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let store = ShortTermStore::new(Duration::from_secs(60), 2);
        store.push("conv_1", turn("t1", "a")).await;
        store.push("conv_1", turn("t2", "b")).await;
        store.push("conv_1", turn("t3", "c")).await;

        let recent = store.recent("conv_1", 5).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].turn_id, "t3");
    }
}
