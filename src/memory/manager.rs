//! 记忆管理器：短期 / 持久 / 相似度三层的统一入口
//!
//! 写入：短期与持久层都成功才算成功，相似度索引尽力而为（失败记警告）。
//! 读取：短期近况（过期则透明回落持久层）与相似度命中并集，按轮次 ID 去重，
//! 同一存储状态下结果确定。

use std::sync::Arc;

use serde_json::json;

use super::durable::{DurableStore, StoreError};
use super::short_term::ShortTermStore;
use super::similarity::{Embedder, SimilarityIndex};
use super::Turn;

/// 持久层里会话轮次列表所在的表
const TURNS_TABLE: &str = "conversation_turns";

pub struct MemoryManager {
    short: Arc<ShortTermStore>,
    durable: Arc<dyn DurableStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn SimilarityIndex>,
}

impl MemoryManager {
    pub fn new(
        short: Arc<ShortTermStore>,
        durable: Arc<dyn DurableStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn SimilarityIndex>,
    ) -> Self {
        Self {
            short,
            durable,
            embedder,
            index,
        }
    }

    /// 写入一轮对话。短期 + 持久必须成功；相似度失败只降级检索质量。
    pub async fn store_turn(&self, conversation_id: &str, turn: Turn) -> Result<(), StoreError> {
        self.short.push(conversation_id, turn.clone()).await;

        // 每个会话一条记录，追加轮次列表（编排器保证同会话串行写）
        let mut turns = match self.durable.read(TURNS_TABLE, conversation_id).await? {
            Some(serde_json::Value::Array(turns)) => turns,
            _ => Vec::new(),
        };
        turns.push(serde_json::to_value(&turn).map_err(|e| StoreError::Serialization(e.to_string()))?);
        self.durable
            .insert(TURNS_TABLE, conversation_id, serde_json::Value::Array(turns))
            .await?;

        let vector = self.embedder.embed(&turn.content);
        if let Err(e) = self
            .index
            .upsert(&turn.turn_id, vector, json!(&turn))
            .await
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                turn_id = %turn.turn_id,
                error = %e,
                "Similarity indexing failed, retrieval quality degraded"
            );
        }
        Ok(())
    }

    /// 检索上下文：近期轮次（新的在前）+ 相似命中，去重后拼接。
    /// 短期层为空时透明回落到持久层取最近轮次。
    pub async fn retrieve_context(
        &self,
        conversation_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        let mut recent = self.short.recent(conversation_id, limit).await;
        if recent.is_empty() {
            recent = self.durable_recent(conversation_id, limit).await?;
        }

        let mut result = recent;
        let mut seen: Vec<String> = result.iter().map(|t| t.turn_id.clone()).collect();

        let hits = self
            .index
            .search(&self.embedder.embed(query), limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Similarity search failed, returning recents only");
                Vec::new()
            });
        for hit in hits {
            if seen.iter().any(|id| *id == hit.id) {
                continue;
            }
            match serde_json::from_value::<Turn>(hit.metadata) {
                Ok(turn) => {
                    seen.push(turn.turn_id.clone());
                    result.push(turn);
                }
                Err(e) => {
                    tracing::warn!(id = %hit.id, error = %e, "Skipping malformed index entry");
                }
            }
        }
        Ok(result)
    }

    async fn durable_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        let Some(serde_json::Value::Array(values)) =
            self.durable.read(TURNS_TABLE, conversation_id).await?
        else {
            return Ok(Vec::new());
        };
        let mut turns = Vec::new();
        for value in values.into_iter().rev().take(limit) {
            match serde_json::from_value::<Turn>(value) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %e,
                        "Skipping malformed durable turn"
                    );
                }
            }
        }
        Ok(turns)
    }

    /// 会话关闭时丢弃短期缓存（持久层与索引保留）
    pub async fn forget_short_term(&self, conversation_id: &str) {
        self.short.forget(conversation_id).await;
    }
}
