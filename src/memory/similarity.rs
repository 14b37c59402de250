//! 相似度检索层：向量化 + 索引
//!
//! 排序指标（余弦）藏在 SimilarityIndex 后面，换指标或接外部索引
//! 不影响记忆管理器。自带的哈希向量化器是确定性的，供测试与离线环境。

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::durable::StoreError;

/// 文本向量化
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
    fn dimension(&self) -> usize;
}

/// 检索命中
#[derive(Debug, Clone)]
pub struct SimilarityHit {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

/// 相似度索引
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// 写入或覆盖一条向量
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// 返回至多 `limit` 条命中，分数降序；同分按 id 升序，结果确定
    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SimilarityHit>, StoreError>;
}

/// 确定性哈希向量化器：同一文本永远同一向量
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(32)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let slot = (h as usize) % self.dimension;
            // 符号位也从哈希取，避免全部堆成正向
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// 进程内余弦索引
pub struct InMemoryIndex {
    entries: RwLock<HashMap<String, (Vec<f32>, serde_json::Value)>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(id.to_string(), (vector, metadata));
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SimilarityHit>, StoreError> {
        let entries = self.entries.read().await;
        let mut hits: Vec<SimilarityHit> = entries
            .iter()
            .map(|(id, (v, metadata))| SimilarityHit {
                id: id.clone(),
                score: cosine_similarity(vector, v),
                metadata: metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
