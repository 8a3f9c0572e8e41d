//! Append-only memory of turns, teachings and reflections, with
//! hashed bag-of-words retrieval.

use blake3::Hasher;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::advisor::normalize_tags;
use crate::error::{CouncilError, Result};
use crate::learning::{OutcomeSignal, SignalSource};
use crate::router::RoutingDecision;
use crate::settings::MemoryConfig;
use crate::topics::TopicExtractor;

pub mod backend;
pub use backend::{ArchiveReceipt, InMemoryBackend, MemoryBackend, SledBackend};

/// Weight added per shared tag when scoring a teaching.
const TAG_BONUS: f32 = 0.25;

/// One routed request with its final outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub request_id: Uuid,
    pub request: String,
    pub response: String,
    pub decision: RoutingDecision,
    pub outcome: OutcomeSignal,
    pub timestamp: DateTime<Utc>,
    /// Teachings handed to the advisors for this turn.
    #[serde(default)]
    pub teachings_used: Vec<Uuid>,
}

/// Explicit instruction taught by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Teaching {
    pub id: Uuid,
    pub topic: String,
    pub instruction: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Teaching {
    pub fn new(topic: &str, instruction: &str, tags: &[String]) -> Self {
        let topic = topic.trim().to_lowercase();
        let mut all = vec![topic.clone()];
        all.extend(tags.iter().cloned());
        Self {
            id: Uuid::new_v4(),
            topic,
            instruction: instruction.trim().to_string(),
            tags: normalize_tags(all),
            created_at: Utc::now(),
        }
    }

    fn searchable(&self) -> String {
        format!("{} {} {}", self.topic, self.instruction, self.tags.join(" "))
    }
}

/// Self-reflection on how a request went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub request_id: Uuid,
    pub signal: OutcomeSignal,
    pub source: SignalSource,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Everything the store persists. Externally tagged so it stays readable by
/// non-self-describing codecs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemoryRecord {
    Turn(MemoryTurn),
    Teaching(Teaching),
    Reflection(Reflection),
}

/// Context handed to advisors alongside the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievedContext {
    pub teachings: Vec<Teaching>,
    pub turns: Vec<MemoryTurn>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.teachings.is_empty() && self.turns.is_empty()
    }

    /// Plain-text rendering, one item per line.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.teachings.len() + self.turns.len());
        for teaching in &self.teachings {
            lines.push(format!("teaching ({}): {}", teaching.topic, teaching.instruction));
        }
        for turn in &self.turns {
            let answer = turn.response.lines().next().unwrap_or("").trim();
            lines.push(format!("earlier: {} -> {}", turn.request.trim(), answer));
        }
        lines.join("\n")
    }
}

/// How often a teaching was handed to advisors, and how often that turn
/// ended in success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeachingUsage {
    pub uses: usize,
    pub helpful: usize,
}

/// Memory statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub turns: usize,
    pub teachings: usize,
    pub reflections: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cached_embeddings: usize,
    pub embedding_dim: usize,
    pub similarity_threshold: f32,
}

/// Memory store over a [`MemoryBackend`].
///
/// Appends are serialized by a single async writer lock so they land in the
/// backend and the in-process mirror in the same order. Reads only touch the
/// mirror and never mutate retrieval-relevant state. Embeddings are kept in
/// a bounded LRU cache.
pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    writer: Mutex<()>,
    records: RwLock<Vec<MemoryRecord>>,
    embeddings: SyncMutex<LruCache<String, Arc<Vec<f32>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    config: MemoryConfig,
}

impl MemoryStore {
    /// Open a store, loading whatever the backend already holds.
    pub async fn open(backend: Arc<dyn MemoryBackend>, config: MemoryConfig) -> Result<Self> {
        let records = backend.load().await?;
        info!("Memory store loaded {} records", records.len());
        let capacity = NonZeroUsize::new(config.embedding_cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            backend,
            writer: Mutex::new(()),
            records: RwLock::new(records),
            embeddings: SyncMutex::new(LruCache::new(capacity)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            config,
        })
    }

    pub async fn in_memory(config: MemoryConfig) -> Result<Self> {
        Self::open(Arc::new(InMemoryBackend::new()), config).await
    }

    async fn append(&self, record: MemoryRecord) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.backend
            .append(&record)
            .await
            .map_err(|e| CouncilError::MemoryAppendFailure(e.to_string()))?;
        self.records.write().await.push(record);
        Ok(())
    }

    #[instrument(skip(self, turn), fields(request_id = %turn.request_id))]
    pub async fn append_turn(&self, turn: MemoryTurn) -> Result<()> {
        self.append(MemoryRecord::Turn(turn)).await
    }

    #[instrument(skip(self, teaching), fields(topic = %teaching.topic))]
    pub async fn add_teaching(&self, teaching: Teaching) -> Result<()> {
        if teaching.instruction.is_empty() {
            return Err(CouncilError::MemoryAppendFailure(
                "cannot store an empty teaching".to_string(),
            ));
        }
        self.append(MemoryRecord::Teaching(teaching)).await
    }

    pub async fn append_reflection(&self, reflection: Reflection) -> Result<()> {
        self.append(MemoryRecord::Reflection(reflection)).await
    }

    /// The last `n` turns, oldest first.
    pub async fn recent_turns(&self, n: usize) -> Vec<MemoryTurn> {
        let records = self.records.read().await;
        let mut turns: Vec<MemoryTurn> = records
            .iter()
            .rev()
            .filter_map(|r| match r {
                MemoryRecord::Turn(t) => Some(t.clone()),
                _ => None,
            })
            .take(n)
            .collect();
        turns.reverse();
        turns
    }

    pub async fn teachings(&self) -> Vec<Teaching> {
        self.records
            .read()
            .await
            .iter()
            .filter_map(|r| match r {
                MemoryRecord::Teaching(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn reflections_for(&self, request_id: Uuid) -> Vec<Reflection> {
        self.records
            .read()
            .await
            .iter()
            .filter_map(|r| match r {
                MemoryRecord::Reflection(r) if r.request_id == request_id => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn latest_reflection(&self, request_id: Uuid) -> Option<Reflection> {
        self.reflections_for(request_id).await.pop()
    }

    pub async fn teaching_usage(&self, teaching_id: Uuid) -> TeachingUsage {
        self.records
            .read()
            .await
            .iter()
            .filter_map(|r| match r {
                MemoryRecord::Turn(t) if t.teachings_used.contains(&teaching_id) => Some(t.outcome),
                _ => None,
            })
            .fold(TeachingUsage::default(), |usage, outcome| TeachingUsage {
                uses: usage.uses + 1,
                helpful: usage.helpful + usize::from(outcome == OutcomeSignal::Success),
            })
    }

    /// Teachings most similar to `query`, with a bonus for shared tags.
    /// Newer teachings win ties.
    pub async fn relevant_teachings(&self, query: &str, topics: &[String], limit: usize) -> Vec<Teaching> {
        if limit == 0 {
            return Vec::new();
        }
        let q = self.embedding(query);
        let records = self.records.read().await;
        let scored: Vec<(f32, usize, &Teaching)> = records
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| match r {
                MemoryRecord::Teaching(t) => {
                    let shared = t.tags.iter().filter(|tag| topics.contains(tag)).count();
                    let score = cosine(&q, &self.embedding(&t.searchable())) + TAG_BONUS * shared as f32;
                    Some((score, idx, t))
                }
                _ => None,
            })
            .collect();
        top(scored, self.config.similarity_threshold, limit)
    }

    /// Past turns similar to `query`.
    pub async fn search_turns(&self, query: &str, topics: &[String], limit: usize) -> Vec<MemoryTurn> {
        if limit == 0 {
            return Vec::new();
        }
        let q = self.embedding(query);
        let records = self.records.read().await;
        let scored: Vec<(f32, usize, &MemoryTurn)> = records
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| match r {
                MemoryRecord::Turn(t) => {
                    let shared = t.decision.topics.iter().filter(|tag| topics.contains(tag)).count();
                    let score = cosine(&q, &self.embedding(&t.request)) + TAG_BONUS * shared as f32;
                    Some((score, idx, t))
                }
                _ => None,
            })
            .collect();
        top(scored, self.config.similarity_threshold, limit)
    }

    #[instrument(skip(self, query))]
    pub async fn retrieve_context(&self, query: &str, topics: &[String]) -> RetrievedContext {
        let context = RetrievedContext {
            teachings: self
                .relevant_teachings(query, topics, self.config.context_teachings)
                .await,
            turns: self.search_turns(query, topics, self.config.context_turns).await,
        };
        debug!(
            teachings = context.teachings.len(),
            turns = context.turns.len(),
            "retrieved memory context"
        );
        context
    }

    /// Move every record aside in one step. The live store is empty afterwards.
    pub async fn archive(&self) -> Result<ArchiveReceipt> {
        let _guard = self.writer.lock().await;
        let receipt = self.backend.archive().await?;
        self.records.write().await.clear();
        warn!("Memory archived as {} ({} records)", receipt.label, receipt.records);
        Ok(receipt)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn stats(&self) -> MemoryStats {
        let records = self.records.read().await;
        let mut stats = MemoryStats {
            turns: 0,
            teachings: 0,
            reflections: 0,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cached_embeddings: self.embeddings.lock().len(),
            embedding_dim: self.config.embedding_dim,
            similarity_threshold: self.config.similarity_threshold,
        };
        for record in records.iter() {
            match record {
                MemoryRecord::Turn(_) => stats.turns += 1,
                MemoryRecord::Teaching(_) => stats.teachings += 1,
                MemoryRecord::Reflection(_) => stats.reflections += 1,
            }
        }
        stats
    }

    fn embedding(&self, text: &str) -> Arc<Vec<f32>> {
        let key = cache_key(text);
        let cached = self.embeddings.lock().get(&key).cloned();
        if let Some(hit) = cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return hit;
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let vector = Arc::new(embed(text, self.config.embedding_dim));
        self.embeddings.lock().put(key, vector.clone());
        vector
    }
}

fn top<T: Clone>(mut scored: Vec<(f32, usize, &T)>, threshold: f32, limit: usize) -> Vec<T> {
    scored.retain(|(score, _, _)| *score > threshold);
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.1.cmp(&a.1))
    });
    scored.into_iter().take(limit).map(|(_, _, item)| item.clone()).collect()
}

/// Feature-hashed bag of words: each token lands in one of `dim` buckets
/// with a hash-derived sign.
pub fn embed(text: &str, dim: usize) -> Vec<f32> {
    let dim = dim.max(1);
    let mut vector = vec![0.0f32; dim];
    for token in TopicExtractor::tokens(text) {
        let digest = blake3::hash(token.as_bytes());
        let bytes = digest.as_bytes();
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(index) % dim as u64) as usize;
        vector[bucket] += if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
    }
    vector
}

/// Create a Blake3 hash key for content.
fn cache_key(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    format!("embedding:{}", hasher.finalize().to_hex())
}

/// Compute cosine similarity between two vectors.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
