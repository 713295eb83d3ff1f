use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ingest::{Cancelled, Degradation, TableId};

use crate::cache::EmbeddingCache;
use crate::chunk::Chunk;
use crate::embeddings::Embedder;
use crate::retry::RetryPolicy;
use crate::store::{IndexPoint, VectorStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Embedding requests allowed in flight at once
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub indexed: usize,
    /// Chunks whose id was already claimed by this builder
    pub skipped_duplicates: usize,
    /// Chunk ids the provider could not embed
    pub unindexed: Vec<String>,
    /// Embeddings served from the cache instead of the provider
    pub cache_hits: usize,
    pub duration_ms: u64,
}

/// Embeds chunks and inserts them into a vector store. Every chunk id is
/// claimed at most once over the builder's lifetime, so re-submitting the
/// same chunks issues no new embedding requests.
pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    cache: Option<EmbeddingCache>,
    config: IndexConfig,
    claimed: Arc<DashMap<String, ()>>,
    requests: Arc<AtomicUsize>,
}

enum Outcome {
    Indexed { cached: bool },
    Failed { chunk_id: String, reason: String },
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, config: IndexConfig) -> Self {
        Self {
            embedder,
            store,
            cache: None,
            config,
            claimed: Arc::new(DashMap::new()),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_cache(mut self, cache: EmbeddingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Embedding requests sent to the provider so far, retries excluded.
    pub fn provider_requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Indexes `chunks`. Provider failures mark single chunks unindexed;
    /// cancellation is honoured between tables, after in-flight work drains.
    pub async fn build(
        &self,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<(IndexReport, Vec<Degradation>), Cancelled> {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let worker = ChunkWorker {
            embedder: Arc::clone(&self.embedder),
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            retry: self.config.retry.clone(),
            requests: Arc::clone(&self.requests),
        };
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut report = IndexReport::default();
        let mut current_table: Option<TableId> = None;
        let mut cancelled = false;

        for chunk in chunks {
            if current_table != Some(chunk.metadata.table_id) {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                current_table = Some(chunk.metadata.table_id);
            }

            if self.claimed.insert(chunk.chunk_id.clone(), ()).is_some() {
                debug!(chunk_id = %chunk.chunk_id, "Chunk already indexed, skipping");
                report.skipped_duplicates += 1;
                continue;
            }

            tasks.spawn(worker.clone().run(chunk.clone(), Arc::clone(&semaphore)));
        }

        let mut degradations = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Indexed { cached }) => {
                    report.indexed += 1;
                    if cached {
                        report.cache_hits += 1;
                    }
                }
                Ok(Outcome::Failed { chunk_id, reason }) => {
                    warn!(chunk_id = %chunk_id, reason = %reason, "Chunk left unindexed");
                    degradations.push(Degradation::EmbeddingUnavailable {
                        chunk_id: chunk_id.clone(),
                        reason,
                    });
                    report.unindexed.push(chunk_id);
                }
                Err(e) => warn!("Indexing task panicked: {e}"),
            }
        }
        report.unindexed.sort();
        report.duration_ms = start.elapsed().as_millis() as u64;

        if cancelled {
            info!(indexed = report.indexed, "Indexing cancelled");
            return Err(Cancelled);
        }

        info!(
            indexed = report.indexed,
            duplicates = report.skipped_duplicates,
            unindexed = report.unindexed.len(),
            cache_hits = report.cache_hits,
            duration_ms = report.duration_ms,
            "Index build complete"
        );
        Ok((report, degradations))
    }
}

/// Everything one indexing task needs, owned so the task is `'static`.
#[derive(Clone)]
struct ChunkWorker {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    cache: Option<EmbeddingCache>,
    retry: RetryPolicy,
    requests: Arc<AtomicUsize>,
}

impl ChunkWorker {
    async fn run(self, chunk: Chunk, semaphore: Arc<Semaphore>) -> Outcome {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return Outcome::Failed {
                chunk_id: chunk.chunk_id,
                reason: "indexing semaphore closed".to_string(),
            };
        };

        let cached = self.cache.as_ref().and_then(|c| c.get(&chunk.text));
        let from_cache = cached.is_some();
        let vector = match cached {
            Some(vector) => vector,
            None => {
                self.requests.fetch_add(1, Ordering::Relaxed);
                let provider: &dyn Embedder = self.embedder.as_ref();
                let text: &str = &chunk.text;
                match self.retry.retry("embed_chunk", move || provider.embed(text)).await {
                    Ok(vector) => {
                        if let Some(cache) = &self.cache {
                            cache.set(&chunk.text, vector.clone());
                        }
                        vector
                    }
                    Err(e) => {
                        return Outcome::Failed {
                            chunk_id: chunk.chunk_id,
                            reason: e.to_string(),
                        };
                    }
                }
            }
        };

        let point = IndexPoint {
            id: chunk.chunk_id.clone(),
            vector,
            granularity: chunk.granularity,
            table_id: chunk.metadata.table_id,
        };
        match self.store.upsert(vec![point]).await {
            Ok(()) => Outcome::Indexed { cached: from_cache },
            Err(e) => Outcome::Failed {
                chunk_id: chunk.chunk_id,
                reason: e.to_string(),
            },
        }
    }
}
