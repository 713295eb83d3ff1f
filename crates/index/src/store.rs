use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use ingest::TableId;

use crate::chunk::Granularity;
use crate::embeddings::BoxFuture;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("store lock poisoned: {0}")]
    Lock(String),
}

/// One indexed chunk: its embedding plus the fields searches filter on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub granularity: Granularity,
    pub table_id: TableId,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    /// Allowed granularities, empty for any
    pub granularities: Vec<Granularity>,
    /// Allowed tables, empty for any
    pub tables: Vec<TableId>,
}

impl VectorFilter {
    pub fn granularities(granularities: &[Granularity]) -> Self {
        Self {
            granularities: granularities.to_vec(),
            tables: Vec::new(),
        }
    }

    pub fn matches(&self, point: &IndexPoint) -> bool {
        (self.granularities.is_empty() || self.granularities.contains(&point.granularity))
            && (self.tables.is_empty() || self.tables.contains(&point.table_id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
}

pub trait VectorStore: Send + Sync {
    fn upsert(&self, points: Vec<IndexPoint>) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Best `limit` points by similarity, highest first.
    fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredPoint>, StoreError>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored point, ordered by id, for persistence.
    fn points(&self) -> Vec<IndexPoint>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Exhaustive cosine search over points held in memory.
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: RwLock<HashMap<String, IndexPoint>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: Vec<IndexPoint>) -> Self {
        Self {
            points: RwLock::new(points.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore")
            .field("points", &self.len())
            .finish_non_exhaustive()
    }
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(&self, points: Vec<IndexPoint>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            // Check and insert under one guard; a rejected batch stores nothing
            let mut stored = self
                .points
                .write()
                .map_err(|e| StoreError::Lock(e.to_string()))?;

            let mut dimensions = stored.values().next().map(|p| p.vector.len());
            for point in &points {
                let actual = point.vector.len();
                if let Some(expected) = dimensions
                    && expected != actual
                {
                    return Err(StoreError::DimensionMismatch { expected, actual });
                }
                dimensions = Some(actual);
            }
            for point in points {
                stored.insert(point.id.clone(), point);
            }
            Ok(())
        })
    }

    fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredPoint>, StoreError>> {
        Box::pin(async move {
            let stored = self
                .points
                .read()
                .map_err(|e| StoreError::Lock(e.to_string()))?;

            if let Some(expected) = stored.values().next().map(|p| p.vector.len())
                && expected != vector.len()
            {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }

            let empty_filter = VectorFilter::default();
            let f = filter.as_ref().unwrap_or(&empty_filter);

            let mut scored: Vec<ScoredPoint> = stored
                .values()
                .filter(|p| f.matches(p))
                .map(|p| ScoredPoint {
                    id: p.id.clone(),
                    score: cosine_similarity(&vector, &p.vector),
                })
                .collect();

            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            scored.truncate(limit);
            Ok(scored)
        })
    }

    fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    fn points(&self) -> Vec<IndexPoint> {
        let mut points: Vec<IndexPoint> = self
            .points
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        points.sort_by(|a, b| a.id.cmp(&b.id));
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn point(id: &str, vector: Vec<f32>, granularity: Granularity) -> IndexPoint {
        IndexPoint {
            id: id.to_string(),
            vector,
            granularity,
            table_id: TableId(0),
        }
    }

    #[tokio::test]
    async fn test_search_ranks_by_cosine_and_filters() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], Granularity::Row),
                point("b", vec![0.7, 0.7], Granularity::Metric),
                point("c", vec![0.0, 1.0], Granularity::Metric),
            ])
            .await
            .unwrap();

        let all = store.search(vec![1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(
            all.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!((all[0].score - 1.0).abs() < 1e-6);

        let metrics = store
            .search(vec![1.0, 0.0], 1, Some(VectorFilter::granularities(&[Granularity::Metric])))
            .await
            .unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].id, "b");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![point("a", vec![1.0, 0.0], Granularity::Row)])
            .await
            .unwrap();

        let err = store
            .upsert(vec![point("b", vec![1.0, 0.0, 0.0], Granularity::Row)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, actual: 3 }));
        assert!(store.search(vec![1.0], 5, None).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_stores_nothing() {
        let store = InMemoryVectorStore::new();
        let err = store
            .upsert(vec![
                point("a", vec![1.0, 0.0], Granularity::Row),
                point("b", vec![1.0, 0.0, 0.0], Granularity::Row),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, actual: 3 }));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_writes_agree_on_dimension() {
        for _ in 0..20 {
            let store = Arc::new(InMemoryVectorStore::new());
            let mut tasks = tokio::task::JoinSet::new();
            for (id, dims) in [("two", 2), ("three", 3)] {
                let store = Arc::clone(&store);
                tasks.spawn(async move {
                    store
                        .upsert(vec![point(id, vec![1.0; dims], Granularity::Row)])
                        .await
                        .is_ok()
                });
            }

            let mut accepted = 0;
            while let Some(ok) = tasks.join_next().await {
                if ok.unwrap() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 1);
            assert_eq!(store.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_empty_store_returns_nothing() {
        let store = InMemoryVectorStore::new();
        assert!(store.is_empty());
        assert!(store.search(vec![1.0, 0.0], 5, None).await.unwrap().is_empty());
    }
}
