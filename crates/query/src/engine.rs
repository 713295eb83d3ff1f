use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use extract::{EnhancedTable, TableHierarchy};
use index::{
    Chunk, DocumentArtifact, Embedder, EmbeddingCache, Granularity, ScoredPoint, VectorFilter,
    VectorStore,
};
use ingest::TableId;

use crate::context::{self, ContextEntry};
use crate::intent::{Direction, IntentClassifier, IntentKind, QueryIntent};
use crate::response::{self, QueryOutcome, QueryResponse, QueryState, QueryTrace, RetrievedMatch};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub top_k: usize,
    /// Candidates scoring below this are discarded
    pub similarity_floor: f32,
    /// A top score below this broadens the context
    pub confidence_threshold: f32,
    /// Search pool size as a multiple of `top_k`, before traversal and ranking
    pub candidate_multiplier: usize,
    pub max_context: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_floor: 0.05,
            confidence_threshold: 0.5,
            candidate_multiplier: 4,
            max_context: 8,
        }
    }
}

/// A scored chunk on its way to becoming a [`RetrievedMatch`].
#[derive(Debug, Clone)]
struct Candidate<'a> {
    chunk: &'a Chunk,
    score: f32,
    /// Table the hit was found on, when traversal swapped it for another
    via: Option<TableId>,
}

/// Answers questions over one document's index. Read-only after
/// construction, so one engine can serve concurrent queries.
pub struct QueryEngine {
    tables: TableHierarchy<EnhancedTable>,
    chunks: HashMap<String, Chunk>,
    /// Table-granularity chunk id per table
    table_chunks: HashMap<TableId, String>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    classifier: IntentClassifier,
    cache: Option<EmbeddingCache>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(
        tables: TableHierarchy<EnhancedTable>,
        chunks: Vec<Chunk>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: QueryConfig,
    ) -> Self {
        let table_chunks = chunks
            .iter()
            .filter(|c| c.granularity == Granularity::Table)
            .map(|c| (c.metadata.table_id, c.chunk_id.clone()))
            .collect();
        let chunks = chunks.into_iter().map(|c| (c.chunk_id.clone(), c)).collect();
        let classifier = IntentClassifier::new(&tables);

        Self {
            tables,
            chunks,
            table_chunks,
            store,
            embedder,
            classifier,
            cache: None,
            config,
        }
    }

    /// Rebuilds the engine from a persisted artifact, embedding queries with
    /// the provider the artifact was indexed with.
    pub fn from_artifact(artifact: DocumentArtifact, config: QueryConfig) -> Self {
        let store: Arc<dyn VectorStore> = Arc::new(artifact.store());
        let embedder: Arc<dyn Embedder> = Arc::from(artifact.embedder.build());
        Self::new(artifact.tables, artifact.chunks, store, embedder, config)
    }

    pub fn with_cache(mut self, cache: Option<EmbeddingCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn tables(&self) -> &TableHierarchy<EnhancedTable> {
        &self.tables
    }

    /// Runs one query to completion. Always returns a response; retrieval
    /// problems end in [`QueryOutcome::NoMatch`].
    pub async fn query(&self, query: &str) -> QueryResponse {
        let start = Instant::now();
        let mut trace = QueryTrace::default();
        advance(&mut trace, QueryState::Received);

        // Step 1: Classify intent
        let intent = self.classifier.classify(query);
        debug!(intent = intent.kind.as_str(), entities = ?intent.entities, "Intent classified");
        advance(&mut trace, QueryState::IntentClassified);

        // Step 2: Select granularities and table scope
        let filter = VectorFilter {
            granularities: intent.granularities.clone(),
            tables: intent.entities.tables.clone(),
        };
        advance(&mut trace, QueryState::GranularitySelected);

        // Step 3: Retrieve
        let hits = match self.search(query, filter).await {
            Ok(hits) => hits,
            Err(reason) => return self.no_match(query, intent, trace, start, reason),
        };
        trace.candidates = hits.len();

        let mut candidates: Vec<Candidate<'_>> = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.score < self.config.similarity_floor {
                trace.below_floor += 1;
                continue;
            }
            if let Some(chunk) = self.chunks.get(&hit.id) {
                candidates.push(Candidate {
                    chunk,
                    score: hit.score,
                    via: None,
                });
            }
        }

        if intent.kind == IntentKind::Relationship {
            let direction = intent.direction.unwrap_or(Direction::Child);
            let (traversed, swapped) = self.traverse(candidates, direction);
            candidates = traversed;
            trace.traversed = swapped;
        }

        rank(&mut candidates);
        candidates.truncate(self.config.top_k.max(1));
        advance(&mut trace, QueryState::Retrieved);

        let Some(top) = candidates.first() else {
            let reason = format!(
                "no candidate scored above the similarity floor of {:.2}",
                self.config.similarity_floor
            );
            return self.no_match(query, intent, trace, start, reason);
        };
        trace.top_score = Some(top.score);

        let matches: Vec<RetrievedMatch> = candidates
            .iter()
            .map(|c| self.retrieved(c, &intent))
            .collect();

        // Step 4: Expand context for relationship questions or weak matches
        let mut context: Vec<ContextEntry> = Vec::new();
        if intent.kind == IntentKind::Relationship || top.score < self.config.confidence_threshold {
            context = context::expand(&self.tables, &matches);
            context.truncate(self.config.max_context);
            trace.expanded = true;
        }
        advance(&mut trace, QueryState::ContextExpanded);

        // Step 5: Respond
        let answer = response::render(&intent, &matches, &context, &self.tables);
        advance(&mut trace, QueryState::Responded);
        trace.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            intent = intent.kind.as_str(),
            matches = matches.len(),
            context = context.len(),
            top_score = ?trace.top_score,
            "Query answered"
        );

        QueryResponse {
            query: query.to_string(),
            state: QueryState::Responded,
            intent,
            outcome: QueryOutcome::Answer {
                answer,
                matches,
                context,
            },
            trace,
        }
    }

    async fn search(&self, query: &str, filter: VectorFilter) -> Result<Vec<ScoredPoint>, String> {
        if self.store.is_empty() {
            return Err("the index is empty".to_string());
        }

        let vector = match self.cache.as_ref().and_then(|c| c.get(query)) {
            Some(vector) => vector,
            None => {
                let vector = self.embedder.embed(query).await.map_err(|e| {
                    warn!(error = %e, "Failed to embed query");
                    format!("the query could not be embedded: {e}")
                })?;
                if let Some(cache) = &self.cache {
                    cache.set(query, vector.clone());
                }
                vector
            }
        };

        let limit = self.config.top_k.max(1) * self.config.candidate_multiplier.max(1);
        self.store
            .search(vector, limit, Some(filter))
            .await
            .map_err(|e| {
                warn!(error = %e, "Vector search failed");
                format!("the index could not be searched: {e}")
            })
    }

    /// Swaps table hits for their children (or parent) so relationship
    /// questions land on the related table. A hit that already is the
    /// answer (a nested table, or a table with nested tables) stays. Falls
    /// back to the original hits when nothing is related.
    fn traverse<'a>(
        &'a self,
        candidates: Vec<Candidate<'a>>,
        direction: Direction,
    ) -> (Vec<Candidate<'a>>, usize) {
        let mut out: Vec<Candidate<'a>> = Vec::new();
        let mut swapped = 0;

        for candidate in &candidates {
            let table = candidate.chunk.metadata.table_id;
            let related: Vec<TableId> = match direction {
                Direction::Child => self.tables.children_of(table).iter().map(|t| t.id()).collect(),
                Direction::Parent => self.tables.parent_of(table).map(|t| t.id()).into_iter().collect(),
            };

            if related.is_empty() {
                let keep = match direction {
                    Direction::Child => self.tables.parent_of(table).is_some(),
                    Direction::Parent => !self.tables.children_of(table).is_empty(),
                };
                if keep {
                    out.push(candidate.clone());
                }
                continue;
            }

            for id in related {
                if let Some(chunk) = self.table_chunks.get(&id).and_then(|cid| self.chunks.get(cid)) {
                    swapped += 1;
                    out.push(Candidate {
                        chunk,
                        score: candidate.score,
                        via: Some(table),
                    });
                }
            }
        }

        if out.is_empty() {
            return (candidates, 0);
        }

        // One entry per chunk, keeping the best score
        let mut best: HashMap<&str, Candidate<'a>> = HashMap::new();
        for candidate in out {
            let chunk: &'a Chunk = candidate.chunk;
            let better = best
                .get(chunk.chunk_id.as_str())
                .is_none_or(|existing| existing.score < candidate.score);
            if better {
                best.insert(chunk.chunk_id.as_str(), candidate);
            }
        }
        (best.into_values().collect(), swapped)
    }

    fn retrieved(&self, candidate: &Candidate<'_>, intent: &QueryIntent) -> RetrievedMatch {
        let chunk = candidate.chunk;
        let meta = &chunk.metadata;

        let mut explanation = format!(
            "{} chunk of table {} at nesting depth {}, similarity {:.2}",
            chunk.granularity,
            meta.table_label,
            meta.depth(),
            candidate.score
        );
        if let Some(via) = candidate.via {
            let label = self
                .tables
                .get(via)
                .map(|t| t.structure.label.as_str())
                .unwrap_or("?");
            explanation.push_str(&format!("; reached from table {label}"));
        }
        let text = chunk.text.to_lowercase();
        let mut mentioned: Vec<&str> = Vec::new();
        for name in intent
            .entities
            .metrics
            .iter()
            .chain(&intent.entities.rows)
            .chain(&intent.entities.columns)
        {
            if text.contains(&name.to_lowercase()) && !mentioned.contains(&name.as_str()) {
                mentioned.push(name);
            }
        }
        if !mentioned.is_empty() {
            explanation.push_str(&format!("; mentions {}", mentioned.join(", ")));
        }

        RetrievedMatch {
            chunk_id: chunk.chunk_id.clone(),
            table_id: meta.table_id,
            table_label: meta.table_label.clone(),
            granularity: chunk.granularity,
            score: candidate.score,
            text: chunk.text.clone(),
            nesting_path: meta.nesting_path.clone(),
            doc_order: meta.doc_order,
            metric_label: meta.metric_label.clone(),
            metric_value: meta.metric_value,
            explanation,
        }
    }

    fn no_match(
        &self,
        query: &str,
        intent: QueryIntent,
        mut trace: QueryTrace,
        start: Instant,
        reason: String,
    ) -> QueryResponse {
        advance(&mut trace, QueryState::Retrieved);
        advance(&mut trace, QueryState::ContextExpanded);
        advance(&mut trace, QueryState::Responded);
        trace.duration_ms = start.elapsed().as_millis() as u64;
        info!(intent = intent.kind.as_str(), reason = %reason, "Query found no match");

        QueryResponse {
            query: query.to_string(),
            state: QueryState::Responded,
            intent,
            outcome: QueryOutcome::NoMatch { reason },
            trace,
        }
    }
}

fn advance(trace: &mut QueryTrace, state: QueryState) {
    if trace.states.last().is_none_or(|last| *last < state) {
        debug!(state = state.as_str(), "Query state");
        trace.states.push(state);
    }
}

/// Score descending, then shallower nesting, then document order.
fn rank(candidates: &mut [Candidate<'_>]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.metadata.depth().cmp(&b.chunk.metadata.depth()))
            .then_with(|| a.chunk.metadata.doc_order.cmp(&b.chunk.metadata.doc_order))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::Extractor;
    use index::{
        BoxFuture, CacheConfig, ChunkMetadata, ChunkerConfig, EmbedError, EmbedderConfig,
        HashingEmbedder, IndexConfig, Indexer, InMemoryVectorStore,
    };
    use ingest::{BBox, DetectorConfig, Diagnostics, DocumentMetadata, PageLayout, RawCell, TableDetector};
    use tokio_util::sync::CancellationToken;

    use crate::context::Relation;

    fn nested_tables() -> TableHierarchy<EnhancedTable> {
        let mut page = PageLayout::new(1, 612.0, 792.0);
        let mut push = |x0: f32, y0: f32, w: f32, h: f32, rows: &[&[&str]]| {
            for (r, row) in rows.iter().enumerate() {
                for (c, text) in row.iter().enumerate() {
                    let x = x0 + c as f32 * w;
                    let y = y0 + r as f32 * h;
                    page.cells.push(RawCell::ruled(BBox::new(x, y, x + w, y + h), *text));
                }
            }
        };
        push(
            50.0,
            100.0,
            120.0,
            80.0,
            &[&["Segment", "Revenue", "Breakdown"], &["Retail", "1,200", ""]],
        );
        push(300.0, 190.0, 50.0, 30.0, &[&["Online", "700"], &["Stores", "500"]]);
        let detection = TableDetector::new(DetectorConfig::default()).detect_single_page(&page);
        Extractor::default()
            .extract(&detection, &CancellationToken::new())
            .unwrap()
            .0
    }

    async fn nested_engine() -> QueryEngine {
        let metadata = DocumentMetadata {
            doc_id: "doc".to_string(),
            source: "nested.json".to_string(),
            page_count: 1,
            likely_scanned: false,
        };
        let indexer = Indexer::new(
            ChunkerConfig::default(),
            EmbedderConfig::default(),
            IndexConfig::default(),
            &CacheConfig::default(),
        );
        let (artifact, _) = indexer
            .index_document(metadata, nested_tables(), Diagnostics::new(), &CancellationToken::new())
            .await
            .unwrap();
        QueryEngine::from_artifact(artifact, QueryConfig::default())
    }

    struct DownEmbedder;

    impl Embedder for DownEmbedder {
        fn name(&self) -> &str {
            "down"
        }

        fn dimensions(&self) -> Option<usize> {
            None
        }

        fn embed<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, EmbedError>> {
            Box::pin(async { Err(EmbedError::Status(503)) })
        }
    }

    #[tokio::test]
    async fn test_empty_index_returns_no_match() {
        let engine = QueryEngine::new(
            TableHierarchy::default(),
            Vec::new(),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashingEmbedder::default()),
            QueryConfig::default(),
        );
        let response = engine.query("What is the total revenue?").await;

        assert!(response.is_no_match());
        assert_eq!(response.state, QueryState::Responded);
        assert_eq!(response.trace.states.last(), Some(&QueryState::Responded));
        assert!(response.matches().is_empty());
        assert!(response.text().starts_with("No matching table content"));
    }

    #[tokio::test]
    async fn test_nested_table_relationship_query() {
        let engine = nested_engine().await;
        let response = engine.query("what is in the nested table").await;

        assert_eq!(response.intent.kind, IntentKind::Relationship);
        assert_eq!(
            response.trace.states,
            vec![
                QueryState::Received,
                QueryState::IntentClassified,
                QueryState::GranularitySelected,
                QueryState::Retrieved,
                QueryState::ContextExpanded,
                QueryState::Responded,
            ]
        );

        let top = &response.matches()[0];
        assert_eq!(top.granularity, Granularity::Table);
        assert_eq!(top.table_label, "p1_t2");
        assert_eq!(top.nesting_path, vec![TableId(0), TableId(1)]);

        assert!(response.trace.expanded);
        let parent = response
            .context()
            .iter()
            .find(|e| e.relation == Relation::Parent)
            .unwrap();
        assert_eq!(parent.table_label, "p1_t1");
        assert!(parent.description.contains("Contains nested table p1_t2"));
        assert!(response.text().contains("nested inside table p1_t1 at row 2, column 3"));
    }

    #[tokio::test]
    async fn test_metric_lookup_ranks_metric_chunk_first() {
        let engine = nested_engine().await;
        let response = engine.query("What is the value of Stores?").await;

        assert_eq!(response.intent.kind, IntentKind::Lookup);
        assert_eq!(response.intent.entities.metrics, vec!["Stores".to_string()]);

        let top = &response.matches()[0];
        assert_eq!(top.granularity, Granularity::Metric);
        assert_eq!(top.table_label, "p1_t2");
        assert_eq!(top.metric_value, Some(500.0));
        assert!(top.score > engine.config().confidence_threshold);
        assert!(!response.trace.expanded);
        assert!(top.explanation.contains("mentions Stores"));
    }

    #[tokio::test]
    async fn test_aggregation_over_metric_chunks() {
        let engine = nested_engine().await;
        let response = engine.query("What is the total of Online and Stores?").await;

        assert_eq!(response.intent.kind, IntentKind::Aggregation);
        let values: Vec<f64> = response
            .matches()
            .iter()
            .filter_map(|m| m.metric_value)
            .collect();
        assert!(values.contains(&700.0));
        assert!(values.contains(&500.0));
        assert!(response.text().starts_with("Sum of "));
    }

    #[tokio::test]
    async fn test_stop_words_only_query_finds_nothing() {
        let engine = nested_engine().await;
        let response = engine.query("what is the").await;

        assert!(response.is_no_match());
        assert!(response.trace.candidates > 0);
        assert_eq!(response.trace.below_floor, response.trace.candidates);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_no_match() {
        let chunk = Chunk::new(
            "doc".to_string(),
            Granularity::Metric,
            0,
            "Stores: 500".to_string(),
            ChunkMetadata {
                table_id: TableId(0),
                table_label: "p1_t1".to_string(),
                page: 1,
                nesting_path: vec![TableId(0)],
                row: Some(1),
                col: Some(1),
                metric_label: Some("Stores".to_string()),
                metric_value: Some(500.0),
                unit: None,
                doc_order: 0,
            },
        );
        let store = InMemoryVectorStore::from_points(vec![index::IndexPoint {
            id: chunk.chunk_id.clone(),
            vector: vec![1.0, 0.0],
            granularity: Granularity::Metric,
            table_id: TableId(0),
        }]);
        let engine = QueryEngine::new(
            TableHierarchy::default(),
            vec![chunk],
            Arc::new(store),
            Arc::new(DownEmbedder),
            QueryConfig::default(),
        );

        let response = engine.query("Stores").await;
        assert!(response.is_no_match());
        assert!(response.text().contains("could not be embedded"));
    }

    #[tokio::test]
    async fn test_repeated_queries_use_the_cache() {
        let cache = EmbeddingCache::new(8);
        let engine = nested_engine().await.with_cache(Some(cache.clone()));

        let first = engine.query("What is the value of Stores?").await;
        let second = engine.query("What is the value of Stores?").await;
        assert_eq!(first.matches(), second.matches());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }
}
