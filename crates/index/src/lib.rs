pub mod artifact;
pub mod builder;
pub mod cache;
pub mod chunk;
pub mod chunker;
pub mod embeddings;
pub mod retry;
pub mod store;

pub use artifact::{ARTIFACT_VERSION, ArtifactError, DocumentArtifact};
pub use builder::{IndexBuilder, IndexConfig, IndexReport};
pub use cache::{CacheConfig, CacheStats, EmbeddingCache};
pub use chunk::{Chunk, ChunkMetadata, Granularity};
pub use chunker::{Chunker, ChunkerConfig};
pub use embeddings::{
    BoxFuture, EmbedError, Embedder, EmbedderConfig, EmbedderKind, HashingEmbedder,
    OllamaEmbedder,
};
pub use retry::RetryPolicy;
pub use store::{InMemoryVectorStore, IndexPoint, ScoredPoint, StoreError, VectorFilter, VectorStore};

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use extract::{EnhancedTable, TableHierarchy};
use ingest::{Diagnostics, DocumentMetadata};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no chunks were indexed for document {doc_id} ({chunks} chunks, {unindexed} unindexed)")]
    Empty {
        doc_id: String,
        chunks: usize,
        unindexed: usize,
    },
}

/// Chunking plus index building for one document.
pub struct Indexer {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    embedder_config: EmbedderConfig,
    index_config: IndexConfig,
    cache: Option<EmbeddingCache>,
}

impl Indexer {
    pub fn new(
        chunker: ChunkerConfig,
        embedder_config: EmbedderConfig,
        index_config: IndexConfig,
        cache: &CacheConfig,
    ) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::from(embedder_config.build());
        Self::with_embedder(Chunker::new(chunker), embedder, embedder_config, index_config)
            .with_cache(EmbeddingCache::from_config(cache))
    }

    /// Uses an already built provider; `embedder_config` is recorded in the
    /// artifact so queries embed the same way.
    pub fn with_embedder(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        embedder_config: EmbedderConfig,
        index_config: IndexConfig,
    ) -> Self {
        Self {
            chunker,
            embedder,
            embedder_config,
            index_config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<EmbeddingCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Chunks and indexes `tables`, returning the persisted form. Fails when
    /// no chunk at all could be indexed.
    pub async fn index_document(
        &self,
        metadata: DocumentMetadata,
        tables: TableHierarchy<EnhancedTable>,
        mut diagnostics: Diagnostics,
        cancel: &CancellationToken,
    ) -> Result<(DocumentArtifact, IndexReport)> {
        let chunks = self.chunker.chunk_document(&metadata.doc_id, &tables);

        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let mut builder =
            IndexBuilder::new(Arc::clone(&self.embedder), Arc::clone(&store), self.index_config.clone());
        if let Some(cache) = &self.cache {
            builder = builder.with_cache(cache.clone());
        }

        let (report, degradations) = builder
            .build(&chunks, cancel)
            .await
            .context("Index build interrupted")?;
        diagnostics.extend(degradations);

        if store.is_empty() {
            return Err(IndexError::Empty {
                doc_id: metadata.doc_id.clone(),
                chunks: chunks.len(),
                unindexed: report.unindexed.len(),
            }
            .into());
        }

        info!(
            doc_id = %metadata.doc_id,
            chunks = chunks.len(),
            indexed = report.indexed,
            "Document indexed"
        );

        let artifact = DocumentArtifact::new(
            metadata,
            self.embedder_config.clone(),
            tables,
            chunks,
            store.as_ref(),
            report.unindexed.clone(),
            diagnostics,
        );
        Ok((artifact, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::Extractor;
    use ingest::{BBox, DetectorConfig, PageLayout, RawCell, TableDetector};

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

    fn metadata() -> DocumentMetadata {
        DocumentMetadata {
            doc_id: "doc".to_string(),
            source: "nested.json".to_string(),
            page_count: 1,
            likely_scanned: false,
        }
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
            Box::pin(async { Err(EmbedError::Request("connection refused".to_string())) })
        }
    }

    #[tokio::test]
    async fn test_index_nested_document() {
        let indexer = Indexer::new(
            ChunkerConfig::default(),
            EmbedderConfig::default(),
            IndexConfig::default(),
            &CacheConfig::default(),
        );
        let (artifact, report) = indexer
            .index_document(metadata(), nested_tables(), Diagnostics::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(artifact.chunks.len() >= 12);
        assert_eq!(report.indexed, artifact.chunks.len());
        assert_eq!(artifact.points.len(), artifact.chunks.len());
        assert!(artifact.unindexed.is_empty());
        assert_eq!(artifact.tables.len(), 2);
    }

    #[tokio::test]
    async fn test_nothing_indexed_is_a_hard_failure() {
        let config = IndexConfig {
            retry: RetryPolicy::none(),
            ..IndexConfig::default()
        };
        let indexer = Indexer::with_embedder(
            Chunker::default(),
            Arc::new(DownEmbedder),
            EmbedderConfig::default(),
            config,
        );
        let err = indexer
            .index_document(metadata(), nested_tables(), Diagnostics::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<IndexError>(), Some(IndexError::Empty { .. })));
    }
}
