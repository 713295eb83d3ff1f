use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use extract::{EnhancedTable, Extractor, TableHierarchy};
use index::{DocumentArtifact, EmbeddingCache, Indexer};
use ingest::Diagnostics;
use query::{QueryEngine, QueryResponse};

use crate::config::AppConfig;
use crate::metrics::{MetricsSnapshot, RunMetrics, TimedOperation};

#[derive(Debug, Serialize)]
pub struct ProcessSummary {
    pub doc_id: String,
    pub source: String,
    pub pages: usize,
    pub tables: usize,
    pub nested_tables: usize,
    pub chunks: usize,
    pub indexed: usize,
    pub unindexed: usize,
    pub degradations: usize,
    pub degradation_kinds: BTreeMap<String, usize>,
    pub likely_scanned: bool,
    pub metrics: MetricsSnapshot,
}

impl ProcessSummary {
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Document {} ({})", self.source, self.doc_id),
            format!("Pages: {}", self.pages),
            format!("Tables: {} ({} nested)", self.tables, self.nested_tables),
            format!("Chunks: {} ({} indexed, {} unindexed)", self.chunks, self.indexed, self.unindexed),
        ];
        if self.degradation_kinds.is_empty() {
            lines.push(format!("Degradations: {}", self.degradations));
        } else {
            let kinds: Vec<String> = self
                .degradation_kinds
                .iter()
                .map(|(kind, n)| format!("{kind}: {n}"))
                .collect();
            lines.push(format!("Degradations: {} ({})", self.degradations, kinds.join(", ")));
        }
        if self.likely_scanned {
            lines.push("Warning: little extractable text, the PDF may be scanned".to_string());
        }
        let timings = self.metrics.timings();
        if !timings.is_empty() {
            lines.push(format!("Timings: {}", timings.join(", ")));
        }
        lines.join("\n")
    }
}

/// Detect, analyze, enhance, chunk and index one document, then save the
/// artifact.
pub async fn process_document(
    input: &Path,
    artifact_path: &Path,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<ProcessSummary> {
    let metrics = RunMetrics::new();

    let timer = TimedOperation::start();
    let document = ingest::ingest_file(input, &config.detector, cancel).await?;
    metrics.record_detect(timer.elapsed(), document.detection.regions.len());

    let mut diagnostics = Diagnostics::new();
    diagnostics.extend(document.detection.degradations.iter().cloned());

    let timer = TimedOperation::start();
    let extractor = Extractor::new(config.analyzer.clone());
    let (tables, degradations) = extractor.extract(&document.detection, cancel)?;
    diagnostics.extend(degradations);
    metrics.record_extract(timer.elapsed(), tables.len());

    let timer = TimedOperation::start();
    let indexer = Indexer::new(
        config.chunker.clone(),
        config.embedder.clone(),
        config.index.clone(),
        &config.cache,
    );
    let (artifact, report) = indexer
        .index_document(document.metadata, tables, diagnostics, cancel)
        .await
        .with_context(|| format!("Failed to index {}", input.display()))?;
    metrics.record_index(timer.elapsed(), report.indexed);

    let timer = TimedOperation::start();
    artifact
        .save(artifact_path)
        .await
        .with_context(|| format!("Failed to write artifact {}", artifact_path.display()))?;
    metrics.record_save(timer.elapsed());

    if !report.unindexed.is_empty() {
        warn!(unindexed = report.unindexed.len(), "Some chunks could not be embedded");
    }

    let summary = ProcessSummary {
        doc_id: artifact.metadata.doc_id.clone(),
        source: artifact.metadata.source.clone(),
        pages: artifact.metadata.page_count,
        tables: artifact.tables.len(),
        nested_tables: artifact.tables.iter().filter(|t| t.structure.parent.is_some()).count(),
        chunks: artifact.chunks.len(),
        indexed: report.indexed,
        unindexed: report.unindexed.len(),
        degradations: artifact.diagnostics.len(),
        degradation_kinds: artifact
            .diagnostics
            .counts_by_kind()
            .into_iter()
            .map(|(kind, n)| (kind.to_string(), n))
            .collect(),
        likely_scanned: artifact.metadata.likely_scanned,
        metrics: metrics.snapshot(),
    };
    info!(doc_id = %summary.doc_id, tables = summary.tables, chunks = summary.chunks, "Document processed");
    Ok(summary)
}

/// Loads an artifact and answers one query against it. An unreadable or
/// empty artifact is an error; a query with no match is not.
pub async fn answer_query(artifact_path: &Path, query: &str, config: &AppConfig) -> Result<QueryResponse> {
    let artifact = DocumentArtifact::load(artifact_path)
        .await
        .with_context(|| format!("Cannot query {}", artifact_path.display()))?;

    let engine = QueryEngine::from_artifact(artifact, config.query.clone())
        .with_cache(EmbeddingCache::from_config(&config.cache));

    let timer = TimedOperation::start();
    let response = engine.query(query).await;
    info!(query_ms = timer.elapsed().as_secs_f64() * 1000.0, "Query finished");
    Ok(response)
}

/// One table of the nested tree, as printed by `inspect`.
#[derive(Debug, Serialize)]
pub struct TableOutline {
    pub label: String,
    pub page: u32,
    pub depth: usize,
    pub kind: String,
    pub rows: usize,
    pub cols: usize,
    pub header_rows: usize,
    pub header_cols: usize,
    /// Cell of the parent holding this table, 1-based (row, column)
    pub anchor: Option<(usize, usize)>,
    pub children: usize,
    pub metrics: usize,
    pub caption: Option<String>,
}

/// Flattens the hierarchy in preorder, so every table follows its parent.
pub fn outline(tables: &TableHierarchy<EnhancedTable>) -> Vec<TableOutline> {
    tables
        .preorder()
        .into_iter()
        .map(|table| {
            let s = &table.structure;
            let anchor = tables.parent_of(s.id).and_then(|parent| {
                parent
                    .structure
                    .children
                    .iter()
                    .find(|link| link.child == s.id)
                    .map(|link| (link.row + 1, link.col + 1))
            });
            TableOutline {
                label: s.label.clone(),
                page: s.page,
                depth: s.nesting_level,
                kind: table.kind.as_str().to_string(),
                rows: s.n_rows,
                cols: s.n_cols,
                header_rows: s.header_rows,
                header_cols: s.header_cols,
                anchor,
                children: s.children.len(),
                metrics: table.metrics.len(),
                caption: s.caption.clone(),
            }
        })
        .collect()
}

pub fn render_outline(outline: &[TableOutline]) -> String {
    outline
        .iter()
        .map(|t| {
            let mut line = format!(
                "{}{} (page {}, {}) {}x{}, headers {} row(s) {} col(s), {} metrics",
                "  ".repeat(t.depth),
                t.label,
                t.page,
                t.kind,
                t.rows,
                t.cols,
                t.header_rows,
                t.header_cols,
                t.metrics
            );
            if let Some((row, col)) = t.anchor {
                line.push_str(&format!(", in parent cell row {row}, column {col}"));
            }
            if let Some(caption) = &t.caption {
                line.push_str(&format!(" \"{caption}\""));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Loads an artifact and lists its table tree.
pub async fn inspect_artifact(artifact_path: &Path) -> Result<Vec<TableOutline>> {
    let artifact = DocumentArtifact::load(artifact_path)
        .await
        .with_context(|| format!("Cannot inspect {}", artifact_path.display()))?;
    Ok(outline(&artifact.tables))
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::ArtifactError;
    use ingest::{BBox, LayoutDocument, PageLayout, RawCell};
    use query::IntentKind;

    fn nested_layout() -> LayoutDocument {
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
        LayoutDocument {
            source: "nested.json".to_string(),
            pages: vec![page],
        }
    }

    async fn write_layout(dir: &Path, layout: &LayoutDocument) -> std::path::PathBuf {
        let path = dir.join("nested.json");
        tokio::fs::write(&path, serde_json::to_vec(layout).unwrap()).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_process_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_layout(dir.path(), &nested_layout()).await;
        let artifact = dir.path().join("artifacts").join("nested.tablerag.json");
        let config = AppConfig::default();

        let summary = process_document(&input, &artifact, &config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.tables, 2);
        assert_eq!(summary.nested_tables, 1);
        assert!(summary.chunks >= 12);
        assert_eq!(summary.indexed, summary.chunks);
        assert!(summary.render().contains("Tables: 2 (1 nested)"));

        let response = answer_query(&artifact, "what is in the nested table", &config)
            .await
            .unwrap();
        assert_eq!(response.intent.kind, IntentKind::Relationship);
        assert_eq!(response.matches()[0].table_label, "p1_t2");
    }

    #[test]
    fn test_summary_breaks_degradations_down_by_kind() {
        let summary = ProcessSummary {
            doc_id: "d1".to_string(),
            source: "report.pdf".to_string(),
            pages: 3,
            tables: 2,
            nested_tables: 1,
            chunks: 14,
            indexed: 13,
            unindexed: 1,
            degradations: 3,
            degradation_kinds: BTreeMap::from([
                ("detection_degraded".to_string(), 2),
                ("embedding_unavailable".to_string(), 1),
            ]),
            likely_scanned: false,
            metrics: RunMetrics::new().snapshot(),
        };
        assert!(
            summary
                .render()
                .contains("Degradations: 3 (detection_degraded: 2, embedding_unavailable: 1)")
        );
    }

    #[tokio::test]
    async fn test_inspect_lists_tree_in_preorder() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_layout(dir.path(), &nested_layout()).await;
        let artifact = dir.path().join("nested.tablerag.json");
        process_document(&input, &artifact, &AppConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        let tables = inspect_artifact(&artifact).await.unwrap();
        assert_eq!(tables.len(), 2);

        let (outer, inner) = (&tables[0], &tables[1]);
        assert_eq!(outer.label, "p1_t1");
        assert_eq!(outer.depth, 0);
        assert_eq!((outer.rows, outer.cols), (2, 3));
        assert_eq!(outer.children, 1);
        assert!(outer.anchor.is_none());

        assert_eq!(inner.label, "p1_t2");
        assert_eq!(inner.page, 1);
        assert_eq!(inner.depth, 1);
        assert_eq!((inner.rows, inner.cols), (2, 2));
        assert_eq!(inner.anchor, Some((2, 3)));

        let rendered = render_outline(&tables);
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[0].starts_with("p1_t1 (page 1"));
        assert!(lines[1].starts_with("  p1_t2 (page 1"));
        assert!(lines[1].ends_with("in parent cell row 2, column 3"));
    }

    #[tokio::test]
    async fn test_document_without_tables_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutDocument {
            source: "blank.json".to_string(),
            pages: vec![PageLayout::new(1, 612.0, 792.0)],
        };
        let input = write_layout(dir.path(), &layout).await;
        let artifact = dir.path().join("blank.tablerag.json");

        let result = process_document(&input, &artifact, &AppConfig::default(), &CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn test_unreadable_input_and_artifact_fail() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();

        let missing = dir.path().join("missing.pdf");
        let result = process_document(&missing, &dir.path().join("out.json"), &config, &CancellationToken::new()).await;
        assert!(result.is_err());

        let err = answer_query(&dir.path().join("missing.json"), "revenue", &config)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ArtifactError>(), Some(ArtifactError::Io { .. })));

        let err = inspect_artifact(&dir.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ArtifactError>(), Some(ArtifactError::Io { .. })));
    }
}
