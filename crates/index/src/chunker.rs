use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use extract::numeric::format_value;
use extract::{CellType, EnhancedTable, TableHierarchy, parse_number};

use crate::chunk::{Chunk, ChunkMetadata, Granularity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Data rows shown in the table-level chunk
    pub preview_rows: usize,
    /// Metrics listed in the table-level chunk
    pub summary_metrics: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            preview_rows: 3,
            summary_metrics: 8,
        }
    }
}

/// Serializes enhanced tables into table, row, column and metric chunks.
/// Output is a pure function of the hierarchy, so re-chunking yields the
/// same ids.
pub struct Chunker {
    config: ChunkerConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunks every table in pre-order, so a parent's chunks precede its
    /// children's.
    pub fn chunk_document(&self, doc_id: &str, hierarchy: &TableHierarchy<EnhancedTable>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for table in hierarchy.preorder() {
            let first = chunks.len();
            chunks.extend(self.chunk_table(doc_id, table, hierarchy, first));
        }
        info!(
            doc_id,
            tables = hierarchy.len(),
            chunks = chunks.len(),
            "Chunked document"
        );
        chunks
    }

    /// One table chunk, one chunk per row, per column and per metric, in
    /// that order. `first_order` is the document position of the first one.
    pub fn chunk_table(
        &self,
        doc_id: &str,
        table: &EnhancedTable,
        hierarchy: &TableHierarchy<EnhancedTable>,
        first_order: usize,
    ) -> Vec<Chunk> {
        let s = &table.structure;
        let view = TableView::new(table, hierarchy);
        let mut chunks = Vec::with_capacity(1 + s.n_rows + s.n_cols + table.metrics.len());

        let mut push = |granularity: Granularity, unit: usize, text: String, meta: Partial| {
            let metadata = ChunkMetadata {
                table_id: s.id,
                table_label: s.label.clone(),
                page: s.page,
                nesting_path: view.path.clone(),
                row: meta.row,
                col: meta.col,
                metric_label: meta.metric_label,
                metric_value: meta.metric_value,
                unit: meta.unit,
                doc_order: first_order + chunks.len(),
            };
            chunks.push(Chunk::new(doc_id.to_string(), granularity, unit, text, metadata));
        };

        push(Granularity::Table, 0, self.table_text(&view), Partial::default());

        for r in 0..s.n_rows {
            let meta = Partial {
                row: Some(r),
                ..Partial::default()
            };
            push(Granularity::Row, r, view.row_text(r), meta);
        }

        for c in 0..s.n_cols {
            let meta = Partial {
                col: Some(c),
                ..Partial::default()
            };
            push(Granularity::Column, c, view.column_text(c), meta);
        }

        for (i, metric) in table.metrics.iter().enumerate() {
            let unit = metric.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default();
            let mut text = format!("{}: {}{}", metric.label, metric.raw, unit);
            if let Some(canonical) = &metric.canonical
                && !metric.label.to_lowercase().contains(canonical.as_str())
            {
                text.push_str(&format!(" ({canonical})"));
            }
            if let Some(caption) = &s.caption {
                text.push_str(&format!(", {caption}"));
            }
            let meta = Partial {
                row: Some(metric.source.row),
                col: Some(metric.source.col),
                metric_label: Some(metric.label.clone()),
                metric_value: Some(metric.value),
                unit: metric.unit.clone(),
            };
            push(Granularity::Metric, i, text, meta);
        }

        debug!(table = %s.label, chunks = chunks.len(), "Chunked table");
        chunks
    }

    fn table_text(&self, view: &TableView<'_>) -> String {
        let table = view.table;
        let s = &table.structure;
        let mut lines = vec![
            format!("{} ({}, page {})", view.heading, table.kind.as_str(), s.page),
            table.description.clone(),
        ];

        if s.header_rows > 0 {
            lines.push(format!("Column labels: {}", s.column_labels().join(" | ")));
        }

        if !table.metrics.is_empty() {
            let shown: Vec<String> = table
                .metrics
                .iter()
                .take(self.config.summary_metrics)
                .map(|m| format!("{} {}", m.label, m.raw))
                .collect();
            lines.push(format!("Metrics: {}", shown.join("; ")));
        }

        let preview: Vec<String> = (s.header_rows..s.n_rows)
            .take(self.config.preview_rows)
            .map(|r| {
                view.row_slots(r)
                    .into_iter()
                    .map(|(_, text)| if text.is_empty() { "-".to_string() } else { text })
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect();
        if !preview.is_empty() {
            lines.push(format!("Preview: {}", preview.join(" / ")));
        }

        lines.join("\n")
    }
}

#[derive(Default)]
struct Partial {
    row: Option<usize>,
    col: Option<usize>,
    metric_label: Option<String>,
    metric_value: Option<f64>,
    unit: Option<String>,
}

/// Rendering helpers over one table and its place in the hierarchy.
struct TableView<'a> {
    table: &'a EnhancedTable,
    hierarchy: &'a TableHierarchy<EnhancedTable>,
    path: Vec<ingest::TableId>,
    heading: String,
}

impl<'a> TableView<'a> {
    fn new(table: &'a EnhancedTable, hierarchy: &'a TableHierarchy<EnhancedTable>) -> Self {
        let s = &table.structure;
        let path = hierarchy.path_to(s.id);
        let labels: Vec<&str> = path
            .iter()
            .filter_map(|id| hierarchy.get(*id))
            .map(|t| t.structure.label.as_str())
            .collect();
        let mut heading = format!("Table {}", labels.join(" > "));
        if let Some(caption) = &s.caption {
            heading.push_str(&format!(" \"{caption}\""));
        }
        Self {
            table,
            hierarchy,
            path,
            heading,
        }
    }

    /// Slot text with the nested table marker appended when a child is
    /// anchored there.
    fn slot_text(&self, row: usize, col: usize) -> String {
        let s = &self.table.structure;
        let mut text = s.value_at(row, col).trim().to_string();
        if let Some(link) = s.child_at(row, col) {
            let label = self
                .hierarchy
                .get(link.child)
                .map(|c| c.structure.label.clone())
                .unwrap_or_else(|| link.child.to_string());
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!("[nested table {label}]"));
        }
        text
    }

    /// Distinct cells of a row as (column, text); merged cells appear once.
    fn row_slots(&self, row: usize) -> Vec<(usize, String)> {
        let s = &self.table.structure;
        (0..s.n_cols)
            .filter(|&c| s.cell_at(row, c).is_none_or(|cell| cell.col == c))
            .map(|c| (c, self.slot_text(row, c)))
            .collect()
    }

    /// Distinct cells of a column as (row, text); merged cells appear once.
    fn column_slots(&self, col: usize) -> Vec<(usize, String)> {
        let s = &self.table.structure;
        (0..s.n_rows)
            .filter(|&r| s.cell_at(r, col).is_none_or(|cell| cell.row == r))
            .map(|r| (r, self.slot_text(r, col)))
            .collect()
    }

    fn row_text(&self, row: usize) -> String {
        let s = &self.table.structure;
        if row < s.header_rows {
            let values: Vec<String> = self
                .row_slots(row)
                .into_iter()
                .map(|(_, t)| t)
                .filter(|t| !t.is_empty())
                .collect();
            return format!("{} header row {}: {}", self.heading, row + 1, values.join(" | "));
        }

        let row_label = s.row_label(row);
        let pairs: Vec<String> = self
            .row_slots(row)
            .into_iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(c, t)| {
                if c < s.header_cols || t == row_label {
                    t
                } else {
                    format!("{}: {}", s.column_label(c), t)
                }
            })
            .collect();
        let body = if pairs.is_empty() {
            "(empty)".to_string()
        } else {
            pairs.join("; ")
        };
        format!("{} row {} ({}): {}", self.heading, row + 1, row_label, body)
    }

    fn column_text(&self, col: usize) -> String {
        let s = &self.table.structure;
        let label = s.column_label(col);
        let entries: Vec<String> = self
            .column_slots(col)
            .into_iter()
            .filter(|(r, t)| *r >= s.header_rows && !t.is_empty())
            .map(|(r, t)| {
                let row_label = s.row_label(r);
                if col < s.header_cols || t == row_label {
                    t
                } else {
                    format!("{row_label}: {t}")
                }
            })
            .collect();

        let mut text = format!("{} column {} ({}): ", self.heading, col + 1, label);
        if entries.is_empty() {
            text.push_str("(empty)");
        } else {
            text.push_str(&entries.join("; "));
        }
        text.push('.');

        let values: Vec<&str> = (s.header_rows..s.n_rows).map(|r| s.value_at(r, col)).collect();
        match self.table.column_types.get(col) {
            Some(CellType::Numeric) => {
                let numbers: Vec<f64> = values
                    .iter()
                    .filter_map(|v| parse_number(v))
                    .map(|n| n.value)
                    .collect();
                if !numbers.is_empty() {
                    let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                    let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    text.push_str(&format!(
                        " Numeric values: mean {}, min {}, max {}.",
                        format_value(mean),
                        format_value(min),
                        format_value(max)
                    ));
                }
            }
            Some(CellType::Empty) | None => {}
            Some(_) => {
                let mut distinct: Vec<String> = values
                    .iter()
                    .map(|v| v.trim().to_lowercase())
                    .filter(|v| !v.is_empty())
                    .collect();
                distinct.sort();
                distinct.dedup();
                text.push_str(&format!(" {} distinct values.", distinct.len()));
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::Extractor;
    use ingest::{BBox, DetectorConfig, PageLayout, RawCell, TableDetector, TableId};
    use std::collections::HashSet;
    use tokio_util::sync::CancellationToken;

    fn push_grid(page: &mut PageLayout, x0: f32, y0: f32, w: f32, h: f32, rows: &[&[&str]]) {
        for (r, row) in rows.iter().enumerate() {
            for (c, text) in row.iter().enumerate() {
                let x = x0 + c as f32 * w;
                let y = y0 + r as f32 * h;
                page.cells.push(RawCell::ruled(BBox::new(x, y, x + w, y + h), *text));
            }
        }
    }

    fn nested_hierarchy() -> TableHierarchy<EnhancedTable> {
        let mut page = PageLayout::new(1, 612.0, 792.0);
        push_grid(
            &mut page,
            50.0,
            100.0,
            120.0,
            80.0,
            &[&["Segment", "Revenue", "Breakdown"], &["Retail", "1,200", ""]],
        );
        push_grid(&mut page, 300.0, 190.0, 50.0, 30.0, &[&["Online", "700"], &["Stores", "500"]]);
        let detection = TableDetector::new(DetectorConfig::default()).detect_single_page(&page);
        let (hierarchy, _) = Extractor::default()
            .extract(&detection, &CancellationToken::new())
            .unwrap();
        hierarchy
    }

    #[test]
    fn test_nested_document_chunk_counts() {
        let hierarchy = nested_hierarchy();
        let chunks = Chunker::default().chunk_document("doc", &hierarchy);

        let count = |table: usize, g: Granularity| {
            chunks
                .iter()
                .filter(|c| c.metadata.table_id == TableId(table) && c.granularity == g)
                .count()
        };
        assert_eq!(count(0, Granularity::Table), 1);
        assert_eq!(count(0, Granularity::Row), 2);
        assert_eq!(count(0, Granularity::Column), 3);
        assert_eq!(count(1, Granularity::Table), 1);
        assert_eq!(count(1, Granularity::Row), 2);
        assert_eq!(count(1, Granularity::Column), 2);
        assert!(chunks.len() >= 12);

        // parent chunks come first and doc_order follows the sequence
        assert_eq!(chunks[0].metadata.table_id, TableId(0));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.doc_order, i);
        }

        let inner_row = chunks
            .iter()
            .find(|c| c.metadata.table_id == TableId(1) && c.granularity == Granularity::Row)
            .unwrap();
        assert_eq!(inner_row.metadata.nesting_path, vec![TableId(0), TableId(1)]);
        assert_eq!(inner_row.metadata.depth(), 1);
        assert!(inner_row.text.starts_with("Table p1_t1 > p1_t2 row 1"));
    }

    #[test]
    fn test_every_cell_in_row_and_column_chunks() {
        let hierarchy = nested_hierarchy();
        let chunks = Chunker::default().chunk_document("doc", &hierarchy);

        for table in hierarchy.iter() {
            let s = &table.structure;
            for cell in s.cells().filter(|c| !c.is_empty()) {
                let in_row = chunks.iter().any(|c| {
                    c.metadata.table_id == s.id
                        && c.granularity == Granularity::Row
                        && c.metadata.row == Some(cell.row)
                        && c.text.contains(&cell.value)
                });
                let in_column = chunks.iter().any(|c| {
                    c.metadata.table_id == s.id
                        && c.granularity == Granularity::Column
                        && c.metadata.col == Some(cell.col)
                        && c.text.contains(&cell.value)
                });
                assert!(in_row, "{} missing from row chunks", cell.value);
                assert!(in_column, "{} missing from column chunks", cell.value);
            }

            for metric in &table.metrics {
                let hits = chunks
                    .iter()
                    .filter(|c| {
                        c.granularity == Granularity::Metric
                            && c.metadata.table_id == s.id
                            && c.metadata.metric_label.as_deref() == Some(metric.label.as_str())
                    })
                    .count();
                assert_eq!(hits, 1);
            }
        }
    }

    #[test]
    fn test_anchor_cell_mentions_nested_table() {
        let hierarchy = nested_hierarchy();
        let chunks = Chunker::default().chunk_document("doc", &hierarchy);

        let anchor_row = chunks
            .iter()
            .find(|c| {
                c.metadata.table_id == TableId(0)
                    && c.granularity == Granularity::Row
                    && c.metadata.row == Some(1)
            })
            .unwrap();
        assert!(anchor_row.text.contains("Breakdown: [nested table p1_t2]"));

        let metric = chunks
            .iter()
            .find(|c| c.granularity == Granularity::Metric && c.metadata.table_id == TableId(1))
            .unwrap();
        assert_eq!(metric.text, "Online: 700");
        assert_eq!(metric.metadata.metric_value, Some(700.0));
    }

    #[test]
    fn test_rechunking_gives_identical_ids() {
        let hierarchy = nested_hierarchy();
        let chunker = Chunker::default();
        let first: Vec<String> = chunker
            .chunk_document("doc", &hierarchy)
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();
        let second: Vec<String> = chunker
            .chunk_document("doc", &hierarchy)
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.iter().collect::<HashSet<_>>().len(), first.len());
    }
}
