use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ingest::TableId;

/// Level at which a table is serialized into a searchable chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Table,
    Row,
    Column,
    Metric,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [
        Granularity::Table,
        Granularity::Row,
        Granularity::Column,
        Granularity::Metric,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Table => "table",
            Granularity::Row => "row",
            Granularity::Column => "column",
            Granularity::Metric => "metric",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Owning table; a weak reference resolved through the hierarchy
    pub table_id: TableId,
    pub table_label: String,
    pub page: u32,
    /// Table ids from the document root down to the owning table
    pub nesting_path: Vec<TableId>,
    pub row: Option<usize>,
    pub col: Option<usize>,
    pub metric_label: Option<String>,
    pub metric_value: Option<f64>,
    pub unit: Option<String>,
    /// Position in the document-wide chunk sequence
    pub doc_order: usize,
}

impl ChunkMetadata {
    /// Nesting depth of the owning table, 0 for a root table.
    pub fn depth(&self) -> usize {
        self.nesting_path.len().saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    pub chunk_id: String,
    pub granularity: Granularity,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(
        doc_id: String,
        granularity: Granularity,
        unit_index: usize,
        text: String,
        metadata: ChunkMetadata,
    ) -> Self {
        // Generate stable chunk_id from content
        let chunk_id = Self::generate_chunk_id(
            &doc_id,
            &metadata.table_label,
            granularity,
            unit_index,
            &text,
        );

        Self {
            doc_id,
            chunk_id,
            granularity,
            text,
            metadata,
        }
    }

    fn generate_chunk_id(
        doc_id: &str,
        table_label: &str,
        granularity: Granularity,
        unit_index: usize,
        text: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(doc_id.as_bytes());
        hasher.update(table_label.as_bytes());
        hasher.update(granularity.as_str().as_bytes());
        hasher.update(unit_index.to_string().as_bytes());
        hasher.update(text.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(label: &str) -> ChunkMetadata {
        ChunkMetadata {
            table_id: TableId(0),
            table_label: label.to_string(),
            page: 1,
            nesting_path: vec![TableId(0)],
            row: Some(1),
            col: None,
            metric_label: None,
            metric_value: None,
            unit: None,
            doc_order: 0,
        }
    }

    #[test]
    fn test_chunk_id_is_stable_and_distinguishes_units() {
        let a = Chunk::new("doc".into(), Granularity::Row, 1, "Retail: 1,200".into(), metadata("p1_t1"));
        let b = Chunk::new("doc".into(), Granularity::Row, 1, "Retail: 1,200".into(), metadata("p1_t1"));
        let c = Chunk::new("doc".into(), Granularity::Column, 1, "Retail: 1,200".into(), metadata("p1_t1"));

        assert_eq!(a.chunk_id, b.chunk_id);
        assert_ne!(a.chunk_id, c.chunk_id);
        assert_eq!(a.chunk_id.len(), 32);
        assert_eq!(a.metadata.depth(), 0);
    }
}
