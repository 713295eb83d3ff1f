pub mod detector;
pub mod diagnostics;
pub mod error;
pub mod geometry;
pub mod lattice;
pub mod layout;
pub mod pdf;
pub mod reader;

pub use detector::{Detection, DetectorConfig, RegionKind, TableDetector, TableId, TableRegion};
pub use diagnostics::{Degradation, Diagnostics};
pub use error::{Cancelled, LayoutError};
pub use geometry::BBox;
pub use layout::{LayoutDocument, PageLayout, RawCell};
pub use reader::LayoutReader;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Generate a stable document ID from file path
pub fn generate_doc_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Document-level facts recorded alongside the detected tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub source: String,
    pub page_count: usize,
    pub likely_scanned: bool,
}

#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub metadata: DocumentMetadata,
    pub detection: Detection,
}

/// Runs detection over an already loaded layout.
pub fn detect_layout(
    layout: &LayoutDocument,
    config: &DetectorConfig,
    cancel: &CancellationToken,
) -> Result<IngestedDocument> {
    let metadata = DocumentMetadata {
        doc_id: generate_doc_id(&layout.source),
        source: layout.source.clone(),
        page_count: layout.page_count(),
        likely_scanned: layout.likely_scanned(),
    };

    let detector = TableDetector::new(config.clone());
    let detection = detector.detect(layout, cancel)?;

    Ok(IngestedDocument {
        metadata,
        detection,
    })
}

/// Main ingestion pipeline: load the layout, then detect tables.
pub async fn ingest_file(
    file_path: &Path,
    config: &DetectorConfig,
    cancel: &CancellationToken,
) -> Result<IngestedDocument> {
    let layout = LayoutReader::read_file(file_path)
        .await
        .with_context(|| format!("Failed to load layout from {}", file_path.display()))?;

    let config = config.clone();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || detect_layout(&layout, &config, &cancel))
        .await
        .context("Detection task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_is_stable() {
        let a = generate_doc_id("reports/q3.pdf");
        let b = generate_doc_id("reports/q3.pdf");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, generate_doc_id("reports/q4.pdf"));
    }

    #[test]
    fn test_detect_layout_records_metadata() {
        let mut page = PageLayout::new(1, 612.0, 792.0);
        for r in 0..2 {
            for c in 0..2 {
                let x = 50.0 + c as f32 * 60.0;
                let y = 50.0 + r as f32 * 20.0;
                page.cells.push(RawCell::ruled(BBox::new(x, y, x + 60.0, y + 20.0), "v"));
            }
        }
        let layout = LayoutDocument {
            source: "memo.json".into(),
            pages: vec![page],
        };

        let doc = detect_layout(&layout, &DetectorConfig::default(), &CancellationToken::new()).unwrap();
        assert_eq!(doc.metadata.page_count, 1);
        assert!(doc.metadata.likely_scanned);
        assert_eq!(doc.detection.regions.len(), 1);
    }
}
