pub mod enhancer;
pub mod grid;
pub mod matchers;
pub mod numeric;
pub mod schema;
pub mod structure;

pub use enhancer::{SemanticEnhancer, classify_kind};
pub use matchers::{CellMatcher, TypeClassifier};
pub use numeric::{ParsedNumber, parse_number};
pub use schema::{
    Cell, CellRef, CellType, ChildLink, EnhancedTable, HierarchyNode, Metric, TableHierarchy,
    TableKind, TableStructure,
};
pub use structure::{AnalyzerConfig, StructureAnalyzer};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use ingest::{Degradation, Detection};

/// Structure analysis followed by semantic enhancement.
pub struct Extractor {
    analyzer: StructureAnalyzer,
    enhancer: SemanticEnhancer,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

impl Extractor {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            analyzer: StructureAnalyzer::new(config),
            enhancer: SemanticEnhancer::default(),
        }
    }

    pub fn with_parts(analyzer: StructureAnalyzer, enhancer: SemanticEnhancer) -> Self {
        Self { analyzer, enhancer }
    }

    /// Builds the enhanced hierarchy for every detected table.
    pub fn extract(
        &self,
        detection: &Detection,
        cancel: &CancellationToken,
    ) -> Result<(TableHierarchy<EnhancedTable>, Vec<Degradation>)> {
        let (structures, mut degradations) = self
            .analyzer
            .analyze(detection, cancel)
            .context("Structure analysis interrupted")?;

        let (enhanced, skipped) = self.enhancer.enhance_hierarchy(&structures);
        degradations.extend(skipped);

        info!(
            tables = enhanced.len(),
            roots = enhanced.roots().count(),
            degradations = degradations.len(),
            "Extraction complete"
        );
        Ok((enhanced, degradations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest::{BBox, DetectorConfig, PageLayout, RawCell, TableDetector, TableId};

    fn nested_page() -> PageLayout {
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
        page
    }

    #[test]
    fn test_extract_nested_document() {
        let detection = TableDetector::new(DetectorConfig::default()).detect_single_page(&nested_page());
        let (hierarchy, _) = Extractor::default()
            .extract(&detection, &CancellationToken::new())
            .unwrap();

        assert_eq!(hierarchy.len(), 2);
        let outer = hierarchy.get(TableId(0)).unwrap();
        let inner = hierarchy.get(TableId(1)).unwrap();
        assert!(outer.description.contains("Contains nested table p1_t2 at row 2, column 3."));
        assert!(inner.description.contains("Nested inside table p1_t1."));
        assert!(inner.metrics.iter().any(|m| m.label == "Online" && m.value == 700.0));
        assert!(hierarchy.violations().is_empty());
    }

    #[test]
    fn test_cancelled_extraction_fails() {
        let detection = TableDetector::new(DetectorConfig::default()).detect_single_page(&nested_page());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(Extractor::default().extract(&detection, &cancel).is_err());
    }
}
