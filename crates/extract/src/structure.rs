use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ingest::{BBox, Cancelled, Degradation, Detection, TableId, TableRegion};

use crate::grid::build_grid;
use crate::matchers::TypeClassifier;
use crate::numeric::is_year_label;
use crate::schema::{CellType, ChildLink, TableHierarchy, TableStructure};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub row_tolerance: f32,
    pub col_tolerance: f32,
    pub max_header_rows: usize,
    pub max_header_cols: usize,
    /// Share of body cells that must be numeric or dates below a header.
    pub header_dominance: f64,
    /// Slack when testing whether a cell contains a nested table.
    pub anchor_tolerance: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            row_tolerance: 4.0,
            col_tolerance: 8.0,
            max_header_rows: 3,
            max_header_cols: 2,
            header_dominance: 0.5,
            anchor_tolerance: 2.0,
        }
    }
}

pub struct StructureAnalyzer {
    config: AnalyzerConfig,
    classifier: TypeClassifier,
}

impl StructureAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self::with_classifier(config, TypeClassifier::default())
    }

    pub fn with_classifier(config: AnalyzerConfig, classifier: TypeClassifier) -> Self {
        Self { config, classifier }
    }

    /// Builds the grid for one region. Children are not attached.
    pub fn analyze_region(&self, region: &TableRegion) -> TableStructure {
        let grid = build_grid(
            &region.cells,
            &region.bbox,
            self.config.row_tolerance,
            self.config.col_tolerance,
        );

        let mut structure = TableStructure {
            id: region.id,
            label: region.label.clone(),
            page: region.page,
            bbox: region.bbox,
            caption: region.caption.clone(),
            kind: region.kind,
            nesting_level: region.nesting_level,
            n_rows: grid.n_rows,
            n_cols: grid.n_cols,
            rows: grid.rows(),
            header_rows: 0,
            header_cols: 0,
            parent: region.parent,
            children: Vec::new(),
            low_confidence: !grid.notes.is_empty(),
            confidence_notes: grid.notes,
        };

        structure.header_rows = self.detect_header_rows(&structure);
        structure.header_cols = self.detect_header_cols(&structure);
        for cell in structure.rows.iter_mut().flatten() {
            cell.is_header = cell.row < structure.header_rows || cell.col < structure.header_cols;
        }

        debug!(
            table = %structure.label,
            rows = structure.n_rows,
            cols = structure.n_cols,
            header_rows = structure.header_rows,
            header_cols = structure.header_cols,
            low_confidence = structure.low_confidence,
            "Analyzed table grid"
        );
        structure
    }

    /// Analyzes every detected region. Each child is analyzed before it is
    /// attached to its parent; independent root trees run in parallel.
    pub fn analyze(
        &self,
        detection: &Detection,
        cancel: &CancellationToken,
    ) -> Result<(TableHierarchy, Vec<Degradation>), Cancelled> {
        let mut children: HashMap<TableId, Vec<&TableRegion>> = HashMap::new();
        for region in &detection.regions {
            if let Some(parent) = region.parent {
                children.entry(parent).or_default().push(region);
            }
        }

        let roots: Vec<&TableRegion> = detection.roots().collect();
        let trees: Vec<Vec<TableStructure>> = roots
            .par_iter()
            .map(|root| {
                let mut out = Vec::new();
                self.analyze_tree(root, &children, cancel, &mut out)?;
                Ok(out)
            })
            .collect::<Result<_, Cancelled>>()?;

        let structures: Vec<TableStructure> = trees.into_iter().flatten().collect();
        let degradations = structures
            .iter()
            .filter(|s| s.low_confidence)
            .map(|s| Degradation::StructureLowConfidence {
                table: s.label.clone(),
                reason: s.confidence_notes.join("; "),
            })
            .collect();

        let hierarchy = TableHierarchy::from_nodes(structures);
        info!(
            tables = hierarchy.len(),
            roots = hierarchy.roots().count(),
            "Structure analysis complete"
        );
        Ok((hierarchy, degradations))
    }

    /// Post-order walk: children are pushed to `out` before their parent.
    fn analyze_tree(
        &self,
        region: &TableRegion,
        children: &HashMap<TableId, Vec<&TableRegion>>,
        cancel: &CancellationToken,
        out: &mut Vec<TableStructure>,
    ) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let kids = children.get(&region.id).map(Vec::as_slice).unwrap_or(&[]);
        for child in kids {
            self.analyze_tree(child, children, cancel, out)?;
        }

        let mut structure = self.analyze_region(region);
        for child in kids {
            // the child's structure already exists in `out`
            let link = self.anchor(&mut structure, child.id, &child.bbox);
            structure.children.push(link);
        }
        out.push(structure);
        Ok(())
    }

    /// Anchors a child at the smallest cell holding it, or at the minimal
    /// cell range it overlaps.
    fn anchor(&self, parent: &mut TableStructure, child: TableId, child_bbox: &BBox) -> ChildLink {
        let tol = self.config.anchor_tolerance;

        let holder = parent
            .cells()
            .filter(|c| c.bbox.contains(child_bbox, tol))
            .min_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()));
        if let Some(cell) = holder {
            return ChildLink {
                child,
                row: cell.row,
                col: cell.col,
                row_span: cell.row_span,
                col_span: cell.col_span,
                wide: false,
                tall: false,
            };
        }

        let overlapping: Vec<(usize, usize, usize, usize)> = parent
            .cells()
            .filter(|c| c.bbox.overlap_area(child_bbox) > 0.0)
            .map(|c| (c.row, c.row + c.row_span, c.col, c.col + c.col_span))
            .collect();

        if overlapping.is_empty() {
            parent.low_confidence = true;
            parent
                .confidence_notes
                .push(format!("nested table {} does not overlap any cell", child));
            return ChildLink {
                child,
                row: 0,
                col: 0,
                row_span: parent.n_rows.max(1),
                col_span: parent.n_cols.max(1),
                wide: parent.n_cols > 1,
                tall: parent.n_rows > 1,
            };
        }

        let row = overlapping.iter().map(|o| o.0).min().unwrap_or(0);
        let row_end = overlapping.iter().map(|o| o.1).max().unwrap_or(row + 1);
        let col = overlapping.iter().map(|o| o.2).min().unwrap_or(0);
        let col_end = overlapping.iter().map(|o| o.3).max().unwrap_or(col + 1);

        ChildLink {
            child,
            row,
            col,
            row_span: row_end - row,
            col_span: col_end - col,
            wide: col_end - col > 1,
            tall: row_end - row > 1,
        }
    }

    fn is_label(&self, value: &str) -> bool {
        let value = value.trim();
        if is_year_label(value) {
            return true;
        }
        !self.classifier.classify_value(value).is_quantitative()
    }

    /// Leading rows made of labels above a mostly quantitative body.
    fn detect_header_rows(&self, s: &TableStructure) -> usize {
        let mut leading = 0;
        while leading < self.config.max_header_rows && leading + 1 < s.n_rows {
            let values: Vec<&str> = (0..s.n_cols)
                .map(|c| s.value_at(leading, c))
                .filter(|v| !v.trim().is_empty())
                .collect();
            if values.is_empty() || !values.iter().all(|v| self.is_label(v)) {
                break;
            }
            leading += 1;
        }

        (1..=leading)
            .rev()
            .find(|&h| {
                let body = (h..s.n_rows).flat_map(|r| (0..s.n_cols).map(move |c| (r, c)));
                self.quantitative_share(s, body) >= self.config.header_dominance
            })
            .unwrap_or(0)
    }

    /// Leading columns of labels beside a mostly quantitative body.
    fn detect_header_cols(&self, s: &TableStructure) -> usize {
        let first_body_row = s.header_rows;
        let mut leading = 0;
        while leading < self.config.max_header_cols && leading + 1 < s.n_cols {
            let values: Vec<&str> = (first_body_row..s.n_rows)
                .map(|r| s.value_at(r, leading))
                .filter(|v| !v.trim().is_empty())
                .collect();
            if values.is_empty() || values.iter().any(|v| self.is_quantitative(v)) {
                break;
            }
            leading += 1;
        }

        (1..=leading)
            .rev()
            .find(|&h| {
                let body = (first_body_row..s.n_rows).flat_map(|r| (h..s.n_cols).map(move |c| (r, c)));
                self.quantitative_share(s, body) >= self.config.header_dominance
            })
            .unwrap_or(0)
    }

    fn is_quantitative(&self, value: &str) -> bool {
        self.classifier.classify_value(value).is_quantitative()
    }

    fn quantitative_share(&self, s: &TableStructure, slots: impl Iterator<Item = (usize, usize)>) -> f64 {
        let mut total = 0usize;
        let mut hits = 0usize;
        for (r, c) in slots {
            let value = s.value_at(r, c);
            if value.trim().is_empty() {
                continue;
            }
            total += 1;
            if self.classifier.classify_value(value) == CellType::Numeric
                || self.classifier.classify_value(value) == CellType::Date
            {
                hits += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
