use serde::{Deserialize, Serialize};

use ingest::{BBox, RegionKind, TableId};

/// Inferred type of a cell, column or row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Numeric,
    Date,
    Categorical,
    Text,
    Empty,
}

impl CellType {
    pub fn is_quantitative(self) -> bool {
        matches!(self, CellType::Numeric | CellType::Date)
    }
}

/// One grid cell. Merged cells appear once, at their top-left slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub value: String,
    pub row: usize,
    pub col: usize,
    pub row_span: usize,
    pub col_span: usize,
    pub is_header: bool,
    pub bbox: BBox,
}

impl Cell {
    pub fn covers(&self, row: usize, col: usize) -> bool {
        row >= self.row && row < self.row + self.row_span && col >= self.col && col < self.col + self.col_span
    }

    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }
}

/// Where a nested table sits inside its parent's grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildLink {
    pub child: TableId,
    pub row: usize,
    pub col: usize,
    pub row_span: usize,
    pub col_span: usize,
    /// The child straddles more than one parent column.
    pub wide: bool,
    /// The child straddles more than one parent row.
    pub tall: bool,
}

impl ChildLink {
    pub fn covers(&self, row: usize, col: usize) -> bool {
        row >= self.row && row < self.row + self.row_span && col >= self.col && col < self.col + self.col_span
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStructure {
    pub id: TableId,
    pub label: String,
    pub page: u32,
    pub bbox: BBox,
    pub caption: Option<String>,
    pub kind: RegionKind,
    pub nesting_level: usize,
    pub n_rows: usize,
    pub n_cols: usize,
    pub rows: Vec<Vec<Cell>>,
    pub header_rows: usize,
    pub header_cols: usize,
    pub parent: Option<TableId>,
    pub children: Vec<ChildLink>,
    pub low_confidence: bool,
    #[serde(default)]
    pub confidence_notes: Vec<String>,
}

impl TableStructure {
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.rows.iter().flatten()
    }

    /// The cell occupying grid slot `(row, col)`, following merges.
    pub fn cell_at(&self, row: usize, col: usize) -> Option<&Cell> {
        self.rows
            .iter()
            .take(row + 1)
            .flatten()
            .find(|c| c.covers(row, col))
    }

    /// Value at a grid slot, empty for slots outside the grid.
    pub fn value_at(&self, row: usize, col: usize) -> &str {
        self.cell_at(row, col).map(|c| c.value.as_str()).unwrap_or("")
    }

    pub fn child_at(&self, row: usize, col: usize) -> Option<&ChildLink> {
        self.children.iter().find(|l| l.covers(row, col))
    }

    pub fn child_ids(&self) -> Vec<TableId> {
        self.children.iter().map(|l| l.child).collect()
    }

    /// Header text over a column, multi-level headers joined with " / ".
    pub fn column_label(&self, col: usize) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for row in 0..self.header_rows {
            let value = self.value_at(row, col).trim();
            if !value.is_empty() && parts.last() != Some(&value) {
                parts.push(value);
            }
        }
        if parts.is_empty() {
            format!("Column {}", col + 1)
        } else {
            parts.join(" / ")
        }
    }

    /// Label text for a row: header columns when present, else a leading
    /// non-numeric value.
    pub fn row_label(&self, row: usize) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for col in 0..self.header_cols {
            let value = self.value_at(row, col).trim();
            if !value.is_empty() && parts.last() != Some(&value) {
                parts.push(value);
            }
        }
        if parts.is_empty() {
            let first = self.value_at(row, 0).trim();
            if !first.is_empty() && crate::numeric::parse_number(first).is_none() {
                return first.to_string();
            }
            return format!("Row {}", row + 1);
        }
        parts.join(" / ")
    }

    pub fn column_labels(&self) -> Vec<String> {
        (0..self.n_cols).map(|c| self.column_label(c)).collect()
    }

    /// Structural invariant violations, empty for a well-formed table.
    pub fn violations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for cell in self.cells() {
            if cell.row + cell.row_span > self.n_rows || cell.col + cell.col_span > self.n_cols {
                problems.push(format!(
                    "{}: cell ({}, {}) spans past the {}x{} grid",
                    self.label, cell.row, cell.col, self.n_rows, self.n_cols
                ));
            }
            if cell.row_span == 0 || cell.col_span == 0 {
                problems.push(format!("{}: cell ({}, {}) has a zero span", self.label, cell.row, cell.col));
            }
        }
        problems
    }
}

/// A node stored in a [`TableHierarchy`].
pub trait HierarchyNode {
    fn id(&self) -> TableId;
    fn parent(&self) -> Option<TableId>;
    fn children(&self) -> Vec<TableId>;
    fn label(&self) -> &str;
}

impl HierarchyNode for TableStructure {
    fn id(&self) -> TableId {
        self.id
    }

    fn parent(&self) -> Option<TableId> {
        self.parent
    }

    fn children(&self) -> Vec<TableId> {
        self.child_ids()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Arena of tables indexed by [`TableId`]. Parent and child links are ids,
/// so a child never owns its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableHierarchy<T = TableStructure> {
    nodes: Vec<T>,
}

impl<T> Default for TableHierarchy<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<T: HierarchyNode> TableHierarchy<T> {
    /// Builds the arena; node `i` must carry id `i`.
    pub fn from_nodes(mut nodes: Vec<T>) -> Self {
        nodes.sort_by_key(|n| n.id());
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: TableId) -> Option<&T> {
        self.nodes.get(id.index()).filter(|n| n.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter()
    }

    pub fn roots(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().filter(|n| n.parent().is_none())
    }

    pub fn parent_of(&self, id: TableId) -> Option<&T> {
        self.get(id).and_then(|n| n.parent()).and_then(|p| self.get(p))
    }

    pub fn children_of(&self, id: TableId) -> Vec<&T> {
        self.get(id)
            .map(|n| n.children().into_iter().filter_map(|c| self.get(c)).collect())
            .unwrap_or_default()
    }

    /// Other tables with the same parent (or other roots for a root).
    pub fn siblings_of(&self, id: TableId) -> Vec<&T> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        match node.parent() {
            Some(parent) => self
                .children_of(parent)
                .into_iter()
                .filter(|n| n.id() != id)
                .collect(),
            None => self.roots().filter(|n| n.id() != id).collect(),
        }
    }

    /// Ids from the root down to `id`, inclusive.
    pub fn path_to(&self, id: TableId) -> Vec<TableId> {
        let mut path = Vec::new();
        let mut cursor = self.get(id);
        while let Some(node) = cursor {
            if path.len() > self.nodes.len() {
                break;
            }
            path.push(node.id());
            cursor = node.parent().and_then(|p| self.get(p));
        }
        path.reverse();
        path
    }

    pub fn root_of(&self, id: TableId) -> Option<&T> {
        self.path_to(id).first().and_then(|r| self.get(*r))
    }

    /// Every table in pre-order: each root, then its descendants.
    pub fn preorder(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&T> = self.roots().collect();
        stack.reverse();
        while let Some(node) = stack.pop() {
            out.push(node);
            let mut children = self.children_of(node.id());
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Every node reachable from exactly one root and every parent link
    /// mirrored by a child link.
    pub fn violations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for node in &self.nodes {
            let path = self.path_to(node.id());
            match path.first().and_then(|r| self.get(*r)) {
                Some(root) if root.parent().is_none() => {}
                _ => problems.push(format!("{} has no root ancestor", node.label())),
            }
            if let Some(parent) = node.parent() {
                let linked = self
                    .get(parent)
                    .map(|p| p.children().contains(&node.id()))
                    .unwrap_or(false);
                if !linked {
                    problems.push(format!("{} is not listed by its parent", node.label()));
                }
            }
        }
        problems
    }
}

impl TableHierarchy<TableStructure> {
    /// Child regions must sit inside their parent's box.
    pub fn containment_violations(&self, tolerance: f32) -> Vec<String> {
        self.nodes
            .iter()
            .filter_map(|node| {
                let parent = self.parent_of(node.id)?;
                (!parent.bbox.contains(&node.bbox, tolerance))
                    .then(|| format!("{} escapes its parent {}", node.label, parent.label))
            })
            .collect()
    }
}

/// Points at a cell of a specific table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub table: TableId,
    pub row: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub label: String,
    pub value: f64,
    /// Cell text as written in the document
    pub raw: String,
    pub unit: Option<String>,
    pub source: CellRef,
    /// Normalised financial name, e.g. "net income"
    pub canonical: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    BalanceSheet,
    IncomeStatement,
    CashFlow,
    Comparison,
    Generic,
}

impl TableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TableKind::BalanceSheet => "balance sheet",
            TableKind::IncomeStatement => "income statement",
            TableKind::CashFlow => "cash flow statement",
            TableKind::Comparison => "comparison table",
            TableKind::Generic => "table",
        }
    }

    pub fn is_financial(self) -> bool {
        matches!(
            self,
            TableKind::BalanceSheet | TableKind::IncomeStatement | TableKind::CashFlow
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedTable {
    pub structure: TableStructure,
    pub kind: TableKind,
    pub description: String,
    pub metrics: Vec<Metric>,
    pub column_types: Vec<CellType>,
    pub row_types: Vec<CellType>,
}

impl EnhancedTable {
    pub fn id(&self) -> TableId {
        self.structure.id
    }

    pub fn resolve(&self, cell: &CellRef) -> Option<&Cell> {
        if cell.table != self.structure.id {
            return None;
        }
        self.structure.cell_at(cell.row, cell.col)
    }
}

impl HierarchyNode for EnhancedTable {
    fn id(&self) -> TableId {
        self.structure.id
    }

    fn parent(&self) -> Option<TableId> {
        self.structure.parent
    }

    fn children(&self) -> Vec<TableId> {
        self.structure.child_ids()
    }

    fn label(&self) -> &str {
        &self.structure.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: usize, parent: Option<usize>, children: &[usize]) -> TableStructure {
        TableStructure {
            id: TableId(id),
            label: format!("p1_t{}", id + 1),
            page: 1,
            bbox: BBox::new(0.0, 0.0, 100.0, 100.0),
            caption: None,
            kind: RegionKind::Ruled,
            nesting_level: 0,
            n_rows: 1,
            n_cols: 1,
            rows: vec![vec![Cell {
                value: "x".into(),
                row: 0,
                col: 0,
                row_span: 1,
                col_span: 1,
                is_header: false,
                bbox: BBox::new(0.0, 0.0, 100.0, 100.0),
            }]],
            header_rows: 0,
            header_cols: 0,
            parent: parent.map(TableId),
            children: children
                .iter()
                .map(|&c| ChildLink {
                    child: TableId(c),
                    row: 0,
                    col: 0,
                    row_span: 1,
                    col_span: 1,
                    wide: false,
                    tall: false,
                })
                .collect(),
            low_confidence: false,
            confidence_notes: Vec::new(),
        }
    }

    #[test]
    fn test_hierarchy_navigation() {
        let h = TableHierarchy::from_nodes(vec![
            node(0, None, &[1, 2]),
            node(1, Some(0), &[3]),
            node(2, Some(0), &[]),
            node(3, Some(1), &[]),
            node(4, None, &[]),
        ]);

        assert_eq!(h.path_to(TableId(3)), vec![TableId(0), TableId(1), TableId(3)]);
        assert_eq!(h.root_of(TableId(3)).map(|n| n.id), Some(TableId(0)));
        assert_eq!(h.siblings_of(TableId(1)).len(), 1);
        assert_eq!(h.siblings_of(TableId(0))[0].id, TableId(4));
        let order: Vec<usize> = h.preorder().iter().map(|n| n.id.index()).collect();
        assert_eq!(order, vec![0, 1, 3, 2, 4]);
        assert!(h.violations().is_empty());
    }

    #[test]
    fn test_unlinked_child_is_a_violation() {
        let h = TableHierarchy::from_nodes(vec![node(0, None, &[]), node(1, Some(0), &[])]);
        assert_eq!(h.violations().len(), 1);
    }
}
