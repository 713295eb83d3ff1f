use std::collections::{BTreeSet, HashSet};

use rayon::prelude::*;
use tracing::{debug, info};

use ingest::Degradation;

use crate::matchers::TypeClassifier;
use crate::numeric::{ParsedNumber, format_value, header_unit, parse_number, years_in};
use crate::schema::{
    Cell, CellRef, CellType, EnhancedTable, Metric, TableHierarchy, TableKind, TableStructure,
};

type Keywords = &'static [&'static str];

/// (kind, caption keywords, header keywords)
const KIND_RULES: &[(TableKind, Keywords, Keywords)] = &[
    (
        TableKind::BalanceSheet,
        &["资产负债", "balance sheet"],
        &["资产", "负债", "equity", "asset", "liabilit"],
    ),
    (
        TableKind::IncomeStatement,
        &["收益", "income", "profit", "loss", "损益"],
        &["revenue", "expense", "收入", "支出", "成本", "利润"],
    ),
    (
        TableKind::CashFlow,
        &["现金流", "cash flow"],
        &["cash", "flow", "现金", "流量"],
    ),
];

/// Canonical names, most specific first so "non-current assets" is not
/// mistaken for "current assets".
const BALANCE_SHEET_METRICS: &[(&str, Keywords)] = &[
    ("total assets", &["资产总", "总资产", "total asset", "资产合计"]),
    ("non-current assets", &["非流动资产", "固定资产", "长期资产", "non-current asset"]),
    ("current assets", &["流动资产", "current asset"]),
    ("total liabilities", &["负债总", "总负债", "total liabilit", "负债合计"]),
    ("non-current liabilities", &["非流动负债", "长期负债", "non-current liabilit"]),
    ("current liabilities", &["流动负债", "current liabilit"]),
    ("owners' equity", &["权益总", "总权益", "equity", "股东权益", "所有者权益"]),
];

const INCOME_METRICS: &[(&str, Keywords)] = &[
    ("revenue", &["营业收入", "总收入", "revenue", "sales", "营业额"]),
    ("gross profit", &["毛利", "毛利润", "gross profit"]),
    ("operating profit", &["营业利润", "operating profit"]),
    ("net income", &["净利润", "利润总额", "net income", "net profit", "profit"]),
    ("operating cost", &["营业成本", "成本", "cost", "expense"]),
    ("earnings per share", &["每股收益", "每股盈利", "eps", "earnings per share"]),
];

const CASH_FLOW_METRICS: &[(&str, Keywords)] = &[
    ("operating cash flow", &["经营活动", "operating"]),
    ("investing cash flow", &["投资活动", "investing"]),
    ("financing cash flow", &["筹资活动", "financing"]),
    ("net increase in cash", &["现金净增加", "net increase"]),
];

const DESCRIBED_COLUMNS: usize = 5;

fn metric_map(kind: TableKind) -> &'static [(&'static str, Keywords)] {
    match kind {
        TableKind::BalanceSheet => BALANCE_SHEET_METRICS,
        TableKind::IncomeStatement => INCOME_METRICS,
        TableKind::CashFlow => CASH_FLOW_METRICS,
        TableKind::Comparison | TableKind::Generic => &[],
    }
}

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| haystack.contains(&k.to_lowercase()))
}

/// Attaches descriptions, types and metrics. Output depends only on the
/// input structure and hierarchy, so enhancing twice gives equal results.
pub struct SemanticEnhancer {
    classifier: TypeClassifier,
}

impl Default for SemanticEnhancer {
    fn default() -> Self {
        Self::new(TypeClassifier::default())
    }
}

impl SemanticEnhancer {
    pub fn new(classifier: TypeClassifier) -> Self {
        Self { classifier }
    }

    pub fn enhance_hierarchy(
        &self,
        hierarchy: &TableHierarchy,
    ) -> (TableHierarchy<EnhancedTable>, Vec<Degradation>) {
        let results: Vec<(EnhancedTable, Vec<Degradation>)> = hierarchy
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|s| self.enhance(s, hierarchy))
            .collect();

        let mut tables = Vec::with_capacity(results.len());
        let mut degradations = Vec::new();
        for (table, skipped) in results {
            tables.push(table);
            degradations.extend(skipped);
        }

        let enhanced = TableHierarchy::from_nodes(tables);
        info!(
            tables = enhanced.len(),
            metrics = enhanced.iter().map(|t| t.metrics.len()).sum::<usize>(),
            "Semantic enhancement complete"
        );
        (enhanced, degradations)
    }

    pub fn enhance(
        &self,
        structure: &TableStructure,
        hierarchy: &TableHierarchy,
    ) -> (EnhancedTable, Vec<Degradation>) {
        let mut skipped = Vec::new();

        let column_types = self.column_types(structure);
        let row_types = self.row_types(structure);
        if column_types.iter().all(|t| *t == CellType::Empty) {
            skipped.push(Degradation::EnhancementSkipped {
                table: structure.label.clone(),
                step: "type inference".to_string(),
            });
        }

        let kind = classify_kind(structure);
        let metrics = self.extract_metrics(structure, kind);
        if metrics.is_empty() {
            skipped.push(Degradation::EnhancementSkipped {
                table: structure.label.clone(),
                step: "metric extraction".to_string(),
            });
        }

        let description = describe(structure, kind, &column_types, hierarchy);

        debug!(
            table = %structure.label,
            kind = kind.as_str(),
            metrics = metrics.len(),
            "Enhanced table"
        );

        (
            EnhancedTable {
                structure: structure.clone(),
                kind,
                description,
                metrics,
                column_types,
                row_types,
            },
            skipped,
        )
    }

    fn column_types(&self, s: &TableStructure) -> Vec<CellType> {
        (0..s.n_cols)
            .map(|c| {
                self.classifier
                    .classify((s.header_rows..s.n_rows).map(|r| s.value_at(r, c)))
            })
            .collect()
    }

    fn row_types(&self, s: &TableStructure) -> Vec<CellType> {
        (0..s.n_rows)
            .map(|r| {
                self.classifier
                    .classify((s.header_cols..s.n_cols).map(|c| s.value_at(r, c)))
            })
            .collect()
    }

    fn extract_metrics(&self, s: &TableStructure, kind: TableKind) -> Vec<Metric> {
        let mut metrics = Vec::new();
        let mut used: HashSet<(usize, usize)> = HashSet::new();

        let numeric_cells = |row: Option<usize>, col: Option<usize>| -> Vec<(&Cell, ParsedNumber)> {
            s.cells()
                .filter(|c| !c.is_header)
                .filter(move |c| row.is_none_or(|r| c.row == r) && col.is_none_or(|k| c.col == k))
                .filter_map(|c| parse_number(&c.value).map(|n| (c, n)))
                .collect()
        };

        for r in s.header_rows..s.n_rows {
            let numbers = numeric_cells(Some(r), None);
            if numbers.len() == 1 {
                let (cell, parsed) = &numbers[0];
                let row_label = s.row_label(r);
                let label = if row_label.starts_with("Row ") {
                    s.column_label(cell.col)
                } else {
                    row_label
                };
                used.insert((cell.row, cell.col));
                metrics.push(self.metric(
                    s,
                    kind,
                    label,
                    cell.row,
                    cell.col,
                    &cell.value,
                    parsed.value,
                    parsed.unit.clone(),
                ));
                continue;
            }

            for (cell, parsed) in &numbers {
                if cell.col == 0 {
                    continue;
                }
                let left = s.value_at(r, cell.col - 1).trim();
                if left.is_empty() || parse_number(left).is_some() {
                    continue;
                }
                let label = if s.header_rows > 0 {
                    format!("{} ({})", left, s.column_label(cell.col))
                } else {
                    left.to_string()
                };
                used.insert((cell.row, cell.col));
                metrics.push(self.metric(
                    s,
                    kind,
                    label,
                    cell.row,
                    cell.col,
                    &cell.value,
                    parsed.value,
                    parsed.unit.clone(),
                ));
            }
        }

        for c in s.header_cols..s.n_cols {
            let numbers = numeric_cells(None, Some(c));
            if numbers.len() != 1 {
                continue;
            }
            let (cell, parsed) = &numbers[0];
            if used.contains(&(cell.row, cell.col)) {
                continue;
            }
            used.insert((cell.row, cell.col));
            metrics.push(self.metric(
                s,
                kind,
                s.column_label(c),
                cell.row,
                cell.col,
                &cell.value,
                parsed.value,
                parsed.unit.clone(),
            ));
        }

        metrics
    }

    #[allow(clippy::too_many_arguments)]
    fn metric(
        &self,
        s: &TableStructure,
        kind: TableKind,
        label: String,
        row: usize,
        col: usize,
        raw: &str,
        value: f64,
        unit: Option<String>,
    ) -> Metric {
        let unit = unit
            .or_else(|| header_unit(&s.column_label(col)))
            .or_else(|| header_unit(&s.row_label(row)));
        let lowered = label.to_lowercase();
        let canonical = metric_map(kind)
            .iter()
            .find(|(_, keywords)| contains_any(&lowered, keywords))
            .map(|(name, _)| name.to_string());

        Metric {
            label,
            value,
            raw: raw.trim().to_string(),
            unit,
            source: CellRef {
                table: s.id,
                row,
                col,
            },
            canonical,
        }
    }
}

/// Caption keywords first, then header and row label keywords, then years.
pub fn classify_kind(s: &TableStructure) -> TableKind {
    let caption = s.caption.as_deref().unwrap_or("").to_lowercase();
    for (kind, title_words, _) in KIND_RULES {
        if contains_any(&caption, title_words) {
            return *kind;
        }
    }

    let mut labels: Vec<String> = s.column_labels();
    labels.extend((s.header_rows..s.n_rows).map(|r| s.row_label(r)));
    let header_text = labels.join(" ").to_lowercase();
    for (kind, _, content_words) in KIND_RULES {
        if contains_any(&header_text, content_words) {
            return *kind;
        }
    }

    let column_text = s.column_labels().join(" ");
    if years_in(&column_text).len() >= 2 {
        return TableKind::Comparison;
    }
    TableKind::Generic
}

/// Last numeric value in the first row or column whose label matches.
fn find_total(s: &TableStructure, keywords: &[&str]) -> Option<String> {
    let last_numeric = |values: Vec<&str>| {
        values
            .into_iter()
            .rev()
            .find(|v| parse_number(v).is_some())
            .map(|v| v.trim().to_string())
    };

    for r in s.header_rows..s.n_rows {
        if contains_any(&s.row_label(r).to_lowercase(), keywords) {
            let values = (s.header_cols..s.n_cols).map(|c| s.value_at(r, c)).collect();
            if let Some(v) = last_numeric(values) {
                return Some(v);
            }
        }
    }
    for c in s.header_cols..s.n_cols {
        if contains_any(&s.column_label(c).to_lowercase(), keywords) {
            let values = (s.header_rows..s.n_rows).map(|r| s.value_at(r, c)).collect();
            if let Some(v) = last_numeric(values) {
                return Some(v);
            }
        }
    }
    None
}

fn describe(
    s: &TableStructure,
    kind: TableKind,
    column_types: &[CellType],
    hierarchy: &TableHierarchy,
) -> String {
    let title = s.caption.clone().unwrap_or_else(|| format!("Table {}", s.label));
    let mut text = format!(
        "{}: {} with {} rows and {} columns.",
        title,
        kind.as_str(),
        s.n_rows,
        s.n_cols
    );

    if s.header_rows > 0 {
        let labels = s.column_labels();
        let shown = labels.iter().take(DESCRIBED_COLUMNS).cloned().collect::<Vec<_>>().join(", ");
        text.push_str(&format!(" Columns: {shown}"));
        if labels.len() > DESCRIBED_COLUMNS {
            text.push_str(&format!(" and {} more", labels.len() - DESCRIBED_COLUMNS));
        }
        text.push('.');
    }

    match kind {
        TableKind::BalanceSheet | TableKind::IncomeStatement | TableKind::CashFlow => {
            let totals: Vec<String> = metric_map(kind)
                .iter()
                .filter_map(|(name, keywords)| find_total(s, keywords).map(|v| format!("{name} {v}")))
                .collect();
            if !totals.is_empty() {
                text.push_str(&format!(" Key figures: {}.", totals.join("; ")));
            }
        }
        TableKind::Comparison => text.push_str(&describe_comparison(s)),
        TableKind::Generic => text.push_str(&describe_generic(s, column_types)),
    }

    for link in &s.children {
        let child_label = hierarchy
            .get(link.child)
            .map(|c| c.label.clone())
            .unwrap_or_else(|| link.child.to_string());
        text.push_str(&format!(
            " Contains nested table {} at row {}, column {}.",
            child_label,
            link.row + 1,
            link.col + 1
        ));
    }
    if let Some(parent) = hierarchy.parent_of(s.id) {
        text.push_str(&format!(" Nested inside table {}.", parent.label));
    }
    if s.low_confidence {
        text.push_str(" Layout reconstruction is approximate.");
    }

    text
}

fn describe_comparison(s: &TableStructure) -> String {
    let year_cols: Vec<usize> = (0..s.n_cols)
        .filter(|&c| !years_in(&s.column_label(c)).is_empty())
        .collect();
    let years: BTreeSet<u32> = year_cols
        .iter()
        .flat_map(|&c| years_in(&s.column_label(c)))
        .collect();

    let (Some(first), Some(last)) = (years.first(), years.last()) else {
        return " Compares several groups of data.".to_string();
    };
    let mut text = format!(" Compares data from {first} to {last}.");

    if s.header_rows < s.n_rows {
        let values: Vec<f64> = year_cols
            .iter()
            .filter_map(|&c| parse_number(s.value_at(s.header_rows, c)).map(|n| n.value))
            .collect();
        if values.len() >= 2 && values[0] != 0.0 {
            let growth = (values[values.len() - 1] - values[0]) / values[0].abs() * 100.0;
            let direction = if growth >= 0.0 { "rises" } else { "falls" };
            text.push_str(&format!(
                " The first row {direction} by {:.2}% over the period.",
                growth.abs()
            ));
        }
    }
    text
}

fn describe_generic(s: &TableStructure, column_types: &[CellType]) -> String {
    let mut text = String::new();

    if let Some(c) = (s.header_cols..s.n_cols).find(|&c| column_types.get(c) == Some(&CellType::Numeric)) {
        let values: Vec<f64> = (s.header_rows..s.n_rows)
            .filter_map(|r| parse_number(s.value_at(r, c)).map(|n| n.value))
            .collect();
        if !values.is_empty() {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            text.push_str(&format!(
                " Column '{}' averages {:.2}, ranging from {} to {}.",
                s.column_label(c),
                mean,
                format_value(min),
                format_value(max)
            ));
        }
    }

    if let Some(c) = (0..s.n_cols).find(|&c| {
        matches!(column_types.get(c), Some(CellType::Categorical) | Some(CellType::Text))
    }) {
        let distinct: HashSet<String> = (s.header_rows..s.n_rows)
            .map(|r| s.value_at(r, c).trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect();
        text.push_str(&format!(
            " Column '{}' has {} distinct categories.",
            s.column_label(c),
            distinct.len()
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{AnalyzerConfig, StructureAnalyzer};
    use ingest::{BBox, RawCell, RegionKind, TableId, TableRegion};

    fn region(caption: Option<&str>, rows: &[&[&str]]) -> TableRegion {
        let mut cells = Vec::new();
        for (r, row) in rows.iter().enumerate() {
            for (c, text) in row.iter().enumerate() {
                let x = c as f32 * 80.0;
                let y = r as f32 * 20.0;
                cells.push(RawCell::ruled(BBox::new(x, y, x + 80.0, y + 20.0), *text));
            }
        }
        TableRegion {
            id: TableId(0),
            label: "p1_t1".into(),
            page: 1,
            bbox: BBox::enclosing(cells.iter().map(|c| &c.bbox)).unwrap(),
            cells,
            parent: None,
            nesting_level: 0,
            caption: caption.map(str::to_string),
            kind: RegionKind::Ruled,
        }
    }

    fn enhance(region: &TableRegion) -> EnhancedTable {
        let structure = StructureAnalyzer::new(AnalyzerConfig::default()).analyze_region(region);
        let hierarchy = TableHierarchy::from_nodes(vec![structure.clone()]);
        SemanticEnhancer::default().enhance(&structure, &hierarchy).0
    }

    #[test]
    fn test_income_statement_metrics() {
        let table = enhance(&region(
            Some("Consolidated income statement (USD m)"),
            &[
                &["Item", "2022", "2023"],
                &["Revenue", "1,000", "1,200"],
                &["Net income", "100", "150"],
                &["Total revenue", "2,200", ""],
            ],
        ));

        assert_eq!(table.kind, TableKind::IncomeStatement);
        assert_eq!(table.column_types[1], CellType::Numeric);

        let total = table.metrics.iter().find(|m| m.label == "Total revenue").unwrap();
        assert_eq!(total.value, 2200.0);
        assert_eq!(total.canonical.as_deref(), Some("revenue"));
        let pair = table.metrics.iter().find(|m| m.label == "Revenue (2022)").unwrap();
        assert_eq!(pair.value, 1000.0);
        assert!(table.description.contains("Key figures: revenue 1,200"));

        for metric in &table.metrics {
            assert!(table.resolve(&metric.source).is_some());
        }
    }

    #[test]
    fn test_comparison_description() {
        let table = enhance(&region(
            None,
            &[&["Region", "2021", "2023"], &["North", "50", "75"], &["South", "40", "30"]],
        ));
        assert_eq!(table.kind, TableKind::Comparison);
        assert!(table.description.contains("from 2021 to 2023"));
        assert!(table.description.contains("rises by 50.00%"));
    }

    #[test]
    fn test_generic_description_and_column_metric() {
        let table = enhance(&region(
            Some("Staff"),
            &[
                &["Team", "Headcount", "Budget"],
                &["Core", "12", "300"],
                &["Tools", "8", ""],
                &["Ops", "5", ""],
            ],
        ));
        assert_eq!(table.kind, TableKind::Generic);
        assert!(
            table
                .description
                .contains("Column 'Headcount' averages 8.33, ranging from 5 to 12.")
        );
        assert!(table.description.contains("Column 'Team' has 3 distinct categories."));

        assert_eq!(table.metrics.len(), 4);
        let budget = table.metrics.iter().find(|m| m.label == "Budget").unwrap();
        assert_eq!(budget.value, 300.0);
        assert_eq!(budget.source.col, 2);
        assert!(table.metrics.iter().any(|m| m.label == "Core (Headcount)"));
        assert!(table.metrics.iter().any(|m| m.label == "Tools"));
    }

    #[test]
    fn test_enhancement_is_idempotent() {
        let r = region(
            Some("Balance sheet"),
            &[&["Item", "Amount"], &["Total assets", "1,200"], &["Total liabilities", "800"]],
        );
        let structure = StructureAnalyzer::new(AnalyzerConfig::default()).analyze_region(&r);
        let hierarchy = TableHierarchy::from_nodes(vec![structure.clone()]);
        let enhancer = SemanticEnhancer::default();

        let (first, _) = enhancer.enhance(&structure, &hierarchy);
        let (second, _) = enhancer.enhance(&first.structure, &hierarchy);
        assert_eq!(first, second);
        assert_eq!(first.kind, TableKind::BalanceSheet);
        assert!(first.description.contains("total assets 1,200"));
    }

    #[test]
    fn test_text_only_table_skips_metrics() {
        let r = region(None, &[&["Name", "Role"], &["Ada", "Lead"], &["Lin", "Dev"]]);
        let structure = StructureAnalyzer::new(AnalyzerConfig::default()).analyze_region(&r);
        let hierarchy = TableHierarchy::from_nodes(vec![structure.clone()]);
        let (table, skipped) = SemanticEnhancer::default().enhance(&structure, &hierarchy);

        assert!(table.metrics.is_empty());
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].kind(), "enhancement_skipped");
    }
}
