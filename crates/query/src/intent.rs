//! Surface-feature intent classification. Keyword lists cover English and
//! Chinese queries.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use extract::numeric::years_in;
use extract::{EnhancedTable, TableHierarchy};
use index::Granularity;
use ingest::TableId;

const RELATIONSHIP_TERMS: &[&str] = &[
    "nested", "inner", "inside", "child", "children", "sub", "subtable", "parent", "outer",
    "contains", "contain", "containing", "within", "enclosing", "嵌套", "子表", "父表", "包含",
    "内部",
];

const PARENT_TERMS: &[&str] = &[
    "parent", "outer", "contains", "contain", "containing", "enclosing", "父表", "包含",
];

const COMPARISON_TERMS: &[&str] = &[
    "compare", "compared", "comparison", "versus", "vs", "difference", "differ", "change",
    "changed", "higher than", "lower than", "more than", "less than", "rise", "drop", "increase",
    "decrease", "decline", "对比", "比较", "差异", "变化", "高于", "低于", "增长", "下降",
];

const AGGREGATION_TERMS: &[&str] = &[
    "total", "sum", "average", "mean", "avg", "calculate", "compute", "percentage", "percent",
    "ratio", "proportion", "share", "growth rate", "总计", "总额", "总数", "合计", "平均", "计算",
    "占比", "比例", "百分比", "增长率",
];

const PERCENTAGE_TERMS: &[&str] = &[
    "percentage", "percent", "ratio", "proportion", "share", "占比", "比例", "百分比",
];
const AVERAGE_TERMS: &[&str] = &["average", "mean", "avg", "平均"];
const GROWTH_TERMS: &[&str] = &["growth", "grow", "increase", "增长率", "增长"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Lookup,
    Aggregation,
    Comparison,
    Relationship,
}

impl IntentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::Lookup => "lookup",
            IntentKind::Aggregation => "aggregation",
            IntentKind::Comparison => "comparison",
            IntentKind::Relationship => "relationship",
        }
    }

    /// Chunk granularities searched for this intent, most useful first.
    pub fn granularities(self) -> &'static [Granularity] {
        match self {
            IntentKind::Lookup => &[Granularity::Metric, Granularity::Row, Granularity::Table],
            IntentKind::Aggregation => &[Granularity::Metric, Granularity::Column],
            IntentKind::Comparison => &[Granularity::Row, Granularity::Column, Granularity::Metric],
            IntentKind::Relationship => &[Granularity::Table],
        }
    }
}

/// Which way a relationship query walks the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Child,
    Parent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calculation {
    Sum,
    Average,
    Percentage,
    Growth,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryEntities {
    /// Tables named by label or caption
    pub tables: Vec<TableId>,
    pub metrics: Vec<String>,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub years: Vec<u32>,
}

impl QueryEntities {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.metrics.is_empty()
            && self.rows.is_empty()
            && self.columns.is_empty()
            && self.years.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    pub kind: IntentKind,
    pub direction: Option<Direction>,
    pub calculation: Option<Calculation>,
    pub entities: QueryEntities,
    pub granularities: Vec<Granularity>,
}

/// Lowercases and turns punctuation into single spaces, padded at both
/// ends so phrase lookups match whole words.
fn normalize(text: &str) -> String {
    let mut out = String::from(" ");
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with(' ') {
            out.push(' ');
        }
    }
    if !out.ends_with(' ') {
        out.push(' ');
    }
    out
}

fn has_term(normalized: &str, term: &str) -> bool {
    if term.is_ascii() {
        normalized.contains(&format!(" {term} "))
    } else {
        normalized.contains(term)
    }
}

fn has_any(normalized: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| has_term(normalized, t))
}

/// Labels worth matching against a query: not placeholders, not numbers.
fn usable_label(label: &str) -> bool {
    let trimmed = label.trim();
    trimmed.chars().count() >= 2
        && !trimmed.starts_with("Row ")
        && !trimmed.starts_with("Column ")
        && extract::parse_number(trimmed).is_none()
}

#[derive(Debug, Clone, Default)]
struct Vocabulary {
    tables: Vec<(String, TableId)>,
    metrics: BTreeSet<String>,
    rows: BTreeSet<String>,
    columns: BTreeSet<String>,
}

impl Vocabulary {
    fn from_tables(tables: &TableHierarchy<EnhancedTable>) -> Self {
        let mut vocabulary = Vocabulary::default();
        for table in tables.iter() {
            let s = &table.structure;
            vocabulary.tables.push((normalize(&s.label), s.id));
            if let Some(caption) = &s.caption {
                vocabulary.tables.push((normalize(caption), s.id));
            }
            for metric in &table.metrics {
                if usable_label(&metric.label) {
                    vocabulary.metrics.insert(metric.label.clone());
                }
                if let Some(canonical) = &metric.canonical {
                    vocabulary.metrics.insert(canonical.clone());
                }
            }
            for r in s.header_rows..s.n_rows {
                let label = s.row_label(r);
                if usable_label(&label) {
                    vocabulary.rows.insert(label);
                }
            }
            for label in s.column_labels() {
                if usable_label(&label) {
                    vocabulary.columns.insert(label);
                }
            }
        }
        vocabulary
    }
}

/// Classifies queries against the vocabulary of one document.
#[derive(Debug, Clone, Default)]
pub struct IntentClassifier {
    vocabulary: Vocabulary,
}

impl IntentClassifier {
    pub fn new(tables: &TableHierarchy<EnhancedTable>) -> Self {
        Self {
            vocabulary: Vocabulary::from_tables(tables),
        }
    }

    /// Relationship words win over comparison words, which win over
    /// aggregation words; anything else is a lookup.
    pub fn classify(&self, query: &str) -> QueryIntent {
        let normalized = normalize(query);

        let kind = if has_any(&normalized, RELATIONSHIP_TERMS) {
            IntentKind::Relationship
        } else if has_any(&normalized, COMPARISON_TERMS) {
            IntentKind::Comparison
        } else if has_any(&normalized, AGGREGATION_TERMS) {
            IntentKind::Aggregation
        } else {
            IntentKind::Lookup
        };

        let direction = (kind == IntentKind::Relationship).then(|| {
            if has_any(&normalized, PARENT_TERMS) {
                Direction::Parent
            } else {
                Direction::Child
            }
        });

        let calculation = match kind {
            IntentKind::Aggregation | IntentKind::Comparison => Some(calculation(&normalized)),
            _ => None,
        };

        QueryIntent {
            kind,
            direction,
            calculation,
            entities: self.entities(query, &normalized),
            granularities: kind.granularities().to_vec(),
        }
    }

    fn entities(&self, query: &str, normalized: &str) -> QueryEntities {
        let mentioned = |label: &String| {
            let needle = normalize(label);
            needle.trim().chars().count() >= 2 && normalized.contains(needle.as_str())
        };

        let mut tables: Vec<TableId> = self
            .vocabulary
            .tables
            .iter()
            .filter(|(name, _)| name.trim().chars().count() >= 2 && normalized.contains(name.as_str()))
            .map(|(_, id)| *id)
            .collect();
        tables.sort();
        tables.dedup();

        let mut years = years_in(query);
        years.sort_unstable();
        years.dedup();

        QueryEntities {
            tables,
            metrics: self.vocabulary.metrics.iter().filter(|l| mentioned(*l)).cloned().collect(),
            rows: self.vocabulary.rows.iter().filter(|l| mentioned(*l)).cloned().collect(),
            columns: self.vocabulary.columns.iter().filter(|l| mentioned(*l)).cloned().collect(),
            years,
        }
    }
}

fn calculation(normalized: &str) -> Calculation {
    if has_any(normalized, PERCENTAGE_TERMS) {
        Calculation::Percentage
    } else if has_any(normalized, AVERAGE_TERMS) {
        Calculation::Average
    } else if has_any(normalized, GROWTH_TERMS) {
        Calculation::Growth
    } else {
        Calculation::Sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(query: &str) -> QueryIntent {
        IntentClassifier::default().classify(query)
    }

    #[test]
    fn test_intent_priority() {
        assert_eq!(classify("What is in the nested table?").kind, IntentKind::Relationship);
        assert_eq!(
            classify("Compare the total revenue of the inner table").kind,
            IntentKind::Relationship
        );
        assert_eq!(classify("Compare revenue in 2022 and 2023").kind, IntentKind::Comparison);
        assert_eq!(classify("What is the total revenue?").kind, IntentKind::Aggregation);
        assert_eq!(classify("What is the revenue of Retail?").kind, IntentKind::Lookup);
        assert_eq!(classify("营业收入的变化").kind, IntentKind::Comparison);
        assert_eq!(classify("计算平均利润").kind, IntentKind::Aggregation);
    }

    #[test]
    fn test_granularities_follow_intent() {
        assert_eq!(
            classify("What is the total revenue?").granularities,
            vec![Granularity::Metric, Granularity::Column]
        );
        assert_eq!(classify("show the child table").granularities, vec![Granularity::Table]);
        assert_eq!(
            classify("Stores").granularities,
            vec![Granularity::Metric, Granularity::Row, Granularity::Table]
        );
    }

    #[test]
    fn test_direction_and_calculation() {
        assert_eq!(classify("What is in the nested table?").direction, Some(Direction::Child));
        assert_eq!(
            classify("Which outer table contains the inner table?").direction,
            Some(Direction::Parent)
        );
        assert_eq!(classify("Average revenue").calculation, Some(Calculation::Average));
        assert_eq!(classify("Revenue share of Online").calculation, Some(Calculation::Percentage));
        assert_eq!(classify("Total revenue").calculation, Some(Calculation::Sum));
        assert_eq!(classify("Revenue growth rate").calculation, Some(Calculation::Growth));
        assert_eq!(classify("Revenue of Retail").calculation, None);
    }

    #[test]
    fn test_whole_words_only() {
        // "subtotal" must not trigger the "sub" relationship term
        assert_eq!(classify("What is the subtotal?").kind, IntentKind::Lookup);
        assert_eq!(classify("Show the sub table").kind, IntentKind::Relationship);
    }

    #[test]
    fn test_years_are_extracted() {
        let intent = classify("Compare FY2022 with 2023");
        assert_eq!(intent.entities.years, vec![2022, 2023]);
        assert!(intent.entities.tables.is_empty());
    }
}
