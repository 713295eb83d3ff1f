use std::fmt;

use serde::{Deserialize, Serialize};

use extract::numeric::format_value;
use extract::{EnhancedTable, TableHierarchy};
use index::Granularity;
use ingest::TableId;

use crate::context::ContextEntry;
use crate::intent::{Calculation, Direction, IntentKind, QueryIntent};

/// States a query passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Received,
    IntentClassified,
    GranularitySelected,
    Retrieved,
    ContextExpanded,
    Responded,
}

impl QueryState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryState::Received => "received",
            QueryState::IntentClassified => "intent_classified",
            QueryState::GranularitySelected => "granularity_selected",
            QueryState::Retrieved => "retrieved",
            QueryState::ContextExpanded => "context_expanded",
            QueryState::Responded => "responded",
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedMatch {
    pub chunk_id: String,
    pub table_id: TableId,
    pub table_label: String,
    pub granularity: Granularity,
    pub score: f32,
    pub text: String,
    pub nesting_path: Vec<TableId>,
    pub doc_order: usize,
    pub metric_label: Option<String>,
    pub metric_value: Option<f64>,
    /// Why this chunk was returned
    pub explanation: String,
}

impl RetrievedMatch {
    pub fn depth(&self) -> usize {
        self.nesting_path.len().saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Answer {
        answer: String,
        matches: Vec<RetrievedMatch>,
        context: Vec<ContextEntry>,
    },
    /// Nothing scored above the similarity floor
    NoMatch { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTrace {
    pub states: Vec<QueryState>,
    /// Points returned by the vector search before ranking
    pub candidates: usize,
    pub below_floor: usize,
    /// Tables swapped in by relationship traversal
    pub traversed: usize,
    pub expanded: bool,
    pub top_score: Option<f32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub state: QueryState,
    pub intent: QueryIntent,
    pub outcome: QueryOutcome,
    pub trace: QueryTrace,
}

impl QueryResponse {
    pub fn is_no_match(&self) -> bool {
        matches!(self.outcome, QueryOutcome::NoMatch { .. })
    }

    pub fn matches(&self) -> &[RetrievedMatch] {
        match &self.outcome {
            QueryOutcome::Answer { matches, .. } => matches,
            QueryOutcome::NoMatch { .. } => &[],
        }
    }

    pub fn context(&self) -> &[ContextEntry] {
        match &self.outcome {
            QueryOutcome::Answer { context, .. } => context,
            QueryOutcome::NoMatch { .. } => &[],
        }
    }

    /// The answer text, or the no-match message.
    pub fn text(&self) -> String {
        match &self.outcome {
            QueryOutcome::Answer { answer, .. } => answer.clone(),
            QueryOutcome::NoMatch { reason } => format!("No matching table content: {reason}"),
        }
    }
}

/// Renders the templated answer for `intent` over ranked `matches`.
pub fn render(
    intent: &QueryIntent,
    matches: &[RetrievedMatch],
    context: &[ContextEntry],
    tables: &TableHierarchy<EnhancedTable>,
) -> String {
    let body = match intent.kind {
        IntentKind::Lookup => None,
        IntentKind::Aggregation => aggregate(intent.calculation.unwrap_or(Calculation::Sum), matches),
        IntentKind::Comparison => compare(matches),
        IntentKind::Relationship => Some(relationship(intent.direction, matches, tables)),
    };

    let mut answer = body.unwrap_or_else(|| lookup(matches));
    if !context.is_empty() {
        answer.push_str("\n\nRelated tables:");
        for entry in context {
            answer.push_str(&format!(
                "\n- {} {} of {}: {}",
                capitalize(entry.relation.as_str()),
                entry.table_label,
                label_of(tables, entry.of),
                entry.description
            ));
        }
    }
    answer
}

fn lookup(matches: &[RetrievedMatch]) -> String {
    let mut lines = Vec::with_capacity(matches.len());
    for (rank, m) in matches.iter().enumerate() {
        lines.push(format!(
            "{}. [{} {}, score {:.2}] {}",
            rank + 1,
            m.table_label,
            m.granularity,
            m.score,
            m.text
        ));
    }
    lines.join("\n")
}

/// Numeric values of metric matches, best ranked first.
fn values(matches: &[RetrievedMatch]) -> Vec<(&RetrievedMatch, f64)> {
    matches
        .iter()
        .filter(|m| m.granularity == Granularity::Metric)
        .filter_map(|m| m.metric_value.map(|v| (m, v)))
        .collect()
}

fn value_label(m: &RetrievedMatch) -> String {
    let label = m.metric_label.as_deref().unwrap_or("value");
    format!("{label} ({})", m.table_label)
}

fn percent_change(from: f64, to: f64) -> Option<f64> {
    (from != 0.0).then(|| (to - from) / from.abs() * 100.0)
}

fn aggregate(calculation: Calculation, matches: &[RetrievedMatch]) -> Option<String> {
    let values = values(matches);
    if values.is_empty() {
        return None;
    }
    let total: f64 = values.iter().map(|(_, v)| v).sum();
    let listed = values
        .iter()
        .map(|(m, v)| format!("{} = {}", value_label(m), format_value(*v)))
        .collect::<Vec<_>>()
        .join(", ");

    let headline = match calculation {
        Calculation::Sum => format!("Sum of {} values: {}", values.len(), format_value(total)),
        Calculation::Average => format!(
            "Average of {} values: {}",
            values.len(),
            format_value(total / values.len() as f64)
        ),
        Calculation::Percentage => {
            let (first, value) = values[0];
            if total == 0.0 {
                return None;
            }
            format!(
                "{} is {:.1}% of the {} total across matched values",
                value_label(first),
                value / total * 100.0,
                format_value(total)
            )
        }
        Calculation::Growth => {
            let [(a, from), (b, to), ..] = values.as_slice() else {
                return None;
            };
            let change = percent_change(*from, *to)?;
            format!(
                "Growth from {} to {}: {:+.1}%",
                value_label(a),
                value_label(b),
                change
            )
        }
    };
    Some(format!("{headline}\nFrom: {listed}"))
}

fn compare(matches: &[RetrievedMatch]) -> Option<String> {
    let values = values(matches);
    let [(a, first), (b, second), ..] = values.as_slice() else {
        return None;
    };
    let mut text = format!(
        "{} is {}, {} is {}; difference {}",
        value_label(a),
        format_value(*first),
        value_label(b),
        format_value(*second),
        format_value(first - second)
    );
    if let Some(change) = percent_change(*second, *first) {
        text.push_str(&format!(" ({change:+.1}% relative to {})", value_label(b)));
    }
    Some(text)
}

fn relationship(
    direction: Option<Direction>,
    matches: &[RetrievedMatch],
    tables: &TableHierarchy<EnhancedTable>,
) -> String {
    let mut lines = Vec::new();
    for m in matches {
        let Some(table) = tables.get(m.table_id) else {
            continue;
        };
        let label = &table.structure.label;
        let placement = match tables.parent_of(m.table_id) {
            Some(parent) => {
                let anchor = parent
                    .structure
                    .children
                    .iter()
                    .find(|link| link.child == m.table_id)
                    .map(|link| format!(" at row {}, column {}", link.row + 1, link.col + 1))
                    .unwrap_or_default();
                format!("Table {label} is nested inside table {}{anchor}.", parent.structure.label)
            }
            None => format!("Table {label} is a top-level table on page {}.", table.structure.page),
        };
        let children: Vec<&str> = tables
            .children_of(m.table_id)
            .into_iter()
            .map(|c| c.structure.label.as_str())
            .collect();
        let contains = if children.is_empty() {
            String::new()
        } else {
            format!(" It contains {}.", children.join(", "))
        };
        lines.push(format!("{placement}{contains} {}", table.description));
    }

    if lines.is_empty() {
        let target = match direction {
            Some(Direction::Parent) => "enclosing",
            _ => "nested",
        };
        return format!("No {target} table was found for the matched content.\n{}", lookup(matches));
    }
    lines.join("\n")
}

fn label_of(tables: &TableHierarchy<EnhancedTable>, id: TableId) -> String {
    tables
        .get(id)
        .map(|t| t.structure.label.clone())
        .unwrap_or_else(|| id.to_string())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::QueryEntities;

    fn metric(label: &str, table: usize, value: f64, score: f32) -> RetrievedMatch {
        RetrievedMatch {
            chunk_id: format!("{label}-{table}"),
            table_id: TableId(table),
            table_label: format!("p1_t{}", table + 1),
            granularity: Granularity::Metric,
            score,
            text: format!("{label}: {value}"),
            nesting_path: vec![TableId(table)],
            doc_order: table,
            metric_label: Some(label.to_string()),
            metric_value: Some(value),
            explanation: String::new(),
        }
    }

    fn intent(kind: IntentKind, calculation: Option<Calculation>) -> QueryIntent {
        QueryIntent {
            kind,
            direction: None,
            calculation,
            entities: QueryEntities::default(),
            granularities: kind.granularities().to_vec(),
        }
    }

    #[test]
    fn test_aggregation_templates() {
        let matches = vec![metric("Online", 1, 700.0, 0.6), metric("Stores", 1, 500.0, 0.5)];
        let tables = TableHierarchy::default();

        let sum = render(&intent(IntentKind::Aggregation, Some(Calculation::Sum)), &matches, &[], &tables);
        assert!(sum.starts_with("Sum of 2 values: 1200"));
        assert!(sum.contains("Online (p1_t2) = 700"));

        let avg = render(&intent(IntentKind::Aggregation, Some(Calculation::Average)), &matches, &[], &tables);
        assert!(avg.starts_with("Average of 2 values: 600"));

        let share = render(&intent(IntentKind::Aggregation, Some(Calculation::Percentage)), &matches, &[], &tables);
        assert!(share.starts_with("Online (p1_t2) is 58.3% of the 1200 total"));

        let growth = render(&intent(IntentKind::Aggregation, Some(Calculation::Growth)), &matches, &[], &tables);
        assert!(growth.starts_with("Growth from Online (p1_t2) to Stores (p1_t2): -28.6%"));
    }

    #[test]
    fn test_comparison_reports_difference() {
        let matches = vec![metric("2023", 0, 1200.0, 0.7), metric("2022", 0, 1000.0, 0.6)];
        let text = render(&intent(IntentKind::Comparison, Some(Calculation::Sum)), &matches, &[], &TableHierarchy::default());
        assert_eq!(
            text,
            "2023 (p1_t1) is 1200, 2022 (p1_t1) is 1000; difference 200 (+20.0% relative to 2022 (p1_t1))"
        );
    }

    #[test]
    fn test_non_numeric_matches_fall_back_to_listing() {
        let mut row = metric("Retail", 0, 0.0, 0.4);
        row.granularity = Granularity::Row;
        row.metric_value = None;
        row.text = "row 2 (Retail)".to_string();
        let text = render(&intent(IntentKind::Comparison, None), &[row], &[], &TableHierarchy::default());
        assert_eq!(text, "1. [p1_t1 row, score 0.40] row 2 (Retail)");
    }
}
