use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use extract::{EnhancedTable, TableHierarchy};
use ingest::TableId;

use crate::response::RetrievedMatch;

/// How a context table relates to the table a match came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Parent,
    Ancestor,
    Child,
    Sibling,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Parent => "parent",
            Relation::Ancestor => "ancestor",
            Relation::Child => "child",
            Relation::Sibling => "sibling",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub table_id: TableId,
    pub table_label: String,
    pub relation: Relation,
    /// Relative to this table
    pub of: TableId,
    pub description: String,
}

/// Collects descriptions of the tables around each match: ancestors along
/// the nesting path (nearest first), then children, then siblings. Each
/// table appears at most once, under the first relation found.
pub fn expand(tables: &TableHierarchy<EnhancedTable>, matches: &[RetrievedMatch]) -> Vec<ContextEntry> {
    let mut seen: HashSet<TableId> = HashSet::new();
    let mut entries = Vec::new();

    let mut push = |table: &EnhancedTable, relation: Relation, of: TableId| {
        if seen.insert(table.id()) {
            entries.push(ContextEntry {
                table_id: table.id(),
                table_label: table.structure.label.clone(),
                relation,
                of,
                description: table.description.clone(),
            });
        }
    };

    for m in matches {
        let owner = m.table_id;
        let ancestors = m.nesting_path.iter().rev().skip(1);
        for (step, ancestor) in ancestors.enumerate() {
            if let Some(table) = tables.get(*ancestor) {
                let relation = if step == 0 { Relation::Parent } else { Relation::Ancestor };
                push(table, relation, owner);
            }
        }
        for child in tables.children_of(owner) {
            push(child, Relation::Child, owner);
        }
        for sibling in tables.siblings_of(owner) {
            push(sibling, Relation::Sibling, owner);
        }
    }
    entries
}
