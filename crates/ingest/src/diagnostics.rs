use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Non-fatal conditions recorded while processing a document. None of these
/// stop the pipeline; they travel with the artifact so callers can inspect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    #[error("page {page}: detection degraded ({reason})")]
    DetectionDegraded { page: u32, reason: String },

    #[error("table {table}: low-confidence structure ({reason})")]
    StructureLowConfidence { table: String, reason: String },

    #[error("table {table}: {step} found nothing")]
    EnhancementSkipped { table: String, step: String },

    #[error("chunk {chunk_id}: embedding unavailable ({reason})")]
    EmbeddingUnavailable { chunk_id: String, reason: String },
}

impl Degradation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DetectionDegraded { .. } => "detection_degraded",
            Self::StructureLowConfidence { .. } => "structure_low_confidence",
            Self::EnhancementSkipped { .. } => "enhancement_skipped",
            Self::EmbeddingUnavailable { .. } => "embedding_unavailable",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Degradation>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, degradation: Degradation) {
        warn!(kind = degradation.kind(), "{degradation}");
        self.entries.push(degradation);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Degradation>) {
        for degradation in other {
            self.record(degradation);
        }
    }

    pub fn entries(&self) -> &[Degradation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry count per degradation kind, in kind order.
    pub fn counts_by_kind(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for degradation in &self.entries {
            *counts.entry(degradation.kind()).or_insert(0) += 1;
        }
        counts
    }
}
