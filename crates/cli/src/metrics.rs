use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Stage timings and counts for one command run.
#[derive(Default)]
pub struct RunMetrics {
    // Timing (in microseconds)
    detect_time_us: AtomicU64,
    extract_time_us: AtomicU64,
    index_time_us: AtomicU64,
    save_time_us: AtomicU64,

    // Counts
    regions_detected: AtomicUsize,
    tables_extracted: AtomicUsize,
    chunks_indexed: AtomicUsize,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_detect(&self, duration: Duration, regions: usize) {
        self.detect_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.regions_detected.fetch_add(regions, Ordering::Relaxed);
    }

    pub fn record_extract(&self, duration: Duration, tables: usize) {
        self.extract_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.tables_extracted.fetch_add(tables, Ordering::Relaxed);
    }

    pub fn record_index(&self, duration: Duration, chunks: usize) {
        self.index_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.chunks_indexed.fetch_add(chunks, Ordering::Relaxed);
    }

    pub fn record_save(&self, duration: Duration) {
        self.save_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let detect_ms = to_ms(&self.detect_time_us);
        let extract_ms = to_ms(&self.extract_time_us);
        let index_ms = to_ms(&self.index_time_us);
        let save_ms = to_ms(&self.save_time_us);
        MetricsSnapshot {
            detect_ms,
            extract_ms,
            index_ms,
            save_ms,
            total_ms: detect_ms + extract_ms + index_ms + save_ms,
            regions_detected: self.regions_detected.load(Ordering::Relaxed),
            tables_extracted: self.tables_extracted.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
        }
    }
}

fn to_ms(total_us: &AtomicU64) -> f64 {
    total_us.load(Ordering::Relaxed) as f64 / 1000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub detect_ms: f64,
    pub extract_ms: f64,
    pub index_ms: f64,
    pub save_ms: f64,
    pub total_ms: f64,
    pub regions_detected: usize,
    pub tables_extracted: usize,
    pub chunks_indexed: usize,
}

impl MetricsSnapshot {
    /// One line per non-empty stage.
    pub fn timings(&self) -> Vec<String> {
        [
            ("detect", self.detect_ms),
            ("extract", self.extract_ms),
            ("index", self.index_ms),
            ("save", self.save_ms),
        ]
        .into_iter()
        .filter(|(_, ms)| *ms > 0.0)
        .map(|(stage, ms)| format!("{stage}: {ms:.1} ms"))
        .collect()
    }
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
