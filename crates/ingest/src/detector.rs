use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::Degradation;
use crate::error::Cancelled;
use crate::geometry::{BBox, cluster_values};
use crate::layout::{LayoutDocument, PageLayout, RawCell};

/// Overlaps smaller than this (in square points) are rounding noise.
const MIN_OVERLAP_AREA: f32 = 1.0;
/// Vertical gap between stream rows, relative to row height, that ends a region.
const STREAM_ROW_GAP_FACTOR: f32 = 2.0;

/// Document-wide table identifier, assigned in reading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub usize);

impl TableId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    /// Built from cells outlined by ruling lines.
    Ruled,
    /// Inferred from aligned text without rules.
    Stream,
}

/// A detected table. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRegion {
    pub id: TableId,
    /// Human-readable label, `p{page}_t{n}`
    pub label: String,
    pub page: u32,
    pub bbox: BBox,
    pub cells: Vec<RawCell>,
    pub parent: Option<TableId>,
    pub nesting_level: usize,
    pub caption: Option<String>,
    pub kind: RegionKind,
}

impl TableRegion {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Top coordinates closer than this share a row.
    pub row_tolerance: f32,
    /// Left coordinates closer than this share a column.
    pub col_tolerance: f32,
    /// Cells whose edges are this close are adjacent.
    pub adjacency_tolerance: f32,
    pub min_rows: usize,
    pub min_cols: usize,
    pub min_cells: usize,
    /// Maximum distance between a caption line and the table below it.
    pub caption_gap: f32,
    /// Regions whose edges all agree within this are the same box.
    pub tie_tolerance: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            row_tolerance: 4.0,
            col_tolerance: 8.0,
            adjacency_tolerance: 3.0,
            min_rows: 2,
            min_cols: 2,
            min_cells: 4,
            caption_gap: 24.0,
            tie_tolerance: 2.0,
        }
    }
}

/// Everything found in one document, regions in reading order.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub regions: Vec<TableRegion>,
    pub degradations: Vec<Degradation>,
}

impl Detection {
    pub fn get(&self, id: TableId) -> Option<&TableRegion> {
        self.regions.get(id.index())
    }

    pub fn children(&self, id: TableId) -> impl Iterator<Item = &TableRegion> {
        self.regions.iter().filter(move |r| r.parent == Some(id))
    }

    pub fn roots(&self) -> impl Iterator<Item = &TableRegion> {
        self.regions.iter().filter(|r| r.is_root())
    }
}

/// Candidate region on a page, members are indices into `PageLayout::cells`.
#[derive(Debug, Clone)]
struct Candidate {
    bbox: BBox,
    members: Vec<usize>,
    kind: RegionKind,
}

#[derive(Debug)]
struct PlacedCandidate {
    candidate: Candidate,
    parent: Option<usize>,
    nesting_level: usize,
    caption: Option<String>,
}

#[derive(Debug)]
struct PageDetection {
    page: u32,
    placed: Vec<PlacedCandidate>,
    degradations: Vec<Degradation>,
}

pub struct TableDetector {
    config: DetectorConfig,
}

impl TableDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detects tables on every page. Pages are scanned in parallel; the
    /// cancellation token is checked before each page.
    pub fn detect(
        &self,
        doc: &LayoutDocument,
        cancel: &CancellationToken,
    ) -> Result<Detection, Cancelled> {
        if doc.likely_scanned() {
            warn!(
                source = %doc.source,
                pages = doc.page_count(),
                "Document has little extractable text, it may be image-only"
            );
        }

        let mut pages: Vec<PageDetection> = doc
            .pages
            .par_iter()
            .map(|page| {
                if cancel.is_cancelled() {
                    Err(Cancelled)
                } else {
                    Ok(self.detect_page(page))
                }
            })
            .collect::<Result<_, _>>()?;
        pages.sort_by_key(|p| p.page);

        let mut detection = Detection::default();
        for page_detection in pages {
            let (regions, degradations) = self.emit(page_detection, doc, detection.regions.len());
            detection.regions.extend(regions);
            detection.degradations.extend(degradations);
        }

        info!(
            regions = detection.regions.len(),
            nested = detection.regions.iter().filter(|r| !r.is_root()).count(),
            degraded_pages = detection.degradations.len(),
            "Table detection complete"
        );

        Ok(detection)
    }

    /// Detects tables on one page, returning regions with ids starting at 0.
    pub fn detect_single_page(&self, page: &PageLayout) -> Detection {
        let page_detection = self.detect_page(page);
        let doc = LayoutDocument {
            source: String::new(),
            pages: vec![page.clone()],
        };
        let (regions, degradations) = self.emit(page_detection, &doc, 0);
        Detection {
            regions,
            degradations,
        }
    }

    fn detect_page(&self, page: &PageLayout) -> PageDetection {
        let mut degradations = Vec::new();

        let ruled: Vec<usize> = (0..page.cells.len()).filter(|&i| page.cells[i].ruled).collect();
        let free: Vec<usize> = (0..page.cells.len()).filter(|&i| !page.cells[i].ruled).collect();

        let mut candidates = self.ruled_candidates(&page.cells, &ruled);
        candidates.extend(self.stream_candidates(&page.cells, &free));

        let candidates = self.resolve_overlaps(page.page_number, candidates, &mut degradations);

        if candidates.is_empty() {
            degradations.push(Degradation::DetectionDegraded {
                page: page.page_number,
                reason: "no tabular structure found".to_string(),
            });
        }

        let placed = self.place(candidates, &page.cells, &free);

        debug!(
            page = page.page_number,
            cells = page.cells.len(),
            regions = placed.len(),
            "Scanned page"
        );

        PageDetection {
            page: page.page_number,
            placed,
            degradations,
        }
    }

    /// Ruled cells that share a containing cell (or the page) and touch each
    /// other form one candidate.
    fn ruled_candidates(&self, cells: &[RawCell], ruled: &[usize]) -> Vec<Candidate> {
        let tol = self.config.adjacency_tolerance;

        let container = |i: usize| -> Option<usize> {
            let inner = &cells[i].bbox;
            ruled
                .iter()
                .copied()
                .filter(|&j| j != i)
                .filter(|&j| {
                    let outer = &cells[j].bbox;
                    outer.area() > inner.area() * 1.01 && outer.contains(inner, tol)
                })
                .min_by(|&a, &b| cells[a].bbox.area().total_cmp(&cells[b].bbox.area()))
        };

        let mut groups: BTreeMap<Option<usize>, Vec<usize>> = BTreeMap::new();
        for &i in ruled {
            groups.entry(container(i)).or_default().push(i);
        }

        let mut candidates = Vec::new();
        for members in groups.values() {
            for component in connected_components(members, |a, b| {
                cells[a].bbox.touches(&cells[b].bbox, tol)
            }) {
                if self.is_tabular(cells, &component) {
                    candidates.push(Candidate {
                        bbox: enclosing(cells, &component),
                        members: component,
                        kind: RegionKind::Ruled,
                    });
                }
            }
        }
        candidates
    }

    /// Aligned free-text rows with a stable column count form a candidate.
    fn stream_candidates(&self, cells: &[RawCell], free: &[usize]) -> Vec<Candidate> {
        let mut sorted = free.to_vec();
        sorted.sort_by(|&a, &b| {
            cells[a]
                .bbox
                .y0
                .total_cmp(&cells[b].bbox.y0)
                .then(cells[a].bbox.x0.total_cmp(&cells[b].bbox.x0))
        });

        let mut rows: Vec<Vec<usize>> = Vec::new();
        for i in sorted {
            match rows.last_mut() {
                Some(row)
                    if (cells[row[0]].bbox.y0 - cells[i].bbox.y0).abs()
                        <= self.config.row_tolerance =>
                {
                    row.push(i)
                }
                _ => rows.push(vec![i]),
            }
        }
        for row in &mut rows {
            row.sort_by(|&a, &b| cells[a].bbox.x0.total_cmp(&cells[b].bbox.x0));
        }

        let mut candidates = Vec::new();
        let mut current: Vec<Vec<usize>> = Vec::new();

        for row in rows {
            if row.len() < self.config.min_cols {
                self.flush_stream(cells, &mut current, &mut candidates);
                continue;
            }
            let continues = match (current.first(), current.last()) {
                (Some(first), Some(last)) => {
                    let width_ok = first.len().abs_diff(row.len()) <= 1;
                    let bottom = last.iter().map(|&i| cells[i].bbox.y1).fold(f32::MIN, f32::max);
                    let height = last.iter().map(|&i| cells[i].bbox.height()).fold(0.0, f32::max);
                    let top = row.iter().map(|&i| cells[i].bbox.y0).fold(f32::MAX, f32::min);
                    let gap_ok =
                        top - bottom <= height.max(self.config.row_tolerance) * STREAM_ROW_GAP_FACTOR;
                    width_ok && gap_ok
                }
                _ => true,
            };
            if !continues {
                self.flush_stream(cells, &mut current, &mut candidates);
            }
            current.push(row);
        }
        self.flush_stream(cells, &mut current, &mut candidates);

        candidates
    }

    fn flush_stream(
        &self,
        cells: &[RawCell],
        rows: &mut Vec<Vec<usize>>,
        out: &mut Vec<Candidate>,
    ) {
        let rows = std::mem::take(rows);
        if rows.len() < self.config.min_rows {
            return;
        }
        let members: Vec<usize> = rows.into_iter().flatten().collect();
        if self.is_tabular(cells, &members) {
            out.push(Candidate {
                bbox: enclosing(cells, &members),
                members,
                kind: RegionKind::Stream,
            });
        }
    }

    fn is_tabular(&self, cells: &[RawCell], members: &[usize]) -> bool {
        if members.len() < self.config.min_cells {
            return false;
        }
        let tops: Vec<f32> = members.iter().map(|&i| cells[i].bbox.y0).collect();
        let lefts: Vec<f32> = members.iter().map(|&i| cells[i].bbox.x0).collect();
        cluster_values(&tops, self.config.row_tolerance).len() >= self.config.min_rows
            && cluster_values(&lefts, self.config.col_tolerance).len() >= self.config.min_cols
    }

    /// Drops exact duplicates and the smaller of two partially overlapping
    /// regions. Near-identical boxes with different cell counts are kept;
    /// they nest.
    fn resolve_overlaps(
        &self,
        page: u32,
        mut candidates: Vec<Candidate>,
        degradations: &mut Vec<Degradation>,
    ) -> Vec<Candidate> {
        let tie = self.config.tie_tolerance;
        candidates.sort_by(|a, b| {
            b.bbox
                .area()
                .total_cmp(&a.bbox.area())
                .then(a.members.len().cmp(&b.members.len()))
        });

        let mut kept: Vec<Candidate> = Vec::new();
        'next: for cand in candidates {
            for k in &kept {
                if k.bbox.near_equal(&cand.bbox, tie) {
                    if k.members.len() == cand.members.len() {
                        debug!(page, cells = cand.members.len(), "Dropped duplicate region");
                        continue 'next;
                    }
                    continue;
                }
                let nested = k.bbox.contains(&cand.bbox, tie) || cand.bbox.contains(&k.bbox, tie);
                if !nested && k.bbox.overlap_area(&cand.bbox) > MIN_OVERLAP_AREA {
                    degradations.push(Degradation::DetectionDegraded {
                        page,
                        reason: format!(
                            "discarded {}-cell region partially overlapping a larger region",
                            cand.members.len()
                        ),
                    });
                    continue 'next;
                }
            }
            kept.push(cand);
        }
        kept
    }

    /// Orders candidates for reading, links each to its smallest enclosing
    /// candidate and picks captions.
    fn place(
        &self,
        mut candidates: Vec<Candidate>,
        cells: &[RawCell],
        free: &[usize],
    ) -> Vec<PlacedCandidate> {
        let row_tol = self.config.row_tolerance.max(f32::EPSILON);
        candidates.sort_by(|a, b| {
            let ra = (a.bbox.y0 / row_tol).round() as i64;
            let rb = (b.bbox.y0 / row_tol).round() as i64;
            ra.cmp(&rb)
                .then(a.bbox.x0.total_cmp(&b.bbox.x0))
                .then(a.members.len().cmp(&b.members.len()))
        });

        let parents: Vec<Option<usize>> = (0..candidates.len())
            .map(|i| self.parent_of(&candidates, i))
            .collect();

        let nesting: Vec<usize> = (0..candidates.len())
            .map(|i| {
                let mut level = 0;
                let mut cursor = parents[i];
                while let Some(p) = cursor {
                    level += 1;
                    if level > candidates.len() {
                        break;
                    }
                    cursor = parents[p];
                }
                level
            })
            .collect();

        let claimed: HashSet<usize> = candidates
            .iter()
            .filter(|c| c.kind == RegionKind::Stream)
            .flat_map(|c| c.members.iter().copied())
            .collect();
        let mut caption_pool: Vec<usize> = free.iter().copied().filter(|i| !claimed.contains(i)).collect();

        candidates
            .into_iter()
            .enumerate()
            .map(|(i, candidate)| {
                let caption = self.take_caption(&candidate.bbox, cells, &mut caption_pool);
                PlacedCandidate {
                    candidate,
                    parent: parents[i],
                    nesting_level: nesting[i],
                    caption,
                }
            })
            .collect()
    }

    fn parent_of(&self, candidates: &[Candidate], i: usize) -> Option<usize> {
        let tie = self.config.tie_tolerance;
        let child = &candidates[i];
        candidates
            .iter()
            .enumerate()
            .filter(|(j, p)| {
                if *j == i || !p.bbox.contains(&child.bbox, tie) {
                    return false;
                }
                if p.bbox.near_equal(&child.bbox, tie) {
                    // finer decomposition is the child
                    p.members.len() < child.members.len()
                } else {
                    p.bbox.area() > child.bbox.area()
                }
            })
            .min_by(|(_, a), (_, b)| {
                a.bbox
                    .area()
                    .total_cmp(&b.bbox.area())
                    .then(b.members.len().cmp(&a.members.len()))
            })
            .map(|(j, _)| j)
    }

    fn take_caption(&self, bbox: &BBox, cells: &[RawCell], pool: &mut Vec<usize>) -> Option<String> {
        let tie = self.config.tie_tolerance;
        let best = pool
            .iter()
            .enumerate()
            .filter(|&(_, &i)| {
                let c = &cells[i].bbox;
                c.y1 <= bbox.y0 + tie
                    && bbox.y0 - c.y1 <= self.config.caption_gap
                    && c.horizontal_overlap(bbox) > 0.0
                    && !cells[i].text.trim().is_empty()
            })
            .max_by(|&(_, &a), &(_, &b)| cells[a].bbox.y1.total_cmp(&cells[b].bbox.y1))
            .map(|(pos, _)| pos)?;

        let idx = pool.remove(best);
        Some(cells[idx].text.trim().to_string())
    }

    fn emit(
        &self,
        page_detection: PageDetection,
        doc: &LayoutDocument,
        id_offset: usize,
    ) -> (Vec<TableRegion>, Vec<Degradation>) {
        let page_number = page_detection.page;
        let cells = doc
            .pages
            .iter()
            .find(|p| p.page_number == page_number)
            .map(|p| p.cells.as_slice())
            .unwrap_or(&[]);

        let regions = page_detection
            .placed
            .into_iter()
            .enumerate()
            .map(|(n, placed)| TableRegion {
                id: TableId(id_offset + n),
                label: format!("p{}_t{}", page_number, n + 1),
                page: page_number,
                bbox: placed.candidate.bbox,
                cells: placed
                    .candidate
                    .members
                    .iter()
                    .map(|&i| cells[i].clone())
                    .collect(),
                parent: placed.parent.map(|p| TableId(id_offset + p)),
                nesting_level: placed.nesting_level,
                caption: placed.caption,
                kind: placed.candidate.kind,
            })
            .collect();

        (regions, page_detection.degradations)
    }
}

fn enclosing(cells: &[RawCell], members: &[usize]) -> BBox {
    BBox::enclosing(members.iter().map(|&i| &cells[i].bbox)).unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0))
}

/// Splits `members` into groups linked by `adjacent`, preserving input order.
fn connected_components(members: &[usize], adjacent: impl Fn(usize, usize) -> bool) -> Vec<Vec<usize>> {
    let mut seen = vec![false; members.len()];
    let mut components = Vec::new();

    for start in 0..members.len() {
        if seen[start] {
            continue;
        }
        seen[start] = true;
        let mut stack = vec![start];
        let mut component = Vec::new();
        while let Some(pos) = stack.pop() {
            component.push(pos);
            for next in 0..members.len() {
                if !seen[next] && adjacent(members[pos], members[next]) {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        component.sort_unstable();
        components.push(component.into_iter().map(|pos| members[pos]).collect());
    }
    components
}
