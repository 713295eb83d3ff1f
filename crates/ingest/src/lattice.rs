//! Turns ruling geometry and positioned text runs into raw cells.
//!
//! Ruled cells are the minimal rectangles whose four edges are covered by
//! ruling segments. A nested ruled table therefore yields small cells inside
//! a larger cell of its parent, because its own lines never span the full
//! edge of the enclosing cell.

use crate::geometry::{BBox, cluster_values};
use crate::layout::RawCell;

const MIN_CELL_SIZE: f32 = 2.0;

/// A run of text positioned on the page (top-left origin).
#[derive(Debug, Clone)]
pub struct TextRun {
    pub bbox: BBox,
    pub text: String,
    pub font_size: f32,
}

/// A straight ruling segment (top-left origin).
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Segment {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    fn is_horizontal(&self, tolerance: f32) -> bool {
        (self.y1 - self.y2).abs() <= tolerance
    }

    fn is_vertical(&self, tolerance: f32) -> bool {
        (self.x1 - self.x2).abs() <= tolerance
    }

    /// Four edges of a rectangle; thin rectangles collapse to a single rule.
    pub fn from_rect(rect: &BBox, thickness: f32) -> Vec<Segment> {
        let (cx, cy) = rect.center();
        if rect.height() <= thickness {
            return vec![Segment::new(rect.x0, cy, rect.x1, cy)];
        }
        if rect.width() <= thickness {
            return vec![Segment::new(cx, rect.y0, cx, rect.y1)];
        }
        vec![
            Segment::new(rect.x0, rect.y0, rect.x1, rect.y0),
            Segment::new(rect.x0, rect.y1, rect.x1, rect.y1),
            Segment::new(rect.x0, rect.y0, rect.x0, rect.y1),
            Segment::new(rect.x1, rect.y0, rect.x1, rect.y1),
        ]
    }
}

/// A family of parallel rules keyed by their fixed coordinate.
struct Rules {
    /// (fixed coordinate, start, end) with start <= end
    spans: Vec<(f32, f32, f32)>,
    tolerance: f32,
}

impl Rules {
    /// Does the union of rules at `at` cover `[from, to]`?
    fn covers(&self, at: f32, from: f32, to: f32) -> bool {
        let mut intervals: Vec<(f32, f32)> = self
            .spans
            .iter()
            .filter(|(c, _, _)| (c - at).abs() <= self.tolerance)
            .map(|(_, s, e)| (*s, *e))
            .collect();
        if intervals.is_empty() {
            return false;
        }
        intervals.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut reach = f32::MIN;
        for (start, end) in intervals {
            if reach == f32::MIN {
                if start > from + self.tolerance {
                    return false;
                }
                reach = end;
            } else if start <= reach + self.tolerance {
                reach = reach.max(end);
            } else {
                break;
            }
            if reach >= to - self.tolerance {
                return true;
            }
        }
        reach >= to - self.tolerance
    }
}

/// Minimal rectangles bounded on all four sides by ruling segments.
pub fn ruled_boxes(segments: &[Segment], tolerance: f32) -> Vec<BBox> {
    let mut horizontal = Rules {
        spans: Vec::new(),
        tolerance,
    };
    let mut vertical = Rules {
        spans: Vec::new(),
        tolerance,
    };

    for seg in segments {
        if seg.is_horizontal(tolerance) {
            horizontal.spans.push((
                (seg.y1 + seg.y2) / 2.0,
                seg.x1.min(seg.x2),
                seg.x1.max(seg.x2),
            ));
        } else if seg.is_vertical(tolerance) {
            vertical.spans.push((
                (seg.x1 + seg.x2) / 2.0,
                seg.y1.min(seg.y2),
                seg.y1.max(seg.y2),
            ));
        }
    }

    let ys = cluster_values(
        &horizontal.spans.iter().map(|s| s.0).collect::<Vec<_>>(),
        tolerance,
    );
    let xs = cluster_values(
        &vertical.spans.iter().map(|s| s.0).collect::<Vec<_>>(),
        tolerance,
    );

    let mut boxes = Vec::new();
    for i in 0..xs.len() {
        for k in 0..ys.len() {
            if let Some(b) = cell_at_corner(&xs, &ys, i, k, &horizontal, &vertical) {
                if b.width() >= MIN_CELL_SIZE && b.height() >= MIN_CELL_SIZE {
                    boxes.push(b);
                }
            }
        }
    }
    boxes
}

fn cell_at_corner(
    xs: &[f32],
    ys: &[f32],
    i: usize,
    k: usize,
    horizontal: &Rules,
    vertical: &Rules,
) -> Option<BBox> {
    for j in (i + 1)..xs.len() {
        // top edge must run continuously from the corner
        if !horizontal.covers(ys[k], xs[i], xs[j]) {
            return None;
        }
        for l in (k + 1)..ys.len() {
            if !vertical.covers(xs[i], ys[k], ys[l]) {
                break;
            }
            if !vertical.covers(xs[j], ys[k], ys[l]) || !horizontal.covers(ys[l], xs[i], xs[j]) {
                continue;
            }
            let split_by_column = ((i + 1)..j).any(|m| vertical.covers(xs[m], ys[k], ys[l]));
            let split_by_row = ((k + 1)..l).any(|n| horizontal.covers(ys[n], xs[i], xs[j]));
            if split_by_column || split_by_row {
                return None;
            }
            return Some(BBox::new(xs[i], ys[k], xs[j], ys[l]));
        }
    }
    None
}

/// Assigns each text run to the smallest ruled box holding its centre. Runs
/// outside every box are merged into free text cells, line by line.
pub fn assemble_cells(boxes: &[BBox], mut runs: Vec<TextRun>) -> Vec<RawCell> {
    runs.sort_by(|a, b| a.bbox.y0.total_cmp(&b.bbox.y0).then(a.bbox.x0.total_cmp(&b.bbox.x0)));

    let mut texts: Vec<Vec<String>> = vec![Vec::new(); boxes.len()];
    let mut sizes: Vec<f32> = vec![0.0; boxes.len()];
    let mut free: Vec<TextRun> = Vec::new();

    for run in runs {
        let (cx, cy) = run.bbox.center();
        let owner = boxes
            .iter()
            .enumerate()
            .filter(|(_, b)| b.contains_point(cx, cy))
            .min_by(|(_, a), (_, b)| a.area().total_cmp(&b.area()))
            .map(|(i, _)| i);

        match owner {
            Some(i) => {
                sizes[i] = sizes[i].max(run.font_size);
                texts[i].push(run.text);
            }
            None => free.push(run),
        }
    }

    let mut cells: Vec<RawCell> = boxes
        .iter()
        .zip(texts)
        .zip(sizes)
        .map(|((bbox, parts), size)| {
            let mut cell = RawCell::ruled(*bbox, parts.join(" ").trim().to_string());
            cell.font_size = size;
            cell
        })
        .collect();

    cells.extend(merge_free_runs(free));
    cells
}

/// Joins runs sitting on the same baseline with only a word gap between them.
fn merge_free_runs(runs: Vec<TextRun>) -> Vec<RawCell> {
    let mut merged: Vec<TextRun> = Vec::new();

    for run in runs {
        if let Some(last) = merged.last_mut() {
            let same_line = (last.bbox.y0 - run.bbox.y0).abs() <= last.bbox.height() * 0.3;
            let gap = run.bbox.x0 - last.bbox.x1;
            let word_gap = last.font_size.max(run.font_size) * 0.6;
            if same_line && gap >= -1.0 && gap <= word_gap {
                last.text.push(' ');
                last.text.push_str(&run.text);
                last.bbox = last.bbox.union(&run.bbox);
                continue;
            }
        }
        merged.push(run);
    }

    merged
        .into_iter()
        .filter(|r| !r.text.trim().is_empty())
        .map(|r| RawCell::free_text(r.bbox, r.text.trim(), r.font_size))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_segments(x0: f32, y0: f32, cols: &[f32], rows: &[f32]) -> Vec<Segment> {
        let x_end = x0 + cols.iter().sum::<f32>();
        let y_end = y0 + rows.iter().sum::<f32>();
        let mut segs = Vec::new();
        let mut y = y0;
        segs.push(Segment::new(x0, y, x_end, y));
        for h in rows {
            y += h;
            segs.push(Segment::new(x0, y, x_end, y));
        }
        let mut x = x0;
        segs.push(Segment::new(x, y0, x, y_end));
        for w in cols {
            x += w;
            segs.push(Segment::new(x, y0, x, y_end));
        }
        segs
    }

    #[test]
    fn test_simple_grid() {
        let segs = grid_segments(0.0, 0.0, &[50.0, 50.0, 50.0], &[20.0, 20.0]);
        let boxes = ruled_boxes(&segs, 1.0);
        assert_eq!(boxes.len(), 6);
    }

    #[test]
    fn test_nested_grid_keeps_outer_cell() {
        let mut segs = grid_segments(0.0, 0.0, &[100.0, 100.0], &[40.0, 80.0]);
        // inner 2x2 grid inside the bottom-right cell with padding
        segs.extend(grid_segments(110.0, 50.0, &[40.0, 40.0], &[30.0, 30.0]));

        let boxes = ruled_boxes(&segs, 1.0);
        let outer_br = BBox::new(100.0, 40.0, 200.0, 120.0);
        assert!(boxes.iter().any(|b| b.near_equal(&outer_br, 0.5)));
        let inner: Vec<_> = boxes
            .iter()
            .filter(|b| outer_br.contains(b, 0.5) && !b.near_equal(&outer_br, 0.5))
            .collect();
        assert_eq!(inner.len(), 4);
        assert_eq!(boxes.len(), 8);
    }

    #[test]
    fn test_text_assignment_prefers_smallest_box() {
        let outer = BBox::new(0.0, 0.0, 100.0, 100.0);
        let inner = BBox::new(10.0, 10.0, 50.0, 30.0);
        let runs = vec![
            TextRun {
                bbox: BBox::new(12.0, 12.0, 30.0, 20.0),
                text: "inner".into(),
                font_size: 10.0,
            },
            TextRun {
                bbox: BBox::new(60.0, 60.0, 80.0, 70.0),
                text: "outer".into(),
                font_size: 10.0,
            },
            TextRun {
                bbox: BBox::new(200.0, 10.0, 230.0, 20.0),
                text: "Caption".into(),
                font_size: 10.0,
            },
            TextRun {
                bbox: BBox::new(232.0, 10.0, 250.0, 20.0),
                text: "one".into(),
                font_size: 10.0,
            },
        ];

        let cells = assemble_cells(&[outer, inner], runs);
        assert_eq!(cells[0].text, "outer");
        assert_eq!(cells[1].text, "inner");
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[2].text, "Caption one");
        assert!(!cells[2].ruled);
    }
}
