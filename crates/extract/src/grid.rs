//! Coordinate bucketing of raw cells into a rectangular grid.

use ingest::geometry::{cluster_values, nearest_index};
use ingest::{BBox, RawCell};

use crate::schema::Cell;

#[derive(Debug, Clone)]
pub struct Grid {
    pub n_rows: usize,
    pub n_cols: usize,
    /// Origin cells ordered by row, then column
    pub cells: Vec<Cell>,
    /// Reasons the grid is not a clean rectangle
    pub notes: Vec<String>,
}

impl Grid {
    pub fn rows(&self) -> Vec<Vec<Cell>> {
        let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); self.n_rows];
        for cell in &self.cells {
            rows[cell.row].push(cell.clone());
        }
        rows
    }
}

/// Number of starts in `starts` lying in `[from, to)` after tolerance.
fn span_count(starts: &[f32], first: usize, end: f32, tolerance: f32) -> usize {
    let covered = starts.iter().skip(first).take_while(|&&s| s < end - tolerance).count();
    covered.max(1)
}

/// Buckets raw cells by their top and left edges. Cells claiming an already
/// occupied slot are merged into the occupant; empty slots get blank cells.
pub fn build_grid(raw: &[RawCell], bounds: &BBox, row_tolerance: f32, col_tolerance: f32) -> Grid {
    let tops: Vec<f32> = raw.iter().map(|c| c.bbox.y0).collect();
    let lefts: Vec<f32> = raw.iter().map(|c| c.bbox.x0).collect();
    let row_starts = cluster_values(&tops, row_tolerance);
    let col_starts = cluster_values(&lefts, col_tolerance);

    let n_rows = row_starts.len();
    let n_cols = col_starts.len();
    let mut notes = Vec::new();

    let mut placed: Vec<(usize, usize, usize, usize, &RawCell)> = raw
        .iter()
        .map(|c| {
            let row = nearest_index(&row_starts, c.bbox.y0);
            let col = nearest_index(&col_starts, c.bbox.x0);
            let row_span = span_count(&row_starts, row, c.bbox.y1, row_tolerance);
            let col_span = span_count(&col_starts, col, c.bbox.x1, col_tolerance);
            (row, col, row_span, col_span, c)
        })
        .collect();
    placed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut occupancy: Vec<Vec<Option<usize>>> = vec![vec![None; n_cols]; n_rows];
    let mut cells: Vec<Cell> = Vec::with_capacity(placed.len());

    for (row, col, row_span, col_span, raw_cell) in placed {
        let row_span = row_span.min(n_rows - row);
        let col_span = col_span.min(n_cols - col);

        let occupant = (row..row + row_span)
            .flat_map(|r| (col..col + col_span).map(move |c| (r, c)))
            .find_map(|(r, c)| occupancy[r][c]);

        if let Some(existing) = occupant {
            let text = raw_cell.text.trim();
            if !text.is_empty() {
                let target = &mut cells[existing];
                if !target.value.is_empty() {
                    target.value.push(' ');
                }
                target.value.push_str(text);
            }
            notes.push(format!("overlapping cells at row {}, column {}", row + 1, col + 1));
            continue;
        }

        let index = cells.len();
        for r in row..row + row_span {
            for c in col..col + col_span {
                occupancy[r][c] = Some(index);
            }
        }
        cells.push(Cell {
            value: raw_cell.text.trim().to_string(),
            row,
            col,
            row_span,
            col_span,
            is_header: false,
            bbox: raw_cell.bbox,
        });
    }

    let mut holes = 0;
    for r in 0..n_rows {
        for c in 0..n_cols {
            if occupancy[r][c].is_none() {
                holes += 1;
                let x1 = col_starts.get(c + 1).copied().unwrap_or(bounds.x1);
                let y1 = row_starts.get(r + 1).copied().unwrap_or(bounds.y1);
                cells.push(Cell {
                    value: String::new(),
                    row: r,
                    col: c,
                    row_span: 1,
                    col_span: 1,
                    is_header: false,
                    bbox: BBox::new(col_starts[c], row_starts[r], x1, y1),
                });
            }
        }
    }
    if holes > 0 {
        notes.push(format!("{holes} empty grid slot(s), rows have inconsistent cell counts"));
    }

    cells.sort_by(|a, b| (a.row, a.col).cmp(&(b.row, b.col)));

    Grid {
        n_rows,
        n_cols,
        cells,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(x0: f32, y0: f32, x1: f32, y1: f32, text: &str) -> RawCell {
        RawCell::ruled(BBox::new(x0, y0, x1, y1), text)
    }

    #[test]
    fn test_merged_header_span() {
        let raw = vec![
            cell(0.0, 0.0, 200.0, 20.0, "Results"),
            cell(0.0, 20.0, 100.0, 40.0, "a"),
            cell(100.0, 20.0, 200.0, 40.0, "b"),
        ];
        let grid = build_grid(&raw, &BBox::new(0.0, 0.0, 200.0, 40.0), 4.0, 8.0);

        assert_eq!((grid.n_rows, grid.n_cols), (2, 2));
        assert_eq!(grid.cells.len(), 3);
        assert_eq!(grid.cells[0].col_span, 2);
        assert!(grid.notes.is_empty());
    }

    #[test]
    fn test_missing_cell_is_filled_and_noted() {
        let raw = vec![
            cell(0.0, 0.0, 100.0, 20.0, "a"),
            cell(100.0, 0.0, 200.0, 20.0, "b"),
            cell(0.0, 20.0, 100.0, 40.0, "c"),
        ];
        let grid = build_grid(&raw, &BBox::new(0.0, 0.0, 200.0, 40.0), 4.0, 8.0);

        assert_eq!(grid.cells.len(), 4);
        assert_eq!(grid.cells[3].value, "");
        assert_eq!(grid.notes.len(), 1);
    }

    #[test]
    fn test_overlapping_cells_merge_text() {
        let raw = vec![
            cell(0.0, 0.0, 100.0, 20.0, "Net"),
            cell(2.0, 1.0, 100.0, 20.0, "income"),
            cell(100.0, 0.0, 200.0, 20.0, "5"),
        ];
        let grid = build_grid(&raw, &BBox::new(0.0, 0.0, 200.0, 20.0), 4.0, 8.0);

        assert_eq!(grid.cells.len(), 2);
        assert_eq!(grid.cells[0].value, "Net income");
        assert_eq!(grid.notes.len(), 1);
    }
}
