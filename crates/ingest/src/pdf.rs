//! Minimal PDF content-stream interpreter producing page layouts.
//!
//! Only geometry is needed: positioned text runs and ruling segments. Glyph
//! widths are estimated from the font size, which is accurate enough to
//! place a run inside the cell that holds it.

use std::path::Path;

use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};
use tracing::{debug, warn};

use crate::error::LayoutError;
use crate::geometry::BBox;
use crate::lattice::{Segment, TextRun, assemble_cells, ruled_boxes};
use crate::layout::{LayoutDocument, PageLayout};

const DEFAULT_PAGE: (f32, f32) = (612.0, 792.0);
const MAX_PAGE_TREE_DEPTH: usize = 32;
const GLYPH_WIDTH: f32 = 0.5;
const RULE_THICKNESS: f32 = 2.0;
const RULE_TOLERANCE: f32 = 1.5;
/// TJ adjustments more negative than this read as a word break.
const TJ_SPACE_THRESHOLD: f32 = -250.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f32; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn translate(tx: f32, ty: f32) -> Self {
        Matrix([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    /// `self` applied first, then `other`.
    fn then(&self, other: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Matrix([
            a * a2 + b * c2,
            a * b2 + b * d2,
            c * a2 + d * c2,
            c * b2 + d * d2,
            e * a2 + f * c2 + e2,
            e * b2 + f * d2 + f2,
        ])
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + c * y + e, b * x + d * y + f)
    }

    fn vertical_scale(&self) -> f32 {
        (self.0[2].powi(2) + self.0[3].powi(2)).sqrt()
    }

    fn horizontal_scale(&self) -> f32 {
        (self.0[0].powi(2) + self.0[1].powi(2)).sqrt()
    }
}

#[derive(Debug, Clone)]
struct TextState {
    matrix: Matrix,
    line_matrix: Matrix,
    font_size: f32,
    leading: f32,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            font_size: 12.0,
            leading: 0.0,
        }
    }
}

/// Collects text runs and rules from one page's operations.
struct PageInterpreter {
    height: f32,
    ctm: Matrix,
    ctm_stack: Vec<Matrix>,
    text: TextState,
    path: Vec<Vec<(f32, f32)>>,
    rects: Vec<BBox>,
    runs: Vec<TextRun>,
    segments: Vec<Segment>,
}

impl PageInterpreter {
    fn new(height: f32) -> Self {
        Self {
            height,
            ctm: Matrix::IDENTITY,
            ctm_stack: Vec::new(),
            text: TextState::default(),
            path: Vec::new(),
            rects: Vec::new(),
            runs: Vec::new(),
            segments: Vec::new(),
        }
    }

    fn run(&mut self, content: &Content) {
        for op in &content.operations {
            let nums = numbers(&op.operands);
            match op.operator.as_str() {
                "q" => self.ctm_stack.push(self.ctm),
                "Q" => {
                    if let Some(m) = self.ctm_stack.pop() {
                        self.ctm = m;
                    }
                }
                "cm" if nums.len() == 6 => {
                    let m = Matrix([nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]]);
                    self.ctm = m.then(&self.ctm);
                }
                "BT" => {
                    self.text.matrix = Matrix::IDENTITY;
                    self.text.line_matrix = Matrix::IDENTITY;
                }
                "Tf" => {
                    if let Some(size) = nums.last() {
                        self.text.font_size = *size;
                    }
                }
                "TL" => {
                    if let Some(l) = nums.first() {
                        self.text.leading = *l;
                    }
                }
                "Td" if nums.len() == 2 => self.next_line(nums[0], nums[1]),
                "TD" if nums.len() == 2 => {
                    self.text.leading = -nums[1];
                    self.next_line(nums[0], nums[1]);
                }
                "Tm" if nums.len() == 6 => {
                    let m = Matrix([nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]]);
                    self.text.matrix = m;
                    self.text.line_matrix = m;
                }
                "T*" => self.next_line(0.0, -self.text.leading),
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = op.operands.first() {
                        self.show(&decode_text(bytes));
                    }
                }
                "'" => {
                    self.next_line(0.0, -self.text.leading);
                    if let Some(Object::String(bytes, _)) = op.operands.first() {
                        self.show(&decode_text(bytes));
                    }
                }
                "\"" => {
                    self.next_line(0.0, -self.text.leading);
                    if let Some(Object::String(bytes, _)) = op.operands.get(2) {
                        self.show(&decode_text(bytes));
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = op.operands.first() {
                        self.show(&decode_text_array(items));
                    }
                }
                "m" if nums.len() == 2 => {
                    let p = self.ctm.apply(nums[0], nums[1]);
                    self.path.push(vec![p]);
                }
                "l" if nums.len() == 2 => {
                    let p = self.ctm.apply(nums[0], nums[1]);
                    if let Some(sub) = self.path.last_mut() {
                        sub.push(p);
                    }
                }
                "h" => {
                    if let Some(sub) = self.path.last_mut() {
                        if let Some(first) = sub.first().copied() {
                            sub.push(first);
                        }
                    }
                }
                "re" if nums.len() == 4 => {
                    let (x0, y0) = self.ctm.apply(nums[0], nums[1]);
                    let (x1, y1) = self.ctm.apply(nums[0] + nums[2], nums[1] + nums[3]);
                    self.rects.push(BBox::new(x0, y0, x1, y1));
                }
                "S" | "s" | "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" => self.flush_path(),
                "n" => {
                    self.path.clear();
                    self.rects.clear();
                }
                _ => {}
            }
        }
    }

    fn next_line(&mut self, tx: f32, ty: f32) {
        let m = Matrix::translate(tx, ty).then(&self.text.line_matrix);
        self.text.line_matrix = m;
        self.text.matrix = m;
    }

    fn show(&mut self, text: &str) {
        let chars = text.chars().count() as f32;
        let advance = chars * GLYPH_WIDTH * self.text.font_size;
        let trm = self.text.matrix.then(&self.ctm);

        if !text.trim().is_empty() {
            let size = self.text.font_size * trm.vertical_scale();
            let (x, baseline) = trm.apply(0.0, 0.0);
            let width = advance * trm.horizontal_scale();
            let top = self.height - (baseline + size * 0.8);
            let bottom = self.height - (baseline - size * 0.2);
            self.runs.push(TextRun {
                bbox: BBox::new(x, top, x + width, bottom),
                text: text.trim().to_string(),
                font_size: size,
            });
        }

        self.text.matrix = Matrix::translate(advance, 0.0).then(&self.text.matrix);
    }

    fn flush_path(&mut self) {
        let h = self.height;
        for sub in self.path.drain(..) {
            for pair in sub.windows(2) {
                let (x1, y1) = pair[0];
                let (x2, y2) = pair[1];
                self.segments.push(Segment::new(x1, h - y1, x2, h - y2));
            }
        }
        for rect in self.rects.drain(..) {
            let flipped = BBox::new(rect.x0, h - rect.y1, rect.x1, h - rect.y0);
            self.segments.extend(Segment::from_rect(&flipped, RULE_THICKNESS));
        }
    }
}

fn numbers(operands: &[Object]) -> Vec<f32> {
    operands
        .iter()
        .filter_map(|o| match o {
            Object::Integer(i) => Some(*i as f32),
            Object::Real(r) => Some(*r as f32),
            _ => None,
        })
        .collect()
}

fn decode_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

fn decode_text_array(items: &[Object]) -> String {
    let mut out = String::new();
    for item in items {
        match item {
            Object::String(bytes, _) => out.push_str(&decode_text(bytes)),
            Object::Integer(i) if (*i as f32) < TJ_SPACE_THRESHOLD => out.push(' '),
            Object::Real(r) if (*r as f32) < TJ_SPACE_THRESHOLD => out.push(' '),
            _ => {}
        }
    }
    out
}

/// `MediaBox` is inheritable, so a page without one takes its nearest
/// `/Pages` ancestor's.
fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let mut node = page_id;
    for _ in 0..MAX_PAGE_TREE_DEPTH {
        let Ok(dict) = doc.get_object(node).and_then(Object::as_dict) else {
            break;
        };
        if let Ok(media_box) = dict.get(b"MediaBox") {
            let media_box = match media_box {
                Object::Reference(id) => doc.get_object(*id).unwrap_or(media_box),
                other => other,
            };
            if let Ok(values) = media_box.as_array() {
                let nums = numbers(values);
                if nums.len() == 4 {
                    return ((nums[2] - nums[0]).abs(), (nums[3] - nums[1]).abs());
                }
            }
            break;
        }
        match dict.get(b"Parent").and_then(Object::as_reference) {
            Ok(parent) => node = parent,
            Err(_) => break,
        }
    }
    DEFAULT_PAGE
}

/// Parses PDF bytes into per-page raw cell geometry.
pub fn parse_pdf(bytes: &[u8], path: &Path) -> Result<LayoutDocument, LayoutError> {
    let doc = Document::load_mem(bytes).map_err(|e| LayoutError::Pdf {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut pages = Vec::new();
    for (page_number, page_id) in doc.get_pages() {
        let (width, height) = page_size(&doc, page_id);
        let mut page = PageLayout::new(page_number, width, height);

        let content = match doc.get_page_content(page_id) {
            Ok(raw) => Content::decode(&raw),
            Err(e) => {
                warn!(page = page_number, error = %e, "Page has no readable content stream");
                pages.push(page);
                continue;
            }
        };

        match content {
            Ok(content) => {
                let mut interp = PageInterpreter::new(height);
                interp.run(&content);
                let boxes = ruled_boxes(&interp.segments, RULE_TOLERANCE);
                debug!(
                    page = page_number,
                    runs = interp.runs.len(),
                    segments = interp.segments.len(),
                    ruled_cells = boxes.len(),
                    "Interpreted page"
                );
                page.cells = assemble_cells(&boxes, interp.runs);
            }
            Err(e) => {
                warn!(page = page_number, error = %e, "Failed to decode content stream");
            }
        }
        pages.push(page);
    }

    Ok(LayoutDocument {
        source: path.to_string_lossy().to_string(),
        pages,
    })
}
