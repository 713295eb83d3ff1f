use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

/// Pages averaging fewer text characters than this are probably scans.
const SCANNED_CHARS_PER_PAGE: usize = 200;

/// One piece of raw cell geometry as supplied by the layout source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCell {
    pub bbox: BBox,
    pub text: String,
    #[serde(default)]
    pub font_size: f32,
    #[serde(default)]
    pub bold: bool,
    /// Cell outline came from ruling lines rather than text alignment.
    #[serde(default)]
    pub ruled: bool,
}

impl RawCell {
    pub fn ruled(bbox: BBox, text: impl Into<String>) -> Self {
        Self {
            bbox,
            text: text.into(),
            font_size: 0.0,
            bold: false,
            ruled: true,
        }
    }

    pub fn free_text(bbox: BBox, text: impl Into<String>, font_size: f32) -> Self {
        Self {
            bbox,
            text: text.into(),
            font_size,
            bold: false,
            ruled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLayout {
    /// 1-based page number
    pub page_number: u32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub cells: Vec<RawCell>,
}

impl PageLayout {
    pub fn new(page_number: u32, width: f32, height: f32) -> Self {
        Self {
            page_number,
            width,
            height,
            cells: Vec::new(),
        }
    }

    pub fn text_chars(&self) -> usize {
        self.cells.iter().map(|c| c.text.chars().count()).sum()
    }
}

/// Read-only layout of a whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutDocument {
    pub source: String,
    pub pages: Vec<PageLayout>,
}

impl LayoutDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Heuristic for image-only PDFs: almost no extractable text per page.
    pub fn likely_scanned(&self) -> bool {
        if self.pages.is_empty() {
            return false;
        }
        let chars: usize = self.pages.iter().map(PageLayout::text_chars).sum();
        chars / self.pages.len() < SCANNED_CHARS_PER_PAGE
    }
}
