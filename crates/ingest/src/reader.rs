use std::path::Path;

use tokio::fs;
use tracing::info;

use crate::error::LayoutError;
use crate::layout::LayoutDocument;
use crate::pdf::parse_pdf;

/// Loads page layouts from a PDF or from pre-extracted layout JSON.
pub struct LayoutReader;

impl LayoutReader {
    pub async fn read_file(path: &Path) -> Result<LayoutDocument, LayoutError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let bytes = fs::read(path).await.map_err(|source| LayoutError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let doc = match extension.as_str() {
            "pdf" => {
                let owned = path.to_path_buf();
                // lopdf is synchronous and CPU-bound
                tokio::task::spawn_blocking(move || parse_pdf(&bytes, &owned))
                    .await
                    .map_err(|e| LayoutError::Pdf {
                        path: path.to_path_buf(),
                        reason: format!("parser task failed: {e}"),
                    })??
            }
            "json" => Self::from_json(&bytes, path)?,
            _ => {
                return Err(LayoutError::Unsupported {
                    path: path.to_path_buf(),
                    extension,
                });
            }
        };

        info!(
            path = %path.display(),
            pages = doc.page_count(),
            "Loaded page layout"
        );
        Ok(doc)
    }

    pub fn from_json(bytes: &[u8], path: &Path) -> Result<LayoutDocument, LayoutError> {
        let mut doc: LayoutDocument =
            serde_json::from_slice(bytes).map_err(|source| LayoutError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        if doc.source.is_empty() {
            doc.source = path.to_string_lossy().to_string();
        }
        Ok(doc)
    }
}
