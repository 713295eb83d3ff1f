use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use extract::{EnhancedTable, TableHierarchy};
use ingest::{Diagnostics, DocumentMetadata};

use crate::chunk::Chunk;
use crate::embeddings::EmbedderConfig;
use crate::store::{InMemoryVectorStore, IndexPoint, VectorStore};

pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to access artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact {path} contains no indexed chunks")]
    Empty { path: PathBuf },

    #[error("artifact {path} has format version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

/// Everything needed to answer queries about one document without
/// re-running detection or analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentArtifact {
    pub version: u32,
    pub metadata: DocumentMetadata,
    /// Provider the points were embedded with; queries must use the same one
    pub embedder: EmbedderConfig,
    pub tables: TableHierarchy<EnhancedTable>,
    pub chunks: Vec<Chunk>,
    pub points: Vec<IndexPoint>,
    pub unindexed: Vec<String>,
    pub diagnostics: Diagnostics,
}

impl DocumentArtifact {
    pub fn new(
        metadata: DocumentMetadata,
        embedder: EmbedderConfig,
        tables: TableHierarchy<EnhancedTable>,
        chunks: Vec<Chunk>,
        store: &dyn VectorStore,
        unindexed: Vec<String>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            metadata,
            embedder,
            tables,
            chunks,
            points: store.points(),
            unindexed,
            diagnostics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Chunks keyed by id.
    pub fn chunk_map(&self) -> HashMap<&str, &Chunk> {
        self.chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect()
    }

    /// A searchable store over the persisted points.
    pub fn store(&self) -> InMemoryVectorStore {
        InMemoryVectorStore::from_points(self.points.clone())
    }

    pub async fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| ArtifactError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ArtifactError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(path, bytes)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        info!(
            path = %path.display(),
            tables = self.tables.len(),
            chunks = self.chunks.len(),
            points = self.points.len(),
            "Artifact saved"
        );
        Ok(())
    }

    /// Loads and validates an artifact. An artifact without index points
    /// cannot answer anything and is rejected.
    pub async fn load(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let artifact: DocumentArtifact =
            serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        if artifact.version != ARTIFACT_VERSION {
            return Err(ArtifactError::Version {
                path: path.to_path_buf(),
                found: artifact.version,
                expected: ARTIFACT_VERSION,
            });
        }
        if artifact.is_empty() {
            return Err(ArtifactError::Empty {
                path: path.to_path_buf(),
            });
        }

        info!(
            path = %path.display(),
            tables = artifact.tables.len(),
            points = artifact.points.len(),
            "Artifact loaded"
        );
        Ok(artifact)
    }
}
