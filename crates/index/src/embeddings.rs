use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding provider returned status {0}")]
    Status(u16),
    #[error("unexpected embedding response: {0}")]
    Response(String),
    #[error("cannot embed empty text")]
    EmptyInput,
}

/// Text to fixed-dimension vector. Implementations must be safe to call
/// from many tasks at once.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Known output dimension, if fixed ahead of the first call.
    fn dimensions(&self) -> Option<usize>;

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, EmbedError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    /// Offline feature hashing
    Hashing,
    /// Ollama `/api/embeddings`
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub kind: EmbedderKind,
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::Hashing,
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: 256,
        }
    }
}

impl EmbedderConfig {
    pub fn build(&self) -> Box<dyn Embedder> {
        match self.kind {
            EmbedderKind::Hashing => Box::new(HashingEmbedder::new(self.dimensions)),
            EmbedderKind::Ollama => Box::new(OllamaEmbedder::new(
                self.base_url.clone(),
                self.model.clone(),
            )),
        }
    }
}

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "how",
        "in", "is", "it", "its", "me", "much", "of", "on", "or", "show", "table", "tell", "that",
        "the", "this", "to", "value", "was", "what", "which", "with", "的", "是",
    ]
    .into_iter()
    .collect()
});

fn flush_term(current: &mut String, terms: &mut Vec<String>) {
    let term = current.trim_end_matches(',');
    if !term.is_empty() && !STOP_WORDS.contains(term) {
        terms.push(term.to_string());
    }
    current.clear();
}

/// Lowercased alphanumeric terms with stop words removed. CJK characters are
/// kept as single-character terms and thousands separators stay inside
/// numbers.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();

    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            current.push(ch);
        } else if ch.is_alphanumeric() {
            flush_term(&mut current, &mut terms);
            current.push(ch);
            flush_term(&mut current, &mut terms);
        } else if ch == ',' && current.ends_with(|c: char| c.is_ascii_digit()) {
            current.push(ch);
        } else {
            flush_term(&mut current, &mut terms);
        }
    }
    flush_term(&mut current, &mut terms);
    terms
}

/// Deterministic bag-of-words embedder: term counts hashed into a fixed
/// number of buckets, L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for term in tokenize(text) {
            let digest = Sha256::digest(term.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, EmbedError>> {
        Box::pin(async move {
            if text.trim().is_empty() {
                return Err(EmbedError::EmptyInput);
            }
            Ok(self.embed_text(text))
        })
    }
}

#[derive(Clone)]
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/api/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbedError::Status(response.status().as_u16()));
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Response(e.to_string()))?;

        if embedding_response.embedding.is_empty() {
            return Err(EmbedError::Response("empty embedding".to_string()));
        }
        Ok(embedding_response.embedding)
    }
}

impl Embedder for OllamaEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> Option<usize> {
        None
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, EmbedError>> {
        Box::pin(self.request(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stop_words_and_keeps_numbers() {
        assert_eq!(tokenize("What is the value of Stores?"), vec!["stores"]);
        assert_eq!(tokenize("Retail: 1,200 (USD)"), vec!["retail", "1,200", "usd"]);
        assert_eq!(tokenize("营业收入"), vec!["营", "业", "收", "入"]);
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalised() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Net income 2023").await.unwrap();
        let b = embedder.embed("Net income 2023").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        assert!(matches!(embedder.embed("   ").await, Err(EmbedError::EmptyInput)));
    }

    #[tokio::test]
    async fn test_config_builds_requested_provider() {
        let embedder = EmbedderConfig::default().build();
        assert_eq!(embedder.name(), "hashing");
        assert_eq!(embedder.dimensions(), Some(256));

        let ollama = EmbedderConfig {
            kind: EmbedderKind::Ollama,
            ..EmbedderConfig::default()
        }
        .build();
        assert_eq!(ollama.name(), "nomic-embed-text");
        assert_eq!(ollama.dimensions(), None);
    }
}
