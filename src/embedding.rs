use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use once_cell::sync::OnceCell;

use crate::error::{EmbedError, FatalConfig};

/// Committed embedding dimensionality. The catalog column and (when
/// enabled) the remote fallback are verified against this at startup;
/// a mismatch is fatal, never silently reconciled.
pub const EMBED_DIM: usize = 384;

/// Model-version fingerprint, part of every match fingerprint.
pub const MODEL_VERSION: &str = "all-MiniLM-L6-v2";

const LOCAL_TIMEOUT: Duration = Duration::from_secs(5);
const REMOTE_TIMEOUT: Duration = Duration::from_secs(8);

/// Process-wide model slot, loaded lazily on first use. A load failure is
/// memoized so every later call takes the fallback path without retrying
/// the multi-second load.
static LOCAL_MODEL: OnceCell<Result<Mutex<TextEmbedding>, String>> = OnceCell::new();

/// Matching-path normalization: trim, collapse whitespace runs, lowercase.
/// The same normalization is applied to song search-text at ingestion, so
/// query and catalog vectors live in the same space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Scale a vector to unit length. Zero vectors cannot be normalized.
pub fn unit_norm(mut v: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return Err(EmbedError::Unavailable("zero-norm embedding".to_string()));
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(v)
}

fn model_cache_dir() -> PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        PathBuf::from(path)
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".musicr/models/fastembed")
    }
}

fn load_local_model() -> Result<Mutex<TextEmbedding>, String> {
    println!("🧠 Loading embedding model {MODEL_VERSION} ({EMBED_DIM}-dim)...");
    let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
        .with_cache_dir(model_cache_dir())
        .with_show_download_progress(false);
    match TextEmbedding::try_new(options) {
        Ok(model) => {
            println!("🧠 Embedding model ready");
            Ok(Mutex::new(model))
        }
        Err(e) => {
            eprintln!("⚠️  Embedding model failed to load: {e}");
            Err(e.to_string())
        }
    }
}

/// Runs one encode on the blocking pool. Lives at module level so the
/// closure captures only the owned text.
fn encode_blocking(text: String) -> Result<Vec<f32>, EmbedError> {
    match LOCAL_MODEL.get_or_init(load_local_model) {
        Ok(model) => {
            let guard = model
                .lock()
                .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
            let mut out = guard
                .embed(vec![text], None)
                .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
            let v = out
                .pop()
                .ok_or_else(|| EmbedError::Unavailable("empty embedding batch".to_string()))?;
            if v.len() != EMBED_DIM {
                return Err(EmbedError::Unavailable(format!(
                    "local model produced {} dims, expected {EMBED_DIM}",
                    v.len()
                )));
            }
            unit_norm(v)
        }
        Err(load_err) => Err(EmbedError::Unavailable(load_err.clone())),
    }
}

/// Embedding capability with an explicit lifecycle: construct once at
/// startup, call `embed` from anywhere. The local ONNX model is the
/// primary path; a remote HTTP embedder covers the case where the model
/// cannot load on this host.
pub struct EmbeddingProvider {
    remote: Option<RemoteEmbedder>,
}

impl EmbeddingProvider {
    pub fn new(remote_url: Option<String>) -> Self {
        let remote = remote_url.map(|url| RemoteEmbedder::new(url));
        Self { remote }
    }

    pub fn model_version(&self) -> &'static str {
        MODEL_VERSION
    }

    /// Embed free text into a unit-norm `EMBED_DIM` vector. Identical
    /// input yields bit-identical output for a given model version; there
    /// is deliberately NO content-keyed cache in front of this.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(EmbedError::Unavailable("empty text".to_string()));
        }

        let local = tokio::time::timeout(
            LOCAL_TIMEOUT,
            tokio::task::spawn_blocking(move || encode_blocking(normalized)),
        )
        .await;

        match local {
            Ok(Ok(result @ Ok(_))) => result,
            // The remote path only covers a failed model load; runtime
            // encode errors on a loaded model stay local.
            Ok(Ok(Err(e))) => {
                if self.local_load_failed() {
                    self.embed_remote(text).await.map_err(|remote_err| {
                        EmbedError::Unavailable(format!("local: {e}; remote: {remote_err}"))
                    })
                } else {
                    Err(e)
                }
            }
            Ok(Err(join_err)) => Err(EmbedError::Unavailable(join_err.to_string())),
            Err(_) => Err(EmbedError::Timeout),
        }
    }

    fn local_load_failed(&self) -> bool {
        matches!(LOCAL_MODEL.get(), Some(Err(_)))
    }

    async fn embed_remote(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| EmbedError::Unavailable("no remote embedder configured".to_string()))?;
        remote.embed(&normalize_text(text)).await
    }

    /// Startup verification: when the remote fallback is configured, probe
    /// it once and refuse to serve on a dimensionality mismatch.
    pub async fn startup_probe(&self) -> Result<(), FatalConfig> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        match remote.embed("dimension probe").await {
            Ok(v) if v.len() == EMBED_DIM => Ok(()),
            Ok(v) => Err(FatalConfig::DimensionMismatch {
                source_name: "remote embedder",
                expected: EMBED_DIM,
                actual: v.len(),
            }),
            // An unreachable remote is a degraded fallback, not a config
            // error; the mismatch check re-runs on first successful call.
            Err(e) => {
                eprintln!("⚠️  Remote embedder probe failed: {e} (fallback degraded)");
                Ok(())
            }
        }
    }
}

struct RemoteEmbedder {
    url: String,
    client: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct RemoteEmbedding {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .expect("Failed to create embedding HTTP client");
        Self { url, client }
    }

    async fn embed(&self, normalized: &str) -> Result<Vec<f32>, EmbedError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "input": normalized }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbedError::Timeout
                } else {
                    EmbedError::Unavailable(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(EmbedError::Unavailable(format!(
                "remote embedder returned HTTP {}",
                resp.status()
            )));
        }
        let body: RemoteEmbedding = resp
            .json()
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        if body.embedding.len() != EMBED_DIM {
            return Err(EmbedError::Unavailable(format!(
                "remote embedder produced {} dims, expected {EMBED_DIM}",
                body.embedding.len()
            )));
        }
        unit_norm(body.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_and_lowercases() {
        assert_eq!(normalize_text("  Hello   World  "), "hello world");
        assert_eq!(normalize_text("a\tb\n c"), "a b c");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_text("  MIXED case   Text ");
        assert_eq!(normalize_text(&once), once);
    }

    #[test]
    fn unit_norm_produces_unit_vectors() {
        let v = unit_norm(vec![3.0, 4.0]).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn unit_norm_rejects_zero_vector() {
        assert!(unit_norm(vec![0.0; 4]).is_err());
    }

    // Loads the ONNX model (network download on first run) — opt in.
    #[tokio::test]
    async fn local_embeddings_are_unit_and_deterministic() {
        if std::env::var("MUSICR_TEST_EMBEDDER").is_err() {
            eprintln!("skipping: set MUSICR_TEST_EMBEDDER=1 to run");
            return;
        }
        let provider = EmbeddingProvider::new(None);
        let a = provider.embed("happy birthday party").await.unwrap();
        let b = provider.embed("  Happy   BIRTHDAY party ").await.unwrap();
        assert_eq!(a.len(), EMBED_DIM);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        // Same normalized input → bit-identical output.
        assert_eq!(a, b);
    }
}
