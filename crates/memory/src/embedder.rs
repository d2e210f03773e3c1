//! Local embedding client (nomic-embed-text via an Ollama-style endpoint).
//!
//! Availability is probed once at construction. After that, `embed` returns
//! `None` on any failure instead of erroring — consumers must carry a
//! keyword-search fallback.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Embedder {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
    available: bool,
}

impl Embedder {
    /// Build an embedder and probe the endpoint once with a short timeout.
    pub async fn probe(url: impl Into<String>, model: impl Into<String>, timeout_secs: u64) -> Self {
        let url = url.into();
        let model = model.into();
        let client = reqwest::Client::new();

        let available = Self::check_availability(&client, &url, &model).await;
        if available {
            info!(%model, "embedder available");
        } else {
            warn!(%model, "embedder not available; semantic search disabled");
        }

        Self {
            client,
            url,
            model,
            timeout: Duration::from_secs(timeout_secs),
            available,
        }
    }

    /// An embedder that is permanently absent. Used by tests and by callers
    /// that run without a local model.
    pub fn unavailable() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: String::new(),
            model: String::new(),
            timeout: Duration::from_secs(1),
            available: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    async fn check_availability(client: &reqwest::Client, url: &str, model: &str) -> bool {
        let response = client
            .post(url)
            .timeout(PROBE_TIMEOUT)
            .json(&json!({"model": model, "prompt": "test"}))
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .map(|body| body.get("embedding").is_some())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Embed `text`, or return `None` when the backend is absent or fails.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        if !self.available {
            return None;
        }
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({"model": self.model, "prompt": text}))
            .send()
            .await;
        let body: serde_json::Value = match response {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok()?,
            Ok(resp) => {
                warn!(status = %resp.status(), "embedding request failed");
                return None;
            }
            Err(err) => {
                warn!(%err, "embedding request failed");
                return None;
            }
        };
        let values = body.get("embedding")?.as_array()?;
        Some(values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
    }

    // ── vector <-> BLOB ──────────────────────────────────────────────────────

    /// Pack a float vector into a compact little-endian BLOB (4 bytes/value).
    pub fn to_bytes(vector: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(vector.len() * 4);
        for value in vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Unpack a BLOB produced by [`Embedder::to_bytes`]. Trailing bytes that
    /// do not form a full float are ignored.
    pub fn from_bytes(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    // ── similarity ───────────────────────────────────────────────────────────

    /// Cosine similarity; 0.0 on length mismatch or zero norm.
    pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}
