//! Mock inference backends for deterministic testing.
//!
//! [`MockEmbeddingBackend`] produces the same vector for the same text
//! on every call, and can be told to start failing after N calls to
//! exercise the pipeline's partial-progress handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use strata_core::{EmbeddingBackend, Error, Result, TagExtractor, TagOutcome, Vector};

/// Deterministic embedding from text content: character-code bucketing
/// followed by unit normalization.
pub fn mock_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dimension.max(1)];
    for (i, c) in text.chars().enumerate() {
        let idx = (c as usize + i) % vec.len();
        vec[idx] += 0.1;
    }
    let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        vec.iter_mut().for_each(|x| *x /= magnitude);
    }
    vec
}

/// Mock embedding backend with failure injection.
#[derive(Clone)]
pub struct MockEmbeddingBackend {
    dimension: usize,
    /// Calls from this index on return an error; `None` never fails.
    fail_from_call: Option<usize>,
    calls: Arc<AtomicUsize>,
    embedded_texts: Arc<Mutex<Vec<String>>>,
}

impl MockEmbeddingBackend {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fail_from_call: None,
            calls: Arc::new(AtomicUsize::new(0)),
            embedded_texts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Succeed for the first `calls` invocations of `embed_texts`, then
    /// fail every later one.
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_from_call = Some(calls);
        self
    }

    /// Fail every invocation.
    pub fn always_failing(self) -> Self {
        self.failing_after(0)
    }

    /// Number of `embed_texts` invocations so far, including failures.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every text successfully embedded, in order.
    pub fn embedded_texts(&self) -> Vec<String> {
        self.embedded_texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fail_from) = self.fail_from_call {
            if call >= fail_from {
                return Err(Error::ExternalService(
                    "mock embedding backend: injected failure".to_string(),
                ));
            }
        }

        self.embedded_texts
            .lock()
            .unwrap()
            .extend(texts.iter().cloned());

        Ok(texts
            .iter()
            .map(|t| Vector::from(mock_embedding(t, self.dimension)))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

/// Mock tag extractor returning a fixed outcome.
#[derive(Clone)]
pub struct MockTagExtractor {
    outcome: TagOutcome,
    calls: Arc<AtomicUsize>,
}

impl MockTagExtractor {
    /// Extractor that returns the given tags with no warning.
    pub fn with_tags(tags: Vec<&str>) -> Self {
        Self {
            outcome: TagOutcome {
                tags: tags.into_iter().map(String::from).collect(),
                suggestions: Vec::new(),
                warning: None,
            },
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Extractor that simulates a provider outage: empty tags plus a
    /// warning, never an error.
    pub fn failing(message: &str) -> Self {
        Self {
            outcome: TagOutcome {
                tags: Vec::new(),
                suggestions: Vec::new(),
                warning: Some(message.to_string()),
            },
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TagExtractor for MockTagExtractor {
    async fn extract(&self, _title: Option<&str>, _messages: &[String]) -> TagOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_embedding_is_deterministic() {
        let a = mock_embedding("quantum computing", 128);
        let b = mock_embedding("quantum computing", 128);
        assert_eq!(a, b);
        assert_ne!(a, mock_embedding("something else", 128));
    }

    #[test]
    fn test_mock_embedding_is_normalized() {
        let vec = mock_embedding("test", 64);
        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_backend_embeds_per_input() {
        let backend = MockEmbeddingBackend::new(16);
        let vectors = backend
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(backend.embedded_texts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_backend_fails_after_threshold() {
        let backend = MockEmbeddingBackend::new(16).failing_after(1);

        assert!(backend.embed_texts(&["first".to_string()]).await.is_ok());
        let err = backend
            .embed_texts(&["second".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalService(_)));

        // Failed batches never count as embedded.
        assert_eq!(backend.embedded_texts(), vec!["first"]);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tag_extractor_never_errors() {
        let failing = MockTagExtractor::failing("provider down");
        let outcome = failing.extract(Some("title"), &["msg".to_string()]).await;
        assert!(outcome.tags.is_empty());
        assert_eq!(outcome.warning.as_deref(), Some("provider down"));
        assert_eq!(failing.call_count(), 1);
    }
}
