//! # strata-inference
//!
//! External model boundaries for strata: the Ollama embedding backend
//! used by the embed-chunks step, and the best-effort tag extractor
//! used at finalize. Both speak to a local Ollama server; the mock
//! module (feature `mock`) provides deterministic stand-ins for
//! pipeline tests.

#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod tags;

#[cfg(feature = "mock")]
pub use mock::{mock_embedding, MockEmbeddingBackend, MockTagExtractor};
pub use ollama::{OllamaBackend, OllamaConfig};
pub use tags::{normalize_tags, OllamaTagExtractor, TagConfig};

pub use strata_core::{EmbeddingBackend, TagExtractor};
