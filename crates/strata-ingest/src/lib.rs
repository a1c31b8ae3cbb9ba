//! # strata-ingest
//!
//! Pure text processing for strata: transcript normalization and
//! boundary-aware chunking. No I/O, no async; everything here is
//! deterministic and side-effect free.

pub mod chunk;
pub mod normalize;

// Re-export commonly used types at crate root
pub use chunk::{chunk_text, BoundaryChunker, Chunk, ChunkerConfig};
pub use normalize::{
    normalize, normalize_email_thread, role_ambiguity, DetectedFormat, NormalizedMessage,
    NormalizedTranscript,
};
