//! Centralized default constants for the strata system.
//!
//! **This module is the single source of truth** for all shared default values.
//! All crates should reference these constants instead of defining their own
//! magic numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section and document the rationale for the chosen value.

// =============================================================================
// CHUNKING
// =============================================================================

/// Maximum bytes per chunk for message splitting.
pub const CHUNK_SIZE: usize = 3000;

/// Overlap bytes between adjacent chunks for context preservation.
pub const CHUNK_OVERLAP: usize = 200;

/// Fraction of the window reserved for boundary search: a sentence
/// terminator or space only counts as a cut point when it falls past
/// `start + CHUNK_BOUNDARY_ZONE * CHUNK_SIZE`.
pub const CHUNK_BOUNDARY_ZONE: f64 = 0.8;

/// Chunk size as i32 (for serde default functions on DB-facing types).
pub const CHUNK_SIZE_I32: i32 = CHUNK_SIZE as i32;

/// Chunk overlap as i32 (for serde default functions on DB-facing types).
pub const CHUNK_OVERLAP_I32: i32 = CHUNK_OVERLAP as i32;

// =============================================================================
// EMBEDDING
// =============================================================================

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Chunks sent per embedding request.
pub const EMBED_BATCH_SIZE: usize = 32;

/// Timeout for embedding requests in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Ollama base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default tagging model name (Ollama).
pub const TAG_MODEL: &str = "llama3.2:3b";

/// Timeout for tag extraction requests in seconds.
pub const TAG_TIMEOUT_SECS: u64 = 60;

/// Maximum tags accepted from one extraction.
pub const TAG_MAX_COUNT: usize = 8;

/// Messages sampled into the tagging prompt.
pub const TAG_SAMPLE_MESSAGES: usize = 12;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default batch size for one `process_queue` invocation.
pub const PROCESS_BATCH_LIMIT: i64 = 10;

/// Lock lease in seconds; jobs locked longer are reclaimed by the
/// stale-lock sweep. Generous against the slowest expected step
/// (embedding a large import) so a live owner is never reclaimed.
pub const LOCK_LEASE_SECS: i64 = 600;

/// Default polling worker interval in milliseconds.
pub const WORKER_POLL_INTERVAL_MS: u64 = 30_000;

/// Terminal jobs older than this many days are pruned by `cleanup`.
pub const JOB_RETENTION_DAYS: i32 = 30;

// =============================================================================
// STRUCTURE RECOMPUTE
// =============================================================================

/// Gap in minutes that ends a thinking-time window.
pub const SESSION_GAP_MINUTES: i64 = 30;

/// Tasks due within this many hours produce a priority signal.
pub const PRIORITY_DUE_SOON_HOURS: i64 = 72;

/// Open decisions older than this many days produce a tension signal.
pub const TENSION_STALE_DAYS: i64 = 7;

/// Tension keeps growing with age until this many days, then saturates
/// at score 1.0.
pub const TENSION_SATURATION_DAYS: i64 = 28;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3400;

/// Maximum request body size in bytes (4 MB; captures are pasted text,
/// not file uploads).
pub const MAX_BODY_SIZE_BYTES: usize = 4 * 1024 * 1024;

/// Default page size for job polling endpoints.
pub const PAGE_LIMIT_JOBS: i64 = 20;

// =============================================================================
// DATABASE
// =============================================================================

/// Default maximum pool connections.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Default pool acquire timeout in seconds.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;
