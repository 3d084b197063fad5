// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod archive;
pub mod batch;
pub mod cache;
pub mod captcha;
pub mod config;
pub mod cost;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod reliability;
pub mod session;
pub mod source;
pub mod sources;
pub mod testing;
pub mod text;
pub mod types;

/// Sent with every outbound request.
pub const USER_AGENT: &str = "death-enrichment/0.1 (+github.com/lumlich/death-enrichment)";

// ---- Re-exports for stable public API ----
pub use crate::batch::{run_batch, BatchReport};
pub use crate::config::EnrichmentConfig;
pub use crate::cost::RunBudget;
pub use crate::error::{LookupError, LookupResult};
pub use crate::orchestrator::{EnrichmentReport, ExitReason, Orchestrator, RunStats};
pub use crate::source::{Source, SourceAnswer};
pub use crate::types::{
    DeathFields, EnrichmentPayload, EnrichmentSubject, ReliabilityTier, SourceCategory,
    SourceDescriptor, SourceEntry,
};
