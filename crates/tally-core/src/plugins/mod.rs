//! Pluggable run components: reporters, stores, broadcasters and processors.
//!
//! All of them are optional and run in configuration order. A failing component
//! is logged and skipped; it never fails the run.

pub mod broadcaster;
pub mod processor;
pub mod reporter;
pub mod store;

pub use broadcaster::{BroadcastEvent, Broadcaster, ChannelBroadcaster};
pub use processor::Processor;
pub use reporter::{LogReporter, Reporter};
pub use store::{JsonFileStore, MemoryStore, Store, StoreSession};

use crate::config::EvalConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Run-level context shared with every component.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: String,
    pub config: EvalConfig,
    pub metric_names: Vec<String>,
    pub total: Option<usize>,
    pub started_at: DateTime<Utc>,
    /// Free-form run metadata. Pre-processors may extend it; it is copied onto
    /// the finalized result.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
