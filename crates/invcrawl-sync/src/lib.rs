//! Probe and production crawl engines.

mod config;
mod error;
pub mod events;
mod jobs;
mod probe;
mod production;

pub use config::EngineConfig;
pub use error::CrawlError;
pub use events::{CrawlEvent, EventLevel, EventSink, FanoutEventSink, MemoryEventSink, PgEventSink, TracingEventSink};
pub use jobs::{
    DetailStats, JobCorrelation, JobHandle, JobOutcome, JobPayload, LoggingJobHandle,
    MemoryJobHandle,
};
pub use probe::{ProbeEngine, ProbeReport, StrategyOutcome, StrategyStatus};
pub use production::{DetailFailure, ProductionEngine};

pub const CRATE_NAME: &str = "invcrawl-sync";
