//! Run event stream. Emitting never blocks and never fails the engine.

use std::sync::{Arc, Mutex};

use invcrawl_core::{RunStage, RunType};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PROBE_STRATEGY_SELECTED: &str = "PROBE_STRATEGY_SELECTED";
pub const PROBE_STRATEGY_FAILED: &str = "PROBE_STRATEGY_FAILED";
pub const HEADLESS_USED: &str = "HEADLESS_USED";
pub const REMOVALS_SKIPPED: &str = "REMOVALS_SKIPPED";
pub const DETAIL_BATCH_DEFERRED: &str = "DETAIL_BATCH_DEFERRED";
pub const DETAIL_FETCH_FAILED: &str = "DETAIL_FETCH_FAILED";
pub const RUN_COMPLETED: &str = "RUN_COMPLETED";
pub const RUN_FAILED: &str = "RUN_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlEvent {
    pub customer_id: Uuid,
    pub job_type: RunType,
    pub job_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub data_source_id: Option<Uuid>,
    pub level: EventLevel,
    pub stage: RunStage,
    pub event_code: String,
    pub message: String,
    pub meta: JsonValue,
}

impl CrawlEvent {
    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = meta;
        self
    }
}

/// Correlation fields shared by every event of one job.
#[derive(Debug, Clone)]
pub struct EventScope {
    pub customer_id: Uuid,
    pub job_type: RunType,
    pub job_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub data_source_id: Option<Uuid>,
}

impl EventScope {
    pub fn event(
        &self,
        level: EventLevel,
        stage: RunStage,
        code: &str,
        message: impl Into<String>,
    ) -> CrawlEvent {
        CrawlEvent {
            customer_id: self.customer_id,
            job_type: self.job_type,
            job_id: self.job_id.clone(),
            run_id: self.run_id,
            data_source_id: self.data_source_id,
            level,
            stage,
            event_code: code.to_string(),
            message: message.into(),
            meta: JsonValue::Object(Default::default()),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CrawlEvent);
}

/// Logs each event through `tracing` at its own level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: CrawlEvent) {
        let run_id = event.run_id.map(|id| id.to_string()).unwrap_or_default();
        let data_source_id = event
            .data_source_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        match event.level {
            EventLevel::Info => info!(
                code = %event.event_code,
                stage = event.stage.as_str(),
                job_type = event.job_type.as_str(),
                run_id = %run_id,
                data_source_id = %data_source_id,
                meta = %event.meta,
                "{}", event.message
            ),
            EventLevel::Warn => warn!(
                code = %event.event_code,
                stage = event.stage.as_str(),
                job_type = event.job_type.as_str(),
                run_id = %run_id,
                data_source_id = %data_source_id,
                meta = %event.meta,
                "{}", event.message
            ),
            EventLevel::Error => error!(
                code = %event.event_code,
                stage = event.stage.as_str(),
                job_type = event.job_type.as_str(),
                run_id = %run_id,
                data_source_id = %data_source_id,
                meta = %event.meta,
                "{}", event.message
            ),
        }
    }
}

/// Writes events to `crawl_events` on a spawned task; failures are only logged.
#[derive(Debug, Clone)]
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_event(pool: &PgPool, event: &CrawlEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO crawl_events
            (customer_id, job_type, job_id, run_id, data_source_id, level, stage,
             event_code, message, meta)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(event.customer_id)
    .bind(event.job_type.as_str())
    .bind(&event.job_id)
    .bind(event.run_id)
    .bind(event.data_source_id)
    .bind(event.level.as_str())
    .bind(event.stage.as_str())
    .bind(&event.event_code)
    .bind(&event.message)
    .bind(&event.meta)
    .execute(pool)
    .await?;
    Ok(())
}

impl EventSink for PgEventSink {
    fn emit(&self, event: CrawlEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(code = %event.event_code, "no tokio runtime; dropping crawl event");
            return;
        };
        let pool = self.pool.clone();
        runtime.spawn(async move {
            if let Err(e) = insert_event(&pool, &event).await {
                warn!(error = %e, code = %event.event_code, "failed to insert crawl event");
            }
        });
    }
}

/// Keeps events in memory for assertions.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<CrawlEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CrawlEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn codes(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_code).collect()
    }

    pub fn count(&self, code: &str) -> usize {
        self.events().iter().filter(|e| e.event_code == code).count()
    }

    pub fn find(&self, code: &str) -> Option<CrawlEvent> {
        self.events().into_iter().find(|e| e.event_code == code)
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: CrawlEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Forwards each event to every inner sink.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: CrawlEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
