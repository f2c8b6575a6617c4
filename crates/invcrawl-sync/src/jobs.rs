//! Job contract shared by the probe and production engines, plus the run-row
//! lifecycle both of them follow.

use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use invcrawl_core::{ErrorCode, RunCounts, RunFinish, RunStage, RunStatus, RunType, ScrapeRun, SiteProfile};
use invcrawl_storage::CrawlStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CrawlError;
use crate::events::{EventLevel, EventScope, EventSink, RUN_FAILED};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub data_source_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCorrelation {
    pub customer_id: Uuid,
    pub data_source_id: Uuid,
    /// Pre-created run row to reuse instead of creating one.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl JobCorrelation {
    pub fn new(customer_id: Uuid, data_source_id: Uuid) -> Self {
        Self {
            customer_id,
            data_source_id,
            run_id: None,
            job_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Queue-side acknowledgement. Transport and retry policy live in the queue.
#[async_trait]
pub trait JobHandle: Send + Sync {
    async fn ack(&self) -> anyhow::Result<()>;

    async fn dead_letter(&self, reason: &str) -> anyhow::Result<()>;
}

/// Handle for jobs started from the command line: outcomes are only logged.
#[derive(Debug, Clone)]
pub struct LoggingJobHandle {
    label: String,
}

impl LoggingJobHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl JobHandle for LoggingJobHandle {
    async fn ack(&self) -> anyhow::Result<()> {
        info!(job = %self.label, "job acked");
        Ok(())
    }

    async fn dead_letter(&self, reason: &str) -> anyhow::Result<()> {
        warn!(job = %self.label, reason, "job dead-lettered");
        Ok(())
    }
}

/// Records acknowledgements for assertions.
#[derive(Debug, Default)]
pub struct MemoryJobHandle {
    acks: Mutex<usize>,
    dead_letters: Mutex<Vec<String>>,
}

impl MemoryJobHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack_count(&self) -> usize {
        self.acks.lock().map(|n| *n).unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<String> {
        self.dead_letters
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobHandle for MemoryJobHandle {
    async fn ack(&self) -> anyhow::Result<()> {
        if let Ok(mut acks) = self.acks.lock() {
            *acks += 1;
        }
        Ok(())
    }

    async fn dead_letter(&self, reason: &str) -> anyhow::Result<()> {
        if let Ok(mut dead) = self.dead_letters.lock() {
            dead.push(reason.to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailStats {
    pub fetched: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Probed {
        run_id: Uuid,
        profile: SiteProfile,
        found_count: usize,
    },
    Crawled {
        run_id: Uuid,
        counts: RunCounts,
        detail: DetailStats,
    },
    /// `run_id` is absent only when the run row itself could not be created.
    DeadLettered {
        run_id: Option<Uuid>,
        code: ErrorCode,
        message: String,
    },
    /// The supplied run was already terminal; acked without doing work.
    AlreadyFinished { run_id: Uuid, status: RunStatus },
}

impl JobOutcome {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Probed { run_id, .. }
            | Self::Crawled { run_id, .. }
            | Self::AlreadyFinished { run_id, .. } => Some(*run_id),
            Self::DeadLettered { run_id, .. } => *run_id,
        }
    }

    pub fn is_acked(&self) -> bool {
        !matches!(self, Self::DeadLettered { .. })
    }
}

pub(crate) enum RunStart {
    Started(Uuid),
    AlreadyFinished(ScrapeRun),
}

/// Creates or reuses the run row and moves it to `running`. A supplied run
/// must belong to the same customer, data source and run type.
pub(crate) async fn begin_run(
    store: &dyn CrawlStore,
    correlation: &JobCorrelation,
    run_type: RunType,
) -> Result<RunStart, CrawlError> {
    let existing = match correlation.run_id {
        Some(run_id) => store.get_run(run_id).await?,
        None => None,
    };

    let run_id = match existing {
        Some(run) => {
            if let Some(reason) = ownership_mismatch(&run, correlation, run_type) {
                return Err(CrawlError::ForeignRun {
                    run_id: run.id,
                    reason,
                });
            }
            if run.status.is_terminal() {
                return Ok(RunStart::AlreadyFinished(run));
            }
            run.id
        }
        None => {
            let mut run = ScrapeRun::queued(
                correlation.customer_id,
                correlation.data_source_id,
                run_type,
            );
            if let Some(run_id) = correlation.run_id {
                run.id = run_id;
            }
            store
                .create_run(&run)
                .await
                .with_context(|| format!("creating {} run", run_type.as_str()))?;
            run.id
        }
    };

    // A redelivered job finds its run already running and carries on.
    store.mark_run_running(run_id, Utc::now()).await?;
    Ok(RunStart::Started(run_id))
}

fn ownership_mismatch(
    run: &ScrapeRun,
    correlation: &JobCorrelation,
    run_type: RunType,
) -> Option<String> {
    if run.customer_id != correlation.customer_id {
        Some(format!("customer {}", run.customer_id))
    } else if run.data_source_id != correlation.data_source_id {
        Some(format!("data source {}", run.data_source_id))
    } else if run.run_type != run_type {
        Some(format!("{} run", run.run_type.as_str()))
    } else {
        None
    }
}

/// Run row a failed `begin_run` may still mark failed. Never a foreign one.
pub(crate) fn owned_run_id(correlation: &JobCorrelation, err: &CrawlError) -> Option<Uuid> {
    match err {
        CrawlError::ForeignRun { .. } => None,
        _ => correlation.run_id,
    }
}

pub(crate) async fn acknowledge(handle: &dyn JobHandle, run_id: Uuid) {
    if let Err(e) = handle.ack().await {
        warn!(run_id = %run_id, error = %e, "job ack failed");
    }
}

/// Marks the run failed, emits `RUN_FAILED`, and dead-letters the job.
pub(crate) async fn fail_run(
    store: &dyn CrawlStore,
    events: &dyn EventSink,
    handle: &dyn JobHandle,
    scope: &EventScope,
    stage: RunStage,
    run_id: Option<Uuid>,
    err: CrawlError,
) -> JobOutcome {
    let code = err.code();
    let message = err.run_message();
    let finish = RunFinish::Failed {
        code,
        message: message.clone(),
    };
    if let Some(run_id) = run_id {
        if let Err(e) = store.finish_run(run_id, &finish, Utc::now()).await {
            warn!(run_id = %run_id, error = %e, "failed to mark run failed");
        }
    }
    events.emit(
        scope
            .event(EventLevel::Error, stage, RUN_FAILED, message.clone())
            .with_meta(json!({ "errorCode": code.as_str() })),
    );
    if let Err(e) = handle.dead_letter(&format!("{code}: {message}")).await {
        warn!(run_id = ?run_id, error = %e, "dead-letter failed");
    }
    JobOutcome::DeadLettered {
        run_id,
        code,
        message,
    }
}
