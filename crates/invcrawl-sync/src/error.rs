use invcrawl_core::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

/// Run-level failures. Every variant marks the run failed and dead-letters the job.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("data source {data_source_id} not found for customer {customer_id}")]
    NotFound {
        customer_id: Uuid,
        data_source_id: Uuid,
    },
    #[error("data source {0} has no resolved site profile; run probe first")]
    ProfileMissing(Uuid),
    #[error("run {run_id} belongs to another job: {reason}")]
    ForeignRun { run_id: Uuid, reason: String },
    #[error(transparent)]
    Crash(#[from] anyhow::Error),
}

impl CrawlError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::ProfileMissing(_) => ErrorCode::ProfileMissing,
            Self::ForeignRun { .. } | Self::Crash(_) => ErrorCode::ScrapeCrash,
        }
    }

    /// Message recorded on the run row, including the anyhow context chain.
    pub fn run_message(&self) -> String {
        match self {
            Self::Crash(err) => format!("{err:#}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn codes_and_messages() {
        let ds = Uuid::new_v4();
        let missing = CrawlError::ProfileMissing(ds);
        assert_eq!(missing.code(), ErrorCode::ProfileMissing);
        assert!(missing.run_message().contains("run probe first"));

        let crash: CrawlError = Err::<(), _>(anyhow::anyhow!("connection reset"))
            .context("upserting seen items")
            .unwrap_err()
            .into();
        assert_eq!(crash.code(), ErrorCode::ScrapeCrash);
        assert_eq!(crash.run_message(), "upserting seen items: connection reset");
    }
}
