//! Ingestion runtime - channel-fed, bounded-concurrency snapshot processing
//!
//! Snapshots are independent units: each one is ingested on its own
//! connection and transaction, and each produces its own `SnapshotOutcome`
//! (success or typed failure). A failing snapshot never stops the others;
//! the caller decides how to report partial success. Inside a single
//! snapshot there is no partial success (see `ingestor`).

use super::ingestor::{IngestError, IngestSummary, SnapshotSink};
use super::retry::ExponentialBackoff;
use super::snapshot::Snapshot;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{self, JoinSet};

/// One snapshot queued for ingestion
#[derive(Debug, Clone)]
pub struct SnapshotJob {
    /// Where the snapshot came from (file path, object key), for reporting
    pub source: String,
    pub snapshot: Snapshot,
}

/// Terminal status of one snapshot
#[derive(Debug)]
pub struct SnapshotOutcome {
    pub source: String,
    pub result: Result<IngestSummary, IngestError>,
    /// Ingestion attempts made (1 unless transient errors were retried)
    pub attempts: u32,
}

impl SnapshotOutcome {
    /// Outcome for a snapshot that never reached the sink
    pub fn rejected(source: impl Into<String>, error: IngestError) -> Self {
        Self {
            source: source.into(),
            result: Err(error),
            attempts: 0,
        }
    }
}

/// Retry settings for transient store errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay, self.max_retries)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSnapshot {
    pub source: String,
    pub error: String,
}

/// Aggregate view over a batch of outcomes
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub samples_written: usize,
    pub failures: Vec<FailedSnapshot>,
}

impl IngestionReport {
    pub fn from_outcomes(outcomes: &[SnapshotOutcome]) -> Self {
        let mut report = Self {
            total: outcomes.len(),
            ..Self::default()
        };

        for outcome in outcomes {
            match &outcome.result {
                Ok(summary) => {
                    report.succeeded += 1;
                    report.samples_written += summary.samples_written;
                }
                Err(e) => {
                    report.failed += 1;
                    report.failures.push(FailedSnapshot {
                        source: outcome.source.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Ingest one job, retrying transient store failures with backoff
pub async fn ingest_with_retry(
    sink: &dyn SnapshotSink,
    job: SnapshotJob,
    retry: RetryPolicy,
) -> SnapshotOutcome {
    let mut backoff = retry.backoff();

    loop {
        let result = sink.ingest(job.snapshot.clone()).await;
        let attempts = backoff.attempts() + 1;
        match result {
            Ok(summary) => {
                return SnapshotOutcome {
                    source: job.source,
                    result: Ok(summary),
                    attempts,
                }
            }
            Err(e) if e.is_transient() => {
                log::warn!("⚠️  Transient failure on {}: {}", job.source, e);
                if backoff.sleep().await.is_err() {
                    log::error!("❌ Giving up on {} after {} attempts", job.source, attempts);
                    return SnapshotOutcome {
                        source: job.source,
                        result: Err(e),
                        attempts,
                    };
                }
            }
            Err(e) => {
                log::error!("❌ Snapshot {} failed: {}", job.source, e);
                return SnapshotOutcome {
                    source: job.source,
                    result: Err(e),
                    attempts,
                };
            }
        }
    }
}

/// Start snapshot ingestion from a job channel
///
/// Main loop:
/// 1. Receives jobs from the collector side via mpsc channel
/// 2. Runs up to `workers` ingestions at once (semaphore-bounded)
/// 3. Returns every outcome, in completion order, once the channel closes
///    and all in-flight ingestions have finished
///
/// A task that panics still yields an outcome under its job's source.
pub async fn start_snapshot_ingestion(
    mut rx: mpsc::Receiver<SnapshotJob>,
    sink: Arc<dyn SnapshotSink>,
    workers: usize,
    retry: RetryPolicy,
) -> Vec<SnapshotOutcome> {
    let workers = workers.max(1);
    log::info!("🚀 Starting snapshot ingestion");
    log::info!("   ├─ Backend: {}", sink.backend_type());
    log::info!("   ├─ Workers: {}", workers);
    log::info!("   └─ Max retries: {}", retry.max_retries);

    let permits = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();
    let mut sources: HashMap<task::Id, String> = HashMap::new();
    let mut outcomes = Vec::new();

    while let Some(job) = rx.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break, // semaphore closed
        };

        let source = job.source.clone();
        let sink = sink.clone();
        let handle = tasks.spawn(async move {
            let outcome = ingest_with_retry(sink.as_ref(), job, retry).await;
            drop(permit);
            outcome
        });
        sources.insert(handle.id(), source);

        while let Some(joined) = tasks.try_join_next_with_id() {
            collect(joined, &mut sources, &mut outcomes);
        }
    }

    log::info!("🔄 Channel closed, waiting for {} in-flight snapshots", tasks.len());

    while let Some(joined) = tasks.join_next_with_id().await {
        collect(joined, &mut sources, &mut outcomes);
    }

    let report = IngestionReport::from_outcomes(&outcomes);
    log::info!(
        "✅ Snapshot ingestion stopped: {} ok, {} failed, {} samples",
        report.succeeded,
        report.failed,
        report.samples_written
    );

    outcomes
}

fn collect(
    joined: Result<(task::Id, SnapshotOutcome), task::JoinError>,
    sources: &mut HashMap<task::Id, String>,
    outcomes: &mut Vec<SnapshotOutcome>,
) {
    match joined {
        Ok((id, outcome)) => {
            sources.remove(&id);
            outcomes.push(outcome);
        }
        Err(e) => {
            let source = sources
                .remove(&e.id())
                .unwrap_or_else(|| format!("task {}", e.id()));
            log::error!("❌ Ingestion task for {} aborted: {}", source, e);
            outcomes.push(SnapshotOutcome::rejected(
                source,
                IngestError::Join(e.to_string()),
            ));
        }
    }
}
