// Sequential batch runner
//
// One item at a time, in candidate order. Cancellation is only observed
// between items; an item that has started runs until it finishes or its own
// timeout fires.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::config::RunConfig;
use crate::core::types::{CandidateSet, ErrorLogEntry, ProgressState, RunOutcome};
use crate::orchestration::optimizer::RecordOptimizer;
use crate::utils::Metrics;

/// Per-item failures, kept until the operator clears them
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<ErrorLogEntry>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: ErrorLogEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<ErrorLogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

pub struct BatchRunner {
    optimizer: Arc<dyn RecordOptimizer>,
    item_timeout: Duration,
    pacing_delay: Duration,
    metrics: Option<Metrics>,
}

impl BatchRunner {
    pub fn new(optimizer: Arc<dyn RecordOptimizer>, config: &RunConfig, metrics: Option<Metrics>) -> Self {
        Self {
            optimizer,
            item_timeout: config.item_timeout,
            pacing_delay: config.pacing_delay,
            metrics,
        }
    }

    pub fn item_timeout(&self) -> Duration {
        self.item_timeout
    }

    /// Drive every candidate through the optimizer.
    ///
    /// Completed runs leave `candidates` empty; a cancelled run leaves the
    /// unprocessed tail in its original order.
    #[instrument(skip_all, fields(total = candidates.len()))]
    pub async fn run(
        &self,
        candidates: &mut CandidateSet,
        item_timeout: Duration,
        cancel: &CancellationToken,
        progress: &watch::Sender<ProgressState>,
        errors: &ErrorLog,
    ) -> RunOutcome {
        let total = candidates.len();
        progress.send_replace(ProgressState::starting(total));
        info!("Batch run started: {} candidates", total);

        let mut processed = 0;
        let mut outcome = RunOutcome::Completed;

        for index in 0..total {
            if cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }
            let Some(record) = candidates.get(index) else {
                break;
            };
            let title = record.display_title().to_string();

            progress.send_modify(|p| {
                p.status_message = format!("Optimizing '{}' ({}/{})", title, index + 1, total);
            });

            if !record.has_remote_image() {
                progress.send_modify(|p| {
                    p.current = index + 1;
                    p.skipped_count += 1;
                });
                processed += 1;
                continue;
            }

            let result = tokio::time::timeout(item_timeout, self.optimizer.optimize(record)).await;
            let failure = match result {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some((e.to_string(), e.is_timeout())),
                Err(_) => Some(("Timeout".to_string(), true)),
            };

            if let Some(ref m) = self.metrics {
                m.record_item(failure.is_none(), failure.as_ref().is_some_and(|(_, t)| *t));
            }
            if let Some((message, _)) = &failure {
                warn!("'{}' failed: {}", title, message);
                errors.push(ErrorLogEntry::new(title.clone(), message.clone()));
            }

            // Counters and position move together in one update
            progress.send_modify(|p| {
                p.current = index + 1;
                if failure.is_some() {
                    p.failure_count += 1;
                } else {
                    p.success_count += 1;
                }
            });
            processed += 1;

            if index + 1 < total && !self.pacing_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.pacing_delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        match outcome {
            RunOutcome::Completed => candidates.clear(),
            RunOutcome::Cancelled => candidates.discard_front(processed),
        }

        progress.send_modify(|p| {
            p.status_message = match outcome {
                RunOutcome::Completed => format!(
                    "Finished: {} succeeded, {} failed, {} skipped",
                    p.success_count, p.failure_count, p.skipped_count
                ),
                RunOutcome::Cancelled => format!(
                    "Stopped after {} of {} ({} remaining)",
                    processed,
                    total,
                    total - processed
                ),
            };
        });

        if let Some(ref m) = self.metrics {
            m.record_run_finished(outcome == RunOutcome::Cancelled);
        }
        info!("Batch run {:?}: {}/{} processed", outcome, processed, total);
        outcome
    }
}
