// Windowed classification over the full record collection
//
// Each call examines at most one window starting at the cursor. Probes run
// without holding the state lock so the operator read model stays live while
// a window is in flight.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::core::config::ScanConfig;
use crate::core::errors::ScanError;
use crate::core::types::{CandidateSet, Record, ScanReport};
use crate::services::probe::{SizeProbe, UNKNOWN_SIZE};
use crate::services::store::RecordStore;
use crate::utils::Metrics;

#[derive(Debug, Default)]
struct ScanState {
    cursor: usize,
    total: usize,
    candidates: CandidateSet,
    unknown_count: usize,
    force_all: bool,
}

enum Verdict {
    Candidate,
    Unknown,
    Skip,
}

pub struct BatchScanner {
    records: Arc<dyn RecordStore>,
    probe: Arc<dyn SizeProbe>,
    window_size: usize,
    heavy_threshold: u64,
    probe_timeout: Duration,
    skip_processed: bool,
    scanning: AtomicBool,
    state: Mutex<ScanState>,
    metrics: Option<Metrics>,
}

/// Clears the scanning flag however the window ends
struct ScanningGuard<'a>(&'a AtomicBool);

impl Drop for ScanningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchScanner {
    pub fn new(
        records: Arc<dyn RecordStore>,
        probe: Arc<dyn SizeProbe>,
        config: &ScanConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            records,
            probe,
            window_size: config.window_size.max(1),
            heavy_threshold: config.heavy_threshold_bytes,
            probe_timeout: config.probe_timeout,
            skip_processed: config.skip_processed,
            scanning: AtomicBool::new(false),
            state: Mutex::new(ScanState {
                force_all: config.force_all,
                ..Default::default()
            }),
            metrics,
        }
    }

    /// Classify the next window and advance the cursor past it
    #[instrument(skip(self))]
    pub async fn scan_window(&self) -> Result<ScanReport, ScanError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ScanError::Busy);
        }
        let _guard = ScanningGuard(&self.scanning);

        let (cursor, force_all) = {
            let state = self.state.lock();
            (state.cursor, state.force_all)
        };

        let total = self.records.count().await?;
        let page = if cursor < total {
            self.records.list_page(cursor, self.window_size).await?
        } else {
            Vec::new()
        };

        let mut heavy = Vec::new();
        let mut unknown_added = 0;
        let mut skipped = 0;
        for record in &page {
            match self.classify(record, force_all).await {
                Verdict::Candidate => heavy.push(record.clone()),
                Verdict::Unknown => unknown_added += 1,
                Verdict::Skip => skipped += 1,
            }
        }

        let mut state = self.state.lock();
        let candidates_added = heavy
            .into_iter()
            .filter(|record| state.candidates.push(record.clone()))
            .count();
        state.unknown_count += unknown_added;
        state.cursor = (cursor + page.len()).min(total);
        state.total = total;

        let report = ScanReport {
            processed: page.len(),
            candidates_added,
            unknown_added,
            skipped,
            cursor: state.cursor,
            total,
            exhausted: page.len() < self.window_size || state.cursor >= total,
        };
        drop(state);

        if let Some(ref m) = self.metrics {
            m.record_scan_window();
        }
        info!(
            "Scanned {} records ({}/{}): +{} candidates, +{} unknown, {} skipped",
            report.processed,
            report.cursor,
            report.total,
            report.candidates_added,
            report.unknown_added,
            report.skipped
        );
        Ok(report)
    }

    async fn classify(&self, record: &Record, force_all: bool) -> Verdict {
        if !record.has_remote_image() {
            return Verdict::Skip;
        }
        if self.skip_processed && record.is_processed() {
            return Verdict::Skip;
        }
        if force_all {
            return Verdict::Candidate;
        }

        let size = self.probe.probe(&record.image_ref, self.probe_timeout).await;
        if size == UNKNOWN_SIZE {
            debug!("Size unknown for {}", record.id);
            Verdict::Unknown
        } else if size > self.heavy_threshold {
            Verdict::Candidate
        } else {
            Verdict::Skip
        }
    }

    /// Back to the start: cursor, candidates and unknown count
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.cursor = 0;
        state.candidates.clear();
        state.unknown_count = 0;
    }

    pub fn set_force_all(&self, enabled: bool) {
        self.state.lock().force_all = enabled;
    }

    pub fn force_all(&self) -> bool {
        self.state.lock().force_all
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    /// Collection size seen by the most recent window
    pub fn total_seen(&self) -> usize {
        self.state.lock().total
    }

    pub fn unknown_count(&self) -> usize {
        self.state.lock().unknown_count
    }

    pub fn candidate_count(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub fn candidate_titles(&self) -> Vec<String> {
        self.state.lock().candidates.titles()
    }

    pub fn clear_candidates(&self) {
        self.state.lock().candidates.clear();
    }

    /// Hand the accumulated set to a batch run
    pub fn take_candidates(&self) -> CandidateSet {
        std::mem::take(&mut self.state.lock().candidates)
    }

    /// Return what a run left over; it keeps its place ahead of anything newer
    pub fn restore_candidates(&self, mut remaining: CandidateSet) {
        let mut state = self.state.lock();
        for record in state.candidates.iter() {
            remaining.push(record.clone());
        }
        state.candidates = remaining;
    }
}
