// Operator surface over the scanner and runner
//
// Scanning and running are mutually exclusive; only one of either may be in
// flight. A run owns the candidate set while it executes and hands the
// leftovers back when it stops.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::SessionError;
use crate::core::types::{
    ErrorLogEntry, OptimizeMode, ProgressState, Record, RunOutcome, ScanReport, SessionPhase,
    SessionSnapshot,
};
use crate::orchestration::optimizer::OptimizationOrchestrator;
use crate::orchestration::runner::{BatchRunner, ErrorLog};
use crate::orchestration::scanner::BatchScanner;
use crate::services::converter::Converter;
use crate::services::gateway::ConversionGateway;
use crate::services::probe::SizeProbe;
use crate::services::store::{AssetStore, RecordStore, RuntimeSettings};
use crate::utils::Metrics;

/// Returns the session to idle when the owning operation ends
struct PhaseGuard(Arc<Mutex<SessionPhase>>);

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        *self.0.lock() = SessionPhase::Idle;
    }
}

pub struct OptimizationSession {
    scanner: Arc<BatchScanner>,
    runner: Arc<BatchRunner>,
    optimizer: Arc<OptimizationOrchestrator>,
    records: Arc<dyn RecordStore>,
    gateway: Arc<ConversionGateway>,
    settings: Arc<RuntimeSettings>,
    phase: Arc<Mutex<SessionPhase>>,
    cancel: Mutex<Option<CancellationToken>>,
    run_handle: Mutex<Option<JoinHandle<RunOutcome>>>,
    progress: Arc<watch::Sender<ProgressState>>,
    errors: ErrorLog,
}

impl OptimizationSession {
    pub fn new(
        scanner: Arc<BatchScanner>,
        runner: Arc<BatchRunner>,
        optimizer: Arc<OptimizationOrchestrator>,
        records: Arc<dyn RecordStore>,
        gateway: Arc<ConversionGateway>,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        let (progress, _) = watch::channel(ProgressState::default());
        Self {
            scanner,
            runner,
            optimizer,
            records,
            gateway,
            settings,
            phase: Arc::new(Mutex::new(SessionPhase::Idle)),
            cancel: Mutex::new(None),
            run_handle: Mutex::new(None),
            progress: Arc::new(progress),
            errors: ErrorLog::new(),
        }
    }

    /// Wire the full pipeline over the given collaborators
    #[instrument(skip_all)]
    pub fn assemble(
        config: &Config,
        records: Arc<dyn RecordStore>,
        assets: Arc<dyn AssetStore>,
        probe: Arc<dyn SizeProbe>,
        metrics: Option<Metrics>,
    ) -> anyhow::Result<Self> {
        info!("Initializing services...");

        let settings = Arc::new(RuntimeSettings::new(config.gateway.endpoint.clone()));
        let gateway = Arc::new(ConversionGateway::new(
            &config.gateway,
            settings.clone(),
            metrics.clone(),
        )?);
        let converter = Arc::new(Converter::new(&config.conversion, metrics.clone())?);
        let optimizer = Arc::new(OptimizationOrchestrator::new(
            config,
            records.clone(),
            assets,
            gateway.clone(),
            converter,
            metrics.clone(),
        ));
        let scanner = Arc::new(BatchScanner::new(
            records.clone(),
            probe,
            &config.scan,
            metrics.clone(),
        ));
        let runner = Arc::new(BatchRunner::new(optimizer.clone(), &config.run, metrics));

        info!(
            "✓ Ready (window: {}, threshold: {} KiB, endpoint: {})",
            config.scan.window_size,
            config.scan.heavy_threshold_bytes / 1024,
            if gateway.is_configured() { "configured" } else { "none" }
        );

        Ok(Self::new(scanner, runner, optimizer, records, gateway, settings))
    }

    fn enter(&self, next: SessionPhase) -> Result<PhaseGuard, SessionError> {
        let mut phase = self.phase.lock();
        match *phase {
            SessionPhase::Idle => {
                *phase = next;
                Ok(PhaseGuard(self.phase.clone()))
            }
            SessionPhase::Running => Err(SessionError::AlreadyRunning),
            SessionPhase::Scanning => Err(SessionError::Busy),
        }
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match *self.phase.lock() {
            SessionPhase::Idle => Ok(()),
            SessionPhase::Running => Err(SessionError::AlreadyRunning),
            SessionPhase::Scanning => Err(SessionError::Busy),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub async fn scan_window(&self) -> Result<ScanReport, SessionError> {
        let _guard = self.enter(SessionPhase::Scanning)?;
        Ok(self.scanner.scan_window().await?)
    }

    pub fn set_force_all(&self, enabled: bool) {
        info!("Force-all {}", if enabled { "enabled" } else { "disabled" });
        self.scanner.set_force_all(enabled);
    }

    pub fn reset_cursor(&self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.scanner.reset();
        info!("Scan cursor reset");
        Ok(())
    }

    pub fn clear_candidates(&self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.scanner.clear_candidates();
        Ok(())
    }

    pub fn clear_errors(&self) {
        self.errors.clear();
    }

    /// Replace the conversion endpoint; blank clears it
    pub fn set_conversion_endpoint(&self, endpoint: Option<String>) {
        self.settings.set_conversion_endpoint(endpoint);
        self.gateway.circuit_breaker().reset();
        info!(
            "Conversion endpoint {}",
            if self.gateway.is_configured() { "updated" } else { "cleared" }
        );
    }

    /// Spawn a run over the current candidate set; returns its size
    #[instrument(skip(self))]
    pub fn start_run(&self) -> Result<usize, SessionError> {
        let guard = self.enter(SessionPhase::Running)?;

        let mut candidates = self.scanner.take_candidates();
        let total = candidates.len();
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        let runner = self.runner.clone();
        let scanner = self.scanner.clone();
        let progress = self.progress.clone();
        let errors = self.errors.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let outcome = runner
                .run(&mut candidates, runner.item_timeout(), &token, &progress, &errors)
                .await;
            scanner.restore_candidates(candidates);
            outcome
        });
        *self.run_handle.lock() = Some(handle);

        info!("Batch run spawned with {} candidates", total);
        Ok(total)
    }

    /// Request a stop; the item in flight is allowed to finish
    pub fn stop_run(&self) -> Result<(), SessionError> {
        if self.phase() != SessionPhase::Running {
            return Err(SessionError::NotRunning);
        }
        match self.cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                info!("Stop requested");
                Ok(())
            }
            None => Err(SessionError::NotRunning),
        }
    }

    /// Wait for the spawned run, if any, and report how it ended
    pub async fn wait_for_run(&self) -> Option<RunOutcome> {
        let handle = self.run_handle.lock().take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Batch run task failed: {}", e);
                None
            }
        }
    }

    /// Optimize one record through the endpoint only, so a missing
    /// configuration surfaces instead of silently falling back
    #[instrument(skip(self))]
    pub async fn test_record(&self, id: &str) -> Result<Record, SessionError> {
        if self.phase() == SessionPhase::Running {
            return Err(SessionError::AlreadyRunning);
        }
        let record = self
            .records
            .get_by_id(id)
            .await?
            .ok_or_else(|| SessionError::RecordNotFound(id.to_string()))?;
        Ok(self
            .optimizer
            .optimize_with(&record, OptimizeMode::GatewayOnly)
            .await?)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressState> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> ProgressState {
        self.progress.borrow().clone()
    }

    pub fn errors(&self) -> Vec<ErrorLogEntry> {
        self.errors.entries()
    }

    pub fn candidate_titles(&self) -> Vec<String> {
        self.scanner.candidate_titles()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let phase = self.phase();
        let progress = self.progress();
        // While running the set lives inside the run task
        let candidates = match phase {
            SessionPhase::Running => progress.total.saturating_sub(progress.current),
            _ => self.scanner.candidate_count(),
        };

        SessionSnapshot {
            phase,
            cursor: self.scanner.cursor(),
            total_records: self.scanner.total_seen(),
            candidates,
            unknown_count: self.scanner.unknown_count(),
            force_all: self.scanner.force_all(),
            progress,
            errors: self.errors.entries(),
            gateway_configured: self.gateway.is_configured(),
        }
    }
}
