//! Run orchestration
//!
//! One [`Engine`] run per invocation. The discover phase replaces the golden
//! path; the release phases load it and verify every admitted pattern. A run
//! ends in a published [`RunSummary`] unless it hit a fatal error, in which
//! case nothing is published.

use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::discovery::TopologyDiscoverer;
use crate::error::EngineError;
use crate::golden_path::{GoldenPath, GoldenPathStore};
use crate::model::ModelBuilder;
use crate::report::{RunAggregator, RunSummary, SummaryPublisher};
use crate::session::SessionProvider;
use crate::types::{Account, ConnectionKind, Phase};
use crate::verification::{Dispatcher, VerifyFilter};

/// What a run covers
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Connection kinds discovered
    pub kinds: Vec<ConnectionKind>,
    /// Patterns and ports verified
    pub filter: VerifyFilter,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            kinds: ConnectionKind::ALL.to_vec(),
            filter: VerifyFilter::default(),
        }
    }
}

pub struct Engine {
    accounts: Vec<Account>,
    sessions: Arc<dyn SessionProvider>,
    config: EngineConfig,
    store: GoldenPathStore,
    publishers: Vec<Arc<dyn SummaryPublisher>>,
}

impl Engine {
    pub fn new(
        accounts: Vec<Account>,
        sessions: Arc<dyn SessionProvider>,
        config: EngineConfig,
        store: GoldenPathStore,
    ) -> Self {
        Self {
            accounts,
            sessions,
            config,
            store,
            publishers: Vec::new(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn SummaryPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Run `phase` until it completes or `shutdown` resolves.
    pub async fn run(
        &self,
        phase: Phase,
        options: &RunOptions,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, EngineError> {
        info!(phase = %phase, accounts = self.accounts.len(), "Run starting");

        let outcome = match phase {
            Phase::Discover => self.discover(&options.kinds, shutdown).await,
            Phase::PreRelease | Phase::PostRelease => self.verify(phase, &options.filter, shutdown).await,
        };
        self.sessions.clear();

        match outcome {
            Ok(summary) => {
                self.publish(&summary).await;
                Ok(summary)
            }
            Err(e) => {
                error!(phase = %phase, error = %e, "Run aborted");
                Err(e)
            }
        }
    }

    async fn discover(
        &self,
        kinds: &[ConnectionKind],
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, EngineError> {
        let mut run = RunAggregator::new(Phase::Discover);
        let discoverer = TopologyDiscoverer::new(Arc::clone(&self.sessions), self.config.clone());

        let discovered = tokio::select! {
            output = discoverer.discover_all(&self.accounts, kinds) => Some(output),
            _ = shutdown => None,
        };
        let Some(output) = discovered else {
            warn!("Discovery interrupted; golden path left unchanged");
            return Err(EngineError::Cancelled);
        };
        let output = output?;

        let model = ModelBuilder::new(&self.accounts).build(&output.observations);
        let golden = GoldenPath::new(&self.accounts, &output, model);

        match self.store.load_existing() {
            Ok(Some(previous)) => {
                log_drift(&previous, &golden);
                for (vpc_id, assertion) in previous.violations(&output.vpcs) {
                    warn!(vpc_id = %vpc_id, assertion = %assertion, "Baseline assertion no longer holds");
                }
            }
            Ok(None) => info!(path = %self.store.path().display(), "No previous golden path"),
            Err(e) => warn!(error = %e, "Previous golden path unreadable; replacing it"),
        }

        self.store.save(&golden)?;
        info!(
            patterns = golden.summary.total,
            active_paths = golden.summary.active_paths,
            assertions = golden.assertions.len(),
            "Golden path recorded"
        );

        for warning in golden.warnings.iter().cloned() {
            run.record_warning(warning)?;
        }
        Ok(run.finalize())
    }

    async fn verify(
        &self,
        phase: Phase,
        filter: &VerifyFilter,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, EngineError> {
        let golden = self.store.load()?;
        let mut run = RunAggregator::new(phase);

        let mut accounts = golden.accounts.clone();
        accounts.extend(self.accounts.iter().cloned());
        let dispatcher = Dispatcher::new(Arc::clone(&self.sessions), self.config.clone(), &accounts);

        run.begin();
        let verified = tokio::select! {
            handed = dispatcher.verify_each(&golden.patterns, filter, |result| run.record(result)) => Some(handed),
            _ = shutdown => None,
        };
        let Some(handed) = verified else {
            let cleaned = dispatcher.in_flight().drain().await;
            warn!(cleaned_up = cleaned, "Verification interrupted");
            return Err(EngineError::Cancelled);
        };

        let handed = handed?;
        info!(results = handed, "Verification complete");
        Ok(run.finalize())
    }

    async fn publish(&self, summary: &RunSummary) {
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(summary).await {
                warn!(publisher = %publisher.name(), error = %e, "Failed to publish run summary");
            }
        }
    }
}

fn log_drift(previous: &GoldenPath, current: &GoldenPath) {
    let diff = previous.diff(current);
    if diff.is_empty() {
        info!("No drift from previous golden path");
        return;
    }
    for key in &diff.added {
        info!(pattern = %key, "Pattern added");
    }
    for key in &diff.removed {
        warn!(pattern = %key, "Pattern removed");
    }
    for key in &diff.changed {
        warn!(pattern = %key, "Pattern changed");
    }
}
