//! Test Run Aggregator and summary publishing

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, PartialDiscoveryWarning};
use crate::types::{Outcome, Phase, VerificationResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Warn => self.warnings += 1,
            Outcome::Skip => self.skipped += 1,
        }
    }
}

/// Terminal record of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// From the first recorded result to finalize
    pub duration_ms: u64,
    pub counts: OutcomeCounts,
    pub results: Vec<VerificationResult>,
    pub warnings: Vec<PartialDiscoveryWarning>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.counts.failed == 0
    }
}

/// Collects results for one run; `finalize` seals it
pub struct RunAggregator {
    run_id: Uuid,
    phase: Phase,
    started_at: DateTime<Utc>,
    first_record: Option<Instant>,
    results: Vec<VerificationResult>,
    warnings: Vec<PartialDiscoveryWarning>,
    finalized: Option<RunSummary>,
}

impl RunAggregator {
    pub fn new(phase: Phase) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            phase,
            started_at: Utc::now(),
            first_record: None,
            results: Vec::new(),
            warnings: Vec::new(),
            finalized: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Start the wall clock before the first result arrives, so the
    /// duration covers work still in progress when that result lands
    pub fn begin(&mut self) {
        self.first_record.get_or_insert_with(Instant::now);
    }

    pub fn record(&mut self, result: VerificationResult) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.first_record.get_or_insert_with(Instant::now);
        self.results.push(result);
        Ok(())
    }

    pub fn record_warning(&mut self, warning: PartialDiscoveryWarning) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.warnings.push(warning);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.finalized.is_some() {
            return Err(EngineError::RunAlreadyFinalized);
        }
        Ok(())
    }

    /// Seal the run. Calling again returns the same summary.
    pub fn finalize(&mut self) -> RunSummary {
        if let Some(summary) = &self.finalized {
            return summary.clone();
        }

        let mut counts = OutcomeCounts::default();
        for result in &self.results {
            counts.add(result.outcome);
        }

        let summary = RunSummary {
            run_id: self.run_id,
            phase: self.phase,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self
                .first_record
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            counts,
            results: std::mem::take(&mut self.results),
            warnings: std::mem::take(&mut self.warnings),
        };
        self.finalized = Some(summary.clone());
        summary
    }
}

/// Reporting collaborator; called at most once per run, after finalize
#[async_trait]
pub trait SummaryPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, summary: &RunSummary) -> Result<()>;
}

/// Writes the summary to the structured log
pub struct LogPublisher;

#[async_trait]
impl SummaryPublisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, summary: &RunSummary) -> Result<()> {
        for result in summary.results.iter().filter(|r| r.outcome == Outcome::Fail) {
            warn!(
                pattern = %result.key,
                test = %result.name,
                message = %result.message,
                "Verification failed"
            );
        }
        for warning in &summary.warnings {
            warn!(account_id = %warning.account_id, stage = %warning.stage, message = %warning.message, "Discovery warning");
        }
        info!(
            run_id = %summary.run_id,
            phase = %summary.phase,
            total = summary.counts.total,
            passed = summary.counts.passed,
            failed = summary.counts.failed,
            warnings = summary.counts.warnings,
            skipped = summary.counts.skipped,
            duration_ms = summary.duration_ms,
            "Run complete"
        );
        Ok(())
    }
}

/// Writes `<dir>/<phase>/<started_at>.json`
pub struct JsonFilePublisher {
    dir: PathBuf,
}

impl JsonFilePublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn summary_path(&self, summary: &RunSummary) -> PathBuf {
        self.dir
            .join(summary.phase.slug())
            .join(format!("{}.json", summary.started_at.format("%Y%m%dT%H%M%S%.3fZ")))
    }
}

#[async_trait]
impl SummaryPublisher for JsonFilePublisher {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn publish(&self, summary: &RunSummary) -> Result<()> {
        let path = self.summary_path(summary);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Run summary written");
        Ok(())
    }
}
