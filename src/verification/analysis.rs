//! Path-analysis lifecycle: reuse-or-create the path, start, poll, delete.
//!
//! Paths are long-lived and shared across runs; analyses are ephemeral and
//! always deleted. An [`AnalysisGuard`] owns each started analysis so the
//! delete runs on success, error, timeout and when the owning future is
//! dropped by cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aws::{AnalysisStatus, ApiResult, InsightsAnalysis, NetworkApi, PathSpec};
use crate::config::{AnalysisConfig, RetryPolicy};
use crate::discovery::with_backoff;
use crate::error::ApiError;

/// Why a check produced no verdict
#[derive(Debug, Error)]
pub enum CheckFailure {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Authorization refused by a specific account
    #[error("{error} (account {account_id})")]
    Denied { account_id: String, error: ApiError },

    /// Analysis, or the whole verification, did not finish before its deadline
    #[error("{} timed out after {}ms", timed_out(.analysis_id), .after.as_millis())]
    Timeout {
        /// None when the deadline hit before an analysis was started
        analysis_id: Option<String>,
        after: Duration,
    },

    /// The analyser itself reported failure
    #[error("analysis {analysis_id} failed: {message}")]
    AnalysisFailed { analysis_id: String, message: String },
}

fn timed_out(analysis_id: &Option<String>) -> String {
    match analysis_id {
        Some(id) => format!("analysis {}", id),
        None => "verification".to_string(),
    }
}

impl CheckFailure {
    /// Error class recorded in result metadata
    pub fn class(&self) -> &str {
        match self {
            CheckFailure::Api(e) | CheckFailure::Denied { error: e, .. } => e.class(),
            CheckFailure::Timeout { .. } => "TimeoutExceeded",
            CheckFailure::AnalysisFailed { .. } => "VerificationFailure",
        }
    }

    /// Attribute an authorization failure to `account_id`
    pub fn in_account(self, account_id: &str) -> Self {
        match self {
            CheckFailure::Api(error) if error.is_authorization() => CheckFailure::Denied {
                account_id: account_id.to_string(),
                error,
            },
            other => other,
        }
    }
}

/// Tags a failed call with the account it was made in
pub trait InAccount<T> {
    fn in_account(self, account_id: &str) -> Result<T, CheckFailure>;
}

impl<T, E: Into<CheckFailure>> InAccount<T> for Result<T, E> {
    fn in_account(self, account_id: &str) -> Result<T, CheckFailure> {
        self.map_err(|e| CheckFailure::in_account(e.into(), account_id))
    }
}

/// Verdict of a completed analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathVerdict {
    pub path_id: String,
    pub analysis_id: String,
    /// An existing path was reused instead of created
    pub reused_path: bool,
    pub reachable: bool,
    pub blocking: Vec<String>,
}

type PathSlot = Arc<tokio::sync::Mutex<Option<String>>>;

/// Per-tuple registry of insights paths.
///
/// The lookup-then-create for one `(account, tuple)` runs under that tuple's
/// own lock, so concurrent checks of the same tuple end up with one path.
#[derive(Default)]
pub struct PathRegistry {
    slots: Mutex<HashMap<(String, PathSpec), PathSlot>>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, account_id: &str, spec: &PathSpec) -> PathSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry((account_id.to_string(), spec.clone()))
                .or_default(),
        )
    }

    /// Path id for `spec` in `account_id`, reusing an existing path when one
    /// matches. Returns whether it was reused.
    pub async fn resolve(
        &self,
        account_id: &str,
        api: &dyn NetworkApi,
        spec: &PathSpec,
        retry: &RetryPolicy,
    ) -> ApiResult<(String, bool)> {
        let slot = self.slot(account_id, spec);
        let mut cached = slot.lock().await;
        if let Some(path_id) = cached.as_ref() {
            return Ok((path_id.clone(), true));
        }

        if let Some(path_id) = find_path(api, spec, retry).await? {
            debug!(account_id = %account_id, path_id = %path_id, spec = %spec, "Reusing insights path");
            *cached = Some(path_id.clone());
            return Ok((path_id, true));
        }

        let path_id = match with_backoff(retry, "create_insights_path", || api.create_insights_path(spec)).await {
            Ok(path) => {
                info!(account_id = %account_id, path_id = %path.path_id, spec = %spec, "Insights path created");
                path.path_id
            }
            Err(ApiError::Conflict(message)) => {
                // Created elsewhere between our lookup and create
                find_path(api, spec, retry)
                    .await?
                    .ok_or(ApiError::Conflict(message))?
            }
            Err(e) => return Err(e),
        };

        *cached = Some(path_id.clone());
        Ok((path_id, false))
    }
}

async fn find_path(api: &dyn NetworkApi, spec: &PathSpec, retry: &RetryPolicy) -> ApiResult<Option<String>> {
    let paths = with_backoff(retry, "describe_insights_paths", || api.describe_insights_paths()).await?;
    Ok(paths
        .into_iter()
        .find(|p| p.spec.matches(spec))
        .map(|p| p.path_id))
}

/// Analyses started and not yet deleted, across all accounts
#[derive(Default)]
pub struct InFlight {
    analyses: Mutex<HashMap<String, Arc<dyn NetworkApi>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, analysis_id: &str, api: Arc<dyn NetworkApi>) {
        self.lock().insert(analysis_id.to_string(), api);
    }

    fn release(&self, analysis_id: &str) {
        self.lock().remove(analysis_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn NetworkApi>>> {
        self.analyses.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every analysis still registered. Returns how many deletes
    /// succeeded.
    pub async fn drain(&self) -> usize {
        let pending: Vec<(String, Arc<dyn NetworkApi>)> = self.lock().drain().collect();
        let mut deleted = 0;
        for (analysis_id, api) in pending {
            match api.delete_analysis(&analysis_id).await {
                Ok(()) | Err(ApiError::NotFound(_)) => deleted += 1,
                Err(e) => warn!(analysis_id = %analysis_id, error = %e, "Failed to clean up analysis"),
            }
        }
        if deleted > 0 {
            info!(deleted = deleted, "In-flight analyses cleaned up");
        }
        deleted
    }
}

/// Owns one started analysis until it is deleted
pub struct AnalysisGuard {
    api: Arc<dyn NetworkApi>,
    analysis_id: String,
    in_flight: Arc<InFlight>,
    released: bool,
}

impl AnalysisGuard {
    pub fn new(api: Arc<dyn NetworkApi>, analysis_id: &str, in_flight: Arc<InFlight>) -> Self {
        in_flight.register(analysis_id, Arc::clone(&api));
        Self {
            api,
            analysis_id: analysis_id.to_string(),
            in_flight,
            released: false,
        }
    }

    pub fn analysis_id(&self) -> &str {
        &self.analysis_id
    }

    /// Delete the analysis now
    pub async fn finish(mut self) {
        self.released = true;
        match self.api.delete_analysis(&self.analysis_id).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {
                debug!(analysis_id = %self.analysis_id, "Analysis deleted");
            }
            Err(e) => {
                warn!(analysis_id = %self.analysis_id, error = %e, "Failed to delete analysis");
            }
        }
        self.in_flight.release(&self.analysis_id);
    }
}

impl Drop for AnalysisGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped mid-poll; the registry entry stays until the delete lands
        // so a draining shutdown still sees it.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let in_flight = Arc::clone(&self.in_flight);
        let analysis_id = std::mem::take(&mut self.analysis_id);
        runtime.spawn(async move {
            match api.delete_analysis(&analysis_id).await {
                Ok(()) | Err(ApiError::NotFound(_)) => in_flight.release(&analysis_id),
                Err(e) => warn!(analysis_id = %analysis_id, error = %e, "Deferred analysis delete failed"),
            }
        });
    }
}

/// Start an analysis on `path_id`, poll it to a verdict within the deadline,
/// and delete it whatever happens.
pub async fn run_analysis(
    api: Arc<dyn NetworkApi>,
    path_id: &str,
    config: &AnalysisConfig,
    retry: &RetryPolicy,
    in_flight: &Arc<InFlight>,
) -> Result<InsightsAnalysis, CheckFailure> {
    let analysis_id = with_backoff(retry, "start_analysis", || api.start_analysis(path_id)).await?;
    let guard = AnalysisGuard::new(Arc::clone(&api), &analysis_id, Arc::clone(in_flight));

    let polled = tokio::time::timeout(
        config.timeout(),
        poll_until_terminal(api.as_ref(), &analysis_id, config.poll_interval(), retry),
    )
    .await;
    guard.finish().await;

    match polled {
        Ok(result) => result,
        Err(_) => {
            warn!(analysis_id = %analysis_id, timeout_ms = config.timeout_ms, "Analysis timed out");
            Err(CheckFailure::Timeout {
                analysis_id: Some(analysis_id),
                after: config.timeout(),
            })
        }
    }
}

async fn poll_until_terminal(
    api: &dyn NetworkApi,
    analysis_id: &str,
    interval: Duration,
    retry: &RetryPolicy,
) -> Result<InsightsAnalysis, CheckFailure> {
    loop {
        let analysis = with_backoff(retry, "describe_analysis", || api.describe_analysis(analysis_id)).await?;
        match analysis.status {
            AnalysisStatus::Succeeded => return Ok(analysis),
            AnalysisStatus::Failed => {
                return Err(CheckFailure::AnalysisFailed {
                    analysis_id: analysis_id.to_string(),
                    message: analysis
                        .status_message
                        .unwrap_or_else(|| "no status message".to_string()),
                })
            }
            AnalysisStatus::Running => tokio::time::sleep(interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::fixture::{AccountTopology, RecordedNetwork};

    fn spec(port: u16) -> PathSpec {
        PathSpec {
            source: "arn:eni-a".to_string(),
            destination: "arn:eni-b".to_string(),
            protocol: "tcp".to_string(),
            port: Some(port),
        }
    }

    fn fast() -> (AnalysisConfig, RetryPolicy) {
        (
            AnalysisConfig {
                poll_interval_ms: 1,
                timeout_ms: 200,
            },
            RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_path_is_created_once_then_reused() {
        let network = RecordedNetwork::new("1", AccountTopology::default());
        let registry = PathRegistry::new();
        let (_, retry) = fast();

        let (first, reused_first) = registry.resolve("1", &network, &spec(443), &retry).await.unwrap();
        let (second, reused_second) = registry.resolve("1", &network, &spec(443), &retry).await.unwrap();

        assert_eq!(first, second);
        assert!(!reused_first);
        assert!(reused_second);
        assert_eq!(network.paths_created(), 1);
    }

    #[tokio::test]
    async fn test_path_left_by_earlier_run_is_reused() {
        let network = RecordedNetwork::new("1", AccountTopology::default());
        let (_, retry) = fast();
        let existing = PathRegistry::new().resolve("1", &network, &spec(22), &retry).await.unwrap().0;

        let (path_id, reused) = PathRegistry::new().resolve("1", &network, &spec(22), &retry).await.unwrap();
        assert_eq!(path_id, existing);
        assert!(reused);
        assert_eq!(network.paths_created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_creates_one_path() {
        let network = Arc::new(RecordedNetwork::new("1", AccountTopology::default()));
        let registry = Arc::new(PathRegistry::new());
        let (_, retry) = fast();

        let calls = (0..6).map(|_| {
            let network = Arc::clone(&network);
            let registry = Arc::clone(&registry);
            let retry = retry.clone();
            async move { registry.resolve("1", &*network, &spec(5432), &retry).await }
        });
        let ids: Vec<String> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().0)
            .collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(network.paths_created(), 1);
    }

    #[tokio::test]
    async fn test_analysis_is_deleted_after_verdict() {
        let recorded = Arc::new(RecordedNetwork::new(
            "1",
            AccountTopology {
                analysis_polls: 2,
                ..Default::default()
            },
        ));
        let api: Arc<dyn NetworkApi> = recorded.clone();
        let (config, retry) = fast();
        let in_flight = Arc::new(InFlight::new());

        let path = recorded.create_insights_path(&spec(443)).await.unwrap();
        let analysis = run_analysis(api, &path.path_id, &config, &retry, &in_flight).await.unwrap();

        assert_eq!(analysis.path_found, Some(true));
        assert_eq!(recorded.live_analyses(), 0);
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_still_deletes_analysis() {
        let recorded = Arc::new(RecordedNetwork::new("1", AccountTopology::default().never_completing()));
        let api: Arc<dyn NetworkApi> = recorded.clone();
        let (mut config, retry) = fast();
        config.timeout_ms = 30;
        let in_flight = Arc::new(InFlight::new());

        let path = recorded.create_insights_path(&spec(443)).await.unwrap();
        let err = run_analysis(api, &path.path_id, &config, &retry, &in_flight)
            .await
            .unwrap_err();

        assert!(matches!(err, CheckFailure::Timeout { analysis_id: Some(_), .. }));
        assert_eq!(err.class(), "TimeoutExceeded");
        assert!(err.to_string().ends_with("timed out after 30ms"), "{}", err);
        assert_eq!(recorded.analyses_deleted(), 1);
        assert_eq!(recorded.live_analyses(), 0);
    }

    #[tokio::test]
    async fn test_drain_deletes_abandoned_analyses() {
        let recorded = Arc::new(RecordedNetwork::new("1", AccountTopology::default()));
        let api: Arc<dyn NetworkApi> = recorded.clone();
        let in_flight = Arc::new(InFlight::new());

        let path = recorded.create_insights_path(&spec(443)).await.unwrap();
        let analysis_id = recorded.start_analysis(&path.path_id).await.unwrap();
        let guard = AnalysisGuard::new(api, &analysis_id, Arc::clone(&in_flight));
        assert_eq!(guard.analysis_id(), analysis_id);
        assert_eq!(in_flight.len(), 1);

        // Simulates a cancelled check: the guard is forgotten without finishing
        std::mem::forget(guard);
        assert_eq!(in_flight.drain().await, 1);
        assert_eq!(recorded.live_analyses(), 0);
    }

    #[test]
    fn test_only_authorization_failures_are_attributed() {
        let denied = CheckFailure::from(ApiError::AccessDenied("no".into())).in_account("2");
        match &denied {
            CheckFailure::Denied { account_id, .. } => assert_eq!(account_id, "2"),
            other => panic!("unexpected failure {other:?}"),
        }
        assert_eq!(denied.class(), "AccessDenied");

        let throttled: Result<(), ApiError> = Err(ApiError::Throttled("slow".into()));
        assert!(matches!(throttled.in_account("2"), Err(CheckFailure::Api(ApiError::Throttled(_)))));
    }
}
