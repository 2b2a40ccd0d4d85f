//! Verification Dispatcher
//!
//! One strategy per connection kind, selected in [`Dispatcher::verify`].
//! Path-analysis kinds run in the account that owns the check source; status
//! kinds read live state from the account that discovered them.

use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::analysis::{run_analysis, CheckFailure, InAccount, InFlight, PathRegistry, PathVerdict};
use super::plan::{plan_checks, Check, CheckDirection, CheckTarget, VerifyFilter};
use crate::aws::{resource_arn, NetworkInterface, PathSpec};
use crate::config::EngineConfig;
use crate::discovery::with_backoff;
use crate::error::{ApiError, EngineError};
use crate::session::{ClientHandle, SessionProvider};
use crate::types::{
    Account, ConnectionKind, ConnectivityPattern, Endpoint, Outcome, PatternKey, VerificationResult,
};

const ATTACHMENT_RESOURCE: &str = "transit-gateway-attachment";
const INTERFACE_RESOURCE: &str = "network-interface";
const DEFAULT_REGION: &str = "us-east-1";

/// Result of one strategy before timing is attached.
///
/// `Err` carries a per-check failure that becomes a FAIL result; fatal
/// authorization errors are lifted out before that happens.
type CheckResult = Result<VerificationResult, CheckFailure>;

/// Prefer in-use Lambda interfaces, then any in-use interface
pub fn select_check_interface(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
    let in_use = || interfaces.iter().filter(|eni| eni.status == "in-use");
    in_use()
        .find(|eni| eni.description.to_ascii_lowercase().contains("lambda"))
        .or_else(|| in_use().next())
}

/// The pair of VPC endpoints a path check runs between
struct VpcPair<'a> {
    from_account: &'a str,
    from_vpc: &'a str,
    to_account: &'a str,
    to_vpc: &'a str,
}

impl<'a> VpcPair<'a> {
    fn of(pattern: &'a ConnectivityPattern, direction: CheckDirection) -> Option<Self> {
        let (from, to) = match direction {
            CheckDirection::Forward => (&pattern.source, &pattern.destination),
            CheckDirection::Reverse => (&pattern.destination, &pattern.source),
        };
        match (from, to) {
            (
                Endpoint::Vpc {
                    account_id: from_account,
                    vpc_id: from_vpc,
                },
                Endpoint::Vpc {
                    account_id: to_account,
                    vpc_id: to_vpc,
                },
            ) => Some(Self {
                from_account,
                from_vpc,
                to_account,
                to_vpc,
            }),
            _ => None,
        }
    }
}

pub struct Dispatcher {
    sessions: Arc<dyn SessionProvider>,
    config: EngineConfig,
    regions: BTreeMap<String, String>,
    paths: PathRegistry,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(sessions: Arc<dyn SessionProvider>, config: EngineConfig, accounts: &[Account]) -> Self {
        Self {
            sessions,
            config,
            regions: accounts
                .iter()
                .map(|a| (a.account_id.clone(), a.region.clone()))
                .collect(),
            paths: PathRegistry::new(),
            in_flight: Arc::new(InFlight::new()),
        }
    }

    /// Analyses currently running, for cleanup on cancellation
    pub fn in_flight(&self) -> Arc<InFlight> {
        Arc::clone(&self.in_flight)
    }

    fn region(&self, account_id: &str) -> &str {
        self.regions
            .get(account_id)
            .map(String::as_str)
            .unwrap_or(DEFAULT_REGION)
    }

    /// Verify every admitted pattern, `verify_concurrency` checks at a time.
    ///
    /// Results keep pattern then check order. Stops at the first
    /// authorization failure; every other failure is a FAIL result.
    pub async fn verify_all(
        &self,
        patterns: &[ConnectivityPattern],
        filter: &VerifyFilter,
    ) -> Result<Vec<VerificationResult>, EngineError> {
        let mut results = Vec::new();
        self.verify_each(patterns, filter, |result| {
            results.push(result);
            Ok(())
        })
        .await?;
        Ok(results)
    }

    /// Like [`verify_all`](Self::verify_all), handing each result to
    /// `on_result` as soon as it is ready. Returns how many were handed over.
    pub async fn verify_each<F>(
        &self,
        patterns: &[ConnectivityPattern],
        filter: &VerifyFilter,
        mut on_result: F,
    ) -> Result<usize, EngineError>
    where
        F: FnMut(VerificationResult) -> Result<(), EngineError>,
    {
        let mut planned: Vec<(&ConnectivityPattern, Option<Check>)> = Vec::new();
        for pattern in patterns.iter().filter(|p| filter.admits(p)) {
            if pattern.expected_reachable {
                planned.extend(plan_checks(pattern, &filter.extra_ports).into_iter().map(|check| (pattern, Some(check))));
            } else {
                planned.push((pattern, None));
            }
        }

        info!(
            patterns = patterns.len(),
            checks = planned.len(),
            concurrency = self.config.verify_concurrency.max(1),
            "Starting verification"
        );

        let mut results = std::pin::pin!(futures::stream::iter(planned)
            .map(|(pattern, check)| async move {
                match check {
                    Some(check) => self.verify(pattern, &check).await,
                    None => Ok(not_expected(pattern)),
                }
            })
            .buffered(self.config.verify_concurrency.max(1)));

        let mut handed = 0;
        while let Some(result) = results.next().await {
            on_result(result?)?;
            handed += 1;
        }
        Ok(handed)
    }

    /// Run one check of one pattern within the check deadline
    pub async fn verify(
        &self,
        pattern: &ConnectivityPattern,
        check: &Check,
    ) -> Result<VerificationResult, EngineError> {
        let started = Instant::now();
        let deadline = self.config.deadlines.check();
        let strategy = async {
            match (&check.target, pattern.kind) {
                (CheckTarget::Path { direction, protocol, port }, ConnectionKind::HubRouted) => {
                    self.verify_hub_routed(pattern, check, *direction, protocol, *port).await
                }
                (CheckTarget::Path { direction, protocol, port }, ConnectionKind::Peered) => {
                    self.verify_peered(pattern, check, *direction, protocol, *port).await
                }
                (CheckTarget::TunnelStatus, _) => self.verify_tunnel(pattern, check).await,
                (CheckTarget::EndpointStatus, _) => self.verify_endpoint(pattern, check).await,
                (CheckTarget::Path { .. }, kind) => Ok(VerificationResult::new(
                    &pattern.key,
                    &check.name,
                    Outcome::Skip,
                    format!("{} connections are not verified by path analysis", kind),
                )),
            }
        };
        let result = match tokio::time::timeout(deadline, strategy).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    pattern = %pattern.key,
                    test = %check.name,
                    deadline_ms = self.config.deadlines.check_ms,
                    "Verification deadline exceeded"
                );
                Err(CheckFailure::Timeout {
                    analysis_id: None,
                    after: deadline,
                })
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(CheckFailure::Denied { account_id, error }) => {
                warn!(account_id = %account_id, error = %error, "Authorization failed during verification");
                return Err(EngineError::authorization(&account_id, &error));
            }
            Err(CheckFailure::Api(e)) if e.is_authorization() => {
                let account_id = pattern.source.account_id().unwrap_or("unknown");
                warn!(account_id = %account_id, error = %e, "Authorization failed during verification");
                return Err(EngineError::authorization(account_id, &e));
            }
            Err(failure) => failed(&pattern.key, &check.name, &failure),
        };

        let result = result.with_duration(started.elapsed());
        debug!(
            pattern = %pattern.key,
            test = %result.name,
            outcome = %result.outcome,
            duration_ms = result.duration_ms,
            "Check complete"
        );
        Ok(result)
    }

    async fn session(&self, account_id: &str) -> Result<ClientHandle, CheckFailure> {
        self.sessions.get_session(account_id).await.in_account(account_id)
    }

    /// Account owning `router_id`, as seen from an account attached to it
    async fn router_owner(&self, router_id: &str, attached: &str, fallback: &str) -> Result<String, CheckFailure> {
        let session = self.session(attached).await?;
        let api = session.api();
        let attachments = with_backoff(&self.config.retry, "describe_hub_attachments", || {
            api.describe_hub_attachments()
        })
        .await
        .in_account(attached)?;
        Ok(attachments
            .iter()
            .find(|a| a.router_id == router_id)
            .map(|a| a.owner().to_string())
            .unwrap_or_else(|| fallback.to_string()))
    }

    async fn verify_hub_routed(
        &self,
        pattern: &ConnectivityPattern,
        check: &Check,
        direction: CheckDirection,
        protocol: &str,
        port: Option<u16>,
    ) -> CheckResult {
        let Some(pair) = VpcPair::of(pattern, direction) else {
            return Ok(skip(pattern, check, "hub-routed pattern has no VPC endpoints"));
        };
        let router_id = pattern.connection_id.as_str();
        // The router owner sees every attachment and runs the analysis
        let hub_account = self.router_owner(router_id, pair.from_account, pair.to_account).await?;

        let session = self.session(&hub_account).await?;
        let api = session.api();
        let attachments = with_backoff(&self.config.retry, "describe_hub_attachments", || {
            api.describe_hub_attachments()
        })
        .await
        .in_account(&hub_account)?;

        let find = |vpc_id: &str| {
            attachments
                .iter()
                .find(|a| a.vpc_id == vpc_id && a.router_id == router_id && a.is_available())
        };
        let (Some(from), Some(to)) = (find(pair.from_vpc), find(pair.to_vpc)) else {
            let missing = if find(pair.from_vpc).is_none() { pair.from_vpc } else { pair.to_vpc };
            return Ok(skip(
                pattern,
                check,
                &format!("no available attachment on {} for {}", router_id, missing),
            ));
        };

        let region = self.region(&hub_account);
        let spec = PathSpec {
            source: resource_arn(region, from.owner(), ATTACHMENT_RESOURCE, &from.attachment_id),
            destination: resource_arn(region, to.owner(), ATTACHMENT_RESOURCE, &to.attachment_id),
            protocol: protocol.to_string(),
            port,
        };

        let verdict = self.analyse(&session, &spec).await?;
        Ok(path_result(pattern, check, &spec, verdict))
    }

    async fn verify_peered(
        &self,
        pattern: &ConnectivityPattern,
        check: &Check,
        direction: CheckDirection,
        protocol: &str,
        port: Option<u16>,
    ) -> CheckResult {
        let Some(pair) = VpcPair::of(pattern, direction) else {
            return Ok(skip(pattern, check, "peered pattern has no VPC endpoints"));
        };

        let session = self.session(pair.from_account).await?;
        let api = session.api();
        let peerings = with_backoff(&self.config.retry, "describe_peering_connections", || {
            api.describe_peering_connections()
        })
        .await
        .in_account(pair.from_account)?;
        let Some(peering) = peerings.iter().find(|p| p.peering_id == pattern.connection_id) else {
            return Ok(skip(
                pattern,
                check,
                &format!("peering connection {} not found", pattern.connection_id),
            ));
        };
        if peering.status != "active" {
            return Ok(VerificationResult::new(
                &pattern.key,
                &check.name,
                Outcome::Fail,
                format!("peering status: {} (expected: active)", peering.status),
            )
            .with_meta("peering_status", peering.status.as_str()));
        }

        let from_interfaces = with_backoff(&self.config.retry, "describe_network_interfaces", || {
            api.describe_network_interfaces(Some(pair.from_vpc))
        })
        .await
        .in_account(pair.from_account)?;
        let peer_session = self.session(pair.to_account).await?;
        let peer_api = peer_session.api();
        let to_interfaces = with_backoff(&self.config.retry, "describe_network_interfaces", || {
            peer_api.describe_network_interfaces(Some(pair.to_vpc))
        })
        .await
        .in_account(pair.to_account)?;

        let (Some(from), Some(to)) = (
            select_check_interface(&from_interfaces),
            select_check_interface(&to_interfaces),
        ) else {
            return Ok(VerificationResult::new(
                &pattern.key,
                &check.name,
                Outcome::Warn,
                "peering is active but no in-use network interface is available to analyse the path",
            )
            .with_meta("peering_status", "active")
            .with_meta("test_skipped", true));
        };

        let spec = PathSpec {
            source: resource_arn(self.region(pair.from_account), &from.owner_id, INTERFACE_RESOURCE, &from.interface_id),
            destination: resource_arn(self.region(pair.to_account), &to.owner_id, INTERFACE_RESOURCE, &to.interface_id),
            protocol: protocol.to_string(),
            port,
        };

        let verdict = self.analyse(&session, &spec).await?;
        Ok(path_result(pattern, check, &spec, verdict).with_meta("peering_status", "active"))
    }

    async fn verify_tunnel(&self, pattern: &ConnectivityPattern, check: &Check) -> CheckResult {
        let account_id = pattern.source.account_id().unwrap_or_default();
        let session = self.session(account_id).await?;
        let api = session.api();
        let connections = with_backoff(&self.config.retry, "describe_vpn_connections", || {
            api.describe_vpn_connections()
        })
        .await
        .in_account(account_id)?;

        let Some(vpn) = connections.iter().find(|c| c.vpn_id == pattern.connection_id) else {
            return Ok(skip(
                pattern,
                check,
                &format!("tunnel connection {} not found", pattern.connection_id),
            ));
        };

        let total = vpn.tunnels.len();
        let up = vpn
            .tunnels
            .iter()
            .filter(|t| t.status.eq_ignore_ascii_case("up"))
            .count();

        let (outcome, message) = if vpn.state != "available" {
            (Outcome::Fail, format!("connection state is {}", vpn.state))
        } else if total > 0 && up == total {
            (Outcome::Pass, format!("{}/{} tunnels UP", up, total))
        } else if up > 0 {
            (Outcome::Warn, format!("degraded: {}/{} tunnels UP", up, total))
        } else {
            (Outcome::Fail, format!("all {} tunnels DOWN", total))
        };

        Ok(VerificationResult::new(&pattern.key, &check.name, outcome, message)
            .with_meta("state", vpn.state.as_str())
            .with_meta("tunnels_up", up)
            .with_meta("total_tunnels", total))
    }

    async fn verify_endpoint(&self, pattern: &ConnectivityPattern, check: &Check) -> CheckResult {
        let account_id = pattern.source.account_id().unwrap_or_default();
        let session = self.session(account_id).await?;
        let api = session.api();
        let endpoints = with_backoff(&self.config.retry, "describe_vpc_endpoints", || {
            api.describe_vpc_endpoints()
        })
        .await
        .in_account(account_id)?;

        let Some(endpoint) = endpoints.iter().find(|e| e.endpoint_id == pattern.connection_id) else {
            return Ok(skip(
                pattern,
                check,
                &format!("endpoint {} not found", pattern.connection_id),
            ));
        };

        let base = |outcome: Outcome, message: String| {
            VerificationResult::new(&pattern.key, &check.name, outcome, message)
                .with_meta("state", endpoint.state.as_str())
                .with_meta("endpoint_enis", endpoint.interface_ids.len())
        };

        if endpoint.state != "available" {
            return Ok(base(Outcome::Fail, format!("endpoint state is {}", endpoint.state)));
        }
        if endpoint.interface_ids.is_empty() {
            return Ok(base(Outcome::Fail, "endpoint has no network interfaces".to_string()));
        }

        let interfaces = with_backoff(&self.config.retry, "describe_network_interfaces", || {
            api.describe_network_interfaces(Some(endpoint.vpc_id.as_str()))
        })
        .await
        .in_account(account_id)?;
        let unhealthy: Vec<&str> = endpoint
            .interface_ids
            .iter()
            .filter(|id| {
                !interfaces
                    .iter()
                    .any(|eni| &eni.interface_id == *id && eni.status == "in-use")
            })
            .map(String::as_str)
            .collect();

        if unhealthy.is_empty() {
            Ok(base(
                Outcome::Pass,
                format!("endpoint available, {} interfaces healthy", endpoint.interface_ids.len()),
            ))
        } else {
            Ok(base(Outcome::Fail, format!("unhealthy interfaces: {}", unhealthy.join(", ")))
                .with_meta("unhealthy_enis", unhealthy))
        }
    }

    /// Reuse-or-create the path in the session's account, then run one analysis
    async fn analyse(&self, session: &ClientHandle, spec: &PathSpec) -> Result<PathVerdict, CheckFailure> {
        let retry = &self.config.retry;
        let account_id = session.account_id();
        let (path_id, reused_path) = self
            .paths
            .resolve(account_id, session.api(), spec, retry)
            .await
            .in_account(account_id)?;

        let analysis = run_analysis(
            session.shared_api(),
            &path_id,
            &self.config.analysis,
            retry,
            &self.in_flight,
        )
        .await
        .in_account(account_id)?;

        Ok(PathVerdict {
            path_id,
            analysis_id: analysis.analysis_id,
            reused_path,
            reachable: analysis.path_found.unwrap_or(false),
            blocking: analysis.blocking_components,
        })
    }
}

fn path_result(
    pattern: &ConnectivityPattern,
    check: &Check,
    spec: &PathSpec,
    verdict: PathVerdict,
) -> VerificationResult {
    let (outcome, message) = if verdict.reachable {
        (Outcome::Pass, format!("path found: {}", spec))
    } else if verdict.blocking.is_empty() {
        (Outcome::Fail, format!("no path: {}", spec))
    } else {
        (
            Outcome::Fail,
            format!("no path: {} (blocked by {})", spec, verdict.blocking.join(", ")),
        )
    };

    VerificationResult::new(&pattern.key, &check.name, outcome, message)
        .with_meta("path_id", verdict.path_id)
        .with_meta("analysis_id", verdict.analysis_id)
        .with_meta("reused_path", verdict.reused_path)
        .with_meta("reachable", verdict.reachable)
        .with_meta("blocking", verdict.blocking)
}

fn skip(pattern: &ConnectivityPattern, check: &Check, message: &str) -> VerificationResult {
    VerificationResult::new(&pattern.key, &check.name, Outcome::Skip, message)
}

fn not_expected(pattern: &ConnectivityPattern) -> VerificationResult {
    VerificationResult::new(
        &pattern.key,
        &format!("{}-expected", pattern.kind.code()),
        Outcome::Skip,
        format!("{} is not expected to be reachable", pattern.label()),
    )
    .with_meta("directionality", serde_json::to_value(pattern.directionality).unwrap_or_default())
}

fn failed(key: &PatternKey, name: &str, failure: &CheckFailure) -> VerificationResult {
    let mut result = VerificationResult::new(key, name, Outcome::Fail, failure.to_string())
        .with_meta("error_class", failure.class());
    match failure {
        CheckFailure::Timeout { analysis_id, after } => {
            result = result
                .with_meta("timeout", true)
                .with_meta("timeout_ms", after.as_millis() as u64);
            if let Some(analysis_id) = analysis_id {
                result = result.with_meta("analysis_id", analysis_id.as_str());
            }
        }
        CheckFailure::AnalysisFailed { analysis_id, .. } => {
            result = result.with_meta("analysis_id", analysis_id.as_str());
        }
        CheckFailure::Api(ApiError::Throttled(_)) => {
            result = result.with_meta("retries_exhausted", true);
        }
        CheckFailure::Api(_) | CheckFailure::Denied { .. } => {}
    }
    result
}
