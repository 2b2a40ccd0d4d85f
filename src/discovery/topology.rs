//! Per-account topology discovery

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::flow_logs::{collect_traffic, VpcAddressSpace};
use super::hub::{resolve_hub, HubTopology, SpokeVpc};
use super::retry::with_backoff;
use super::security_groups::{allowed_ports, AdmittedPorts};
use crate::aws::{cidr_covers, ApiResult, HubAttachment, VpcInfo};
use crate::config::EngineConfig;
use crate::error::{ApiError, EngineError, PartialDiscoveryWarning};
use crate::session::{ClientHandle, SessionProvider};
use crate::types::{
    Account, ConnectionDetail, ConnectionKind, ConnectivityObservation, Directionality, Endpoint,
    InterfaceHealth, TrafficSample, TunnelHealth,
};

/// Peering states worth recording
const DISCOVERED_PEERING_STATES: [&str; 2] = ["active", "pending-acceptance"];

/// Structural facts about an account's VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcFacts {
    pub account_id: String,
    pub vpc_id: String,
    pub cidr_blocks: Vec<String>,
    pub dns_support: bool,
    pub dns_hostnames: bool,
    pub subnet_count: u32,
    /// Hub router this VPC is attached to
    pub hub_router_id: Option<String>,
}

/// Everything discovery learned across the account set
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutput {
    pub observations: Vec<ConnectivityObservation>,
    pub vpcs: Vec<VpcFacts>,
    pub hub_router_id: Option<String>,
    pub warnings: Vec<PartialDiscoveryWarning>,
}

/// An account that authenticated and has a usable VPC
pub struct AccountSurvey {
    pub account: Account,
    pub session: ClientHandle,
    pub vpc: VpcInfo,
    pub attachments: Vec<HubAttachment>,
    warnings: Vec<PartialDiscoveryWarning>,
}

/// Observations from one account
#[derive(Debug, Clone, Default)]
pub struct AccountDiscovery {
    pub observations: Vec<ConnectivityObservation>,
    pub warnings: Vec<PartialDiscoveryWarning>,
}

/// Use-case tag of a resource: `UseCase`, falling back to `Purpose`
pub fn use_case_tag(tags: &BTreeMap<String, String>) -> Option<String> {
    ["UseCase", "Purpose"]
        .iter()
        .filter_map(|key| tags.get(*key))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Configured VPC, or the first non-default one
fn select_vpc(account: &Account, vpcs: &[VpcInfo]) -> Option<VpcInfo> {
    match &account.vpc_id {
        Some(vpc_id) => vpcs.iter().find(|v| &v.vpc_id == vpc_id).cloned(),
        None => vpcs.iter().find(|v| !v.is_default).cloned(),
    }
}

pub struct TopologyDiscoverer {
    sessions: Arc<dyn SessionProvider>,
    config: EngineConfig,
}

impl TopologyDiscoverer {
    pub fn new(sessions: Arc<dyn SessionProvider>, config: EngineConfig) -> Self {
        Self { sessions, config }
    }

    /// Discover every account, resolve the hub, then enrich with flow logs
    /// and security-group ports.
    ///
    /// Per-account failures become warnings. Only an ambiguous hub aborts.
    pub async fn discover_all(
        &self,
        accounts: &[Account],
        kinds: &[ConnectionKind],
    ) -> Result<DiscoveryOutput, EngineError> {
        info!(accounts = accounts.len(), kinds = ?kinds, "Starting topology discovery");

        let mut warnings = Vec::new();
        let mut surveyed = Vec::new();
        let surveys = accounts.iter().map(|a| {
            self.within_deadline(a.account_id.as_str(), "survey", self.survey(a))
        });
        for result in join_all(surveys).await {
            match result {
                Ok(mut survey) => {
                    warnings.append(&mut survey.warnings);
                    surveyed.push(survey);
                }
                Err(warning) => {
                    warn!(account_id = %warning.account_id, error = %warning.message, "Account discovery failed");
                    warnings.push(warning);
                }
            }
        }

        let hub = if kinds.contains(&ConnectionKind::HubRouted) {
            self.load_hub(accounts, &surveyed, &mut warnings).await?
        } else {
            None
        };

        let mut observations = Vec::new();
        let per_account = join_all(surveyed.iter().map(|s| self.discover(s, kinds, hub.as_ref()))).await;
        for discovery in per_account {
            observations.extend(discovery.observations);
            warnings.extend(discovery.warnings);
        }

        if self.config.flow_logs.enabled {
            self.enrich(&surveyed, &mut observations, &mut warnings).await;
        }
        self.narrow_ports(&surveyed, &mut observations, &mut warnings).await;

        let vpcs = surveyed
            .iter()
            .map(|s| VpcFacts {
                account_id: s.account.account_id.clone(),
                vpc_id: s.vpc.vpc_id.clone(),
                cidr_blocks: s.vpc.cidr_blocks.clone(),
                dns_support: s.vpc.dns_support,
                dns_hostnames: s.vpc.dns_hostnames,
                subnet_count: s.vpc.subnet_count,
                hub_router_id: hub
                    .as_ref()
                    .filter(|h| h.attachment_for(&s.vpc.vpc_id).is_some())
                    .map(|h| h.router_id.clone()),
            })
            .collect();

        info!(
            observations = observations.len(),
            warnings = warnings.len(),
            "Topology discovery complete"
        );

        Ok(DiscoveryOutput {
            observations,
            vpcs,
            hub_router_id: hub.map(|h| h.router_id),
            warnings,
        })
    }

    /// Run one account's `work`, turning an overrun into a warning for `stage`
    async fn within_deadline<T>(
        &self,
        account_id: &str,
        stage: &str,
        work: impl Future<Output = Result<T, PartialDiscoveryWarning>>,
    ) -> Result<T, PartialDiscoveryWarning> {
        let deadline = self.config.deadlines.account();
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(PartialDiscoveryWarning::new(
                account_id,
                stage,
                format!("timed out after {}ms", deadline.as_millis()),
            )),
        }
    }

    /// Authenticate, pick the VPC and read hub attachments for one account
    pub async fn survey(&self, account: &Account) -> Result<AccountSurvey, PartialDiscoveryWarning> {
        let id = account.account_id.as_str();
        let retry = &self.config.retry;

        let session = self
            .sessions
            .get_session(id)
            .await
            .map_err(|e| PartialDiscoveryWarning::new(id, "session", e.to_string()))?;
        let api = session.api();

        let vpcs = with_backoff(retry, "describe_vpcs", || api.describe_vpcs())
            .await
            .map_err(|e| PartialDiscoveryWarning::new(id, "vpc", e.to_string()))?;
        let vpc = select_vpc(account, &vpcs).ok_or_else(|| {
            PartialDiscoveryWarning::new(id, "vpc", "no usable VPC found in account")
        })?;
        debug!(account_id = %id, vpc_id = %vpc.vpc_id, "VPC selected");

        let mut warnings = Vec::new();
        let attachments = match with_backoff(retry, "describe_hub_attachments", || api.describe_hub_attachments()).await {
            Ok(attachments) => attachments,
            Err(e) => {
                warnings.push(PartialDiscoveryWarning::new(id, "hub_attachments", e.to_string()));
                Vec::new()
            }
        };

        Ok(AccountSurvey {
            account: account.clone(),
            session,
            vpc,
            attachments,
            warnings,
        })
    }

    async fn load_hub(
        &self,
        accounts: &[Account],
        surveyed: &[AccountSurvey],
        warnings: &mut Vec<PartialDiscoveryWarning>,
    ) -> Result<Option<HubTopology>, EngineError> {
        let seen: BTreeMap<String, Vec<HubAttachment>> = surveyed
            .iter()
            .map(|s| (s.account.account_id.clone(), s.attachments.clone()))
            .collect();

        let Some(router) = resolve_hub(accounts, &seen)? else {
            return Ok(None);
        };

        let owner = router
            .owner_id
            .as_deref()
            .and_then(|owner| surveyed.iter().find(|s| s.account.account_id == owner));
        let Some(owner) = owner else {
            warnings.push(PartialDiscoveryWarning::new(
                router.owner_id.as_deref().unwrap_or("unknown"),
                "HUB_ROUTED",
                format!("owner of hub router {} is not a discovered account", router.router_id),
            ));
            return Ok(None);
        };

        let api = owner.session.api();
        let owner_id = owner.account.account_id.as_str();
        let lookup = async {
            with_backoff(&self.config.retry, "describe_hub_route_tables", || {
                api.describe_hub_route_tables(&router.router_id)
            })
            .await
            .map_err(|e| PartialDiscoveryWarning::new(owner_id, "HUB_ROUTED", e.to_string()))
        };
        let route_tables = match self.within_deadline(owner_id, "HUB_ROUTED", lookup).await {
            Ok(tables) => tables,
            Err(warning) => {
                warnings.push(warning);
                return Ok(None);
            }
        };

        let spokes = surveyed
            .iter()
            .filter(|s| s.account.account_id != owner.account.account_id)
            .map(|s| SpokeVpc {
                account_id: s.account.account_id.clone(),
                vpc_id: s.vpc.vpc_id.clone(),
                cidr_blocks: s.vpc.cidr_blocks.clone(),
            })
            .collect();

        Ok(Some(HubTopology {
            router_id: router.router_id,
            account_id: owner.account.account_id.clone(),
            vpc_id: owner.vpc.vpc_id.clone(),
            cidr_blocks: owner.vpc.cidr_blocks.clone(),
            attachments: owner.attachments.clone(),
            route_tables,
            spokes,
        }))
    }

    /// Observations of the requested kinds from one surveyed account
    pub async fn discover(
        &self,
        survey: &AccountSurvey,
        kinds: &[ConnectionKind],
        hub: Option<&HubTopology>,
    ) -> AccountDiscovery {
        let mut discovery = AccountDiscovery::default();
        let account_id = survey.account.account_id.as_str();
        for kind in kinds {
            let stage = async {
                let result = match kind {
                    ConnectionKind::HubRouted => self.hub_routed(survey, hub).await,
                    ConnectionKind::Peered => self.peered(survey).await,
                    ConnectionKind::Tunneled => self.tunneled(survey).await,
                    ConnectionKind::PrivateEndpoint => self.private_endpoints(survey).await,
                };
                result.map_err(|e| PartialDiscoveryWarning::new(account_id, &kind.to_string(), e.to_string()))
            };
            match self.within_deadline(account_id, &kind.to_string(), stage).await {
                Ok(observations) => {
                    debug!(
                        account_id = %survey.account.account_id,
                        kind = %kind,
                        count = observations.len(),
                        "Connections discovered"
                    );
                    discovery.observations.extend(observations);
                }
                Err(warning) => {
                    warn!(account_id = %account_id, kind = %kind, error = %warning.message, "Discovery stage failed");
                    discovery.warnings.push(warning);
                }
            }
        }
        discovery
    }

    async fn hub_routed(
        &self,
        survey: &AccountSurvey,
        hub: Option<&HubTopology>,
    ) -> ApiResult<Vec<ConnectivityObservation>> {
        let Some(hub) = hub else {
            return Ok(Vec::new());
        };
        if survey.account.account_id == hub.account_id {
            return Ok(Vec::new());
        }
        let spoke = &survey.vpc;
        let account_id = survey.account.account_id.as_str();
        let Some(attachment) = hub.attachment_for(&spoke.vpc_id) else {
            debug!(vpc_id = %spoke.vpc_id, router_id = %hub.router_id, "VPC not attached to hub");
            return Ok(Vec::new());
        };

        let api = survey.session.api();
        let tables = with_backoff(&self.config.retry, "describe_vpc_route_tables", || {
            api.describe_vpc_route_tables(&spoke.vpc_id)
        })
        .await?;

        // Spoke side: destination (or a covering default route) sent to the router
        let sends_to_router = |cidrs: &[String]| {
            tables.iter().flat_map(|t| &t.routes).any(|route| {
                (route.target == hub.router_id || route.target == attachment.attachment_id)
                    && cidrs.iter().any(|cidr| cidr_covers(&route.destination_cidr, cidr))
            })
        };
        let routed = |source: Endpoint, destination: Endpoint, directionality: Directionality| ConnectivityObservation {
            source,
            destination,
            kind: ConnectionKind::HubRouted,
            connection_id: hub.router_id.clone(),
            directionality,
            detail: ConnectionDetail::Routed,
            traffic: None,
            ports_allowed: None,
            use_case: use_case_tag(&spoke.tags),
            observed_by: account_id.to_string(),
        };
        let local = Endpoint::vpc(account_id, &spoke.vpc_id);

        let mut observations = Vec::new();
        match hub.attachment_for(&hub.vpc_id) {
            Some(hub_side) => {
                // Each way needs the table associated with the entry attachment
                let toward_hub =
                    sends_to_router(&hub.cidr_blocks) && hub.routes(attachment, hub_side, &hub.cidr_blocks);
                let toward_spoke = hub.routes(hub_side, attachment, &spoke.cidr_blocks);
                match Directionality::from_evidence(toward_hub, toward_spoke) {
                    Some(directionality) => observations.push(routed(
                        local.clone(),
                        Endpoint::vpc(&hub.account_id, &hub.vpc_id),
                        directionality,
                    )),
                    None => debug!(vpc_id = %spoke.vpc_id, "Attached to hub but no routes either way"),
                }
            }
            None => debug!(vpc_id = %hub.vpc_id, router_id = %hub.router_id, "Hub VPC not attached to its router"),
        }

        // Spoke to spoke: report only the way out of this VPC; the other
        // spoke reports the way back
        for peer in hub.spokes.iter().filter(|p| p.vpc_id != spoke.vpc_id) {
            let Some(peer_attachment) = hub.attachment_for(&peer.vpc_id) else {
                continue;
            };
            if !(sends_to_router(&peer.cidr_blocks) && hub.routes(attachment, peer_attachment, &peer.cidr_blocks)) {
                continue;
            }
            let remote = Endpoint::vpc(&peer.account_id, &peer.vpc_id);
            // One orientation per pair whichever spoke observes it
            let observation = if spoke.vpc_id < peer.vpc_id {
                routed(local.clone(), remote, Directionality::SourceToDest)
            } else {
                routed(remote, local.clone(), Directionality::DestToSource)
            };
            observations.push(observation);
        }

        Ok(observations)
    }

    async fn peered(&self, survey: &AccountSurvey) -> ApiResult<Vec<ConnectivityObservation>> {
        let api = survey.session.api();
        let peerings = with_backoff(&self.config.retry, "describe_peering_connections", || {
            api.describe_peering_connections()
        })
        .await?;

        let vpc_id = survey.vpc.vpc_id.as_str();
        Ok(peerings
            .into_iter()
            .filter(|p| DISCOVERED_PEERING_STATES.contains(&p.status.as_str()))
            .filter_map(|p| {
                let (local, remote) = if p.requester.vpc_id == vpc_id {
                    (&p.requester, &p.accepter)
                } else if p.accepter.vpc_id == vpc_id {
                    (&p.accepter, &p.requester)
                } else {
                    return None;
                };
                Some(ConnectivityObservation {
                    source: Endpoint::vpc(&local.owner_id, &local.vpc_id),
                    destination: Endpoint::vpc(&remote.owner_id, &remote.vpc_id),
                    kind: ConnectionKind::Peered,
                    connection_id: p.peering_id.clone(),
                    directionality: Directionality::Both,
                    detail: ConnectionDetail::Peering {
                        status: p.status.clone(),
                    },
                    traffic: None,
                    ports_allowed: None,
                    use_case: use_case_tag(&p.tags),
                    observed_by: survey.account.account_id.clone(),
                })
            })
            .collect())
    }

    async fn tunneled(&self, survey: &AccountSurvey) -> ApiResult<Vec<ConnectivityObservation>> {
        let api = survey.session.api();
        let connections = with_backoff(&self.config.retry, "describe_vpn_connections", || {
            api.describe_vpn_connections()
        })
        .await?;

        let vpc_id = survey.vpc.vpc_id.as_str();
        Ok(connections
            .into_iter()
            .filter(|c| c.state != "deleted")
            .filter(|c| c.vpc_id.as_deref().map(|v| v == vpc_id).unwrap_or(true))
            .map(|c| ConnectivityObservation {
                source: Endpoint::vpc(&survey.account.account_id, vpc_id),
                destination: Endpoint::external(&c.customer_gateway_id),
                kind: ConnectionKind::Tunneled,
                connection_id: c.vpn_id.clone(),
                directionality: Directionality::Both,
                detail: ConnectionDetail::Tunnel {
                    state: c.state.clone(),
                    tunnels: c
                        .tunnels
                        .iter()
                        .map(|t| TunnelHealth {
                            endpoint: t.outside_ip.clone(),
                            up: t.status.eq_ignore_ascii_case("up"),
                        })
                        .collect(),
                },
                traffic: None,
                ports_allowed: None,
                use_case: use_case_tag(&c.tags),
                observed_by: survey.account.account_id.clone(),
            })
            .collect())
    }

    async fn private_endpoints(&self, survey: &AccountSurvey) -> ApiResult<Vec<ConnectivityObservation>> {
        let api = survey.session.api();
        let vpc_id = survey.vpc.vpc_id.as_str();

        let endpoints: Vec<_> = with_backoff(&self.config.retry, "describe_vpc_endpoints", || {
            api.describe_vpc_endpoints()
        })
        .await?
        .into_iter()
        .filter(|e| e.endpoint_type == "Interface" && e.vpc_id == vpc_id && e.state != "deleted")
        .collect();
        if endpoints.is_empty() {
            return Ok(Vec::new());
        }

        let interfaces = with_backoff(&self.config.retry, "describe_network_interfaces", || {
            api.describe_network_interfaces(Some(vpc_id))
        })
        .await?;

        Ok(endpoints
            .into_iter()
            .map(|e| ConnectivityObservation {
                source: Endpoint::vpc(&survey.account.account_id, vpc_id),
                destination: Endpoint::external(&e.service_name),
                kind: ConnectionKind::PrivateEndpoint,
                connection_id: e.endpoint_id.clone(),
                directionality: Directionality::SourceToDest,
                detail: ConnectionDetail::Endpoint {
                    state: e.state.clone(),
                    service_name: e.service_name.clone(),
                    interfaces: e
                        .interface_ids
                        .iter()
                        .map(|id| InterfaceHealth {
                            interface_id: id.clone(),
                            healthy: interfaces
                                .iter()
                                .any(|eni| &eni.interface_id == id && eni.status == "in-use"),
                        })
                        .collect(),
                },
                traffic: None,
                ports_allowed: None,
                use_case: use_case_tag(&e.tags),
                observed_by: survey.account.account_id.clone(),
            })
            .collect())
    }

    /// Attach flow-log traffic to observations between two known VPCs
    async fn enrich(
        &self,
        surveyed: &[AccountSurvey],
        observations: &mut [ConnectivityObservation],
        warnings: &mut Vec<PartialDiscoveryWarning>,
    ) {
        let fleet: Vec<VpcAddressSpace> = surveyed
            .iter()
            .map(|s| VpcAddressSpace {
                vpc_id: s.vpc.vpc_id.clone(),
                cidr_blocks: s.vpc.cidr_blocks.clone(),
            })
            .collect();

        let fleet = &fleet;
        let deadline = self.config.deadlines.account();
        let queries = surveyed.iter().map(|s| async move {
            let query = collect_traffic(
                s.session.api(),
                &s.vpc.vpc_id,
                fleet,
                &self.config.flow_logs,
                &self.config.retry,
            );
            (s, tokio::time::timeout(deadline, query).await)
        });

        let mut traffic: BTreeMap<(String, String), TrafficSample> = BTreeMap::new();
        for (survey, result) in join_all(queries).await {
            let result = match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(vpc_id = %survey.vpc.vpc_id, deadline_ms = deadline.as_millis() as u64, "Flow log query timed out");
                    warnings.push(PartialDiscoveryWarning::new(
                        &survey.account.account_id,
                        "flow_logs",
                        format!("timed out after {}ms", deadline.as_millis()),
                    ));
                    continue;
                }
            };
            match result {
                Ok(by_dest) => {
                    for (dest_vpc, sample) in by_dest {
                        traffic
                            .entry((survey.vpc.vpc_id.clone(), dest_vpc))
                            .or_default()
                            .merge(&sample);
                    }
                }
                Err(ApiError::NotFound(_)) => {
                    debug!(vpc_id = %survey.vpc.vpc_id, "Flow logs not enabled");
                }
                Err(e) => {
                    warn!(vpc_id = %survey.vpc.vpc_id, error = %e, "Flow log query failed");
                    warnings.push(PartialDiscoveryWarning::new(
                        &survey.account.account_id,
                        "flow_logs",
                        e.to_string(),
                    ));
                }
            }
        }

        for observation in observations.iter_mut() {
            let key = match (observation.source.vpc_id(), observation.destination.vpc_id()) {
                (Some(src), Some(dst)) => (src.to_string(), dst.to_string()),
                _ => continue,
            };
            if let Some(sample) = traffic.get(&key) {
                observation.traffic = Some(sample.clone());
            }
        }
    }

    /// Attach the ports security groups admit to observations between two
    /// discovered VPCs. Paths touching a VPC whose groups could not be read
    /// stay unknown.
    async fn narrow_ports(
        &self,
        surveyed: &[AccountSurvey],
        observations: &mut [ConnectivityObservation],
        warnings: &mut Vec<PartialDiscoveryWarning>,
    ) {
        let lookups = surveyed.iter().map(|s| async move {
            let account_id = s.account.account_id.as_str();
            let api = s.session.api();
            let lookup = async {
                with_backoff(&self.config.retry, "describe_security_groups", || {
                    api.describe_security_groups(&s.vpc.vpc_id)
                })
                .await
                .map_err(|e| PartialDiscoveryWarning::new(account_id, "security_groups", e.to_string()))
            };
            (s, self.within_deadline(account_id, "security_groups", lookup).await)
        });

        let mut admitted: BTreeMap<String, AdmittedPorts> = BTreeMap::new();
        for (survey, result) in join_all(lookups).await {
            match result {
                Ok(groups) => {
                    debug!(vpc_id = %survey.vpc.vpc_id, groups = groups.len(), "Security groups read");
                    admitted.insert(survey.vpc.vpc_id.clone(), AdmittedPorts::from_groups(&groups));
                }
                Err(warning) => {
                    warn!(vpc_id = %survey.vpc.vpc_id, error = %warning.message, "Security group lookup failed");
                    warnings.push(warning);
                }
            }
        }

        for observation in observations.iter_mut() {
            let (Some(src), Some(dst)) = (observation.source.vpc_id(), observation.destination.vpc_id()) else {
                continue;
            };
            if let (Some(source), Some(destination)) = (admitted.get(src), admitted.get(dst)) {
                observation.ports_allowed = Some(allowed_ports(observation.directionality, source, destination));
            }
        }
    }
}
