//! Recorded topology replay
//!
//! A [`NetworkApi`] that answers from a JSON snapshot of each account's
//! network instead of calling the cloud. Path-analysis resources are kept in
//! memory so create/reuse/delete behaviour is observable, and individual
//! operations can be scripted to fail, throttle, stall or never finish.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::api::*;
use crate::error::{ApiError, EngineError};
use crate::session::{CredentialSource, IssuedCredentials};

/// A path the analyser reports as unreachable.
///
/// Matches a [`PathSpec`] whose source and destination contain the given
/// fragments (interface ids, attachment ids) and, if set, whose port matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedPath {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub blocking: Vec<String>,
}

impl BlockedPath {
    fn matches(&self, spec: &PathSpec) -> bool {
        spec.source.contains(&self.source)
            && spec.destination.contains(&self.destination)
            && self.port.map(|p| spec.port == Some(p)).unwrap_or(true)
    }
}

/// Snapshot of one account's network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountTopology {
    pub vpcs: Vec<VpcInfo>,
    pub vpc_route_tables: Vec<VpcRouteTable>,
    pub hub_attachments: Vec<HubAttachment>,
    /// Route tables keyed by router id (only on the router owner)
    pub hub_route_tables: BTreeMap<String, Vec<HubRouteTable>>,
    pub peering_connections: Vec<PeeringConnection>,
    pub vpn_connections: Vec<VpnConnection>,
    pub vpc_endpoints: Vec<VpcEndpoint>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub security_groups: Vec<SecurityGroup>,
    /// Flow rows keyed by the VPC whose logs recorded them
    pub flow_records: BTreeMap<String, Vec<FlowRecord>>,
    /// Insights paths left behind by earlier runs
    pub existing_paths: Vec<InsightsPath>,
    pub blocked_paths: Vec<BlockedPath>,
    /// Polls answered with "running" before an analysis completes
    pub analysis_polls: u32,
    pub never_complete: bool,
    /// Authentication to this account is refused
    pub access_denied: bool,
    /// Operations answered with AccessDenied
    pub denied_operations: BTreeSet<String>,
    /// Operations answered with a service error carrying this message
    pub failing_operations: BTreeMap<String, String>,
    /// Operations that never answer
    pub stalled_operations: BTreeSet<String>,
    /// Calls answered with Throttled before the account recovers
    pub throttle_first: u32,
}

impl AccountTopology {
    pub fn denied(mut self) -> Self {
        self.access_denied = true;
        self
    }

    pub fn deny(mut self, operation: &str) -> Self {
        self.denied_operations.insert(operation.to_string());
        self
    }

    pub fn failing(mut self, operation: &str, message: &str) -> Self {
        self.failing_operations
            .insert(operation.to_string(), message.to_string());
        self
    }

    pub fn stalled(mut self, operation: &str) -> Self {
        self.stalled_operations.insert(operation.to_string());
        self
    }

    pub fn throttled(mut self, calls: u32) -> Self {
        self.throttle_first = calls;
        self
    }

    pub fn never_completing(mut self) -> Self {
        self.never_complete = true;
        self
    }

    pub fn blocked(mut self, source: &str, destination: &str, port: Option<u16>) -> Self {
        self.blocked_paths.push(BlockedPath {
            source: source.to_string(),
            destination: destination.to_string(),
            port,
            blocking: vec!["security-group".to_string()],
        });
        self
    }
}

/// Snapshot of the whole fleet, as stored on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordedTopology {
    pub accounts: BTreeMap<String, AccountTopology>,
}

impl RecordedTopology {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

struct RecordedAnalysis {
    path_id: String,
    polls_left: u32,
    blocking: Option<Vec<String>>,
}

#[derive(Default)]
struct NetworkState {
    paths: Vec<InsightsPath>,
    analyses: HashMap<String, RecordedAnalysis>,
    throttles_left: u32,
    next_id: u64,
    paths_created: usize,
    analyses_started: usize,
    analyses_deleted: usize,
}

impl NetworkState {
    fn next_id(&mut self, prefix: &str, account_id: &str) -> String {
        self.next_id += 1;
        format!("{}-{}{:06}", prefix, account_id, self.next_id)
    }
}

/// Replays one account
pub struct RecordedNetwork {
    account_id: String,
    topology: AccountTopology,
    state: Mutex<NetworkState>,
}

impl RecordedNetwork {
    pub fn new(account_id: &str, topology: AccountTopology) -> Self {
        let state = NetworkState {
            paths: topology.existing_paths.clone(),
            throttles_left: topology.throttle_first,
            ..Default::default()
        };
        Self {
            account_id: account_id.to_string(),
            topology,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn check(&self, operation: &str) -> ApiResult<()> {
        if self.topology.stalled_operations.contains(operation) {
            debug!(account_id = %self.account_id, operation, "Stalling");
            std::future::pending::<()>().await;
        }
        if self.topology.denied_operations.contains(operation) {
            return Err(ApiError::AccessDenied(format!(
                "{} is not authorized in account {}",
                operation, self.account_id
            )));
        }
        if let Some(message) = self.topology.failing_operations.get(operation) {
            return Err(ApiError::service("InternalError", message));
        }
        let mut state = self.state();
        if state.throttles_left > 0 {
            state.throttles_left -= 1;
            return Err(ApiError::Throttled(format!("{} rate exceeded", operation)));
        }
        Ok(())
    }

    pub fn paths_created(&self) -> usize {
        self.state().paths_created
    }

    pub fn analyses_started(&self) -> usize {
        self.state().analyses_started
    }

    pub fn analyses_deleted(&self) -> usize {
        self.state().analyses_deleted
    }

    /// Analyses started but not yet deleted
    pub fn live_analyses(&self) -> usize {
        self.state().analyses.len()
    }
}

#[async_trait]
impl NetworkApi for RecordedNetwork {
    async fn describe_vpcs(&self) -> ApiResult<Vec<VpcInfo>> {
        self.check("describe_vpcs").await?;
        Ok(self.topology.vpcs.clone())
    }

    async fn describe_vpc_route_tables(&self, vpc_id: &str) -> ApiResult<Vec<VpcRouteTable>> {
        self.check("describe_vpc_route_tables").await?;
        Ok(self
            .topology
            .vpc_route_tables
            .iter()
            .filter(|t| t.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn describe_hub_attachments(&self) -> ApiResult<Vec<HubAttachment>> {
        self.check("describe_hub_attachments").await?;
        Ok(self.topology.hub_attachments.clone())
    }

    async fn describe_hub_route_tables(&self, router_id: &str) -> ApiResult<Vec<HubRouteTable>> {
        self.check("describe_hub_route_tables").await?;
        self.topology
            .hub_route_tables
            .get(router_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("hub router {}", router_id)))
    }

    async fn describe_peering_connections(&self) -> ApiResult<Vec<PeeringConnection>> {
        self.check("describe_peering_connections").await?;
        Ok(self.topology.peering_connections.clone())
    }

    async fn describe_vpn_connections(&self) -> ApiResult<Vec<VpnConnection>> {
        self.check("describe_vpn_connections").await?;
        Ok(self.topology.vpn_connections.clone())
    }

    async fn describe_vpc_endpoints(&self) -> ApiResult<Vec<VpcEndpoint>> {
        self.check("describe_vpc_endpoints").await?;
        Ok(self.topology.vpc_endpoints.clone())
    }

    async fn describe_network_interfaces(&self, vpc_id: Option<&str>) -> ApiResult<Vec<NetworkInterface>> {
        self.check("describe_network_interfaces").await?;
        Ok(self
            .topology
            .network_interfaces
            .iter()
            .filter(|eni| vpc_id.map(|v| eni.vpc_id == v).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn describe_security_groups(&self, vpc_id: &str) -> ApiResult<Vec<SecurityGroup>> {
        self.check("describe_security_groups").await?;
        Ok(self
            .topology
            .security_groups
            .iter()
            .filter(|g| g.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn query_flow_records(&self, query: &FlowQuery) -> ApiResult<Vec<FlowRecord>> {
        self.check("query_flow_records").await?;
        let records = self
            .topology
            .flow_records
            .get(&query.vpc_id)
            .ok_or_else(|| ApiError::NotFound(format!("flow logs for {}", query.vpc_id)))?;
        Ok(records.iter().take(query.limit).cloned().collect())
    }

    async fn describe_insights_paths(&self) -> ApiResult<Vec<InsightsPath>> {
        self.check("describe_insights_paths").await?;
        Ok(self.state().paths.clone())
    }

    async fn create_insights_path(&self, spec: &PathSpec) -> ApiResult<InsightsPath> {
        self.check("create_insights_path").await?;
        let mut state = self.state();
        if state.paths.iter().any(|p| p.spec.matches(spec)) {
            return Err(ApiError::Conflict(spec.to_string()));
        }

        let path = InsightsPath {
            path_id: state.next_id("nip", &self.account_id),
            spec: spec.clone(),
        };
        state.paths.push(path.clone());
        state.paths_created += 1;
        debug!(path_id = %path.path_id, "Recorded insights path created");
        Ok(path)
    }

    async fn start_analysis(&self, path_id: &str) -> ApiResult<String> {
        self.check("start_analysis").await?;
        let spec = self
            .state()
            .paths
            .iter()
            .find(|p| p.path_id == path_id)
            .map(|p| p.spec.clone())
            .ok_or_else(|| ApiError::NotFound(format!("insights path {}", path_id)))?;

        let blocking = self
            .topology
            .blocked_paths
            .iter()
            .find(|b| b.matches(&spec))
            .map(|b| b.blocking.clone());

        let mut state = self.state();
        let analysis_id = state.next_id("nia", &self.account_id);
        state.analyses.insert(
            analysis_id.clone(),
            RecordedAnalysis {
                path_id: path_id.to_string(),
                polls_left: self.topology.analysis_polls,
                blocking,
            },
        );
        state.analyses_started += 1;
        Ok(analysis_id)
    }

    async fn describe_analysis(&self, analysis_id: &str) -> ApiResult<InsightsAnalysis> {
        self.check("describe_analysis").await?;
        let never_complete = self.topology.never_complete;
        let mut state = self.state();
        let analysis = state
            .analyses
            .get_mut(analysis_id)
            .ok_or_else(|| ApiError::NotFound(format!("analysis {}", analysis_id)))?;

        if never_complete || analysis.polls_left > 0 {
            analysis.polls_left = analysis.polls_left.saturating_sub(1);
            return Ok(InsightsAnalysis {
                analysis_id: analysis_id.to_string(),
                path_id: analysis.path_id.clone(),
                status: AnalysisStatus::Running,
                status_message: None,
                path_found: None,
                blocking_components: Vec::new(),
            });
        }

        Ok(InsightsAnalysis {
            analysis_id: analysis_id.to_string(),
            path_id: analysis.path_id.clone(),
            status: AnalysisStatus::Succeeded,
            status_message: None,
            path_found: Some(analysis.blocking.is_none()),
            blocking_components: analysis.blocking.clone().unwrap_or_default(),
        })
    }

    async fn delete_analysis(&self, analysis_id: &str) -> ApiResult<()> {
        self.check("delete_analysis").await?;
        let mut state = self.state();
        state
            .analyses
            .remove(analysis_id)
            .ok_or_else(|| ApiError::NotFound(format!("analysis {}", analysis_id)))?;
        state.analyses_deleted += 1;
        Ok(())
    }
}

/// Credential source over a set of recorded accounts
pub struct RecordedFleet {
    networks: BTreeMap<String, Arc<RecordedNetwork>>,
    denied: BTreeSet<String>,
    credential_lifetime: Duration,
    authentications: Mutex<HashMap<String, usize>>,
}

impl Default for RecordedFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordedFleet {
    pub fn new() -> Self {
        Self {
            networks: BTreeMap::new(),
            denied: BTreeSet::new(),
            credential_lifetime: Duration::from_secs(60 * 60),
            authentications: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_topology(topology: RecordedTopology) -> Self {
        topology
            .accounts
            .into_iter()
            .fold(Self::new(), |fleet, (id, account)| fleet.with_account(&id, account))
    }

    pub fn with_account(mut self, account_id: &str, topology: AccountTopology) -> Self {
        if topology.access_denied {
            self.denied.insert(account_id.to_string());
        }
        self.networks.insert(
            account_id.to_string(),
            Arc::new(RecordedNetwork::new(account_id, topology)),
        );
        self
    }

    pub fn network(&self, account_id: &str) -> Option<Arc<RecordedNetwork>> {
        self.networks.get(account_id).cloned()
    }

    pub fn authentications(&self, account_id: &str) -> usize {
        self.authentications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }

    /// Analyses started and not deleted across every account
    pub fn live_analyses(&self) -> usize {
        self.networks.values().map(|n| n.live_analyses()).sum()
    }
}

#[async_trait]
impl CredentialSource for RecordedFleet {
    async fn authenticate(&self, account_id: &str) -> Result<IssuedCredentials, ApiError> {
        *self
            .authentications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(account_id.to_string())
            .or_insert(0) += 1;

        if self.denied.contains(account_id) {
            return Err(ApiError::AccessDenied(format!(
                "no role could be assumed in account {}",
                account_id
            )));
        }
        let network = self
            .networks
            .get(account_id)
            .ok_or_else(|| ApiError::AccessDenied(format!("no credentials for account {}", account_id)))?;

        let client: Arc<dyn NetworkApi> = network.clone();
        Ok(IssuedCredentials {
            client,
            expires_at: Instant::now() + self.credential_lifetime,
        })
    }
}

/// Canned fleets shared by the module tests
#[cfg(test)]
pub(crate) mod samples {
    use super::*;
    use crate::types::Account;

    pub const HUB: &str = "111111111111";
    pub const SPOKE: &str = "222222222222";
    pub const DATA: &str = "333333333333";

    pub fn vpc(vpc_id: &str, owner: &str, cidr: &str) -> VpcInfo {
        VpcInfo {
            vpc_id: vpc_id.to_string(),
            owner_id: owner.to_string(),
            cidr_blocks: vec![cidr.to_string()],
            is_default: false,
            dns_support: true,
            dns_hostnames: true,
            subnet_count: 2,
            tags: BTreeMap::new(),
        }
    }

    pub fn default_vpc(owner: &str) -> VpcInfo {
        VpcInfo {
            is_default: true,
            ..vpc("vpc-default", owner, "172.31.0.0/16")
        }
    }

    pub fn attachment(id: &str, vpc_id: &str, vpc_owner: &str) -> HubAttachment {
        HubAttachment {
            attachment_id: id.to_string(),
            router_id: "tgw-1".to_string(),
            vpc_id: vpc_id.to_string(),
            vpc_owner_id: vpc_owner.to_string(),
            router_owner_id: Some(HUB.to_string()),
            state: "available".to_string(),
        }
    }

    pub fn hub_route(cidr: &str, attachment_id: &str) -> HubRoute {
        HubRoute {
            destination_cidr: cidr.to_string(),
            attachment_id: Some(attachment_id.to_string()),
            state: "active".to_string(),
        }
    }

    pub fn vpc_routes(vpc_id: &str, routes: &[(&str, &str)]) -> VpcRouteTable {
        VpcRouteTable {
            route_table_id: format!("rtb-{}", vpc_id),
            vpc_id: vpc_id.to_string(),
            routes: routes
                .iter()
                .map(|(cidr, target)| VpcRoute {
                    destination_cidr: cidr.to_string(),
                    target: target.to_string(),
                })
                .collect(),
        }
    }

    pub fn interface(id: &str, vpc_id: &str, owner: &str, description: &str) -> NetworkInterface {
        NetworkInterface {
            interface_id: id.to_string(),
            vpc_id: vpc_id.to_string(),
            owner_id: owner.to_string(),
            status: "in-use".to_string(),
            description: description.to_string(),
        }
    }

    /// Group admitting tcp `ports` in the given direction from anywhere
    pub fn security_group(group_id: &str, vpc_id: &str, ingress: &[u16], egress: &[u16]) -> SecurityGroup {
        let rules = |ports: &[u16]| {
            ports
                .iter()
                .map(|port| SecurityGroupRule {
                    protocol: "tcp".to_string(),
                    from_port: Some(*port),
                    to_port: Some(*port),
                    cidr_blocks: vec!["10.0.0.0/8".to_string()],
                    source_groups: Vec::new(),
                })
                .collect()
        };
        SecurityGroup {
            group_id: group_id.to_string(),
            group_name: group_id.to_string(),
            vpc_id: vpc_id.to_string(),
            ingress: rules(ingress),
            egress: rules(egress),
        }
    }

    /// Hub account owning tgw-1, spoke attached to it with routes both ways
    pub fn hub_topology() -> AccountTopology {
        let mut hub_route_tables = BTreeMap::new();
        hub_route_tables.insert(
            "tgw-1".to_string(),
            vec![HubRouteTable {
                route_table_id: "tgw-rtb-1".to_string(),
                associations: vec!["tgw-attach-hub".to_string(), "tgw-attach-spoke".to_string()],
                routes: vec![
                    hub_route("10.0.0.0/16", "tgw-attach-hub"),
                    hub_route("10.1.0.0/16", "tgw-attach-spoke"),
                ],
            }],
        );

        AccountTopology {
            vpcs: vec![default_vpc(HUB), vpc("vpc-hub", HUB, "10.0.0.0/16")],
            vpc_route_tables: vec![vpc_routes(
                "vpc-hub",
                &[("10.0.0.0/16", "local"), ("10.1.0.0/16", "tgw-1")],
            )],
            hub_attachments: vec![
                attachment("tgw-attach-hub", "vpc-hub", HUB),
                attachment("tgw-attach-spoke", "vpc-spoke", SPOKE),
            ],
            hub_route_tables,
            network_interfaces: vec![interface("eni-hub", "vpc-hub", HUB, "ELB app/hub")],
            ..Default::default()
        }
    }

    pub fn spoke_topology() -> AccountTopology {
        AccountTopology {
            vpcs: vec![vpc("vpc-spoke", SPOKE, "10.1.0.0/16")],
            vpc_route_tables: vec![vpc_routes(
                "vpc-spoke",
                &[("10.1.0.0/16", "local"), ("0.0.0.0/0", "tgw-1")],
            )],
            hub_attachments: vec![attachment("tgw-attach-spoke", "vpc-spoke", SPOKE)],
            network_interfaces: vec![interface(
                "eni-spoke",
                "vpc-spoke",
                SPOKE,
                "AWS Lambda VPC ENI-spoke-fn",
            )],
            flow_records: [(
                "vpc-spoke".to_string(),
                vec![FlowRecord {
                    src_addr: "10.1.2.10".to_string(),
                    dst_addr: "10.0.4.20".to_string(),
                    dst_port: 443,
                    protocol: "6".to_string(),
                    bytes: 4_096,
                    packets: 12,
                }],
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    fn peering() -> PeeringConnection {
        PeeringConnection {
            peering_id: "pcx-backup".to_string(),
            status: "active".to_string(),
            requester: PeeringSide {
                vpc_id: "vpc-spoke".to_string(),
                owner_id: SPOKE.to_string(),
                cidr_block: Some("10.1.0.0/16".to_string()),
            },
            accepter: PeeringSide {
                vpc_id: "vpc-data".to_string(),
                owner_id: DATA.to_string(),
                cidr_block: Some("10.2.0.0/16".to_string()),
            },
            tags: [("UseCase".to_string(), "database-backup".to_string())]
                .into_iter()
                .collect(),
        }
    }

    /// Spoke peered with a data account, traffic on 3306 and 5432
    pub fn peered_spoke_topology() -> AccountTopology {
        let mut topology = spoke_topology();
        topology.hub_attachments.clear();
        topology.peering_connections.push(peering());
        topology.flow_records.insert(
            "vpc-spoke".to_string(),
            vec![FlowRecord {
                src_addr: "10.1.2.10".to_string(),
                dst_addr: "10.2.0.15".to_string(),
                dst_port: 3306,
                protocol: "6".to_string(),
                bytes: 1_000,
                packets: 10,
            }],
        );
        topology
    }

    pub fn data_topology() -> AccountTopology {
        AccountTopology {
            vpcs: vec![vpc("vpc-data", DATA, "10.2.0.0/16")],
            peering_connections: vec![peering()],
            network_interfaces: vec![interface("eni-data", "vpc-data", DATA, "RDS network interface")],
            flow_records: [(
                "vpc-data".to_string(),
                vec![FlowRecord {
                    src_addr: "10.2.0.15".to_string(),
                    dst_addr: "10.1.2.10".to_string(),
                    dst_port: 5432,
                    protocol: "6".to_string(),
                    bytes: 2_000,
                    packets: 20,
                }],
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    /// Data account attached to tgw-1 as a second spoke
    pub fn data_spoke_topology() -> AccountTopology {
        AccountTopology {
            vpcs: vec![vpc("vpc-data", DATA, "10.2.0.0/16")],
            vpc_route_tables: vec![vpc_routes(
                "vpc-data",
                &[("10.2.0.0/16", "local"), ("0.0.0.0/0", "tgw-1")],
            )],
            hub_attachments: vec![attachment("tgw-attach-data", "vpc-data", DATA)],
            network_interfaces: vec![interface("eni-data", "vpc-data", DATA, "RDS network interface")],
            ..Default::default()
        }
    }

    /// Hub with the data spoke sharing tgw-rtb-1
    pub fn hub_with_data_spoke() -> AccountTopology {
        let mut hub = hub_topology();
        hub.hub_attachments.push(attachment("tgw-attach-data", "vpc-data", DATA));
        for table in hub.hub_route_tables.values_mut().flatten() {
            table.associations.push("tgw-attach-data".to_string());
            table.routes.push(hub_route("10.2.0.0/16", "tgw-attach-data"));
        }
        hub
    }

    pub fn hub_and_spoke_fleet() -> RecordedFleet {
        RecordedFleet::new()
            .with_account(HUB, hub_topology())
            .with_account(SPOKE, spoke_topology())
    }

    pub fn peered_fleet() -> RecordedFleet {
        RecordedFleet::new()
            .with_account(SPOKE, peered_spoke_topology())
            .with_account(DATA, data_topology())
    }

    pub fn hub_accounts() -> Vec<Account> {
        vec![
            Account::new(HUB, "network-hub", "us-east-1"),
            Account::new(SPOKE, "workload", "us-east-1"),
        ]
    }

    pub fn peered_accounts() -> Vec<Account> {
        vec![
            Account::new(SPOKE, "workload", "us-east-1"),
            Account::new(DATA, "data", "us-east-1"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::samples::*;
    use super::*;

    fn spec(port: Option<u16>) -> PathSpec {
        PathSpec {
            source: "eni-a".to_string(),
            destination: "eni-b".to_string(),
            protocol: "tcp".to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_duplicate_path_is_a_conflict() {
        let network = RecordedNetwork::new(HUB, AccountTopology::default());
        network.create_insights_path(&spec(Some(443))).await.unwrap();

        let err = network.create_insights_path(&spec(Some(443))).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        network.create_insights_path(&spec(Some(22))).await.unwrap();
        assert_eq!(network.paths_created(), 2);
    }

    #[tokio::test]
    async fn test_analysis_completes_after_scripted_polls() {
        let topology = AccountTopology {
            analysis_polls: 2,
            ..Default::default()
        }
        .blocked("eni-a", "eni-b", Some(22));
        let network = RecordedNetwork::new(HUB, topology);

        let path = network.create_insights_path(&spec(Some(22))).await.unwrap();
        let id = network.start_analysis(&path.path_id).await.unwrap();

        assert_eq!(network.describe_analysis(&id).await.unwrap().status, AnalysisStatus::Running);
        assert_eq!(network.describe_analysis(&id).await.unwrap().status, AnalysisStatus::Running);
        let done = network.describe_analysis(&id).await.unwrap();
        assert_eq!(done.status, AnalysisStatus::Succeeded);
        assert_eq!(done.path_found, Some(false));
        assert_eq!(done.blocking_components, vec!["security-group".to_string()]);

        network.delete_analysis(&id).await.unwrap();
        assert_eq!(network.live_analyses(), 0);
        assert!(network.describe_analysis(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_operation_never_answers() {
        let network = RecordedNetwork::new(HUB, hub_topology().stalled("describe_vpcs"));
        let stalled = tokio::time::timeout(Duration::from_millis(20), network.describe_vpcs()).await;
        assert!(stalled.is_err());
        assert!(network.describe_hub_attachments().await.is_ok());
    }

    #[tokio::test]
    async fn test_throttling_recovers() {
        let network = RecordedNetwork::new(HUB, hub_topology().throttled(1));
        assert!(network.describe_vpcs().await.unwrap_err().is_retryable());
        assert_eq!(network.describe_vpcs().await.unwrap().len(), 2);
    }

    #[test]
    fn test_topology_loads_from_json() {
        let json = r#"{
            "accounts": {
                "111111111111": {
                    "vpcs": [{"vpc_id": "vpc-1", "owner_id": "111111111111", "cidr_blocks": ["10.0.0.0/16"]}],
                    "analysis_polls": 1
                }
            }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");
        std::fs::write(&path, json).unwrap();

        let topology = RecordedTopology::load(&path).unwrap();
        let account = &topology.accounts["111111111111"];
        assert_eq!(account.vpcs[0].vpc_id, "vpc-1");
        assert_eq!(account.analysis_polls, 1);
        assert!(!account.access_denied);
    }
}
