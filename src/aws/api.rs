//! Network API trait and the raw records it returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::error::ApiError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// VPC description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcInfo {
    pub vpc_id: String,
    pub owner_id: String,
    /// Primary CIDR first, then associated secondary CIDRs
    pub cidr_blocks: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub dns_support: bool,
    #[serde(default)]
    pub dns_hostnames: bool,
    #[serde(default)]
    pub subnet_count: u32,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl VpcInfo {
    pub fn contains(&self, addr: &str) -> bool {
        self.cidr_blocks.iter().any(|cidr| cidr_contains(cidr, addr))
    }
}

/// VPC attachment on a hub router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubAttachment {
    pub attachment_id: String,
    pub router_id: String,
    pub vpc_id: String,
    pub vpc_owner_id: String,
    /// Only present when the router is shared from another account
    #[serde(default)]
    pub router_owner_id: Option<String>,
    pub state: String,
}

impl HubAttachment {
    pub fn is_available(&self) -> bool {
        self.state == "available"
    }

    pub fn owner(&self) -> &str {
        self.router_owner_id.as_deref().unwrap_or(&self.vpc_owner_id)
    }
}

/// Route table on the hub router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubRouteTable {
    pub route_table_id: String,
    /// Attachment ids associated with this table
    #[serde(default)]
    pub associations: Vec<String>,
    #[serde(default)]
    pub routes: Vec<HubRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubRoute {
    pub destination_cidr: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    pub state: String,
}

/// Route table inside a VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcRouteTable {
    pub route_table_id: String,
    pub vpc_id: String,
    #[serde(default)]
    pub routes: Vec<VpcRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcRoute {
    pub destination_cidr: String,
    /// Gateway, router, attachment or interface id; "local" for the VPC itself
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringSide {
    pub vpc_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub cidr_block: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringConnection {
    pub peering_id: String,
    /// "active", "pending-acceptance", "deleted", ...
    pub status: String,
    pub requester: PeeringSide,
    pub accepter: PeeringSide,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTelemetry {
    pub outside_ip: String,
    /// "UP" or "DOWN"
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnConnection {
    pub vpn_id: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
    pub customer_gateway_id: String,
    pub state: String,
    #[serde(default)]
    pub tunnels: Vec<TunnelTelemetry>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcEndpoint {
    pub endpoint_id: String,
    pub vpc_id: String,
    pub service_name: String,
    /// "Interface", "Gateway", ...
    pub endpoint_type: String,
    pub state: String,
    #[serde(default)]
    pub interface_ids: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub interface_id: String,
    pub vpc_id: String,
    pub owner_id: String,
    /// "in-use", "available", ...
    pub status: String,
    #[serde(default)]
    pub description: String,
}

/// Security group with its rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub group_id: String,
    #[serde(default)]
    pub group_name: String,
    pub vpc_id: String,
    #[serde(default)]
    pub ingress: Vec<SecurityGroupRule>,
    #[serde(default)]
    pub egress: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    /// "tcp", "udp", "6", "17" or "-1" for every protocol
    pub protocol: String,
    #[serde(default)]
    pub from_port: Option<u16>,
    #[serde(default)]
    pub to_port: Option<u16>,
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
    /// Referenced group ids
    #[serde(default)]
    pub source_groups: Vec<String>,
}

/// Aggregated accepted flow row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_addr: String,
    pub dst_addr: String,
    pub dst_port: u16,
    /// IANA protocol number as text ("6", "17")
    pub protocol: String,
    pub bytes: u64,
    pub packets: u64,
}

/// Flow-log query window for one VPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowQuery {
    pub vpc_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: usize,
}

/// Identity tuple of a path-analysis resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathSpec {
    pub source: String,
    pub destination: String,
    /// "-1" for protocol-agnostic, otherwise "tcp"/"udp"
    pub protocol: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl PathSpec {
    /// Whether an existing path matches this tuple; ports only matter for tcp/udp
    pub fn matches(&self, other: &PathSpec) -> bool {
        if self.source != other.source
            || self.destination != other.destination
            || self.protocol != other.protocol
        {
            return false;
        }
        match self.protocol.as_str() {
            "tcp" | "udp" => self.port == other.port,
            _ => true,
        }
    }
}

impl std::fmt::Display for PathSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{} -> {} ({}:{})", self.source, self.destination, self.protocol, port),
            None => write!(f, "{} -> {} ({})", self.source, self.destination, self.protocol),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightsPath {
    pub path_id: String,
    pub spec: PathSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightsAnalysis {
    pub analysis_id: String,
    pub path_id: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub path_found: Option<bool>,
    /// Components that blocked the path when not found
    #[serde(default)]
    pub blocking_components: Vec<String>,
}

/// Account-scoped network API
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn describe_vpcs(&self) -> ApiResult<Vec<VpcInfo>>;

    async fn describe_vpc_route_tables(&self, vpc_id: &str) -> ApiResult<Vec<VpcRouteTable>>;

    /// Hub router attachments visible to this account
    async fn describe_hub_attachments(&self) -> ApiResult<Vec<HubAttachment>>;

    async fn describe_hub_route_tables(&self, router_id: &str) -> ApiResult<Vec<HubRouteTable>>;

    async fn describe_peering_connections(&self) -> ApiResult<Vec<PeeringConnection>>;

    async fn describe_vpn_connections(&self) -> ApiResult<Vec<VpnConnection>>;

    async fn describe_vpc_endpoints(&self) -> ApiResult<Vec<VpcEndpoint>>;

    /// Interfaces, optionally restricted to one VPC
    async fn describe_network_interfaces(&self, vpc_id: Option<&str>) -> ApiResult<Vec<NetworkInterface>>;

    async fn describe_security_groups(&self, vpc_id: &str) -> ApiResult<Vec<SecurityGroup>>;

    /// Accepted flows originating in `query.vpc_id`
    async fn query_flow_records(&self, query: &FlowQuery) -> ApiResult<Vec<FlowRecord>>;

    async fn describe_insights_paths(&self) -> ApiResult<Vec<InsightsPath>>;

    /// Fails with [`ApiError::Conflict`] when the tuple already exists
    async fn create_insights_path(&self, spec: &PathSpec) -> ApiResult<InsightsPath>;

    /// Returns the analysis id
    async fn start_analysis(&self, path_id: &str) -> ApiResult<String>;

    async fn describe_analysis(&self, analysis_id: &str) -> ApiResult<InsightsAnalysis>;

    async fn delete_analysis(&self, analysis_id: &str) -> ApiResult<()>;
}

/// EC2 resource ARN
pub fn resource_arn(region: &str, owner_id: &str, resource_type: &str, id: &str) -> String {
    format!("arn:aws:ec2:{}:{}:{}/{}", region, owner_id, resource_type, id)
}

/// IPv4 CIDR containment; "0.0.0.0/0" contains everything
pub fn cidr_contains(cidr: &str, addr: &str) -> bool {
    let Some((network, len)) = parse_cidr(cidr) else {
        return false;
    };
    let Ok(addr) = addr.parse::<Ipv4Addr>() else {
        return false;
    };
    let mask = prefix_mask(len);
    (u32::from(addr) & mask) == (network & mask)
}

/// Whether `outer` covers every address of `inner`
pub fn cidr_covers(outer: &str, inner: &str) -> bool {
    match (parse_cidr(outer), parse_cidr(inner)) {
        (Some((o_net, o_len)), Some((i_net, i_len))) => {
            o_len <= i_len && (i_net & prefix_mask(o_len)) == (o_net & prefix_mask(o_len))
        }
        _ => false,
    }
}

fn parse_cidr(cidr: &str) -> Option<(u32, u32)> {
    let (addr, len) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u32 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    Some((u32::from(addr), len))
}

fn prefix_mask(len: u32) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len)
    }
}
