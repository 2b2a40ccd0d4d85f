//! Connectivity Model Types
//!
//! Core types shared by discovery, the golden path store and verification.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Account taking part in a run. Provided by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    /// Opaque account identifier (usually the 12-digit id)
    pub account_id: String,
    /// Human name
    pub name: String,
    /// Region the account's network lives in
    pub region: String,
    /// Known VPC id; auto-detected when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    /// Known hub router id; auto-detected when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_router_id: Option<String>,
}

impl Account {
    pub fn new(account_id: &str, name: &str, region: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            name: name.to_string(),
            region: region.to_string(),
            vpc_id: None,
            hub_router_id: None,
        }
    }

    pub fn with_vpc(mut self, vpc_id: &str) -> Self {
        self.vpc_id = Some(vpc_id.to_string());
        self
    }

    pub fn with_hub_router(mut self, router_id: &str) -> Self {
        self.hub_router_id = Some(router_id.to_string());
        self
    }
}

/// Network connection mechanism.
///
/// Declaration order is the use-case tie-break priority used when merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionKind {
    HubRouted,
    Peered,
    Tunneled,
    PrivateEndpoint,
}

impl ConnectionKind {
    pub const ALL: [ConnectionKind; 4] = [
        ConnectionKind::HubRouted,
        ConnectionKind::Peered,
        ConnectionKind::Tunneled,
        ConnectionKind::PrivateEndpoint,
    ];

    /// Short resource-style code used in test names
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionKind::HubRouted => "tgw",
            ConnectionKind::Peered => "pcx",
            ConnectionKind::Tunneled => "vpn",
            ConnectionKind::PrivateEndpoint => "vpce",
        }
    }

    /// Whether verification runs a path analysis for this kind
    pub fn uses_path_analysis(&self) -> bool {
        matches!(self, ConnectionKind::HubRouted | ConnectionKind::Peered)
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::HubRouted => write!(f, "HUB_ROUTED"),
            ConnectionKind::Peered => write!(f, "PEERED"),
            ConnectionKind::Tunneled => write!(f, "TUNNELED"),
            ConnectionKind::PrivateEndpoint => write!(f, "PRIVATE_ENDPOINT"),
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "hub_routed" | "hub" | "tgw" => Ok(ConnectionKind::HubRouted),
            "peered" | "peering" | "pcx" => Ok(ConnectionKind::Peered),
            "tunneled" | "tunnel" | "vpn" => Ok(ConnectionKind::Tunneled),
            "private_endpoint" | "privatelink" | "vpce" => Ok(ConnectionKind::PrivateEndpoint),
            other => Err(format!("unknown connection kind: {}", other)),
        }
    }
}

/// One side of a connection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// A VPC owned by an account
    Vpc { account_id: String, vpc_id: String },
    /// Something outside the account set (on-premises network, endpoint service)
    External { name: String },
}

impl Endpoint {
    pub fn vpc(account_id: &str, vpc_id: &str) -> Self {
        Endpoint::Vpc {
            account_id: account_id.to_string(),
            vpc_id: vpc_id.to_string(),
        }
    }

    pub fn external(name: &str) -> Self {
        Endpoint::External {
            name: name.to_string(),
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        match self {
            Endpoint::Vpc { account_id, .. } => Some(account_id),
            Endpoint::External { .. } => None,
        }
    }

    pub fn vpc_id(&self) -> Option<&str> {
        match self {
            Endpoint::Vpc { vpc_id, .. } => Some(vpc_id),
            Endpoint::External { .. } => None,
        }
    }

    /// Token used in the pattern identity key
    pub fn key_token(&self) -> String {
        match self {
            Endpoint::Vpc { vpc_id, .. } => vpc_id.clone(),
            Endpoint::External { name } => format!("external:{}", name),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Vpc { account_id, vpc_id } => write!(f, "{}/{}", account_id, vpc_id),
            Endpoint::External { name } => write!(f, "{}", name),
        }
    }
}

/// Which way routing evidence was found between source and destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directionality {
    SourceToDest,
    DestToSource,
    Both,
    /// Recorded by an older schema that did not capture direction
    Unknown,
}

impl Directionality {
    /// Combine evidence from two observations of the same connection
    pub fn merge(self, other: Directionality) -> Directionality {
        use Directionality::*;
        match (self, other) {
            (Unknown, x) | (x, Unknown) => x,
            (a, b) if a == b => a,
            _ => Both,
        }
    }

    pub fn from_evidence(forward: bool, reverse: bool) -> Option<Directionality> {
        match (forward, reverse) {
            (true, true) => Some(Directionality::Both),
            (true, false) => Some(Directionality::SourceToDest),
            (false, true) => Some(Directionality::DestToSource),
            (false, false) => None,
        }
    }
}

/// Traffic observed between two endpoints over the flow-log window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub protocols: BTreeSet<String>,
    pub ports: BTreeSet<u16>,
    pub bytes: u64,
    pub packets: u64,
}

impl TrafficSample {
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty() && self.ports.is_empty() && self.packets == 0
    }

    /// Union of protocols/ports, sum of counters
    pub fn merge(&mut self, other: &TrafficSample) {
        self.protocols.extend(other.protocols.iter().cloned());
        self.ports.extend(other.ports.iter().copied());
        self.bytes = self.bytes.saturating_add(other.bytes);
        self.packets = self.packets.saturating_add(other.packets);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHealth {
    /// Tunnel outside address
    pub endpoint: String,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceHealth {
    pub interface_id: String,
    pub healthy: bool,
}

/// Kind-specific facts captured at discovery time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum ConnectionDetail {
    /// Routed through the hub router
    Routed,
    Peering {
        status: String,
    },
    Tunnel {
        state: String,
        tunnels: Vec<TunnelHealth>,
    },
    Endpoint {
        state: String,
        service_name: String,
        interfaces: Vec<InterfaceHealth>,
    },
    /// Recorded by an older schema
    Unknown,
}

/// One discovered edge before merging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityObservation {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub kind: ConnectionKind,
    pub connection_id: String,
    pub directionality: Directionality,
    pub detail: ConnectionDetail,
    pub traffic: Option<TrafficSample>,
    /// Ports security groups admit from source to destination; None when
    /// the rules could not be read
    pub ports_allowed: Option<BTreeSet<u16>>,
    pub use_case: Option<String>,
    /// Account whose API produced this observation
    pub observed_by: String,
}

impl ConnectivityObservation {
    pub fn key(&self) -> PatternKey {
        PatternKey::new(&self.source, &self.destination, self.kind, &self.connection_id)
    }
}

/// Stable identity of a connectivity pattern.
///
/// For peered connections the two VPC tokens are stored in sorted order so
/// both directions of the same peering map to one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatternKey {
    pub source_vpc: String,
    pub dest_vpc: String,
    pub kind: ConnectionKind,
    pub connection_id: String,
}

impl PatternKey {
    pub fn new(
        source: &Endpoint,
        destination: &Endpoint,
        kind: ConnectionKind,
        connection_id: &str,
    ) -> Self {
        let mut source_vpc = source.key_token();
        let mut dest_vpc = destination.key_token();
        if kind == ConnectionKind::Peered && dest_vpc < source_vpc {
            std::mem::swap(&mut source_vpc, &mut dest_vpc);
        }
        Self {
            source_vpc,
            dest_vpc,
            kind,
            connection_id: connection_id.to_string(),
        }
    }
}

impl std::fmt::Display for PatternKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}->{}",
            self.kind.code(),
            self.connection_id,
            self.source_vpc,
            self.dest_vpc
        )
    }
}

/// Canonical merged unit stored in the golden path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityPattern {
    pub key: PatternKey,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub kind: ConnectionKind,
    pub connection_id: String,
    pub directionality: Directionality,
    pub detail: ConnectionDetail,
    pub traffic: Option<TrafficSample>,
    /// None when never discovered (older baselines, unreadable rules)
    pub ports_allowed: Option<BTreeSet<u16>>,
    pub use_case: Option<String>,
    pub expected_reachable: bool,
}

impl ConnectivityPattern {
    pub fn has_traffic(&self) -> bool {
        self.traffic.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
    }

    pub fn observed_ports(&self) -> Vec<u16> {
        self.traffic
            .as_ref()
            .map(|t| t.ports.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn allowed_ports(&self) -> Vec<u16> {
        self.ports_allowed
            .as_ref()
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Human label used in result names and logs
    pub fn label(&self) -> String {
        format!("{} -> {}", self.source, self.destination)
    }
}

/// Verification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pass,
    Fail,
    Warn,
    Skip,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail => write!(f, "FAIL"),
            Outcome::Warn => write!(f, "WARN"),
            Outcome::Skip => write!(f, "SKIP"),
        }
    }
}

/// Result of verifying one check of one pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub key: PatternKey,
    /// Test name, e.g. "pcx-tcp:3306 reverse"
    pub name: String,
    pub outcome: Outcome,
    pub message: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl VerificationResult {
    pub fn new(key: &PatternKey, name: &str, outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            name: name.to_string(),
            outcome,
            message: message.into(),
            duration_ms: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_duration(mut self, elapsed: std::time::Duration) -> Self {
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Run phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Discover,
    PreRelease,
    PostRelease,
}

impl Phase {
    /// Path-friendly name
    pub fn slug(&self) -> &'static str {
        match self {
            Phase::Discover => "discover",
            Phase::PreRelease => "pre-release",
            Phase::PostRelease => "post-release",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peered_key_is_direction_independent() {
        let a = Endpoint::vpc("111111111111", "vpc-aaa");
        let b = Endpoint::vpc("222222222222", "vpc-bbb");

        let forward = PatternKey::new(&a, &b, ConnectionKind::Peered, "pcx-1");
        let reverse = PatternKey::new(&b, &a, ConnectionKind::Peered, "pcx-1");
        assert_eq!(forward, reverse);

        let routed_forward = PatternKey::new(&a, &b, ConnectionKind::HubRouted, "tgw-1");
        let routed_reverse = PatternKey::new(&b, &a, ConnectionKind::HubRouted, "tgw-1");
        assert_ne!(routed_forward, routed_reverse);
    }

    #[test]
    fn test_kind_priority_order() {
        assert!(ConnectionKind::HubRouted < ConnectionKind::Peered);
        assert!(ConnectionKind::Peered < ConnectionKind::Tunneled);
        assert!(ConnectionKind::Tunneled < ConnectionKind::PrivateEndpoint);
    }

    #[test]
    fn test_kind_parsing_aliases() {
        assert_eq!("tgw".parse::<ConnectionKind>(), Ok(ConnectionKind::HubRouted));
        assert_eq!("peering".parse::<ConnectionKind>(), Ok(ConnectionKind::Peered));
        assert_eq!("PRIVATE_ENDPOINT".parse::<ConnectionKind>(), Ok(ConnectionKind::PrivateEndpoint));
        assert!("satellite".parse::<ConnectionKind>().is_err());
    }

    #[test]
    fn test_directionality_merge() {
        use Directionality::*;
        assert_eq!(SourceToDest.merge(DestToSource), Both);
        assert_eq!(SourceToDest.merge(SourceToDest), SourceToDest);
        assert_eq!(Unknown.merge(DestToSource), DestToSource);
    }

    #[test]
    fn test_traffic_merge_unions_ports() {
        let mut a = TrafficSample {
            protocols: ["tcp".to_string()].into_iter().collect(),
            ports: [3306].into_iter().collect(),
            bytes: 10,
            packets: 1,
        };
        let b = TrafficSample {
            protocols: ["tcp".to_string()].into_iter().collect(),
            ports: [5432].into_iter().collect(),
            bytes: 5,
            packets: 2,
        };
        a.merge(&b);
        assert_eq!(a.ports.iter().copied().collect::<Vec<_>>(), vec![3306, 5432]);
        assert_eq!(a.bytes, 15);
        assert_eq!(a.packets, 3);
    }
}
