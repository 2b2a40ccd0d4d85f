//! Golden path document, assertions and baseline diff

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::discovery::{DiscoveryOutput, VpcFacts};
use crate::error::PartialDiscoveryWarning;
use crate::model::{count_by_kind, ConnectivityModel};
use crate::types::{Account, ConnectionKind, ConnectivityPattern, PatternKey};

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 3;

/// Structural invariant that held for every discovered VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "assertion", rename_all = "snake_case")]
pub enum Assertion {
    DnsSupportEnabled,
    DnsHostnamesEnabled,
    MinSubnets { count: u32 },
    HubAttachmentRequired { router_id: String },
}

impl Assertion {
    pub fn holds(&self, vpc: &VpcFacts) -> bool {
        match self {
            Assertion::DnsSupportEnabled => vpc.dns_support,
            Assertion::DnsHostnamesEnabled => vpc.dns_hostnames,
            Assertion::MinSubnets { count } => vpc.subnet_count >= *count,
            Assertion::HubAttachmentRequired { router_id } => {
                vpc.hub_router_id.as_deref() == Some(router_id.as_str())
            }
        }
    }
}

impl std::fmt::Display for Assertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Assertion::DnsSupportEnabled => write!(f, "DNS resolution enabled"),
            Assertion::DnsHostnamesEnabled => write!(f, "DNS hostnames enabled"),
            Assertion::MinSubnets { count } => write!(f, "at least {} subnets", count),
            Assertion::HubAttachmentRequired { router_id } => write!(f, "attached to hub router {}", router_id),
        }
    }
}

/// Assertions that hold across every VPC in `vpcs`
pub fn derive_assertions(vpcs: &[VpcFacts], hub_router_id: Option<&str>) -> Vec<Assertion> {
    if vpcs.is_empty() {
        return Vec::new();
    }

    let mut candidates = vec![Assertion::DnsSupportEnabled, Assertion::DnsHostnamesEnabled];
    if let Some(count) = vpcs.iter().map(|v| v.subnet_count).min().filter(|c| *c > 0) {
        candidates.push(Assertion::MinSubnets { count });
    }
    if let Some(router_id) = hub_router_id {
        candidates.push(Assertion::HubAttachmentRequired {
            router_id: router_id.to_string(),
        });
    }

    candidates
        .into_iter()
        .filter(|assertion| vpcs.iter().all(|vpc| assertion.holds(vpc)))
        .collect()
}

/// Pattern counts stored alongside the patterns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub total: usize,
    pub by_kind: BTreeMap<ConnectionKind, usize>,
    /// Patterns with observed traffic
    pub active_paths: usize,
}

impl PatternSummary {
    pub fn of(patterns: &[ConnectivityPattern]) -> Self {
        Self {
            total: patterns.len(),
            by_kind: count_by_kind(patterns),
            active_paths: patterns.iter().filter(|p| p.has_traffic()).count(),
        }
    }
}

/// Persisted baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenPath {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub accounts: Vec<Account>,
    pub hub_router_id: Option<String>,
    pub assertions: Vec<Assertion>,
    pub patterns: Vec<ConnectivityPattern>,
    #[serde(default)]
    pub summary: PatternSummary,
    /// Discovery warnings recorded when this baseline was captured
    pub warnings: Vec<PartialDiscoveryWarning>,
}

impl GoldenPath {
    pub fn new(accounts: &[Account], discovery: &DiscoveryOutput, model: ConnectivityModel) -> Self {
        let assertions = derive_assertions(&discovery.vpcs, discovery.hub_router_id.as_deref());
        let summary = PatternSummary::of(&model.patterns);

        let mut warnings = discovery.warnings.clone();
        warnings.extend(model.warnings);

        Self {
            schema_version: SCHEMA_VERSION,
            generated_at: Utc::now(),
            accounts: accounts.to_vec(),
            hub_router_id: discovery.hub_router_id.clone(),
            assertions,
            patterns: model.patterns,
            summary,
            warnings,
        }
    }

    pub fn pattern(&self, key: &PatternKey) -> Option<&ConnectivityPattern> {
        self.patterns.iter().find(|p| &p.key == key)
    }

    /// Assertions of this baseline broken by freshly discovered VPC facts
    pub fn violations(&self, vpcs: &[VpcFacts]) -> Vec<(String, Assertion)> {
        vpcs.iter()
            .flat_map(|vpc| {
                self.assertions
                    .iter()
                    .filter(|a| !a.holds(vpc))
                    .map(|a| (vpc.vpc_id.clone(), a.clone()))
            })
            .collect()
    }

    /// Pattern-level drift from this baseline to `newer`
    pub fn diff(&self, newer: &GoldenPath) -> GoldenPathDiff {
        let old: BTreeMap<&PatternKey, &ConnectivityPattern> =
            self.patterns.iter().map(|p| (&p.key, p)).collect();
        let new: BTreeMap<&PatternKey, &ConnectivityPattern> =
            newer.patterns.iter().map(|p| (&p.key, p)).collect();

        let mut diff = GoldenPathDiff::default();
        for (key, pattern) in &new {
            match old.get(key) {
                None => diff.added.push((*key).clone()),
                Some(previous) if materially_differs(previous, pattern) => diff.changed.push((*key).clone()),
                Some(_) => {}
            }
        }
        diff.removed = old
            .keys()
            .filter(|key| !new.contains_key(*key))
            .map(|key| (*key).clone())
            .collect();
        diff
    }
}

/// Traffic volumes change every run; only the observed port set counts
fn materially_differs(a: &ConnectivityPattern, b: &ConnectivityPattern) -> bool {
    let ports = |p: &ConnectivityPattern| -> BTreeSet<u16> { p.observed_ports().into_iter().collect() };
    a.directionality != b.directionality
        || a.detail != b.detail
        || a.expected_reachable != b.expected_reachable
        || a.use_case != b.use_case
        || ports(a) != ports(b)
        || a.ports_allowed != b.ports_allowed
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GoldenPathDiff {
    pub added: Vec<PatternKey>,
    pub removed: Vec<PatternKey>,
    pub changed: Vec<PatternKey>,
}

impl GoldenPathDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}
