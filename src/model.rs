//! Connectivity Model Builder
//!
//! Merges observations from every account into one deduplicated, ordered set
//! of [`ConnectivityPattern`]s.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::error::PartialDiscoveryWarning;
use crate::types::{
    Account, ConnectionDetail, ConnectionKind, ConnectivityObservation, ConnectivityPattern,
    Directionality, PatternKey, TrafficSample,
};

/// Output of [`ModelBuilder::build`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectivityModel {
    pub patterns: Vec<ConnectivityPattern>,
    /// Observations dropped because they reference accounts outside the run
    pub warnings: Vec<PartialDiscoveryWarning>,
}

impl ConnectivityModel {
    pub fn counts_by_kind(&self) -> BTreeMap<ConnectionKind, usize> {
        count_by_kind(&self.patterns)
    }
}

pub fn count_by_kind(patterns: &[ConnectivityPattern]) -> BTreeMap<ConnectionKind, usize> {
    let mut counts = BTreeMap::new();
    for pattern in patterns {
        *counts.entry(pattern.kind).or_insert(0) += 1;
    }
    counts
}

pub struct ModelBuilder {
    active_accounts: BTreeSet<String>,
}

impl ModelBuilder {
    pub fn new(accounts: &[Account]) -> Self {
        Self {
            active_accounts: accounts.iter().map(|a| a.account_id.clone()).collect(),
        }
    }

    pub fn build(&self, observations: &[ConnectivityObservation]) -> ConnectivityModel {
        let mut warnings = Vec::new();
        let mut groups: BTreeMap<PatternKey, Vec<&ConnectivityObservation>> = BTreeMap::new();

        for observation in observations {
            if let Some(unknown) = self.unknown_account(observation) {
                let key = observation.key();
                warn!(account_id = %unknown, pattern = %key, "Dropping pattern for account outside the run");
                let warning = PartialDiscoveryWarning::new(
                    unknown,
                    "model",
                    format!("pattern {} references an account not in the active set", key),
                );
                if !warnings.contains(&warning) {
                    warnings.push(warning);
                }
                continue;
            }
            groups.entry(observation.key()).or_default().push(observation);
        }

        let mut patterns: Vec<ConnectivityPattern> = groups
            .into_iter()
            .filter_map(|(key, group)| merge_group(key, group))
            .collect();

        patterns.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.source.account_id().unwrap_or("").cmp(b.source.account_id().unwrap_or("")))
                .then_with(|| {
                    a.destination
                        .account_id()
                        .unwrap_or("")
                        .cmp(b.destination.account_id().unwrap_or(""))
                })
                .then_with(|| a.key.cmp(&b.key))
        });

        debug!(
            observations = observations.len(),
            patterns = patterns.len(),
            dropped = warnings.len(),
            "Connectivity model built"
        );
        ConnectivityModel { patterns, warnings }
    }

    fn unknown_account<'a>(&self, observation: &'a ConnectivityObservation) -> Option<&'a str> {
        [&observation.source, &observation.destination]
            .into_iter()
            .filter_map(|endpoint| endpoint.account_id())
            .find(|id| !self.active_accounts.contains(*id))
    }
}

fn merge_group(key: PatternKey, mut group: Vec<&ConnectivityObservation>) -> Option<ConnectivityPattern> {
    // Stable order independent of the order accounts finished in
    group.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.observed_by.cmp(&b.observed_by))
            .then_with(|| a.source.cmp(&b.source))
    });

    // The observation oriented like the key supplies endpoints and detail
    let representative = group
        .iter()
        .find(|o| o.source.key_token() == key.source_vpc)
        .or_else(|| group.first())
        .copied()?;

    let directionality = if key.kind == ConnectionKind::Peered {
        Directionality::Both
    } else {
        group
            .iter()
            .map(|o| o.directionality)
            .fold(Directionality::Unknown, Directionality::merge)
    };

    let traffic = group
        .iter()
        .filter_map(|o| o.traffic.as_ref())
        .fold(None, |acc: Option<TrafficSample>, sample| {
            let mut merged = acc.unwrap_or_default();
            merged.merge(sample);
            Some(merged)
        });

    let use_case = group
        .iter()
        .filter_map(|o| o.use_case.as_deref())
        .find(|tag| !tag.is_empty())
        .map(str::to_string);

    // Unknown only when no observation could read its rules
    let ports_allowed = group
        .iter()
        .filter_map(|o| o.ports_allowed.as_ref())
        .fold(None, |acc: Option<BTreeSet<u16>>, ports| {
            let mut merged = acc.unwrap_or_default();
            merged.extend(ports.iter().copied());
            Some(merged)
        });

    let detail = representative.detail.clone();
    let expected_reachable = expected_reachable(representative.kind, directionality, &detail);

    Some(ConnectivityPattern {
        key,
        source: representative.source.clone(),
        destination: representative.destination.clone(),
        kind: representative.kind,
        connection_id: representative.connection_id.clone(),
        directionality,
        detail,
        traffic,
        ports_allowed,
        use_case,
        expected_reachable,
    })
}

/// Whether verification should expect the connection to work
pub fn expected_reachable(kind: ConnectionKind, directionality: Directionality, detail: &ConnectionDetail) -> bool {
    match (kind, detail) {
        (ConnectionKind::HubRouted, _) => directionality == Directionality::Both,
        (_, ConnectionDetail::Peering { status }) => status == "active",
        (_, ConnectionDetail::Tunnel { state, .. }) => state == "available",
        (_, ConnectionDetail::Endpoint { state, .. }) => state == "available",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;

    fn observation(
        kind: ConnectionKind,
        source: Endpoint,
        destination: Endpoint,
        connection_id: &str,
        observed_by: &str,
    ) -> ConnectivityObservation {
        let detail = match kind {
            ConnectionKind::HubRouted => ConnectionDetail::Routed,
            ConnectionKind::Peered => ConnectionDetail::Peering {
                status: "active".into(),
            },
            ConnectionKind::Tunneled => ConnectionDetail::Tunnel {
                state: "available".into(),
                tunnels: Vec::new(),
            },
            ConnectionKind::PrivateEndpoint => ConnectionDetail::Endpoint {
                state: "available".into(),
                service_name: "svc".into(),
                interfaces: Vec::new(),
            },
        };
        ConnectivityObservation {
            source,
            destination,
            kind,
            connection_id: connection_id.into(),
            directionality: Directionality::Both,
            detail,
            traffic: None,
            ports_allowed: None,
            use_case: None,
            observed_by: observed_by.into(),
        }
    }

    fn traffic(ports: &[u16]) -> TrafficSample {
        TrafficSample {
            protocols: ["tcp".to_string()].into_iter().collect(),
            ports: ports.iter().copied().collect(),
            bytes: 100,
            packets: 10,
        }
    }

    fn accounts() -> Vec<Account> {
        ["1", "2", "3"]
            .iter()
            .map(|id| Account::new(id, id, "us-east-1"))
            .collect()
    }

    fn sample_observations() -> Vec<ConnectivityObservation> {
        let a = Endpoint::vpc("1", "vpc-a");
        let b = Endpoint::vpc("2", "vpc-b");
        let c = Endpoint::vpc("3", "vpc-c");

        let mut forward = observation(ConnectionKind::Peered, b.clone(), c.clone(), "pcx-1", "2");
        forward.traffic = Some(traffic(&[3306]));
        forward.use_case = Some("database-backup".into());
        let mut reverse = observation(ConnectionKind::Peered, c.clone(), b.clone(), "pcx-1", "3");
        reverse.traffic = Some(traffic(&[5432]));
        reverse.use_case = Some("database-backup".into());

        vec![
            observation(ConnectionKind::Tunneled, a.clone(), Endpoint::external("cgw-1"), "vpn-1", "1"),
            forward,
            observation(ConnectionKind::HubRouted, b.clone(), a.clone(), "tgw-1", "2"),
            reverse,
            observation(ConnectionKind::HubRouted, c.clone(), a.clone(), "tgw-1", "3"),
            observation(ConnectionKind::HubRouted, b, a, "tgw-1", "1"),
        ]
    }

    #[test]
    fn test_keys_are_unique_after_merge() {
        let model = ModelBuilder::new(&accounts()).build(&sample_observations());
        let keys: BTreeSet<_> = model.patterns.iter().map(|p| p.key.clone()).collect();
        assert_eq!(keys.len(), model.patterns.len());
        assert_eq!(model.patterns.len(), 4);
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = ModelBuilder::new(&accounts());
        let observations = sample_observations();
        let mut reversed = observations.clone();
        reversed.reverse();

        let first = serde_json::to_string(&builder.build(&observations).patterns).unwrap();
        let second = serde_json::to_string(&builder.build(&observations).patterns).unwrap();
        let shuffled = serde_json::to_string(&builder.build(&reversed).patterns).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, shuffled);
    }

    #[test]
    fn test_ordering_by_kind_then_accounts() {
        let model = ModelBuilder::new(&accounts()).build(&sample_observations());
        let order: Vec<_> = model
            .patterns
            .iter()
            .map(|p| (p.kind, p.source.account_id().unwrap_or("").to_string()))
            .collect();
        assert_eq!(
            order,
            vec![
                (ConnectionKind::HubRouted, "2".to_string()),
                (ConnectionKind::HubRouted, "3".to_string()),
                (ConnectionKind::Peered, "2".to_string()),
                (ConnectionKind::Tunneled, "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_peering_merges_traffic_from_both_directions() {
        let model = ModelBuilder::new(&accounts()).build(&sample_observations());
        let peering = model
            .patterns
            .iter()
            .find(|p| p.kind == ConnectionKind::Peered)
            .unwrap();

        assert_eq!(peering.use_case.as_deref(), Some("database-backup"));
        assert_eq!(peering.observed_ports(), vec![3306, 5432]);
        assert_eq!(peering.source, Endpoint::vpc("2", "vpc-b"));
        assert_eq!(peering.directionality, Directionality::Both);
        assert!(peering.expected_reachable);
    }

    #[test]
    fn test_unknown_accounts_are_dropped_with_warning() {
        let mut observations = sample_observations();
        observations.push(observation(
            ConnectionKind::Peered,
            Endpoint::vpc("1", "vpc-a"),
            Endpoint::vpc("9", "vpc-future"),
            "pcx-9",
            "1",
        ));

        let model = ModelBuilder::new(&accounts()).build(&observations);
        assert!(model.patterns.iter().all(|p| p.connection_id != "pcx-9"));
        assert_eq!(model.warnings.len(), 1);
        assert_eq!(model.warnings[0].account_id, "9");
        assert!(model.patterns.iter().any(|p| p.kind == ConnectionKind::Tunneled));
    }

    #[test]
    fn test_use_case_tie_break_prefers_first_observer() {
        let a = Endpoint::vpc("1", "vpc-a");
        let b = Endpoint::vpc("2", "vpc-b");
        let mut from_two = observation(ConnectionKind::Peered, b.clone(), a.clone(), "pcx-1", "2");
        from_two.use_case = Some("replication".into());
        let mut from_one = observation(ConnectionKind::Peered, a, b, "pcx-1", "1");
        from_one.use_case = Some("backup".into());
        let untagged = {
            let mut o = from_two.clone();
            o.use_case = Some(String::new());
            o.observed_by = "0".into();
            o
        };

        let model = ModelBuilder::new(&accounts()).build(&[from_two, untagged, from_one]);
        assert_eq!(model.patterns.len(), 1);
        assert_eq!(model.patterns[0].use_case.as_deref(), Some("backup"));
    }

    #[test]
    fn test_expected_reachability_rules() {
        assert!(!expected_reachable(
            ConnectionKind::HubRouted,
            Directionality::SourceToDest,
            &ConnectionDetail::Routed
        ));
        assert!(!expected_reachable(
            ConnectionKind::Peered,
            Directionality::Both,
            &ConnectionDetail::Peering {
                status: "pending-acceptance".into()
            }
        ));
        assert!(expected_reachable(
            ConnectionKind::Tunneled,
            Directionality::Both,
            &ConnectionDetail::Tunnel {
                state: "available".into(),
                tunnels: Vec::new()
            }
        ));
    }

    #[test]
    fn test_hub_directionality_merges_across_observers() {
        let a = Endpoint::vpc("1", "vpc-a");
        let b = Endpoint::vpc("2", "vpc-b");
        let mut forward = observation(ConnectionKind::HubRouted, b.clone(), a.clone(), "tgw-1", "2");
        forward.directionality = Directionality::SourceToDest;
        let mut reverse = observation(ConnectionKind::HubRouted, b, a, "tgw-1", "1");
        reverse.directionality = Directionality::DestToSource;

        let model = ModelBuilder::new(&accounts()).build(&[forward, reverse]);
        assert_eq!(model.patterns[0].directionality, Directionality::Both);
        assert!(model.patterns[0].expected_reachable);
    }

    #[test]
    fn test_allowed_ports_union_and_stay_unknown_when_unread() {
        let a = Endpoint::vpc("1", "vpc-a");
        let b = Endpoint::vpc("2", "vpc-b");
        let mut forward = observation(ConnectionKind::Peered, a.clone(), b.clone(), "pcx-1", "1");
        forward.ports_allowed = Some([5432].into_iter().collect());
        let mut reverse = observation(ConnectionKind::Peered, b.clone(), a.clone(), "pcx-1", "2");
        reverse.ports_allowed = Some([443].into_iter().collect());
        let unread = observation(ConnectionKind::Peered, b, a, "pcx-1", "2");

        let model = ModelBuilder::new(&accounts()).build(&[forward, reverse, unread.clone()]);
        assert_eq!(model.patterns[0].allowed_ports(), vec![443, 5432]);

        let model = ModelBuilder::new(&accounts()).build(&[unread]);
        assert_eq!(model.patterns[0].ports_allowed, None);
    }
}
