//! Which checks a stored pattern is verified with

use std::collections::BTreeSet;

use crate::types::{ConnectionKind, ConnectivityPattern, Directionality};

/// Protocol value meaning "any protocol" in a path analysis
pub const ANY_PROTOCOL: &str = "-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckDirection {
    /// Pattern source towards pattern destination
    Forward,
    Reverse,
}

/// What a single check covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckTarget {
    /// Path analysis between the two endpoints
    Path {
        direction: CheckDirection,
        protocol: String,
        port: Option<u16>,
    },
    /// Live tunnel telemetry
    TunnelStatus,
    /// Live endpoint and interface state
    EndpointStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Result name, e.g. `pcx-tcp:3306 (reverse)`
    pub name: String,
    pub target: CheckTarget,
}

impl Check {
    fn path(kind: ConnectionKind, direction: CheckDirection, port: Option<u16>) -> Self {
        let (protocol, label) = match port {
            Some(port) => ("tcp".to_string(), format!("tcp:{}", port)),
            None => (ANY_PROTOCOL.to_string(), "any:all".to_string()),
        };
        let name = match direction {
            CheckDirection::Forward => format!("{}-{}", kind.code(), label),
            CheckDirection::Reverse => format!("{}-{} (reverse)", kind.code(), label),
        };
        Self {
            name,
            target: CheckTarget::Path {
                direction,
                protocol,
                port,
            },
        }
    }
}

/// Checks for `pattern`: one protocol-level path per direction plus one per
/// port. Peered patterns are checkd both ways; hub routes both ways when
/// routing was seen in both directions, otherwise spoke towards hub.
///
/// Ports are the ones security groups admit when known, otherwise the ones
/// observed in flow logs. `extra_ports` are tested ad hoc; the pattern
/// itself is never modified.
pub fn plan_checks(pattern: &ConnectivityPattern, extra_ports: &[u16]) -> Vec<Check> {
    let directions: &[CheckDirection] = match pattern.kind {
        ConnectionKind::HubRouted if pattern.directionality == Directionality::Both => {
            &[CheckDirection::Forward, CheckDirection::Reverse]
        }
        ConnectionKind::HubRouted => &[CheckDirection::Forward],
        ConnectionKind::Peered => &[CheckDirection::Forward, CheckDirection::Reverse],
        ConnectionKind::Tunneled => {
            return vec![Check {
                name: "vpn-tunnel-status".to_string(),
                target: CheckTarget::TunnelStatus,
            }]
        }
        ConnectionKind::PrivateEndpoint => {
            return vec![Check {
                name: "vpce-endpoint-status".to_string(),
                target: CheckTarget::EndpointStatus,
            }]
        }
    };

    let allowed = pattern.allowed_ports();
    let base = if allowed.is_empty() {
        pattern.observed_ports()
    } else {
        allowed
    };
    let ports: BTreeSet<u16> = base.into_iter().chain(extra_ports.iter().copied()).collect();

    directions
        .iter()
        .flat_map(|direction| {
            std::iter::once(Check::path(pattern.kind, *direction, None))
                .chain(ports.iter().map(|port| Check::path(pattern.kind, *direction, Some(*port))))
        })
        .collect()
}

/// Narrows which stored patterns a verification phase tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyFilter {
    /// Empty means every kind
    pub kinds: BTreeSet<ConnectionKind>,
    pub only_with_traffic: bool,
    pub extra_ports: Vec<u16>,
}

impl VerifyFilter {
    pub fn admits(&self, pattern: &ConnectivityPattern) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&pattern.kind) {
            return false;
        }
        !self.only_with_traffic || pattern.has_traffic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::golden_path::tests::peering;

    fn names(checks: &[Check]) -> Vec<&str> {
        checks.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_peering_checks_both_directions_per_port() {
        let checks = plan_checks(&peering("pcx-1", &[5432, 3306]), &[]);
        assert_eq!(
            names(&checks),
            vec![
                "pcx-any:all",
                "pcx-tcp:3306",
                "pcx-tcp:5432",
                "pcx-any:all (reverse)",
                "pcx-tcp:3306 (reverse)",
                "pcx-tcp:5432 (reverse)",
            ]
        );
    }

    #[test]
    fn test_one_way_hub_checks_forward_only_with_ad_hoc_ports() {
        let mut pattern = peering("tgw-1", &[443]);
        pattern.kind = ConnectionKind::HubRouted;
        pattern.directionality = Directionality::SourceToDest;
        let checks = plan_checks(&pattern, &[22, 443]);

        assert_eq!(names(&checks), vec!["tgw-any:all", "tgw-tcp:22", "tgw-tcp:443"]);
        assert_eq!(pattern.observed_ports(), vec![443]);
    }

    #[test]
    fn test_two_way_hub_checks_both_directions() {
        let mut pattern = peering("tgw-1", &[443]);
        pattern.kind = ConnectionKind::HubRouted;
        assert_eq!(pattern.directionality, Directionality::Both);

        assert_eq!(
            names(&plan_checks(&pattern, &[])),
            vec![
                "tgw-any:all",
                "tgw-tcp:443",
                "tgw-any:all (reverse)",
                "tgw-tcp:443 (reverse)",
            ]
        );
    }

    #[test]
    fn test_allowed_ports_take_precedence_over_observed() {
        let mut pattern = peering("pcx-1", &[8080]);
        pattern.ports_allowed = Some([5432].into_iter().collect());
        let checks = plan_checks(&pattern, &[22]);
        assert_eq!(
            names(&checks)[..3],
            ["pcx-any:all", "pcx-tcp:22", "pcx-tcp:5432"]
        );

        // Known but empty falls back to flow logs
        pattern.ports_allowed = Some(BTreeSet::new());
        assert_eq!(names(&plan_checks(&pattern, &[]))[..2], ["pcx-any:all", "pcx-tcp:8080"]);
    }

    #[test]
    fn test_status_kinds_get_single_check() {
        let mut pattern = peering("vpn-1", &[]);
        pattern.kind = ConnectionKind::Tunneled;
        assert_eq!(plan_checks(&pattern, &[80]).len(), 1);
        assert_eq!(plan_checks(&pattern, &[])[0].target, CheckTarget::TunnelStatus);
    }

    #[test]
    fn test_filter_by_kind_and_traffic() {
        let active = peering("pcx-1", &[3306]);
        let mut quiet = peering("pcx-2", &[]);
        quiet.traffic = None;

        let filter = VerifyFilter {
            only_with_traffic: true,
            ..Default::default()
        };
        assert!(filter.admits(&active));
        assert!(!filter.admits(&quiet));

        let filter = VerifyFilter {
            kinds: [ConnectionKind::HubRouted].into_iter().collect(),
            ..Default::default()
        };
        assert!(!filter.admits(&active));
        assert!(VerifyFilter::default().admits(&quiet));
    }
}
