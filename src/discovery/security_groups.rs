//! Ports admitted by security groups
//!
//! A path's allowed ports are what the source VPC's groups let out and the
//! destination VPC's groups let in. When only one side has port rules that
//! side is taken as is.

use std::collections::BTreeSet;

use crate::aws::{SecurityGroup, SecurityGroupRule};
use crate::types::Directionality;

/// Assumed open when a rule admits every protocol
pub const COMMON_PORTS: [u16; 7] = [22, 80, 443, 3306, 5432, 8080, 8443];

/// Wider ranges contribute only their two ends
const MAX_EXPANDED_RANGE: u16 = 1000;

/// Ports the groups of one VPC admit, per direction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmittedPorts {
    pub ingress: BTreeSet<u16>,
    pub egress: BTreeSet<u16>,
}

impl AdmittedPorts {
    pub fn from_groups(groups: &[SecurityGroup]) -> Self {
        let mut admitted = Self::default();
        for group in groups {
            for rule in &group.ingress {
                collect_rule_ports(rule, &mut admitted.ingress);
            }
            for rule in &group.egress {
                collect_rule_ports(rule, &mut admitted.egress);
            }
        }
        admitted
    }

    /// Ports a path leaving this VPC for `destination` may use
    pub fn toward(&self, destination: &AdmittedPorts) -> BTreeSet<u16> {
        match (self.egress.is_empty(), destination.ingress.is_empty()) {
            (true, _) => destination.ingress.clone(),
            (_, true) => self.egress.clone(),
            _ => self.egress.intersection(&destination.ingress).copied().collect(),
        }
    }
}

/// Allowed ports between two VPCs over every direction `directionality` covers
pub fn allowed_ports(
    directionality: Directionality,
    source: &AdmittedPorts,
    destination: &AdmittedPorts,
) -> BTreeSet<u16> {
    match directionality {
        Directionality::SourceToDest => source.toward(destination),
        Directionality::DestToSource => destination.toward(source),
        Directionality::Both | Directionality::Unknown => {
            let mut ports = source.toward(destination);
            ports.extend(destination.toward(source));
            ports
        }
    }
}

fn collect_rule_ports(rule: &SecurityGroupRule, ports: &mut BTreeSet<u16>) {
    // A rule with no peer admits nothing
    if rule.cidr_blocks.is_empty() && rule.source_groups.is_empty() {
        return;
    }
    match rule.protocol.as_str() {
        "-1" => ports.extend(COMMON_PORTS),
        "tcp" | "udp" | "6" | "17" => {
            let (Some(from), Some(to)) = (rule.from_port, rule.to_port) else {
                return;
            };
            if to < from {
                return;
            }
            if to - from <= MAX_EXPANDED_RANGE {
                ports.extend(from..=to);
            } else {
                ports.insert(from);
                ports.insert(to);
            }
        }
        _ => {}
    }
}
