//! Flow-log traffic enrichment
//!
//! Best effort: a VPC without flow logs, or a query that fails, simply yields
//! no traffic samples.

use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use super::retry::with_backoff;
use crate::aws::{cidr_contains, ApiResult, FlowQuery, NetworkApi};
use crate::config::{FlowLogConfig, RetryPolicy};
use crate::types::TrafficSample;

/// VPC address space used to attribute flow destinations
#[derive(Debug, Clone)]
pub struct VpcAddressSpace {
    pub vpc_id: String,
    pub cidr_blocks: Vec<String>,
}

impl VpcAddressSpace {
    fn contains(&self, addr: &str) -> bool {
        self.cidr_blocks.iter().any(|cidr| cidr_contains(cidr, addr))
    }
}

/// IANA protocol number to name
pub fn protocol_name(number: &str) -> String {
    match number {
        "6" => "tcp".to_string(),
        "17" => "udp".to_string(),
        "1" => "icmp".to_string(),
        other => other.to_string(),
    }
}

/// Traffic leaving `vpc_id`, grouped by the destination VPC it reached
pub async fn collect_traffic(
    api: &dyn NetworkApi,
    vpc_id: &str,
    fleet: &[VpcAddressSpace],
    config: &FlowLogConfig,
    retry: &RetryPolicy,
) -> ApiResult<BTreeMap<String, TrafficSample>> {
    let end = Utc::now();
    let query = FlowQuery {
        vpc_id: vpc_id.to_string(),
        start: end - Duration::hours(config.lookback_hours),
        end,
        limit: config.max_records,
    };

    let records = with_backoff(retry, "query_flow_records", || api.query_flow_records(&query)).await?;

    let mut traffic: BTreeMap<String, TrafficSample> = BTreeMap::new();
    for record in &records {
        let Some(dest) = fleet.iter().find(|space| space.contains(&record.dst_addr)) else {
            continue;
        };
        if dest.vpc_id == vpc_id {
            continue;
        }

        let sample = traffic.entry(dest.vpc_id.clone()).or_default();
        sample.protocols.insert(protocol_name(&record.protocol));
        sample.ports.insert(record.dst_port);
        sample.bytes = sample.bytes.saturating_add(record.bytes);
        sample.packets = sample.packets.saturating_add(record.packets);
    }

    debug!(
        vpc_id = %vpc_id,
        rows = records.len(),
        peers = traffic.len(),
        "Flow records aggregated"
    );
    Ok(traffic)
}
