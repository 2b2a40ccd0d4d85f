//! Hub router resolution

use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::aws::{cidr_covers, HubAttachment, HubRouteTable};
use crate::error::EngineError;
use crate::types::Account;

/// Resolved hub router and the account that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRouter {
    pub router_id: String,
    /// None when no attachment revealed the owner
    pub owner_id: Option<String>,
}

/// A discovered VPC other than the hub's own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpokeVpc {
    pub account_id: String,
    pub vpc_id: String,
    pub cidr_blocks: Vec<String>,
}

/// Hub state read from the owning account
#[derive(Debug, Clone)]
pub struct HubTopology {
    pub router_id: String,
    pub account_id: String,
    pub vpc_id: String,
    pub cidr_blocks: Vec<String>,
    pub attachments: Vec<HubAttachment>,
    pub route_tables: Vec<HubRouteTable>,
    /// Candidates for spoke-to-spoke routing
    pub spokes: Vec<SpokeVpc>,
}

impl HubTopology {
    /// Available attachment of `vpc_id` on this router
    pub fn attachment_for(&self, vpc_id: &str) -> Option<&HubAttachment> {
        self.attachments
            .iter()
            .find(|a| a.vpc_id == vpc_id && a.router_id == self.router_id && a.is_available())
    }

    /// Route tables that traffic entering through `attachment_id` is looked up in
    pub fn tables_for<'a>(&'a self, attachment_id: &'a str) -> impl Iterator<Item = &'a HubRouteTable> + 'a {
        self.route_tables
            .iter()
            .filter(move |t| t.associations.iter().any(|a| a == attachment_id))
    }

    /// Whether traffic entering through `from` for any of `cidrs` leaves
    /// through `to`
    pub fn routes(&self, from: &HubAttachment, to: &HubAttachment, cidrs: &[String]) -> bool {
        self.tables_for(&from.attachment_id)
            .flat_map(|t| &t.routes)
            .any(|route| {
                route.state == "active"
                    && route.attachment_id.as_deref() == Some(to.attachment_id.as_str())
                    && cidrs.iter().any(|cidr| {
                        cidr_covers(&route.destination_cidr, cidr) || cidr_covers(cidr, &route.destination_cidr)
                    })
            })
    }
}

/// Pick the hub router for the run.
///
/// A router id supplied on the accounts wins. Otherwise the router referenced
/// by the most accounts is taken, provided at least two accounts share it
/// and no other router ties with it.
pub fn resolve_hub(
    accounts: &[Account],
    attachments: &BTreeMap<String, Vec<HubAttachment>>,
) -> Result<Option<HubRouter>, EngineError> {
    let supplied: BTreeSet<&str> = accounts
        .iter()
        .filter_map(|a| a.hub_router_id.as_deref())
        .collect();
    let supplied: Vec<&str> = supplied.into_iter().collect();

    let router_id = match supplied.as_slice() {
        [] => match dominant_router(attachments)? {
            Some(router_id) => router_id,
            None => return Ok(None),
        },
        [router_id] => router_id.to_string(),
        _ => {
            return Err(EngineError::AmbiguousHub {
                candidates: supplied.iter().map(|r| r.to_string()).collect(),
            })
        }
    };

    let owner_id = attachments
        .values()
        .flatten()
        .find(|a| a.router_id == router_id)
        .map(|a| a.owner().to_string())
        .or_else(|| {
            accounts
                .iter()
                .find(|a| a.hub_router_id.as_deref() == Some(router_id.as_str()))
                .map(|a| a.account_id.clone())
        });

    info!(router_id = %router_id, owner = ?owner_id, "Hub router resolved");
    Ok(Some(HubRouter { router_id, owner_id }))
}

fn dominant_router(attachments: &BTreeMap<String, Vec<HubAttachment>>) -> Result<Option<String>, EngineError> {
    let mut referenced_by: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (account_id, list) in attachments {
        for attachment in list {
            referenced_by
                .entry(attachment.router_id.as_str())
                .or_default()
                .insert(account_id.as_str());
        }
    }

    let mut ranked: Vec<(&str, usize)> = referenced_by
        .iter()
        .map(|(router, accounts)| (*router, accounts.len()))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    match ranked.as_slice() {
        [] => {
            warn!("No hub router referenced by any account");
            Ok(None)
        }
        [(_, 1), ..] => {
            warn!(routers = ranked.len(), "No hub router shared by two or more accounts");
            Ok(None)
        }
        [(router, _)] => Ok(Some(router.to_string())),
        [(router, top), (_, second), ..] if top > second => Ok(Some(router.to_string())),
        _ => Err(EngineError::AmbiguousHub {
            candidates: ranked.iter().map(|(r, _)| r.to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(router: &str, vpc_owner: &str, router_owner: Option<&str>) -> HubAttachment {
        HubAttachment {
            attachment_id: format!("att-{}-{}", router, vpc_owner),
            router_id: router.to_string(),
            vpc_id: format!("vpc-{}", vpc_owner),
            vpc_owner_id: vpc_owner.to_string(),
            router_owner_id: router_owner.map(str::to_string),
            state: "available".to_string(),
        }
    }

    fn accounts() -> Vec<Account> {
        vec![
            Account::new("1", "hub", "us-east-1"),
            Account::new("2", "a", "us-east-1"),
            Account::new("3", "b", "us-east-1"),
            Account::new("4", "c", "us-east-1"),
        ]
    }

    #[test]
    fn test_router_referenced_by_most_accounts_wins() {
        let mut seen = BTreeMap::new();
        seen.insert("1".to_string(), vec![attachment("tgw-main", "1", None)]);
        seen.insert("2".to_string(), vec![attachment("tgw-main", "2", Some("1"))]);
        seen.insert("3".to_string(), vec![attachment("tgw-lab", "3", None)]);

        let hub = resolve_hub(&accounts(), &seen).unwrap().unwrap();
        assert_eq!(hub.router_id, "tgw-main");
        assert_eq!(hub.owner_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_tied_routers_are_ambiguous() {
        let mut seen = BTreeMap::new();
        for account in ["1", "2"] {
            seen.insert(account.to_string(), vec![attachment("tgw-a", account, None)]);
        }
        for account in ["3", "4"] {
            seen.insert(account.to_string(), vec![attachment("tgw-b", account, None)]);
        }

        let err = resolve_hub(&accounts(), &seen).unwrap_err();
        match err {
            EngineError::AmbiguousHub { candidates } => {
                assert_eq!(candidates, vec!["tgw-a".to_string(), "tgw-b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_router_seen_by_one_account_is_not_a_hub() {
        let mut seen = BTreeMap::new();
        seen.insert("2".to_string(), vec![attachment("tgw-a", "2", Some("9"))]);
        assert!(resolve_hub(&accounts(), &seen).unwrap().is_none());

        seen.insert("3".to_string(), vec![attachment("tgw-b", "3", None)]);
        assert!(resolve_hub(&accounts(), &seen).unwrap().is_none());

        // Two attachments in one account still count once
        seen.insert("2".to_string(), vec![attachment("tgw-a", "2", None), attachment("tgw-a", "2", None)]);
        assert!(resolve_hub(&accounts(), &seen).unwrap().is_none());
    }

    #[test]
    fn test_routes_follow_the_associated_table() {
        let spoke = attachment("tgw-1", "2", Some("1"));
        let hub_side = attachment("tgw-1", "1", Some("1"));
        let route = |cidr: &str, to: &HubAttachment| crate::aws::HubRoute {
            destination_cidr: cidr.to_string(),
            attachment_id: Some(to.attachment_id.clone()),
            state: "active".to_string(),
        };
        let hub = HubTopology {
            router_id: "tgw-1".to_string(),
            account_id: "1".to_string(),
            vpc_id: "vpc-1".to_string(),
            cidr_blocks: vec!["10.0.0.0/16".to_string()],
            attachments: vec![spoke.clone(), hub_side.clone()],
            route_tables: vec![
                HubRouteTable {
                    route_table_id: "rtb-spokes".to_string(),
                    associations: vec![spoke.attachment_id.clone()],
                    routes: vec![route("10.0.0.0/16", &hub_side)],
                },
                // Routes back to the spoke, but nothing enters through it
                HubRouteTable {
                    route_table_id: "rtb-orphan".to_string(),
                    associations: Vec::new(),
                    routes: vec![route("10.2.0.0/16", &spoke)],
                },
            ],
            spokes: Vec::new(),
        };

        let hub_cidrs = vec!["10.0.0.0/16".to_string()];
        let spoke_cidrs = vec!["10.2.0.0/16".to_string()];
        assert!(hub.routes(&spoke, &hub_side, &hub_cidrs));
        assert!(!hub.routes(&hub_side, &spoke, &spoke_cidrs));
        assert!(!hub.routes(&spoke, &hub_side, &spoke_cidrs));
        assert_eq!(hub.tables_for(&spoke.attachment_id).count(), 1);
    }

    #[test]
    fn test_supplied_router_overrides_scan() {
        let mut seen = BTreeMap::new();
        seen.insert("2".to_string(), vec![attachment("tgw-a", "2", None)]);
        seen.insert("3".to_string(), vec![attachment("tgw-b", "3", None)]);

        let mut accounts = accounts();
        accounts[0] = accounts[0].clone().with_hub_router("tgw-z");

        let hub = resolve_hub(&accounts, &seen).unwrap().unwrap();
        assert_eq!(hub.router_id, "tgw-z");
        assert_eq!(hub.owner_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_conflicting_supplied_routers_are_ambiguous() {
        let mut accounts = accounts();
        accounts[0] = accounts[0].clone().with_hub_router("tgw-a");
        accounts[1] = accounts[1].clone().with_hub_router("tgw-b");

        assert!(matches!(
            resolve_hub(&accounts, &BTreeMap::new()),
            Err(EngineError::AmbiguousHub { .. })
        ));
    }

    #[test]
    fn test_no_attachments_means_no_hub() {
        assert!(resolve_hub(&accounts(), &BTreeMap::new()).unwrap().is_none());
    }
}
