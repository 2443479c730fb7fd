// src/core/store/paths.rs

//! The store path layout, rooted at the configurable cluster root.
//!
//! Both agent roles must agree on this layout exactly; it is the wire
//! contract between every agent generation in a running cluster.

use crate::core::types::{Endpoint, Group};

/// Builds every path the agent touches from the cluster root.
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    root: String,
}

impl ClusterPaths {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Sentinel marking a completed bootstrap.
    pub fn ready(&self) -> String {
        format!("{}/ready", self.root)
    }

    /// Presence directory for one role.
    pub fn presence_dir(&self, is_cn: bool) -> String {
        if is_cn {
            format!("{}/falcon_cns", self.root)
        } else {
            format!("{}/falcon_dns", self.root)
        }
    }

    /// Ephemeral presence node of one host, value `ip:port`.
    pub fn presence(&self, is_cn: bool, node: &str) -> String {
        format!("{}/{}", self.presence_dir(is_cn), node)
    }

    pub fn leaders_dir(&self) -> String {
        format!("{}/leaders", self.root)
    }

    /// Ephemeral leader node of one group, value `ip:port`.
    pub fn leader(&self, group: Group) -> String {
        format!("{}/leaders/{}", self.root, group)
    }

    pub fn clusters_dir(&self) -> String {
        format!("{}/falcon_clusters", self.root)
    }

    pub fn group_dir(&self, group: Group) -> String {
        format!("{}/falcon_clusters/{}", self.root, group)
    }

    pub fn host_nodes_dir(&self, group: Group) -> String {
        format!("{}/hostNodes", self.group_dir(group))
    }

    pub fn host_node(&self, group: Group, node: &str) -> String {
        format!("{}/hostNodes/{}", self.group_dir(group), node)
    }

    pub fn membership_dir(&self, group: Group) -> String {
        format!("{}/membership", self.group_dir(group))
    }

    pub fn member(&self, group: Group, node: &str) -> String {
        format!("{}/membership/{}", self.group_dir(group), node)
    }

    pub fn replicas_dir(&self, group: Group) -> String {
        format!("{}/replicas", self.group_dir(group))
    }

    pub fn replica(&self, group: Group, endpoint: &Endpoint) -> String {
        format!("{}/replicas/{}", self.group_dir(group), endpoint)
    }

    pub fn candidates_dir(&self, group: Group) -> String {
        format!("{}/candidates", self.group_dir(group))
    }

    pub fn candidate(&self, group: Group, endpoint: &Endpoint) -> String {
        format!("{}/candidates/{}", self.group_dir(group), endpoint)
    }

    /// Identity of the most recent primary, value `host_node_name`.
    pub fn last_leader(&self, group: Group) -> String {
        format!("{}/lastLeader", self.group_dir(group))
    }

    /// Supplement pool directory for one role.
    pub fn supplement_dir(&self, is_cn: bool) -> String {
        if is_cn {
            format!("{}/cn_supplement", self.root)
        } else {
            format!("{}/dn_supplement", self.root)
        }
    }

    pub fn supplement(&self, is_cn: bool, node: &str) -> String {
        format!("{}/{}", self.supplement_dir(is_cn), node)
    }

    pub fn need_supplement_dir(&self) -> String {
        format!("{}/need_supplement", self.root)
    }

    /// Outstanding replacement request `k ∈ {0, 1}` for one group.
    pub fn need_supplement(&self, group: Group, k: u8) -> String {
        format!("{}/need_supplement/{}-{}", self.root, group, k)
    }

    pub fn store_node_dir(&self) -> String {
        format!("{}/StoreNode", self.root)
    }

    pub fn store_node_members(&self) -> String {
        format!("{}/StoreNode/Nodes", self.root)
    }

    pub fn store_node_status(&self) -> String {
        format!("{}/StoreNode/storeNodeStatus", self.root)
    }
}

/// Splits a `need_supplement` child name (`<group>-<k>`) back into its
/// parts. Returns `None` for names that do not follow the contract.
pub fn parse_need_supplement(child: &str) -> Option<(Group, u8)> {
    let (group, k) = child.rsplit_once('-')?;
    Some((Group::parse(group)?, k.parse().ok()?))
}
