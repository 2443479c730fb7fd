// src/core/types.rs

//! Shared identity types: endpoints, replication groups, and the per-agent
//! mode variable.

use std::fmt;
use std::str::FromStr;

use crate::core::errors::CmError;

/// A database endpoint, advertised in the store as `"ip:port"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = CmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .split_once(':')
            .ok_or_else(|| CmError::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| CmError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(CmError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// A replication group. The coordinator group is named `cn`; data-node
/// groups are `dn0, dn1, …`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Cn,
    Dn(u32),
}

impl Group {
    /// Parses a group name as it appears under `falcon_clusters/`.
    pub fn parse(name: &str) -> Option<Self> {
        if name == "cn" {
            return Some(Group::Cn);
        }
        name.strip_prefix("dn")?.parse().ok().map(Group::Dn)
    }

    /// The group id used in the foreign-server catalog: `0` for `cn`,
    /// `i + 1` for `dni`.
    pub fn id(&self) -> u32 {
        match self {
            Group::Cn => 0,
            Group::Dn(i) => i + 1,
        }
    }

    pub fn is_cn(&self) -> bool {
        matches!(self, Group::Cn)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Cn => write!(f, "cn"),
            Group::Dn(i) => write!(f, "dn{i}"),
        }
    }
}

/// The membership state machine of one agent within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentMode {
    /// Startup: group not yet joined.
    #[default]
    Joining,
    /// Streaming from the group primary.
    Follower,
    /// Leader lost; this agent has posted a candidate LSN.
    Electing,
    /// This agent holds `leaders/<group>`.
    Primary,
    /// Session lost; local database has been force-stopped.
    Stopped,
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentMode::Joining => "joining",
            AgentMode::Follower => "follower",
            AgentMode::Electing => "electing",
            AgentMode::Primary => "primary",
            AgentMode::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
