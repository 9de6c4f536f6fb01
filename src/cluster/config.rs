use crate::core::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Identity of one failover unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How passives in a group keep up with the active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaMode {
    /// Passives share the active's disk and take over from it.
    DiskBasedActivePassive,
    /// Passives receive every committed transaction over the network.
    NetworkedActivePassive,
}

impl Default for HaMode {
    fn default() -> Self {
        Self::NetworkedActivePassive
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfig {
    #[serde(default)]
    pub mode: HaMode,
    /// Seconds an election may run before it is restarted.
    pub election_time_secs: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            mode: HaMode::default(),
            election_time_secs: 5,
        }
    }
}

/// Address of one server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub host: String,
    /// Port clients connect to
    pub port: u16,
    /// Port used for server-to-server traffic
    pub group_port: u16,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        group_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            group_port,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node{{{}@{}:{}}}", self.name, self.host, self.group_port)
    }
}

/// Static configuration of one server group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: GroupId,
    pub members: Vec<String>,
    #[serde(default)]
    pub ha: HaConfig,
}

impl GroupConfig {
    pub fn new(group_id: GroupId, members: Vec<String>) -> Self {
        Self {
            group_id,
            members,
            ha: HaConfig::default(),
        }
    }

    pub fn ha_mode(mut self, mode: HaMode) -> Self {
        self.ha.mode = mode;
        self
    }

    pub fn election_time(mut self, election_time: Duration) -> Self {
        self.ha.election_time_secs = election_time.as_secs();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_members(&self.members)?;
        if self.ha.election_time_secs == 0 {
            return Err(GraphError::ConfigError(format!(
                "group {} election time must be > 0",
                self.group_id
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_members(members: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for member in members {
        if member.trim().is_empty() {
            return Err(GraphError::ConfigError(
                "member name must not be empty".to_string(),
            ));
        }
        if !seen.insert(member.as_str()) {
            return Err(GraphError::ConfigError(format!(
                "member '{}' is listed more than once",
                member
            )));
        }
    }
    Ok(())
}

/// Looks up the node handle for a declared member.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, member: &str) -> Result<Node>;
}

/// Every group and server known to the cluster configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub servers: BTreeMap<String, Node>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, node: Node) -> Self {
        self.servers.insert(node.name.clone(), node);
        self
    }

    pub fn group(mut self, group: GroupConfig) -> Self {
        self.groups.push(group);
        self
    }

    pub fn group_config(&self, group_id: GroupId) -> Option<&GroupConfig> {
        self.groups.iter().find(|group| group.group_id == group_id)
    }

    /// Checks every group, and that each member has a server entry and
    /// belongs to exactly one group.
    pub fn validate(&self) -> Result<()> {
        let mut owners: BTreeMap<&str, GroupId> = BTreeMap::new();
        let mut group_ids = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !group_ids.insert(group.group_id) {
                return Err(GraphError::ConfigError(format!(
                    "group {} is declared more than once",
                    group.group_id
                )));
            }
            for member in &group.members {
                if !self.servers.contains_key(member) {
                    return Err(GraphError::ConfigError(format!(
                        "member '{}' of group {} has no server entry",
                        member, group.group_id
                    )));
                }
                if let Some(other) = owners.insert(member.as_str(), group.group_id) {
                    return Err(GraphError::ConfigError(format!(
                        "server '{}' belongs to both group {} and group {}",
                        member, other, group.group_id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl NodeResolver for ClusterTopology {
    fn resolve(&self, member: &str) -> Result<Node> {
        self.servers.get(member).cloned().ok_or_else(|| {
            GraphError::ConfigError(format!("no server configured for member '{}'", member))
        })
    }
}
