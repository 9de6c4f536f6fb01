// ============================================================================
// Server Group
// ============================================================================
//
// One failover unit: a declared member list, the node handle attached for
// each member, and which member is currently active.
//
// Membership and the node map live behind a single RwLock so a strict reader
// can check "one node per declared member" atomically. Reconfigurations are
// additionally serialised by `reload_lock`; node resolution happens outside
// the state lock so readers are never blocked on it.
//
// ============================================================================

use super::config::{GroupConfig, GroupId, HaConfig, HaMode, Node, NodeResolver, validate_members};
use crate::core::{GraphError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::{Level, event, info_span};

/// Nodes attached and detached by one `reload`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadChange {
    pub added: Vec<Node>,
    pub removed: Vec<Node>,
}

impl ReloadChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of electing a new active after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub previous: Option<String>,
    pub active: Node,
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<String>,
    nodes: HashMap<String, Node>,
    active: Option<String>,
    epoch: u64,
}

impl GroupState {
    fn check_complete(&self) -> Result<()> {
        if self.nodes.len() != self.members.len() {
            let mut attached: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
            attached.sort_unstable();
            return Err(GraphError::AssertionFailed(format!(
                "group membership is inconsistent: members {:?}, attached nodes {:?}",
                self.members, attached
            )));
        }
        Ok(())
    }

    fn attached_in_member_order(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter_map(|member| self.nodes.get(member).cloned())
            .collect()
    }
}

#[derive(Debug)]
pub struct ServerGroup {
    group_id: GroupId,
    ha: HaConfig,
    state: RwLock<GroupState>,
    reload_lock: Mutex<()>,
}

impl ServerGroup {
    /// Creates a group with its declared members and no nodes attached yet.
    pub fn new(config: &GroupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            group_id: config.group_id,
            ha: config.ha.clone(),
            state: RwLock::new(GroupState {
                members: config.members.clone(),
                ..GroupState::default()
            }),
            reload_lock: Mutex::new(()),
        })
    }

    /// Creates a group and attaches every member through `resolver`.
    pub fn from_config(config: &GroupConfig, resolver: &dyn NodeResolver) -> Result<Self> {
        let group = Self::new(config)?;
        for member in &config.members {
            group.add_node(member, resolver.resolve(member)?)?;
        }
        Ok(group)
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn ha_mode(&self) -> HaMode {
        self.ha.mode
    }

    pub fn is_networked_active_passive(&self) -> bool {
        self.ha.mode == HaMode::NetworkedActivePassive
    }

    pub fn election_time(&self) -> Duration {
        Duration::from_secs(self.ha.election_time_secs)
    }

    /// Replaces the declared member list.
    ///
    /// Removed members are detached and returned; added members are resolved
    /// and attached. The whole change becomes visible to readers at once.
    pub fn reload(
        &self,
        new_members: Vec<String>,
        resolver: &dyn NodeResolver,
    ) -> Result<ReloadChange> {
        validate_members(&new_members)?;
        let _reload = self.reload_lock.lock()?;
        let span = info_span!("group.reload", group = %self.group_id);
        let _enter = span.enter();

        let old_members = self.state.read()?.members.clone();
        let old: HashSet<&str> = old_members.iter().map(String::as_str).collect();
        let new: HashSet<&str> = new_members.iter().map(String::as_str).collect();

        let mut resolved = Vec::new();
        for member in new_members.iter().filter(|m| !old.contains(m.as_str())) {
            resolved.push((member.clone(), resolver.resolve(member)?));
        }

        let mut change = ReloadChange::default();
        let mut state = self.state.write()?;
        for member in old_members.iter().filter(|m| !new.contains(m.as_str())) {
            if let Some(node) = state.nodes.remove(member) {
                change.removed.push(node);
            }
            if state.active.as_deref() == Some(member.as_str()) {
                state.active = None;
            }
        }
        for (member, node) in resolved {
            state.nodes.insert(member, node.clone());
            change.added.push(node);
        }
        state.members = new_members;
        drop(state);

        event!(
            Level::INFO,
            added = change.added.len(),
            removed = change.removed.len(),
            "group membership reloaded"
        );
        Ok(change)
    }

    /// Attached nodes in declared member order.
    ///
    /// # Errors
    /// With `strict`, `AssertionFailed` unless exactly one node is attached per
    /// declared member.
    pub fn get_nodes(&self, strict: bool) -> Result<Vec<Node>> {
        let state = self.state.read()?;
        if strict {
            state.check_complete()?;
        }
        Ok(state.attached_in_member_order())
    }

    pub fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state.read()?.nodes.get(name).cloned())
    }

    pub fn has_member(&self, name: &str) -> Result<bool> {
        Ok(self.state.read()?.members.iter().any(|m| m == name))
    }

    pub fn members(&self) -> Result<Vec<String>> {
        Ok(self.state.read()?.members.clone())
    }

    /// Attaches the node handle for a declared member.
    pub fn add_node(&self, name: &str, node: Node) -> Result<()> {
        let mut state = self.state.write()?;
        if !state.members.iter().any(|m| m == name) {
            return Err(GraphError::AssertionFailed(format!(
                "{} is not a member of {}",
                name, self
            )));
        }
        state.nodes.insert(name.to_string(), node);
        Ok(())
    }

    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut state = self.state.write()?;
        if !state.nodes.contains_key(name) {
            return Err(GraphError::AssertionFailed(format!(
                "cannot activate {}: no node attached for it in {}",
                name, self
            )));
        }
        state.active = Some(name.to_string());
        Ok(())
    }

    pub fn active(&self) -> Result<Option<Node>> {
        let state = self.state.read()?;
        Ok(state
            .active
            .as_ref()
            .and_then(|name| state.nodes.get(name).cloned()))
    }

    pub fn epoch(&self) -> Result<u64> {
        Ok(self.state.read()?.epoch)
    }

    /// Every attached member other than the active, in declared order.
    pub fn passives(&self) -> Result<Vec<Node>> {
        let state = self.state.read()?;
        state.check_complete()?;
        Ok(state
            .attached_in_member_order()
            .into_iter()
            .filter(|node| state.active.as_deref() != Some(node.name.as_str()))
            .collect())
    }

    /// Elects the first attached member other than `failed`, counting from
    /// the start of the declared order, and bumps the election epoch.
    ///
    /// # Errors
    /// `IllegalState` if `failed` is not the current active; `ExecutionError`
    /// if no other member is attached.
    pub fn promote_next(&self, failed: &str) -> Result<Promotion> {
        let mut state = self.state.write()?;
        if let Some(active) = state.active.as_deref() {
            if active != failed {
                return Err(GraphError::IllegalState(format!(
                    "{} reported {} as failed but the active is {}",
                    self, failed, active
                )));
            }
        }

        let next = state
            .members
            .iter()
            .filter(|member| member.as_str() != failed)
            .find_map(|member| state.nodes.get(member).cloned())
            .ok_or_else(|| {
                GraphError::ExecutionError(format!(
                    "{} has no passive left to promote after losing {}",
                    self, failed
                ))
            })?;

        let previous = state.active.replace(next.name.clone());
        state.epoch += 1;
        let epoch = state.epoch;
        drop(state);

        event!(
            Level::WARN,
            group = %self.group_id,
            failed,
            active = %next.name,
            epoch,
            "passive promoted to active"
        );
        Ok(Promotion {
            previous,
            active: next,
            epoch,
        })
    }
}

impl PartialEq for ServerGroup {
    fn eq(&self, other: &Self) -> bool {
        self.group_id == other.group_id
    }
}

impl Eq for ServerGroup {}

impl Hash for ServerGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group_id.hash(state);
    }
}

impl fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActiveServerGroup{{groupId={}}}", self.group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::ClusterTopology;

    fn topology() -> ClusterTopology {
        ["s1", "s2", "s3", "x"]
            .iter()
            .enumerate()
            .fold(ClusterTopology::new(), |topology, (i, name)| {
                topology.server(Node::new(*name, format!("10.0.0.{}", i + 1), 9510, 9530))
            })
    }

    fn group(members: &[&str]) -> ServerGroup {
        let config = GroupConfig::new(
            GroupId(0),
            members.iter().map(|m| m.to_string()).collect(),
        );
        ServerGroup::from_config(&config, &topology()).unwrap()
    }

    #[test]
    fn test_reload_reports_added_and_removed() {
        let group = group(&["s1", "s2", "s3"]);
        let change = group
            .reload(vec!["s1".into(), "s2".into(), "x".into()], &topology())
            .unwrap();

        let added: Vec<_> = change.added.iter().map(|n| n.name.as_str()).collect();
        let removed: Vec<_> = change.removed.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(added, vec!["x"]);
        assert_eq!(removed, vec!["s3"]);
        assert_eq!(group.get_nodes(true).unwrap().len(), 3);
        assert!(group.has_member("x").unwrap());
        assert!(!group.has_member("s3").unwrap());
    }

    #[test]
    fn test_reload_failure_leaves_membership_untouched() {
        let group = group(&["s1", "s2"]);
        let err = group
            .reload(vec!["s1".into(), "unknown".into()], &topology())
            .unwrap_err();
        assert!(matches!(err, GraphError::ConfigError(_)));
        assert_eq!(group.members().unwrap(), vec!["s1", "s2"]);
        assert!(group.get_nodes(true).is_ok());
    }

    #[test]
    fn test_strict_get_nodes_detects_missing_node() {
        let config = GroupConfig::new(GroupId(4), vec!["s1".into(), "s2".into()]);
        let group = ServerGroup::new(&config).unwrap();
        group.add_node("s1", Node::new("s1", "h", 1, 2)).unwrap();

        assert!(matches!(
            group.get_nodes(true),
            Err(GraphError::AssertionFailed(_))
        ));
        assert_eq!(group.get_nodes(false).unwrap().len(), 1);
    }

    #[test]
    fn test_add_node_rejects_non_member() {
        let group = group(&["s1"]);
        let err = group.add_node("s2", Node::new("s2", "h", 1, 2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_identity_is_group_id_only() {
        let a = group(&["s1"]);
        let b = group(&["s2", "s3"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ActiveServerGroup{groupId=0}");
    }

    #[test]
    fn test_promote_next_skips_failed_and_bumps_epoch() {
        let group = group(&["s1", "s2", "s3"]);
        group.set_active("s1").unwrap();
        assert_eq!(group.passives().unwrap().len(), 2);

        let promotion = group.promote_next("s1").unwrap();
        assert_eq!(promotion.previous.as_deref(), Some("s1"));
        assert_eq!(promotion.active.name, "s2");
        assert_eq!(promotion.epoch, 1);
        assert_eq!(group.active().unwrap().map(|n| n.name), Some("s2".into()));

        assert!(matches!(
            group.promote_next("s1"),
            Err(GraphError::IllegalState(_))
        ));
    }

    #[test]
    fn test_promotion_counts_from_start_of_declared_order() {
        let group = group(&["s1", "s2", "s3"]);
        group.set_active("s2").unwrap();

        let promotion = group.promote_next("s2").unwrap();
        assert_eq!(promotion.previous.as_deref(), Some("s2"));
        assert_eq!(promotion.active.name, "s1");
    }

    #[test]
    fn test_removing_active_clears_it() {
        let group = group(&["s1", "s2"]);
        group.set_active("s2").unwrap();
        group.reload(vec!["s1".into()], &topology()).unwrap();
        assert_eq!(group.active().unwrap(), None);
    }
}
