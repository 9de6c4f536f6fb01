// ============================================================================
// Transaction Relay
// ============================================================================
//
// Ships each committed record from the active to every passive of its group.
// Every passive gets its own projection, pruned against the objects it has
// already synchronised. Fan-out is one in-flight ship per passive, so
// concurrency is bounded by group size rather than by commit volume.
//
// The AckLedger tracks which passives still owe an acknowledgement for a
// global id; a record is released once that set is empty.
//
// ============================================================================

use super::config::Node;
use super::forwarder::PassiveForwarder;
use super::group::{ReloadChange, ServerGroup};
use crate::core::{GlobalTransactionId, GraphError, ObjectIdSet, Result};
use crate::transaction::{ShippedTransaction, TransactionRecord, prune_for_replica};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Duration as TokioDuration, timeout};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Every passive must acknowledge before the commit is reported.
    Sync,
    /// Failed passives are logged and dropped from the acknowledgement set.
    BestEffort,
}

impl Default for ReplicationMode {
    fn default() -> Self {
        Self::Sync
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    #[serde(default)]
    pub mode: ReplicationMode,
    /// Upper bound on a single ship to one passive.
    pub ship_timeout_ms: u64,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::default(),
            ship_timeout_ms: 5_000,
        }
    }
}

impl ReplicationPolicy {
    pub fn mode(mut self, mode: ReplicationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn ship_timeout(mut self, timeout: TokioDuration) -> Self {
        self.ship_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ship_timeout_ms == 0 {
            return Err(GraphError::ConfigError(
                "ship_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outstanding acknowledgements per global transaction id.
#[derive(Debug, Default)]
pub struct AckLedger {
    pending: Mutex<BTreeMap<GlobalTransactionId, BTreeSet<String>>>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts waiting on `nodes` for `gid`. An empty node list releases
    /// `gid` immediately.
    pub fn expect(
        &self,
        gid: GlobalTransactionId,
        nodes: impl IntoIterator<Item = String>,
    ) -> Result<()> {
        let nodes: BTreeSet<String> = nodes.into_iter().collect();
        if nodes.is_empty() {
            return Ok(());
        }
        self.pending.lock()?.entry(gid).or_default().extend(nodes);
        Ok(())
    }

    /// Records that `node` applied `gid`; returns true if this released it.
    pub fn acknowledge(&self, gid: GlobalTransactionId, node: &str) -> Result<bool> {
        self.settle(gid, node)
    }

    /// Stops waiting on `node` for `gid` without counting it as applied.
    pub fn withdraw(&self, gid: GlobalTransactionId, node: &str) -> Result<bool> {
        self.settle(gid, node)
    }

    fn settle(&self, gid: GlobalTransactionId, node: &str) -> Result<bool> {
        let mut pending = self.pending.lock()?;
        let Some(waiting) = pending.get_mut(&gid) else {
            return Ok(false);
        };
        if !waiting.remove(node) {
            return Ok(false);
        }
        if waiting.is_empty() {
            pending.remove(&gid);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn pending(&self, gid: GlobalTransactionId) -> Result<Vec<String>> {
        Ok(self
            .pending
            .lock()?
            .get(&gid)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn is_released(&self, gid: GlobalTransactionId) -> Result<bool> {
        Ok(!self.pending.lock()?.contains_key(&gid))
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.pending.lock()?.len())
    }

    /// Drops `node` from every outstanding entry, returning the ids this
    /// released.
    pub fn forget_node(&self, node: &str) -> Result<Vec<GlobalTransactionId>> {
        let mut pending = self.pending.lock()?;
        let mut released = Vec::new();
        pending.retain(|gid, nodes| {
            nodes.remove(node);
            if nodes.is_empty() {
                released.push(*gid);
                false
            } else {
                true
            }
        });
        Ok(released)
    }

    /// Oldest global id still waiting on a passive.
    pub fn low_water_mark(&self) -> Result<Option<GlobalTransactionId>> {
        Ok(self.pending.lock()?.keys().next().copied())
    }
}

/// Result of shipping one record to the group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub global_id: Option<GlobalTransactionId>,
    pub acknowledged: Vec<String>,
    /// `name (error)` for every passive that did not apply the record.
    pub failed: Vec<String>,
    /// Passives that received a pruned view rather than the full record.
    pub pruned: Vec<String>,
    /// Earlier ids that were resent from a backlog and released by this call.
    pub caught_up: Vec<GlobalTransactionId>,
    pub released: bool,
}

#[derive(Debug)]
struct Backlogged {
    gid: GlobalTransactionId,
    shipped: ShippedTransaction,
}

/// Everything shipped to one passive but not yet applied, oldest first.
/// `shipping` admits one drain at a time, so the front entry only leaves
/// the queue once it has been applied.
#[derive(Debug, Default)]
struct Lane {
    queue: Mutex<VecDeque<Backlogged>>,
    shipping: AsyncMutex<()>,
}

type Backlog = Arc<Lane>;

#[derive(Debug, Default)]
struct RelayState {
    synced: HashMap<String, ObjectIdSet>,
    backlogs: HashMap<String, Backlog>,
    last_enqueued: Option<GlobalTransactionId>,
}

/// What one passive's drain achieved.
struct Drained {
    applied: Vec<GlobalTransactionId>,
    error: Option<GraphError>,
    still_queued: bool,
}

pub struct TransactionRelay {
    group: Arc<ServerGroup>,
    forwarder: Arc<dyn PassiveForwarder>,
    state: Mutex<RelayState>,
    ledger: AckLedger,
    policy: ReplicationPolicy,
}

impl TransactionRelay {
    pub fn new(group: Arc<ServerGroup>, forwarder: Arc<dyn PassiveForwarder>) -> Self {
        Self::assemble(group, forwarder, ReplicationPolicy::default())
    }

    /// # Errors
    /// `ConfigError` if the policy does not validate.
    pub fn with_policy(
        group: Arc<ServerGroup>,
        forwarder: Arc<dyn PassiveForwarder>,
        policy: ReplicationPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self::assemble(group, forwarder, policy))
    }

    fn assemble(
        group: Arc<ServerGroup>,
        forwarder: Arc<dyn PassiveForwarder>,
        policy: ReplicationPolicy,
    ) -> Self {
        Self {
            group,
            forwarder,
            state: Mutex::new(RelayState::default()),
            ledger: AckLedger::new(),
            policy,
        }
    }

    pub fn group(&self) -> &Arc<ServerGroup> {
        &self.group
    }

    pub fn ledger(&self) -> &AckLedger {
        &self.ledger
    }

    pub fn policy(&self) -> &ReplicationPolicy {
        &self.policy
    }

    /// Declares the objects `passive` already holds. Passives without an
    /// entry are shipped full records.
    pub fn set_synced(&self, passive: &str, objects: ObjectIdSet) -> Result<()> {
        self.state.lock()?.synced.insert(passive.to_string(), objects);
        Ok(())
    }

    /// Records that object sync delivered `objects` to `passive`, if its
    /// synced set is being tracked.
    pub fn mark_synced(&self, passive: &str, objects: &ObjectIdSet) -> Result<()> {
        if let Some(synced) = self.state.lock()?.synced.get_mut(passive) {
            for id in objects.iter() {
                synced.insert(*id);
            }
        }
        Ok(())
    }

    pub fn synced(&self, passive: &str) -> Result<Option<ObjectIdSet>> {
        Ok(self.state.lock()?.synced.get(passive).cloned())
    }

    /// Global ids still waiting to be applied by `passive`, oldest first.
    pub fn backlog(&self, passive: &str) -> Result<Vec<GlobalTransactionId>> {
        let lane = self.state.lock()?.backlogs.get(passive).cloned();
        Ok(match lane {
            Some(lane) => lane.queue.lock()?.iter().map(|entry| entry.gid).collect(),
            None => Vec::new(),
        })
    }

    /// Projects `record` for every passive, registers the expected acks and
    /// appends it to their backlogs.
    ///
    /// Runs entirely under the state lock, so backlogs grow in global id
    /// order and no drain can apply an id before the ledger expects it.
    /// Objects created by the record count as synced from here on: the
    /// backlog delivers them before anything that follows.
    fn enqueue(
        &self,
        gid: GlobalTransactionId,
        record: &Arc<TransactionRecord>,
    ) -> Result<Vec<(Node, bool, Backlog)>> {
        let passives = self.group.passives()?;
        let mut state = self.state.lock()?;
        if let Some(last) = state.last_enqueued.filter(|last| gid <= *last) {
            return Err(GraphError::IllegalState(format!(
                "{} relayed after {}; records must be relayed in global id order",
                gid, last
            )));
        }

        let mut staged = Vec::with_capacity(passives.len());
        for node in passives {
            let shipped = match state.synced.get(&node.name) {
                Some(objects) => prune_for_replica(record, objects)?,
                None => ShippedTransaction::Full(Arc::clone(record)),
            };
            staged.push((node, shipped));
        }

        self.ledger
            .expect(gid, staged.iter().map(|(node, _)| node.name.clone()))?;

        let mut targets = Vec::with_capacity(staged.len());
        for (node, shipped) in staged {
            if let Some(synced) = state.synced.get_mut(&node.name) {
                for id in shipped.new_object_ids().iter() {
                    synced.insert(*id);
                }
            }
            let lane = Arc::clone(state.backlogs.entry(node.name.clone()).or_default());
            let pruned = shipped.is_pruned();
            lane.queue.lock()?.push_back(Backlogged { gid, shipped });
            targets.push((node, pruned, lane));
        }
        state.last_enqueued = Some(gid);
        Ok(targets)
    }

    /// Ships the backlog of one passive front to back, stopping at the
    /// first failure so nothing is applied out of order.
    async fn drain(
        &self,
        node: &Node,
        lane: &Lane,
        gid: GlobalTransactionId,
        ship_timeout: TokioDuration,
    ) -> Result<Drained> {
        let _shipping = lane.shipping.lock().await;
        let mut applied = Vec::new();
        let mut error = None;
        loop {
            let front = lane
                .queue
                .lock()?
                .front()
                .map(|entry| (entry.gid, entry.shipped.clone()));
            let Some((next, shipped)) = front else {
                break;
            };
            let result = match timeout(ship_timeout, self.forwarder.ship(node, shipped)).await {
                Ok(result) => result,
                Err(_) => Err(GraphError::Disconnected(format!(
                    "passive '{}' did not answer within {}ms",
                    node.name,
                    ship_timeout.as_millis()
                ))),
            };
            match result {
                Ok(()) => {
                    lane.queue.lock()?.pop_front();
                    applied.push(next);
                }
                Err(err) => {
                    error = Some(err);
                    break;
                }
            }
        }
        let still_queued = lane.queue.lock()?.iter().any(|entry| entry.gid == gid);
        Ok(Drained {
            applied,
            error,
            still_queued,
        })
    }

    /// Ships `record` to every passive and waits for each to answer.
    ///
    /// A passive that still owes earlier ids is sent those first, in order.
    /// Records must be relayed in global id order.
    ///
    /// # Errors
    /// `IllegalState` if the record has no global id yet, or an id at or
    /// below it was already relayed. Under `ReplicationMode::Sync`,
    /// `ReplicationError` if any passive failed; the record then stays
    /// pending in the ledger and in the backlog of the failed passives.
    pub async fn relay(&self, record: &Arc<TransactionRecord>) -> Result<RelayOutcome> {
        let gid = record.global_transaction_id().ok_or_else(|| {
            GraphError::IllegalState(format!(
                "{} has no global transaction id and cannot be relayed",
                record.server_transaction_id()
            ))
        })?;
        let mut outcome = RelayOutcome {
            global_id: Some(gid),
            released: true,
            ..RelayOutcome::default()
        };
        if !self.group.is_networked_active_passive() {
            return Ok(outcome);
        }

        let targets = self.enqueue(gid, record)?;

        let ship_timeout = TokioDuration::from_millis(self.policy.ship_timeout_ms);
        let span = info_span!("relay.fanout", gid = %gid, passives = targets.len());
        let results = join_all(targets.into_iter().map(|(node, pruned, lane)| async move {
            let drained = self.drain(&node, &lane, gid, ship_timeout).await;
            (node, pruned, drained)
        }))
        .instrument(span)
        .await;

        for (node, pruned, drained) in results {
            let drained = drained?;
            if pruned {
                outcome.pruned.push(node.name.clone());
            }
            for applied in &drained.applied {
                if self.ledger.acknowledge(*applied, &node.name)?
                    && *applied < gid
                    && !outcome.caught_up.contains(applied)
                {
                    outcome.caught_up.push(*applied);
                }
            }
            if !drained.still_queued {
                outcome.acknowledged.push(node.name);
                continue;
            }

            let err = drained.error.unwrap_or_else(|| {
                GraphError::Disconnected(format!("passive '{}' left {} queued", node.name, gid))
            });
            event!(
                Level::WARN,
                gid = %gid,
                passive = %node.name,
                error = %err,
                "passive did not apply transaction"
            );
            if self.policy.mode == ReplicationMode::BestEffort {
                self.ledger.withdraw(gid, &node.name)?;
            }
            outcome.failed.push(format!("{} ({})", node.name, err));
        }
        outcome.caught_up.sort();
        outcome.released = self.ledger.is_released(gid)?;

        if self.policy.mode == ReplicationMode::Sync && !outcome.failed.is_empty() {
            return Err(GraphError::ReplicationError(format!(
                "{} not applied by every passive of {}: acknowledged {}, failed: {}",
                gid,
                self.group,
                outcome.acknowledged.len(),
                outcome.failed.join("; ")
            )));
        }
        Ok(outcome)
    }

    /// Applies a membership change: departed passives stop holding back the
    /// ledger and lose their backlog, and newcomers start from an empty
    /// synced set.
    pub fn handle_reload(&self, change: &ReloadChange) -> Result<Vec<GlobalTransactionId>> {
        let mut released = Vec::new();
        let mut state = self.state.lock()?;
        for node in &change.removed {
            state.synced.remove(&node.name);
            state.backlogs.remove(&node.name);
            released.extend(self.ledger.forget_node(&node.name)?);
        }
        for node in &change.added {
            state.synced.entry(node.name.clone()).or_default();
        }
        Ok(released)
    }
}
