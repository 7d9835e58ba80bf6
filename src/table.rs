//! Node table and lifecycle
//!
//! The single authoritative store of peer nodes. Nodes live in an arena
//! of stable slots addressed by [`NodeId`] handles and are indexed by MAC
//! address through an ordered map; the arena slot is the table's implicit
//! strong reference and `refcnt` counts external consumers only. A node
//! is destroyed only when it is unreferenced and marked for collection.

use std::collections::BTreeMap;

use crate::config::WifiRole;
use crate::context::{WifiContext, WifiEvent};
use crate::driver::{MgmtFrame, ReasonCode};
use crate::node::{NodeFlags, NodeState, WifiNode};
use crate::{MacAddr, Result, WifiError, MAX_AID};

/// Stable handle to a node slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

/// Arena of node slots plus the ordered address index
#[derive(Debug)]
pub struct NodeTable {
    slots: Vec<Option<WifiNode>>,
    free: Vec<u32>,
    by_addr: BTreeMap<MacAddr, NodeId>,
    /// Generation counter for the eviction walk
    pub(crate) scan_gen: u32,
    /// Set once the first non-station node is stored; the daemon starts
    /// the ageing pass when it sees this
    pub(crate) inact_timer_armed: bool,
}

impl NodeTable {
    pub(crate) fn new(_max_nodes: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_addr: BTreeMap::new(),
            scan_gen: 0,
            inact_timer_armed: false,
        }
    }

    /// Store a node in the arena without indexing it (sentinel, or a
    /// fresh allocation awaiting `setup_node`).
    pub(crate) fn insert_unindexed(&mut self, node: WifiNode) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(node);
            NodeId(idx)
        } else {
            self.slots.push(Some(node));
            NodeId(self.slots.len() as u32 - 1)
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&WifiNode> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut WifiNode> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub(crate) fn index(&mut self, id: NodeId, addr: MacAddr) {
        self.by_addr.insert(addr, id);
    }

    pub(crate) fn lookup(&self, addr: &MacAddr) -> Option<NodeId> {
        self.by_addr.get(addr).copied()
    }

    /// Distinct keys in the index; the capacity bound applies to this.
    pub(crate) fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Indexed node handles in key order
    pub(crate) fn ids_in_order(&self) -> Vec<NodeId> {
        self.by_addr.values().copied().collect()
    }

    fn remove(&mut self, id: NodeId, addr: &MacAddr) {
        if self.by_addr.get(addr) == Some(&id) {
            self.by_addr.remove(addr);
        }
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }
}

impl WifiContext {
    /// Allocate a fresh node slot. When the table is at capacity the
    /// eviction pass runs first; if it frees nothing the allocation fails
    /// and the caller proceeds without the candidate.
    pub fn alloc_node(&mut self) -> Result<NodeId> {
        if self.table.len() >= self.config.max_nodes {
            self.clean_nodes();
            if self.table.len() >= self.config.max_nodes {
                self.stats.alloc_failures += 1;
                log::warn!(
                    "node allocation failed, table at capacity ({})",
                    self.config.max_nodes
                );
                return Err(WifiError::TableFull);
            }
        }
        self.stats.nodes_allocated += 1;
        Ok(self.table.insert_unindexed(WifiNode::new([0; 6])))
    }

    /// Assign identity and insert the node into the table.
    pub fn setup_node(&mut self, id: NodeId, addr: MacAddr) {
        let role = self.config.role;
        if let Some(node) = self.table.get_mut(id) {
            node.addr = addr;
            node.state = NodeState::Cache;
            node.touch();
        } else {
            return;
        }
        self.table.index(id, addr);
        log::debug!("node {} stored", crate::addr_string(&addr));

        if role != WifiRole::Station && !self.table.inact_timer_armed {
            self.table.inact_timer_armed = true;
        }
    }

    /// Exact-key lookup
    pub fn find_node(&self, addr: &MacAddr) -> Option<NodeId> {
        self.table.lookup(addr)
    }

    /// Find a peer's node, allocating and setting one up on first
    /// sighting.
    pub fn node_for(&mut self, addr: MacAddr) -> Result<NodeId> {
        if let Some(id) = self.find_node(&addr) {
            return Ok(id);
        }
        let id = self.alloc_node()?;
        self.setup_node(id, addr);
        Ok(id)
    }

    /// Allocate a node for a peer that must be represented without a
    /// scan result, copying channel/BSSID context from the current BSS
    /// (ad-hoc fast path, unknown unicast sender).
    pub fn dup_from_bss(&mut self, addr: MacAddr) -> Result<NodeId> {
        let (chan, bssid) = {
            let bss = self.current_bss();
            (bss.chan, bss.bssid)
        };
        let id = self.alloc_node()?;
        self.setup_node(id, addr);
        if let Some(node) = self.table.get_mut(id) {
            node.chan = chan;
            node.bssid = bssid;
        }
        Ok(id)
    }

    /// Take an external strong reference on a node.
    pub fn ref_node(&mut self, id: NodeId) {
        if let Some(node) = self.table.get_mut(id) {
            node.refcnt += 1;
        }
    }

    /// Drop an external reference. Destroys the node only once it is
    /// unreferenced and already marked for collection.
    pub fn release_node(&mut self, id: NodeId) {
        let free = match self.table.get_mut(id) {
            Some(node) => {
                node.refcnt = node.refcnt.saturating_sub(1);
                node.refcnt == 0 && node.state == NodeState::Collect
            }
            None => false,
        };
        if free {
            self.free_node(id);
        }
    }

    /// Unconditionally destroy a node: clear its AID, cancel its timers,
    /// purge its pending output, unindex it and reclaim the slot.
    ///
    /// # Panics
    ///
    /// Panics if called on the current-BSS node. That node is permanently
    /// owned; reaching here means reference accounting upstream is
    /// corrupt and continuing would leave dangling pointers.
    pub fn free_node(&mut self, id: NodeId) {
        if id == self.bss {
            panic!("free_node: attempt to free the current BSS node");
        }
        let (addr, eapol, sa_query) = match self.table.get_mut(id) {
            Some(node) => {
                node.associd = 0;
                node.state = NodeState::Collect;
                (
                    node.addr,
                    node.eapol_timer.take(),
                    node.sa_query_timer.take(),
                )
            }
            None => return,
        };
        if let Some(handle) = eapol {
            self.drivers.timer.cancel(handle);
        }
        if let Some(handle) = sa_query {
            self.drivers.timer.cancel(handle);
        }
        self.drivers.frame.purge_tx(addr);
        self.table.remove(id, &addr);
        log::debug!("node {} freed", crate::addr_string(&addr));
    }

    /// Apply `f` to every indexed node, in key order. `f` must not
    /// mutate the table.
    pub fn iterate_nodes<F: FnMut(&WifiNode)>(&self, mut f: F) {
        for id in self.table.ids_in_order() {
            if let Some(node) = self.table.get(id) {
                f(node);
            }
        }
    }

    /// Capacity eviction pass. Walks the table in key order, tagging each
    /// visited node with a fresh generation so a node revisited after a
    /// structural mutation is not processed twice, and evicts untagged
    /// unreferenced nodes until the table fits. Best effort: when the
    /// walk is exhausted no further allocation is possible until
    /// references are released.
    pub fn clean_nodes(&mut self) {
        self.table.scan_gen = self.table.scan_gen.wrapping_add(1);
        let gen = self.table.scan_gen;
        let role = self.config.role;
        let max = self.config.max_nodes;

        for id in self.table.ids_in_order() {
            if self.table.len() < max {
                break;
            }
            let (addr, evict) = match self.table.get_mut(id) {
                Some(node) => {
                    if node.scangen == gen {
                        continue;
                    }
                    node.scangen = gen;
                    (node.addr, node.refcnt == 0)
                }
                None => continue,
            };
            if !evict {
                continue;
            }
            if role == WifiRole::HostAp {
                if let Err(e) = self.drivers.frame.send_mgmt(
                    addr,
                    MgmtFrame::Deauth {
                        reason: ReasonCode::AuthExpired,
                    },
                ) {
                    log::warn!("deauth to {} failed: {}", crate::addr_string(&addr), e);
                }
            }
            self.free_node(id);
            self.stats.nodes_evicted += 1;
        }
    }

    /// Flush every indexed node; stale sightings are not trusted across a
    /// new scan.
    pub(crate) fn free_all_nodes(&mut self) {
        for id in self.table.ids_in_order() {
            self.free_node(id);
        }
    }

    /// Inactivity pass. Bumps every node's inactivity counter and frees
    /// unreferenced cached nodes that have gone quiet for too long.
    pub fn age_nodes(&mut self) {
        let limit = self.config.max_node_inactivity;
        let role = self.config.role;

        for id in self.table.ids_in_order() {
            let (addr, expire) = match self.table.get_mut(id) {
                Some(node) => {
                    node.inact += 1;
                    (
                        node.addr,
                        node.refcnt == 0
                            && node.state == NodeState::Cache
                            && node.inact > limit,
                    )
                }
                None => continue,
            };
            if !expire {
                continue;
            }
            if role == WifiRole::HostAp {
                let _ = self.drivers.frame.send_mgmt(
                    addr,
                    MgmtFrame::Deauth {
                        reason: ReasonCode::AuthExpired,
                    },
                );
            }
            self.free_node(id);
            self.stats.nodes_aged_out += 1;
        }
    }

    /// Whether the ageing pass should be running
    pub fn inactivity_timer_armed(&self) -> bool {
        self.table.inact_timer_armed
    }

    /// A station passed authentication with us (AP role): advance it to
    /// `Auth` so a subsequent association request is accepted.
    pub fn node_auth(&mut self, id: NodeId) {
        if let Some(node) = self.table.get_mut(id) {
            node.state = NodeState::Auth;
            node.touch();
            log::debug!("station {} authenticated", crate::addr_string(&node.addr));
        }
    }

    /// A station completed association with us (AP role): assign the
    /// lowest unused AID, move the node to `Assoc` and kick off security.
    /// A station that never authenticated is refused and told why.
    pub fn node_join(&mut self, id: NodeId) {
        let aid = self.next_aid();
        let (addr, rsn) = match self.table.get_mut(id) {
            Some(node) => {
                if !matches!(node.state, NodeState::Auth | NodeState::Assoc) {
                    let addr = node.addr;
                    log::debug!(
                        "station {} associating without authentication, refused",
                        crate::addr_string(&addr)
                    );
                    let _ = self.drivers.frame.send_mgmt(
                        addr,
                        MgmtFrame::Deauth {
                            reason: ReasonCode::NotAuthenticated,
                        },
                    );
                    return;
                }
                node.associd = aid;
                node.state = NodeState::Assoc;
                node.touch();
                (node.addr, self.config.rsn.enabled)
            }
            None => return,
        };
        log::info!("station {} joined, aid {}", crate::addr_string(&addr), aid);
        self.push_event(WifiEvent::NodeJoined { addr, aid });

        if rsn {
            self.node_join_rsn(id);
        } else if let Some(node) = self.table.get_mut(id) {
            node.flags.insert(NodeFlags::PORT_VALID);
            self.push_event(WifiEvent::LinkSecured { addr });
        }
    }

    /// A station left (AP role): tear down security state, clear its AID
    /// and mark it for collection. The slot is reclaimed immediately when
    /// nothing else references it.
    pub fn node_leave(&mut self, id: NodeId) {
        if self.config.rsn.enabled {
            self.node_leave_rsn(id);
        }
        let (addr, free) = match self.table.get_mut(id) {
            Some(node) => {
                node.associd = 0;
                node.state = NodeState::Collect;
                (node.addr, node.refcnt == 0)
            }
            None => return,
        };
        log::info!("station {} left", crate::addr_string(&addr));
        self.push_event(WifiEvent::NodeLeft { addr });
        if free {
            self.free_node(id);
        }
    }

    fn next_aid(&self) -> u16 {
        let mut used: Vec<u16> = Vec::new();
        self.iterate_nodes(|node| {
            if node.associd != 0 {
                used.push(node.associd);
            }
        });
        (1..=MAX_AID).find(|aid| !used.contains(aid)).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WifiConfig;
    use crate::context::WifiContext;
    use crate::driver::{DriverCall, Drivers, RecordingDriver};

    fn ctx_with(config: WifiConfig) -> WifiContext {
        WifiContext::new(config, Drivers::null()).unwrap()
    }

    fn ctx() -> WifiContext {
        ctx_with(WifiConfig::default())
    }

    #[test]
    fn test_setup_find_round_trip() {
        let mut ctx = ctx();
        let addr = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

        let id = ctx.alloc_node().unwrap();
        ctx.setup_node(id, addr);

        assert_eq!(ctx.find_node(&addr), Some(id));
        assert_eq!(ctx.node(id).unwrap().addr, addr);
        assert_eq!(ctx.node(id).unwrap().state, NodeState::Cache);
    }

    #[test]
    fn test_release_keeps_referenced_node() {
        let mut ctx = ctx();
        let id = ctx.node_for([1; 6]).unwrap();
        ctx.ref_node(id);
        ctx.ref_node(id);

        if let Some(node) = ctx.node_mut(id) {
            node.state = NodeState::Collect;
        }
        ctx.release_node(id);
        // one reference remains, node must survive
        assert!(ctx.node(id).is_some());

        ctx.release_node(id);
        assert!(ctx.node(id).is_none());
    }

    #[test]
    fn test_release_without_collect_keeps_node() {
        let mut ctx = ctx();
        let id = ctx.node_for([1; 6]).unwrap();
        ctx.ref_node(id);
        ctx.release_node(id);
        // refcnt is zero but state is Cache, not Collect
        assert!(ctx.node(id).is_some());
    }

    #[test]
    fn test_capacity_bound_after_clean() {
        let mut config = WifiConfig::default();
        config.max_nodes = 4;
        let mut ctx = ctx_with(config);

        for i in 0..4u8 {
            ctx.node_for([i, 0, 0, 0, 0, 1]).unwrap();
        }
        assert_eq!(ctx.node_count(), 4);

        // fifth allocation must evict one unreferenced cache node
        ctx.node_for([9, 0, 0, 0, 0, 1]).unwrap();
        assert!(ctx.node_count() <= 4);
        assert_eq!(ctx.stats.nodes_evicted, 1);
    }

    #[test]
    fn test_alloc_fails_when_all_referenced() {
        let mut config = WifiConfig::default();
        config.max_nodes = 2;
        let mut ctx = ctx_with(config);

        let a = ctx.node_for([1, 0, 0, 0, 0, 1]).unwrap();
        let b = ctx.node_for([2, 0, 0, 0, 0, 1]).unwrap();
        ctx.ref_node(a);
        ctx.ref_node(b);

        assert!(matches!(
            ctx.node_for([3, 0, 0, 0, 0, 1]),
            Err(WifiError::TableFull)
        ));
        assert_eq!(ctx.stats.alloc_failures, 1);
        assert_eq!(ctx.node_count(), 2);
    }

    #[test]
    fn test_eviction_skips_generation_tagged_nodes() {
        let mut config = WifiConfig::default();
        config.max_nodes = 2;
        let mut ctx = ctx_with(config);

        let a = ctx.node_for([1, 0, 0, 0, 0, 1]).unwrap();
        ctx.node_for([2, 0, 0, 0, 0, 1]).unwrap();

        // pre-tag node a with the generation the next pass will use
        let gen = ctx.table.scan_gen.wrapping_add(1);
        ctx.node_mut(a).unwrap().scangen = gen;

        ctx.clean_nodes();
        // a was skipped, the other node was evicted instead
        assert!(ctx.node(a).is_some());
        assert_eq!(ctx.node_count(), 1);
    }

    #[test]
    fn test_eviction_sends_deauth_in_ap_role() {
        let rec = RecordingDriver::new();
        let mut config = WifiConfig::default();
        config.role = WifiRole::HostAp;
        config.max_nodes = 1;
        let mut ctx = WifiContext::new(config, rec.drivers()).unwrap();

        ctx.node_for([5; 6]).unwrap();
        // next allocation forces eviction of the only (unreferenced) node
        ctx.node_for([6; 6]).unwrap();

        assert!(rec.calls().iter().any(|c| matches!(
            c,
            DriverCall::Mgmt {
                addr,
                frame: MgmtFrame::Deauth {
                    reason: ReasonCode::AuthExpired
                }
            } if *addr == [5; 6]
        )));
    }

    #[test]
    #[should_panic(expected = "current BSS")]
    fn test_free_current_bss_panics() {
        let mut ctx = ctx();
        let bss = ctx.bss_id();
        ctx.free_node(bss);
    }

    #[test]
    fn test_dup_from_bss_copies_context() {
        let mut ctx = ctx();
        ctx.current_bss_mut().chan = 11;
        ctx.current_bss_mut().bssid = [9; 6];

        let id = ctx.dup_from_bss([3; 6]).unwrap();
        let node = ctx.node(id).unwrap();
        assert_eq!(node.chan, 11);
        assert_eq!(node.bssid, [9; 6]);
        assert_eq!(node.addr, [3; 6]);
    }

    #[test]
    fn test_age_nodes_spares_referenced() {
        let mut config = WifiConfig::default();
        config.max_node_inactivity = 1;
        let mut ctx = ctx_with(config);

        let held = ctx.node_for([1, 0, 0, 0, 0, 1]).unwrap();
        let idle = ctx.node_for([2, 0, 0, 0, 0, 1]).unwrap();
        ctx.ref_node(held);

        ctx.age_nodes();
        ctx.age_nodes();
        assert!(ctx.node(held).is_some());
        assert!(ctx.node(idle).is_none());
        assert_eq!(ctx.stats.nodes_aged_out, 1);
    }

    #[test]
    fn test_node_join_assigns_lowest_aid() {
        let mut config = WifiConfig::default();
        config.role = WifiRole::HostAp;
        let mut ctx = ctx_with(config);

        let a = ctx.node_for([1, 0, 0, 0, 0, 1]).unwrap();
        let b = ctx.node_for([2, 0, 0, 0, 0, 1]).unwrap();
        ctx.node_auth(a);
        ctx.node_auth(b);
        ctx.node_join(a);
        ctx.node_join(b);

        assert_eq!(ctx.node(a).unwrap().associd, 1);
        assert_eq!(ctx.node(b).unwrap().associd, 2);
        assert_eq!(ctx.node(a).unwrap().state, NodeState::Assoc);

        ctx.node_leave(a);
        assert!(ctx.node(a).is_none());

        let c = ctx.node_for([3, 0, 0, 0, 0, 1]).unwrap();
        ctx.node_auth(c);
        ctx.node_join(c);
        // freed AID is reused
        assert_eq!(ctx.node(c).unwrap().associd, 1);
    }

    #[test]
    fn test_association_requires_authentication() {
        let rec = RecordingDriver::new();
        let mut config = WifiConfig::default();
        config.role = WifiRole::HostAp;
        let mut ctx = WifiContext::new(config, rec.drivers()).unwrap();

        let id = ctx.node_for([7; 6]).unwrap();
        // straight from the scan cache, never authenticated
        ctx.node_join(id);
        assert_eq!(ctx.node(id).unwrap().state, NodeState::Cache);
        assert_eq!(ctx.node(id).unwrap().associd, 0);
        assert!(rec.calls().iter().any(|c| matches!(
            c,
            DriverCall::Mgmt {
                addr,
                frame: MgmtFrame::Deauth {
                    reason: ReasonCode::NotAuthenticated
                }
            } if *addr == [7; 6]
        )));

        ctx.node_auth(id);
        assert_eq!(ctx.node(id).unwrap().state, NodeState::Auth);
        ctx.node_join(id);
        assert_eq!(ctx.node(id).unwrap().state, NodeState::Assoc);
        assert_eq!(ctx.node(id).unwrap().associd, 1);
    }

    #[test]
    fn test_iterate_is_key_ordered() {
        let mut ctx = ctx();
        ctx.node_for([3, 0, 0, 0, 0, 1]).unwrap();
        ctx.node_for([1, 0, 0, 0, 0, 1]).unwrap();
        ctx.node_for([2, 0, 0, 0, 0, 1]).unwrap();

        let mut seen = Vec::new();
        ctx.iterate_nodes(|n| seen.push(n.addr[0]));
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
