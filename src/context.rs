//! Node manager context
//!
//! [`WifiContext`] owns every piece of mutable state in this subsystem:
//! the node table, the scan state machine, the current-BSS node and the
//! collaborator handles. Callers wrap it in a single mutex and hold that
//! mutex for the duration of each operation, including completion
//! callbacks re-entering from collaborators; there is no finer-grained
//! locking anywhere below this type.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WifiConfig;
use crate::driver::Drivers;
use crate::node::WifiNode;
use crate::scan::{ChannelSet, ScanLock, ScanState};
use crate::table::{NodeId, NodeTable};
use crate::{MacAddr, Result};

/// Subsystem counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiStats {
    /// Node allocations refused because eviction freed nothing
    pub alloc_failures: u64,
    /// Nodes created
    pub nodes_allocated: u64,
    /// Nodes removed by the capacity eviction pass
    pub nodes_evicted: u64,
    /// Nodes removed by the inactivity pass
    pub nodes_aged_out: u64,
    /// Scans started
    pub scans_started: u64,
    /// Scans that reached selection
    pub scans_completed: u64,
    /// Selection rounds that found no compatible candidate in any mode
    pub scan_no_match: u64,
    /// Candidates excluded for rate-set incompatibility
    pub rate_mismatches: u64,
    /// Candidates excluded for RSN incompatibility
    pub rsn_mismatches: u64,
    /// IBSS merges performed
    pub merges: u64,
    /// Start time
    pub start_time: SystemTime,
}

impl Default for WifiStats {
    fn default() -> Self {
        Self {
            alloc_failures: 0,
            nodes_allocated: 0,
            nodes_evicted: 0,
            nodes_aged_out: 0,
            scans_started: 0,
            scans_completed: 0,
            scan_no_match: 0,
            rate_mismatches: 0,
            rsn_mismatches: 0,
            merges: 0,
            start_time: SystemTime::now(),
        }
    }
}

impl WifiStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get uptime duration
    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.start_time)
            .unwrap_or_default()
    }
}

/// Notifications produced for the layers above (output path, bridging,
/// operator tooling). Drained from the context's event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    /// A scan finished; `found` tells a blocked requester whether
    /// selection produced a network
    ScanDone { found: bool },
    /// Selection committed to a network; security may still be pending
    JoinStarted { bssid: MacAddr, ssid: Vec<u8> },
    /// A station associated (AP role)
    NodeJoined { addr: MacAddr, aid: u16 },
    /// A station left or was expired (AP role)
    NodeLeft { addr: MacAddr },
    /// No candidate matched and a fresh IBSS/AP context was synthesized
    IbssCreated { bssid: MacAddr, chan: u8 },
    /// IBSS convergence adopted a foreign network; channel/BSSID dependent
    /// state must be re-applied by the caller
    NeedsReset { bssid: MacAddr },
    /// The link is security-complete and the port is open
    LinkSecured { addr: MacAddr },
}

/// All mutable state of the 802.11 node manager
#[derive(Debug)]
pub struct WifiContext {
    /// Context instance id
    pub id: Uuid,
    /// Configuration
    pub config: WifiConfig,
    /// The node table
    pub(crate) table: NodeTable,
    /// Permanent current-BSS node; never freed, identity swapped in place
    pub(crate) bss: NodeId,
    /// Scan state machine
    pub scan_state: ScanState,
    /// Scan lock
    pub scan_lock: ScanLock,
    /// Channels left to visit in the current scan
    pub(crate) chan_scan: ChannelSet,
    /// Channel the scan last tuned to
    pub(crate) cur_chan: u8,
    /// Index into `config.phy_modes` for the fallback iterator
    pub(crate) cur_mode: usize,
    /// Collaborator seams
    pub drivers: Drivers,
    /// Counters
    pub stats: WifiStats,
    events: VecDeque<WifiEvent>,
}

impl WifiContext {
    /// Create a context. Allocates the permanent sentinel current-BSS
    /// node so there is never a no-link null.
    pub fn new(config: WifiConfig, drivers: Drivers) -> Result<Self> {
        config.validate()?;

        let mut table = NodeTable::new(config.max_nodes);
        let mut sentinel = WifiNode::new(config.local_addr);
        sentinel.refcnt = 1; // permanently owned
        let bss = table.insert_unindexed(sentinel);

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            table,
            bss,
            scan_state: ScanState::Idle,
            scan_lock: ScanLock::empty(),
            chan_scan: ChannelSet::new(),
            cur_chan: 0,
            cur_mode: 0,
            drivers,
            stats: WifiStats::new(),
            events: VecDeque::new(),
        })
    }

    /// Handle of the current-BSS node
    pub fn bss_id(&self) -> NodeId {
        self.bss
    }

    /// The active operating context
    pub fn current_bss(&self) -> &WifiNode {
        self.table
            .get(self.bss)
            .expect("current BSS node must always exist")
    }

    pub(crate) fn current_bss_mut(&mut self) -> &mut WifiNode {
        self.table
            .get_mut(self.bss)
            .expect("current BSS node must always exist")
    }

    /// Look up a node by handle
    pub fn node(&self, id: NodeId) -> Option<&WifiNode> {
        self.table.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut WifiNode> {
        self.table.get_mut(id)
    }

    /// Number of nodes currently indexed in the table
    pub fn node_count(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn push_event(&mut self, event: WifiEvent) {
        log::debug!("event: {:?}", event);
        self.events.push_back(event);
    }

    /// Pop the oldest pending notification
    pub fn poll_event(&mut self) -> Option<WifiEvent> {
        self.events.pop_front()
    }

    /// Drain all pending notifications
    pub fn drain_events(&mut self) -> Vec<WifiEvent> {
        self.events.drain(..).collect()
    }
}
