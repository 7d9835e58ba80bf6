//! Scan engine
//!
//! Channel-set iteration state machine. `begin_scan` copies the active
//! channel plan into a scratch bitset and walks it one channel at a time;
//! each step is a non-blocking channel-switch request to the PHY, whose
//! completion re-enters through `channel_switch_done`. When the scratch
//! set is exhausted the selection pass in `bss` runs.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::config::{PhyMode, WifiRole};
use crate::context::WifiContext;
use crate::node::{CapInfo, NodeFlags};
use crate::rsn::{RsnInfo, RsnProto};
use crate::table::NodeId;
use crate::MacAddr;

bitflags! {
    /// Scan lock word. Empty means unlocked; `LOCKED` alone is a
    /// background scan; `REQUEST` marks an operator-requested scan whose
    /// caller must be woken on completion; `RESUME` records a begin
    /// request that arrived while a scan was locked, honored with a
    /// fresh scan once the running one completes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ScanLock: u8 {
        const LOCKED  = 0x01;
        const REQUEST = 0x02;
        const RESUME  = 0x04;
    }
}

/// Scan state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Scanning {
        /// Probe actively, or listen only
        active: bool,
    },
}

/// Fixed bitset over the 8-bit channel space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSet {
    words: [u64; 4],
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_channels(channels: &[u8]) -> Self {
        let mut set = Self::new();
        for &chan in channels {
            set.set(chan);
        }
        set
    }

    pub fn set(&mut self, chan: u8) {
        self.words[chan as usize / 64] |= 1 << (chan as usize % 64);
    }

    pub fn clear(&mut self, chan: u8) {
        self.words[chan as usize / 64] &= !(1 << (chan as usize % 64));
    }

    pub fn contains(&self, chan: u8) -> bool {
        self.words[chan as usize / 64] & (1 << (chan as usize % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Next set channel strictly after `start`, wrapping around; `None`
    /// when the set is empty.
    pub fn next_after(&self, start: u8) -> Option<u8> {
        let begin = start as u16 + 1;
        for c in begin..=255 {
            if self.contains(c as u8) {
                return Some(c as u8);
            }
        }
        for c in 0..=start as u16 {
            if self.contains(c as u8) {
                return Some(c as u8);
            }
        }
        None
    }
}

/// Network parameters extracted from a received beacon or probe response.
/// The frame decode itself happens in the input path; this carries only
/// what the node table stores.
#[derive(Debug, Clone, Default)]
pub struct BeaconInfo {
    pub addr: MacAddr,
    pub bssid: MacAddr,
    pub chan: u8,
    pub capinfo: u16,
    pub intval: u16,
    pub tsf: u64,
    pub rssi: i8,
    pub rates: Vec<u8>,
    pub ssid: Vec<u8>,
    pub erp: Option<u8>,
    /// RSN element body, version field onward
    pub rsn_ie: Option<Vec<u8>>,
    /// WPA1 vendor element body, version field onward
    pub wpa_ie: Option<Vec<u8>>,
}

impl WifiContext {
    /// Copy the full active channel plan into the scratch set of
    /// channels left to visit.
    pub fn reset_scan(&mut self) {
        self.chan_scan = ChannelSet::from_channels(&self.config.chan_active);
    }

    /// Start a scan. When one is already locked the request is only
    /// marked for resumption. Chooses active or passive mode by role (AP
    /// role always scans passively), flushes the node table since stale
    /// sightings are not trusted across a new scan, resets the PHY-mode
    /// iterator and steps to the first channel.
    pub fn begin_scan(&mut self) {
        if self.scan_lock.contains(ScanLock::LOCKED) {
            self.scan_lock.insert(ScanLock::RESUME);
            return;
        }
        self.scan_lock.insert(ScanLock::LOCKED);

        let active = !matches!(self.config.role, WifiRole::HostAp | WifiRole::Monitor);
        self.scan_state = ScanState::Scanning { active };
        log::info!(
            "begin {} scan, {} channels",
            if active { "active" } else { "passive" },
            self.config.chan_active.len()
        );

        self.free_all_nodes();
        self.cur_mode = 0;
        self.stats.scans_started += 1;
        self.reset_scan();
        self.cur_chan = 0;
        self.next_scan();
    }

    /// Operator-requested scan: the requester is woken with the outcome
    /// through a `ScanDone` event.
    pub fn scan_request(&mut self) {
        self.scan_lock.insert(ScanLock::REQUEST);
        self.begin_scan();
    }

    /// Advance to the next unvisited channel, skipping passive-only
    /// channels while probing actively. Runs selection when the scratch
    /// set is exhausted.
    pub fn next_scan(&mut self) {
        let active = match self.scan_state {
            ScanState::Scanning { active } => active,
            ScanState::Idle => return,
        };
        loop {
            let chan = match self.chan_scan.next_after(self.cur_chan) {
                Some(chan) => chan,
                None => {
                    self.end_scan();
                    return;
                }
            };
            self.chan_scan.clear(chan);
            if active && self.config.is_passive_chan(chan) {
                continue;
            }
            self.cur_chan = chan;
            log::debug!("scan: tuning to channel {}", chan);
            match self.drivers.phy.request_channel_switch(chan, active) {
                Ok(()) => return,
                Err(e) => {
                    log::warn!("channel switch to {} refused: {}", chan, e);
                    // skip the channel, the scan must keep moving
                }
            }
        }
    }

    /// PHY completion callback: one channel-switch + probe/listen cycle
    /// finished. Ignored when no scan holds the lock (a stale completion
    /// after the scan ended).
    pub fn channel_switch_done(&mut self) {
        if !self.scan_lock.contains(ScanLock::LOCKED) {
            return;
        }
        self.next_scan();
    }

    /// Advance the PHY-mode fallback iterator. Returns `false` once every
    /// configured mode has been tried and the iterator wrapped.
    pub(crate) fn next_mode(&mut self) -> bool {
        self.cur_mode += 1;
        if self.cur_mode >= self.config.phy_modes.len() {
            self.cur_mode = 0;
            return false;
        }
        true
    }

    /// PHY mode the scan is currently trying
    pub fn current_phy_mode(&self) -> PhyMode {
        self.config
            .phy_modes
            .get(self.cur_mode)
            .copied()
            .unwrap_or_default()
    }

    /// Receive-path entry: record or refresh the node for a beacon or
    /// probe response. Allocation failure is absorbed; the sighting is
    /// simply dropped this round.
    pub fn process_beacon(&mut self, info: BeaconInfo) -> Option<NodeId> {
        let id = match self.node_for(info.addr) {
            Ok(id) => id,
            Err(_) => return None,
        };

        let rsn = info
            .rsn_ie
            .as_deref()
            .and_then(|body| match RsnInfo::parse(body, RsnProto::Rsn) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    log::debug!("invalid RSN element from {}: {}", crate::addr_string(&info.addr), e);
                    None
                }
            });
        let wpa = info
            .wpa_ie
            .as_deref()
            .and_then(|body| RsnInfo::parse(body, RsnProto::Wpa).ok());

        let node = self.node_mut(id)?;
        node.bssid = info.bssid;
        node.chan = info.chan;
        node.capinfo = CapInfo::from_bits_truncate(info.capinfo);
        node.intval = info.intval;
        node.tsf = info.tsf;
        node.rssi = info.rssi;
        if !info.rates.is_empty() {
            node.rates = info.rates;
        }
        if !info.ssid.is_empty() {
            node.ssid = info.ssid;
        }
        if let Some(erp) = info.erp {
            node.erp = erp;
            node.flags.insert(NodeFlags::ERP);
        }

        node.rsn_protos = crate::rsn::RsnProtoSet::empty();
        node.rsn_akms = crate::rsn::AkmSet::empty();
        node.rsn_ciphers = crate::rsn::CipherSet::empty();
        for parsed in [&wpa, &rsn].into_iter().flatten() {
            parsed.apply_to(node);
        }
        node.touch();
        Some(id)
    }
}
