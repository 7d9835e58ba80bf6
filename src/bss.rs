//! BSS candidate filtering and selection
//!
//! `match_bss` scores one scan-cache node against the local configuration
//! and returns the full failure mask; selection at end of scan picks the
//! compatible candidate with the strictly greatest signal. With no
//! candidate the engine synthesizes an AP/IBSS context where the role
//! allows it, or falls through the PHY-mode iterator and keeps scanning.

use bitflags::bitflags;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::WifiRole;
use crate::context::{WifiContext, WifiEvent};
use crate::node::{CapInfo, NodeFlags, NodeState, WifiNode};
use crate::rsn::{RSN_CAP_MFPC, RSN_CAP_MFPR};
use crate::scan::{ScanLock, ScanState};
use crate::table::NodeId;

bitflags! {
    /// Per-check failure bits from `match_bss`. Every check always runs
    /// so the complete mask is available for diagnostics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MatchFail: u8 {
        /// Channel not usable or not the pinned channel
        const CHANNEL = 0x01;
        /// ESS/IBSS capability does not fit the local role
        const CAPINFO = 0x02;
        /// Privacy bit contradicts the local security configuration
        const PRIVACY = 0x04;
        /// No compatible mandatory rate
        const RATES   = 0x08;
        /// SSID differs from the configured one
        const SSID    = 0x10;
        /// BSSID differs from the pinned one
        const BSSID   = 0x20;
        /// Any RSN parameter incompatibility
        const RSN     = 0x40;
    }
}

impl WifiContext {
    /// Evaluate one candidate against the local configuration. Returns
    /// the OR of every failed check; an empty mask means fully
    /// compatible.
    pub fn match_bss(&self, node: &WifiNode) -> MatchFail {
        let config = &self.config;
        let mut fail = MatchFail::empty();

        if !config.chan_active.contains(&node.chan) {
            fail |= MatchFail::CHANNEL;
        }
        if let Some(pinned) = config.des_chan {
            if node.chan != pinned {
                fail |= MatchFail::CHANNEL;
            }
        }

        match config.role {
            WifiRole::Station => {
                if !node.capinfo.contains(CapInfo::ESS) {
                    fail |= MatchFail::CAPINFO;
                }
            }
            WifiRole::Ibss => {
                if !node.capinfo.contains(CapInfo::IBSS) {
                    fail |= MatchFail::CAPINFO;
                }
            }
            _ => {}
        }

        if config.privacy_enabled() != node.capinfo.contains(CapInfo::PRIVACY) {
            fail |= MatchFail::PRIVACY;
        }

        if !node.has_compatible_basic_rate(&config.rates) {
            fail |= MatchFail::RATES;
        }

        if let Some(des_ssid) = &config.des_ssid {
            if node.ssid != *des_ssid {
                fail |= MatchFail::SSID;
            }
        }

        if let Some(des_bssid) = &config.des_bssid {
            if node.bssid != *des_bssid {
                fail |= MatchFail::BSSID;
            }
        }

        if config.rsn.enabled && !self.rsn_compatible(node) {
            fail |= MatchFail::RSN;
        }

        fail
    }

    /// Protocol, AKM, pairwise cipher, group cipher and MFP must each be
    /// satisfiable; one shared failure bit covers them all.
    fn rsn_compatible(&self, node: &WifiNode) -> bool {
        let rsn = &self.config.rsn;
        if !node.rsn_protos.intersects(rsn.protos) {
            return false;
        }
        if !node.rsn_akms.intersects(rsn.akms) {
            return false;
        }
        if !node.rsn_ciphers.intersects(rsn.ciphers) {
            return false;
        }
        if !rsn.group_ciphers.contains(node.rsn_group_cipher.as_set()) {
            return false;
        }
        // MFP: we may require it of the peer, the peer may require it of us
        if rsn.mfp_required && node.rsn_caps & RSN_CAP_MFPC == 0 {
            return false;
        }
        if node.rsn_caps & RSN_CAP_MFPR != 0 && !rsn.mfp_capable {
            return false;
        }
        true
    }

    /// Selection at the end of a scan pass. In AP role this synthesizes
    /// a BSS on the least-occupied channel straight away; otherwise the
    /// best fully-compatible candidate is joined, or the fallback chain
    /// runs.
    pub fn end_scan(&mut self) {
        self.stats.scans_completed += 1;

        if self.config.role == WifiRole::HostAp {
            let chan = self.least_occupied_channel();
            self.create_ibss(chan);
            return;
        }

        let mut evaluated = Vec::new();
        for id in self.table.ids_in_order() {
            if let Some(node) = self.table.get(id) {
                if node.fails > 0 {
                    continue;
                }
                evaluated.push((id, node.rssi, self.match_bss(node)));
            }
        }

        // Strictly-greater comparison: the first candidate to reach a
        // signal level wins over later equal ones. Deliberate, the tie
        // rule is user visible.
        let mut best: Option<(NodeId, i8)> = None;
        for (id, rssi, mask) in evaluated {
            if mask.contains(MatchFail::RATES) {
                self.stats.rate_mismatches += 1;
            }
            if mask.contains(MatchFail::RSN) {
                self.stats.rsn_mismatches += 1;
            }
            if !mask.is_empty() {
                continue;
            }
            match best {
                Some((_, best_rssi)) if rssi <= best_rssi => {}
                _ => best = Some((id, rssi)),
            }
        }

        match best {
            Some((id, _)) => self.join_bss(id),
            None => self.scan_fallback(),
        }
    }

    /// Adopt the winning candidate: its contents are copied into the
    /// current-BSS node's stable slot, so every external holder of the
    /// BSS handle stays valid across selection.
    fn join_bss(&mut self, id: NodeId) {
        let winner = match self.table.get(id) {
            Some(node) => node.clone(),
            None => {
                self.scan_fallback();
                return;
            }
        };
        log::info!(
            "selected {} on channel {}, rssi {}",
            crate::addr_string(&winner.bssid),
            winner.chan,
            winner.rssi
        );

        let rsn = self.config.rsn.enabled
            && winner.rsn_protos.intersects(self.config.rsn.protos);

        let bss = self.current_bss_mut();
        bss.copy_network(&winner);
        bss.state = NodeState::Bss;
        self.push_event(WifiEvent::JoinStarted {
            bssid: winner.bssid,
            ssid: winner.ssid.clone(),
        });

        if rsn {
            self.choose_rsnparams();
        } else {
            let bss = self.current_bss_mut();
            bss.flags.insert(NodeFlags::PORT_VALID | NodeFlags::RSN_DONE);
            let addr = bss.addr;
            self.push_event(WifiEvent::LinkSecured { addr });
        }
        self.finish_scan(true);
    }

    /// No compatible candidate: IBSS role with a configured SSID starts
    /// its own network; otherwise try the next PHY mode, and once all
    /// modes are exhausted wake any blocked requester with failure and
    /// resume scanning from the top.
    fn scan_fallback(&mut self) {
        if self.config.role == WifiRole::Ibss && self.config.des_ssid.is_some() {
            let chan = self
                .config
                .des_chan
                .or_else(|| self.config.chan_active.first().copied())
                .unwrap_or(1);
            self.create_ibss(chan);
            return;
        }

        if self.next_mode() {
            log::debug!("no match, trying PHY mode {:?}", self.current_phy_mode());
            self.reset_scan();
            self.next_scan();
            return;
        }

        self.stats.scan_no_match += 1;
        log::info!("no suitable network found in any PHY mode");
        if self.scan_lock.contains(ScanLock::REQUEST) {
            self.push_event(WifiEvent::ScanDone { found: false });
            self.scan_lock.remove(ScanLock::REQUEST);
        }

        // an active plan of purely passive channels can never be probed
        if let ScanState::Scanning { active: true } = self.scan_state {
            if self
                .config
                .chan_active
                .iter()
                .all(|c| self.config.is_passive_chan(*c))
            {
                self.scan_state = ScanState::Scanning { active: false };
            }
        }
        self.reset_scan();
        self.next_scan();
    }

    /// Synthesize a fresh AP/IBSS operating context in the current-BSS
    /// node.
    pub(crate) fn create_ibss(&mut self, chan: u8) {
        let config = &self.config;
        let mut bssid = config.local_addr;
        if config.role == WifiRole::Ibss {
            // locally administered, randomized ad-hoc BSSID
            bssid[0] |= 0x02;
            rand::thread_rng().fill(&mut bssid[1..5]);
        }

        let ssid = config.des_ssid.clone().unwrap_or_default();
        let mut capinfo = if config.role == WifiRole::Ibss {
            CapInfo::IBSS
        } else {
            CapInfo::ESS
        };
        if config.privacy_enabled() {
            capinfo |= CapInfo::PRIVACY;
        }
        let local_addr = config.local_addr;
        let rates = config.rates.clone();

        let bss = self.current_bss_mut();
        bss.addr = local_addr;
        bss.bssid = bssid;
        bss.chan = chan;
        bss.ssid = ssid;
        bss.capinfo = capinfo;
        bss.rates = rates;
        bss.state = NodeState::Bss;

        log::info!(
            "created own network {} on channel {}",
            crate::addr_string(&bssid),
            chan
        );
        self.push_event(WifiEvent::IbssCreated { bssid, chan });
        self.finish_scan(true);
    }

    /// Least-occupied active channel by cached-node count, or a random
    /// active channel when every one is occupied.
    fn least_occupied_channel(&self) -> u8 {
        let mut best_chan = None;
        let mut best_count = usize::MAX;
        for &chan in &self.config.chan_active {
            let mut count = 0;
            self.iterate_nodes(|node| {
                if node.chan == chan {
                    count += 1;
                }
            });
            if count < best_count {
                best_count = count;
                best_chan = Some(chan);
            }
        }
        if best_count > 0 {
            let idx = rand::thread_rng().gen_range(0..self.config.chan_active.len());
            return self.config.chan_active[idx];
        }
        best_chan.unwrap_or(1)
    }

    /// Release the scan lock, waking a blocked requester. A begin request
    /// that arrived while the lock was held starts its scan now.
    fn finish_scan(&mut self, found: bool) {
        self.scan_state = ScanState::Idle;
        if self.scan_lock.contains(ScanLock::REQUEST) {
            self.push_event(WifiEvent::ScanDone { found });
        }
        let resume = self.scan_lock.contains(ScanLock::RESUME);
        self.scan_lock = ScanLock::empty();
        if resume {
            self.begin_scan();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhyMode, WifiConfig};
    use crate::driver::Drivers;
    use crate::rsn::{AkmSet, CipherSet, RsnCipher, RsnProtoSet};
    use crate::MacAddr;

    fn ctx_with(config: WifiConfig) -> WifiContext {
        WifiContext::new(config, Drivers::null()).unwrap()
    }

    fn base_config() -> WifiConfig {
        let mut config = WifiConfig::default();
        config.chan_active = vec![1, 6, 11];
        config.phy_modes = vec![PhyMode::Auto];
        config
    }

    /// Insert a filter-passing infrastructure candidate.
    fn add_candidate(ctx: &mut WifiContext, addr: MacAddr, chan: u8, rssi: i8) -> NodeId {
        let id = ctx.node_for(addr).unwrap();
        let node = ctx.node_mut(id).unwrap();
        node.bssid = addr;
        node.chan = chan;
        node.capinfo = CapInfo::ESS;
        node.rates = vec![0x82, 0x84];
        node.rssi = rssi;
        node.ssid = b"net".to_vec();
        id
    }

    #[test]
    fn test_match_bss_all_checks_run() {
        let mut config = base_config();
        config.des_ssid = Some(b"wanted".to_vec());
        config.des_bssid = Some([9; 6]);
        let ctx = ctx_with(config);

        let mut node = WifiNode::new([1; 6]);
        node.chan = 13; // not in plan
        node.capinfo = CapInfo::IBSS; // wrong for station role
        node.rates = vec![0xfe]; // basic rate we do not support
        node.ssid = b"other".to_vec();
        node.bssid = [8; 6];

        let mask = ctx.match_bss(&node);
        assert!(mask.contains(MatchFail::CHANNEL));
        assert!(mask.contains(MatchFail::CAPINFO));
        assert!(mask.contains(MatchFail::RATES));
        assert!(mask.contains(MatchFail::SSID));
        assert!(mask.contains(MatchFail::BSSID));
    }

    #[test]
    fn test_match_bss_privacy_mismatch() {
        let mut config = base_config();
        config.rsn.enabled = true;
        config.rsn.protos = RsnProtoSet::RSN;
        let ctx = ctx_with(config);

        let mut node = WifiNode::new([1; 6]);
        node.chan = 6;
        node.capinfo = CapInfo::ESS; // privacy bit missing
        node.rates = vec![0x82];

        let mask = ctx.match_bss(&node);
        assert!(mask.contains(MatchFail::PRIVACY));
    }

    #[test]
    fn test_privacy_required_candidate_excluded_despite_signal() {
        let mut config = base_config();
        config.rsn.enabled = true;
        config.rsn.protos = RsnProtoSet::RSN;
        let mut ctx = ctx_with(config);

        // open network, very strong
        let open = add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, -20);
        // protected network, weaker but compatible
        let secure = add_candidate(&mut ctx, [2, 0, 0, 0, 0, 1], 6, -60);
        {
            let node = ctx.node_mut(secure).unwrap();
            node.capinfo |= CapInfo::PRIVACY;
            node.rsn_protos = RsnProtoSet::RSN;
            node.rsn_akms = AkmSet::PSK;
            node.rsn_ciphers = CipherSet::CCMP;
            node.rsn_group_cipher = RsnCipher::Ccmp;
        }
        ctx.config.rsn.psk = Some([7; 32]);

        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();

        let open_bssid = ctx.node(open).map(|n| n.bssid);
        assert_ne!(Some(ctx.current_bss().bssid), open_bssid);
        assert_eq!(ctx.current_bss().bssid, [2, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_selection_prefers_strictly_greater_signal() {
        // observed order 10 then 20
        let mut ctx = ctx_with(base_config());
        add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, 10);
        add_candidate(&mut ctx, [2, 0, 0, 0, 0, 1], 6, 20);
        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();
        assert_eq!(ctx.current_bss().bssid, [2, 0, 0, 0, 0, 1]);

        // observed order 20 then 10
        let mut ctx = ctx_with(base_config());
        add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, 20);
        add_candidate(&mut ctx, [2, 0, 0, 0, 0, 1], 6, 10);
        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();
        assert_eq!(ctx.current_bss().bssid, [1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_selection_first_seen_wins_on_tie() {
        let mut ctx = ctx_with(base_config());
        add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, 20);
        add_candidate(&mut ctx, [2, 0, 0, 0, 0, 1], 6, 20);
        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();
        assert_eq!(ctx.current_bss().bssid, [1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_failed_nodes_skipped() {
        let mut ctx = ctx_with(base_config());
        let strong = add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, 30);
        add_candidate(&mut ctx, [2, 0, 0, 0, 0, 1], 6, 10);
        ctx.node_mut(strong).unwrap().fails = 2;

        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();
        assert_eq!(ctx.current_bss().bssid, [2, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_join_unlocks_and_wakes_requester() {
        let mut ctx = ctx_with(base_config());
        add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, 10);
        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED | ScanLock::REQUEST;
        ctx.end_scan();

        assert_eq!(ctx.scan_state, ScanState::Idle);
        assert_eq!(ctx.scan_lock, ScanLock::empty());
        let events = ctx.drain_events();
        assert!(events.contains(&WifiEvent::ScanDone { found: true }));
        assert!(events
            .iter()
            .any(|e| matches!(e, WifiEvent::JoinStarted { .. })));
    }

    #[test]
    fn test_open_join_is_immediately_secured() {
        let mut ctx = ctx_with(base_config());
        add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, 10);
        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();

        assert!(ctx.current_bss().flags.contains(NodeFlags::PORT_VALID));
        assert!(ctx
            .drain_events()
            .iter()
            .any(|e| matches!(e, WifiEvent::LinkSecured { .. })));
    }

    #[test]
    fn test_hostap_synthesizes_on_least_occupied_channel() {
        let mut config = base_config();
        config.role = WifiRole::HostAp;
        config.local_addr = [0xaa; 6];
        let mut ctx = ctx_with(config);

        // channels 1 and 6 occupied, 11 free
        add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 1, 10);
        add_candidate(&mut ctx, [2, 0, 0, 0, 0, 1], 6, 10);

        ctx.scan_state = ScanState::Scanning { active: false };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();

        let bss = ctx.current_bss();
        assert_eq!(bss.chan, 11);
        assert_eq!(bss.bssid, [0xaa; 6]);
        assert!(bss.capinfo.contains(CapInfo::ESS));
        assert!(ctx
            .drain_events()
            .iter()
            .any(|e| matches!(e, WifiEvent::IbssCreated { chan: 11, .. })));
    }

    #[test]
    fn test_ibss_fallback_creates_network() {
        let mut config = base_config();
        config.role = WifiRole::Ibss;
        config.des_ssid = Some(b"adhoc".to_vec());
        config.des_chan = Some(6);
        config.local_addr = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let mut ctx = ctx_with(config);

        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();

        let bss = ctx.current_bss();
        assert_eq!(bss.chan, 6);
        assert_eq!(bss.ssid, b"adhoc".to_vec());
        assert!(bss.capinfo.contains(CapInfo::IBSS));
        assert_ne!(bss.bssid, [0; 6]);
        // locally administered bit set on the synthesized BSSID
        assert_ne!(bss.bssid[0] & 0x02, 0);
    }

    #[test]
    fn test_rsn_mismatch_counted() {
        let mut config = base_config();
        config.rsn.enabled = true;
        config.rsn.protos = RsnProtoSet::RSN;
        config.rsn.akms = AkmSet::PSK;
        config.rsn.ciphers = CipherSet::CCMP;
        let mut ctx = ctx_with(config);

        let id = add_candidate(&mut ctx, [1, 0, 0, 0, 0, 1], 6, 10);
        {
            let node = ctx.node_mut(id).unwrap();
            node.capinfo |= CapInfo::PRIVACY;
            // WPA/TKIP only: RSN incompatible with local policy
            node.rsn_protos = RsnProtoSet::WPA;
            node.rsn_akms = AkmSet::PSK;
            node.rsn_ciphers = CipherSet::TKIP;
            node.rsn_group_cipher = RsnCipher::Tkip;
        }

        ctx.scan_state = ScanState::Scanning { active: true };
        ctx.scan_lock = ScanLock::LOCKED;
        ctx.end_scan();
        assert_eq!(ctx.stats.rsn_mismatches, 1);
    }
}
