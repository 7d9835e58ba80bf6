//! RSN parameter negotiation
//!
//! Parses the RSN/WPA information-element body into capability sets,
//! narrows an adopted network's advertised sets down to one negotiated
//! parameter tuple and kicks the key handshake off when a station joins.
//! The handshake itself runs in the external authenticator; this module
//! only decides how it starts and tears its state down on leave.

use std::time::Duration;

use bitflags::bitflags;
use bytes::Buf;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::WifiContext;
use crate::driver::{KeyDescriptor, TimerKind};
use crate::node::{NodeFlags, RsnHandshakeState, WifiNode};
use crate::table::NodeId;
use crate::{Result, WifiError, NONCE_LEN, PMKID_LEN};

/// Suite selector OUI of RSNA (802.11i) elements
pub const RSN_OUI: [u8; 3] = [0x00, 0x0f, 0xac];
/// Suite selector OUI of legacy vendor WPA elements
pub const WPA_OUI: [u8; 3] = [0x00, 0x50, 0xf2];

/// RSN capability field: peer requires management frame protection
pub const RSN_CAP_MFPR: u16 = 0x0040;
/// RSN capability field: peer is capable of management frame protection
pub const RSN_CAP_MFPC: u16 = 0x0080;

/// EAPOL-Key retransmission timeout
const EAPOL_TIMEOUT: Duration = Duration::from_secs(1);

/// Message 1 retransmissions before the peer counts as failed
const RSN_RETRIES_MAX: u32 = 3;

bitflags! {
    /// Security protocol versions, as a set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RsnProtoSet: u8 {
        const WPA = 0x01;
        const RSN = 0x02;
    }
}

bitflags! {
    /// Authentication and key management suites, as a set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct AkmSet: u8 {
        const IEEE8021X    = 0x01;
        const PSK          = 0x02;
        const SHA256_8021X = 0x04;
        const SHA256_PSK   = 0x08;
    }
}

bitflags! {
    /// Cipher suites, as a set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CipherSet: u8 {
        const USEGROUP = 0x01;
        const WEP40    = 0x02;
        const TKIP     = 0x04;
        const CCMP     = 0x08;
        const WEP104   = 0x10;
        const BIP      = 0x20;
    }
}

/// One negotiated/advertised protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsnProto {
    None,
    Wpa,
    Rsn,
}

impl RsnProto {
    pub fn as_set(self) -> RsnProtoSet {
        match self {
            Self::None => RsnProtoSet::empty(),
            Self::Wpa => RsnProtoSet::WPA,
            Self::Rsn => RsnProtoSet::RSN,
        }
    }
}

/// One negotiated AKM suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsnAkm {
    None,
    Ieee8021x,
    Psk,
    Sha256Ieee8021x,
    Sha256Psk,
}

impl RsnAkm {
    /// Whether the suite derives the PMK from a pre-shared key
    pub fn is_psk(self) -> bool {
        matches!(self, Self::Psk | Self::Sha256Psk)
    }
}

/// One cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsnCipher {
    None,
    UseGroup,
    Wep40,
    Tkip,
    Ccmp,
    Wep104,
    Bip,
}

impl RsnCipher {
    pub fn as_set(self) -> CipherSet {
        match self {
            Self::None => CipherSet::empty(),
            Self::UseGroup => CipherSet::USEGROUP,
            Self::Wep40 => CipherSet::WEP40,
            Self::Tkip => CipherSet::TKIP,
            Self::Ccmp => CipherSet::CCMP,
            Self::Wep104 => CipherSet::WEP104,
            Self::Bip => CipherSet::BIP,
        }
    }
}

/// Decoded RSN/WPA information-element body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsnInfo {
    pub proto: RsnProto,
    pub group_cipher: RsnCipher,
    pub pairwise: CipherSet,
    pub akms: AkmSet,
    pub caps: u16,
    pub pmkids: Vec<[u8; PMKID_LEN]>,
}

fn truncated() -> WifiError {
    WifiError::Parse("truncated RSN element".to_string())
}

impl RsnInfo {
    /// Parse the element body (the bytes after the element id/length, and
    /// after the vendor OUI prefix for WPA). Every field past the version
    /// is optional; the 802.11i defaults stand in for absent fields.
    pub fn parse(body: &[u8], proto: RsnProto) -> Result<RsnInfo> {
        let oui = match proto {
            RsnProto::Rsn => RSN_OUI,
            RsnProto::Wpa => WPA_OUI,
            RsnProto::None => {
                return Err(WifiError::Parse("no RSN protocol selected".to_string()))
            }
        };

        let mut buf = body;
        if buf.remaining() < 2 {
            return Err(truncated());
        }
        let version = buf.get_u16_le();
        if version != 1 {
            return Err(WifiError::Parse(format!(
                "unsupported RSN version {}",
                version
            )));
        }

        let mut info = RsnInfo {
            proto,
            // RSNA defaults when the fields are absent
            group_cipher: match proto {
                RsnProto::Wpa => RsnCipher::Tkip,
                _ => RsnCipher::Ccmp,
            },
            pairwise: CipherSet::CCMP,
            akms: AkmSet::IEEE8021X,
            caps: 0,
            pmkids: Vec::new(),
        };

        if buf.remaining() < 4 {
            return Ok(info);
        }
        let group = cipher_selector(oui, read_selector(&mut buf));
        match group {
            RsnCipher::None | RsnCipher::UseGroup | RsnCipher::Bip => {
                return Err(WifiError::Parse("bad group cipher suite".to_string()))
            }
            cipher => info.group_cipher = cipher,
        }

        if buf.remaining() < 2 {
            return Ok(info);
        }
        let count = buf.get_u16_le() as usize;
        if buf.remaining() < 4 * count {
            return Err(truncated());
        }
        info.pairwise = CipherSet::empty();
        for _ in 0..count {
            // unknown selectors are skipped, not an error
            info.pairwise |= cipher_selector(oui, read_selector(&mut buf)).as_set();
        }

        if buf.remaining() < 2 {
            return Ok(info);
        }
        let count = buf.get_u16_le() as usize;
        if buf.remaining() < 4 * count {
            return Err(truncated());
        }
        info.akms = AkmSet::empty();
        for _ in 0..count {
            info.akms |= akm_selector(oui, read_selector(&mut buf));
        }

        if buf.remaining() < 2 {
            return Ok(info);
        }
        info.caps = buf.get_u16_le();

        if buf.remaining() < 2 {
            return Ok(info);
        }
        let count = buf.get_u16_le() as usize;
        if buf.remaining() < PMKID_LEN * count {
            return Err(truncated());
        }
        for _ in 0..count {
            let mut pmkid = [0u8; PMKID_LEN];
            buf.copy_to_slice(&mut pmkid);
            info.pmkids.push(pmkid);
        }

        Ok(info)
    }

    /// Fold this element into a node's advertised sets. When a peer
    /// carries both a WPA and an RSN element the RSN one is applied last
    /// and its group cipher and capabilities win.
    pub fn apply_to(&self, node: &mut WifiNode) {
        node.rsn_protos |= self.proto.as_set();
        node.rsn_akms |= self.akms;
        node.rsn_ciphers |= self.pairwise;
        node.rsn_group_cipher = self.group_cipher;
        node.rsn_caps = self.caps;
    }
}

fn read_selector(buf: &mut &[u8]) -> [u8; 4] {
    let mut sel = [0u8; 4];
    buf.copy_to_slice(&mut sel);
    sel
}

fn cipher_selector(oui: [u8; 3], sel: [u8; 4]) -> RsnCipher {
    if sel[..3] != oui {
        return RsnCipher::None;
    }
    match sel[3] {
        0 => RsnCipher::UseGroup,
        1 => RsnCipher::Wep40,
        2 => RsnCipher::Tkip,
        4 => RsnCipher::Ccmp,
        5 => RsnCipher::Wep104,
        6 => RsnCipher::Bip,
        _ => RsnCipher::None,
    }
}

fn akm_selector(oui: [u8; 3], sel: [u8; 4]) -> AkmSet {
    if sel[..3] != oui {
        return AkmSet::empty();
    }
    match sel[3] {
        1 => AkmSet::IEEE8021X,
        2 => AkmSet::PSK,
        5 => AkmSet::SHA256_8021X,
        6 => AkmSet::SHA256_PSK,
        _ => AkmSet::empty(),
    }
}

impl WifiContext {
    /// Narrow the current-BSS node's advertised sets down to the single
    /// negotiated protocol, AKM and pairwise cipher.
    ///
    /// Preference order: RSN over WPA; a PSK-family AKM only when a key is
    /// configured and the peer offers one, SHA-256 variants over legacy;
    /// CCMP over TKIP. MFP is flagged when both sides are capable. For
    /// 802.1X-family AKMs a PMKSA cache hit attaches the cached key so
    /// the full authentication round can be skipped.
    pub fn choose_rsnparams(&mut self) {
        let policy = self.config.rsn.clone();
        let bssid = self.current_bss().bssid;
        let cached = self.drivers.pmksa.lookup(&bssid);

        let bss = self.current_bss_mut();
        bss.rsn_protos &= policy.protos;
        bss.rsn_akms &= policy.akms;
        bss.rsn_ciphers &= policy.ciphers;

        bss.rsn_proto = if bss.rsn_protos.contains(RsnProtoSet::RSN) {
            RsnProto::Rsn
        } else {
            RsnProto::Wpa
        };

        let psk_usable = policy.psk.is_some()
            && bss
                .rsn_akms
                .intersects(AkmSet::PSK | AkmSet::SHA256_PSK);
        bss.rsn_akm = if psk_usable {
            if bss.rsn_akms.contains(AkmSet::SHA256_PSK) {
                RsnAkm::Sha256Psk
            } else {
                RsnAkm::Psk
            }
        } else if bss.rsn_akms.contains(AkmSet::SHA256_8021X) {
            RsnAkm::Sha256Ieee8021x
        } else {
            RsnAkm::Ieee8021x
        };

        bss.rsn_cipher = if bss.rsn_ciphers.contains(CipherSet::CCMP) {
            RsnCipher::Ccmp
        } else if bss.rsn_ciphers.contains(CipherSet::TKIP) {
            RsnCipher::Tkip
        } else {
            RsnCipher::UseGroup
        };

        if policy.mfp_capable && bss.rsn_caps & RSN_CAP_MFPC != 0 {
            bss.flags.insert(NodeFlags::MFP);
        }

        if !bss.rsn_akm.is_psk() {
            if let Some(entry) = cached {
                log::debug!(
                    "using cached PMK for {}",
                    crate::addr_string(&bssid)
                );
                bss.pmk = Some(entry.pmk);
                bss.pmkid = Some(entry.pmkid);
                bss.flags.insert(NodeFlags::PMK_CACHED);
            }
        }

        log::info!(
            "negotiated {:?}/{:?}/{:?} with {}",
            bss.rsn_proto,
            bss.rsn_akm,
            bss.rsn_cipher,
            crate::addr_string(&bssid)
        );
    }

    /// Kick security off for a freshly joined station: reset handshake
    /// counters, draw a fresh authenticator nonce, then either request
    /// message 1 of the 4-way handshake (pre-shared or cached PMK) or
    /// defer to the external 802.1X port.
    pub fn node_join_rsn(&mut self, id: NodeId) {
        let psk = self.config.rsn.psk;
        let mut anonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut anonce[..]);

        let (addr, start_4way) = match self.table.get_mut(id) {
            Some(node) => {
                node.reset_rsn_state();
                node.anonce = anonce;
                if node.rsn_akm.is_psk() {
                    node.pmk = psk;
                }
                let start = node.pmk.is_some() || node.flags.contains(NodeFlags::PMK_CACHED);
                (node.addr, start)
            }
            None => return,
        };

        if start_4way {
            if let Err(e) = self.drivers.eapol.start_4way(addr, anonce) {
                log::warn!(
                    "4-way start toward {} failed: {}",
                    crate::addr_string(&addr),
                    e
                );
                return;
            }
            let handle = self
                .drivers
                .timer
                .schedule(EAPOL_TIMEOUT, TimerKind::Eapol, addr);
            if let Some(node) = self.table.get_mut(id) {
                node.rsn_state = RsnHandshakeState::FourWay;
                node.eapol_timer = Some(handle);
            }
        } else {
            if let Err(e) = self.drivers.eapol.port_needs_auth(addr) {
                log::warn!(
                    "802.1X port request for {} failed: {}",
                    crate::addr_string(&addr),
                    e
                );
                return;
            }
            if let Some(node) = self.table.get_mut(id) {
                node.rsn_state = RsnHandshakeState::WaitPortAuth;
            }
        }
    }

    /// Authenticator completion: the key exchange finished. Install the
    /// pairwise key, open the port and mark the association secured.
    pub fn rsn_handshake_done(&mut self, id: NodeId) {
        let (addr, timer) = match self.table.get_mut(id) {
            Some(node) => {
                let timer = node.eapol_timer.take();
                node.rsn_state = RsnHandshakeState::Done;
                node.rsn_retries = 0;
                node.flags
                    .insert(NodeFlags::PORT_VALID | NodeFlags::RSN_DONE);
                (node.addr, timer)
            }
            None => return,
        };
        if let Some(handle) = timer {
            self.drivers.timer.cancel(handle);
        }
        if let Err(e) = self.drivers.key.install_key(
            addr,
            KeyDescriptor {
                key_id: 0,
                pairwise: true,
            },
        ) {
            log::warn!(
                "pairwise key install for {} failed: {}",
                crate::addr_string(&addr),
                e
            );
        }
        log::info!("link to {} secured", crate::addr_string(&addr));
        self.push_event(crate::context::WifiEvent::LinkSecured { addr });
    }

    /// 802.1X completion: external authentication produced a PMK. Attach
    /// it and start the 4-way handshake that was deferred at join.
    pub fn port_authorized(&mut self, id: NodeId, pmk: [u8; crate::PMK_LEN]) {
        match self.table.get_mut(id) {
            Some(node) => node.pmk = Some(pmk),
            None => return,
        }
        self.node_join_rsn(id);
    }

    /// EAPOL retransmission timer fired: retry message 1 a bounded number
    /// of times, then count the peer as failed and tear it down.
    pub fn eapol_timeout(&mut self, id: NodeId) {
        let (addr, anonce, retry) = match self.table.get_mut(id) {
            Some(node) => {
                if node.rsn_state != RsnHandshakeState::FourWay {
                    return;
                }
                node.eapol_timer = None;
                node.rsn_retries += 1;
                if node.rsn_retries > RSN_RETRIES_MAX {
                    node.fails += 1;
                    (node.addr, node.anonce, false)
                } else {
                    (node.addr, node.anonce, true)
                }
            }
            None => return,
        };

        if retry {
            log::debug!("retransmitting message 1 to {}", crate::addr_string(&addr));
            if let Err(e) = self.drivers.eapol.start_4way(addr, anonce) {
                log::warn!(
                    "4-way retransmit toward {} failed: {}",
                    crate::addr_string(&addr),
                    e
                );
                return;
            }
            let handle = self
                .drivers
                .timer
                .schedule(EAPOL_TIMEOUT, TimerKind::Eapol, addr);
            if let Some(node) = self.table.get_mut(id) {
                node.eapol_timer = Some(handle);
            }
        } else {
            log::info!(
                "4-way handshake with {} timed out, dropping",
                crate::addr_string(&addr)
            );
            self.node_leave(id);
        }
    }

    /// Tear security down when a station leaves: cancel pending handshake
    /// timers, drop per-node key material and ask key management to
    /// delete the pairwise key.
    pub fn node_leave_rsn(&mut self, id: NodeId) {
        let (addr, eapol, sa_query) = match self.table.get_mut(id) {
            Some(node) => {
                let timers = (node.addr, node.eapol_timer.take(), node.sa_query_timer.take());
                node.reset_rsn_state();
                node.pmk = None;
                node.pmkid = None;
                node.flags.remove(NodeFlags::PMK_CACHED | NodeFlags::MFP);
                timers
            }
            None => return,
        };
        for handle in [eapol, sa_query].into_iter().flatten() {
            self.drivers.timer.cancel(handle);
        }
        let _ = self.drivers.key.delete_key(
            addr,
            KeyDescriptor {
                key_id: 0,
                pairwise: true,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WifiConfig;
    use crate::driver::{DriverCall, Drivers, PmksaEntry, RecordingDriver};
    use crate::PMK_LEN;

    /// WPA2-PSK + WPA2-Enterprise, CCMP pairwise, CCMP group, MFP capable
    fn sample_rsn_body() -> Vec<u8> {
        let mut body = vec![0x01, 0x00]; // version 1
        body.extend_from_slice(&[0x00, 0x0f, 0xac, 0x04]); // group CCMP
        body.extend_from_slice(&[0x02, 0x00]); // 2 pairwise
        body.extend_from_slice(&[0x00, 0x0f, 0xac, 0x04]); // CCMP
        body.extend_from_slice(&[0x00, 0x0f, 0xac, 0x02]); // TKIP
        body.extend_from_slice(&[0x02, 0x00]); // 2 AKMs
        body.extend_from_slice(&[0x00, 0x0f, 0xac, 0x02]); // PSK
        body.extend_from_slice(&[0x00, 0x0f, 0xac, 0x01]); // 802.1X
        body.extend_from_slice(&(RSN_CAP_MFPC).to_le_bytes());
        body
    }

    #[test]
    fn test_parse_full_rsn_element() {
        let info = RsnInfo::parse(&sample_rsn_body(), RsnProto::Rsn).unwrap();
        assert_eq!(info.group_cipher, RsnCipher::Ccmp);
        assert_eq!(info.pairwise, CipherSet::CCMP | CipherSet::TKIP);
        assert_eq!(info.akms, AkmSet::PSK | AkmSet::IEEE8021X);
        assert_eq!(info.caps, RSN_CAP_MFPC);
        assert!(info.pmkids.is_empty());
    }

    #[test]
    fn test_parse_defaults_after_version() {
        // version only: RSNA defaults apply
        let info = RsnInfo::parse(&[0x01, 0x00], RsnProto::Rsn).unwrap();
        assert_eq!(info.group_cipher, RsnCipher::Ccmp);
        assert_eq!(info.pairwise, CipherSet::CCMP);
        assert_eq!(info.akms, AkmSet::IEEE8021X);
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        assert!(RsnInfo::parse(&[0x02, 0x00], RsnProto::Rsn).is_err());
        assert!(RsnInfo::parse(&[0x01], RsnProto::Rsn).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_suite_list() {
        let mut body = vec![0x01, 0x00];
        body.extend_from_slice(&[0x00, 0x0f, 0xac, 0x04]);
        body.extend_from_slice(&[0x03, 0x00]); // claims 3 pairwise suites
        body.extend_from_slice(&[0x00, 0x0f, 0xac, 0x04]); // only 1 present
        assert!(RsnInfo::parse(&body, RsnProto::Rsn).is_err());
    }

    #[test]
    fn test_parse_wpa_selectors() {
        let mut body = vec![0x01, 0x00];
        body.extend_from_slice(&[0x00, 0x50, 0xf2, 0x02]); // group TKIP
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&[0x00, 0x50, 0xf2, 0x02]); // TKIP
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&[0x00, 0x50, 0xf2, 0x02]); // PSK
        let info = RsnInfo::parse(&body, RsnProto::Wpa).unwrap();
        assert_eq!(info.group_cipher, RsnCipher::Tkip);
        assert_eq!(info.pairwise, CipherSet::TKIP);
        assert_eq!(info.akms, AkmSet::PSK);
        // RSN-OUI selectors are foreign inside a WPA element
        let foreign = RsnInfo::parse(&sample_rsn_body(), RsnProto::Wpa);
        assert!(foreign.is_err()); // its group selector is unknown here
    }

    #[test]
    fn test_parse_pmkid_list() {
        let mut body = sample_rsn_body();
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&[0xab; PMKID_LEN]);
        let info = RsnInfo::parse(&body, RsnProto::Rsn).unwrap();
        assert_eq!(info.pmkids, vec![[0xab; PMKID_LEN]]);
    }

    #[test]
    fn test_apply_merges_advertisements() {
        let mut node = WifiNode::new([1; 6]);
        let info = RsnInfo::parse(&sample_rsn_body(), RsnProto::Rsn).unwrap();
        info.apply_to(&mut node);
        assert!(node.rsn_protos.contains(RsnProtoSet::RSN));
        assert_eq!(node.rsn_akms, AkmSet::PSK | AkmSet::IEEE8021X);
        assert_eq!(node.rsn_group_cipher, RsnCipher::Ccmp);
        assert_eq!(node.rsn_caps, RSN_CAP_MFPC);
    }

    fn secured_config() -> WifiConfig {
        let mut config = WifiConfig::default();
        config.rsn.enabled = true;
        config.rsn.protos = RsnProtoSet::RSN | RsnProtoSet::WPA;
        config.rsn.akms =
            AkmSet::PSK | AkmSet::SHA256_PSK | AkmSet::IEEE8021X | AkmSet::SHA256_8021X;
        config.rsn.ciphers = CipherSet::CCMP | CipherSet::TKIP;
        config
    }

    #[test]
    fn test_choose_prefers_rsn_sha256_psk_ccmp() {
        let mut config = secured_config();
        config.rsn.psk = Some([7; 32]);
        let mut ctx = WifiContext::new(config, Drivers::null()).unwrap();

        let bss = ctx.current_bss_mut();
        bss.rsn_protos = RsnProtoSet::RSN | RsnProtoSet::WPA;
        bss.rsn_akms = AkmSet::PSK | AkmSet::SHA256_PSK | AkmSet::IEEE8021X;
        bss.rsn_ciphers = CipherSet::CCMP | CipherSet::TKIP;
        bss.rsn_caps = RSN_CAP_MFPC;

        ctx.choose_rsnparams();

        let bss = ctx.current_bss();
        assert_eq!(bss.rsn_proto, RsnProto::Rsn);
        assert_eq!(bss.rsn_akm, RsnAkm::Sha256Psk);
        assert_eq!(bss.rsn_cipher, RsnCipher::Ccmp);
        // not MFP: we never advertised capability
        assert!(!bss.flags.contains(NodeFlags::MFP));
    }

    #[test]
    fn test_choose_falls_back_to_8021x_without_psk() {
        // peer offers PSK but no key is configured
        let mut ctx = WifiContext::new(secured_config(), Drivers::null()).unwrap();
        let bss = ctx.current_bss_mut();
        bss.rsn_protos = RsnProtoSet::RSN;
        bss.rsn_akms = AkmSet::PSK | AkmSet::IEEE8021X;
        bss.rsn_ciphers = CipherSet::TKIP;

        ctx.choose_rsnparams();
        let bss = ctx.current_bss();
        assert_eq!(bss.rsn_akm, RsnAkm::Ieee8021x);
        assert_eq!(bss.rsn_cipher, RsnCipher::Tkip);
    }

    #[test]
    fn test_choose_flags_mfp_when_both_capable() {
        let mut config = secured_config();
        config.rsn.mfp_capable = true;
        let mut ctx = WifiContext::new(config, Drivers::null()).unwrap();
        let bss = ctx.current_bss_mut();
        bss.rsn_protos = RsnProtoSet::RSN;
        bss.rsn_akms = AkmSet::SHA256_8021X;
        bss.rsn_ciphers = CipherSet::CCMP;
        bss.rsn_caps = RSN_CAP_MFPC;

        ctx.choose_rsnparams();
        assert!(ctx.current_bss().flags.contains(NodeFlags::MFP));
    }

    #[test]
    fn test_choose_attaches_cached_pmk_for_8021x() {
        let rec = RecordingDriver::new();
        rec.add_pmksa(
            [9; 6],
            PmksaEntry {
                pmk: [0xcc; PMK_LEN],
                pmkid: [0xdd; PMKID_LEN],
            },
        );
        let mut ctx = WifiContext::new(secured_config(), rec.drivers()).unwrap();
        let bss = ctx.current_bss_mut();
        bss.bssid = [9; 6];
        bss.rsn_protos = RsnProtoSet::RSN;
        bss.rsn_akms = AkmSet::IEEE8021X;
        bss.rsn_ciphers = CipherSet::CCMP;

        ctx.choose_rsnparams();
        let bss = ctx.current_bss();
        assert_eq!(bss.pmk, Some([0xcc; PMK_LEN]));
        assert_eq!(bss.pmkid, Some([0xdd; PMKID_LEN]));
        assert!(bss.flags.contains(NodeFlags::PMK_CACHED));
    }

    #[test]
    fn test_join_rsn_psk_starts_4way() {
        let rec = RecordingDriver::new();
        let mut config = secured_config();
        config.rsn.psk = Some([7; 32]);
        let mut ctx = WifiContext::new(config, rec.drivers()).unwrap();

        let id = ctx.node_for([5; 6]).unwrap();
        ctx.node_mut(id).unwrap().rsn_akm = RsnAkm::Psk;
        ctx.node_join_rsn(id);

        let node = ctx.node(id).unwrap();
        assert_eq!(node.rsn_state, RsnHandshakeState::FourWay);
        assert!(node.eapol_timer.is_some());
        assert_ne!(node.anonce, [0; NONCE_LEN]);
        let calls = rec.calls();
        assert!(calls.contains(&DriverCall::Start4Way { addr: [5; 6] }));
        assert!(calls.contains(&DriverCall::TimerScheduled {
            kind: TimerKind::Eapol,
            addr: [5; 6],
        }));
    }

    #[test]
    fn test_join_rsn_8021x_defers_to_port() {
        let rec = RecordingDriver::new();
        let mut ctx = WifiContext::new(secured_config(), rec.drivers()).unwrap();

        let id = ctx.node_for([5; 6]).unwrap();
        ctx.node_mut(id).unwrap().rsn_akm = RsnAkm::Ieee8021x;
        ctx.node_join_rsn(id);

        assert_eq!(
            ctx.node(id).unwrap().rsn_state,
            RsnHandshakeState::WaitPortAuth
        );
        assert!(rec
            .calls()
            .contains(&DriverCall::PortNeedsAuth { addr: [5; 6] }));
    }

    #[test]
    fn test_handshake_done_installs_key_and_opens_port() {
        let rec = RecordingDriver::new();
        let mut ctx = WifiContext::new(secured_config(), rec.drivers()).unwrap();

        let id = ctx.node_for([5; 6]).unwrap();
        {
            let node = ctx.node_mut(id).unwrap();
            node.rsn_state = RsnHandshakeState::FourWay;
            node.eapol_timer = Some(crate::driver::TimerHandle(7));
        }
        ctx.rsn_handshake_done(id);

        let node = ctx.node(id).unwrap();
        assert_eq!(node.rsn_state, RsnHandshakeState::Done);
        assert!(node.flags.contains(NodeFlags::PORT_VALID | NodeFlags::RSN_DONE));
        assert!(rec
            .calls()
            .contains(&DriverCall::InstallKey { addr: [5; 6] }));
        assert!(ctx
            .drain_events()
            .contains(&crate::context::WifiEvent::LinkSecured { addr: [5; 6] }));
    }

    #[test]
    fn test_port_authorized_starts_deferred_4way() {
        let rec = RecordingDriver::new();
        let mut ctx = WifiContext::new(secured_config(), rec.drivers()).unwrap();

        let id = ctx.node_for([5; 6]).unwrap();
        {
            let node = ctx.node_mut(id).unwrap();
            node.rsn_akm = RsnAkm::Ieee8021x;
            node.rsn_state = RsnHandshakeState::WaitPortAuth;
        }
        ctx.port_authorized(id, [0x11; PMK_LEN]);

        let node = ctx.node(id).unwrap();
        assert_eq!(node.rsn_state, RsnHandshakeState::FourWay);
        assert_eq!(node.pmk, Some([0x11; PMK_LEN]));
        assert!(rec.calls().contains(&DriverCall::Start4Way { addr: [5; 6] }));
    }

    #[test]
    fn test_eapol_timeout_retries_then_gives_up() {
        let rec = RecordingDriver::new();
        let mut config = secured_config();
        config.rsn.psk = Some([7; 32]);
        let mut ctx = WifiContext::new(config, rec.drivers()).unwrap();

        let id = ctx.node_for([5; 6]).unwrap();
        ctx.node_mut(id).unwrap().rsn_akm = RsnAkm::Psk;
        ctx.node_join_rsn(id);

        for _ in 0..RSN_RETRIES_MAX {
            ctx.eapol_timeout(id);
        }
        // still retrying
        assert_eq!(
            ctx.node(id).unwrap().rsn_state,
            RsnHandshakeState::FourWay
        );
        let starts = rec
            .calls()
            .iter()
            .filter(|c| matches!(c, DriverCall::Start4Way { .. }))
            .count();
        assert_eq!(starts, 1 + RSN_RETRIES_MAX as usize);

        // one more timeout exhausts the budget and drops the station
        ctx.eapol_timeout(id);
        assert!(ctx.node(id).is_none());
        assert!(ctx
            .drain_events()
            .contains(&crate::context::WifiEvent::NodeLeft { addr: [5; 6] }));
    }

    #[test]
    fn test_leave_rsn_cancels_timers_and_deletes_key() {
        let rec = RecordingDriver::new();
        let mut ctx = WifiContext::new(secured_config(), rec.drivers()).unwrap();

        let id = ctx.node_for([5; 6]).unwrap();
        {
            let node = ctx.node_mut(id).unwrap();
            node.rsn_akm = RsnAkm::Psk;
            node.pmk = Some([7; 32]);
            node.rsn_state = RsnHandshakeState::FourWay;
            node.eapol_timer = Some(crate::driver::TimerHandle(42));
        }
        ctx.node_leave_rsn(id);

        let node = ctx.node(id).unwrap();
        assert_eq!(node.rsn_state, RsnHandshakeState::Idle);
        assert!(node.pmk.is_none());
        assert!(node.eapol_timer.is_none());
        let calls = rec.calls();
        assert!(calls.contains(&DriverCall::TimerCancelled {
            handle: crate::driver::TimerHandle(42)
        }));
        assert!(calls.contains(&DriverCall::DeleteKey {
            addr: [5; 6],
            pairwise: true,
        }));
    }
}
