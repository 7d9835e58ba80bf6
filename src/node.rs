//! Node data model
//!
//! One [`WifiNode`] represents an observed or associated peer/AP: its
//! network identity, advertised capabilities and rates, security sets and
//! the bookkeeping the table needs to manage its lifetime.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::TimerHandle;
use crate::rsn::{AkmSet, CipherSet, RsnAkm, RsnCipher, RsnProto, RsnProtoSet};
use crate::{MacAddr, NONCE_LEN, PMKID_LEN, PMK_LEN};

bitflags! {
    /// 802.11 capability information bits as beaconed by the peer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CapInfo: u16 {
        const ESS            = 0x0001;
        const IBSS           = 0x0002;
        const POLLABLE       = 0x0004;
        const POLL_REQ       = 0x0008;
        const PRIVACY        = 0x0010;
        const SHORT_PREAMBLE = 0x0020;
        const SHORT_SLOTTIME = 0x0400;
    }
}

bitflags! {
    /// Membership and negotiation flags tracked per node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct NodeFlags: u16 {
        /// Peer is ERP (11g) capable
        const ERP        = 0x0001;
        /// Peer is HT (11n) capable
        const HT         = 0x0002;
        /// A cached PMK is attached to this node
        const PMK_CACHED = 0x0004;
        /// Management frame protection was negotiated
        const MFP        = 0x0008;
        /// The 802.1X port is open for this peer
        const PORT_VALID = 0x0010;
        /// Security association fully established
        const RSN_DONE   = 0x0020;
    }
}

/// Node lifecycle state
///
/// Normal path is `Cache -> Bss -> Auth -> Assoc -> Collect -> removed`;
/// cache eviction takes the short `Cache -> Collect -> removed` path
/// without ever associating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeState {
    /// Seen during a scan, not selected
    Cache = 0,
    /// Selected as (candidate) BSS
    Bss = 1,
    /// Authentication in progress/complete
    Auth = 2,
    /// Associated
    Assoc = 3,
    /// Marked for reclamation
    Collect = 4,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Cache
    }
}

/// Per-peer security handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsnHandshakeState {
    /// No handshake in progress
    Idle,
    /// Waiting for the external 802.1X/EAP port to authenticate
    WaitPortAuth,
    /// 4-way handshake started (message 1 requested)
    FourWay,
    /// Keys installed, association secured
    Done,
}

impl Default for RsnHandshakeState {
    fn default() -> Self {
        Self::Idle
    }
}

/// One observed or associated peer/AP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiNode {
    /// Peer MAC address; table key, immutable after setup
    pub addr: MacAddr,
    /// BSSID of the network the peer belongs to
    pub bssid: MacAddr,
    /// Operating channel
    pub chan: u8,
    /// Advertised capability bits
    pub capinfo: CapInfo,
    /// Advertised rates in 500 kbit/s units, basic rates flagged 0x80
    pub rates: Vec<u8>,
    /// Received signal strength
    pub rssi: i8,
    /// SSID, empty if not (yet) known
    pub ssid: Vec<u8>,
    /// Last beaconed TSF value
    pub tsf: u64,
    /// Beacon interval in TU
    pub intval: u16,
    /// ERP information element byte
    pub erp: u8,

    // Security
    /// Protocols the peer advertises
    pub rsn_protos: RsnProtoSet,
    /// AKM suites the peer advertises
    pub rsn_akms: AkmSet,
    /// Pairwise ciphers the peer advertises
    pub rsn_ciphers: CipherSet,
    /// Group cipher the peer advertises
    pub rsn_group_cipher: RsnCipher,
    /// RSN capability field from the RSN element
    pub rsn_caps: u16,
    /// Negotiated protocol after `choose_rsnparams`
    pub rsn_proto: RsnProto,
    /// Negotiated AKM
    pub rsn_akm: RsnAkm,
    /// Negotiated pairwise cipher
    pub rsn_cipher: RsnCipher,
    /// Cached or derived pairwise master key
    pub pmk: Option<[u8; PMK_LEN]>,
    /// Identifier of the cached PMK, attached when 802.1X is skipped
    pub pmkid: Option<[u8; PMKID_LEN]>,
    /// Authenticator nonce for the 4-way handshake
    pub anonce: [u8; NONCE_LEN],
    /// Supplicant nonce
    pub snonce: [u8; NONCE_LEN],
    /// EAPOL-Key replay counter
    pub replay_counter: u64,
    /// Handshake retransmission counter
    pub rsn_retries: u32,
    /// Handshake progress
    pub rsn_state: RsnHandshakeState,

    // Bookkeeping
    /// External strong references; the table slot itself is not counted
    pub refcnt: u32,
    /// Lifecycle state
    pub state: NodeState,
    /// Association identifier, AP role only; 0 when unassigned
    pub associd: u16,
    /// Eviction-pass generation tag
    pub scangen: u32,
    /// Consecutive join/selection failures
    pub fails: u32,
    /// Ageing passes without traffic
    pub inact: u32,
    /// Membership flags
    pub flags: NodeFlags,
    /// Pending EAPOL retransmit timer
    pub eapol_timer: Option<TimerHandle>,
    /// Pending SA-query timer
    pub sa_query_timer: Option<TimerHandle>,
    /// First sighting
    pub first_seen: DateTime<Utc>,
    /// Most recent sighting
    pub last_seen: DateTime<Utc>,
}

impl WifiNode {
    /// Create a blank node for an address; the table's `setup_node` fills
    /// in identity and inserts it.
    pub fn new(addr: MacAddr) -> Self {
        let now = Utc::now();
        Self {
            addr,
            bssid: [0; 6],
            chan: 0,
            capinfo: CapInfo::empty(),
            rates: Vec::new(),
            rssi: i8::MIN,
            ssid: Vec::new(),
            tsf: 0,
            intval: 100,
            erp: 0,
            rsn_protos: RsnProtoSet::empty(),
            rsn_akms: AkmSet::empty(),
            rsn_ciphers: CipherSet::empty(),
            rsn_group_cipher: RsnCipher::None,
            rsn_caps: 0,
            rsn_proto: RsnProto::None,
            rsn_akm: RsnAkm::None,
            rsn_cipher: RsnCipher::None,
            pmk: None,
            pmkid: None,
            anonce: [0; NONCE_LEN],
            snonce: [0; NONCE_LEN],
            replay_counter: 0,
            rsn_retries: 0,
            rsn_state: RsnHandshakeState::Idle,
            refcnt: 0,
            state: NodeState::Cache,
            associd: 0,
            scangen: 0,
            fails: 0,
            inact: 0,
            flags: NodeFlags::empty(),
            eapol_timer: None,
            sa_query_timer: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Mark the node seen now and reset its inactivity counter.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.inact = 0;
    }

    /// Rates common to this node and a local rate set, basic-rate flag
    /// ignored for the comparison.
    pub fn rate_intersection(&self, local: &[u8]) -> Vec<u8> {
        self.rates
            .iter()
            .map(|r| r & 0x7f)
            .filter(|r| local.iter().any(|l| l & 0x7f == *r))
            .collect()
    }

    /// Whether the peer advertises at least one basic (mandatory) rate we
    /// also support. A peer that flags no rate as basic is checked against
    /// its full rate set.
    pub fn has_compatible_basic_rate(&self, local: &[u8]) -> bool {
        let mut saw_basic = false;
        for r in &self.rates {
            if r & 0x80 == 0 {
                continue;
            }
            saw_basic = true;
            if local.iter().any(|l| l & 0x7f == r & 0x7f) {
                return true;
            }
        }
        if !saw_basic {
            return !self.rate_intersection(local).is_empty();
        }
        false
    }

    /// Copy another node's network identity and security sets into this
    /// node's storage, preserving local bookkeeping (refcount, lifecycle
    /// state, AID, timers). Used when the current-BSS node adopts a
    /// selection or merge winner without moving in memory.
    pub fn copy_network(&mut self, from: &WifiNode) {
        self.addr = from.addr;
        self.bssid = from.bssid;
        self.chan = from.chan;
        self.capinfo = from.capinfo;
        self.rates = from.rates.clone();
        self.rssi = from.rssi;
        self.ssid = from.ssid.clone();
        self.tsf = from.tsf;
        self.intval = from.intval;
        self.erp = from.erp;
        self.rsn_protos = from.rsn_protos;
        self.rsn_akms = from.rsn_akms;
        self.rsn_ciphers = from.rsn_ciphers;
        self.rsn_group_cipher = from.rsn_group_cipher;
        self.rsn_caps = from.rsn_caps;
        self.last_seen = from.last_seen;
    }

    /// Clear negotiated security state back to idle.
    pub fn reset_rsn_state(&mut self) {
        self.rsn_retries = 0;
        self.replay_counter = 0;
        self.rsn_state = RsnHandshakeState::Idle;
        self.flags.remove(NodeFlags::PORT_VALID | NodeFlags::RSN_DONE);
    }

    /// Formatted peer address
    pub fn addr_string(&self) -> String {
        crate::addr_string(&self.addr)
    }
}
