//! Node manager configuration
//!
//! Operating role, desired-network pins and the local security policy
//! consulted by candidate filtering and RSN negotiation.

use serde::{Deserialize, Serialize};

use crate::rsn::{AkmSet, CipherSet, RsnProtoSet};
use crate::{MacAddr, Result, WifiError, MAX_SSID_LEN};

/// Operating role of the local interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiRole {
    /// Infrastructure station
    Station,
    /// Access point
    HostAp,
    /// Ad-hoc (IBSS) station
    Ibss,
    /// Passive monitor, never joins
    Monitor,
}

impl Default for WifiRole {
    fn default() -> Self {
        Self::Station
    }
}

/// PHY operating mode, iterated during scan fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PhyMode {
    Auto = 0,
    Mode11B = 1,
    Mode11G = 2,
    Mode11A = 3,
    Mode11N = 4,
}

impl Default for PhyMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Local RSN/WPA security policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsnConfig {
    /// RSN enabled at all; when false only the privacy/WEP checks apply
    pub enabled: bool,
    /// Acceptable protocol versions
    pub protos: RsnProtoSet,
    /// Acceptable AKM suites
    pub akms: AkmSet,
    /// Acceptable pairwise ciphers
    pub ciphers: CipherSet,
    /// Acceptable group ciphers
    pub group_ciphers: CipherSet,
    /// Require management frame protection from candidates
    pub mfp_required: bool,
    /// Advertise management frame protection capability
    pub mfp_capable: bool,
    /// Pre-shared key, when PSK-family AKMs are in use
    pub psk: Option<[u8; 32]>,
}

impl Default for RsnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            protos: RsnProtoSet::RSN,
            akms: AkmSet::PSK,
            ciphers: CipherSet::CCMP,
            group_ciphers: CipherSet::CCMP | CipherSet::TKIP,
            mfp_required: false,
            mfp_capable: false,
            psk: None,
        }
    }
}

/// Node manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    /// Local interface MAC address
    pub local_addr: MacAddr,
    /// Operating role
    pub role: WifiRole,
    /// Operator-configured SSID; `None` means any
    pub des_ssid: Option<Vec<u8>>,
    /// Operator-pinned BSSID
    pub des_bssid: Option<MacAddr>,
    /// Operator-pinned channel
    pub des_chan: Option<u8>,
    /// PHY modes tried in order during scan fallback
    pub phy_modes: Vec<PhyMode>,
    /// Channels the regulatory domain allows us to use
    pub chan_active: Vec<u8>,
    /// Subset of `chan_active` that may only be scanned passively
    pub chan_passive: Vec<u8>,
    /// Locally supported rates in 500 kbit/s units, basic rates flagged 0x80
    pub rates: Vec<u8>,
    /// Maximum node table population
    pub max_nodes: usize,
    /// Ageing passes a cached node survives without traffic
    pub max_node_inactivity: u32,
    /// Legacy WEP privacy enabled
    pub wep_enabled: bool,
    /// RSN/WPA policy
    pub rsn: RsnConfig,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            local_addr: [0; 6],
            role: WifiRole::Station,
            des_ssid: None,
            des_bssid: None,
            des_chan: None,
            phy_modes: vec![PhyMode::Auto, PhyMode::Mode11G, PhyMode::Mode11A],
            chan_active: (1..=11).collect(),
            chan_passive: Vec::new(),
            // 802.11g rate set; 1/2/5.5/11 basic
            rates: vec![0x82, 0x84, 0x8b, 0x96, 0x0c, 0x12, 0x18, 0x24],
            max_nodes: 64,
            max_node_inactivity: 5,
            wep_enabled: false,
            rsn: RsnConfig::default(),
        }
    }
}

impl WifiConfig {
    /// Privacy must be advertised by candidates when any local key scheme
    /// is enabled.
    pub fn privacy_enabled(&self) -> bool {
        self.wep_enabled || self.rsn.enabled
    }

    /// Check whether a channel may only be listened on, never probed.
    pub fn is_passive_chan(&self, chan: u8) -> bool {
        self.chan_passive.contains(&chan)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_nodes == 0 {
            return Err(WifiError::Config("max_nodes must be nonzero".to_string()));
        }
        if self.chan_active.is_empty() {
            return Err(WifiError::Config("no active channels".to_string()));
        }
        if let Some(ssid) = &self.des_ssid {
            if ssid.len() > MAX_SSID_LEN {
                return Err(WifiError::Config(format!(
                    "SSID too long: {} bytes",
                    ssid.len()
                )));
            }
        }
        if self.phy_modes.is_empty() {
            return Err(WifiError::Config("no PHY modes configured".to_string()));
        }
        if let Some(chan) = self.des_chan {
            if !self.chan_active.contains(&chan) {
                return Err(WifiError::Config(format!(
                    "pinned channel {} not in active set",
                    chan
                )));
            }
        }
        if self.rsn.enabled && self.rsn.akms.is_empty() {
            return Err(WifiError::Config("RSN enabled without AKMs".to_string()));
        }
        Ok(())
    }

    /// Basic (mandatory) subset of the local rate set, flag bit stripped.
    pub fn basic_rates(&self) -> Vec<u8> {
        self.rates
            .iter()
            .filter(|r| *r & 0x80 != 0)
            .map(|r| r & 0x7f)
            .collect()
    }
}
