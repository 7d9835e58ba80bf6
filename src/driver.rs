//! Collaborator interfaces
//!
//! The node manager never touches hardware, sends frames or runs key
//! handshakes itself; it hands non-blocking requests to these seams and
//! is re-entered later through completion calls on the context. Each
//! trait mirrors one external subsystem: PHY/radio control, management
//! frame output, key installation, timers, the PMKSA cache and the
//! 802.1X/EAP authenticator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MacAddr, NONCE_LEN, PMKID_LEN, PMK_LEN};

/// Errors surfaced by collaborator requests
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Channel switching not supported")]
    ChannelSwitchNotSupported,

    #[error("Invalid channel: {channel}")]
    InvalidChannel { channel: u8 },

    #[error("Transmit queue full")]
    TxQueueFull,

    #[error("Key slot unavailable")]
    KeySlotUnavailable,

    #[error("Hardware error: {message}")]
    Hardware { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 802.11 deauthentication/disassociation reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ReasonCode {
    Unspecified = 1,
    /// Previous authentication no longer valid
    AuthExpired = 2,
    AuthLeave = 3,
    AssocExpired = 4,
    NotAuthenticated = 9,
    NotAssociated = 10,
}

/// Management frames the node manager asks the output path to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtFrame {
    Deauth { reason: ReasonCode },
    Disassoc { reason: ReasonCode },
    ProbeRequest { ssid: Vec<u8> },
}

/// Kinds of per-node timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    /// EAPOL-Key retransmission
    Eapol,
    /// SA-query procedure
    SaQuery,
}

/// Opaque handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle(pub u64);

/// Pairwise/group key descriptor handed to key management
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub key_id: u8,
    pub pairwise: bool,
}

/// A cached pairwise master key
#[derive(Debug, Clone)]
pub struct PmksaEntry {
    pub pmk: [u8; PMK_LEN],
    pub pmkid: [u8; PMKID_LEN],
}

/// PHY/regulatory control
pub trait PhyOps: Send {
    /// Ask the radio to move to `chan` and run one probe (active) or
    /// listen (passive) cycle. Completion re-enters the context through
    /// `channel_switch_done`.
    fn request_channel_switch(&mut self, chan: u8, active: bool) -> Result<(), DriverError>;
}

/// Management frame output path
pub trait FrameOps: Send {
    fn send_mgmt(&mut self, addr: MacAddr, frame: MgmtFrame) -> Result<(), DriverError>;

    /// Drop any frames still queued for `addr`; called when its node is
    /// destroyed so the output path holds no dangling reference.
    fn purge_tx(&mut self, _addr: MacAddr) {}
}

/// Key management
pub trait KeyOps: Send {
    fn install_key(&mut self, addr: MacAddr, desc: KeyDescriptor) -> Result<(), DriverError>;
    fn delete_key(&mut self, addr: MacAddr, desc: KeyDescriptor) -> Result<(), DriverError>;
}

/// Timer service for per-node timeouts
pub trait TimerOps: Send {
    fn schedule(&mut self, after: Duration, kind: TimerKind, addr: MacAddr) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

/// PMKSA cache lookups
pub trait PmksaCache: Send {
    fn lookup(&self, bssid: &MacAddr) -> Option<PmksaEntry>;
}

/// 802.1X/EAP authenticator
pub trait EapolOps: Send {
    /// Start message 1 of the 4-way handshake toward `addr`.
    fn start_4way(&mut self, addr: MacAddr, anonce: [u8; NONCE_LEN]) -> Result<(), DriverError>;
    /// Tell the authenticator a new port requires full 802.1X auth.
    fn port_needs_auth(&mut self, addr: MacAddr) -> Result<(), DriverError>;
}

/// The full set of collaborators a context is wired to
pub struct Drivers {
    pub phy: Box<dyn PhyOps>,
    pub frame: Box<dyn FrameOps>,
    pub key: Box<dyn KeyOps>,
    pub timer: Box<dyn TimerOps>,
    pub pmksa: Box<dyn PmksaCache>,
    pub eapol: Box<dyn EapolOps>,
}

impl Drivers {
    /// Discarding collaborators: every request succeeds and does nothing.
    pub fn null() -> Self {
        Self {
            phy: Box::new(NullDriver),
            frame: Box::new(NullDriver),
            key: Box::new(NullDriver),
            timer: Box::new(NullTimer::default()),
            pmksa: Box::new(NullDriver),
            eapol: Box::new(NullDriver),
        }
    }
}

impl std::fmt::Debug for Drivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivers").finish_non_exhaustive()
    }
}

/// No-op collaborator
pub struct NullDriver;

impl PhyOps for NullDriver {
    fn request_channel_switch(&mut self, _chan: u8, _active: bool) -> Result<(), DriverError> {
        Ok(())
    }
}

impl FrameOps for NullDriver {
    fn send_mgmt(&mut self, _addr: MacAddr, _frame: MgmtFrame) -> Result<(), DriverError> {
        Ok(())
    }
}

impl KeyOps for NullDriver {
    fn install_key(&mut self, _addr: MacAddr, _desc: KeyDescriptor) -> Result<(), DriverError> {
        Ok(())
    }

    fn delete_key(&mut self, _addr: MacAddr, _desc: KeyDescriptor) -> Result<(), DriverError> {
        Ok(())
    }
}

impl PmksaCache for NullDriver {
    fn lookup(&self, _bssid: &MacAddr) -> Option<PmksaEntry> {
        None
    }
}

impl EapolOps for NullDriver {
    fn start_4way(&mut self, _addr: MacAddr, _anonce: [u8; NONCE_LEN]) -> Result<(), DriverError> {
        Ok(())
    }

    fn port_needs_auth(&mut self, _addr: MacAddr) -> Result<(), DriverError> {
        Ok(())
    }
}

/// No-op timer that still hands out unique handles
#[derive(Default)]
pub struct NullTimer {
    next: u64,
}

impl TimerOps for NullTimer {
    fn schedule(&mut self, _after: Duration, _kind: TimerKind, _addr: MacAddr) -> TimerHandle {
        self.next += 1;
        TimerHandle(self.next)
    }

    fn cancel(&mut self, _handle: TimerHandle) {}
}

/// One recorded collaborator request, for test assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    ChannelSwitch { chan: u8, active: bool },
    Mgmt { addr: MacAddr, frame: MgmtFrame },
    PurgeTx { addr: MacAddr },
    InstallKey { addr: MacAddr },
    DeleteKey { addr: MacAddr, pairwise: bool },
    TimerScheduled { kind: TimerKind, addr: MacAddr },
    TimerCancelled { handle: TimerHandle },
    Start4Way { addr: MacAddr },
    PortNeedsAuth { addr: MacAddr },
}

/// Shared log of recorded calls
pub type CallLog = Arc<Mutex<Vec<DriverCall>>>;

/// Recording collaborator used by unit tests and the mock backend
#[derive(Clone, Default)]
pub struct RecordingDriver {
    pub calls: CallLog,
    next_timer: Arc<Mutex<u64>>,
    pmksa_entries: Arc<Mutex<HashMap<MacAddr, PmksaEntry>>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire one recorder into every collaborator slot.
    pub fn drivers(&self) -> Drivers {
        Drivers {
            phy: Box::new(self.clone()),
            frame: Box::new(self.clone()),
            key: Box::new(self.clone()),
            timer: Box::new(self.clone()),
            pmksa: Box::new(self.clone()),
            eapol: Box::new(self.clone()),
        }
    }

    /// Seed the mock PMKSA cache.
    pub fn add_pmksa(&self, bssid: MacAddr, entry: PmksaEntry) {
        self.pmksa_entries.lock().unwrap().insert(bssid, entry);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PhyOps for RecordingDriver {
    fn request_channel_switch(&mut self, chan: u8, active: bool) -> Result<(), DriverError> {
        self.record(DriverCall::ChannelSwitch { chan, active });
        Ok(())
    }
}

impl FrameOps for RecordingDriver {
    fn send_mgmt(&mut self, addr: MacAddr, frame: MgmtFrame) -> Result<(), DriverError> {
        self.record(DriverCall::Mgmt { addr, frame });
        Ok(())
    }

    fn purge_tx(&mut self, addr: MacAddr) {
        self.record(DriverCall::PurgeTx { addr });
    }
}

impl KeyOps for RecordingDriver {
    fn install_key(&mut self, addr: MacAddr, _desc: KeyDescriptor) -> Result<(), DriverError> {
        self.record(DriverCall::InstallKey { addr });
        Ok(())
    }

    fn delete_key(&mut self, addr: MacAddr, desc: KeyDescriptor) -> Result<(), DriverError> {
        self.record(DriverCall::DeleteKey {
            addr,
            pairwise: desc.pairwise,
        });
        Ok(())
    }
}

impl TimerOps for RecordingDriver {
    fn schedule(&mut self, _after: Duration, kind: TimerKind, addr: MacAddr) -> TimerHandle {
        self.record(DriverCall::TimerScheduled { kind, addr });
        let mut next = self.next_timer.lock().unwrap();
        *next += 1;
        TimerHandle(*next)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.record(DriverCall::TimerCancelled { handle });
    }
}

impl PmksaCache for RecordingDriver {
    fn lookup(&self, bssid: &MacAddr) -> Option<PmksaEntry> {
        self.pmksa_entries.lock().unwrap().get(bssid).cloned()
    }
}

impl EapolOps for RecordingDriver {
    fn start_4way(&mut self, addr: MacAddr, _anonce: [u8; NONCE_LEN]) -> Result<(), DriverError> {
        self.record(DriverCall::Start4Way { addr });
        Ok(())
    }

    fn port_needs_auth(&mut self, addr: MacAddr) -> Result<(), DriverError> {
        self.record(DriverCall::PortNeedsAuth { addr });
        Ok(())
    }
}
