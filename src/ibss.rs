//! IBSS merge
//!
//! Ad-hoc networks converge on one BSSID by deferring to the network
//! with the older timebase: a beacon whose TSF is ahead of the local
//! timer makes us adopt its sender's network, provided it would pass
//! candidate filtering. The local TSF runs in hardware, so the caller
//! reads it from the driver and passes it in with the beacon. After a
//! merge the caller must re-apply channel and BSSID dependent driver
//! state, signalled by [`MergeOutcome::NeedsReset`].

use serde::{Deserialize, Serialize};

use crate::config::WifiRole;
use crate::context::{WifiContext, WifiEvent};
use crate::table::NodeId;

/// Result of offering a beacon to the merge logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    /// Beacon belonged to our network, lost the TSF race, or was
    /// incompatible
    NoAction,
    /// We adopted the sender's network; channel/BSSID dependent state
    /// must be re-applied
    NeedsReset,
}

impl WifiContext {
    /// Consider merging with the ad-hoc network a beacon came from.
    /// `local_tsf` is the hardware timer value at reception.
    pub fn ibss_merge(&mut self, id: NodeId, local_tsf: u64) -> MergeOutcome {
        if self.config.role != WifiRole::Ibss {
            return MergeOutcome::NoAction;
        }
        let bss = self.current_bss();
        let (candidate_bssid, adopt) = match self.node(id) {
            Some(node) => {
                if node.bssid == bss.bssid {
                    // same network, just a peer beaconing
                    return MergeOutcome::NoAction;
                }
                // the older timebase wins; strictly-ahead TSF required
                if node.tsf <= local_tsf {
                    return MergeOutcome::NoAction;
                }
                if !self.match_bss(node).is_empty() {
                    return MergeOutcome::NoAction;
                }
                if node.rate_intersection(&self.config.rates).is_empty() {
                    return MergeOutcome::NoAction;
                }
                (node.bssid, node.clone())
            }
            None => return MergeOutcome::NoAction,
        };

        log::info!(
            "merging into {} on channel {}",
            crate::addr_string(&candidate_bssid),
            adopt.chan
        );
        self.current_bss_mut().copy_network(&adopt);
        self.stats.merges += 1;
        self.push_event(WifiEvent::NeedsReset {
            bssid: candidate_bssid,
        });
        MergeOutcome::NeedsReset
    }
}
