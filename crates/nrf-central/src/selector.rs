//! Connection target selection
//!
//! In filtered mode the first peer that passes the address/RSSI filter is
//! locked as the target. In manual mode only an explicit pick locks it.
//! Either way, once locked the target stays fixed until released.

use tracing::debug;

use crate::config::{SelectionConfig, SelectionMode};
use crate::error::{CentralError, Result};
use crate::peer::{normalize_address, ConnectionTarget, DiscoveredPeer};

/// Chooses and holds the connection target
#[derive(Debug, Clone)]
pub struct TargetSelector {
    mode: SelectionMode,
    address: Option<String>,
    min_rssi: i8,
    target: Option<ConnectionTarget>,
}

impl TargetSelector {
    /// Create a selector from configuration
    pub fn new(config: &SelectionConfig) -> Self {
        Self {
            mode: config.mode,
            address: config
                .address
                .as_deref()
                .map(normalize_address)
                .filter(|a| !a.is_empty()),
            min_rssi: config.min_rssi,
            target: None,
        }
    }

    /// Active selection mode
    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Whether a peer passes the configured filter
    ///
    /// The RSSI threshold always applies; the address must also match when
    /// one is configured.
    pub fn matches(&self, peer: &DiscoveredPeer) -> bool {
        if peer.rssi < self.min_rssi {
            return false;
        }
        match &self.address {
            Some(address) => normalize_address(&peer.address_label) == *address,
            None => true,
        }
    }

    /// Offer a fresh sighting to the filter
    ///
    /// Locks and returns the target if the selector is in filtered mode,
    /// nothing is locked yet and the peer passes the filter.
    pub fn offer(&mut self, peer: &DiscoveredPeer) -> Option<ConnectionTarget> {
        if self.target.is_some() || self.mode != SelectionMode::Filtered {
            return None;
        }
        if !self.matches(peer) {
            debug!(address = %peer.address_label, rssi = peer.rssi, "Peer rejected by filter");
            return None;
        }

        let target = ConnectionTarget::from(peer);
        self.target = Some(target.clone());
        Some(target)
    }

    /// Lock a peer the user picked
    pub fn select(&mut self, peer: &DiscoveredPeer) -> Result<ConnectionTarget> {
        if self.target.is_some() {
            return Err(CentralError::TargetAlreadyLocked);
        }
        let target = ConnectionTarget::from(peer);
        self.target = Some(target.clone());
        Ok(target)
    }

    /// Locked target, if any
    pub fn target(&self) -> Option<&ConnectionTarget> {
        self.target.as_ref()
    }

    /// Whether a target is locked
    pub fn is_locked(&self) -> bool {
        self.target.is_some()
    }

    /// Unlock and forget the target
    pub fn release(&mut self) {
        self.target = None;
    }
}
