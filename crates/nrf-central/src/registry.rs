//! Deduplicated table of peers seen while scanning

use tracing::trace;

use crate::peer::{normalize_address, DiscoveredPeer, PeerAddress};

/// Discovered peers keyed by address, in first-seen order
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    peers: Vec<DiscoveredPeer>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new peer or refresh a known one
    ///
    /// A repeat sighting always takes the new RSSI but only replaces the
    /// name when the new one is non-empty. Returns the stored record and
    /// whether it was newly inserted.
    pub fn upsert(
        &mut self,
        address: PeerAddress,
        address_label: &str,
        name: &str,
        rssi: i8,
    ) -> (&DiscoveredPeer, bool) {
        let name = Some(name.trim()).filter(|n| !n.is_empty());

        match self.peers.iter().position(|p| p.address == address) {
            Some(index) => {
                let peer = &mut self.peers[index];
                peer.rssi = rssi;
                if name.is_some() {
                    peer.name = name.map(str::to_string);
                }
                trace!(address = %address, rssi, "Refreshed peer");
                (&self.peers[index], false)
            }
            None => {
                self.peers.push(DiscoveredPeer {
                    address,
                    address_label: address_label.to_string(),
                    name: name.map(str::to_string),
                    rssi,
                });
                trace!(address = %address, rssi, "New peer");
                (&self.peers[self.peers.len() - 1], true)
            }
        }
    }

    /// Look up a peer by address
    pub fn get(&self, address: &PeerAddress) -> Option<&DiscoveredPeer> {
        self.peers.iter().find(|p| &p.address == address)
    }

    /// Look up a peer by its address string, ignoring separators and case
    pub fn find_by_label(&self, label: &str) -> Option<&DiscoveredPeer> {
        let wanted = normalize_address(label);
        self.peers
            .iter()
            .find(|p| normalize_address(&p.address_label) == wanted)
    }

    /// Peers in first-seen order
    pub fn peers(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    /// Number of distinct peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer has been seen
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget every peer
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
