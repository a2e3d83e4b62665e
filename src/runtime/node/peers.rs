//! Room peer table with liveness tracking.
//!
//! Every valid foreign datagram refreshes its sender's record. A periodic
//! sweep evicts peers that have gone silent, in two phases: the record is
//! first marked timed out (and disappears from snapshots and fan-out), then
//! physically removed after a grace period. The mark keeps a datagram that
//! races the sweep from producing a second timeout notification.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// How long a peer may stay silent before the sweep marks it gone.
pub const PEER_TIMEOUT_MS: u64 = 30_000;

/// Cadence of the eviction sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How long a timed-out record lingers before it is physically removed.
const EVICT_GRACE_MS: u64 = 5_000;

/// A peer seen in the room, keyed by its session peer id.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Last observed source address (unicast fan-out target).
    pub addr: SocketAddr,
    pub display_name: String,
    /// Unix milliseconds of the last datagram from this peer.
    pub last_seen: u64,
    /// Set by the sweep once `last_seen` falls behind the timeout.
    timed_out_at: Option<u64>,
}

/// Outcome of feeding a datagram sighting into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First datagram from this peer id.
    New,
    /// Known peer with a changed name or address, or one returning from a
    /// timeout mark.
    Updated,
    /// Known peer, only `last_seen` moved.
    Refreshed,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a datagram sighting, inserting the peer on first contact.
    pub fn observe(
        &mut self,
        peer_id: &str,
        addr: SocketAddr,
        display_name: &str,
        now: u64,
    ) -> Sighting {
        match self.peers.get_mut(peer_id) {
            Some(record) => {
                let changed = record.addr != addr
                    || record.display_name != display_name
                    || record.timed_out_at.is_some();
                record.addr = addr;
                record.display_name = display_name.to_string();
                record.last_seen = now;
                record.timed_out_at = None;
                if changed {
                    Sighting::Updated
                } else {
                    Sighting::Refreshed
                }
            }
            None => {
                self.peers.insert(
                    peer_id.to_string(),
                    PeerRecord {
                        addr,
                        display_name: display_name.to_string(),
                        last_seen: now,
                        timed_out_at: None,
                    },
                );
                Sighting::New
            }
        }
    }

    /// Drop a peer outright (on a `leave` envelope).
    pub fn remove(&mut self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Unicast fan-out targets. Timed-out records are excluded.
    pub fn live_addrs(&self) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|p| p.timed_out_at.is_none())
            .map(|p| p.addr)
            .collect()
    }

    /// Iterate the live records with their peer ids.
    pub fn iter_live(&self) -> impl Iterator<Item = (&String, &PeerRecord)> + '_ {
        self.peers
            .iter()
            .filter(|(_, p)| p.timed_out_at.is_none())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|p| p.timed_out_at.is_none())
    }

    pub fn len(&self) -> usize {
        self.peers.values().filter(|p| p.timed_out_at.is_none()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eviction pass. Removes records whose timeout mark has aged past the
    /// grace period, then marks newly silent peers. Returns the ids marked
    /// on this pass — each evicted peer shows up in the result exactly once.
    pub fn sweep(&mut self, now: u64) -> Vec<String> {
        self.peers.retain(|_, p| match p.timed_out_at {
            Some(marked) => now.saturating_sub(marked) < EVICT_GRACE_MS,
            None => true,
        });

        let mut timed_out = Vec::new();
        for (id, record) in &mut self.peers {
            if record.timed_out_at.is_none()
                && now.saturating_sub(record.last_seen) > PEER_TIMEOUT_MS
            {
                record.timed_out_at = Some(now);
                timed_out.push(id.clone());
            }
        }
        timed_out
    }
}
