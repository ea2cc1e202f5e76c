//! World-load gate
//!
//! While the runtime is loading a new map, packets that depend on the new
//! world are held back and released in arrival order once the runtime
//! signals the world is ready.
//!
//! State machine:
//! - `Idle` → `Loading` on a map-change packet (which itself is delivered
//!   immediately)
//! - `Loading` → `Idle` on the world-ready signal, moving the deferred queue
//!   onto the tail of the ready queue in one step

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

use crate::protocol::{Envelope, PacketKind};

/// Load state of the runtime's world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
}

/// Which packet kinds may skip the queue while a map loads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "kinds", rename_all = "snake_case")]
pub enum DeferralPolicy {
    /// Only these kinds pass; everything else waits
    AllowList(BTreeSet<PacketKind>),
    /// These kinds wait; everything else passes
    DeferList(BTreeSet<PacketKind>),
}

impl DeferralPolicy {
    pub fn passes_while_loading(&self, kind: PacketKind) -> bool {
        match self {
            DeferralPolicy::AllowList(kinds) => kinds.contains(&kind),
            DeferralPolicy::DeferList(kinds) => !kinds.contains(&kind),
        }
    }
}

impl Default for DeferralPolicy {
    /// Item lists and spawns reference entities of the new map
    fn default() -> Self {
        DeferralPolicy::DeferList([PacketKind::ITEM_LIST, PacketKind::SPAWN].into_iter().collect())
    }
}

/// Where an envelope was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Ready,
    Deferred,
}

/// Owns the ready and deferred queues and the load state
#[derive(Debug)]
pub struct WorldLoadGate {
    state: LoadState,
    map_change: PacketKind,
    policy: DeferralPolicy,
    ready: VecDeque<Envelope>,
    deferred: VecDeque<Envelope>,
}

impl WorldLoadGate {
    pub fn new(map_change: PacketKind, policy: DeferralPolicy) -> Self {
        Self {
            state: LoadState::Idle,
            map_change,
            policy,
            ready: VecDeque::new(),
            deferred: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Classify a game packet by its kind
    pub fn admit_packet(&mut self, envelope: Envelope) -> Placement {
        match envelope.packet_kind() {
            Some(kind) if kind == self.map_change => {
                if self.state == LoadState::Idle {
                    tracing::info!("Map change received, holding world-dependent packets");
                }
                self.state = LoadState::Loading;
                self.ready.push_back(envelope);
                Placement::Ready
            }
            Some(kind) if self.state == LoadState::Loading && self.policy.passes_while_loading(kind) => {
                self.ready.push_back(envelope);
                Placement::Ready
            }
            _ => self.admit(envelope),
        }
    }

    /// Generic rule for anything no handler claimed: wait while loading
    pub fn admit(&mut self, envelope: Envelope) -> Placement {
        match self.state {
            LoadState::Idle => {
                self.ready.push_back(envelope);
                Placement::Ready
            }
            LoadState::Loading => {
                tracing::trace!("Deferring {:?} until world is ready", envelope.op());
                self.deferred.push_back(envelope);
                Placement::Deferred
            }
        }
    }

    /// The runtime finished applying the map change.
    ///
    /// Returns the number of envelopes released.
    pub fn world_ready(&mut self) -> usize {
        if self.state == LoadState::Idle {
            return 0;
        }

        self.state = LoadState::Idle;
        let released = self.deferred.len();
        self.ready.append(&mut self.deferred);
        tracing::info!("World ready, released {} deferred envelopes", released);
        released
    }

    pub fn pop_ready(&mut self) -> Option<Envelope> {
        self.ready.pop_front()
    }

    #[cfg(test)]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

impl Default for WorldLoadGate {
    fn default() -> Self {
        Self::new(PacketKind::MAP_CHANGE, DeferralPolicy::default())
    }
}
