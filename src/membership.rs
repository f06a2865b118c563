//! src/membership.rs
//!
//! The observed-remove set (OR-Set) CRDT that holds the cluster membership.
//!
//! Every `add` tags the element with a fresh `Dot`; `remove` tombstones
//! exactly the dots this replica has observed. Merging unions observations
//! and tombstones, so a concurrent add always survives a remove that never
//! saw it, and an element returns after a remove only through a new `add`.

use crate::{
    domain::{ActorId, PeerDescriptor, PeerName},
    error::Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A unique tag minted for every `add`: the replica that performed the add
/// paired with that replica's next sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dot {
    actor: ActorId,
    counter: u64,
}

/// An observed-remove set of peer descriptors.
///
/// The representation is a mapping from element to its observed add-tags,
/// plus the set of tombstoned tags. BTree containers keep the binary
/// encoding of equal logical states deterministic, which is what makes the
/// encoding usable as both the disk format and the wire format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    entries: BTreeMap<PeerDescriptor, BTreeSet<Dot>>,
    removed: BTreeSet<Dot>,
    counters: BTreeMap<ActorId, u64>,
}

impl Membership {
    /// A membership containing only the local node, used to seed a node
    /// that has no persisted state.
    pub fn seed(local: PeerDescriptor, actor: ActorId) -> Self {
        let mut membership = Self::default();
        membership.add(local, actor);
        membership
    }

    /// Adds an element, tagged with a fresh dot for `actor`.
    pub fn add(&mut self, elem: PeerDescriptor, actor: ActorId) {
        let counter = self.counters.entry(actor).or_insert(0);
        *counter += 1;
        let dot = Dot {
            actor,
            counter: *counter,
        };
        self.entries.entry(elem).or_default().insert(dot);
    }

    /// Removes an element by tombstoning the observations this replica has
    /// seen. Adds performed concurrently elsewhere carry dots that are not
    /// tombstoned here and therefore survive a later merge.
    pub fn remove(&mut self, elem: &PeerDescriptor) {
        if let Some(dots) = self.entries.remove(elem) {
            self.removed.extend(dots);
        }
    }

    /// Merges another membership into this one.
    ///
    /// Commutative, associative and idempotent: observations and tombstones
    /// are unioned, per-actor counters take the maximum, and only dots that
    /// some replica has explicitly tombstoned are dropped. Merging never
    /// loses information.
    pub fn merge(&mut self, other: &Membership) {
        for (elem, dots) in &other.entries {
            self.entries
                .entry(elem.clone())
                .or_default()
                .extend(dots.iter().copied());
        }
        self.removed.extend(other.removed.iter().copied());
        for (actor, counter) in &other.counters {
            let mine = self.counters.entry(*actor).or_insert(0);
            *mine = (*mine).max(*counter);
        }

        let removed = std::mem::take(&mut self.removed);
        self.entries.retain(|_, dots| {
            dots.retain(|dot| !removed.contains(dot));
            !dots.is_empty()
        });
        self.removed = removed;
    }

    /// The current set of members.
    pub fn value(&self) -> Vec<PeerDescriptor> {
        self.entries.keys().cloned().collect()
    }

    /// The current member names, in stable order.
    pub fn names(&self) -> BTreeSet<PeerName> {
        self.entries.keys().map(|peer| peer.name.clone()).collect()
    }

    pub fn contains(&self, name: &PeerName) -> bool {
        self.entries.keys().any(|peer| peer.name == *name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encodes the membership for disk or wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a membership, rejecting malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// --- Unit Tests ---
