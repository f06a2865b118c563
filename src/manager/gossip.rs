//! src/manager/gossip.rs
//!
//! Peer selection for the periodic anti-entropy push. By isolating this
//! logic, the selection policy can be analyzed and tested on its own.

use crate::domain::{ActorId, PeerDescriptor, PeerName};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

/// Builds the manager's own RNG, seeded from the replica id and a startup
/// timestamp so every node shuffles differently. The manager never touches
/// a process-global generator.
pub fn seeded_rng(actor: ActorId, startup_nanos: u128) -> StdRng {
    let mut seed = [0u8; 32];
    seed[..20].copy_from_slice(actor.as_bytes());
    seed[20..].copy_from_slice(&startup_nanos.to_be_bytes()[4..]);
    StdRng::from_seed(seed)
}

/// Selects up to `fanout` gossip targets uniformly without replacement,
/// never including the local node. With fewer candidates than `fanout`,
/// every candidate is selected.
pub fn select_peers<R: Rng>(
    members: &[PeerDescriptor],
    local: &PeerName,
    fanout: usize,
    rng: &mut R,
) -> Vec<PeerDescriptor> {
    let candidates: Vec<&PeerDescriptor> = members
        .iter()
        .filter(|peer| peer.name != *local)
        .collect();

    candidates
        .choose_multiple(rng, fanout)
        .map(|peer| (*peer).clone())
        .collect()
}
