//! Per-run configuration shared by all role actors.

use commonware_cryptography::{
    bls12381::primitives::{group::Share, poly, variant::Variant},
    ed25519::PublicKey,
};
use std::time::Duration;

/// The role a node plays, derived from its position in the roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Beacon,
    BlockMaker,
    Notarizer,
}

/// Configuration for a single node. Materialized once by the harness and
/// immutable for the lifetime of the run.
pub struct Config<V: Variant, F> {
    /// Seed for the beacon's randomness PRNG (shared by all beacon nodes).
    pub seed: u64,

    /// Ordered identities of all participants. Position in this list
    /// determines each node's role.
    pub roster: Vec<PublicKey>,

    /// This node's position in the roster.
    pub index: u32,

    /// Number of beacon nodes (the first `beacons` roster entries).
    pub beacons: u32,

    /// Number of block makers (the next `block_makers` entries).
    pub block_makers: u32,

    /// Number of notarizers (the remaining entries).
    pub notarizers: u32,

    /// Partial signatures required to recover a notarization.
    pub threshold: u32,

    /// Public commitments of the threshold key (identical on all nodes).
    pub identity: poly::Public<V>,

    /// This node's private share (notarizers only).
    pub share: Option<Share>,

    /// Size of each block's payload in bytes.
    pub block_size: usize,

    /// Soak time a notarizer waits for proposals to gather each round.
    pub block_time: Duration,

    /// Delay before a round's finalization work runs.
    pub finalize_time: Duration,

    /// Prefix for all signed messages to prevent replay across deployments.
    pub namespace: Vec<u8>,

    /// Observer for notarized and finalized blocks.
    pub reporter: F,
}

impl<V: Variant, F> Config<V, F> {
    /// Total number of participants.
    pub fn n(&self) -> usize {
        self.roster.len()
    }

    /// Role of the node at `index`.
    pub fn role_of(&self, index: u32) -> Role {
        if index < self.beacons {
            Role::Beacon
        } else if index < self.beacons + self.block_makers {
            Role::BlockMaker
        } else {
            Role::Notarizer
        }
    }

    /// This node's role.
    pub fn role(&self) -> Role {
        self.role_of(self.index)
    }

    /// This node's identity.
    pub fn me(&self) -> &PublicKey {
        &self.roster[self.index as usize]
    }

    /// Identities of all notarizers, excluding this node.
    pub fn notarizer_peers(&self) -> Vec<PublicKey> {
        let start = (self.beacons + self.block_makers) as usize;
        self.peers(start, self.roster.len())
    }

    /// Identities of all block makers and notarizers, excluding this node.
    /// The beacon's audience for round packets.
    pub fn round_peers(&self) -> Vec<PublicKey> {
        self.peers(self.beacons as usize, self.roster.len())
    }

    fn peers(&self, start: usize, end: usize) -> Vec<PublicKey> {
        self.roster[start..end]
            .iter()
            .enumerate()
            .filter(|(offset, _)| (start + offset) as u32 != self.index)
            .map(|(_, pk)| pk.clone())
            .collect()
    }

    /// Panic if the configuration is internally inconsistent. Called once at
    /// engine construction; a bad configuration is a harness bug.
    pub fn assert_valid(&self) {
        assert_eq!(
            self.roster.len(),
            (self.beacons + self.block_makers + self.notarizers) as usize,
            "roster length must match role counts"
        );
        assert!((self.index as usize) < self.roster.len(), "index out of roster");
        assert!(self.beacons >= 1, "at least one beacon required");
        assert!(self.block_makers >= 1, "at least one block maker required");
        assert!(
            self.threshold >= 1 && self.threshold <= self.notarizers,
            "threshold must be in [1, notarizers]"
        );
        assert!(self.block_size > 0, "blocks must carry a payload");
        if self.role() == Role::Notarizer {
            let share = self.share.as_ref().expect("notarizer requires a share");
            let expected = self.index - self.beacons - self.block_makers;
            assert_eq!(share.index, expected, "share index must match roster slot");
        }
    }
}
