//! Simulation of a probabilistic-consensus blockchain with threshold-BLS
//! notarization.
//!
//! Validators are partitioned into three disjoint roles that jointly produce
//! one notarized block per round:
//!
//! * The **beacon** draws a fresh 64-bit randomness for each round and sends
//!   it to block makers and notarizers. It advances only when it observes a
//!   notarized block for the current round, closing the pacing loop.
//! * **Block makers** rank themselves each round with a permutation seeded by
//!   the round randomness and extend the heaviest notarized chain they know,
//!   offering their block to the notarizers.
//! * **Notarizers** soak up proposals for a configured window, sign the
//!   highest-weighted one with their BLS12-381 threshold share, and exchange
//!   partial signatures. Once `threshold` partials over the same header are
//!   gathered, any notarizer recovers the unique threshold signature and
//!   broadcasts the notarized block to every peer.
//!
//! A per-node **finalizer** buffers notarized blocks by round and, two rounds
//! behind the tip, appends the unique surviving block to the local chain:
//! blocks at round `r - 1` that no block at round `r` references are purged,
//! and the block at `r - 2` becomes final. Chain-head selection maximizes the
//! accumulated owner weight of notarized ancestry, so every honest node
//! converges on the same chain.
//!
//! # Architecture
//!
//! ```txt
//!            +----------+
//!            |  Beacon  |<------------------+
//!            +----+-----+                   |
//!   randomness    |                         | notarized
//!       +---------+---------+               | blocks
//!       v                   v               |
//! +-----+------+     +------+------+        |
//! | BlockMaker +---->|  Notarizer  +--------+
//! +------------+     | (finalizer) |
//!    proposals       +-------------+
//!                     partial sigs exchanged among notarizers
//! ```
//!
//! Each node runs a single [Engine] actor selected by its roster position.
//! Actors own all of their state and multiplex network input with their soak
//! and finalization timers; there are no shared locks. Messages that arrive
//! before their round opens are buffered and drained when it does.
//!
//! This is a research prototype: state lives in memory, key material is
//! assumed to be pre-dealt (as if by a DKG), and a round that never gathers
//! `threshold` partial signatures will stall the simulation by design.

use commonware_cryptography::bls12381::primitives::variant::Variant;
use std::future::Future;
use thiserror::Error;

mod actors;
pub mod config;
pub mod engine;
pub mod finalizer;
pub mod storage;
pub mod types;
pub mod weights;

pub use config::{Config, Role};
pub use engine::Engine;

use types::{Block, NotarizedBlock, Round};

#[derive(Debug, Error)]
pub enum Error {
    /// Verification of a partial or recovered signature failed. The message
    /// that carried it is dropped; the protocol keeps going.
    #[error("invalid signature")]
    InvalidSignature,
    /// No notarized block exists for the requested round.
    #[error("no blocks for round {0}")]
    NoBlocksForRound(Round),
}

/// Progress a node reports to its harness.
#[derive(Clone, Debug)]
pub enum Activity<V: Variant> {
    /// A round concluded with this notarized block at this node.
    Notarized(NotarizedBlock<V>),
    /// A block was appended to this node's finalized chain.
    Finalized(Block),
}

/// Observer of a node's [Activity]. The harness implements this to watch
/// chains grow without reaching into the actors.
pub trait Reporter: Clone + Send + 'static {
    type Activity;

    fn report(&mut self, activity: Self::Activity) -> impl Future<Output = ()> + Send;
}
