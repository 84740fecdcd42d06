//! Per-round owner weights derived from beacon randomness.
//!
//! Every node seeds the same PRNG with the round randomness, so weight tables
//! are identical across the network without any exchange.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// A uniform permutation of `[0, n)` seeded by the round randomness.
pub fn permutation(n: usize, randomness: i64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(randomness as u64);
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(&mut rng);
    perm
}

/// Weight of each of the `n` possible block owners for a round.
///
/// Weights are `permutation[i] + 1`, a permutation of `[1, n]`: integral (no
/// float comparisons) and collision-free between owners within a round.
pub fn weights(n: usize, randomness: i64) -> Vec<u64> {
    permutation(n, randomness)
        .into_iter()
        .map(|rank| rank as u64 + 1)
        .collect()
}
