//! Finalization of notarized blocks into the append-only chain.
//!
//! The finalizer buffers notarized blocks per round and, two rounds behind
//! the newest, appends the unique surviving block to the chain. Head
//! selection for block makers walks notarized ancestry and maximizes the
//! accumulated owner weight back to the finalized boundary.

use crate::{
    types::{Block, NotarizedBlock, Round},
    weights, Error,
};
use commonware_cryptography::bls12381::primitives::variant::Variant;
use std::collections::BTreeMap;
use tracing::debug;

/// The finalized chain. Starts at genesis and only ever grows.
pub struct Chain {
    blocks: Vec<Block>,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            blocks: vec![crate::types::genesis()],
        }
    }

    /// Append a block. The block must reference the current head.
    pub fn append(&mut self, block: Block) {
        let head = self.head();
        assert_eq!(
            block.header.prv_hash,
            head.hash(),
            "chain linkage broken at round {}",
            block.header.round
        );
        self.blocks.push(block);
    }

    pub fn head(&self) -> &Block {
        self.blocks.last().expect("chain is never empty")
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffers notarized blocks and commits them to the chain with a lag of two
/// rounds.
///
/// Timing is owned by the caller: [Finalizer::store] reports when the
/// finalization for the cursor round should be scheduled, and
/// [Finalizer::finalize] runs the (synchronous) finalization work once the
/// caller's delay has elapsed.
pub struct Finalizer<V: Variant> {
    block_makers: u32,
    notarized: BTreeMap<Round, Vec<NotarizedBlock<V>>>,
    chain: Chain,
    round: Round,
}

impl<V: Variant> Finalizer<V> {
    pub fn new(block_makers: u32) -> Self {
        let mut notarized = BTreeMap::new();
        notarized.insert(0, vec![NotarizedBlock::genesis()]);
        Self {
            block_makers,
            notarized,
            chain: Chain::new(),
            round: 1,
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// The numerically greatest round with a notarized block.
    pub fn highest_round(&self) -> Round {
        self.notarized.keys().last().copied().unwrap_or(0)
    }

    /// Record a notarized block.
    ///
    /// Blocks below the cursor are dropped and duplicates (by block hash) are
    /// no-ops. Returns true when this is the first notarized block for the
    /// cursor round: the caller should schedule [Finalizer::finalize] for the
    /// cursor after its delay.
    pub fn store(&mut self, notarized: NotarizedBlock<V>) -> bool {
        let round = notarized.round();
        if round < self.round {
            debug!(round, cursor = self.round, "notarized block below cursor");
            return false;
        }
        let hash = notarized.block.hash();
        let cursor_seen = self.notarized.contains_key(&self.round);
        let entries = self.notarized.entry(round).or_default();
        if entries.iter().any(|n| n.block.hash() == hash) {
            return false;
        }
        entries.push(notarized);
        round == self.round && !cursor_seen
    }

    /// Run the finalization work for `round` (the cursor).
    ///
    /// Rounds at or below 1 only advance the cursor. Otherwise the round
    /// before is purged down to its referenced ancestor and the unique block
    /// two rounds back is appended to the chain. Returns the appended block
    /// (if any) and whether blocks for the new cursor round already arrived,
    /// in which case the caller schedules the next finalization immediately.
    pub fn finalize(&mut self, round: Round) -> (Option<Block>, bool) {
        assert_eq!(round, self.round, "finalize must run at the cursor");
        let mut appended = None;
        if round > 1 {
            self.purge(round - 1);
            let target = round - 2;
            if target > 0 {
                let survivors = self
                    .notarized
                    .get(&target)
                    .unwrap_or_else(|| panic!("no notarized blocks at round {target} to finalize"));
                let block = survivors[0].block.clone();
                self.chain.append(block.clone());
                appended = Some(block);
            }
            self.notarized.remove(&target);
        }
        self.round += 1;
        let more = self.notarized.contains_key(&self.round);
        (appended, more)
    }

    /// Keep only the blocks at `start - 1` that some block at `start`
    /// references as its parent. Exactly one block must survive.
    fn purge(&mut self, start: Round) {
        let Some(prev) = self.notarized.get(&(start - 1)) else {
            panic!("missing notarized blocks at round {} during purge", start - 1);
        };
        if prev.len() <= 1 {
            return;
        }
        let Some(next) = self.notarized.get(&start) else {
            panic!("missing notarized blocks at round {start} during purge");
        };
        let survivors: Vec<NotarizedBlock<V>> = prev
            .iter()
            .filter(|p| {
                let hash = p.block.hash();
                next.iter().any(|n| n.block.header.prv_hash == hash)
            })
            .cloned()
            .collect();
        if survivors.len() != 1 {
            panic!(
                "purge at round {} left {} referenced blocks (expected exactly one)",
                start - 1,
                survivors.len()
            );
        }
        self.notarized.insert(start - 1, survivors);
    }

    /// The notarized block at `round` heading the heaviest chain of
    /// notarized blocks back to the finalized boundary. Weights derive from
    /// each block's own round randomness; the first block at the maximum
    /// wins. `round == 0` returns genesis.
    pub fn highest_chain_head(&self, round: Round) -> Result<NotarizedBlock<V>, Error> {
        if round == 0 {
            return Ok(self
                .notarized
                .get(&0)
                .map(|entries| entries[0].clone())
                .unwrap_or_else(NotarizedBlock::genesis));
        }
        let candidates = self
            .notarized
            .get(&round)
            .ok_or(Error::NoBlocksForRound(round))?;
        let boundary = self.chain.head().header.round;
        let mut tables = BTreeMap::new();
        let mut best: Option<&NotarizedBlock<V>> = None;
        let mut best_weight = 0;
        for candidate in candidates {
            let weight = self.chain_weight(candidate, boundary, &mut tables);
            if weight > best_weight {
                best = Some(candidate);
                best_weight = weight;
            }
        }
        best.cloned().ok_or(Error::NoBlocksForRound(round))
    }

    /// Weight of `block` plus the heaviest ancestry of notarized blocks
    /// below it, down to the finalized boundary.
    fn chain_weight(
        &self,
        block: &NotarizedBlock<V>,
        boundary: Round,
        tables: &mut BTreeMap<Round, Vec<u64>>,
    ) -> u64 {
        let weight = self.weight_of(block, tables);
        let round = block.round();
        if round <= boundary + 1 {
            return weight;
        }
        let Some(prev) = self.notarized.get(&(round - 1)) else {
            return weight;
        };
        let mut heaviest = 0;
        for parent in prev {
            if parent.block.hash() != block.block.header.prv_hash {
                continue;
            }
            heaviest = heaviest.max(self.chain_weight(parent, boundary, tables));
        }
        weight + heaviest
    }

    fn weight_of(&self, block: &NotarizedBlock<V>, tables: &mut BTreeMap<Round, Vec<u64>>) -> u64 {
        let owner = block.block.header.owner;
        if owner < 0 {
            return 0;
        }
        let table = tables.entry(block.round()).or_insert_with(|| {
            weights::weights(self.block_makers as usize, block.block.header.randomness)
        });
        table.get(owner as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{genesis, BlockHeader, Notarization};
    use bytes::Bytes;
    use commonware_cryptography::{
        bls12381::primitives::{group::Element, variant::MinSig},
        sha256,
    };

    /// Build a notarized block (the finalizer never verifies signatures, so
    /// a zero placeholder keeps the tests focused on ordering).
    fn notarized(round: Round, owner: i64, randomness: i64, parent: &Block) -> NotarizedBlock<MinSig> {
        let blob = Bytes::from(format!("round {round} owner {owner}"));
        let block = Block {
            header: BlockHeader {
                round,
                owner,
                root: sha256::hash(&blob),
                randomness,
                prv_hash: parent.hash(),
                prv_sig: Bytes::from_static(b"sig"),
            },
            blob,
        };
        let hash = block.hash();
        NotarizedBlock {
            block,
            notarization: Notarization {
                hash,
                signature: <MinSig as Variant>::Signature::zero(),
            },
        }
    }

    fn linked_rounds(count: u64) -> Vec<NotarizedBlock<MinSig>> {
        let mut parent = genesis();
        let mut blocks = Vec::new();
        for round in 1..=count {
            let n = notarized(round, 0, round as i64, &parent);
            parent = n.block.clone();
            blocks.push(n);
        }
        blocks
    }

    #[test]
    fn test_store_dedup() {
        let mut finalizer = Finalizer::<MinSig>::new(2);
        let rounds = linked_rounds(1);
        assert!(finalizer.store(rounds[0].clone()));
        // Redelivery neither duplicates nor re-triggers.
        assert!(!finalizer.store(rounds[0].clone()));
        assert_eq!(finalizer.notarized.get(&1).unwrap().len(), 1);
    }

    #[test]
    fn test_store_below_cursor_dropped() {
        let mut finalizer = Finalizer::<MinSig>::new(2);
        let rounds = linked_rounds(2);
        assert!(finalizer.store(rounds[0].clone()));
        finalizer.finalize(1);
        finalizer.store(rounds[1].clone());
        finalizer.finalize(2);
        // Cursor is now 3; round 1 is ancient history.
        assert!(!finalizer.store(rounds[0].clone()));
        assert!(!finalizer.notarized.contains_key(&1) || finalizer.notarized[&1].len() == 1);
    }

    #[test]
    fn test_finalize_early_rounds_only_advance() {
        let mut finalizer = Finalizer::<MinSig>::new(2);
        let rounds = linked_rounds(1);
        assert!(finalizer.store(rounds[0].clone()));
        let (appended, _) = finalizer.finalize(1);
        assert!(appended.is_none());
        assert_eq!(finalizer.round, 2);
        assert_eq!(finalizer.chain().len(), 1);
    }

    #[test]
    fn test_finalize_lag_two() {
        let mut finalizer = Finalizer::<MinSig>::new(2);
        let rounds = linked_rounds(5);

        // Deliver rounds one at a time, finalizing as each trigger fires.
        for n in &rounds {
            let trigger = finalizer.store(n.clone());
            assert!(trigger, "each round's first block triggers at the cursor");
            let (_, more) = finalizer.finalize(n.round());
            assert!(!more);
        }

        // Rounds 1..=3 are final (lag of two); 4 and 5 still buffered.
        let chain = finalizer.chain();
        assert_eq!(chain.len(), 4);
        assert_eq!(chain.blocks()[0].header.round, 0);
        for (i, block) in chain.blocks().iter().enumerate().skip(1) {
            assert_eq!(block.header.round, i as u64);
            assert_eq!(block.header.prv_hash, chain.blocks()[i - 1].hash());
        }
        assert!(finalizer.notarized.contains_key(&4));
        assert!(finalizer.notarized.contains_key(&5));
    }

    #[test]
    fn test_finalize_catch_up() {
        let mut finalizer = Finalizer::<MinSig>::new(2);
        let rounds = linked_rounds(5);

        // All rounds arrive while the first finalization is still pending:
        // only round 1 triggers, and completion re-arms each next round.
        let mut triggers = 0;
        for n in &rounds {
            if finalizer.store(n.clone()) {
                triggers += 1;
            }
        }
        assert_eq!(triggers, 1);

        let mut round = 1;
        loop {
            let (_, more) = finalizer.finalize(round);
            if !more {
                break;
            }
            round += 1;
        }
        assert_eq!(finalizer.chain().len(), 4);
        assert_eq!(finalizer.chain().head().header.round, 3);
    }

    #[test]
    fn test_highest_chain_head_genesis() {
        let finalizer = Finalizer::<MinSig>::new(2);
        let head = finalizer.highest_chain_head(0).unwrap();
        assert_eq!(head.block, genesis());
    }

    #[test]
    fn test_highest_chain_head_missing_round() {
        let finalizer = Finalizer::<MinSig>::new(2);
        assert!(matches!(
            finalizer.highest_chain_head(3),
            Err(Error::NoBlocksForRound(3))
        ));
    }

    #[test]
    fn test_highest_chain_head_sums_whole_chain() {
        let block_makers = 4;
        let mut finalizer = Finalizer::<MinSig>::new(block_makers);

        // Round 1: the heaviest and lightest owners under this randomness.
        let r1 = 11;
        let w1 = weights::weights(block_makers as usize, r1);
        let heavy1 = w1.iter().position(|w| *w == 4).unwrap() as i64;
        let light1 = w1.iter().position(|w| *w == 1).unwrap() as i64;
        let a = notarized(1, heavy1, r1, &genesis());
        let b = notarized(1, light1, r1, &genesis());

        // Round 2: the lighter head extends the heavy chain, the heavier head
        // extends the light chain. Whole-chain weight must decide (2 + 4 = 6
        // beats 3 + 1 = 4), not the head's own weight.
        let r2 = 23;
        let w2 = weights::weights(block_makers as usize, r2);
        let mid_low = w2.iter().position(|w| *w == 2).unwrap() as i64;
        let mid_high = w2.iter().position(|w| *w == 3).unwrap() as i64;
        let c = notarized(2, mid_low, r2, &a.block);
        let d = notarized(2, mid_high, r2, &b.block);

        finalizer.store(a);
        finalizer.store(b);
        finalizer.store(c.clone());
        finalizer.store(d);

        let head = finalizer.highest_chain_head(2).unwrap();
        assert_eq!(head, c);
    }

    #[test]
    fn test_purge_keeps_referenced_ancestor() {
        let mut finalizer = Finalizer::<MinSig>::new(4);
        let a = notarized(1, 0, 1, &genesis());
        let b = notarized(1, 1, 1, &genesis());
        let c = notarized(2, 0, 2, &a.block);
        let e = notarized(3, 0, 3, &c.block);

        assert!(finalizer.store(a.clone()));
        finalizer.store(b);
        finalizer.finalize(1);
        assert!(finalizer.store(c));
        finalizer.finalize(2);
        assert!(finalizer.store(e));
        // Finalizing round 3 purges round 1 down to the block round 2
        // references and appends it.
        let (appended, _) = finalizer.finalize(3);
        assert_eq!(appended, Some(a.block.clone()));
        assert_eq!(finalizer.chain().head(), &a.block);
    }

    #[test]
    #[should_panic(expected = "expected exactly one")]
    fn test_purge_rejects_forked_ancestry() {
        let mut finalizer = Finalizer::<MinSig>::new(4);
        let a = notarized(1, 0, 1, &genesis());
        let b = notarized(1, 1, 1, &genesis());
        let c = notarized(2, 0, 2, &a.block);
        let d = notarized(2, 1, 2, &b.block);
        let e = notarized(3, 0, 3, &c.block);

        assert!(finalizer.store(a));
        finalizer.store(b);
        finalizer.finalize(1);
        assert!(finalizer.store(c));
        finalizer.store(d);
        finalizer.finalize(2);
        assert!(finalizer.store(e));
        // Both round-1 blocks remain referenced from round 2: the protocol
        // invariant is violated and finalization must abort loudly.
        finalizer.finalize(3);
    }
}
