//! Round-local aggregation of blocks and partial signatures.
//!
//! [BlockStorage] collects partials for a single block until the threshold
//! signature can be recovered. [RoundStorage] tracks every block seen in a
//! round, which blocks are notarized, and the monotonic weight watermarks
//! that drive broadcast and signing decisions.

use crate::{
    types::{notarize_message, Block, Notarization, NotarizedBlock, Round, SignatureProposal},
    weights, Error,
};
use commonware_cryptography::{
    bls12381::primitives::{
        group::Share,
        ops::{
            partial_sign_message, partial_verify_message, threshold_signature_recover,
            verify_message,
        },
        poly::{self, PartialSignature, Public},
        variant::Variant,
    },
    sha256::Digest,
};
use std::collections::BTreeMap;
use tracing::debug;

/// A block and the partial signatures observed for it, keyed by signer index.
///
/// Once notarized, the partial set is frozen and further deliveries are
/// no-ops.
pub struct BlockStorage<V: Variant> {
    block: Block,
    digest: Digest,
    partials: BTreeMap<u32, PartialSignature<V>>,
    notarization: Option<Notarization<V>>,
}

impl<V: Variant> BlockStorage<V> {
    pub fn new(block: Block) -> Self {
        let digest = block.hash();
        Self {
            block,
            digest,
            partials: BTreeMap::new(),
            notarization: None,
        }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn notarized(&self) -> bool {
        self.notarization.is_some()
    }

    /// Add a partial signature over this block's header hash.
    ///
    /// Returns the notarized block when this partial is the one that reaches
    /// the threshold. Duplicate signer indices are ignored. Fails only if the
    /// partial does not verify.
    pub fn add_partial(
        &mut self,
        identity: &Public<V>,
        threshold: u32,
        namespace: &[u8],
        partial: PartialSignature<V>,
    ) -> Result<Option<NotarizedBlock<V>>, Error> {
        if self.notarization.is_some() {
            return Ok(None);
        }
        let message = notarize_message(&self.digest);
        partial_verify_message::<V>(identity, Some(namespace), &message, &partial)
            .map_err(|_| Error::InvalidSignature)?;
        if self.partials.contains_key(&partial.index) {
            return Ok(None);
        }
        self.partials.insert(partial.index, partial);
        if (self.partials.len() as u32) < threshold {
            return Ok(None);
        }
        let signature = threshold_signature_recover::<V, _>(threshold, self.partials.values())
            .expect("recovery cannot fail with threshold verified partials");
        let notarization = Notarization {
            hash: self.digest.clone(),
            signature,
        };
        self.notarization = Some(notarization.clone());
        Ok(Some(NotarizedBlock {
            block: self.block.clone(),
            notarization,
        }))
    }

    /// Produce this node's partial signature over the header hash.
    pub fn sign(&self, share: &Share, namespace: &[u8]) -> SignatureProposal<V> {
        let partial =
            partial_sign_message::<V>(share, Some(namespace), &notarize_message(&self.digest));
        SignatureProposal {
            block: self.block.clone(),
            partial,
        }
    }

    /// Accept an externally recovered threshold signature, verifying it
    /// against the public commitment. Idempotent once notarized.
    pub fn set_notarization(
        &mut self,
        identity: &Public<V>,
        namespace: &[u8],
        signature: V::Signature,
    ) -> Result<(), Error> {
        if self.notarization.is_some() {
            return Ok(());
        }
        verify_message::<V>(
            poly::public::<V>(identity),
            Some(namespace),
            &notarize_message(&self.digest),
            &signature,
        )
        .map_err(|_| Error::InvalidSignature)?;
        self.notarization = Some(Notarization {
            hash: self.digest.clone(),
            signature,
        });
        Ok(())
    }
}

/// Everything a notarizer tracks for one round.
///
/// Callers route messages by round before touching this storage; a mismatch
/// is a programmer error and panics.
pub struct RoundStorage<V: Variant> {
    round: Round,
    weights: Vec<u64>,
    blocks: BTreeMap<Digest, BlockStorage<V>>,
    notarized: Vec<NotarizedBlock<V>>,
    max_weight_notarized: u64,
    max_weight_signed: u64,
}

impl<V: Variant> RoundStorage<V> {
    /// Open storage for `round` with weights derived from the beacon's
    /// randomness over the block-maker set.
    pub fn new(round: Round, randomness: i64, block_makers: u32) -> Self {
        Self {
            round,
            weights: weights::weights(block_makers as usize, randomness),
            blocks: BTreeMap::new(),
            notarized: Vec::new(),
            max_weight_notarized: 0,
            max_weight_signed: 0,
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    fn weight_of(&self, owner: i64) -> u64 {
        if owner < 0 {
            return 0;
        }
        self.weights.get(owner as usize).copied().unwrap_or(0)
    }

    /// Record a proposed block. Proposals carry no signature material, so
    /// nothing is verified here. Duplicates are no-ops.
    pub fn store_proposal(&mut self, block: Block) {
        assert_eq!(block.header.round, self.round, "proposal routed to wrong round");
        let digest = block.hash();
        self.blocks
            .entry(digest)
            .or_insert_with(|| BlockStorage::new(block));
    }

    /// Record a peer's partial signature.
    ///
    /// If the block is unknown, the embedded copy is recorded but the partial
    /// is not aggregated: partials only count once this node has signed the
    /// block itself (via [Self::highest_signature]). Returns the notarized
    /// block when this partial reached the threshold; the caller hands it to
    /// the finalizer.
    pub fn store_signature(
        &mut self,
        identity: &Public<V>,
        threshold: u32,
        namespace: &[u8],
        proposal: SignatureProposal<V>,
    ) -> Result<Option<NotarizedBlock<V>>, Error> {
        assert_eq!(
            proposal.block.header.round, self.round,
            "signature routed to wrong round"
        );
        let digest = proposal.block.hash();
        let Some(storage) = self.blocks.get_mut(&digest) else {
            debug!(
                round = self.round,
                signer = proposal.signer(),
                "signature for unknown block"
            );
            self.blocks
                .insert(digest, BlockStorage::new(proposal.block));
            return Ok(None);
        };
        match storage.add_partial(identity, threshold, namespace, proposal.partial)? {
            Some(notarized) => {
                self.notarized.push(notarized.clone());
                Ok(Some(notarized))
            }
            None => Ok(None),
        }
    }

    /// Record an externally notarized block, verifying its threshold
    /// signature against the public commitment. The caller hands it to the
    /// finalizer on success.
    pub fn store_notarized(
        &mut self,
        identity: &Public<V>,
        namespace: &[u8],
        notarized: NotarizedBlock<V>,
    ) -> Result<(), Error> {
        assert_eq!(
            notarized.round(),
            self.round,
            "notarized block routed to wrong round"
        );
        let digest = notarized.block.hash();
        match self.blocks.get_mut(&digest) {
            Some(storage) => {
                storage.set_notarization(
                    identity,
                    namespace,
                    notarized.notarization.signature.clone(),
                )?;
            }
            None => {
                // Verify before recording so a forged notarization leaves no
                // trace behind.
                let mut storage = BlockStorage::new(notarized.block.clone());
                storage.set_notarization(
                    identity,
                    namespace,
                    notarized.notarization.signature.clone(),
                )?;
                self.blocks.insert(digest, storage);
            }
        }
        self.notarized.push(notarized);
        Ok(())
    }

    /// The notarized block with the greatest owner weight seen since the
    /// previous call, or `None` if no higher-weighted one has arrived. The
    /// watermark only advances.
    pub fn highest_notarized(&mut self) -> Option<NotarizedBlock<V>> {
        let mut best = None;
        let mut best_weight = self.max_weight_notarized;
        for notarized in &self.notarized {
            let weight = self.weight_of(notarized.block.header.owner);
            if weight > best_weight {
                best = Some(notarized);
                best_weight = weight;
            }
        }
        let best = best.cloned();
        if best.is_some() {
            self.max_weight_notarized = best_weight;
        }
        best
    }

    /// Sign the highest-weighted known block above the signing watermark.
    ///
    /// The fresh partial is recorded locally before being returned (our own
    /// share may complete the threshold, in which case the notarized block is
    /// returned alongside). `None` when there is nothing new to sign.
    pub fn highest_signature(
        &mut self,
        share: &Share,
        identity: &Public<V>,
        threshold: u32,
        namespace: &[u8],
    ) -> Result<Option<(SignatureProposal<V>, Option<NotarizedBlock<V>>)>, Error> {
        let mut best = None;
        let mut best_weight = self.max_weight_signed;
        for (digest, storage) in &self.blocks {
            let weight = self.weight_of(storage.block().header.owner);
            if weight > best_weight {
                best = Some(digest.clone());
                best_weight = weight;
            }
        }
        let Some(digest) = best else {
            return Ok(None);
        };
        self.max_weight_signed = best_weight;
        let storage = self.blocks.get_mut(&digest).expect("selected block must exist");
        let proposal = storage.sign(share, namespace);
        let notarized =
            match storage.add_partial(identity, threshold, namespace, proposal.partial.clone())? {
                Some(notarized) => {
                    self.notarized.push(notarized.clone());
                    Some(notarized)
                }
                None => None,
            };
        Ok(Some((proposal, notarized)))
    }

    /// Whether any notarized block has been stored this round.
    pub fn is_notarized(&self) -> bool {
        !self.notarized.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{notarize_namespace, BlockHeader};
    use bytes::Bytes;
    use commonware_cryptography::{
        bls12381::{dkg::ops::generate_shares, primitives::variant::MinSig},
        sha256,
    };
    use rand::{rngs::StdRng, SeedableRng};

    const NAMESPACE: &[u8] = b"probchain-test";

    fn setup(n: u32, t: u32) -> (Public<MinSig>, Vec<Share>, Vec<u8>) {
        let mut rng = StdRng::seed_from_u64(67912);
        let (identity, shares) = generate_shares::<_, MinSig>(&mut rng, None, n, t);
        (identity, shares, notarize_namespace(NAMESPACE))
    }

    fn block(round: Round, owner: i64, randomness: i64) -> Block {
        let blob = Bytes::from(vec![owner as u8 + 1; 100]);
        Block {
            header: BlockHeader {
                round,
                owner,
                root: sha256::hash(&blob),
                randomness,
                prv_hash: crate::types::genesis().hash(),
                prv_sig: Bytes::from_static(b"prv"),
            },
            blob,
        }
    }

    fn partial(
        shares: &[Share],
        index: usize,
        namespace: &[u8],
        block: &Block,
    ) -> PartialSignature<MinSig> {
        partial_sign_message::<MinSig>(
            &shares[index],
            Some(namespace),
            &notarize_message(&block.hash()),
        )
    }

    #[test]
    fn test_threshold_recovery() {
        let (identity, shares, ns) = setup(3, 3);
        let b = block(1, 0, 1);
        let mut storage = BlockStorage::<MinSig>::new(b.clone());
        for i in 0..2 {
            let result = storage
                .add_partial(&identity, 3, &ns, partial(&shares, i, &ns, &b))
                .unwrap();
            assert!(result.is_none());
            assert!(!storage.notarized());
        }
        let notarized = storage
            .add_partial(&identity, 3, &ns, partial(&shares, 2, &ns, &b))
            .unwrap()
            .expect("third partial must notarize");
        assert!(storage.notarized());

        // The recovered signature verifies against the public commitment.
        verify_message::<MinSig>(
            poly::public::<MinSig>(&identity),
            Some(&ns),
            &notarize_message(&b.hash()),
            &notarized.notarization.signature,
        )
        .expect("recovered signature must verify");
    }

    #[test]
    fn test_invalid_partial_rejected() {
        let (identity, shares, ns) = setup(3, 3);
        let b = block(1, 0, 1);
        let mut storage = BlockStorage::<MinSig>::new(b.clone());

        // A partial from a foreign share set does not verify.
        let mut rng = StdRng::seed_from_u64(1);
        let (_, foreign) = generate_shares::<_, MinSig>(&mut rng, None, 3, 3);
        let noise = partial_sign_message::<MinSig>(
            &foreign[0],
            Some(&ns),
            &notarize_message(&b.hash()),
        );
        assert!(matches!(
            storage.add_partial(&identity, 3, &ns, noise),
            Err(Error::InvalidSignature)
        ));

        // A partial over the wrong message does not verify either.
        let wrong = partial_sign_message::<MinSig>(&shares[0], Some(&ns), b"something else");
        assert!(matches!(
            storage.add_partial(&identity, 3, &ns, wrong),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_duplicate_partial_ignored() {
        let (identity, shares, ns) = setup(3, 3);
        let b = block(1, 0, 1);
        let mut storage = BlockStorage::<MinSig>::new(b.clone());
        let p = partial(&shares, 0, &ns, &b);
        assert!(storage.add_partial(&identity, 3, &ns, p.clone()).unwrap().is_none());
        // Redelivery is a no-op, not an error.
        assert!(storage.add_partial(&identity, 3, &ns, p).unwrap().is_none());
        assert_eq!(storage.partials.len(), 1);
    }

    #[test]
    fn test_set_notarization() {
        let (identity, shares, ns) = setup(3, 2);
        let b = block(1, 0, 1);

        // Recover a signature externally.
        let partials = vec![partial(&shares, 0, &ns, &b), partial(&shares, 1, &ns, &b)];
        let signature = threshold_signature_recover::<MinSig, _>(2, partials.iter()).unwrap();

        let mut storage = BlockStorage::<MinSig>::new(b.clone());
        storage
            .set_notarization(&identity, &ns, signature.clone())
            .unwrap();
        assert!(storage.notarized());

        // Partials after notarization are frozen out.
        assert!(storage
            .add_partial(&identity, 2, &ns, partial(&shares, 2, &ns, &b))
            .unwrap()
            .is_none());
        assert!(storage.partials.is_empty());

        // A signature from a foreign key is rejected.
        let mut rng = StdRng::seed_from_u64(2);
        let (_, foreign_shares) = generate_shares::<_, MinSig>(&mut rng, None, 2, 2);
        let foreign_partials = vec![
            partial_sign_message::<MinSig>(&foreign_shares[0], Some(&ns), &notarize_message(&b.hash())),
            partial_sign_message::<MinSig>(&foreign_shares[1], Some(&ns), &notarize_message(&b.hash())),
        ];
        let foreign = threshold_signature_recover::<MinSig, _>(2, foreign_partials.iter()).unwrap();
        let mut fresh = BlockStorage::<MinSig>::new(b);
        assert!(matches!(
            fresh.set_notarization(&identity, &ns, foreign),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_store_proposal_idempotent() {
        let mut round = RoundStorage::<MinSig>::new(1, 7, 2);
        let b = block(1, 0, 7);
        round.store_proposal(b.clone());
        round.store_proposal(b);
        assert_eq!(round.blocks.len(), 1);
    }

    #[test]
    #[should_panic(expected = "proposal routed to wrong round")]
    fn test_store_proposal_wrong_round() {
        let mut round = RoundStorage::<MinSig>::new(1, 7, 2);
        round.store_proposal(block(2, 0, 7));
    }

    #[test]
    fn test_signature_for_unknown_block_not_aggregated() {
        let (identity, shares, ns) = setup(3, 2);
        let mut round = RoundStorage::<MinSig>::new(1, 7, 2);
        let b = block(1, 0, 7);

        // A peer's signature for a block we have never seen records the block
        // without counting the partial.
        let peer = SignatureProposal {
            block: b.clone(),
            partial: partial(&shares, 1, &ns, &b),
        };
        assert!(round
            .store_signature(&identity, 2, &ns, peer.clone())
            .unwrap()
            .is_none());
        let storage = round.blocks.get(&b.hash()).unwrap();
        assert!(storage.partials.is_empty());

        // After signing it ourselves, the redelivered partial completes the
        // threshold.
        let (_, notarized) = round
            .highest_signature(&shares[0], &identity, 2, &ns)
            .unwrap()
            .expect("must sign the only block");
        assert!(notarized.is_none());
        let notarized = round
            .store_signature(&identity, 2, &ns, peer)
            .unwrap()
            .expect("threshold reached");
        assert_eq!(notarized.round(), 1);
        assert!(round.is_notarized());
    }

    #[test]
    fn test_highest_notarized_watermark() {
        let (identity, shares, ns) = setup(3, 1);
        let mut round = RoundStorage::<MinSig>::new(1, 7, 8);

        // Owners 2 and 5 under this randomness have distinct weights; find
        // which is ranked higher.
        let table = weights::weights(8, 7);
        let (low, high) = if table[2] < table[5] { (2, 5) } else { (5, 2) };

        for owner in [low, high] {
            let b = block(1, owner as i64, 7);
            let partials = vec![partial(&shares, 0, &ns, &b)];
            let signature = threshold_signature_recover::<MinSig, _>(1, partials.iter()).unwrap();
            round
                .store_notarized(
                    &identity,
                    &ns,
                    NotarizedBlock {
                        notarization: Notarization {
                            hash: b.hash(),
                            signature,
                        },
                        block: b,
                    },
                )
                .unwrap();
        }

        // The higher-weighted block wins, then the watermark suppresses both.
        let first = round.highest_notarized().expect("one block above watermark");
        assert_eq!(first.block.header.owner, high as i64);
        assert!(round.highest_notarized().is_none());
    }

    #[test]
    fn test_highest_signature_prefers_heavier_owner() {
        let (identity, shares, ns) = setup(3, 3);
        let mut round = RoundStorage::<MinSig>::new(1, 7, 8);
        let table = weights::weights(8, 7);
        let (low, high) = if table[2] < table[5] { (2, 5) } else { (5, 2) };

        round.store_proposal(block(1, low as i64, 7));
        round.store_proposal(block(1, high as i64, 7));

        let (proposal, notarized) = round
            .highest_signature(&shares[0], &identity, 3, &ns)
            .unwrap()
            .expect("unsigned blocks available");
        assert_eq!(proposal.block.header.owner, high as i64);
        assert!(notarized.is_none());

        // The lighter block is below the watermark and never signed.
        assert!(round
            .highest_signature(&shares[0], &identity, 3, &ns)
            .unwrap()
            .is_none());
    }
}
