//! Block makers extend the heaviest notarized chain each round.
//!
//! A beacon packet for round `R` can only be acted on once this node has
//! seen a notarized block for `R-1`; packets that arrive early are parked
//! and retried whenever a notarized block lands.

use crate::{
    config::Config,
    finalizer::Finalizer,
    types::{BeaconPacket, Block, BlockHeader, Message, NotarizedBlock, Round},
    Activity, Reporter,
};
use bytes::Bytes;
use commonware_codec::Encode;
use commonware_cryptography::{
    bls12381::primitives::variant::Variant, ed25519::PublicKey, sha256,
};
use commonware_macros::select;
use commonware_p2p::{
    utils::codec::{wrap, WrappedSender},
    Receiver, Recipients, Sender,
};
use commonware_runtime::Clock;
use commonware_utils::hex;
use futures::future::{self, Either};
use rand::Rng;
use std::{collections::BTreeMap, time::SystemTime};
use tracing::{debug, info, warn};

pub struct Actor<E: Clock + Rng, V: Variant, F: Reporter<Activity = Activity<V>>> {
    context: E,
    cfg: Config<V, F>,
    finalizer: Finalizer<V>,

    /// Beacon packets waiting on a notarized block for their parent round.
    parked: BTreeMap<Round, BeaconPacket>,

    /// Finalization scheduled by the finalizer, if any.
    pending_finalize: Option<(Round, SystemTime)>,
}

impl<E: Clock + Rng, V: Variant, F: Reporter<Activity = Activity<V>>> Actor<E, V, F> {
    pub fn new(context: E, cfg: Config<V, F>) -> Self {
        let finalizer = Finalizer::new(cfg.block_makers);
        Self {
            context,
            cfg,
            finalizer,
            parked: BTreeMap::new(),
            pending_finalize: None,
        }
    }

    pub async fn run(
        mut self,
        sender: impl Sender<PublicKey = PublicKey>,
        receiver: impl Receiver<PublicKey = PublicKey>,
    ) {
        let (mut sender, mut receiver) = wrap((), sender, receiver);
        let notarizers = self.cfg.notarizer_peers();

        loop {
            let finalize_wait = match self.pending_finalize {
                Some((_, at)) => Either::Left(self.context.sleep_until(at)),
                None => Either::Right(future::pending()),
            };
            select! {
                _ = finalize_wait => {
                    let (round, _) = self.pending_finalize.take().expect("deadline without round");
                    self.finalized(round).await;
                },
                result = receiver.recv() => {
                    let (peer, msg) = match result {
                        Ok(received) => received,
                        Err(_) => return,
                    };
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(err) => {
                            debug!(?err, ?peer, "dropping undecodable message");
                            continue;
                        }
                    };
                    match msg {
                        Message::Beacon(packet) => {
                            if self.finalizer.highest_round() + 1 >= packet.round {
                                self.propose(packet, &notarizers, &mut sender).await;
                            } else {
                                debug!(round = packet.round, "parking beacon until parent round lands");
                                self.parked.insert(packet.round, packet);
                            }
                        }
                        Message::Notarized(notarized) => {
                            self.store(notarized);
                            self.drain_parked(&notarizers, &mut sender).await;
                        }
                        _ => {}
                    }
                },
            }
        }
    }

    /// Record a notarized block, scheduling finalization when it is the
    /// first one for the finalizer's cursor round.
    fn store(&mut self, notarized: NotarizedBlock<V>) {
        let round = notarized.round();
        if self.finalizer.store(notarized) {
            assert!(
                self.pending_finalize.is_none(),
                "finalization already pending at round {round}"
            );
            self.pending_finalize =
                Some((round, self.context.current() + self.cfg.finalize_time));
        }
    }

    async fn finalized(&mut self, round: Round) {
        let (appended, more) = self.finalizer.finalize(round);
        if let Some(block) = appended {
            self.cfg.reporter.report(Activity::Finalized(block)).await;
        }
        if more {
            self.pending_finalize =
                Some((round + 1, self.context.current() + self.cfg.finalize_time));
        }
    }

    /// Retry parked beacon packets whose parent round has since landed.
    async fn drain_parked<S: Sender<PublicKey = PublicKey>>(
        &mut self,
        notarizers: &[PublicKey],
        sender: &mut WrappedSender<S, Message<V>>,
    ) {
        let highest = self.finalizer.highest_round();
        let ready: Vec<Round> = self
            .parked
            .keys()
            .copied()
            .filter(|round| highest + 1 >= *round)
            .collect();
        for round in ready {
            let packet = self.parked.remove(&round).expect("parked packet must exist");
            self.propose(packet, notarizers, sender).await;
        }
    }

    /// Build a block on the heaviest head of the previous round and offer it
    /// to the notarizers.
    async fn propose<S: Sender<PublicKey = PublicKey>>(
        &mut self,
        packet: BeaconPacket,
        notarizers: &[PublicKey],
        sender: &mut WrappedSender<S, Message<V>>,
    ) {
        let parent = match self.finalizer.highest_chain_head(packet.round - 1) {
            Ok(parent) => parent,
            Err(err) => panic!("cannot extend round {}: {err}", packet.round - 1),
        };

        let mut blob = vec![0u8; self.cfg.block_size];
        self.context.fill_bytes(&mut blob);
        let blob = Bytes::from(blob);
        let header = BlockHeader {
            round: packet.round,
            owner: (self.cfg.index - self.cfg.beacons) as i64,
            root: sha256::hash(&blob),
            randomness: packet.randomness,
            prv_hash: parent.block.hash(),
            prv_sig: Bytes::from(parent.notarization.signature.encode()),
        };
        let block = Block { header, blob };
        info!(
            round = packet.round,
            owner = block.header.owner,
            hash = hex(block.hash().as_ref()),
            parent = hex(block.header.prv_hash.as_ref()),
            "proposing block"
        );
        if let Err(err) = sender
            .send(
                Recipients::Some(notarizers.to_vec()),
                Message::Proposal(block),
                true,
            )
            .await
        {
            warn!(?err, round = packet.round, "failed to send proposal");
        }
    }
}
