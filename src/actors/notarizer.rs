//! Notarizers run the per-round collection loop: soak up proposals, sign the
//! highest-weighted one, aggregate partials into a threshold signature, and
//! broadcast the notarized block.
//!
//! Messages for rounds that have not opened yet are buffered and drained
//! when their round does; messages for concluded rounds are dropped. After
//! each inbound message every active round re-evaluates its progress (the
//! message-driven analogue of a condition-variable signal).

use crate::{
    config::Config,
    finalizer::Finalizer,
    storage::RoundStorage,
    types::{BeaconPacket, Block, Message, NotarizedBlock, Round, SignatureProposal},
    Activity, Reporter,
};
use commonware_cryptography::{
    bls12381::primitives::{group::Share, variant::Variant},
    ed25519::PublicKey,
};
use commonware_macros::select;
use commonware_p2p::{
    utils::codec::{wrap, WrappedSender},
    Receiver, Recipients, Sender,
};
use commonware_runtime::Clock;
use commonware_utils::hex;
use futures::future::{self, Either};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::SystemTime,
};
use tracing::{debug, info, warn};

pub struct Actor<E: Clock, V: Variant, F: Reporter<Activity = Activity<V>>> {
    context: E,
    cfg: Config<V, F>,
    share: Share,
    notarize_ns: Vec<u8>,

    /// The newest round admitted so far.
    current: Round,

    /// Storage for every open round.
    rounds: BTreeMap<Round, RoundStorage<V>>,

    /// Rounds still waiting out their soak time, by deadline.
    soaking: BTreeMap<Round, SystemTime>,

    /// Soaked rounds whose loop has not concluded.
    active: BTreeSet<Round>,

    /// Buffered messages for rounds that have not opened.
    tmp_beacon: BTreeMap<Round, BeaconPacket>,
    tmp_blocks: BTreeMap<Round, Vec<Block>>,
    tmp_sigs: BTreeMap<Round, Vec<SignatureProposal<V>>>,
    tmp_not: BTreeMap<Round, Vec<NotarizedBlock<V>>>,

    finalizer: Finalizer<V>,
    pending_finalize: Option<(Round, SystemTime)>,
}

impl<E: Clock, V: Variant, F: Reporter<Activity = Activity<V>>> Actor<E, V, F> {
    pub fn new(context: E, cfg: Config<V, F>) -> Self {
        let share = cfg.share.clone().expect("notarizer requires a share");
        let notarize_ns = crate::types::notarize_namespace(&cfg.namespace);
        let finalizer = Finalizer::new(cfg.block_makers);
        Self {
            context,
            share,
            notarize_ns,
            finalizer,
            cfg,
            current: 0,
            rounds: BTreeMap::new(),
            soaking: BTreeMap::new(),
            active: BTreeSet::new(),
            tmp_beacon: BTreeMap::new(),
            tmp_blocks: BTreeMap::new(),
            tmp_sigs: BTreeMap::new(),
            tmp_not: BTreeMap::new(),
            pending_finalize: None,
        }
    }

    pub async fn run(
        mut self,
        sender: impl Sender<PublicKey = PublicKey>,
        receiver: impl Receiver<PublicKey = PublicKey>,
    ) {
        let (mut sender, mut receiver) = wrap((), sender, receiver);

        loop {
            let next_soak = self
                .soaking
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(round, at)| (*round, *at));
            let soak_wait = match next_soak {
                Some((_, at)) => Either::Left(self.context.sleep_until(at)),
                None => Either::Right(future::pending()),
            };
            let finalize_wait = match self.pending_finalize {
                Some((_, at)) => Either::Left(self.context.sleep_until(at)),
                None => Either::Right(future::pending()),
            };
            select! {
                _ = soak_wait => {
                    let (round, _) = next_soak.expect("soak deadline without round");
                    self.soaking.remove(&round);
                    self.active.insert(round);
                    self.progress(round, &mut sender).await;
                },
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
                    self.handle(msg);
                    for round in self.active.clone() {
                        self.progress(round, &mut sender).await;
                    }
                },
            }
        }
    }

    /// Route an inbound message to its round, buffering messages for rounds
    /// that have not opened and dropping messages for rounds long gone.
    fn handle(&mut self, msg: Message<V>) {
        match msg {
            Message::Beacon(packet) => self.admit(packet),
            Message::Proposal(block) => {
                let round = block.header.round;
                if round < self.current {
                    debug!(round, current = self.current, "dropping old proposal");
                } else if let Some(storage) = self.rounds.get_mut(&round) {
                    storage.store_proposal(block);
                } else {
                    self.tmp_blocks.entry(round).or_default().push(block);
                }
            }
            Message::Signature(proposal) => {
                let round = proposal.block.header.round;
                if round > self.current {
                    self.tmp_sigs.entry(round).or_default().push(proposal);
                } else if round < self.current {
                    debug!(round, current = self.current, "dropping old signature");
                } else if self.rounds.contains_key(&round) {
                    self.store_signature(round, proposal);
                } else {
                    self.tmp_sigs.entry(round).or_default().push(proposal);
                }
            }
            Message::Notarized(notarized) => {
                let round = notarized.round();
                if round > self.current {
                    self.tmp_not.entry(round).or_default().push(notarized);
                } else if self.rounds.contains_key(&round) {
                    self.absorb_notarized(round, notarized);
                } else {
                    debug!(round, current = self.current, "dropping stale notarized block");
                }
            }
        }
    }

    /// Admit a beacon packet: drop stale rounds, buffer packets from the
    /// future, open the next round.
    fn admit(&mut self, packet: BeaconPacket) {
        if packet.round <= self.current {
            debug!(round = packet.round, current = self.current, "dropping old beacon");
            return;
        }
        if packet.round > self.current + 1 {
            self.tmp_beacon.insert(packet.round, packet);
            return;
        }
        self.current = packet.round;
        self.rounds.insert(
            packet.round,
            RoundStorage::new(packet.round, packet.randomness, self.cfg.block_makers),
        );
        self.soaking
            .insert(packet.round, self.context.current() + self.cfg.block_time);
        info!(round = packet.round, "opened round");
    }

    /// One pass of the round's work cycle, repeated until the round either
    /// concludes or runs out of new input.
    async fn progress<S: Sender<PublicKey = PublicKey>>(
        &mut self,
        round: Round,
        sender: &mut WrappedSender<S, Message<V>>,
    ) {
        if !self.active.contains(&round) {
            return;
        }
        loop {
            // The beacon moved on or finalization discarded the round.
            if round != self.current || !self.rounds.contains_key(&round) {
                self.conclude(round);
                return;
            }

            // Absorb notarized blocks that arrived before the round opened.
            let mut absorbed = false;
            for notarized in self.tmp_not.remove(&round).unwrap_or_default() {
                absorbed |= self.absorb_notarized(round, notarized);
            }
            if absorbed {
                self.broadcast_notarized(round, sender).await;
                self.conclude(round);
                return;
            }

            // Absorb buffered proposals and signatures.
            for block in self.tmp_blocks.remove(&round).unwrap_or_default() {
                self.rounds
                    .get_mut(&round)
                    .expect("round storage checked above")
                    .store_proposal(block);
            }
            for proposal in self.tmp_sigs.remove(&round).unwrap_or_default() {
                self.store_signature(round, proposal);
            }

            // Someone (maybe us, just now) notarized a block this round.
            if self
                .rounds
                .get(&round)
                .expect("round storage checked above")
                .is_notarized()
            {
                self.broadcast_notarized(round, sender).await;
                self.conclude(round);
                return;
            }

            // Sign the highest-weighted proposal not yet signed.
            let outcome = self
                .rounds
                .get_mut(&round)
                .expect("round storage checked above")
                .highest_signature(
                    &self.share,
                    &self.cfg.identity,
                    self.cfg.threshold,
                    &self.notarize_ns,
                )
                .expect("own partial signature must verify");
            let Some((proposal, notarized)) = outcome else {
                // Nothing new to sign: stay active and wait for input.
                return;
            };
            debug!(
                round,
                hash = hex(proposal.block.hash().as_ref()),
                "signing block proposal"
            );
            if let Err(err) = sender
                .send(
                    Recipients::Some(self.cfg.notarizer_peers()),
                    Message::Signature(proposal),
                    true,
                )
                .await
            {
                warn!(?err, round, "failed to send signature proposal");
            }
            if let Some(notarized) = notarized {
                // Our own share completed the threshold.
                self.schedule_finalize(notarized);
                self.broadcast_notarized(round, sender).await;
                self.conclude(round);
                return;
            }
        }
    }

    /// Store a peer's partial signature for an open round, handing any
    /// recovered notarization to the finalizer.
    fn store_signature(&mut self, round: Round, proposal: SignatureProposal<V>) {
        let signer = proposal.signer();
        let result = self
            .rounds
            .get_mut(&round)
            .expect("caller checked round storage")
            .store_signature(
                &self.cfg.identity,
                self.cfg.threshold,
                &self.notarize_ns,
                proposal,
            );
        match result {
            Ok(Some(notarized)) => self.schedule_finalize(notarized),
            Ok(None) => {}
            Err(err) => warn!(?err, round, signer, "dropping invalid signature proposal"),
        }
    }

    /// Store an externally notarized block for an open round. Returns
    /// whether the block was accepted.
    fn absorb_notarized(&mut self, round: Round, notarized: NotarizedBlock<V>) -> bool {
        let result = self
            .rounds
            .get_mut(&round)
            .expect("caller checked round storage")
            .store_notarized(&self.cfg.identity, &self.notarize_ns, notarized.clone());
        match result {
            Ok(()) => {
                self.schedule_finalize(notarized);
                true
            }
            Err(err) => {
                warn!(?err, round, "dropping invalid notarized block");
                false
            }
        }
    }

    /// Broadcast the round's highest-weighted notarized block to all peers
    /// (the beacon uses it to advance, block makers to extend).
    async fn broadcast_notarized<S: Sender<PublicKey = PublicKey>>(
        &mut self,
        round: Round,
        sender: &mut WrappedSender<S, Message<V>>,
    ) {
        let Some(storage) = self.rounds.get_mut(&round) else {
            return;
        };
        let Some(notarized) = storage.highest_notarized() else {
            return;
        };
        info!(
            round,
            hash = hex(notarized.block.hash().as_ref()),
            "broadcasting notarized block"
        );
        self.cfg
            .reporter
            .report(Activity::Notarized(notarized.clone()))
            .await;
        if let Err(err) = sender
            .send(Recipients::All, Message::Notarized(notarized), true)
            .await
        {
            warn!(?err, round, "failed to broadcast notarized block");
        }
    }

    /// Hand a notarized block to the finalizer, scheduling the round's
    /// finalization when it is the first for the cursor round.
    fn schedule_finalize(&mut self, notarized: NotarizedBlock<V>) {
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

    /// Finalization for `round` ran: append to the chain, discard the
    /// round's storage, and re-arm if the next round is already waiting.
    async fn finalized(&mut self, round: Round) {
        let (appended, more) = self.finalizer.finalize(round);
        if let Some(block) = appended {
            self.cfg.reporter.report(Activity::Finalized(block)).await;
        }
        if more {
            self.pending_finalize =
                Some((round + 1, self.context.current() + self.cfg.finalize_time));
        }
        self.delete_round(round);
        self.conclude(round);
    }

    /// The round's loop is over: stop tracking it and open the next round if
    /// its beacon already arrived.
    fn conclude(&mut self, round: Round) {
        self.soaking.remove(&round);
        self.active.remove(&round);
        if let Some(packet) = self.tmp_beacon.remove(&(self.current + 1)) {
            self.admit(packet);
        }
    }

    fn delete_round(&mut self, round: Round) {
        self.rounds.remove(&round);
        self.tmp_beacon.remove(&round);
        self.tmp_blocks.remove(&round);
        self.tmp_sigs.remove(&round);
        self.tmp_not.remove(&round);
    }
}
