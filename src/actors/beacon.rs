//! The randomness beacon paces the protocol: one packet per round, advanced
//! only when the network reports a notarized block for the current round.

use crate::{
    config::Config,
    types::{BeaconPacket, Message, Round},
};
use commonware_cryptography::{bls12381::primitives::variant::Variant, ed25519::PublicKey};
use commonware_p2p::{
    utils::codec::{wrap, WrappedSender},
    Receiver, Recipients, Sender,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

pub struct Actor<V: Variant, F> {
    cfg: Config<V, F>,
    rng: StdRng,
    round: Round,
}

impl<V: Variant, F> Actor<V, F> {
    pub fn new(cfg: Config<V, F>) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self {
            cfg,
            rng,
            round: 0,
        }
    }

    pub async fn run(
        mut self,
        sender: impl Sender<PublicKey = PublicKey>,
        receiver: impl Receiver<PublicKey = PublicKey>,
    ) {
        let (mut sender, mut receiver) = wrap((), sender, receiver);
        let peers = self.cfg.round_peers();

        // Initiate round 1 immediately.
        self.new_round(0, &peers, &mut sender).await;

        loop {
            let (peer, msg) = match receiver.recv().await {
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
                Message::Notarized(notarized) => {
                    // The network concluded a round: move on to the next one.
                    self.new_round(notarized.round(), &peers, &mut sender).await;
                }
                Message::Beacon(_) => {
                    // Another beacon is pacing too; stay in sync with it.
                    self.round += 1;
                }
                _ => {}
            }
        }
    }

    async fn new_round<S: Sender<PublicKey = PublicKey>>(
        &mut self,
        trigger: Round,
        peers: &[PublicKey],
        sender: &mut WrappedSender<S, Message<V>>,
    ) {
        if trigger != self.round {
            debug!(trigger, round = self.round, "beacon ignoring round trigger");
            return;
        }
        self.round += 1;
        let packet = BeaconPacket {
            round: self.round,
            randomness: self.rng.gen(),
        };
        info!(round = self.round, "beacon starting round");
        if let Err(err) = sender
            .send(
                Recipients::Some(peers.to_vec()),
                Message::Beacon(packet),
                true,
            )
            .await
        {
            warn!(?err, "failed to send beacon packet");
        }
    }
}
