//! Role dispatch: each node runs exactly one actor, chosen by its roster
//! position.

use crate::{
    actors::{beacon, block_maker, notarizer},
    config::{Config, Role},
    Activity, Reporter,
};
use commonware_cryptography::{bls12381::primitives::variant::Variant, ed25519::PublicKey};
use commonware_p2p::{Receiver, Sender};
use commonware_runtime::{Clock, Handle, Spawner};
use rand::Rng;
use tracing::info;

/// A single node of the simulation.
pub struct Engine<E: Clock + Rng + Spawner, V: Variant, F: Reporter<Activity = Activity<V>>> {
    context: E,
    cfg: Config<V, F>,
}

impl<E: Clock + Rng + Spawner, V: Variant, F: Reporter<Activity = Activity<V>>> Engine<E, V, F> {
    pub fn new(context: E, cfg: Config<V, F>) -> Self {
        cfg.assert_valid();
        Self { context, cfg }
    }

    /// Run this node's role actor over the provided network channels.
    pub fn start(
        mut self,
        sender: impl Sender<PublicKey = PublicKey>,
        receiver: impl Receiver<PublicKey = PublicKey>,
    ) -> Handle<()> {
        self.context.spawn_ref()(self.run(sender, receiver))
    }

    async fn run(
        self,
        sender: impl Sender<PublicKey = PublicKey>,
        receiver: impl Receiver<PublicKey = PublicKey>,
    ) {
        let Self { context, cfg } = self;
        let role = cfg.role();
        info!(index = cfg.index, ?role, "starting node");
        match role {
            Role::Beacon => beacon::Actor::new(cfg).run(sender, receiver).await,
            Role::BlockMaker => {
                block_maker::Actor::new(context, cfg)
                    .run(sender, receiver)
                    .await
            }
            Role::Notarizer => {
                notarizer::Actor::new(context, cfg)
                    .run(sender, receiver)
                    .await
            }
        }
    }
}
