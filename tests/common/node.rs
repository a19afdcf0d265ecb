use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use miner_rounds::{
    beacon::{
        dkg::{DkgKeyMaterial, Polynomial},
        BeaconMode,
    },
    events::{FinalizeRoundEvent, RestartRoundEvent},
    miner::{Configuration, Miner, MinerSpec},
    pluggables::FixedEpoch,
    types::{
        data_types::{ChainID, MagicBlockNumber, RandomSeed, RoundNumber},
        miner_set::MinerSet,
    },
};
use rand_core::OsRng;

use crate::common::{
    app::{CountingApp, FinalizedBlock},
    logging::first_seven_base64_chars,
    network::{mock_network, NetworkStub},
};

pub(crate) const GENESIS_RANDOM_SEED: RandomSeed = RandomSeed::new(839);

/// Things the Nodes will have in common:
/// - Epoch.
/// - Configuration.
///
/// Things that they will differ in:
/// - App instance.
/// - Network instance.
/// - Keypair and key share.
pub(crate) struct Node {
    finalized: Arc<Mutex<Vec<FinalizedBlock>>>,
    restarts: Arc<Mutex<u32>>,
    network: NetworkStub,
    miner: Miner<CountingApp, FixedEpoch, NetworkStub>,
}

impl Node {
    pub(crate) fn new(
        keypair: SigningKey,
        network: NetworkStub,
        epoch: FixedEpoch,
        beacon_mode: BeaconMode,
        key_material: Option<DkgKeyMaterial>,
    ) -> Node {
        let node_id = first_seven_base64_chars(&keypair.verifying_key().to_bytes());
        let finalized = Arc::new(Mutex::new(Vec::new()));
        let restarts = Arc::new(Mutex::new(0));

        let configuration = Configuration::builder()
            .me(keypair)
            .chain_id(ChainID::new(0))
            .genesis_random_seed(GENESIS_RANDOM_SEED)
            .beacon_mode(beacon_mode)
            .threshold_by_count(66)
            .generation_timeout(Duration::from_millis(200))
            .retry_wait_time(Duration::from_millis(10))
            .block_proposal_wait_time(Duration::from_millis(30))
            .network_delta(Duration::from_millis(20))
            .round_restart_mult(2)
            .softto_min(Duration::from_millis(1500))
            .softto_mult(3)
            .timeout_cap(0)
            .round_retention(50)
            .dispatcher_capacity(1024)
            .log_events(true)
            .build();

        let restart_counter = restarts.clone();
        let miner = MinerSpec::builder()
            .app(CountingApp::new(finalized.clone()))
            .epochs(epoch)
            .network(network.clone())
            .configuration(configuration)
            .key_material(key_material)
            .on_finalize_round(move |event: &FinalizeRoundEvent| {
                log::debug!("{}: finalized round {}", node_id, event.round)
            })
            .on_restart_round(move |_: &RestartRoundEvent| *restart_counter.lock().unwrap() += 1)
            .build()
            .start();

        Node {
            finalized,
            restarts,
            network,
            miner,
        }
    }

    pub(crate) fn finalized_round(&self) -> RoundNumber {
        self.miner.finalized_round()
    }

    pub(crate) fn current_round(&self) -> RoundNumber {
        self.miner.current_round()
    }

    /// The block this node finalized for `round`, if any.
    pub(crate) fn finalized_block(&self, round: RoundNumber) -> Option<FinalizedBlock> {
        self.finalized
            .lock()
            .unwrap()
            .iter()
            .find(|block| block.round == round)
            .cloned()
    }

    pub(crate) fn restarts(&self) -> u32 {
        *self.restarts.lock().unwrap()
    }

    /// Drop every message to and from this node until called again with `false`.
    pub(crate) fn set_partitioned(&self, partitioned: bool) {
        self.network.set_partitioned(partitioned)
    }

    pub(crate) fn miner(&self) -> &Miner<CountingApp, FixedEpoch, NetworkStub> {
        &self.miner
    }
}

/// Poll `condition` every 100 milliseconds until it holds, panicking if it does not hold within `limit`.
pub(crate) fn wait_until(limit: Duration, description: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        if Instant::now() > deadline {
            panic!("Timed out waiting until {}", description);
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Simultaneously start `n` miners of a single epoch in which `generators_num` miners generate blocks.
///
/// With `BeaconMode::Threshold`, the key shares of a `threshold`-of-`n` beacon are dealt to the miners.
/// Otherwise no key material is handed out.
pub(crate) fn start_nodes(n: usize, generators_num: usize, beacon_mode: BeaconMode, threshold: usize) -> Vec<Node> {
    let mut csprg = OsRng {};
    let keypairs: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut csprg)).collect();
    let network_stubs = mock_network(keypairs.iter().map(|kp| kp.verifying_key()));

    let miners: MinerSet = keypairs.iter().map(|kp| kp.verifying_key()).collect();
    let epoch = FixedEpoch {
        miners: miners.clone(),
        generators_num,
        magic_block_number: MagicBlockNumber::new(0),
    };
    let polynomial = Polynomial::random(threshold);

    keypairs
        .into_iter()
        .zip(network_stubs)
        .map(|(keypair, network)| {
            let key_material = match beacon_mode {
                BeaconMode::Threshold => Some(DkgKeyMaterial::dealt(
                    &polynomial,
                    n,
                    miners.party_id(&keypair.verifying_key()),
                    MagicBlockNumber::new(0),
                    RoundNumber::init(),
                )),
                BeaconMode::InsecureCountOnly { .. } => None,
            };
            Node::new(keypair, network, epoch.clone(), beacon_mode, key_material)
        })
        .collect()
}
