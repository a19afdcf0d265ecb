/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a miner.
//!
//! A miner is one participant of the round protocol, identified by its
//! [Ed25519 public key](ed25519_dalek::VerifyingKey). The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the miner](MinerSpec) with:
//!   1. `MinerSpec::builder` to construct a `MinerSpecBuilder`,
//!   2. The setters of the `MinerSpecBuilder`, and
//!   3. The `MinerSpecBuilder::build` method to construct a [MinerSpec],
//! - The function to [start](MinerSpec::start) a [Miner] given its specification,
//! - [The type](Miner) which keeps the miner alive.
//!
//! ## Starting a miner
//!
//! ```ignore
//! let miner =
//!     MinerSpec::builder()
//!     .app(app)
//!     .epochs(epochs)
//!     .network(network)
//!     .configuration(configuration)
//!     .key_material(Some(key_material))
//!     .on_finalize_round(finalize_round_handler)
//!     .build()
//!     .start()
//! ```
//!
//! ### Required setters
//!
//! - `.app(...)`
//! - `.epochs(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.key_material(...)`: the beacon's key material for the first epoch. Required unless the beacon
//!   runs in [insecure count-only mode](crate::beacon::BeaconMode::InsecureCountOnly). Later epochs get
//!   theirs through the [view change](Miner::view_change).
//! - One `.on_*(...)` setter per [event](crate::events), for registering user-defined event handlers:
//!   `.on_start_round`, `.on_round_timeout`, `.on_restart_round`, `.on_finalize_round`,
//!   `.on_add_vrf_share`, `.on_compute_random_seed`, `.on_install_dkg`, `.on_propose_block`,
//!   `.on_verify_block`, `.on_reject_block`, `.on_send_ticket`, `.on_notarize_block`,
//!   `.on_retry_message`.
//!
//! The miner's [configuration](Configuration) is also defined using the builder pattern:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(signing_key)
//!     .chain_id(ChainID::new(0))
//!     .genesis_random_seed(RandomSeed::new(839))
//!     .threshold_by_count(66)
//!     .generation_timeout(Duration::from_millis(500))
//!     .retry_wait_time(Duration::from_millis(20))
//!     .block_proposal_wait_time(Duration::from_millis(50))
//!     .network_delta(Duration::from_millis(20))
//!     .round_restart_mult(3)
//!     .softto_min(Duration::from_secs(1))
//!     .softto_mult(3)
//!     .timeout_cap(0)
//!     .round_retention(10)
//!     .dispatcher_capacity(1024)
//!     .log_events(true)
//!     .build()
//! ```

use std::{
    sync::{
        mpsc::{self, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    beacon::{dkg::DkgKeyMaterial, BeaconMode, ThresholdBeacon},
    dispatcher::{start_dispatcher, DispatcherConfiguration, RetryTokens},
    event_bus::*,
    events::*,
    networking::{network::Network, receiving::start_polling},
    pluggables::{App, Epochs},
    protocol::{timeout::start_round_timeout_worker, RoundProtocol, RoundProtocolConfiguration},
    round::Round,
    types::{
        block::Block,
        crypto_primitives::Keypair,
        data_types::{ChainID, RandomSeed, RoundNumber},
    },
    view_change::ViewChangeCoordinator,
};

/// Stores the user-defined parameters required to start the miner.
///
/// ## Genesis random seed
///
/// Every miner of the chain must be configured with the same non-zero genesis seed. It is the seed of
/// the genesis round, so it seeds the beacon messages of round 1.
///
/// ## Round timeout
///
/// The round timeout is `softto_mult` times the moving average of the time between finalized rounds,
/// but never less than `softto_min`. After `round_restart_mult` timeouts without progress, the round is
/// restarted at a higher timeout count.
///
/// ## Log Events
///
/// The miner logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.chain_id(...)`
    - `.genesis_random_seed(...)`
    - `.threshold_by_count(...)`
    - `.generation_timeout(...)`
    - `.retry_wait_time(...)`
    - `.block_proposal_wait_time(...)`
    - `.network_delta(...)`
    - `.round_restart_mult(...)`
    - `.softto_min(...)`
    - `.softto_mult(...)`
    - `.timeout_cap(...)`
    - `.round_retention(...)`
    - `.dispatcher_capacity(...)`
    - `.log_events(...)`

    Optional:
    - `.beacon_mode(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the miner's keypair, used to sign blocks and verification tickets. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the chain ID of the blockchain. Required."))]
    pub chain_id: ChainID,
    #[builder(setter(doc = "Set the random seed of the genesis round. Must be non-zero and the same on every miner. Required."))]
    pub genesis_random_seed: RandomSeed,
    #[builder(default = BeaconMode::Threshold, setter(doc = "Set how round seeds are computed. Optional, defaults to the threshold beacon."))]
    pub beacon_mode: BeaconMode,
    #[builder(setter(doc = "Set the percentage of a round's miners whose tickets notarize a block. Required."))]
    pub threshold_by_count: u32,
    #[builder(setter(doc = "Set how long a generator waits for enough transactions before producing a block anyway. Required."))]
    pub generation_timeout: Duration,
    #[builder(setter(doc = "Set the initial back off between attempts at producing a block. Required."))]
    pub retry_wait_time: Duration,
    #[builder(setter(doc = "Set how long proposals are collected before verification begins. Required."))]
    pub block_proposal_wait_time: Duration,
    #[builder(setter(doc = "Set the expected one way latency between miners. Required."))]
    pub network_delta: Duration,
    #[builder(setter(doc = "Set the number of round timeouts after which a round is restarted. Required."))]
    pub round_restart_mult: u32,
    #[builder(setter(doc = "Set the minimum round timeout. Required."))]
    pub softto_min: Duration,
    #[builder(setter(doc = "Set the round timeout as a multiple of the mean time between finalized rounds. Required."))]
    pub softto_mult: u32,
    #[builder(setter(doc = "Set the maximum timeout count of a round, or 0 for no maximum. Required."))]
    pub timeout_cap: u32,
    #[builder(setter(doc = "Set the number of rounds behind the latest finalized round that are kept in memory. Required."))]
    pub round_retention: i64,
    #[builder(setter(doc = "Set the maximum number of received messages waiting to be processed. Required."))]
    pub dispatcher_capacity: usize,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Into<(RoundProtocolConfiguration, DispatcherConfiguration)> for Configuration {
    fn into(self) -> (RoundProtocolConfiguration, DispatcherConfiguration) {
        let protocol_config = RoundProtocolConfiguration {
            chain_id: self.chain_id,
            keypair: Keypair::new(self.me),
            threshold_by_count: self.threshold_by_count,
            generation_timeout: self.generation_timeout,
            retry_wait_time: self.retry_wait_time,
            block_proposal_wait_time: self.block_proposal_wait_time,
            network_delta: self.network_delta,
            round_restart_mult: self.round_restart_mult,
            softto_min: self.softto_min,
            softto_mult: self.softto_mult,
            timeout_cap: self.timeout_cap,
            round_retention: self.round_retention,
        };
        let dispatcher_config = DispatcherConfiguration {
            capacity: self.dispatcher_capacity,
            network_delta: self.network_delta,
        };
        (protocol_config, dispatcher_config)
    }
}

/// Stores all necessary parameters and trait implementations required to run the [Miner].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [MinerSpec]. On the builder call the following methods to construct a valid [MinerSpec].

    Required:
    - `.app(...)`
    - `.epochs(...)`
    - `.network(...)`
    - `.configuration(...)`

    Optional:
    - `.key_material(...)`
    - `.on_start_round(...)`
    - `.on_round_timeout(...)`
    - `.on_restart_round(...)`
    - `.on_finalize_round(...)`
    - `.on_add_vrf_share(...)`
    - `.on_compute_random_seed(...)`
    - `.on_install_dkg(...)`
    - `.on_propose_block(...)`
    - `.on_verify_block(...)`
    - `.on_reject_block(...)`
    - `.on_send_ticket(...)`
    - `.on_notarize_block(...)`
    - `.on_retry_message(...)`
"))]
pub struct MinerSpec<A: App, E: Epochs, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the application that produces, validates and finalizes blocks. The argument must implement the [App](crate::pluggables::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the source of epoch facts. The argument must implement the [Epochs](crate::pluggables::Epochs) trait. Required."))]
    epochs: E,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a miner. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(doc = "Set the beacon's key material for the first epoch. Optional."))]
    key_material: Option<DkgKeyMaterial>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartRoundEvent>),
    doc = "Register a handler closure to be invoked after a round gets its random seed. Optional."))]
    on_start_round: Option<HandlerPtr<StartRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RoundTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RoundTimeoutEvent>),
    doc = "Register a handler closure to be invoked after a round times out. Optional."))]
    on_round_timeout: Option<HandlerPtr<RoundTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RestartRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RestartRoundEvent>),
    doc = "Register a handler closure to be invoked after a round is restarted at a new timeout count. Optional."))]
    on_restart_round: Option<HandlerPtr<RestartRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalizeRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalizeRoundEvent>),
    doc = "Register a handler closure to be invoked after a round is finalized. Optional."))]
    on_finalize_round: Option<HandlerPtr<FinalizeRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AddVRFShareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AddVRFShareEvent>),
    doc = "Register a handler closure to be invoked after a VRF share is merged into a round. Optional."))]
    on_add_vrf_share: Option<HandlerPtr<AddVRFShareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ComputeRandomSeedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ComputeRandomSeedEvent>),
    doc = "Register a handler closure to be invoked after a round's seed is computed from its VRF shares. Optional."))]
    on_compute_random_seed: Option<HandlerPtr<ComputeRandomSeedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&InstallDKGEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InstallDKGEvent>),
    doc = "Register a handler closure to be invoked after key material for a new epoch is installed. Optional."))]
    on_install_dkg: Option<HandlerPtr<InstallDKGEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeBlockEvent>),
    doc = "Register a handler closure to be invoked after the miner proposes a block. Optional."))]
    on_propose_block: Option<HandlerPtr<ProposeBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VerifyBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VerifyBlockEvent>),
    doc = "Register a handler closure to be invoked after a proposed block passes verification. Optional."))]
    on_verify_block: Option<HandlerPtr<VerifyBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectBlockEvent>),
    doc = "Register a handler closure to be invoked after a proposed block is rejected. Optional."))]
    on_reject_block: Option<HandlerPtr<RejectBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendTicketEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendTicketEvent>),
    doc = "Register a handler closure to be invoked after the miner broadcasts a verification ticket. Optional."))]
    on_send_ticket: Option<HandlerPtr<SendTicketEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NotarizeBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NotarizeBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is notarized. Optional."))]
    on_notarize_block: Option<HandlerPtr<NotarizeBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RetryMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RetryMessageEvent>),
    doc = "Register a handler closure to be invoked after a message is scheduled for another attempt. Optional."))]
    on_retry_message: Option<HandlerPtr<RetryMessageEvent>>,
}

impl<A: App, E: Epochs, N: Network + 'static> MinerSpec<A, E, N> {
    /// Starts all threads and channels associated with running a miner, initializes the round protocol
    /// from the genesis block, and returns the handles to them in a [Miner] struct.
    pub fn start(mut self) -> Miner<A, E, N> {
        self.network.init_miner_set(self.epochs.miners(RoundNumber::init()));

        let chain_id = self.configuration.chain_id;
        let genesis_random_seed = self.configuration.genesis_random_seed;
        let beacon_mode = self.configuration.beacon_mode;
        let log_events = self.configuration.log_events;
        let (protocol_config, dispatcher_config) = self.configuration.into();

        let event_handlers = EventHandlers::new(
            log_events,
            self.on_start_round,
            self.on_round_timeout,
            self.on_restart_round,
            self.on_finalize_round,
            self.on_add_vrf_share,
            self.on_compute_random_seed,
            self.on_install_dkg,
            self.on_propose_block,
            self.on_verify_block,
            self.on_reject_block,
            self.on_send_ticket,
            self.on_notarize_block,
            self.on_retry_message,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let beacon = Arc::new(ThresholdBeacon::new(beacon_mode));
        if let Some(key_material) = self.key_material {
            beacon.install(key_material);
        }
        let view_change = ViewChangeCoordinator::new(
            protocol_config.keypair.public(),
            beacon.clone(),
            event_publisher.clone(),
        );

        let retry_tokens = RetryTokens::new();
        let protocol = RoundProtocol::new(
            protocol_config,
            beacon,
            self.app,
            self.epochs,
            self.network.clone(),
            retry_tokens.clone(),
            event_publisher.clone(),
        );
        protocol.initialize(Block::genesis(chain_id, genesis_random_seed));

        let (dispatcher_shutdown, dispatcher_shutdown_receiver) = mpsc::channel();
        let (dispatcher, dispatcher_handle) = start_dispatcher(
            dispatcher_config,
            protocol.clone(),
            retry_tokens,
            event_publisher,
            dispatcher_shutdown_receiver,
        );

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network, dispatcher_handle, poller_shutdown_receiver);

        let (round_timeout_shutdown, round_timeout_shutdown_receiver) = mpsc::channel();
        let round_timeout_worker = start_round_timeout_worker(protocol.clone(), round_timeout_shutdown_receiver);

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(event_bus_shutdown_receiver)) => Some(start_event_bus(
                event_handlers,
                event_subscriber,
                event_bus_shutdown_receiver,
            )),
            _ => None,
        };

        Miner {
            protocol,
            view_change,
            poller: Some(poller),
            poller_shutdown,
            dispatcher: Some(dispatcher),
            dispatcher_shutdown,
            round_timeout_worker: Some(round_timeout_worker),
            round_timeout_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// A handle to the background threads of a miner. When this value is dropped, all background threads are
/// gracefully shut down.
pub struct Miner<A: App, E: Epochs, N: Network + 'static> {
    protocol: Arc<RoundProtocol<A, E, N>>,
    view_change: ViewChangeCoordinator,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_shutdown: Sender<()>,
    round_timeout_worker: Option<JoinHandle<()>>,
    round_timeout_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<A: App, E: Epochs, N: Network + 'static> Miner<A, E, N> {
    /// The highest round this miner has started.
    pub fn current_round(&self) -> RoundNumber {
        self.protocol.current_round()
    }

    /// The highest round this miner has finalized.
    pub fn finalized_round(&self) -> RoundNumber {
        self.protocol.finalized_round()
    }

    /// The state of round `number`, if this miner still keeps it.
    pub fn round(&self, number: RoundNumber) -> Option<Arc<Round>> {
        self.protocol.round(number)
    }

    /// The key generation of the next epoch.
    pub fn view_change(&self) -> &ViewChangeCoordinator {
        &self.view_change
    }

    pub fn beacon(&self) -> &Arc<ThresholdBeacon> {
        self.protocol.beacon()
    }
}

impl<A: App, E: Epochs, N: Network + 'static> Drop for Miner<A, E, N> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important. The dispatcher drives the
        // protocol with the messages the poller hands it, so the poller goes last.

        self.event_bus_shutdown
            .iter()
            .for_each(|shutdown| shutdown.send(()).unwrap());
        if let Some(event_bus) = self.event_bus.take() {
            event_bus.join().unwrap();
        }

        self.round_timeout_shutdown.send(()).unwrap();
        if let Some(round_timeout_worker) = self.round_timeout_worker.take() {
            round_timeout_worker.join().unwrap();
        }

        self.dispatcher_shutdown.send(()).unwrap();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.join().unwrap();
        }

        self.protocol.stop();

        self.poller_shutdown.send(()).unwrap();
        if let Some(poller) = self.poller.take() {
            poller.join().unwrap();
        }
    }
}
