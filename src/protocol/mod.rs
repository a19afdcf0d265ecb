/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round protocol: how a miner moves from one round to the next.
//!
//! Main type: [`RoundProtocol`].
//!
//! ## Round lifecycle
//!
//! Each round `r` goes through the following steps on every miner:
//! 1. Once round `r - 1` has a notarized block, the miner [starts](RoundProtocol::start_next_round) round
//!    `r`: it finalizes round `r - 2`, signs its share of the random beacon for `r` and broadcasts it.
//! 2. When threshold-many valid shares have been [collected](RoundProtocol::add_vrf_share), the round's
//!    random seed is computed from them. The seed decides the rank of every miner in the round.
//! 3. Miners whose rank is below the number of generators [generate](RoundProtocol::generate_round_block)
//!    a block and broadcast it for verification.
//! 4. Every miner [collects](RoundProtocol::add_to_round_verification) the proposed blocks for a short
//!    while, then [verifies](RoundProtocol::verify_round_block) them in rank order and broadcasts a
//!    verification ticket for the best valid one.
//! 5. A block that gathers tickets from at least the notarization threshold of miners is notarized, and
//!    the miner moves on to round `r + 1`.
//!
//! If a round makes no progress, its [timeout](RoundProtocol::handle_round_timeout) first rebroadcasts
//! this miner's latest messages, then restarts the round at a higher timeout count, which gives the round
//! a fresh seed and with it a fresh set of generators.
//!
//! ## Threads
//!
//! Messages from the network are handed to the protocol by the [dispatcher](crate::dispatcher) thread.
//! Block generation and per-round verification run on short-lived threads of their own, and round
//! timeouts are driven by the timeout thread. Each subsystem guards its own state: the
//! [beacon](crate::beacon::ThresholdBeacon), the [rounds](crate::round::RoundRegistry) (and each round),
//! the app, and the network sender are locked separately.

mod generation;
mod handlers;
mod rounds;
mod tickets;
pub(crate) mod timeout;
mod verification;

pub use generation::GenerateBlockError;
pub use verification::{AddToVerificationError, VerifyBlockError};

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        mpsc::Sender,
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use ed25519_dalek::VerifyingKey;

use crate::{
    beacon::{share_cache::VRFShareCache, ThresholdBeacon},
    dispatcher::RetryTokens,
    events::Event,
    networking::{messages::Message, network::Network, sending::SenderHandle},
    notarization::{NotarizationError, NotarizationTracker},
    pluggables::{App, Epochs},
    round::{Round, RoundRegistry},
    types::{
        block::Block,
        crypto_primitives::Keypair,
        data_types::{ChainID, CryptoHash, RoundNumber, VerifyingKeyBytes},
    },
};

use self::timeout::FinalizationTimer;

/// Parameters of the round protocol. Built from the miner's [`Configuration`](crate::miner::Configuration).
pub struct RoundProtocolConfiguration {
    pub chain_id: ChainID,
    pub keypair: Keypair,
    /// Percentage of the round's miners whose tickets notarize a block.
    pub threshold_by_count: u32,
    /// How long a generator waits for enough transactions before producing a block with what it has.
    pub generation_timeout: Duration,
    /// Initial back off between attempts at producing a block while transactions are insufficient.
    pub retry_wait_time: Duration,
    /// How long proposals are collected before the first of them is verified.
    pub block_proposal_wait_time: Duration,
    /// Expected one way latency between miners.
    pub network_delta: Duration,
    /// Number of soft timeouts after which a round is restarted.
    pub round_restart_mult: u32,
    /// Lower bound on the round timeout.
    pub softto_min: Duration,
    /// The round timeout is this multiple of the mean time between finalized rounds.
    pub softto_mult: u32,
    /// Upper bound on a round's timeout count. Zero means unbounded.
    pub timeout_cap: u32,
    /// Number of rounds behind the latest finalized round that are kept. Also bounds how far ahead of
    /// the current round early beacon shares are kept.
    pub round_retention: i64,
}

/// One miner's instance of the round protocol.
///
/// Constructed with [`new`](Self::new) and kicked off with [`initialize`](Self::initialize). There is
/// exactly one instance per running miner, shared through an [`Arc`] between the dispatcher, the timeout
/// thread, and the generation and verification threads the instance spawns itself.
pub struct RoundProtocol<A: App, E: Epochs, N: Network + 'static> {
    config: RoundProtocolConfiguration,
    this: Weak<Self>,
    beacon: Arc<ThresholdBeacon>,
    share_cache: VRFShareCache,
    rounds: RoundRegistry,
    notarization: NotarizationTracker,
    current_round: AtomicI64,
    // Held while finalizing, which keeps finalization monotonic.
    finalized_round: Mutex<RoundNumber>,
    finalization_timer: Mutex<FinalizationTimer>,
    app: Mutex<A>,
    epochs: E,
    sender: Mutex<SenderHandle<N>>,
    retry_tokens: RetryTokens,
    stopped: AtomicBool,
    event_publisher: Option<Sender<Event>>,
}

impl<A: App, E: Epochs, N: Network + 'static> RoundProtocol<A, E, N> {
    pub fn new(
        config: RoundProtocolConfiguration,
        beacon: Arc<ThresholdBeacon>,
        app: A,
        epochs: E,
        network: N,
        retry_tokens: RetryTokens,
        event_publisher: Option<Sender<Event>>,
    ) -> Arc<Self> {
        let notarization = NotarizationTracker::new(config.threshold_by_count);
        let me = config.keypair.public();
        Arc::new_cyclic(|this| Self {
            config,
            this: this.clone(),
            beacon,
            share_cache: VRFShareCache::new(),
            rounds: RoundRegistry::new(),
            notarization,
            current_round: AtomicI64::new(RoundNumber::init().int()),
            finalized_round: Mutex::new(RoundNumber::init()),
            finalization_timer: Mutex::new(FinalizationTimer::new()),
            app: Mutex::new(app),
            epochs,
            sender: Mutex::new(SenderHandle::new(network, me)),
            retry_tokens,
            stopped: AtomicBool::new(false),
            event_publisher,
        })
    }

    /// Install `genesis` as the notarized and finalized block of its round, then start the round after
    /// it.
    ///
    /// The genesis block's random seed must not be zero: it seeds the beacon messages of the next round.
    pub fn initialize(&self, genesis: Block) {
        let (round, _) = self.rounds.get_or_create(genesis.round());
        let miners = self.epochs.miners(genesis.round());
        round.start(genesis.header.round_random_seed, miners.len());

        let hash = genesis.hash;
        round.add_proposed_block(genesis);
        round.add_notarized_block(&hash);
        round.try_start_finalizing();
        round.set_finalized();

        *self.finalized_round.lock().unwrap() = round.number();
        self.finalization_timer.lock().unwrap().start();
        self.set_current_round(round.number());
        self.start_next_round(&round);
    }

    /// Stop every verification collector and keep new generation work from starting. Called when the
    /// miner shuts down.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for round in self.rounds.all() {
            round.cancel_verification();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The highest round this miner has started.
    pub fn current_round(&self) -> RoundNumber {
        RoundNumber::new(self.current_round.load(Ordering::SeqCst))
    }

    /// The highest round this miner has finalized.
    pub fn finalized_round(&self) -> RoundNumber {
        *self.finalized_round.lock().unwrap()
    }

    pub fn round(&self, number: RoundNumber) -> Option<Arc<Round>> {
        self.rounds.get(number)
    }

    pub fn beacon(&self) -> &Arc<ThresholdBeacon> {
        &self.beacon
    }

    pub fn config(&self) -> &RoundProtocolConfiguration {
        &self.config
    }

    fn set_current_round(&self, round: RoundNumber) {
        self.current_round.fetch_max(round.int(), Ordering::SeqCst);
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    fn me(&self) -> VerifyingKey {
        self.config.keypair.public()
    }

    fn me_bytes(&self) -> VerifyingKeyBytes {
        self.config.keypair.public().to_bytes()
    }

    fn broadcast(&self, message: impl Into<Message>) {
        self.sender.lock().unwrap().broadcast(message)
    }

    fn send(&self, peer: VerifyingKey, message: impl Into<Message>) {
        self.sender.lock().unwrap().send(peer, message)
    }

    /// Whether `round` is older than every round this miner still keeps.
    fn is_stale(&self, round: RoundNumber) -> bool {
        round < self.finalized_round() - self.config.round_retention
    }

    /// Whether `round` is too far beyond the current round for its messages to be kept until then.
    fn is_too_far_ahead(&self, round: RoundNumber) -> bool {
        round > self.current_round() + self.config.round_retention
    }
}

/// Log an error that means this miner's own state is broken. Fails loudly in debug builds.
fn fatal(message: String) {
    log::error!("{}", message);
    if cfg!(debug_assertions) {
        panic!("{}", message)
    }
}

/// Enumerates the ways handling a message from a peer can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message belongs to a round this miner has not started yet.
    RoundNotStarted(RoundNumber),
    /// The message refers to a block this miner has not received yet.
    BlockNotFound { round: RoundNumber, block: CryptoHash },
    /// The message belongs to a round this miner no longer keeps.
    StaleRound(RoundNumber),
    /// The message belongs to a round further ahead than this miner keeps messages for.
    RoundTooFarAhead(RoundNumber),
    /// The message claims to come from someone other than its sender, or from a non-miner.
    InvalidSender,
    /// The block's hash or signature is wrong.
    InvalidBlock,
    /// The tickets of a notarization do not add up to the threshold.
    NotNotarized { round: RoundNumber, block: CryptoHash },
    Notarization(NotarizationError),
    AddToVerification(AddToVerificationError),
}

impl ProtocolError {
    /// Whether the message might succeed if handled again later, once this miner has caught up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::RoundNotStarted(_) | ProtocolError::BlockNotFound { .. }
        )
    }
}

impl From<NotarizationError> for ProtocolError {
    fn from(value: NotarizationError) -> Self {
        ProtocolError::Notarization(value)
    }
}

impl From<AddToVerificationError> for ProtocolError {
    fn from(value: AddToVerificationError) -> Self {
        ProtocolError::AddToVerification(value)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            mpsc::{self, Receiver},
            Barrier,
        },
        thread,
        time::Instant,
    };

    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::{
        beacon::{types::VRFShare, BeaconMode},
        dispatcher::{messages::BlockMessage, start_dispatcher, DispatcherConfiguration},
        pluggables::{
            FixedEpoch, ProduceBlockError, ProduceBlockRequest, ProduceBlockResponse, ValidateBlockRequest,
            ValidateBlockResponse,
        },
        types::{
            block::{BlockHeader, BlockState},
            data_types::{MagicBlockNumber, PartyID, RandomSeed, RoundRank, TimeoutCount, Transaction},
            miner_set::MinerSet,
            tickets::{BlockVerificationTicket, VerificationTicket},
        },
    };

    struct StubApp;

    impl App for StubApp {
        fn produce_block(&mut self, _: ProduceBlockRequest) -> Result<ProduceBlockResponse, ProduceBlockError> {
            Err(ProduceBlockError::InsufficientTxns)
        }

        fn validate_block(&mut self, request: ValidateBlockRequest) -> ValidateBlockResponse {
            ValidateBlockResponse::Valid {
                state_hash: request.block().header.state_hash,
            }
        }

        fn create_fee_txn(&mut self, _: RoundNumber, _: &VerifyingKeyBytes) -> Option<Transaction> {
            None
        }

        fn finalize_block(&mut self, _: &Block) {}

        fn txn_count(&self) -> usize {
            0
        }
    }

    /// Keeps every message the protocol sends.
    #[derive(Clone, Default)]
    struct CapturingNetwork {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Network for CapturingNetwork {
        fn init_miner_set(&mut self, _: MinerSet) {}

        fn broadcast(&mut self, message: Message) {
            self.sent.lock().unwrap().push(message)
        }

        fn send(&mut self, _: VerifyingKey, message: Message) {
            self.sent.lock().unwrap().push(message)
        }

        fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
            None
        }
    }

    struct Fixture {
        protocol: Arc<RoundProtocol<StubApp, FixedEpoch, CapturingNetwork>>,
        network: CapturingNetwork,
        // The 3 miners of the epoch, in miner set order. The protocol's own key is not one of them, so
        // it never generates and its tickets never count.
        miners: Vec<SigningKey>,
        genesis: Block,
        events: Receiver<Event>,
    }

    impl Fixture {
        /// A protocol in round 1, which needs 2 beacon shares to start.
        fn new() -> Fixture {
            let mut csprg = OsRng {};
            let mut miners: Vec<SigningKey> = (0..3).map(|_| SigningKey::generate(&mut csprg)).collect();
            miners.sort_by_key(|miner| miner.verifying_key().to_bytes());
            let epoch = FixedEpoch {
                miners: miners.iter().map(|miner| miner.verifying_key()).collect(),
                generators_num: 3,
                magic_block_number: MagicBlockNumber::new(0),
            };

            let config = RoundProtocolConfiguration {
                chain_id: ChainID::new(0),
                keypair: Keypair::new(SigningKey::generate(&mut csprg)),
                threshold_by_count: 66,
                generation_timeout: Duration::from_millis(100),
                retry_wait_time: Duration::from_millis(10),
                block_proposal_wait_time: Duration::from_millis(150),
                network_delta: Duration::from_millis(10),
                round_restart_mult: 2,
                softto_min: Duration::from_secs(1),
                softto_mult: 3,
                timeout_cap: 0,
                round_retention: 10,
            };
            let beacon = Arc::new(ThresholdBeacon::new(BeaconMode::InsecureCountOnly { quorum: 2 }));
            let network = CapturingNetwork::default();
            let (event_publisher, events) = mpsc::channel();
            let protocol = RoundProtocol::new(
                config,
                beacon,
                StubApp,
                epoch,
                network.clone(),
                RetryTokens::new(),
                Some(event_publisher),
            );

            let genesis = Block::genesis(ChainID::new(0), RandomSeed::new(839));
            protocol.initialize(genesis.clone());

            Fixture {
                protocol,
                network,
                miners,
                genesis,
                events,
            }
        }

        fn share(&self, miner: usize, round: RoundNumber) -> VRFShare {
            VRFShare::new(
                round,
                self.protocol
                    .round(round)
                    .map_or(TimeoutCount::init(), |round| round.timeout_count()),
                PartyID::new(miner as u32),
                self.miners[miner].verifying_key().to_bytes(),
                String::new(),
            )
        }

        /// Give round 1 its seed with the shares of miners 0 and 1.
        fn start_round_1(&self) -> Arc<Round> {
            let round = self.protocol.round(RoundNumber::new(1)).unwrap();
            self.protocol.add_vrf_share(&round, self.share(0, round.number()));
            self.protocol.add_vrf_share(&round, self.share(1, round.number()));
            assert!(round.has_random_seed());
            round
        }

        /// The index of the miner whose rank in `round` is `rank`.
        fn miner_with_rank(&self, round: &Round, rank: u32) -> usize {
            (0..self.miners.len())
                .find(|position| round.miner_rank(*position) == Some(RoundRank::new(rank)))
                .unwrap()
        }

        /// A valid round 1 block by `miner`, extending the genesis block.
        fn block(&self, round: &Round, miner: usize) -> Block {
            let header = BlockHeader {
                chain_id: ChainID::new(0),
                round: round.number(),
                prev_hash: self.genesis.hash,
                miner: self.miners[miner].verifying_key().to_bytes(),
                round_random_seed: round.random_seed(),
                round_rank: round.miner_rank(miner).unwrap(),
                round_timeout_count: round.timeout_count(),
                magic_block_number: MagicBlockNumber::new(0),
                creation_date: 0,
                state_hash: CryptoHash::default(),
            };
            Block::new(header, Vec::new(), Vec::new(), &Keypair::new(self.miners[miner].clone()))
        }

        fn ticket(&self, miner: usize, block: &Block) -> VerificationTicket {
            VerificationTicket::new(&Keypair::new(self.miners[miner].clone()), &block.hash)
        }

        /// A block of `round` by miner 0, carrying the tickets of miners 0 and 1.
        fn notarized_block(&self, round: RoundNumber) -> Block {
            let header = BlockHeader {
                chain_id: ChainID::new(0),
                round,
                prev_hash: self.genesis.hash,
                miner: self.miners[0].verifying_key().to_bytes(),
                round_random_seed: RandomSeed::new(77),
                round_rank: RoundRank::new(0),
                round_timeout_count: TimeoutCount::init(),
                magic_block_number: MagicBlockNumber::new(0),
                creation_date: 0,
                state_hash: CryptoHash::default(),
            };
            let mut block = Block::new(header, Vec::new(), Vec::new(), &Keypair::new(self.miners[0].clone()));
            block.verification_tickets = vec![self.ticket(0, &block), self.ticket(1, &block)];
            block
        }

        /// Number of rounds `round` was started since the last call.
        fn start_round_events(&self, round: RoundNumber) -> usize {
            self.events
                .try_iter()
                .filter(|event| matches!(event, Event::StartRound(start) if start.round == round))
                .count()
        }

        fn sent_tickets(&self) -> Vec<BlockVerificationTicket> {
            self.network
                .sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|message| match message {
                    Message::VerificationTicket(ticket) => Some(*ticket),
                    _ => None,
                })
                .collect()
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn best_ranked_block_is_verified_first() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();

        let second = fixture.block(&round, fixture.miner_with_rank(&round, 1));
        let first = fixture.block(&round, fixture.miner_with_rank(&round, 0));
        fixture.protocol.add_to_round_verification(&round, second.clone()).unwrap();
        fixture.protocol.add_to_round_verification(&round, first.clone()).unwrap();

        wait_for(|| round.block_state(&second.hash) == Some(BlockState::Rejected));
        assert_eq!(round.best_block().map(|block| block.hash), Some(first.hash));
        assert_eq!(round.block_state(&first.hash), Some(BlockState::Successful));
        assert_eq!(round.block_state(&second.hash), Some(BlockState::Rejected));

        let tickets = fixture.sent_tickets();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].block_hash, first.hash);
    }

    #[test]
    fn tickets_notarize_block_and_start_next_round() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();
        let block = fixture.block(&round, 0);
        fixture.protocol.add_to_round_verification(&round, block.clone()).unwrap();

        // The same ticket twice counts once.
        let ticket = fixture.ticket(0, &block);
        fixture.protocol.process_verified_ticket(&round, &block.hash, ticket).unwrap();
        fixture.protocol.process_verified_ticket(&round, &block.hash, ticket).unwrap();
        assert_eq!(
            round
                .block(&block.hash)
                .unwrap()
                .verification_tickets
                .iter()
                .filter(|t| t.verifier == ticket.verifier)
                .count(),
            1
        );
        assert_eq!(fixture.protocol.current_round(), RoundNumber::new(1));

        // 2 of 3 miners notarize.
        fixture
            .protocol
            .process_verified_ticket(&round, &block.hash, fixture.ticket(1, &block))
            .unwrap();
        assert_eq!(round.block_state(&block.hash), Some(BlockState::Notarized));
        assert_eq!(fixture.protocol.current_round(), RoundNumber::new(2));

        // Further tickets never revoke the notarization.
        fixture
            .protocol
            .process_verified_ticket(&round, &block.hash, fixture.ticket(2, &block))
            .unwrap();
        assert_eq!(round.block_state(&block.hash), Some(BlockState::Notarized));
        assert!(fixture
            .network
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|message| matches!(message, Message::Notarization(n) if n.block_hash == block.hash)));
    }

    #[test]
    fn early_ticket_is_kept_until_its_block_arrives() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();
        let block = fixture.block(&round, 0);

        let early = BlockVerificationTicket {
            block_hash: block.hash,
            round: round.number(),
            ticket: fixture.ticket(1, &block),
        };
        fixture
            .protocol
            .handle_verification_ticket_message(&fixture.miners[1].verifying_key(), &early)
            .unwrap();
        assert!(!round.has_block(&block.hash));

        fixture.protocol.add_to_round_verification(&round, block.clone()).unwrap();
        assert!(round
            .block(&block.hash)
            .unwrap()
            .verification_tickets
            .contains(&early.ticket));
    }

    #[test]
    fn ticket_for_a_round_not_yet_started_is_transient() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();
        let block = fixture.block(&round, 0);

        let ticket = BlockVerificationTicket {
            block_hash: block.hash,
            round: RoundNumber::new(10),
            ticket: fixture.ticket(1, &block),
        };
        let err = fixture
            .protocol
            .handle_verification_ticket_message(&fixture.miners[1].verifying_key(), &ticket)
            .unwrap_err();
        assert_eq!(err, ProtocolError::RoundNotStarted(RoundNumber::new(10)));
        assert!(err.is_transient());
    }

    #[test]
    fn ticket_signed_by_someone_else_is_rejected() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();
        let block = fixture.block(&round, 0);

        let ticket = BlockVerificationTicket {
            block_hash: block.hash,
            round: round.number(),
            ticket: fixture.ticket(1, &block),
        };
        assert_eq!(
            fixture
                .protocol
                .handle_verification_ticket_message(&fixture.miners[2].verifying_key(), &ticket),
            Err(ProtocolError::InvalidSender)
        );
    }

    #[test]
    fn shares_for_later_rounds_are_replayed_when_the_round_starts() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();

        // Round 2 shares arrive while this miner is still in round 1.
        for miner in 0..2 {
            let share = fixture.share(miner, RoundNumber::new(2));
            fixture
                .protocol
                .handle_vrf_share_message(&fixture.miners[miner].verifying_key(), share)
                .unwrap();
        }
        assert!(fixture.protocol.round(RoundNumber::new(2)).is_none());

        let block = fixture.block(&round, 0);
        fixture.protocol.add_to_round_verification(&round, block.clone()).unwrap();
        for miner in 0..2 {
            fixture
                .protocol
                .process_verified_ticket(&round, &block.hash, fixture.ticket(miner, &block))
                .unwrap();
        }

        let next = fixture.protocol.round(RoundNumber::new(2)).unwrap();
        assert!(next.has_random_seed());
    }

    #[test]
    fn tickets_carried_by_a_proposal_count_only_if_valid() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();
        let block = fixture.block(&round, fixture.miner_with_rank(&round, 0));

        // Miners 0 and 1 never signed this block, miner 2 did.
        let elsewhere = CryptoHash::new([0x55; 32]);
        let forged: Vec<VerificationTicket> = (0..2)
            .map(|miner| VerificationTicket::new(&Keypair::new(fixture.miners[miner].clone()), &elsewhere))
            .collect();
        let mut proposal = block.clone();
        proposal.verification_tickets = forged.clone();
        proposal.verification_tickets.push(fixture.ticket(2, &block));
        fixture.protocol.handle_verify_block_message(proposal).unwrap();

        assert_eq!(
            round.block(&block.hash).unwrap().verification_tickets,
            vec![fixture.ticket(2, &block)]
        );
        assert_ne!(round.block_state(&block.hash), Some(BlockState::Notarized));
        assert_eq!(fixture.protocol.current_round(), RoundNumber::new(1));

        // Nor are they merged from a second copy of the block.
        let mut copy = block.clone();
        copy.verification_tickets = forged.clone();
        fixture.protocol.add_to_round_verification(&round, copy).unwrap();
        let tickets = round.block(&block.hash).unwrap().verification_tickets;
        assert!(!tickets
            .iter()
            .any(|ticket| forged.iter().any(|forged| forged.verifier == ticket.verifier)));
        assert_eq!(fixture.protocol.current_round(), RoundNumber::new(1));
    }

    #[test]
    fn concurrent_starts_of_a_round_succeed_once() {
        let fixture = Fixture::new();
        let round = fixture.protocol.round(RoundNumber::new(1)).unwrap();
        let seed = RandomSeed::new(4242);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let protocol = fixture.protocol.clone();
                let round = round.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    protocol.start_round(&round, seed)
                })
            })
            .collect();
        let started: Vec<bool> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

        assert_eq!(started.iter().filter(|started| **started).count(), 1);
        assert_eq!(round.random_seed(), seed);
        assert_eq!(fixture.start_round_events(round.number()), 1);
    }

    #[test]
    fn concurrent_shares_crossing_the_threshold_start_the_round_once() {
        let fixture = Fixture::new();
        let round = fixture.protocol.round(RoundNumber::new(1)).unwrap();

        // The beacon needs 2 shares, and all 3 arrive at once.
        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|miner| {
                let protocol = fixture.protocol.clone();
                let round = round.clone();
                let share = fixture.share(miner, round.number());
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    protocol.add_vrf_share(&round, share)
                })
            })
            .collect();
        let merged = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|merged| *merged)
            .count();

        assert_eq!(merged, 2);
        assert_eq!(round.additional_share_count(), 1);
        assert!(round.has_random_seed());
        assert_eq!(fixture.start_round_events(round.number()), 1);
    }

    #[test]
    fn early_ticket_is_retried_until_a_notarized_block_creates_its_round() {
        let fixture = Fixture::new();
        let round_10 = RoundNumber::new(10);
        let block = fixture.notarized_block(round_10);

        let (shutdown, shutdown_receiver) = mpsc::channel();
        let config = DispatcherConfiguration {
            capacity: 16,
            network_delta: Duration::from_millis(50),
        };
        let (worker, dispatcher) = start_dispatcher(
            config,
            fixture.protocol.clone(),
            RetryTokens::new(),
            None,
            shutdown_receiver,
        );

        // Miner 2's ticket for round 10 arrives while this miner is in round 1.
        let early = BlockVerificationTicket {
            block_hash: block.hash,
            round: round_10,
            ticket: fixture.ticket(2, &block),
        };
        assert!(dispatcher.dispatch(BlockMessage::new(
            fixture.miners[2].verifying_key(),
            Message::VerificationTicket(early),
        )));
        thread::sleep(Duration::from_millis(40));
        assert!(fixture.protocol.round(round_10).is_none());

        // A peer sends the notarized block of round 10, which creates the round.
        assert!(dispatcher.dispatch(BlockMessage::new(
            fixture.miners[0].verifying_key(),
            Message::NotarizedBlock(block.clone()),
        )));
        let has_early_ticket = || {
            fixture
                .protocol
                .round(round_10)
                .and_then(|round| round.block(&block.hash))
                .is_some_and(|block| block.verification_tickets.contains(&early.ticket))
        };
        wait_for(&has_early_ticket);

        assert!(has_early_ticket());
        let round = fixture.protocol.round(round_10).unwrap();
        assert_eq!(round.block_state(&block.hash), Some(BlockState::Notarized));
        assert_eq!(round.random_seed(), RandomSeed::new(77));

        shutdown.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn shares_too_far_ahead_are_rejected() {
        let fixture = Fixture::new();
        // Round 1 plus a retention of 10 rounds.
        let kept = fixture.share(0, RoundNumber::new(11));
        let too_far = fixture.share(0, RoundNumber::new(12));
        let sender = fixture.miners[0].verifying_key();

        assert_eq!(fixture.protocol.handle_vrf_share_message(&sender, kept), Ok(()));
        let err = fixture
            .protocol
            .handle_vrf_share_message(&sender, too_far)
            .unwrap_err();
        assert_eq!(err, ProtocolError::RoundTooFarAhead(RoundNumber::new(12)));
        assert!(!err.is_transient());
    }

    #[test]
    fn notarization_of_an_unknown_round_does_not_create_it() {
        let fixture = Fixture::new();
        let block = fixture.notarized_block(RoundNumber::new(10));
        let notarization = NotarizationTracker::notarization(&block);

        let err = fixture
            .protocol
            .handle_notarization_message(&notarization)
            .unwrap_err();
        assert_eq!(err, ProtocolError::RoundNotStarted(RoundNumber::new(10)));
        assert!(err.is_transient());
        assert!(fixture.protocol.round(RoundNumber::new(10)).is_none());
    }

    #[test]
    fn stopping_fails_blocks_still_waiting_for_verification() {
        let fixture = Fixture::new();
        let round = fixture.start_round_1();
        let block = fixture.block(&round, 0);
        fixture.protocol.add_to_round_verification(&round, block.clone()).unwrap();
        assert_eq!(round.block_state(&block.hash), Some(BlockState::Pending));

        // Still inside the verification window.
        fixture.protocol.stop();
        wait_for(|| round.block_state(&block.hash) == Some(BlockState::Failed));
        assert_eq!(round.block_state(&block.hash), Some(BlockState::Failed));
        assert!(fixture.sent_tickets().is_empty());
    }
}
