/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits the library user implements to plug the round protocol into a chain.
//!
//! - [`App`] produces, validates, and finalizes the contents of blocks. It owns transaction selection,
//!   state computation and storage: the protocol only ever sees transactions as opaque bytes and state
//!   as a hash.
//! - [`Epochs`] answers which miners are active in a round, how many of them may generate blocks, and
//!   when the next view change happens.
//!
//! ## Determinism
//!
//! Every honest miner must get the same answers from `Epochs` for the same round, and `validate_block`
//! must reach the same verdict on every miner. Otherwise miners disagree on ranks and thresholds and
//! the chain stalls.

use std::time::Instant;

use crate::types::{
    block::Block,
    data_types::{CryptoHash, MagicBlockNumber, RoundNumber, Transaction, VerifyingKeyBytes},
    miner_set::MinerSet,
};

pub trait App: Send + 'static {
    /// Called when this miner is a generator of `request.round()` and has to produce the contents of a
    /// block extending `request.prev_block()`.
    ///
    /// If there are not enough transactions to fill a block, return
    /// [`InsufficientTxns`](ProduceBlockError::InsufficientTxns) and the call will be retried with back
    /// off. Once the generation deadline has passed the call is made with
    /// [`wait_over`](ProduceBlockRequest::wait_over) set, and the app should produce a block with
    /// whatever transactions it has.
    fn produce_block(&mut self, request: ProduceBlockRequest) -> Result<ProduceBlockResponse, ProduceBlockError>;

    /// Called when a block proposed by another miner has to be verified. The verdict must be reached by
    /// `request.deadline()`.
    fn validate_block(&mut self, request: ValidateBlockRequest) -> ValidateBlockResponse;

    /// Build the transaction that pays this miner's block reward, if the chain has one. Appended to the
    /// transactions of every block this miner generates.
    fn create_fee_txn(&mut self, round: RoundNumber, miner: &VerifyingKeyBytes) -> Option<Transaction>;

    /// Called once the round of `block` is finalized.
    fn finalize_block(&mut self, block: &Block);

    /// Number of transactions available to the next block.
    fn txn_count(&self) -> usize;
}

pub struct ProduceBlockRequest<'a> {
    round: RoundNumber,
    prev_block: &'a Block,
    deadline: Instant,
    wait_over: bool,
}

impl<'a> ProduceBlockRequest<'a> {
    pub(crate) fn new(round: RoundNumber, prev_block: &'a Block, deadline: Instant, wait_over: bool) -> Self {
        Self {
            round,
            prev_block,
            deadline,
            wait_over,
        }
    }

    pub fn round(&self) -> RoundNumber {
        self.round
    }

    pub fn prev_block(&self) -> &Block {
        self.prev_block
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the generation deadline has passed, in which case the app should not report
    /// `InsufficientTxns` again.
    pub fn wait_over(&self) -> bool {
        self.wait_over
    }
}

pub struct ProduceBlockResponse {
    pub txns: Vec<Transaction>,
    /// Hash of the state that results from executing `txns` on top of the previous block.
    pub state_hash: CryptoHash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProduceBlockError {
    InsufficientTxns,
    /// The app ran out of time before it could produce a block.
    RoundTimeout,
    Failed(String),
}

pub struct ValidateBlockRequest<'a> {
    block: &'a Block,
    prev_block: Option<&'a Block>,
    deadline: Instant,
}

impl<'a> ValidateBlockRequest<'a> {
    pub(crate) fn new(block: &'a Block, prev_block: Option<&'a Block>, deadline: Instant) -> Self {
        Self {
            block,
            prev_block,
            deadline,
        }
    }

    pub fn block(&self) -> &Block {
        self.block
    }

    /// The block `block` extends, if this miner has it.
    pub fn prev_block(&self) -> Option<&Block> {
        self.prev_block
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

pub enum ValidateBlockResponse {
    /// The block's transactions are valid. `state_hash` is the state that results from executing them,
    /// and must equal the state hash in the block's header.
    Valid { state_hash: CryptoHash },
    Invalid,
}

/// Epoch (view change) facts, as decided outside of the round protocol.
pub trait Epochs: Send + Sync + 'static {
    /// The miners of the epoch `round` belongs to.
    fn miners(&self, round: RoundNumber) -> MinerSet;

    /// How many of the best-ranked miners of `round` generate blocks.
    fn generators_num(&self, round: RoundNumber) -> usize;

    /// The magic block number of the epoch `round` belongs to.
    fn magic_block_number(&self, round: RoundNumber) -> MagicBlockNumber;

    /// The first round after `round` that belongs to a new epoch.
    fn next_view_change_round(&self, round: RoundNumber) -> RoundNumber;
}

/// A single epoch that never changes. Suitable for test networks and for bootstrapping.
#[derive(Clone)]
pub struct FixedEpoch {
    pub miners: MinerSet,
    pub generators_num: usize,
    pub magic_block_number: MagicBlockNumber,
}

impl Epochs for FixedEpoch {
    fn miners(&self, _: RoundNumber) -> MinerSet {
        self.miners.clone()
    }

    fn generators_num(&self, _: RoundNumber) -> usize {
        self.generators_num
    }

    fn magic_block_number(&self, _: RoundNumber) -> MagicBlockNumber {
        self.magic_block_number
    }

    fn next_view_change_round(&self, _: RoundNumber) -> RoundNumber {
        RoundNumber::new(i64::MAX)
    }
}
