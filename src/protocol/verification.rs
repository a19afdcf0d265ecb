/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Collecting the blocks proposed in a round and verifying them in rank order.
//!
//! Every round that has a seed runs one verification collector thread. Proposals are first buffered for
//! a short window so that the best-ranked of them can be verified first. After the window, a late
//! proposal is only verified if it ranks at least as well as the best block verified so far.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use crate::{
    events::{Event, RejectBlockEvent, SendTicketEvent, VerifyBlockEvent},
    networking::{messages::Message, network::Network},
    notarization::{NotarizationError, NotarizationTracker},
    pluggables::{App, Epochs, ValidateBlockRequest, ValidateBlockResponse},
    round::{state::VerificationContext, Round},
    types::{
        block::{Block, BlockState},
        cancellation::CancellationToken,
        data_types::{MagicBlockNumber, RoundNumber, RoundRank},
        tickets::{BlockVerificationTicket, VerificationTicket},
    },
};

use super::RoundProtocol;

const COLLECTOR_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MIN_VERIFICATION_DELTA: Duration = Duration::from_millis(1);

impl<A: App, E: Epochs, N: Network + 'static> RoundProtocol<A, E, N> {
    /// Accept a proposal for `round` and hand it to the round's verification collector.
    ///
    /// The block is rejected if the round is already being finalized, if it belongs to a different
    /// epoch, if its generator is not a miner of the round, or if the notarization of the block it
    /// extends does not check out. Tickets for the block that arrived before it are applied right away.
    pub fn add_to_round_verification(&self, round: &Arc<Round>, block: Block) -> Result<(), AddToVerificationError> {
        let result = self.check_proposal(round, &block);
        if let Err(err) = &result {
            Event::publish(
                &self.event_publisher,
                Event::RejectBlock(RejectBlockEvent {
                    timestamp: SystemTime::now(),
                    round: block.round(),
                    block: block.hash,
                    reason: format!("{:?}", err),
                }),
            );
            return result;
        }

        // The tickets a block carries are not covered by its hash, so only checked ones are kept.
        let mut block = block;
        block.verification_tickets = self.checked_tickets(round, &block);

        let hash = block.hash;
        let is_new = round.add_proposed_block(block.clone());
        for ticket in round.verification_tickets(&hash) {
            if let Err(err) = self.process_verified_ticket(round, &hash, ticket) {
                log::debug!("Early ticket for round {} not applied: {:?}", round.number(), err);
            }
        }

        if !is_new || round.is_verification_complete() || round.send_for_verification(block.clone()) {
            return Ok(());
        }
        // No collector is running. Only the current round gets a new one.
        if round.number() == self.current_round() {
            self.start_verification(round);
            round.send_for_verification(block);
        }
        Ok(())
    }

    fn check_proposal(&self, round: &Round, block: &Block) -> Result<(), AddToVerificationError> {
        if round.is_finalizing_or_finalized() {
            return Err(AddToVerificationError::RoundFinalizing(round.number()));
        }

        let expected = self.epochs.magic_block_number(round.number());
        if block.header.magic_block_number != expected {
            return Err(AddToVerificationError::InvalidMagicBlock {
                expected,
                found: block.header.magic_block_number,
            });
        }

        if !self.epochs.miners(round.number()).contains_bytes(block.miner()) {
            return Err(AddToVerificationError::UnknownMiner);
        }

        self.verify_prev_notarization(block)
            .map_err(AddToVerificationError::InvalidPrevNotarization)
    }

    /// The tickets `block` carries that are signed over its hash by distinct miners of `round`.
    fn checked_tickets(&self, round: &Round, block: &Block) -> Vec<VerificationTicket> {
        let miners = self.epochs.miners(round.number());
        NotarizationTracker::unknown_tickets(&[], &block.verification_tickets)
            .into_iter()
            .filter(|ticket| {
                self.notarization
                    .verify_ticket(&miners, &block.hash, ticket, round.number())
                    .is_ok()
            })
            .collect()
    }

    /// Check that the block `block` extends is notarized, either because this miner saw it notarized or
    /// by the tickets `block` carries for it.
    fn verify_prev_notarization(&self, block: &Block) -> Result<(), NotarizationError> {
        let prev_number = block.round() - 1;
        let prev_notarized = self
            .rounds
            .get(prev_number)
            .and_then(|prev| prev.block_state(&block.header.prev_hash))
            == Some(BlockState::Notarized);
        if prev_notarized {
            return Ok(());
        }

        self.notarization.verify_notarization(
            &self.epochs.miners(prev_number),
            &block.header.prev_hash,
            &block.prev_verification_tickets,
            prev_number,
        )
    }

    /// Start the verification collector of `round`, unless one is already running.
    pub(super) fn start_verification(&self, round: &Arc<Round>) {
        if self.is_stopped() {
            return;
        }
        let Some(protocol) = self.arc() else {
            return;
        };

        let (blocks_sender, blocks) = mpsc::channel();
        let cancel = CancellationToken::new();
        let context = VerificationContext {
            blocks: blocks_sender,
            cancel: cancel.clone(),
        };
        if !round.set_verification_context(context) {
            return;
        }

        let round = round.clone();
        thread::spawn(move || protocol.collect_blocks_for_verification(&round, blocks, cancel));
    }

    /// How long proposals are buffered before the first of them is verified.
    fn verification_delta(&self) -> Duration {
        (self.config.block_proposal_wait_time + self.config.network_delta).max(MIN_VERIFICATION_DELTA)
    }

    /// The body of a round's verification collector thread.
    ///
    /// ## Internal procedure
    ///
    /// 1. Until the verification window closes, buffer the blocks received from `blocks`.
    /// 2. When it closes, verify the buffered blocks best rank first. The first block to pass becomes the
    ///    round's best block, and every block after it is rejected without being verified.
    /// 3. After that, verify every new block that ranks at least as well as the best verified block, and
    ///    reject the others.
    ///
    /// Once `cancel` is cancelled, every block still waiting for a verdict is marked as failed and the
    /// collector exits.
    pub(crate) fn collect_blocks_for_verification(
        &self,
        round: &Arc<Round>,
        blocks: Receiver<Block>,
        cancel: CancellationToken,
    ) {
        let window_closes = Instant::now() + self.verification_delta();
        let mut buffered: Vec<Block> = Vec::new();
        let mut collecting = true;
        let mut best_rank: Option<RoundRank> = None;

        loop {
            if cancel.is_cancelled() {
                Self::fail_unresolved_blocks(round);
                return;
            }

            // 2. Verify the buffered blocks in rank order.
            if collecting && Instant::now() >= window_closes {
                collecting = false;
                buffered.sort_by_key(|block| block.rank());
                for block in buffered.drain(..) {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if best_rank.is_some() {
                        round.set_block_state(&block.hash, BlockState::Rejected);
                        continue;
                    }
                    if self.verify_and_send(round, &block) {
                        best_rank = Some(block.rank());
                    }
                }
                continue;
            }

            let wait = if collecting {
                window_closes
                    .saturating_duration_since(Instant::now())
                    .min(COLLECTOR_POLL_INTERVAL)
            } else {
                COLLECTOR_POLL_INTERVAL
            };
            match blocks.recv_timeout(wait) {
                Ok(block) => {
                    // 1. Buffer.
                    if collecting {
                        if !buffered.iter().any(|buffered| buffered.hash == block.hash) {
                            buffered.push(block);
                        }
                        continue;
                    }

                    // 3. Late arrivals.
                    match best_rank {
                        Some(best) if block.rank() > best => {
                            round.set_block_state(&block.hash, BlockState::Rejected)
                        }
                        _ => {
                            if self.verify_and_send(round, &block)
                                && best_rank.map_or(true, |best| block.rank() < best)
                            {
                                best_rank = Some(block.rank());
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn fail_unresolved_blocks(round: &Round) {
        for block in round.proposed_blocks() {
            if !block.state.is_resolved() {
                round.set_block_state(&block.hash, BlockState::Failed);
            }
        }
    }

    /// Verify `block` and, if it passes, broadcast this miner's ticket for it. Returns whether the block
    /// passed.
    ///
    /// The ticket is not sent if a different block of the round is already notarized. The first block of
    /// the round to pass becomes the round's best block, and this miner's own ticket is counted towards
    /// its notarization.
    fn verify_and_send(&self, round: &Arc<Round>, block: &Block) -> bool {
        round.set_block_state(&block.hash, BlockState::Accepted);
        match self.verify_round_block(round, block) {
            Ok(ticket) => {
                round.set_block_state(&block.hash, BlockState::Successful);
                Event::publish(
                    &self.event_publisher,
                    Event::VerifyBlock(VerifyBlockEvent {
                        timestamp: SystemTime::now(),
                        round: round.number(),
                        block: block.hash,
                        rank: block.rank(),
                    }),
                );

                let notarized = round.heaviest_notarized_block();
                if notarized.map_or(true, |notarized| notarized.hash == block.hash) {
                    round.set_own_verification_ticket(ticket);
                    self.broadcast(Message::VerificationTicket(ticket));
                    Event::publish(
                        &self.event_publisher,
                        Event::SendTicket(SendTicketEvent {
                            timestamp: SystemTime::now(),
                            round: round.number(),
                            block: block.hash,
                        }),
                    );
                }

                if round.best_block().is_none() {
                    round.set_best_block(block.hash);
                    if let Err(err) = self.process_verified_ticket(round, &block.hash, ticket.ticket) {
                        log::debug!("Own ticket for round {} not applied: {:?}", round.number(), err);
                    }
                }
                true
            }
            Err(err) => {
                round.set_block_state(&block.hash, BlockState::Failed);
                Event::publish(
                    &self.event_publisher,
                    Event::RejectBlock(RejectBlockEvent {
                        timestamp: SystemTime::now(),
                        round: round.number(),
                        block: block.hash,
                        reason: format!("{:?}", err),
                    }),
                );
                false
            }
        }
    }

    /// Verify `block` as a proposal for `round`, and sign a ticket for it if it passes.
    ///
    /// The block must belong to the current round and carry the round's seed. Its generator's rank must
    /// match the header and be among the generators of the round, and its hash and signature must be
    /// correct. Blocks of other miners must also extend a notarized block, and the app must agree on
    /// their state.
    pub fn verify_round_block(&self, round: &Round, block: &Block) -> Result<BlockVerificationTicket, VerifyBlockError> {
        let current = self.current_round();
        if block.round() != round.number() || current != round.number() {
            return Err(VerifyBlockError::RoundMismatch {
                current,
                block: block.round(),
            });
        }

        let seed = round.random_seed();
        if seed.is_zero() || block.header.round_random_seed != seed {
            return Err(VerifyBlockError::InvalidSeed);
        }

        let miners = self.epochs.miners(round.number());
        let rank = miners
            .position_of_bytes(block.miner())
            .and_then(|position| round.miner_rank(position))
            .ok_or(VerifyBlockError::UnknownMiner)?;
        if rank != block.rank() {
            return Err(VerifyBlockError::InvalidRank {
                expected: rank,
                found: block.rank(),
            });
        }
        if (rank.int() as usize) >= self.epochs.generators_num(round.number()) {
            return Err(VerifyBlockError::NotAGenerator(rank));
        }

        if !block.is_correct() {
            return Err(VerifyBlockError::InvalidBlock);
        }

        if *block.miner() != self.me_bytes() {
            self.verify_prev_notarization(block)
                .map_err(VerifyBlockError::InvalidPrevNotarization)?;

            let prev_block = self
                .rounds
                .get(round.number() - 1)
                .and_then(|prev| prev.block(&block.header.prev_hash));
            let deadline = Instant::now() + self.verification_delta() + self.config.network_delta;
            let request = ValidateBlockRequest::new(block, prev_block.as_ref(), deadline);
            match self.app.lock().unwrap().validate_block(request) {
                ValidateBlockResponse::Valid { state_hash } if state_hash == block.header.state_hash => (),
                ValidateBlockResponse::Valid { .. } => return Err(VerifyBlockError::StateMismatch),
                ValidateBlockResponse::Invalid => return Err(VerifyBlockError::InvalidTransactions),
            }
        }

        Ok(BlockVerificationTicket::new(
            &self.config.keypair,
            block.hash,
            round.number(),
        ))
    }
}

/// Enumerates the reasons a proposal is turned away before verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddToVerificationError {
    RoundFinalizing(RoundNumber),
    InvalidMagicBlock {
        expected: MagicBlockNumber,
        found: MagicBlockNumber,
    },
    UnknownMiner,
    InvalidPrevNotarization(NotarizationError),
}

/// Enumerates the reasons a proposal fails verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyBlockError {
    /// The block is not for the round this miner is currently in.
    RoundMismatch { current: RoundNumber, block: RoundNumber },
    InvalidSeed,
    UnknownMiner,
    InvalidRank { expected: RoundRank, found: RoundRank },
    NotAGenerator(RoundRank),
    /// The block's hash or its generator's signature is wrong.
    InvalidBlock,
    InvalidPrevNotarization(NotarizationError),
    InvalidTransactions,
    StateMismatch,
}
