/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Generating this miner's block for a round.

use std::{
    cmp::min,
    sync::Arc,
    thread,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use crate::{
    events::{Event, ProposeBlockEvent},
    networking::{messages::Message, network::Network},
    pluggables::{App, Epochs, ProduceBlockError, ProduceBlockRequest, ProduceBlockResponse},
    round::Round,
    types::{
        block::{Block, BlockHeader},
        data_types::{RoundNumber, TimeoutCount},
    },
};

use super::RoundProtocol;

impl<A: App, E: Epochs, N: Network + 'static> RoundProtocol<A, E, N> {
    /// Generate, register and broadcast this miner's block for `round`.
    ///
    /// The block extends the heaviest notarized block of the previous round, or if there is none, its
    /// best proposed block. While the app reports insufficient transactions, the call is retried with
    /// an exponentially growing wait until the generation timeout passes, after which the app is asked
    /// to produce a block with whatever it has.
    ///
    /// The block is discarded if, by the time it is ready, the round has already moved on: a later round
    /// was started, the round was restarted, or a block of the round was notarized.
    pub fn generate_round_block(&self, round: &Arc<Round>) -> Result<Block, GenerateBlockError> {
        let number = round.number();
        let timeout_count = round.timeout_count();
        let seed = round.random_seed();
        if seed.is_zero() {
            return Err(GenerateBlockError::NoRandomSeed(number));
        }

        let miners = self.epochs.miners(number);
        let rank = miners
            .position(&self.me())
            .and_then(|position| round.miner_rank(position))
            .ok_or(GenerateBlockError::NotAMiner)?;

        let prev_round = self
            .rounds
            .get(number - 1)
            .ok_or(GenerateBlockError::NoBlockToExtend(number - 1))?;
        let prev_block = prev_round
            .heaviest_notarized_block()
            .or_else(|| prev_round.best_proposed_block())
            .ok_or(GenerateBlockError::NoBlockToExtend(number - 1))?;

        // Produce the block's contents, backing off while there are not enough transactions.
        let deadline = Instant::now() + self.config.generation_timeout;
        let mut wait = self.config.retry_wait_time;
        let mut wait_over = false;
        let ProduceBlockResponse {
            mut txns,
            state_hash,
        } = loop {
            self.check_still_generating(round, timeout_count)?;

            let request = ProduceBlockRequest::new(number, &prev_block, deadline, wait_over);
            let result = self.app.lock().unwrap().produce_block(request);
            match result {
                Ok(response) => break response,
                Err(ProduceBlockError::InsufficientTxns) if !wait_over => {
                    let now = Instant::now();
                    if now >= deadline {
                        wait_over = true;
                        continue;
                    }
                    thread::sleep(min(wait, deadline - now));
                    wait *= 2;
                }
                Err(ProduceBlockError::InsufficientTxns) => return Err(GenerateBlockError::InsufficientTxns),
                Err(ProduceBlockError::RoundTimeout) => return Err(GenerateBlockError::RoundTimeout),
                Err(ProduceBlockError::Failed(reason)) => return Err(GenerateBlockError::App(reason)),
            }
        };

        let fee_txn = self
            .app
            .lock()
            .unwrap()
            .create_fee_txn(number, &self.me_bytes());
        txns.extend(fee_txn);

        let header = BlockHeader {
            chain_id: self.config.chain_id,
            round: number,
            prev_hash: prev_block.hash,
            miner: self.me_bytes(),
            round_random_seed: seed,
            round_rank: rank,
            round_timeout_count: timeout_count,
            magic_block_number: self.epochs.magic_block_number(number),
            creation_date: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_secs())
                .unwrap_or(0),
            state_hash,
        };
        let block = Block::new(
            header,
            txns,
            prev_block.verification_tickets.clone(),
            &self.config.keypair,
        );

        self.check_still_generating(round, timeout_count)?;
        if round.is_verification_complete() {
            return Err(GenerateBlockError::Superseded);
        }

        self.add_to_round_verification(round, block.clone())
            .map_err(|err| GenerateBlockError::Rejected(format!("{:?}", err)))?;

        Event::publish(
            &self.event_publisher,
            Event::ProposeBlock(ProposeBlockEvent {
                timestamp: SystemTime::now(),
                round: number,
                block: block.hash,
                rank,
            }),
        );
        self.broadcast(Message::Verify(block.clone()));

        Ok(block)
    }

    fn check_still_generating(&self, round: &Round, timeout_count: TimeoutCount) -> Result<(), GenerateBlockError> {
        if self.is_stopped() {
            return Err(GenerateBlockError::Stopped);
        }
        let current = self.current_round();
        if current > round.number() {
            return Err(GenerateBlockError::RoundMismatch {
                round: round.number(),
                current,
            });
        }
        if round.timeout_count() != timeout_count {
            return Err(GenerateBlockError::Superseded);
        }
        Ok(())
    }
}

/// Enumerates the reasons a generator may end up not proposing a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateBlockError {
    /// The round has no seed yet, so ranks are unknown.
    NoRandomSeed(RoundNumber),
    /// This miner is not a miner of the round.
    NotAMiner,
    /// The previous round has neither a notarized nor a verified block.
    NoBlockToExtend(RoundNumber),
    /// The app still had too few transactions after the generation timeout.
    InsufficientTxns,
    RoundTimeout,
    /// A later round started while the block was being generated.
    RoundMismatch { round: RoundNumber, current: RoundNumber },
    /// The round was restarted or already has a notarized block.
    Superseded,
    /// This miner's own checks rejected the block.
    Rejected(String),
    App(String),
    Stopped,
}
