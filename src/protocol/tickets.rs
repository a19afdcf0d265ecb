/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Counting verification tickets towards notarization, and moving on once a block is notarized.

use std::{sync::Arc, time::SystemTime};

use crate::{
    events::{Event, NotarizeBlockEvent},
    networking::{messages::Message, network::Network},
    notarization::NotarizationTracker,
    pluggables::{App, Epochs},
    round::Round,
    types::{
        block::BlockState,
        data_types::CryptoHash,
        tickets::{Notarization, VerificationTicket},
    },
};

use super::{ProtocolError, RoundProtocol};

impl<A: App, E: Epochs, N: Network + 'static> RoundProtocol<A, E, N> {
    /// Add a verified `ticket` to the block with `hash`, and check whether the block is now notarized.
    /// If it is, its notarization is broadcast.
    ///
    /// Adding a ticket from a verifier that already has one on the block changes nothing.
    pub fn process_verified_ticket(
        &self,
        round: &Arc<Round>,
        hash: &CryptoHash,
        ticket: VerificationTicket,
    ) -> Result<(), ProtocolError> {
        let added = round
            .with_block_mut(hash, |block| block.add_verification_ticket(ticket))
            .ok_or(ProtocolError::BlockNotFound {
                round: round.number(),
                block: *hash,
            })?;
        if !added || round.block_state(hash) == Some(BlockState::Notarized) {
            return Ok(());
        }

        self.check_block_notarization(round, hash, true);
        Ok(())
    }

    /// Merge the tickets of a notarization received from a peer into the known block, after checking
    /// each ticket this miner does not have yet.
    ///
    /// Fails if the block is unknown, if any new ticket is invalid, or if the merged tickets still do not
    /// notarize the block.
    pub fn merge_notarization(&self, round: &Arc<Round>, notarization: &Notarization) -> Result<(), ProtocolError> {
        let hash = notarization.block_hash;
        let block = round.block(&hash).ok_or(ProtocolError::BlockNotFound {
            round: round.number(),
            block: hash,
        })?;
        if block.state == BlockState::Notarized {
            return Ok(());
        }

        let unknown = NotarizationTracker::unknown_tickets(&block.verification_tickets, &notarization.tickets);
        self.notarization.verify_tickets(
            &self.epochs.miners(round.number()),
            &hash,
            &unknown,
            round.number(),
        )?;
        round.with_block_mut(&hash, |block| NotarizationTracker::merge(block, &unknown));

        if self.check_block_notarization(round, &hash, false)
            || round.block_state(&hash) == Some(BlockState::Notarized)
        {
            Ok(())
        } else {
            Err(ProtocolError::NotNotarized {
                round: round.number(),
                block: hash,
            })
        }
    }

    /// Mark the block with `hash` notarized if its tickets reach the threshold, and if so, move on to the
    /// next round. Returns whether this call notarized the block.
    pub(super) fn check_block_notarization(&self, round: &Arc<Round>, hash: &CryptoHash, broadcast: bool) -> bool {
        let Some(block) = round.block(hash) else {
            return false;
        };
        let miners = self.epochs.miners(round.number());
        if !self.notarization.is_block_notarized(&miners, &block) {
            return false;
        }
        if block.header.round_random_seed.is_zero() || !round.add_notarized_block(hash) {
            return false;
        }

        // A notarized block carries the seed the network agreed on.
        if round.adopt_random_seed(block.header.round_random_seed, miners.len()) {
            log::warn!(
                "Round {} seed replaced by the seed of its notarized block",
                round.number()
            );
        }

        Event::publish(
            &self.event_publisher,
            Event::NotarizeBlock(NotarizeBlockEvent {
                timestamp: SystemTime::now(),
                round: round.number(),
                block: *hash,
                tickets: block.verification_tickets.len(),
            }),
        );

        if broadcast {
            self.broadcast(Message::Notarization(NotarizationTracker::notarization(&block)));
        }

        self.progress_on_notarization(round);
        true
    }

    /// Start the round after `round` if `round` is not behind the current round.
    pub(super) fn progress_on_notarization(&self, round: &Arc<Round>) {
        if round.number() >= self.current_round() {
            self.start_next_round(round);
        }
    }
}
