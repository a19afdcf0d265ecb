/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Handlers for the messages miners send each other. Called by the [dispatcher](crate::dispatcher).
//!
//! A handler fails with a [transient](ProtocolError::is_transient) error when the message arrived before
//! this miner is ready for it, in which case the dispatcher retries it later.

use std::time::SystemTime;

use ed25519_dalek::VerifyingKey;

use crate::{
    beacon::types::VRFShare,
    dispatcher::{messages::BlockMessage, BlockMessageHandler},
    events::{Event, NotarizeBlockEvent},
    networking::{messages::Message, network::Network},
    pluggables::{App, Epochs},
    types::{
        block::{Block, BlockState},
        tickets::{BlockVerificationTicket, Notarization},
    },
};

use super::{ProtocolError, RoundProtocol};

impl<A: App, E: Epochs, N: Network + 'static> BlockMessageHandler for RoundProtocol<A, E, N> {
    fn handle_block_message(&self, message: &BlockMessage) -> Result<(), ProtocolError> {
        match &message.message {
            Message::VRFShare(share) => self.handle_vrf_share_message(&message.sender, share.clone()),
            Message::Verify(block) => self.handle_verify_block_message(block.clone()),
            Message::VerificationTicket(ticket) => self.handle_verification_ticket_message(&message.sender, ticket),
            Message::Notarization(notarization) => self.handle_notarization_message(notarization),
            Message::NotarizedBlock(block) => self.handle_notarized_block_message(block.clone()),
        }
    }
}

impl<A: App, E: Epochs, N: Network + 'static> RoundProtocol<A, E, N> {
    /// A peer's beacon share.
    ///
    /// Shares for later rounds are cached until this miner gets there, unless they are more than the
    /// round retention ahead of the current round. A share for an earlier round
    /// means the sender is behind, so it is sent the notarized block of that round to catch up.
    pub fn handle_vrf_share_message(&self, sender: &VerifyingKey, share: VRFShare) -> Result<(), ProtocolError> {
        if share.sender != sender.to_bytes()
            || self.epochs.miners(share.round).party_id(sender) != Some(share.party)
        {
            return Err(ProtocolError::InvalidSender);
        }

        if self.is_too_far_ahead(share.round) {
            return Err(ProtocolError::RoundTooFarAhead(share.round));
        }

        let current = self.current_round();
        if share.round > current {
            self.share_cache.add(share);
            return Ok(());
        }
        if share.round < current {
            let notarized = self
                .rounds
                .get(share.round)
                .and_then(|round| round.heaviest_notarized_block());
            if let Some(block) = notarized {
                self.send(*sender, Message::NotarizedBlock(block));
            }
            return Ok(());
        }

        let (round, _) = self.rounds.get_or_create(share.round);
        self.add_vrf_share(&round, share);
        Ok(())
    }

    /// A proposal broadcast by its generator (or relayed by a peer that timed out).
    pub fn handle_verify_block_message(&self, block: Block) -> Result<(), ProtocolError> {
        let number = block.round();
        if self.is_stale(number) || number < self.current_round() - 1 {
            return Err(ProtocolError::StaleRound(number));
        }

        let round = self
            .rounds
            .get(number)
            .filter(|round| round.has_random_seed())
            .ok_or(ProtocolError::RoundNotStarted(number))?;
        if round.has_block(&block.hash) {
            return Ok(());
        }

        self.add_to_round_verification(&round, block)?;
        Ok(())
    }

    /// A peer's ticket for a block. Kept on the side if the block has not arrived yet.
    pub fn handle_verification_ticket_message(
        &self,
        sender: &VerifyingKey,
        ticket: &BlockVerificationTicket,
    ) -> Result<(), ProtocolError> {
        if ticket.ticket.verifier != sender.to_bytes() {
            return Err(ProtocolError::InvalidSender);
        }
        if self.is_stale(ticket.round) {
            return Err(ProtocolError::StaleRound(ticket.round));
        }

        let round = self
            .rounds
            .get(ticket.round)
            .ok_or(ProtocolError::RoundNotStarted(ticket.round))?;
        self.notarization.verify_ticket(
            &self.epochs.miners(ticket.round),
            &ticket.block_hash,
            &ticket.ticket,
            ticket.round,
        )?;

        if !round.has_block(&ticket.block_hash) {
            round.add_verification_tickets([*ticket]);
            return Ok(());
        }
        self.process_verified_ticket(&round, &ticket.block_hash, ticket.ticket)
    }

    /// A peer's proof that one of the blocks of a round is notarized. The round and the block must
    /// already be known to this miner.
    pub fn handle_notarization_message(&self, notarization: &Notarization) -> Result<(), ProtocolError> {
        if self.is_stale(notarization.round) {
            return Err(ProtocolError::StaleRound(notarization.round));
        }

        let round = self
            .rounds
            .get(notarization.round)
            .ok_or(ProtocolError::RoundNotStarted(notarization.round))?;
        match round.block_state(&notarization.block_hash) {
            None => Err(ProtocolError::BlockNotFound {
                round: notarization.round,
                block: notarization.block_hash,
            }),
            Some(BlockState::Notarized) => Ok(()),
            Some(_) => self.merge_notarization(&round, notarization),
        }
    }

    /// A notarized block, sent to help this miner catch up.
    ///
    /// The block must carry a valid notarization of itself. The block's seed becomes the seed of its
    /// round on this miner.
    pub fn handle_notarized_block_message(&self, block: Block) -> Result<(), ProtocolError> {
        let number = block.round();
        if self.is_stale(number) {
            return Err(ProtocolError::StaleRound(number));
        }
        if !block.is_correct() {
            return Err(ProtocolError::InvalidBlock);
        }
        let miners = self.epochs.miners(number);
        self.notarization.verify_block_notarization(&miners, &block)?;

        let (round, _) = self.rounds.get_or_create(number);
        round.adopt_random_seed(block.header.round_random_seed, miners.len());

        let hash = block.hash;
        let tickets = block.verification_tickets.len();
        round.add_proposed_block(block);
        if round.add_notarized_block(&hash) {
            Event::publish(
                &self.event_publisher,
                Event::NotarizeBlock(NotarizeBlockEvent {
                    timestamp: SystemTime::now(),
                    round: number,
                    block: hash,
                    tickets,
                }),
            );
        }

        self.progress_on_notarization(&round);
        Ok(())
    }
}
