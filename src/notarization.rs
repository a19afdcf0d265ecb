/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Counting and merging verification tickets.
//!
//! A block is notarized once it carries valid tickets from at least
//! [`notarization_threshold`](crate::types::miner_set::MinerSet::notarization_threshold) distinct miners
//! of its round's epoch. Since that threshold depends on the size of the epoch's miner set, every check
//! here takes the miner set of the block's round as an argument instead of caching a threshold.
//!
//! Merging is idempotent per `(block, verifier)`, and the ticket set of a block only ever grows, so once
//! a block is notarized it stays notarized.

use crate::types::{
    block::Block,
    data_types::{CryptoHash, RoundNumber, VerifyingKeyBytes},
    miner_set::MinerSet,
    tickets::{Notarization, VerificationTicket},
};

#[derive(Clone, Copy, Debug)]
pub struct NotarizationTracker {
    threshold_by_count: u32,
}

impl NotarizationTracker {
    pub fn new(threshold_by_count: u32) -> Self {
        Self { threshold_by_count }
    }

    /// Number of tickets a block of an epoch with `miners` needs.
    pub fn threshold(&self, miners: &MinerSet) -> usize {
        miners.notarization_threshold(self.threshold_by_count)
    }

    /// The tickets in `incoming` whose verifier has no ticket in `have`, deduplicated by verifier.
    pub fn unknown_tickets(have: &[VerificationTicket], incoming: &[VerificationTicket]) -> Vec<VerificationTicket> {
        let mut unknown: Vec<VerificationTicket> = Vec::new();
        for ticket in incoming {
            let known = |t: &VerificationTicket| t.verifier == ticket.verifier;
            if !have.iter().any(known) && !unknown.iter().any(known) {
                unknown.push(*ticket);
            }
        }
        unknown
    }

    /// Check that `ticket` was signed over `block_hash` by a miner of `round`'s epoch.
    pub fn verify_ticket(
        &self,
        miners: &MinerSet,
        block_hash: &CryptoHash,
        ticket: &VerificationTicket,
        round: RoundNumber,
    ) -> Result<(), NotarizationError> {
        if !miners.contains_bytes(&ticket.verifier) {
            return Err(NotarizationError::UnknownVerifier {
                round,
                verifier: ticket.verifier,
            });
        }
        if !ticket.is_correct(block_hash) {
            return Err(NotarizationError::InvalidTicket {
                round,
                verifier: ticket.verifier,
            });
        }
        Ok(())
    }

    /// Like [`verify_ticket`](Self::verify_ticket), for every ticket in `tickets`. Stops at the first
    /// failure.
    pub fn verify_tickets(
        &self,
        miners: &MinerSet,
        block_hash: &CryptoHash,
        tickets: &[VerificationTicket],
        round: RoundNumber,
    ) -> Result<(), NotarizationError> {
        tickets
            .iter()
            .try_for_each(|ticket| self.verify_ticket(miners, block_hash, ticket, round))
    }

    /// Whether `block` carries enough tickets from miners of `miners`.
    ///
    /// Only tickets from miners of the epoch count. Tickets are assumed to have been verified when they
    /// were merged.
    pub fn is_block_notarized(&self, miners: &MinerSet, block: &Block) -> bool {
        let valid = block
            .verification_tickets
            .iter()
            .filter(|ticket| miners.contains_bytes(&ticket.verifier))
            .count();
        block.is_genesis() || valid >= self.threshold(miners)
    }

    /// Check that `tickets` prove the notarization of the block with `block_hash` in `round`: every
    /// ticket valid, and enough distinct verifiers.
    pub fn verify_notarization(
        &self,
        miners: &MinerSet,
        block_hash: &CryptoHash,
        tickets: &[VerificationTicket],
        round: RoundNumber,
    ) -> Result<(), NotarizationError> {
        self.verify_tickets(miners, block_hash, tickets, round)?;
        let have = Self::unknown_tickets(&[], tickets).len();
        let need = self.threshold(miners);
        if have < need {
            return Err(NotarizationError::NotEnoughTickets { have, need });
        }
        Ok(())
    }

    /// Fully check a notarization carried by `block` itself.
    pub fn verify_block_notarization(&self, miners: &MinerSet, block: &Block) -> Result<(), NotarizationError> {
        if block.is_genesis() {
            return Ok(());
        }
        self.verify_notarization(miners, &block.hash, &block.verification_tickets, block.round())
    }

    /// Merge already verified `tickets` into `block`. Returns the number of tickets that were new.
    pub fn merge(block: &mut Block, tickets: &[VerificationTicket]) -> usize {
        tickets
            .iter()
            .filter(|ticket| block.add_verification_ticket(**ticket))
            .count()
    }

    /// The broadcastable proof of `block`'s notarization.
    pub fn notarization(block: &Block) -> Notarization {
        Notarization::new(block.hash, block.round(), block.verification_tickets.clone())
    }
}

/// Ways in which a ticket or a set of tickets can fail to prove a notarization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotarizationError {
    /// The verifier is not a miner of the round's epoch.
    UnknownVerifier {
        round: RoundNumber,
        verifier: VerifyingKeyBytes,
    },
    /// The ticket's signature does not match the block hash.
    InvalidTicket {
        round: RoundNumber,
        verifier: VerifyingKeyBytes,
    },
    /// Fewer valid tickets than the epoch's threshold.
    NotEnoughTickets { have: usize, need: usize },
}
