/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of the messages miners exchange.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    beacon::types::VRFShare,
    types::{
        block::Block,
        data_types::RoundNumber,
        tickets::{BlockVerificationTicket, Notarization},
    },
};

/// All message variants used by the round protocol.
///
/// The discriminants of this enum are the stable message type codes, see
/// [`MessageType`](crate::dispatcher::messages::MessageType).
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// A miner's share of the next round's random seed.
    VRFShare(VRFShare),

    /// A block proposal, to be verified.
    Verify(Block),

    /// A miner's ticket for a block it verified.
    VerificationTicket(BlockVerificationTicket),

    /// Proof that a block gathered enough tickets.
    Notarization(Notarization),

    /// A block that carries its own notarization, for miners that missed the round.
    NotarizedBlock(Block),
}

impl Message {
    /// Get the round the inner message is about.
    pub fn round(&self) -> RoundNumber {
        match self {
            Message::VRFShare(share) => share.round,
            Message::Verify(block) => block.round(),
            Message::VerificationTicket(ticket) => ticket.round,
            Message::Notarization(notarization) => notarization.round,
            Message::NotarizedBlock(block) => block.round(),
        }
    }
}

impl From<VRFShare> for Message {
    fn from(value: VRFShare) -> Self {
        Message::VRFShare(value)
    }
}

impl From<BlockVerificationTicket> for Message {
    fn from(value: BlockVerificationTicket) -> Self {
        Message::VerificationTicket(value)
    }
}

impl From<Notarization> for Message {
    fn from(value: Notarization) -> Self {
        Message::Notarization(value)
    }
}
