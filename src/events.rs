/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events that the miner emits as the round protocol makes progress.
//!
//! An event for a given action indicates that the action has been completed. Events are published on
//! a channel and handled by the [event bus](crate::event_bus) thread, which invokes the handlers the
//! user registered through [`MinerSpec`](crate::miner::MinerSpec) and, if enabled, the default
//! [loggers](crate::logging).

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    dispatcher::messages::MessageType,
    types::data_types::{
        CryptoHash, MagicBlockNumber, PartyID, RandomSeed, RoundNumber, RoundRank, TimeoutCount,
    },
};

pub enum Event {
    // Round lifecycle.
    StartRound(StartRoundEvent),
    RoundTimeout(RoundTimeoutEvent),
    RestartRound(RestartRoundEvent),
    FinalizeRound(FinalizeRoundEvent),
    // Random beacon.
    AddVRFShare(AddVRFShareEvent),
    ComputeRandomSeed(ComputeRandomSeedEvent),
    InstallDKG(InstallDKGEvent),
    // Blocks and tickets.
    ProposeBlock(ProposeBlockEvent),
    VerifyBlock(VerifyBlockEvent),
    RejectBlock(RejectBlockEvent),
    SendTicket(SendTicketEvent),
    NotarizeBlock(NotarizeBlockEvent),
    // Message dispatch.
    RetryMessage(RetryMessageEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus is shut down before the threads that publish to it.
            let _ = event_publisher.send(event);
        }
    }
}

/// A round got its random seed, and with it the rank of every miner.
pub struct StartRoundEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub timeout_count: TimeoutCount,
    pub random_seed: RandomSeed,
}

pub struct RoundTimeoutEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub soft_timeout_count: u32,
    pub timeout: Duration,
}

/// A round was restarted at a new timeout count.
pub struct RestartRoundEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub timeout_count: TimeoutCount,
}

pub struct FinalizeRoundEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub block: CryptoHash,
}

pub struct AddVRFShareEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub party: PartyID,
    pub shares: usize,
}

pub struct ComputeRandomSeedEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub random_seed: RandomSeed,
}

/// Threshold key material for a new epoch was installed into the beacon.
pub struct InstallDKGEvent {
    pub timestamp: SystemTime,
    pub magic_block_number: MagicBlockNumber,
    pub starting_round: RoundNumber,
    pub threshold: usize,
    pub n: usize,
}

pub struct ProposeBlockEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub block: CryptoHash,
    pub rank: RoundRank,
}

pub struct VerifyBlockEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub block: CryptoHash,
    pub rank: RoundRank,
}

pub struct RejectBlockEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub block: CryptoHash,
    pub reason: String,
}

pub struct SendTicketEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub block: CryptoHash,
}

pub struct NotarizeBlockEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub block: CryptoHash,
    pub tickets: usize,
}

/// A message that arrived too early was scheduled for another attempt.
pub struct RetryMessageEvent {
    pub timestamp: SystemTime,
    pub round: RoundNumber,
    pub message_type: MessageType,
    pub retry_count: u32,
    pub delay: Duration,
}
