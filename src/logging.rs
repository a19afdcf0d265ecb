/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the miner's
//! [configuration](crate::miner::Configuration).
//!
//! The miner logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [NotarizeBlock](crate::events::NotarizeBlockEvent) is printed:
//!
//! ```text
//! NotarizeBlock, 1701329264, 12, fNGCJyk, 3
//! ```
//!
//! In the snippet:
//! - The third value is the round of the block.
//! - The fourth value is the first seven characters of the Base64 encoding of the block hash.
//! - The fifth value is the number of verification tickets the block carries.

use crate::events::*;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

// Names of each event in PascalCase for printing:
pub const START_ROUND: &str = "StartRound";
pub const ROUND_TIMEOUT: &str = "RoundTimeout";
pub const RESTART_ROUND: &str = "RestartRound";
pub const FINALIZE_ROUND: &str = "FinalizeRound";

pub const ADD_VRF_SHARE: &str = "AddVRFShare";
pub const COMPUTE_RANDOM_SEED: &str = "ComputeRandomSeed";
pub const INSTALL_DKG: &str = "InstallDKG";

pub const PROPOSE_BLOCK: &str = "ProposeBlock";
pub const VERIFY_BLOCK: &str = "VerifyBlock";
pub const REJECT_BLOCK: &str = "RejectBlock";
pub const SEND_TICKET: &str = "SendTicket";
pub const NOTARIZE_BLOCK: &str = "NotarizeBlock";

pub const RETRY_MESSAGE: &str = "RetryMessage";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for StartRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_round_event: &StartRoundEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                START_ROUND,
                secs_since_unix_epoch(start_round_event.timestamp),
                start_round_event.round,
                start_round_event.timeout_count,
                start_round_event.random_seed
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoundTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |round_timeout_event: &RoundTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ROUND_TIMEOUT,
                secs_since_unix_epoch(round_timeout_event.timestamp),
                round_timeout_event.round,
                round_timeout_event.soft_timeout_count,
                round_timeout_event.timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for RestartRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |restart_round_event: &RestartRoundEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RESTART_ROUND,
                secs_since_unix_epoch(restart_round_event.timestamp),
                restart_round_event.round,
                restart_round_event.timeout_count
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinalizeRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |finalize_round_event: &FinalizeRoundEvent| {
            log::info!(
                "{}, {}, {}, {}",
                FINALIZE_ROUND,
                secs_since_unix_epoch(finalize_round_event.timestamp),
                finalize_round_event.round,
                first_seven_base64_chars(&finalize_round_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for AddVRFShareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |add_vrf_share_event: &AddVRFShareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ADD_VRF_SHARE,
                secs_since_unix_epoch(add_vrf_share_event.timestamp),
                add_vrf_share_event.round,
                add_vrf_share_event.party,
                add_vrf_share_event.shares
            )
        };
        Box::new(logger)
    }
}

impl Logger for ComputeRandomSeedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |compute_random_seed_event: &ComputeRandomSeedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMPUTE_RANDOM_SEED,
                secs_since_unix_epoch(compute_random_seed_event.timestamp),
                compute_random_seed_event.round,
                compute_random_seed_event.random_seed
            )
        };
        Box::new(logger)
    }
}

impl Logger for InstallDKGEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |install_dkg_event: &InstallDKGEvent| {
            log::info!(
                "{}, {}, {}, {}, {}/{}",
                INSTALL_DKG,
                secs_since_unix_epoch(install_dkg_event.timestamp),
                install_dkg_event.magic_block_number.int(),
                install_dkg_event.starting_round,
                install_dkg_event.threshold,
                install_dkg_event.n
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_block_event: &ProposeBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE_BLOCK,
                secs_since_unix_epoch(propose_block_event.timestamp),
                propose_block_event.round,
                first_seven_base64_chars(&propose_block_event.block.bytes()),
                propose_block_event.rank
            )
        };
        Box::new(logger)
    }
}

impl Logger for VerifyBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |verify_block_event: &VerifyBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                VERIFY_BLOCK,
                secs_since_unix_epoch(verify_block_event.timestamp),
                verify_block_event.round,
                first_seven_base64_chars(&verify_block_event.block.bytes()),
                verify_block_event.rank
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_block_event: &RejectBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REJECT_BLOCK,
                secs_since_unix_epoch(reject_block_event.timestamp),
                reject_block_event.round,
                first_seven_base64_chars(&reject_block_event.block.bytes()),
                reject_block_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendTicketEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_ticket_event: &SendTicketEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SEND_TICKET,
                secs_since_unix_epoch(send_ticket_event.timestamp),
                send_ticket_event.round,
                first_seven_base64_chars(&send_ticket_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for NotarizeBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |notarize_block_event: &NotarizeBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NOTARIZE_BLOCK,
                secs_since_unix_epoch(notarize_block_event.timestamp),
                notarize_block_event.round,
                first_seven_base64_chars(&notarize_block_event.block.bytes()),
                notarize_block_event.tickets
            )
        };
        Box::new(logger)
    }
}

impl Logger for RetryMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |retry_message_event: &RetryMessageEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RETRY_MESSAGE,
                secs_since_unix_epoch(retry_message_event.timestamp),
                retry_message_event.round,
                retry_message_event.message_type,
                retry_message_event.retry_count,
                retry_message_event.delay.as_millis()
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
