/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The envelope in which received messages wait for, and are retried by, the dispatcher.

use std::{
    fmt::{self, Display, Formatter},
    time::{Duration, Instant},
};

use ed25519_dalek::VerifyingKey;

use crate::{networking::messages::Message, types::data_types::RoundNumber};

/// Number of attempts after which a message is only retried while it is younger than
/// `RETRY_AGE_FACTOR` network deltas.
pub const MAX_RETRY_COUNT: u32 = 5;

pub const RETRY_AGE_FACTOR: u32 = 5;

pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Stable wire codes of the message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    VRFShare = 0,
    Verify = 1,
    VerificationTicket = 2,
    Notarization = 3,
    NotarizedBlock = 4,
}

impl MessageType {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MessageType::VRFShare),
            1 => Ok(MessageType::Verify),
            2 => Ok(MessageType::VerificationTicket),
            3 => Ok(MessageType::Notarization),
            4 => Ok(MessageType::NotarizedBlock),
            unknown => Err(unknown),
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::VRFShare => "VRFShare",
            MessageType::Verify => "Verify",
            MessageType::VerificationTicket => "VerificationTicket",
            MessageType::Notarization => "Notarization",
            MessageType::NotarizedBlock => "NotarizedBlock",
        };
        f.write_str(name)
    }
}

impl From<&Message> for MessageType {
    fn from(message: &Message) -> Self {
        match message {
            Message::VRFShare(_) => MessageType::VRFShare,
            Message::Verify(_) => MessageType::Verify,
            Message::VerificationTicket(_) => MessageType::VerificationTicket,
            Message::Notarization(_) => MessageType::Notarization,
            Message::NotarizedBlock(_) => MessageType::NotarizedBlock,
        }
    }
}

/// A received [`Message`], its origin, when it was first received, and how often it has been retried.
///
/// `received` is set once, when the message comes off the network, and survives retries, so the age of
/// a message bounds how long it keeps being retried.
#[derive(Clone, Debug)]
pub struct BlockMessage {
    pub sender: VerifyingKey,
    pub message: Message,
    pub received: Instant,
    pub retry_count: u32,
}

impl BlockMessage {
    pub fn new(sender: VerifyingKey, message: Message) -> Self {
        Self {
            sender,
            message,
            received: Instant::now(),
            retry_count: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from(&self.message)
    }

    pub fn round(&self) -> RoundNumber {
        self.message.round()
    }

    pub fn elapsed(&self) -> Duration {
        self.received.elapsed()
    }

    /// Whether a message that arrived too early should be tried again: while it has been retried fewer
    /// than [`MAX_RETRY_COUNT`] times, or is younger than `RETRY_AGE_FACTOR × network_delta`.
    pub fn should_retry(&self, network_delta: Duration) -> bool {
        self.retry_count < MAX_RETRY_COUNT || self.elapsed() < network_delta * RETRY_AGE_FACTOR
    }

    /// How long to wait before the next attempt: twice the message's age, within
    /// [`MIN_RETRY_DELAY`] and [`MAX_RETRY_DELAY`].
    pub fn retry_delay(&self) -> Duration {
        retry_delay_for(self.elapsed())
    }
}

pub(crate) fn retry_delay_for(elapsed: Duration) -> Duration {
    (elapsed * 2).clamp(MIN_RETRY_DELAY, MAX_RETRY_DELAY)
}
