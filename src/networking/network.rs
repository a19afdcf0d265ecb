/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use ed25519_dalek::VerifyingKey;

use crate::types::miner_set::MinerSet;

use super::messages::Message;

pub trait Network: Clone + Send {
    /// Inform the network provider of the miners of the first epoch on wake-up.
    fn init_miner_set(&mut self, miners: MinerSet);

    /// Send a message to all peers (including this miner) without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}
