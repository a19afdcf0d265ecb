/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! The miner never opens sockets. It is handed decoded [`Message`](messages::Message)s by a user-provided
//! [`Network`](network::Network) implementation, and hands back messages to send or broadcast.

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;
