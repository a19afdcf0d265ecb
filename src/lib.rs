/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A round-based miner consensus engine.
//!
//! Time is divided into numbered rounds. In every round:
//! 1. Miners exchange shares of a [threshold random beacon](beacon). Once enough shares are in, the
//!    round has a random seed, and the seed ranks the miners of the round.
//! 2. The best-ranked miners [generate](protocol::RoundProtocol::generate_round_block) blocks that
//!    extend the notarized block of the previous round.
//! 3. Every miner [verifies](protocol::RoundProtocol::verify_round_block) the proposals in rank order
//!    and broadcasts a signed ticket for the best valid one.
//! 4. A block that collects tickets from a [threshold](notarization) of miners is notarized, and the
//!    next round starts. The round before it is finalized.
//!
//! Rounds that make no progress [time out](protocol::RoundProtocol::handle_round_timeout) and are
//! eventually restarted with fresh beacon shares.
//!
//! ## Getting started
//!
//! Implement [`App`](pluggables::App), [`Epochs`](pluggables::Epochs), and
//! [`Network`](networking::network::Network), then build and [start](miner::MinerSpec::start) a
//! [`Miner`](miner::Miner).

pub mod beacon;

pub mod dispatcher;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod miner;

pub mod networking;

pub mod notarization;

pub mod pluggables;

pub mod protocol;

pub mod round;

pub mod types;

pub mod view_change;
