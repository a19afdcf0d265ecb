/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple sub-protocols or components of the miner.
//!
//! Other types, specific to single components, can be found next to those components, e.g.,
//! [`crate::beacon::threshold`] or [`crate::dispatcher::messages`].

pub mod block;

pub mod cancellation;

pub mod crypto_primitives;

pub mod data_types;

pub mod miner_set;

pub mod tickets;
