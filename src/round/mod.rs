/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory state of the rounds a miner is working on.
//!
//! A [`Round`] is created either when the previous round is notarized and the protocol starts the next
//! one, or when a message (VRF share, proposal, notarization) arrives for a round this node has not
//! reached yet. Either way it is created through the [`RoundRegistry`], which makes creation
//! race-free, and it is removed from the registry once it falls out of the retention window behind the
//! latest finalized round.
//!
//! Each `Round` guards its own state with its own lock. No lock is ever held across two rounds.

pub mod registry;
pub use registry::RoundRegistry;

pub mod state;
pub use state::{FinalizingState, Phase, Round, RoundError, ShareAdmission};
