/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{PartyID, RoundNumber, TimeoutCount, VerifyingKeyBytes};

/// One party's partial BLS signature over the VRF message of `(round, timeout_count)`.
///
/// `share` is the hex form of the compressed G1 point. A share is only ever merged into a round whose
/// current timeout count equals `timeout_count`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VRFShare {
    pub round: RoundNumber,
    pub timeout_count: TimeoutCount,
    pub party: PartyID,
    /// The miner that produced the share. Used to answer lagging peers and to rank timeout votes.
    pub sender: VerifyingKeyBytes,
    pub share: String,
}

impl VRFShare {
    pub fn new(
        round: RoundNumber,
        timeout_count: TimeoutCount,
        party: PartyID,
        sender: VerifyingKeyBytes,
        share: String,
    ) -> Self {
        Self {
            round,
            timeout_count,
            party,
            sender,
            share,
        }
    }
}
