/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that store information about the miners of an epoch.

use borsh::{BorshDeserialize, BorshSerialize};
use std::slice;

use super::data_types::{PartyID, VerifyingKeyBytes};

pub use ed25519_dalek::VerifyingKey;

/// Stores the identities of the miners of an epoch.
///
/// ## Ordering of miners
///
/// `MinerSet` internally maintains the list of miners in ascending order of their `VerifyingKey`s,
/// and avails the methods [`miners`](MinerSet::miners) and [`position`](MinerSet::position) that users
/// can use to get them in this order. A miner's position is also its DKG [`PartyID`], and the index
/// into the seed-derived rank permutation of every round of the epoch.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MinerSet {
    // The verifying keys of miners are included here in ascending order.
    miners: Vec<VerifyingKey>,
}

impl MinerSet {
    /// Create an empty miner set.
    pub fn new() -> MinerSet {
        Self { miners: Vec::new() }
    }

    /// Put a `miner` into the miner set, placing them in a position that preserves the
    /// [ordering of miners](Self#ordering-of-miners). Does nothing if `miner` is already present.
    pub fn put(&mut self, miner: &VerifyingKey) {
        let miner_bytes = miner.to_bytes();
        if let Err(insert_pos) = self
            .miners
            .binary_search_by(|m| m.to_bytes().cmp(&miner_bytes))
        {
            self.miners.insert(insert_pos, *miner);
        }
    }

    /// Remove `miner` from the miner set, returning whether it was present.
    pub fn remove(&mut self, miner: &VerifyingKey) -> bool {
        match self.position(miner) {
            Some(pos) => {
                self.miners.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Check whether the miner set contains `miner`.
    pub fn contains(&self, miner: &VerifyingKey) -> bool {
        self.position(miner).is_some()
    }

    /// Check whether the miner set contains the miner whose verifying key bytes are `miner`.
    pub fn contains_bytes(&self, miner: &VerifyingKeyBytes) -> bool {
        self.position_of_bytes(miner).is_some()
    }

    /// Get an iterator through miners' verifying keys which walks through them in ascending order.
    pub fn miners(&self) -> slice::Iter<VerifyingKey> {
        self.miners.iter()
    }

    /// Get the miner at `pos` in the [sorted order](Self#ordering-of-miners).
    pub fn get(&self, pos: usize) -> Option<&VerifyingKey> {
        self.miners.get(pos)
    }

    /// Get the number of miners currently in the miner set.
    pub fn len(&self) -> usize {
        self.miners.len()
    }

    /// Check whether the miner set is empty (i.e., `self.len() == 0`).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the index of the given `miner` in the [sorted order](Self#ordering-of-miners) of
    /// `VerifyingKey`s in the miner set, if it is actually in the miner set.
    pub fn position(&self, miner: &VerifyingKey) -> Option<usize> {
        self.position_of_bytes(&miner.to_bytes())
    }

    /// Like [`position`](Self::position), but takes the raw bytes of the verifying key.
    pub fn position_of_bytes(&self, miner: &VerifyingKeyBytes) -> Option<usize> {
        self.miners
            .binary_search_by(|m| m.to_bytes().cmp(miner))
            .ok()
    }

    /// Get the DKG party id of `miner`, which is its position in the miner set.
    pub fn party_id(&self, miner: &VerifyingKey) -> Option<PartyID> {
        self.position(miner).map(|pos| PartyID::new(pos as u32))
    }

    /// Compute the number of verification tickets a block must collect to be notarized, given the
    /// `threshold_by_count` percentage. The result is `ceil(len * threshold_by_count / 100)`.
    ///
    /// This depends on the size of the miner set, so it must be recomputed whenever the epoch changes.
    pub fn notarization_threshold(&self, threshold_by_count: u32) -> usize {
        (self.len() * threshold_by_count as usize).div_ceil(100)
    }
}

impl FromIterator<VerifyingKey> for MinerSet {
    fn from_iter<I: IntoIterator<Item = VerifyingKey>>(iter: I) -> Self {
        let mut miner_set = MinerSet::new();
        iter.into_iter().for_each(|miner| miner_set.put(&miner));
        miner_set
    }
}

/// Intermediate representation of [`MinerSet`] for safe serialization and deserialization.
///
/// ## Rationale
///
/// `MinerSet` internally contains [`ed25519_dalek::VerifyingKey`], which does not implement the Borsh
/// traits. This type replaces `VerifyingKey` with `VerifyingKeyBytes`, and so is straightforward to
/// serialize. Instances of this type are not guaranteed to contain valid Ed25519 verifying keys, and
/// therefore conversion into `MinerSet` using `TryFrom` is fallible.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct MinerSetBytes {
    miners: Vec<VerifyingKeyBytes>,
}

impl TryFrom<MinerSetBytes> for MinerSet {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(value: MinerSetBytes) -> Result<Self, Self::Error> {
        let mut miner_set = MinerSet::new();
        for miner in value.miners.iter() {
            miner_set.put(&VerifyingKey::from_bytes(miner)?);
        }
        Ok(miner_set)
    }
}

impl From<&MinerSet> for MinerSetBytes {
    fn from(value: &MinerSet) -> Self {
        MinerSetBytes {
            miners: value.miners.iter().map(|m| m.to_bytes()).collect(),
        }
    }
}
