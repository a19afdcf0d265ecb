/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Storage for VRF shares that arrived before they could be merged.
//!
//! A share can arrive too early in two ways: its round is ahead of the current round, or its timeout
//! count is ahead of its round's timeout count (the sender restarted the round first). In both cases
//! the share is parked here, independently of the lifetime of any `Round`, and replayed once the
//! round catches up.

use std::{collections::BTreeMap, sync::Mutex};

use crate::types::data_types::{RoundNumber, TimeoutCount};

use super::types::VRFShare;

#[derive(Default)]
pub struct VRFShareCache {
    shares: Mutex<BTreeMap<RoundNumber, Vec<VRFShare>>>,
}

impl VRFShareCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `share`. Each party has at most one share parked per round, the one with the highest timeout
    /// count. Returns `false` if the party already has a share parked for the round with the same or a
    /// higher timeout count.
    pub fn add(&self, share: VRFShare) -> bool {
        let mut shares = self.shares.lock().unwrap();
        let round_shares = shares.entry(share.round).or_default();
        match round_shares.iter_mut().find(|s| s.party == share.party) {
            Some(parked) if parked.timeout_count >= share.timeout_count => false,
            Some(parked) => {
                *parked = share;
                true
            }
            None => {
                round_shares.push(share);
                true
            }
        }
    }

    /// Remove and return the parked shares of `round` that match `timeout_count`. Shares for other
    /// timeout counts stay parked, except those for lower counts, which can never be merged and are
    /// dropped.
    pub fn take(&self, round: RoundNumber, timeout_count: TimeoutCount) -> Vec<VRFShare> {
        let mut shares = self.shares.lock().unwrap();
        let Some(round_shares) = shares.get_mut(&round) else {
            return Vec::new();
        };

        let (matching, rest): (Vec<VRFShare>, Vec<VRFShare>) = round_shares
            .drain(..)
            .filter(|s| s.timeout_count >= timeout_count)
            .partition(|s| s.timeout_count == timeout_count);
        if rest.is_empty() {
            shares.remove(&round);
        } else {
            *round_shares = rest;
        }
        matching
    }

    /// Drop every share of a round lower than `round`.
    pub fn prune_below(&self, round: RoundNumber) {
        let mut shares = self.shares.lock().unwrap();
        *shares = shares.split_off(&round);
    }
}
