/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Threshold random beacon that seeds every round.
//!
//! # How a round gets its seed
//!
//! 1. When round `r - 1` has a seed `s`, every miner signs the message
//!    [`round_message(r, timeout_count, s)`](threshold::round_message) with its DKG key share and
//!    broadcasts the result as a [`VRFShare`].
//! 2. Receivers verify each share against the sender's public key share before merging it into round
//!    `r`.
//! 3. Once `T` shares are merged, they are [aggregated](threshold::aggregate) into the group
//!    signature, and the seed of round `r` is [derived](threshold::random_seed_from) from it.
//!
//! Since the group signature is unique for a message, every honest miner derives the same seed no
//! matter which `T` shares it happened to collect, and no coalition of fewer than `T` miners can
//! predict it before the round starts.
//!
//! # Key material and view changes
//!
//! The key material of each epoch ([`DkgKeyMaterial`]) is produced by the
//! [view change](crate::view_change) and installed into [`ThresholdBeacon`] under its own read/write
//! lock. Signing and verification take the read lock; installing new key material takes the write lock.
//!
//! # Insecure count-only mode
//!
//! [`BeaconMode::InsecureCountOnly`] disables threshold cryptography: shares are a constant, nobody
//! verifies them, a round only needs a quorum *count* of shares, and its seed is drawn from a PRNG
//! seeded with the previous round's seed. Anyone can predict every future seed, so this mode exists
//! only for test and bootstrap networks and has to be selected explicitly.

pub mod dkg;

pub mod share_cache;

pub mod threshold;

pub mod types;

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::types::{
    crypto_primitives::sha256,
    data_types::{RandomSeed, RoundNumber, TimeoutCount},
};

use self::{
    dkg::DkgKeyMaterial,
    threshold::{aggregate, random_seed_from, round_message, SignatureShare},
    types::VRFShare,
};

/// How round seeds are produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeaconMode {
    /// BLS threshold signatures over DKG key shares. The only mode fit for production.
    Threshold,
    /// No cryptography: `quorum` shares of any content start a round, and seeds are predictable.
    InsecureCountOnly { quorum: usize },
}

/// The random beacon of one miner: its mode, and the key material of every installed epoch.
pub struct ThresholdBeacon {
    mode: BeaconMode,
    // muDKG: key material keyed by the first round it applies to.
    key_material: RwLock<BTreeMap<RoundNumber, Arc<DkgKeyMaterial>>>,
}

impl ThresholdBeacon {
    pub fn new(mode: BeaconMode) -> Self {
        if let BeaconMode::InsecureCountOnly { quorum } = mode {
            log::warn!(
                "Random beacon running in insecure count-only mode (quorum {}): round seeds are predictable.",
                quorum
            );
        }
        Self {
            mode,
            key_material: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn mode(&self) -> BeaconMode {
        self.mode
    }

    /// Install `key_material` for the rounds starting at `key_material.starting_round`.
    pub fn install(&self, key_material: DkgKeyMaterial) {
        let mut installed = self.key_material.write().unwrap();
        installed.insert(key_material.starting_round, Arc::new(key_material));
    }

    /// The key material in force for `round`, if any.
    pub fn key_material(&self, round: RoundNumber) -> Option<Arc<DkgKeyMaterial>> {
        self.key_material
            .read()
            .unwrap()
            .range(..=round)
            .next_back()
            .map(|(_, key_material)| key_material.clone())
    }

    /// Drop key material that has been superseded for every round at or after `round`.
    pub fn prune_below(&self, round: RoundNumber) {
        let mut installed = self.key_material.write().unwrap();
        let in_force = installed.range(..=round).next_back().map(|(r, _)| *r);
        if let Some(in_force) = in_force {
            *installed = installed.split_off(&in_force);
        }
    }

    /// Number of shares needed to seed `round`.
    pub fn threshold(&self, round: RoundNumber) -> Result<usize, BeaconError> {
        match self.mode {
            BeaconMode::Threshold => Ok(self
                .key_material(round)
                .ok_or(BeaconError::DKGNotSet)?
                .threshold),
            BeaconMode::InsecureCountOnly { quorum } => Ok(quorum),
        }
    }

    /// Produce this miner's share for `round` at `timeout_count`, given the seed of the previous round.
    pub fn sign(
        &self,
        round: RoundNumber,
        timeout_count: TimeoutCount,
        prev_seed: RandomSeed,
    ) -> Result<String, BeaconError> {
        match self.mode {
            BeaconMode::Threshold => {
                let key_material = self.key_material(round).ok_or(BeaconError::DKGNotSet)?;
                let secret_share = key_material.secret_share().ok_or(BeaconError::DKGNotSet)?;
                let message = round_message(round, timeout_count, prev_seed);
                Ok(secret_share.sign(message.as_bytes()).to_hex())
            }
            BeaconMode::InsecureCountOnly { .. } => Ok(hex::encode(sha256(b"0chain"))),
        }
    }

    /// Check `share` against the public key share of its party, for the message of its round given the
    /// previous round's seed. Always `true` in count-only mode.
    pub fn verify_share(&self, share: &VRFShare, prev_seed: RandomSeed) -> bool {
        match self.mode {
            BeaconMode::Threshold => {
                let Some(key_material) = self.key_material(share.round) else {
                    return false;
                };
                let Some(public_key_share) = key_material.public_key_share(share.party) else {
                    return false;
                };
                let Ok(signature) = SignatureShare::from_hex(&share.share) else {
                    return false;
                };
                let message = round_message(share.round, share.timeout_count, prev_seed);
                public_key_share.verify(message.as_bytes(), &signature)
            }
            BeaconMode::InsecureCountOnly { .. } => true,
        }
    }

    /// Combine the merged shares of a round into its random seed.
    ///
    /// In threshold mode this is `random_seed_from(aggregate(shares))`. In count-only mode it is the next
    /// output of a PRNG seeded with `prev_seed`.
    pub fn random_seed(&self, shares: &[VRFShare], prev_seed: RandomSeed) -> Result<RandomSeed, BeaconError> {
        match self.mode {
            BeaconMode::Threshold => {
                let signatures = shares
                    .iter()
                    .map(|share| Ok((share.party, SignatureShare::from_hex(&share.share)?)))
                    .collect::<Result<Vec<_>, BeaconError>>()?;
                Ok(random_seed_from(&aggregate(&signatures)?))
            }
            BeaconMode::InsecureCountOnly { .. } => {
                let mut rng = StdRng::seed_from_u64(prev_seed.int() as u64);
                Ok(RandomSeed::new((rng.gen::<u64>() >> 1) as i64))
            }
        }
    }
}

/// Enumerates the different ways the beacon can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconError {
    /// No key material (or no secret share in it) is installed for the round.
    DKGNotSet,
    /// A share is not valid hex of a compressed G1 point.
    InvalidShareEncoding,
    /// A public key is not a valid compressed G2 point.
    InvalidPublicKey,
    /// Fewer shares than required were supplied.
    NotEnoughShares { have: usize, need: usize },
    /// Two shares of one aggregation come from the same party.
    DuplicateParty,
    /// DKG contributions of different thresholds were combined.
    ThresholdMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        beacon::dkg::Polynomial,
        types::data_types::{MagicBlockNumber, PartyID},
    };

    fn beacons(n: usize, threshold: usize) -> Vec<ThresholdBeacon> {
        let polynomial = Polynomial::random(threshold);
        (0..n)
            .map(|i| {
                let beacon = ThresholdBeacon::new(BeaconMode::Threshold);
                beacon.install(DkgKeyMaterial::dealt(
                    &polynomial,
                    n,
                    Some(PartyID::new(i as u32)),
                    MagicBlockNumber::new(1),
                    RoundNumber::new(1),
                ));
                beacon
            })
            .collect()
    }

    #[test]
    fn sign_without_key_material_fails() {
        let beacon = ThresholdBeacon::new(BeaconMode::Threshold);
        assert_eq!(
            beacon.sign(RoundNumber::new(5), TimeoutCount::init(), RandomSeed::new(1)),
            Err(BeaconError::DKGNotSet)
        );
    }

    #[test]
    fn shares_verify_and_seed_is_order_independent() {
        let beacons = beacons(4, 3);
        let round = RoundNumber::new(5);
        let prev_seed = RandomSeed::new(-77);

        let shares: Vec<VRFShare> = beacons
            .iter()
            .enumerate()
            .map(|(i, b)| {
                VRFShare::new(
                    round,
                    TimeoutCount::init(),
                    PartyID::new(i as u32),
                    [i as u8; 32],
                    b.sign(round, TimeoutCount::init(), prev_seed).unwrap(),
                )
            })
            .collect();
        for share in &shares {
            assert!(beacons[0].verify_share(share, prev_seed));
        }

        // A share checked against the wrong previous seed does not verify.
        assert!(!beacons[0].verify_share(&shares[1], RandomSeed::new(1)));

        let forward = beacons[0].random_seed(&shares[0..3], prev_seed).unwrap();
        let mut reversed = shares[1..4].to_vec();
        reversed.reverse();
        let backward = beacons[2].random_seed(&reversed, prev_seed).unwrap();
        assert_eq!(forward, backward);
        assert!(!forward.is_zero());
    }

    #[test]
    fn key_material_is_selected_by_starting_round() {
        let beacon = ThresholdBeacon::new(BeaconMode::Threshold);
        let first = Polynomial::random(2);
        let second = Polynomial::random(3);
        beacon.install(DkgKeyMaterial::dealt(&first, 3, None, MagicBlockNumber::new(1), RoundNumber::new(1)));
        beacon.install(DkgKeyMaterial::dealt(&second, 4, None, MagicBlockNumber::new(2), RoundNumber::new(100)));

        assert!(beacon.key_material(RoundNumber::new(0)).is_none());
        assert_eq!(beacon.threshold(RoundNumber::new(99)), Ok(2));
        assert_eq!(beacon.threshold(RoundNumber::new(100)), Ok(3));

        beacon.prune_below(RoundNumber::new(150));
        assert!(beacon.key_material(RoundNumber::new(99)).is_none());
        assert_eq!(beacon.threshold(RoundNumber::new(150)), Ok(3));
    }

    #[test]
    fn count_only_mode_is_deterministic_in_previous_seed() {
        let beacon = ThresholdBeacon::new(BeaconMode::InsecureCountOnly { quorum: 2 });
        let a = beacon.random_seed(&[], RandomSeed::new(10)).unwrap();
        let b = beacon.random_seed(&[], RandomSeed::new(10)).unwrap();
        let c = beacon.random_seed(&[], RandomSeed::new(11)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.int() >= 0);
    }
}
