/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The distributed key generation that runs at an epoch boundary.
//!
//! The miners of the next epoch jointly generate the threshold key material the
//! [beacon](crate::beacon) will use for the epoch's rounds. Each miner walks the same phases:
//! 1. **Start**: sample a random secret polynomial of degree `T - 1`.
//! 2. **Contribute**: publish the commitments to the polynomial, and collect everyone else's.
//! 3. **Share**: privately send each party the evaluation of the polynomial at that party's x
//!    coordinate, and Feldman-verify the evaluations received against their senders' commitments.
//! 4. **Publish**: once every party's contribution and share is in, sum them into this miner's
//!    [`DkgKeyMaterial`].
//! 5. **Wait**: install the key material into the beacon for the epoch's first round.
//!
//! How contributions and shares travel between miners is up to the caller, e.g., through the chain's
//! own transactions. [`ViewChangeCoordinator`] only enforces that the phases happen in order and that
//! nothing unverified makes it into the key material.

use std::{
    collections::BTreeMap,
    sync::{mpsc::Sender, Arc, Mutex},
    time::SystemTime,
};

use ed25519_dalek::VerifyingKey;

use crate::{
    beacon::{
        dkg::{Commitments, DkgKeyMaterial, Polynomial},
        threshold::SecretKeyShare,
        BeaconError, ThresholdBeacon,
    },
    events::{Event, InstallDKGEvent},
    types::{
        data_types::{MagicBlockNumber, PartyID, RoundNumber},
        miner_set::MinerSet,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViewChangePhase {
    Start,
    Contribute,
    Share,
    Publish,
    Wait,
}

struct ViewChangeProcess {
    phase: ViewChangePhase,
    n: usize,
    me: PartyID,
    magic_block_number: MagicBlockNumber,
    starting_round: RoundNumber,
    polynomial: Polynomial,
    contributions: BTreeMap<PartyID, Commitments>,
    received_shares: BTreeMap<PartyID, SecretKeyShare>,
    key_material: Option<DkgKeyMaterial>,
}

impl ViewChangeProcess {
    fn expect_phase(&self, expected: ViewChangePhase) -> Result<(), ViewChangeError> {
        if self.phase != expected {
            return Err(ViewChangeError::OutOfOrder {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    fn check_party(&self, party: PartyID) -> Result<(), ViewChangeError> {
        if (party.int() as usize) >= self.n {
            return Err(ViewChangeError::UnknownParty(party));
        }
        Ok(())
    }
}

/// Runs this miner's side of one epoch's key generation at a time.
pub struct ViewChangeCoordinator {
    me: VerifyingKey,
    beacon: Arc<ThresholdBeacon>,
    process: Mutex<Option<ViewChangeProcess>>,
    event_publisher: Option<Sender<Event>>,
}

impl ViewChangeCoordinator {
    pub fn new(me: VerifyingKey, beacon: Arc<ThresholdBeacon>, event_publisher: Option<Sender<Event>>) -> Self {
        Self {
            me,
            beacon,
            process: Mutex::new(None),
            event_publisher,
        }
    }

    /// The phase of the key generation in progress, if any.
    pub fn phase(&self) -> Option<ViewChangePhase> {
        self.process.lock().unwrap().as_ref().map(|process| process.phase)
    }

    /// Start generating key material for the epoch of `miners` that begins at `starting_round`. Replaces
    /// any key generation in progress.
    pub fn start(
        &self,
        miners: &MinerSet,
        threshold: usize,
        magic_block_number: MagicBlockNumber,
        starting_round: RoundNumber,
    ) -> Result<(), ViewChangeError> {
        let me = miners.party_id(&self.me).ok_or(ViewChangeError::NotAParty)?;
        if threshold == 0 || threshold > miners.len() {
            return Err(ViewChangeError::InvalidThreshold {
                threshold,
                n: miners.len(),
            });
        }

        *self.process.lock().unwrap() = Some(ViewChangeProcess {
            phase: ViewChangePhase::Start,
            n: miners.len(),
            me,
            magic_block_number,
            starting_round,
            polynomial: Polynomial::random(threshold),
            contributions: BTreeMap::new(),
            received_shares: BTreeMap::new(),
            key_material: None,
        });
        Ok(())
    }

    /// Move to the contribute phase and return this miner's commitments, to be sent to every party.
    pub fn contribute(&self) -> Result<Commitments, ViewChangeError> {
        let mut process = self.process.lock().unwrap();
        let process = process.as_mut().ok_or(ViewChangeError::NotStarted)?;
        process.expect_phase(ViewChangePhase::Start)?;

        let commitments = process.polynomial.commitments();
        process.contributions.insert(process.me, commitments.clone());
        process.phase = ViewChangePhase::Contribute;
        Ok(commitments)
    }

    /// Record the commitments of `party`. Accepted until the shares are published.
    pub fn add_contribution(&self, party: PartyID, commitments: Commitments) -> Result<(), ViewChangeError> {
        let mut process = self.process.lock().unwrap();
        let process = process.as_mut().ok_or(ViewChangeError::NotStarted)?;
        if !matches!(process.phase, ViewChangePhase::Contribute | ViewChangePhase::Share) {
            return Err(ViewChangeError::OutOfOrder {
                expected: ViewChangePhase::Contribute,
                actual: process.phase,
            });
        }
        process.check_party(party)?;
        if commitments.threshold() != process.polynomial.threshold() {
            return Err(ViewChangeError::Beacon(BeaconError::ThresholdMismatch));
        }

        process.contributions.insert(party, commitments);
        Ok(())
    }

    /// Move to the share phase and return the secret share of every other party, each to be sent to its
    /// party privately.
    pub fn share(&self) -> Result<Vec<(PartyID, SecretKeyShare)>, ViewChangeError> {
        let mut process = self.process.lock().unwrap();
        let process = process.as_mut().ok_or(ViewChangeError::NotStarted)?;
        process.expect_phase(ViewChangePhase::Contribute)?;

        let own_share = process.polynomial.secret_share_for(process.me);
        process.received_shares.insert(process.me, own_share);
        process.phase = ViewChangePhase::Share;

        Ok((0..process.n as u32)
            .map(PartyID::new)
            .filter(|party| *party != process.me)
            .map(|party| (party, process.polynomial.secret_share_for(party)))
            .collect())
    }

    /// Record the secret share `from` sent this miner, after checking it against `from`'s commitments.
    pub fn add_share(&self, from: PartyID, share: SecretKeyShare) -> Result<(), ViewChangeError> {
        let mut process = self.process.lock().unwrap();
        let process = process.as_mut().ok_or(ViewChangeError::NotStarted)?;
        process.expect_phase(ViewChangePhase::Share)?;
        process.check_party(from)?;

        let commitments = process
            .contributions
            .get(&from)
            .ok_or(ViewChangeError::MissingContribution(from))?;
        if !commitments.verify_share(process.me, &share) {
            return Err(ViewChangeError::InvalidShare(from));
        }

        process.received_shares.insert(from, share);
        Ok(())
    }

    /// Sum every contribution and share into this miner's key material for the epoch.
    ///
    /// Needs the contribution and the share of every party.
    pub fn publish(&self) -> Result<DkgKeyMaterial, ViewChangeError> {
        let mut process = self.process.lock().unwrap();
        let process = process.as_mut().ok_or(ViewChangeError::NotStarted)?;
        process.expect_phase(ViewChangePhase::Share)?;

        let have = process.contributions.len().min(process.received_shares.len());
        if have < process.n {
            return Err(ViewChangeError::MissingContributions {
                have,
                need: process.n,
            });
        }

        let commitments = Commitments::sum(process.contributions.values()).map_err(ViewChangeError::Beacon)?;
        let secret_share = SecretKeyShare::sum(process.received_shares.values());
        let key_material = DkgKeyMaterial::new(
            process.n,
            process.magic_block_number,
            process.starting_round,
            &commitments,
            Some(secret_share),
        );

        process.key_material = Some(key_material.clone());
        process.phase = ViewChangePhase::Publish;
        Ok(key_material)
    }

    /// Install the published key material into the beacon. From the epoch's starting round on, beacon
    /// shares are signed and verified with it.
    pub fn wait(&self) -> Result<(), ViewChangeError> {
        let mut process = self.process.lock().unwrap();
        let process = process.as_mut().ok_or(ViewChangeError::NotStarted)?;
        process.expect_phase(ViewChangePhase::Publish)?;
        let key_material = process.key_material.take().ok_or(ViewChangeError::NotStarted)?;

        Event::publish(
            &self.event_publisher,
            Event::InstallDKG(InstallDKGEvent {
                timestamp: SystemTime::now(),
                magic_block_number: key_material.magic_block_number,
                starting_round: key_material.starting_round,
                threshold: key_material.threshold,
                n: key_material.n,
            }),
        );
        self.beacon.install(key_material);
        process.phase = ViewChangePhase::Wait;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChangeError {
    NotStarted,
    /// This miner is not a miner of the next epoch.
    NotAParty,
    InvalidThreshold { threshold: usize, n: usize },
    OutOfOrder {
        expected: ViewChangePhase,
        actual: ViewChangePhase,
    },
    UnknownParty(PartyID),
    /// A share arrived from a party whose commitments are unknown.
    MissingContribution(PartyID),
    /// A share does not match its sender's commitments.
    InvalidShare(PartyID),
    MissingContributions { have: usize, need: usize },
    Beacon(BeaconError),
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::{
        beacon::{threshold::aggregate, BeaconMode},
        types::data_types::PartyID,
    };

    fn coordinators(n: usize) -> (MinerSet, Vec<ViewChangeCoordinator>) {
        let keys: Vec<VerifyingKey> = (0..n)
            .map(|_| SigningKey::generate(&mut OsRng).verifying_key())
            .collect();
        let miners: MinerSet = keys.iter().copied().collect();
        let coordinators = keys
            .into_iter()
            .map(|key| ViewChangeCoordinator::new(key, Arc::new(ThresholdBeacon::new(BeaconMode::Threshold)), None))
            .collect();
        (miners, coordinators)
    }

    fn party_of(miners: &MinerSet, coordinator: &ViewChangeCoordinator) -> PartyID {
        miners.party_id(&coordinator.me).unwrap()
    }

    #[test]
    fn full_key_generation_installs_consistent_material() {
        let n = 4;
        let threshold = 3;
        let (miners, coordinators) = coordinators(n);
        let starting_round = RoundNumber::new(100);

        for coordinator in &coordinators {
            coordinator
                .start(&miners, threshold, MagicBlockNumber::new(2), starting_round)
                .unwrap();
        }

        let contributions: Vec<(PartyID, Commitments)> = coordinators
            .iter()
            .map(|c| (party_of(&miners, c), c.contribute().unwrap()))
            .collect();
        for coordinator in &coordinators {
            for (party, commitments) in &contributions {
                coordinator.add_contribution(*party, commitments.clone()).unwrap();
            }
        }

        let shares: Vec<(PartyID, Vec<(PartyID, SecretKeyShare)>)> = coordinators
            .iter()
            .map(|c| (party_of(&miners, c), c.share().unwrap()))
            .collect();
        for (from, outgoing) in shares {
            for (to, share) in outgoing {
                let recipient = coordinators
                    .iter()
                    .find(|c| party_of(&miners, c) == to)
                    .unwrap();
                recipient.add_share(from, share).unwrap();
            }
        }

        for coordinator in &coordinators {
            coordinator.publish().unwrap();
            coordinator.wait().unwrap();
            assert_eq!(coordinator.phase(), Some(ViewChangePhase::Wait));
        }

        // Any `threshold` parties produce a signature that verifies under every miner's group key.
        let message = b"epoch 2";
        let signatures: Vec<_> = coordinators
            .iter()
            .take(threshold)
            .map(|c| {
                let material = c.beacon.key_material(starting_round).unwrap();
                (party_of(&miners, c), material.secret_share().unwrap().sign(message))
            })
            .collect();
        let group_signature = aggregate(&signatures).unwrap();
        for coordinator in &coordinators {
            let material = coordinator.beacon.key_material(starting_round).unwrap();
            assert!(material.group_public_key().verify(message, &group_signature));
        }
    }

    #[test]
    fn phases_cannot_be_skipped() {
        let (miners, coordinators) = coordinators(3);
        let coordinator = &coordinators[0];
        assert_eq!(coordinator.share().unwrap_err(), ViewChangeError::NotStarted);

        coordinator
            .start(&miners, 2, MagicBlockNumber::new(1), RoundNumber::new(10))
            .unwrap();
        assert_eq!(
            coordinator.share().unwrap_err(),
            ViewChangeError::OutOfOrder {
                expected: ViewChangePhase::Contribute,
                actual: ViewChangePhase::Start,
            }
        );

        coordinator.contribute().unwrap();
        coordinator.share().unwrap();
        assert_eq!(
            coordinator.publish().unwrap_err(),
            ViewChangeError::MissingContributions { have: 1, need: 3 }
        );
    }

    #[test]
    fn share_that_does_not_match_commitments_is_rejected() {
        let (miners, coordinators) = coordinators(2);
        for coordinator in &coordinators {
            coordinator
                .start(&miners, 2, MagicBlockNumber::new(1), RoundNumber::new(10))
                .unwrap();
        }
        let a = &coordinators[0];
        let b = &coordinators[1];
        let party_a = party_of(&miners, a);
        let party_b = party_of(&miners, b);

        let commitments_b = b.contribute().unwrap();
        a.contribute().unwrap();
        a.add_contribution(party_b, commitments_b).unwrap();
        a.share().unwrap();

        // A share meant for `b` is not a valid share for `a`.
        let forged = Polynomial::random(2).secret_share_for(party_a);
        assert_eq!(a.add_share(party_b, forged).unwrap_err(), ViewChangeError::InvalidShare(party_b));
    }
}
