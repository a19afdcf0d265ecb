/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Distributed key generation (DKG) material for the threshold beacon.
//!
//! Every miner of an epoch contributes a random polynomial of degree `T - 1`. It publishes the G2
//! commitments to the polynomial's coefficients and privately sends every other party the evaluation of
//! the polynomial at that party's x coordinate. A party can check a received evaluation against the
//! sender's commitments (Feldman verification). Summing every contribution gives:
//! - each party's secret key share (the sum of the evaluations it received),
//! - every party's public key share (the sum of the commitments, evaluated at the party's x), and
//! - the group public key (the sum of the constant-term commitments).
//!
//! The result is a [`DkgKeyMaterial`], which is installed into the
//! [`ThresholdBeacon`](super::ThresholdBeacon) for the rounds of the new epoch.

use bls12_381_plus::{G2Projective, Scalar};
use ff::Field;
use group::Curve;
use rand_core::OsRng;

use crate::types::data_types::{MagicBlockNumber, PartyID, RoundNumber};

use super::{
    threshold::{PublicKeyShare, SecretKeyShare},
    BeaconError,
};

/// A secret polynomial of degree `T - 1` over the BLS12-381 scalar field.
#[derive(Clone)]
pub struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Sample a random polynomial whose shares can be combined by any `threshold` parties.
    pub fn random(threshold: usize) -> Polynomial {
        let degree_plus_one = threshold.max(1);
        Polynomial {
            coefficients: (0..degree_plus_one).map(|_| Scalar::random(OsRng)).collect(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.coefficients.len()
    }

    fn evaluate(&self, x: Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
    }

    /// The evaluation of this polynomial at `party`'s x coordinate.
    pub fn secret_share_for(&self, party: PartyID) -> SecretKeyShare {
        SecretKeyShare(self.evaluate(Scalar::from(party.x())))
    }

    /// G2 commitments to each coefficient, constant term first.
    pub fn commitments(&self) -> Commitments {
        Commitments(
            self.coefficients
                .iter()
                .map(|coefficient| G2Projective::generator() * coefficient)
                .collect(),
        )
    }

    /// The public key of the constant term, i.e., the group public key if this were the only
    /// contribution.
    pub fn group_public_key(&self) -> PublicKeyShare {
        self.commitments().group_public_key()
    }
}

/// Public commitments to a [`Polynomial`], or the coefficient-wise sum of several parties'
/// commitments.
#[derive(Clone, Debug, PartialEq)]
pub struct Commitments(Vec<G2Projective>);

impl Commitments {
    /// Sum commitments coefficient by coefficient. All contributions must have the same threshold.
    pub fn sum<'a>(contributions: impl IntoIterator<Item = &'a Commitments>) -> Result<Commitments, BeaconError> {
        let mut sum: Option<Vec<G2Projective>> = None;
        for contribution in contributions {
            sum = Some(match sum {
                None => contribution.0.clone(),
                Some(acc) if acc.len() == contribution.0.len() => acc
                    .iter()
                    .zip(contribution.0.iter())
                    .map(|(a, b)| a + b)
                    .collect(),
                Some(_) => return Err(BeaconError::ThresholdMismatch),
            });
        }
        sum.map(Commitments).ok_or(BeaconError::DKGNotSet)
    }

    pub fn threshold(&self) -> usize {
        self.0.len()
    }

    /// `Σ_k C_k · x^k`, the public key share of `party`.
    pub fn public_key_share_for(&self, party: PartyID) -> PublicKeyShare {
        let x = Scalar::from(party.x());
        let evaluation = self
            .0
            .iter()
            .rev()
            .fold(G2Projective::identity(), |acc, commitment| acc * x + commitment);
        PublicKeyShare(evaluation.to_affine())
    }

    pub fn group_public_key(&self) -> PublicKeyShare {
        PublicKeyShare(
            self.0
                .first()
                .copied()
                .unwrap_or_else(G2Projective::identity)
                .to_affine(),
        )
    }

    /// Feldman verification: check that `share` is the evaluation at `party` of the polynomial these
    /// commitments commit to.
    pub fn verify_share(&self, party: PartyID, share: &SecretKeyShare) -> bool {
        share.public_key_share() == self.public_key_share_for(party)
    }
}

/// The threshold key material in force for the rounds of one epoch.
#[derive(Clone, Debug)]
pub struct DkgKeyMaterial {
    /// Number of shares needed to produce a group signature.
    pub threshold: usize,
    /// Number of parties in the epoch.
    pub n: usize,
    pub magic_block_number: MagicBlockNumber,
    /// First round the key material applies to.
    pub starting_round: RoundNumber,
    secret_share: Option<SecretKeyShare>,
    public_key_shares: Vec<PublicKeyShare>,
    group_public_key: PublicKeyShare,
}

impl DkgKeyMaterial {
    /// Build key material from the summed commitments of every contribution, plus this party's summed
    /// secret share (`None` if this node is not a party of the epoch).
    pub fn new(
        n: usize,
        magic_block_number: MagicBlockNumber,
        starting_round: RoundNumber,
        commitments: &Commitments,
        secret_share: Option<SecretKeyShare>,
    ) -> DkgKeyMaterial {
        DkgKeyMaterial {
            threshold: commitments.threshold(),
            n,
            magic_block_number,
            starting_round,
            secret_share,
            public_key_shares: (0..n)
                .map(|i| commitments.public_key_share_for(PartyID::new(i as u32)))
                .collect(),
            group_public_key: commitments.group_public_key(),
        }
    }

    /// Key material produced by a single trusted dealer. Only suitable for bootstrapping and tests.
    pub fn dealt(
        polynomial: &Polynomial,
        n: usize,
        me: Option<PartyID>,
        magic_block_number: MagicBlockNumber,
        starting_round: RoundNumber,
    ) -> DkgKeyMaterial {
        DkgKeyMaterial::new(
            n,
            magic_block_number,
            starting_round,
            &polynomial.commitments(),
            me.map(|party| polynomial.secret_share_for(party)),
        )
    }

    pub fn secret_share(&self) -> Option<&SecretKeyShare> {
        self.secret_share.as_ref()
    }

    pub fn public_key_share(&self, party: PartyID) -> Option<&PublicKeyShare> {
        self.public_key_shares.get(party.int() as usize)
    }

    pub fn group_public_key(&self) -> &PublicKeyShare {
        &self.group_public_key
    }
}
