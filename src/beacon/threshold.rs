/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! BLS12-381 threshold signature primitives.
//!
//! Signatures live on G1 (48 bytes compressed) and public keys on G2 (96 bytes compressed). A key
//! share is the evaluation of the epoch's (secret) DKG polynomial at the party's x coordinate, so any
//! `T` signature shares over the same message can be Lagrange-interpolated at `x = 0` into the
//! signature of the group secret. That group signature is unique for a given message, which is what
//! makes it usable as a random beacon.

use std::ops::Neg;

use bls12_381_plus::{
    multi_miller_loop, G1Affine, G1Projective, G2Affine, G2Prepared, G2Projective, Gt, Scalar,
};
use group::{cofactor::CofactorGroup, Curve, Group};

use crate::types::{
    crypto_primitives::{CryptoHasher, Digest},
    data_types::{PartyID, RandomSeed, RoundNumber, TimeoutCount},
};

use super::BeaconError;

/// Domain separation tag for hashing VRF messages onto G1.
const VRF_DST: &[u8] = b"MINER_ROUNDS_BLS_VRF_V1";

/// A party's share of the epoch's group secret key.
#[derive(Clone, PartialEq)]
pub struct SecretKeyShare(pub(crate) Scalar);

impl SecretKeyShare {
    /// The public key share corresponding to this secret key share.
    pub fn public_key_share(&self) -> PublicKeyShare {
        PublicKeyShare((G2Projective::generator() * self.0).to_affine())
    }

    /// Sum of several shares, e.g., the evaluations one party received from every DKG contribution.
    pub fn sum<'a>(shares: impl IntoIterator<Item = &'a SecretKeyShare>) -> SecretKeyShare {
        SecretKeyShare(shares.into_iter().fold(Scalar::ZERO, |acc, share| acc + share.0))
    }

    /// Sign `message` with this key share.
    pub fn sign(&self, message: &[u8]) -> SignatureShare {
        SignatureShare((hash_to_g1(message) * self.0).to_affine())
    }
}

impl std::fmt::Debug for SecretKeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKeyShare(..)")
    }
}

/// A public key on G2. Used both for a party's public key share and for the group public key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PublicKeyShare(pub(crate) G2Affine);

impl PublicKeyShare {
    /// Check `e(signature, -g2) · e(H(message), pk) == 1`.
    pub fn verify(&self, message: &[u8], signature: &SignatureShare) -> bool {
        let h = hash_to_g1(message).to_affine();
        let g2_neg_prepared = G2Prepared::from(G2Affine::generator().neg());
        let pk_prepared = G2Prepared::from(self.0);

        let result = multi_miller_loop(&[(&signature.0, &g2_neg_prepared), (&h, &pk_prepared)])
            .final_exponentiation();

        result == Gt::identity()
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_compressed()
    }

    pub fn from_bytes(bytes: &[u8; 96]) -> Result<Self, BeaconError> {
        let point: Option<G2Affine> = G2Affine::from_compressed(bytes).into();
        match point {
            Some(point) if !bool::from(point.is_identity()) => Ok(PublicKeyShare(point)),
            _ => Err(BeaconError::InvalidPublicKey),
        }
    }
}

/// A signature on G1: either one party's share, or (after [`aggregate`]) the group signature.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignatureShare(pub(crate) G1Affine);

/// The signature of the group secret, produced by interpolating `T` [`SignatureShare`]s.
pub type GroupSignature = SignatureShare;

impl SignatureShare {
    /// Lowercase hex of the 48-byte compressed point. This is the form shares travel in.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_compressed())
    }

    pub fn from_hex(share: &str) -> Result<Self, BeaconError> {
        let bytes = hex::decode(share).map_err(|_| BeaconError::InvalidShareEncoding)?;
        let bytes: [u8; 48] = bytes
            .try_into()
            .map_err(|_| BeaconError::InvalidShareEncoding)?;
        let point: Option<G1Affine> = G1Affine::from_compressed(&bytes).into();
        point
            .map(SignatureShare)
            .ok_or(BeaconError::InvalidShareEncoding)
    }
}

/// Build the message that the VRF shares of `round` at `timeout_count` sign: the decimal round
/// number, the decimal timeout count and the signed hex of the previous round's seed, concatenated.
pub fn round_message(round: RoundNumber, timeout_count: TimeoutCount, prev_seed: RandomSeed) -> String {
    format!("{}{}{}", round, timeout_count, prev_seed.to_hex())
}

/// Interpolate `shares` at `x = 0`.
///
/// Shares are sorted by party first, so the result does not depend on arrival order. The caller must
/// pass at least `T` shares from distinct parties; with more than `T` valid shares the result is the
/// same as with any `T` of them.
pub fn aggregate(shares: &[(PartyID, SignatureShare)]) -> Result<GroupSignature, BeaconError> {
    if shares.is_empty() {
        return Err(BeaconError::NotEnoughShares { have: 0, need: 1 });
    }

    let mut shares = shares.to_vec();
    shares.sort_by_key(|(party, _)| *party);
    if shares.windows(2).any(|pair| pair[0].0 == pair[1].0) {
        return Err(BeaconError::DuplicateParty);
    }

    let xs: Vec<Scalar> = shares.iter().map(|(party, _)| Scalar::from(party.x())).collect();
    let mut group_signature = G1Projective::identity();
    for (i, (_, share)) in shares.iter().enumerate() {
        let coefficient = lagrange_coefficient_at_zero(&xs, i)?;
        group_signature += G1Projective::from(share.0) * coefficient;
    }

    Ok(SignatureShare(group_signature.to_affine()))
}

/// Derive a round's random seed from the group signature of its VRF shares: the first 8 bytes of the
/// SHA256 of the signature's hex form, read as a big-endian `u64` and reinterpreted as `i64`.
pub fn random_seed_from(group_signature: &GroupSignature) -> RandomSeed {
    let mut hasher = CryptoHasher::new();
    hasher.update(group_signature.to_hex().as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();

    let mut high = [0u8; 8];
    high.copy_from_slice(&digest[0..8]);
    RandomSeed::new(u64::from_be_bytes(high) as i64)
}

/// `λ_i(0) = Π_{j≠i} x_j / (x_j − x_i)`.
fn lagrange_coefficient_at_zero(xs: &[Scalar], i: usize) -> Result<Scalar, BeaconError> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for (j, x_j) in xs.iter().enumerate() {
        if j == i {
            continue;
        }
        numerator *= x_j;
        denominator *= *x_j - xs[i];
    }
    let inverse: Option<Scalar> = denominator.invert().into();
    inverse
        .map(|inverse| numerator * inverse)
        .ok_or(BeaconError::DuplicateParty)
}

/// Hash `message` onto G1 by try-and-increment: candidate x coordinates are drawn from SHA256 until one
/// decompresses onto the curve, and the point is then multiplied by the cofactor into the prime order
/// subgroup.
pub(crate) fn hash_to_g1(message: &[u8]) -> G1Projective {
    let mut counter: u32 = 0;
    loop {
        let mut hasher = CryptoHasher::new();
        hasher.update(VRF_DST);
        hasher.update(counter.to_be_bytes());
        hasher.update(message);
        let first: [u8; 32] = hasher.finalize().into();

        let mut hasher = CryptoHasher::new();
        hasher.update(first);
        hasher.update(VRF_DST);
        let second: [u8; 32] = hasher.finalize().into();

        let mut candidate = [0u8; 48];
        candidate[..32].copy_from_slice(&first);
        candidate[32..].copy_from_slice(&second[..16]);
        // Compression flag set, infinity and sign flags cleared.
        candidate[0] = (candidate[0] & 0x1f) | 0x80;

        let point: Option<G1Affine> = G1Affine::from_compressed_unchecked(&candidate).into();
        if let Some(point) = point {
            let point = G1Projective::from(point).clear_cofactor();
            if !bool::from(point.is_identity()) {
                return point;
            }
        }
        counter = counter.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::dkg::Polynomial;

    fn shares_of(polynomial: &Polynomial, parties: &[u32], message: &[u8]) -> Vec<(PartyID, SignatureShare)> {
        parties
            .iter()
            .map(|p| {
                let party = PartyID::new(*p);
                (party, polynomial.secret_share_for(party).sign(message))
            })
            .collect()
    }

    #[test]
    fn share_verifies_only_under_its_own_key_and_message() {
        let polynomial = Polynomial::random(3);
        let alice = polynomial.secret_share_for(PartyID::new(0));
        let bob = polynomial.secret_share_for(PartyID::new(1));

        let share = alice.sign(b"5");
        assert!(alice.public_key_share().verify(b"5", &share));
        assert!(!bob.public_key_share().verify(b"5", &share));
        assert!(!alice.public_key_share().verify(b"6", &share));
    }

    #[test]
    fn any_threshold_subset_aggregates_to_the_group_signature() {
        let polynomial = Polynomial::random(3);
        let message = round_message(RoundNumber::new(5), TimeoutCount::init(), RandomSeed::new(99));

        let a = aggregate(&shares_of(&polynomial, &[0, 1, 2], message.as_bytes())).unwrap();
        let b = aggregate(&shares_of(&polynomial, &[3, 1, 0], message.as_bytes())).unwrap();
        let c = aggregate(&shares_of(&polynomial, &[2, 3, 1, 0], message.as_bytes())).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);

        let group_public_key = polynomial.group_public_key();
        assert!(group_public_key.verify(message.as_bytes(), &a));
        assert_eq!(random_seed_from(&a), random_seed_from(&b));
    }

    #[test]
    fn duplicate_parties_are_rejected() {
        let polynomial = Polynomial::random(2);
        let mut shares = shares_of(&polynomial, &[0, 1], b"m");
        shares.push(shares[0]);
        assert!(matches!(aggregate(&shares), Err(BeaconError::DuplicateParty)));
    }

    #[test]
    fn share_hex_round_trips() {
        let polynomial = Polynomial::random(2);
        let share = polynomial.secret_share_for(PartyID::new(0)).sign(b"m");
        assert_eq!(SignatureShare::from_hex(&share.to_hex()).unwrap(), share);
        assert!(SignatureShare::from_hex("zz").is_err());
    }

    #[test]
    fn round_message_concatenates_round_timeout_and_hex_seed() {
        let message = round_message(RoundNumber::new(12), TimeoutCount::new(2), RandomSeed::new(255));
        assert_eq!(message, "122ff");
    }
}
