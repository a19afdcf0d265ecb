/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a blockchain.
///
/// Verification tickets and block signatures are not bound to a `ChainID`, but the `ChainID` is
/// included in every block hash so that blocks of two chains sharing miners can never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChainID(u64);

impl ChainID {
    /// Create a new `ChainID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `ChainID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Round number. Starts at 0 (the genesis round) and increases by 1 every time a round is notarized.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RoundNumber(i64);

impl RoundNumber {
    /// Create a new `RoundNumber` wrapping `int`.
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    /// Get the genesis `RoundNumber`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `i64` of this `RoundNumber`.
    pub const fn int(&self) -> i64 {
        self.0
    }
}

impl Display for RoundNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<i64> for RoundNumber {
    type Output = RoundNumber;

    fn add(self, rhs: i64) -> Self::Output {
        RoundNumber(self.0 + rhs)
    }
}

impl Sub<i64> for RoundNumber {
    type Output = RoundNumber;

    fn sub(self, rhs: i64) -> Self::Output {
        RoundNumber(self.0 - rhs)
    }
}

impl Sub<RoundNumber> for RoundNumber {
    type Output = i64;

    fn sub(self, rhs: RoundNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Number of times a round has been restarted after timing out.
///
/// Every restart of a round requires a fresh set of VRF shares, and the timeout count is part of the
/// message those shares sign. This is what keeps shares of two attempts at the same round apart.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct TimeoutCount(u32);

impl TimeoutCount {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for TimeoutCount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for TimeoutCount {
    type Output = TimeoutCount;

    fn add(self, rhs: u32) -> Self::Output {
        TimeoutCount(self.0.saturating_add(rhs))
    }
}

/// Random seed of a round.
///
/// A zero seed means "not yet computed". Seeds are derived from the threshold signature of the round's
/// VRF shares (see [`random_seed_from`](crate::beacon::threshold::random_seed_from)).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RandomSeed(i64);

impl RandomSeed {
    /// Create a new `RandomSeed` wrapping `int`.
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    /// The "not yet computed" seed.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the inner `i64` of this `RandomSeed`.
    pub const fn int(&self) -> i64 {
        self.0
    }

    /// Check whether this seed is the "not yet computed" seed.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Signed base-16 representation of the seed, e.g. `-1f` for `-31`. This is the form in which the
    /// previous round's seed enters the message that VRF shares sign.
    pub fn to_hex(&self) -> String {
        if self.0 < 0 {
            format!("-{:x}", self.0.unsigned_abs())
        } else {
            format!("{:x}", self.0)
        }
    }
}

impl Display for RandomSeed {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Position of a miner in the seed-derived ranking of a round. Lower is more senior.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RoundRank(u32);

impl RoundRank {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for RoundRank {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identifier of a DKG party, i.e., of a miner's slot in the epoch's miner set.
///
/// The party with id `i` evaluates DKG polynomials at `x = i + 1`, so that no party ever holds the
/// evaluation at `x = 0` (the group secret).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct PartyID(u32);

impl PartyID {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    /// The x coordinate at which this party's polynomial shares are evaluated.
    pub(crate) const fn x(&self) -> u64 {
        self.0 as u64 + 1
    }
}

impl Display for PartyID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Sequence number of the magic block (the epoch descriptor) a block claims to belong to.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct MagicBlockNumber(u64);

impl MagicBlockNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// 32-byte cryptographic hash. Within this crate these are always SHA256 hashes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Ed25519 digital signature, produced using the [`ed25519_dalek`] crate.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub(crate) fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Bytes of an Ed25519 verifying key. Entities store these instead of
/// [`VerifyingKey`](ed25519_dalek::VerifyingKey) since the latter does not implement the Borsh traits.
pub type VerifyingKeyBytes = [u8; 32];

/// A single transaction, opaque to the consensus core.
#[derive(Clone, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Transaction(Vec<u8>);

impl Transaction {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> &Vec<u8> {
        &self.0
    }
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Transaction({} bytes)", self.0.len())
    }
}
