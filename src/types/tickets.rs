/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Verification tickets and the notarizations they add up to.
//!
//! A miner that successfully verifies a block signs the block's hash with its Ed25519 key. The
//! resulting [`VerificationTicket`] is gossiped wrapped in a [`BlockVerificationTicket`], and once a
//! block has gathered enough tickets from the miners of its epoch it is *notarized*. A
//! [`Notarization`] is the broadcastable proof of that fact.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{is_signed_by, Keypair},
    data_types::{CryptoHash, RoundNumber, SignatureBytes, VerifyingKeyBytes},
};

/// A single miner's signature over a block hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VerificationTicket {
    pub verifier: VerifyingKeyBytes,
    pub signature: SignatureBytes,
}

impl VerificationTicket {
    /// Sign `block_hash` with `keypair`.
    pub fn new(keypair: &Keypair, block_hash: &CryptoHash) -> Self {
        Self {
            verifier: keypair.public().to_bytes(),
            signature: keypair.sign(&block_hash.bytes()),
        }
    }

    /// Check whether `signature` is the verifier's signature over `block_hash`.
    pub fn is_correct(&self, block_hash: &CryptoHash) -> bool {
        is_signed_by(&self.verifier, &block_hash.bytes(), &self.signature)
    }
}

/// A [`VerificationTicket`] together with the block it is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockVerificationTicket {
    pub block_hash: CryptoHash,
    pub round: RoundNumber,
    pub ticket: VerificationTicket,
}

impl BlockVerificationTicket {
    pub fn new(keypair: &Keypair, block_hash: CryptoHash, round: RoundNumber) -> Self {
        Self {
            block_hash,
            round,
            ticket: VerificationTicket::new(keypair, &block_hash),
        }
    }
}

/// Proof that the block identified by `block_hash` gathered enough verification tickets.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Notarization {
    pub block_hash: CryptoHash,
    pub round: RoundNumber,
    pub tickets: Vec<VerificationTicket>,
}

impl Notarization {
    pub fn new(block_hash: CryptoHash, round: RoundNumber, tickets: Vec<VerificationTicket>) -> Self {
        Self {
            block_hash,
            round,
            tickets,
        }
    }
}
