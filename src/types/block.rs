/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the 'block' type and its associated methods.
//!
//! Only the consensus-relevant subset of a block lives here. Transactions are opaque bytes, and the
//! resulting state is represented only by `state_hash`, which is produced and checked by the
//! [`App`](crate::pluggables::App).

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{is_signed_by, CryptoHasher, Digest, Keypair},
    data_types::*,
    tickets::VerificationTicket,
};

/// Fields of a block that are covered by its hash.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    pub chain_id: ChainID,
    pub round: RoundNumber,
    pub prev_hash: CryptoHash,
    pub miner: VerifyingKeyBytes,
    pub round_random_seed: RandomSeed,
    pub round_rank: RoundRank,
    pub round_timeout_count: TimeoutCount,
    pub magic_block_number: MagicBlockNumber,
    /// Seconds since the Unix Epoch.
    pub creation_date: u64,
    pub state_hash: CryptoHash,
}

/// Local verification status of a block.
///
/// Blocks start `Pending`, become `Accepted` once picked for verification, then end up either
/// `Successful` (and later `Notarized`) or `Failed`/`Rejected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockState {
    #[default]
    Pending,
    Accepted,
    Successful,
    Failed,
    Rejected,
    Notarized,
}

impl BlockState {
    /// Whether the block has reached a state from which local verification will not be attempted
    /// again.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, BlockState::Pending | BlockState::Accepted)
    }
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: CryptoHash,
    pub txns: Vec<Transaction>,
    /// Tickets notarizing the previous block. These let verifiers check the chain link without
    /// having seen the previous round's notarization themselves.
    pub prev_verification_tickets: Vec<VerificationTicket>,
    /// The proposer's signature over `hash`.
    pub signature: SignatureBytes,
    /// Tickets collected for this block.
    pub verification_tickets: Vec<VerificationTicket>,
    #[borsh_skip]
    pub state: BlockState,
}

impl Block {
    /// Create and sign a new block proposed by `keypair`.
    pub fn new(
        header: BlockHeader,
        txns: Vec<Transaction>,
        prev_verification_tickets: Vec<VerificationTicket>,
        keypair: &Keypair,
    ) -> Block {
        let hash = Block::hash(&header, &txns, &prev_verification_tickets);
        Block {
            header,
            hash,
            txns,
            prev_verification_tickets,
            signature: keypair.sign(&hash.bytes()),
            verification_tickets: Vec::new(),
            state: BlockState::Pending,
        }
    }

    /// The genesis block, which is notarized by definition.
    pub fn genesis(chain_id: ChainID, seed: RandomSeed) -> Block {
        let header = BlockHeader {
            chain_id,
            round: RoundNumber::init(),
            prev_hash: CryptoHash::default(),
            miner: [0u8; 32],
            round_random_seed: seed,
            round_rank: RoundRank::new(0),
            round_timeout_count: TimeoutCount::init(),
            magic_block_number: MagicBlockNumber::new(0),
            creation_date: 0,
            state_hash: CryptoHash::default(),
        };
        let hash = Block::hash(&header, &Vec::new(), &Vec::new());
        Block {
            header,
            hash,
            txns: Vec::new(),
            prev_verification_tickets: Vec::new(),
            signature: SignatureBytes::new([0u8; 64]),
            verification_tickets: Vec::new(),
            state: BlockState::Notarized,
        }
    }

    pub fn hash(
        header: &BlockHeader,
        txns: &Vec<Transaction>,
        prev_verification_tickets: &Vec<VerificationTicket>,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(&header.try_to_vec().unwrap());
        hasher.update(&txns.try_to_vec().unwrap());
        hasher.update(&prev_verification_tickets.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }

    /// Checks if hash and the proposer's signature are cryptographically correct.
    pub fn is_correct(&self) -> bool {
        self.hash == Block::hash(&self.header, &self.txns, &self.prev_verification_tickets)
            && is_signed_by(&self.header.miner, &self.hash.bytes(), &self.signature)
    }

    pub fn round(&self) -> RoundNumber {
        self.header.round
    }

    pub fn rank(&self) -> RoundRank {
        self.header.round_rank
    }

    pub fn miner(&self) -> &VerifyingKeyBytes {
        &self.header.miner
    }

    pub fn is_genesis(&self) -> bool {
        self.header.round == RoundNumber::init()
    }

    /// Add `ticket` to this block's tickets unless a ticket from the same verifier is already present.
    /// Returns whether the ticket was added.
    pub fn add_verification_ticket(&mut self, ticket: VerificationTicket) -> bool {
        if self
            .verification_tickets
            .iter()
            .any(|t| t.verifier == ticket.verifier)
        {
            return false;
        }
        self.verification_tickets.push(ticket);
        true
    }

    /// Merge `tickets` into this block's tickets, skipping verifiers already present.
    pub fn merge_verification_tickets(&mut self, tickets: &[VerificationTicket]) {
        for ticket in tickets {
            self.add_verification_ticket(*ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn header(keypair: &Keypair) -> BlockHeader {
        BlockHeader {
            chain_id: ChainID::new(0),
            round: RoundNumber::new(3),
            prev_hash: CryptoHash::new([7u8; 32]),
            miner: keypair.public().to_bytes(),
            round_random_seed: RandomSeed::new(42),
            round_rank: RoundRank::new(1),
            round_timeout_count: TimeoutCount::init(),
            magic_block_number: MagicBlockNumber::new(1),
            creation_date: 1_700_000_000,
            state_hash: CryptoHash::default(),
        }
    }

    #[test]
    fn tampered_block_is_not_correct() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng {}));
        let block = Block::new(header(&keypair), vec![Transaction::new(vec![1])], vec![], &keypair);
        assert!(block.is_correct());

        let mut tampered = block.clone();
        tampered.header.round_rank = RoundRank::new(0);
        assert!(!tampered.is_correct());
    }

    #[test]
    fn ticket_from_same_verifier_is_added_once() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng {}));
        let mut block = Block::new(header(&keypair), vec![], vec![], &keypair);
        let ticket = VerificationTicket::new(&keypair, &block.hash);

        assert!(block.add_verification_ticket(ticket));
        assert!(!block.add_verification_ticket(ticket));
        block.merge_verification_tickets(&[ticket, ticket]);
        assert_eq!(block.verification_tickets.len(), 1);
    }
}
