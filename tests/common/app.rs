//! [`CountingApp`], a simple implementation of [`App`] used in all of the integration tests.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use miner_rounds::{
    pluggables::{
        App, ProduceBlockError, ProduceBlockRequest, ProduceBlockResponse, ValidateBlockRequest,
        ValidateBlockResponse,
    },
    types::{
        block::Block,
        crypto_primitives::{CryptoHasher, Digest},
        data_types::{CryptoHash, RandomSeed, RoundNumber, Transaction, VerifyingKeyBytes},
    },
};

/// A block finalized by a [`CountingApp`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FinalizedBlock {
    pub(crate) round: RoundNumber,
    pub(crate) hash: CryptoHash,
    pub(crate) random_seed: RandomSeed,
}

/// A simple implementation of [`App`] for use in integration tests.
///
/// Every block carries a single transaction holding its round number, and its state hash chains the state
/// hash of the previous block with that number. Finalized blocks are appended to a shared log which tests
/// read through [`CountingApp::finalized`].
///
/// ## Timing
///
/// `produce_block` and `validate_block` each sleep for 10 milliseconds to keep the block rate of the
/// integration tests modest.
pub(crate) struct CountingApp {
    finalized: Arc<Mutex<Vec<FinalizedBlock>>>,
}

impl CountingApp {
    pub(crate) fn new(finalized: Arc<Mutex<Vec<FinalizedBlock>>>) -> CountingApp {
        Self { finalized }
    }

    fn state_hash(prev_hash: &CryptoHash, round: RoundNumber) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(prev_hash.bytes());
        hasher.update(round.int().to_le_bytes());
        CryptoHash::new(hasher.finalize().into())
    }
}

impl App for CountingApp {
    fn produce_block(&mut self, request: ProduceBlockRequest) -> Result<ProduceBlockResponse, ProduceBlockError> {
        thread::sleep(Duration::from_millis(10));

        let round = request.round();
        Ok(ProduceBlockResponse {
            txns: vec![Transaction::new(round.int().to_le_bytes().to_vec())],
            state_hash: Self::state_hash(&request.prev_block().hash, round),
        })
    }

    fn validate_block(&mut self, request: ValidateBlockRequest) -> ValidateBlockResponse {
        thread::sleep(Duration::from_millis(10));

        let block = request.block();
        let expected = block.round().int().to_le_bytes().to_vec();
        if block.txns.first().map(|txn| txn.bytes()) != Some(&expected) {
            return ValidateBlockResponse::Invalid;
        }
        ValidateBlockResponse::Valid {
            state_hash: Self::state_hash(&block.header.prev_hash, block.round()),
        }
    }

    fn create_fee_txn(&mut self, _: RoundNumber, _: &VerifyingKeyBytes) -> Option<Transaction> {
        None
    }

    fn finalize_block(&mut self, block: &Block) {
        self.finalized.lock().unwrap().push(FinalizedBlock {
            round: block.round(),
            hash: block.hash,
            random_seed: block.header.round_random_seed,
        })
    }

    fn txn_count(&self) -> usize {
        1
    }
}
