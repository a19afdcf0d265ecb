/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-round record: seed, shares, timeout counters, blocks and tickets.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{mpsc::Sender, Mutex, MutexGuard},
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    beacon::types::VRFShare,
    types::{
        block::{Block, BlockState},
        cancellation::CancellationToken,
        data_types::{
            CryptoHash, PartyID, RandomSeed, RoundNumber, RoundRank, TimeoutCount, VerifyingKeyBytes,
        },
        tickets::{BlockVerificationTicket, VerificationTicket},
    },
};

/// Progress of one attempt at a round. Only ever moves forward, except through [`Round::restart`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Collecting VRF shares for the round's seed.
    ShareVRF,
    /// Seed known, proposals are being collected and verified.
    Verify,
    /// A block has been verified and tickets are being collected.
    Notarize,
    /// A block has been notarized and the notarization is being shared.
    Share,
    /// The next round has been started.
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizingState {
    NotFinalized,
    Finalizing,
    Finalized,
}

/// Outcome of offering a VRF share to a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareAdmission {
    /// The share was merged. `count` is the number of merged shares after the merge.
    Added { count: usize },
    /// The round already has its seed.
    SeedAlreadySet,
    /// The share was produced for an earlier attempt at the round.
    StaleTimeoutCount,
    /// The share was produced for a later attempt at the round than this node has reached.
    FutureTimeoutCount,
    /// The share does not verify against its party's public key share.
    InvalidShare,
    /// The party already has a share in the round.
    Duplicate,
    /// The round already holds a threshold of shares. The share was recorded as an additional share.
    Additional,
}

impl ShareAdmission {
    pub fn is_added(&self) -> bool {
        matches!(self, ShareAdmission::Added { .. })
    }
}

/// Channel into a round's verification collector, together with the token that stops it.
pub(crate) struct VerificationContext {
    pub(crate) blocks: Sender<Block>,
    pub(crate) cancel: CancellationToken,
}

/// One round, shared between the threads that work on it. Every method takes the round's own lock,
/// so each call is atomic with respect to the others.
pub struct Round {
    number: RoundNumber,
    state: Mutex<RoundState>,
}

struct RoundState {
    phase: Phase,
    finalizing: FinalizingState,
    timeout_count: TimeoutCount,
    soft_timeout_count: u32,
    random_seed: RandomSeed,
    // rank of the miner at each position of the epoch's miner set.
    miner_ranks: Vec<u32>,

    vrf_shares: BTreeMap<PartyID, VRFShare>,
    additional_shares: Vec<VRFShare>,
    timeout_votes: HashMap<VerifyingKeyBytes, TimeoutCount>,
    own_vrf_share: Option<VRFShare>,

    blocks: HashMap<CryptoHash, Block>,
    proposed: Vec<CryptoHash>,
    notarized: Vec<CryptoHash>,
    best_block: Option<CryptoHash>,

    verification_tickets: BTreeMap<(CryptoHash, VerifyingKeyBytes), BlockVerificationTicket>,
    own_verification_ticket: Option<BlockVerificationTicket>,

    verification: Option<VerificationContext>,
}

impl Round {
    pub fn new(number: RoundNumber) -> Round {
        Round {
            number,
            state: Mutex::new(RoundState {
                phase: Phase::ShareVRF,
                finalizing: FinalizingState::NotFinalized,
                timeout_count: TimeoutCount::init(),
                soft_timeout_count: 0,
                random_seed: RandomSeed::zero(),
                miner_ranks: Vec::new(),
                vrf_shares: BTreeMap::new(),
                additional_shares: Vec::new(),
                timeout_votes: HashMap::new(),
                own_vrf_share: None,
                blocks: HashMap::new(),
                proposed: Vec::new(),
                notarized: Vec::new(),
                best_block: None,
                verification_tickets: BTreeMap::new(),
                own_verification_ticket: None,
                verification: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<RoundState> {
        self.state.lock().unwrap()
    }

    pub fn number(&self) -> RoundNumber {
        self.number
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Move the round to `phase` if it is ahead of the current phase.
    pub fn advance_phase(&self, phase: Phase) {
        let mut state = self.state();
        if phase > state.phase {
            state.phase = phase;
        }
    }

    pub fn finalizing_state(&self) -> FinalizingState {
        self.state().finalizing
    }

    /// Move from `NotFinalized` to `Finalizing`. Returns whether this call made the move, so that
    /// exactly one caller goes on to finalize the round.
    pub fn try_start_finalizing(&self) -> bool {
        let mut state = self.state();
        if state.finalizing == FinalizingState::NotFinalized {
            state.finalizing = FinalizingState::Finalizing;
            true
        } else {
            false
        }
    }

    pub fn set_finalized(&self) {
        self.state().finalizing = FinalizingState::Finalized
    }

    pub fn is_finalizing_or_finalized(&self) -> bool {
        self.state().finalizing != FinalizingState::NotFinalized
    }

    pub fn timeout_count(&self) -> TimeoutCount {
        self.state().timeout_count
    }

    pub fn soft_timeout_count(&self) -> u32 {
        self.state().soft_timeout_count
    }

    pub fn increment_soft_timeout_count(&self) -> u32 {
        let mut state = self.state();
        state.soft_timeout_count += 1;
        state.soft_timeout_count
    }

    pub fn random_seed(&self) -> RandomSeed {
        self.state().random_seed
    }

    pub fn has_random_seed(&self) -> bool {
        !self.state().random_seed.is_zero()
    }

    /// Set the round's seed and derive the rank of each of the `num_miners` miners from it.
    ///
    /// Succeeds at most once per attempt at the round: returns `false` without changing anything if
    /// `seed` is zero or if the round already has a seed.
    pub fn start(&self, seed: RandomSeed, num_miners: usize) -> bool {
        let mut state = self.state();
        if seed.is_zero() || !state.random_seed.is_zero() {
            return false;
        }
        state.random_seed = seed;
        state.miner_ranks = miner_ranks(seed, num_miners);
        if state.phase < Phase::Verify {
            state.phase = Phase::Verify;
        }
        true
    }

    /// Take the seed of a notarized block of this round, bypassing share collection. Used when the
    /// round's shares were missed or this node computed a different seed. Returns whether the seed
    /// changed.
    pub fn adopt_random_seed(&self, seed: RandomSeed, num_miners: usize) -> bool {
        let mut state = self.state();
        if seed.is_zero() || state.random_seed == seed {
            return false;
        }
        state.random_seed = seed;
        state.miner_ranks = miner_ranks(seed, num_miners);
        true
    }

    /// Rank of the miner at `position` in the epoch's miner set, once the round has a seed.
    pub fn miner_rank(&self, position: usize) -> Option<RoundRank> {
        self.state()
            .miner_ranks
            .get(position)
            .map(|rank| RoundRank::new(*rank))
    }

    /// Positions of the miners in rank order, most senior first.
    pub fn positions_by_rank(&self) -> Vec<usize> {
        let state = self.state();
        let mut positions: Vec<usize> = (0..state.miner_ranks.len()).collect();
        positions.sort_by_key(|pos| state.miner_ranks[*pos]);
        positions
    }

    /// Offer `share` to the round. `verify` is only called once the cheap checks pass, and the share is
    /// only merged if it returns `true`.
    ///
    /// Shares merged while below `threshold` are what the seed is computed from. A valid share offered
    /// once the threshold is reached is kept as an additional share, which does not change the
    /// seed. Every share that passes verification also counts as its sender's timeout vote.
    pub fn add_vrf_share(
        &self,
        share: VRFShare,
        threshold: usize,
        verify: impl FnOnce(&VRFShare) -> bool,
    ) -> ShareAdmission {
        let mut state = self.state();
        if !state.random_seed.is_zero() {
            return ShareAdmission::SeedAlreadySet;
        }
        if share.timeout_count < state.timeout_count {
            return ShareAdmission::StaleTimeoutCount;
        }
        if share.timeout_count > state.timeout_count {
            // A valid share from a later attempt still counts as its sender's timeout vote.
            if verify(&share) {
                state.timeout_votes.insert(share.sender, share.timeout_count);
            }
            return ShareAdmission::FutureTimeoutCount;
        }
        if state.vrf_shares.contains_key(&share.party) {
            return ShareAdmission::Duplicate;
        }
        if !verify(&share) {
            return ShareAdmission::InvalidShare;
        }

        state.timeout_votes.insert(share.sender, share.timeout_count);
        if state.vrf_shares.len() >= threshold {
            state.additional_shares.push(share);
            return ShareAdmission::Additional;
        }
        state.vrf_shares.insert(share.party, share);
        ShareAdmission::Added {
            count: state.vrf_shares.len(),
        }
    }

    pub fn vrf_shares(&self) -> Vec<VRFShare> {
        self.state().vrf_shares.values().cloned().collect()
    }

    pub fn vrf_share_count(&self) -> usize {
        self.state().vrf_shares.len()
    }

    pub fn threshold_reached(&self, threshold: usize) -> bool {
        self.state().vrf_shares.len() >= threshold
    }

    /// Number of valid shares received after the threshold was reached. Kept for diagnostics only.
    pub fn additional_share_count(&self) -> usize {
        self.state().additional_shares.len()
    }

    pub fn own_vrf_share(&self) -> Option<VRFShare> {
        self.state().own_vrf_share.clone()
    }

    /// Record `share` as this node's share for the current attempt, unless one is already recorded.
    /// Returns whether `share` was recorded, so that at most one share per attempt is sent.
    pub fn claim_own_vrf_share(&self, share: VRFShare) -> bool {
        let mut state = self.state();
        if state.own_vrf_share.is_some() {
            return false;
        }
        state.own_vrf_share = Some(share);
        true
    }

    /// Reset the round for a new attempt: shares, seed, ranks, best block, this node's own ticket and
    /// soft timeout count are cleared and the phase goes back to [`Phase::ShareVRF`]. The timeout count is left unchanged; see
    /// [`increment_timeout_count`](Self::increment_timeout_count).
    ///
    /// Rounds that already shared a notarization cannot be restarted.
    pub fn restart(&self) -> Result<(), RoundError> {
        let mut state = self.state();
        if state.phase >= Phase::Share {
            return Err(RoundError::CompleteRoundRestart);
        }
        state.phase = Phase::ShareVRF;
        state.random_seed = RandomSeed::zero();
        state.miner_ranks.clear();
        state.vrf_shares.clear();
        state.additional_shares.clear();
        state.own_vrf_share = None;
        state.best_block = None;
        state.own_verification_ticket = None;
        state.soft_timeout_count = 0;
        Ok(())
    }

    /// Move to the next timeout count after a hard restart.
    ///
    /// `voters` are the miners in the previous round's rank order, and `me` is skipped among them. The
    /// first voter whose timeout vote is higher than the current count decides the new count; if no
    /// voter is ahead, the count is incremented by one. A non-zero `cap` bounds the result.
    pub fn increment_timeout_count(
        &self,
        voters: &[VerifyingKeyBytes],
        me: &VerifyingKeyBytes,
        cap: u32,
    ) -> TimeoutCount {
        let mut state = self.state();
        let current = state.timeout_count;
        let vote = voters
            .iter()
            .filter(|voter| *voter != me)
            .filter_map(|voter| state.timeout_votes.get(voter))
            .find(|vote| **vote > current)
            .copied();

        let mut next = vote.unwrap_or(current + 1);
        if cap > 0 && next.int() > cap {
            next = TimeoutCount::new(cap);
        }
        state.timeout_count = next;
        state.timeout_votes.clear();
        next
    }

    /// Register `block` as a proposal for this round. Returns `false` if a block with the same hash is
    /// already registered, in which case the tickets of `block` are merged into the known copy.
    pub fn add_proposed_block(&self, block: Block) -> bool {
        let mut state = self.state();
        if let Some(known) = state.blocks.get_mut(&block.hash) {
            known.merge_verification_tickets(&block.verification_tickets);
            return false;
        }
        state.proposed.push(block.hash);
        state.blocks.insert(block.hash, block);
        true
    }

    pub fn block(&self, hash: &CryptoHash) -> Option<Block> {
        self.state().blocks.get(hash).cloned()
    }

    pub fn has_block(&self, hash: &CryptoHash) -> bool {
        self.state().blocks.contains_key(hash)
    }

    /// Apply `f` to the round's copy of the block with `hash`, if there is one.
    pub fn with_block_mut<T>(&self, hash: &CryptoHash, f: impl FnOnce(&mut Block) -> T) -> Option<T> {
        self.state().blocks.get_mut(hash).map(f)
    }

    /// Set the local verification state of a known block. A notarized block stays notarized.
    pub fn set_block_state(&self, hash: &CryptoHash, block_state: BlockState) {
        if let Some(block) = self.state().blocks.get_mut(hash) {
            if block.state != BlockState::Notarized {
                block.state = block_state;
            }
        }
    }

    pub fn block_state(&self, hash: &CryptoHash) -> Option<BlockState> {
        self.state().blocks.get(hash).map(|block| block.state)
    }

    pub fn proposed_blocks(&self) -> Vec<Block> {
        let state = self.state();
        state
            .proposed
            .iter()
            .filter_map(|hash| state.blocks.get(hash).cloned())
            .collect()
    }

    /// Mark the known block with `hash` as notarized. Returns `false` if it was already notarized or
    /// is unknown.
    pub fn add_notarized_block(&self, hash: &CryptoHash) -> bool {
        let mut state = self.state();
        if state.notarized.contains(hash) {
            return false;
        }
        let Some(block) = state.blocks.get_mut(hash) else {
            return false;
        };
        block.state = BlockState::Notarized;
        state.notarized.push(*hash);
        if state.phase < Phase::Share {
            state.phase = Phase::Share;
        }
        true
    }

    pub fn notarized_blocks(&self) -> Vec<Block> {
        let state = self.state();
        state
            .notarized
            .iter()
            .filter_map(|hash| state.blocks.get(hash).cloned())
            .collect()
    }

    pub fn is_notarized(&self) -> bool {
        !self.state().notarized.is_empty()
    }

    /// The notarized block with the best (lowest) rank, ties going to the block with more tickets.
    pub fn heaviest_notarized_block(&self) -> Option<Block> {
        self.notarized_blocks().into_iter().min_by(|a, b| {
            a.rank()
                .cmp(&b.rank())
                .then(b.verification_tickets.len().cmp(&a.verification_tickets.len()))
        })
    }

    /// The best-ranked proposal that has gathered at least one verification ticket.
    pub fn best_proposed_block(&self) -> Option<Block> {
        self.proposed_blocks()
            .into_iter()
            .filter(|block| !block.verification_tickets.is_empty())
            .min_by(|a, b| {
                a.rank()
                    .cmp(&b.rank())
                    .then(b.verification_tickets.len().cmp(&a.verification_tickets.len()))
            })
    }

    /// The block this node verified and signed a ticket for.
    pub fn best_block(&self) -> Option<Block> {
        let state = self.state();
        state
            .best_block
            .and_then(|hash| state.blocks.get(&hash).cloned())
    }

    pub fn set_best_block(&self, hash: CryptoHash) {
        let mut state = self.state();
        state.best_block = Some(hash);
        if state.phase < Phase::Notarize {
            state.phase = Phase::Notarize;
        }
    }

    /// Whether this round has no more use for verification: a block is notarized, or the round is
    /// being finalized.
    pub fn is_verification_complete(&self) -> bool {
        let state = self.state();
        !state.notarized.is_empty() || state.finalizing != FinalizingState::NotFinalized
    }

    /// Keep tickets that arrived for blocks of this round, whether or not the block is known yet.
    /// Tickets are keyed by block and verifier, so adding a ticket twice has no effect.
    pub fn add_verification_tickets(&self, tickets: impl IntoIterator<Item = BlockVerificationTicket>) {
        let mut state = self.state();
        for ticket in tickets {
            state
                .verification_tickets
                .entry((ticket.block_hash, ticket.ticket.verifier))
                .or_insert(ticket);
        }
    }

    /// Tickets kept for the block with `hash`.
    pub fn verification_tickets(&self, hash: &CryptoHash) -> Vec<VerificationTicket> {
        self.state()
            .verification_tickets
            .values()
            .filter(|ticket| ticket.block_hash == *hash)
            .map(|ticket| ticket.ticket)
            .collect()
    }

    pub fn own_verification_ticket(&self) -> Option<BlockVerificationTicket> {
        self.state().own_verification_ticket
    }

    pub fn set_own_verification_ticket(&self, ticket: BlockVerificationTicket) {
        self.state().own_verification_ticket = Some(ticket)
    }

    /// Install the channel and token of a freshly started verification collector. Returns `false`, and
    /// installs nothing, if a collector is already running.
    pub(crate) fn set_verification_context(&self, context: VerificationContext) -> bool {
        let mut state = self.state();
        if state
            .verification
            .as_ref()
            .is_some_and(|running| !running.cancel.is_cancelled())
        {
            return false;
        }
        state.verification = Some(context);
        true
    }

    /// Hand `block` to the round's verification collector. Returns `false` if no collector is running.
    pub(crate) fn send_for_verification(&self, block: Block) -> bool {
        let state = self.state();
        match &state.verification {
            Some(context) if !context.cancel.is_cancelled() => context.blocks.send(block).is_ok(),
            _ => false,
        }
    }

    /// Stop the round's verification collector, if one is running.
    pub fn cancel_verification(&self) {
        if let Some(context) = &self.state().verification {
            context.cancel.cancel()
        }
    }
}

/// Derive the rank of each of `num_miners` miners from `seed`: shuffle the ranks `0..num_miners` with a
/// PRNG seeded by `seed`, and hand rank `ranks[i]` to the miner at position `i`.
pub fn miner_ranks(seed: RandomSeed, num_miners: usize) -> Vec<u32> {
    let mut ranks: Vec<u32> = (0..num_miners as u32).collect();
    let mut rng = StdRng::seed_from_u64(seed.int() as u64);
    ranks.shuffle(&mut rng);
    ranks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundError {
    /// The round has already shared a notarization and cannot be restarted.
    CompleteRoundRestart,
}
