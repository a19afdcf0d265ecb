/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Moving between rounds: starting the next round, collecting beacon shares into a seed, and
//! finalizing rounds that can no longer change.

use std::{
    sync::Arc,
    thread,
    time::{Instant, SystemTime},
};

use crate::{
    beacon::types::VRFShare,
    events::{
        AddVRFShareEvent, ComputeRandomSeedEvent, Event, FinalizeRoundEvent, StartRoundEvent,
    },
    networking::{messages::Message, network::Network},
    pluggables::{App, Epochs},
    round::{Phase, Round, ShareAdmission},
    types::data_types::{RandomSeed, RoundNumber},
};

use super::{fatal, RoundProtocol};

impl<A: App, E: Epochs, N: Network + 'static> RoundProtocol<A, E, N> {
    /// Move on from `round`, which has a notarized block, to the round after it.
    ///
    /// ## Internal procedure
    ///
    /// 1. Stop verifying `round` and finalize the round before it on a separate thread.
    /// 2. Get or create the next round and make it the current round.
    /// 3. Unless this miner already contributed to the next round, sign and broadcast its beacon share
    ///    for it.
    /// 4. Replay the shares for the next round that arrived early.
    pub fn start_next_round(&self, round: &Arc<Round>) -> Arc<Round> {
        // 1. Stop verifying `round`, and finalize the round before it.
        round.cancel_verification();
        round.advance_phase(Phase::Complete);
        if let Some(prev) = self.rounds.get(round.number() - 1) {
            if !prev.is_finalizing_or_finalized() {
                self.finalize_round_async(prev);
            }
        }

        // 2. Enter the next round.
        let (next, _) = self.rounds.get_or_create(round.number() + 1);
        self.set_current_round(next.number());
        if next.has_random_seed() || next.own_vrf_share().is_some() {
            return next;
        }

        // 3. Contribute to the next round's seed.
        if round.has_random_seed() {
            self.add_my_vrf_share(round, &next);
        }

        // 4. Replay early shares.
        for share in self.share_cache.take(next.number(), next.timeout_count()) {
            self.add_vrf_share(&next, share);
        }

        next
    }

    /// Sign this miner's beacon share for the current attempt at `round`, add it locally and broadcast
    /// it. Does nothing if this miner is not a miner of `round` or already sent a share for this attempt.
    pub(super) fn add_my_vrf_share(&self, prev: &Round, round: &Arc<Round>) {
        let miners = self.epochs.miners(round.number());
        let Some(party) = miners.party_id(&self.me()) else {
            return;
        };

        let signature = match self
            .beacon
            .sign(round.number(), round.timeout_count(), prev.random_seed())
        {
            Ok(signature) => signature,
            Err(err) => {
                fatal(format!(
                    "Failed to sign VRF share for round {}: {:?}",
                    round.number(),
                    err
                ));
                return;
            }
        };

        let share = VRFShare::new(
            round.number(),
            round.timeout_count(),
            party,
            self.me_bytes(),
            signature,
        );
        if !round.claim_own_vrf_share(share.clone()) {
            return;
        }

        self.add_vrf_share(round, share.clone());
        self.broadcast(Message::VRFShare(share));
    }

    /// Offer `share` to `round`. Returns whether the share was merged into the shares the round's seed is
    /// computed from.
    ///
    /// The share is cached for later if the previous round has no seed yet or if the share is for a
    /// later attempt at the round. The share that brings the round to the beacon threshold triggers the
    /// computation of the seed and the start of the round.
    pub fn add_vrf_share(&self, round: &Arc<Round>, share: VRFShare) -> bool {
        let prev_seed = self
            .rounds
            .get(round.number() - 1)
            .map(|prev| prev.random_seed())
            .unwrap_or(RandomSeed::zero());
        if prev_seed.is_zero() {
            self.share_cache.add(share);
            return false;
        }

        let threshold = match self.beacon.threshold(round.number()) {
            Ok(threshold) => threshold,
            Err(err) => {
                log::warn!(
                    "No beacon threshold for round {}: {:?}",
                    round.number(),
                    err
                );
                return false;
            }
        };

        let party = share.party;
        let admission = round.add_vrf_share(share.clone(), threshold, |share| {
            self.beacon.verify_share(share, prev_seed)
        });
        match admission {
            ShareAdmission::Added { count } => {
                Event::publish(
                    &self.event_publisher,
                    Event::AddVRFShare(AddVRFShareEvent {
                        timestamp: SystemTime::now(),
                        round: round.number(),
                        party,
                        shares: count,
                    }),
                );
                if count == threshold {
                    self.compute_random_seed(round, prev_seed);
                }
                true
            }
            ShareAdmission::FutureTimeoutCount => {
                self.share_cache.add(share);
                false
            }
            admission => {
                log::debug!(
                    "VRF share of party {} for round {} not merged: {:?}",
                    party,
                    round.number(),
                    admission
                );
                false
            }
        }
    }

    fn compute_random_seed(&self, round: &Arc<Round>, prev_seed: RandomSeed) {
        let shares = round.vrf_shares();
        match self.beacon.random_seed(&shares, prev_seed) {
            Ok(seed) => {
                Event::publish(
                    &self.event_publisher,
                    Event::ComputeRandomSeed(ComputeRandomSeedEvent {
                        timestamp: SystemTime::now(),
                        round: round.number(),
                        random_seed: seed,
                    }),
                );
                self.start_round(round, seed);
            }
            Err(err) => log::error!(
                "Failed to compute the seed of round {} from {} shares: {:?}",
                round.number(),
                shares.len(),
                err
            ),
        }
    }

    /// Give `round` its seed, start verifying its blocks, and generate a block if this miner's rank makes
    /// it a generator. Returns `false` if the round already had a seed.
    pub fn start_round(&self, round: &Arc<Round>, seed: RandomSeed) -> bool {
        let miners = self.epochs.miners(round.number());
        if !round.start(seed, miners.len()) {
            return false;
        }

        Event::publish(
            &self.event_publisher,
            Event::StartRound(StartRoundEvent {
                timestamp: SystemTime::now(),
                round: round.number(),
                timeout_count: round.timeout_count(),
                random_seed: seed,
            }),
        );

        self.start_verification(round);

        let rank = miners
            .position(&self.me())
            .and_then(|position| round.miner_rank(position));
        if let Some(rank) = rank {
            if (rank.int() as usize) < self.epochs.generators_num(round.number()) && !self.is_stopped() {
                if let Some(protocol) = self.arc() {
                    let round = round.clone();
                    thread::spawn(move || {
                        if let Err(err) = protocol.generate_round_block(&round) {
                            log::debug!(
                                "No block generated for round {}: {:?}",
                                round.number(),
                                err
                            );
                        }
                    });
                }
            }
        }

        true
    }

    /// Finalize `round` on a separate thread.
    fn finalize_round_async(&self, round: Arc<Round>) {
        if let Some(protocol) = self.arc() {
            thread::spawn(move || protocol.finalize_round(&round));
        }
    }

    /// Finalize `round`: hand its block to the app, and prune everything that is now too old to matter.
    ///
    /// The finalized block is the one the next round's heaviest notarized block extends, or else this
    /// round's heaviest notarized block. Rounds are finalized at most once, and never out of order: a
    /// round at or below the latest finalized round is only marked as finalized.
    pub fn finalize_round(&self, round: &Round) {
        if !round.try_start_finalizing() {
            return;
        }

        let extended = self
            .rounds
            .get(round.number() + 1)
            .and_then(|next| next.heaviest_notarized_block())
            .and_then(|next_block| round.block(&next_block.header.prev_hash));
        let block = extended.or_else(|| round.heaviest_notarized_block());

        let mut finalized_round = self.finalized_round.lock().unwrap();
        if round.number() <= *finalized_round {
            round.set_finalized();
            return;
        }

        match &block {
            Some(block) => {
                self.app.lock().unwrap().finalize_block(block);
                Event::publish(
                    &self.event_publisher,
                    Event::FinalizeRound(FinalizeRoundEvent {
                        timestamp: SystemTime::now(),
                        round: round.number(),
                        block: block.hash,
                    }),
                );
            }
            None => log::warn!("Round {} finalized without a notarized block", round.number()),
        }

        *finalized_round = round.number();
        round.set_finalized();
        self.finalization_timer.lock().unwrap().record(Instant::now());
        drop(finalized_round);

        self.prune(round.number());
    }

    /// Drop every round, cached share, pending retry and key material older than `finalized` minus the
    /// retention window.
    fn prune(&self, finalized: RoundNumber) {
        let keep_from = finalized - self.config.round_retention;
        for round in self.rounds.prune_below(keep_from) {
            round.cancel_verification();
        }
        self.share_cache.prune_below(keep_from);
        self.retry_tokens.cancel_below(keep_from);
        self.beacon.prune_below(keep_from);
    }
}
