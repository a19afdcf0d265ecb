/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Round timeouts.
//!
//! The round timeout adapts to the speed of the chain: it is a multiple of the moving average of the
//! time between finalized rounds, and never shorter than a configured minimum. A round that times out
//! goes through some number of soft timeouts, in each of which this miner rebroadcasts its latest
//! messages for the round, before it is restarted at a higher timeout count.

use std::{
    sync::{
        mpsc::{Receiver, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    events::{Event, RestartRoundEvent, RoundTimeoutEvent},
    networking::{messages::Message, network::Network},
    notarization::NotarizationTracker,
    pluggables::{App, Epochs},
    round::Round,
    types::data_types::{RoundNumber, VerifyingKeyBytes},
};

use super::RoundProtocol;

const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exponential moving average of the time between consecutive finalized rounds.
pub(crate) struct FinalizationTimer {
    last: Option<Instant>,
    mean: Option<Duration>,
}

impl FinalizationTimer {
    pub(crate) fn new() -> Self {
        Self {
            last: None,
            mean: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.last = Some(Instant::now())
    }

    /// Record that a round was finalized at `at`.
    pub(crate) fn record(&mut self, at: Instant) {
        if let Some(last) = self.last {
            let sample = at.saturating_duration_since(last);
            self.mean = Some(match self.mean {
                None => sample,
                Some(mean) => (mean * 7 + sample) / 8,
            });
        }
        self.last = Some(at);
    }

    pub(crate) fn mean(&self) -> Option<Duration> {
        self.mean
    }
}

impl<A: App, E: Epochs, N: Network + 'static> RoundProtocol<A, E, N> {
    /// How long the current round may go without progress before it times out.
    pub fn round_timeout(&self) -> Duration {
        let mean = self
            .finalization_timer
            .lock()
            .unwrap()
            .mean()
            .unwrap_or(Duration::ZERO);
        (mean * self.config.softto_mult).max(self.config.softto_min)
    }

    /// Called when round `number` timed out after `timeout`.
    ///
    /// Until the round has timed out `round_restart_mult` times, this only [rebroadcasts](Self::handle_no_progress)
    /// this miner's messages for the round. After that, the round is [restarted](Self::restart_round).
    pub fn handle_round_timeout(&self, number: RoundNumber, timeout: Duration) {
        let Some(round) = self.rounds.get(number) else {
            return;
        };

        let soft_timeout_count = round.soft_timeout_count();
        Event::publish(
            &self.event_publisher,
            Event::RoundTimeout(RoundTimeoutEvent {
                timestamp: SystemTime::now(),
                round: number,
                soft_timeout_count,
                timeout,
            }),
        );

        if soft_timeout_count >= self.config.round_restart_mult {
            self.restart_round(&round);
        } else {
            self.handle_no_progress(&round);
            round.increment_soft_timeout_count();
        }
    }

    /// Rebroadcast this miner's best proposal, its ticket, and its beacon share for `round`, in case
    /// peers missed them.
    pub fn handle_no_progress(&self, round: &Round) {
        if let Some(block) = round.best_block() {
            self.broadcast(Message::Verify(block));
        }
        let me = self.me_bytes();
        for block in round
            .proposed_blocks()
            .into_iter()
            .filter(|block| *block.miner() == me)
        {
            self.broadcast(Message::Verify(block));
        }
        if let Some(ticket) = round.own_verification_ticket() {
            self.broadcast(Message::VerificationTicket(ticket));
        }
        if let Some(share) = round.own_vrf_share() {
            self.broadcast(Message::VRFShare(share));
        }
    }

    /// Give up on the current attempt at `round` and start a new one at a higher timeout count.
    ///
    /// ## Internal procedure
    ///
    /// 1. If the round already has a notarized block, broadcast its notarization and move on instead.
    /// 2. Otherwise, rebroadcast the notarized block of the previous round and this miner's best block,
    ///    so that peers stuck behind can catch up.
    /// 3. If the previous round has a seed, reset the round, move to the next timeout count (following
    ///    the most senior peer that is already ahead, if any), and sign and broadcast a new beacon share.
    pub fn restart_round(&self, round: &Arc<Round>) {
        // 1. Nothing to restart.
        if let Some(notarized) = round.heaviest_notarized_block() {
            self.broadcast(Message::Notarization(NotarizationTracker::notarization(&notarized)));
            self.progress_on_notarization(round);
            return;
        }

        // 2. Help peers catch up.
        let Some(prev) = self.rounds.get(round.number() - 1) else {
            return;
        };
        if let Some(prev_block) = prev.heaviest_notarized_block() {
            self.broadcast(Message::NotarizedBlock(prev_block));
        }
        if let Some(best) = round.best_block() {
            self.broadcast(Message::Verify(best));
        }

        // 3. Restart.
        if !prev.has_random_seed() {
            return;
        }
        round.cancel_verification();
        if let Err(err) = round.restart() {
            log::debug!("Round {} not restarted: {:?}", round.number(), err);
            return;
        }

        let prev_miners = self.epochs.miners(prev.number());
        let voters: Vec<VerifyingKeyBytes> = prev
            .positions_by_rank()
            .into_iter()
            .filter_map(|position| prev_miners.get(position))
            .map(|miner| miner.to_bytes())
            .collect();
        let timeout_count = round.increment_timeout_count(&voters, &self.me_bytes(), self.config.timeout_cap);

        Event::publish(
            &self.event_publisher,
            Event::RestartRound(RestartRoundEvent {
                timestamp: SystemTime::now(),
                round: round.number(),
                timeout_count,
            }),
        );

        self.add_my_vrf_share(&prev, round);
        for share in self.share_cache.take(round.number(), timeout_count) {
            self.add_vrf_share(round, share);
        }
    }
}

/// Start the thread that times out rounds that make no progress.
///
/// The timer is reset whenever the current round changes. When it fires, the timeout is recomputed, so
/// the next timeout reflects the latest finalization times.
pub(crate) fn start_round_timeout_worker<A: App, E: Epochs, N: Network + 'static>(
    protocol: Arc<RoundProtocol<A, E, N>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut round = protocol.current_round();
        let mut timeout = protocol.round_timeout();
        let mut deadline = Instant::now() + timeout;

        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Round timeout thread disconnected from main thread")
                }
            }

            let current = protocol.current_round();
            if current != round {
                round = current;
                timeout = protocol.round_timeout();
                deadline = Instant::now() + timeout;
            } else if Instant::now() >= deadline {
                protocol.handle_round_timeout(round, timeout);
                timeout = protocol.round_timeout();
                deadline = Instant::now() + timeout;
            }

            thread::sleep(TIMEOUT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalization_timer_averages_intervals() {
        let mut timer = FinalizationTimer::new();
        let start = Instant::now();
        timer.record(start);
        assert_eq!(timer.mean(), None);

        timer.record(start + Duration::from_millis(800));
        assert_eq!(timer.mean(), Some(Duration::from_millis(800)));

        // (800 * 7 + 1600) / 8
        timer.record(start + Duration::from_millis(2400));
        assert_eq!(timer.mean(), Some(Duration::from_millis(900)));
    }
}
