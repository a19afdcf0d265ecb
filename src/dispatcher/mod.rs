/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded inbound queue of protocol messages, drained by a single worker thread.
//!
//! Every message received from the network is wrapped in a [`BlockMessage`] and pushed into a bounded
//! queue. One worker thread pops messages and hands them, one at a time, to the
//! [`BlockMessageHandler`] (the round protocol). If the queue is full, new messages are dropped: the
//! protocol relies on gossip redundancy and rebroadcasts, not on every message being processed.
//!
//! ## Retries
//!
//! A message can arrive before this node is ready for it, e.g., a ticket for a round this node has not
//! created yet. The handler reports such cases with a [transient](ProtocolError::is_transient) error,
//! and if the message [should be retried](BlockMessage::should_retry) the worker submits it to the
//! retry scheduler as a delayed task. The scheduler thread pushes the message back into the queue once
//! its [delay](BlockMessage::retry_delay) has elapsed, unless the task's cancellation token was set in
//! the meantime. Tokens are per round, and the protocol cancels them when it prunes a round.

pub mod messages;

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    events::{Event, RetryMessageEvent},
    protocol::ProtocolError,
    types::{cancellation::CancellationToken, data_types::RoundNumber},
};

use self::messages::BlockMessage;

/// How long the dispatcher threads block before checking their shutdown signal.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The call surface the dispatcher drives. Calls are never made concurrently.
pub trait BlockMessageHandler: Send + Sync + 'static {
    fn handle_block_message(&self, message: &BlockMessage) -> Result<(), ProtocolError>;
}

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfiguration {
    /// Maximum number of messages waiting in the queue.
    pub capacity: usize,
    /// Expected one-way message latency, which bounds how long messages are retried.
    pub network_delta: Duration,
}

/// Cancellation tokens of scheduled retries, one per round.
#[derive(Clone, Default)]
pub struct RetryTokens(Arc<Mutex<BTreeMap<RoundNumber, CancellationToken>>>);

impl RetryTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// The token that retries of messages for `round` are scheduled under.
    pub fn token_for(&self, round: RoundNumber) -> CancellationToken {
        self.0.lock().unwrap().entry(round).or_default().clone()
    }

    /// Cancel every scheduled retry of a message for a round lower than `round`.
    pub fn cancel_below(&self, round: RoundNumber) {
        let mut tokens = self.0.lock().unwrap();
        let kept = tokens.split_off(&round);
        tokens.values().for_each(|token| token.cancel());
        *tokens = kept;
    }
}

/// Handle for pushing received messages into the dispatcher's queue.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    queue: SyncSender<BlockMessage>,
}

impl DispatcherHandle {
    /// Enqueue `message` without blocking. Returns `false` if the message was dropped.
    pub(crate) fn dispatch(&self, message: BlockMessage) -> bool {
        match self.queue.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                log::warn!(
                    "Dispatcher queue full, dropping {} message for round {}",
                    message.message_type(),
                    message.round()
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Spawn the dispatcher's worker thread (which in turn runs the retry scheduler thread).
pub(crate) fn start_dispatcher<H: BlockMessageHandler>(
    config: DispatcherConfiguration,
    handler: Arc<H>,
    retry_tokens: RetryTokens,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, DispatcherHandle) {
    let (to_queue, queue) = mpsc::sync_channel(config.capacity.max(1));
    let handle = DispatcherHandle { queue: to_queue };
    let requeue = handle.clone();

    let worker = thread::spawn(move || {
        let (to_scheduler, scheduled) = mpsc::channel();
        let (scheduler_shutdown, scheduler_shutdown_receiver) = mpsc::channel();
        let scheduler = start_retry_scheduler(requeue, scheduled, scheduler_shutdown_receiver);

        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => break,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Dispatcher thread disconnected from main thread")
                }
            }

            match queue.recv_timeout(POLL_INTERVAL) {
                Ok(message) => {
                    if let Some(task) = process(&config, handler.as_ref(), &retry_tokens, &event_publisher, message) {
                        let _ = to_scheduler.send(task);
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let _ = scheduler_shutdown.send(());
        let _ = scheduler.join();
    });

    (worker, handle)
}

/// Hand `message` to `handler`. Returns the retry task to schedule, if the message arrived too early
/// and should be tried again.
fn process<H: BlockMessageHandler>(
    config: &DispatcherConfiguration,
    handler: &H,
    retry_tokens: &RetryTokens,
    event_publisher: &Option<Sender<Event>>,
    mut message: BlockMessage,
) -> Option<RetryTask> {
    match handler.handle_block_message(&message) {
        Ok(()) => None,
        Err(err) if err.is_transient() && message.should_retry(config.network_delta) => {
            let delay = message.retry_delay();
            message.retry_count += 1;
            Event::publish(
                event_publisher,
                Event::RetryMessage(RetryMessageEvent {
                    timestamp: SystemTime::now(),
                    round: message.round(),
                    message_type: message.message_type(),
                    retry_count: message.retry_count,
                    delay,
                }),
            );
            Some(RetryTask {
                due: Instant::now() + delay,
                cancel: retry_tokens.token_for(message.round()),
                message,
            })
        }
        Err(err) => {
            log::debug!(
                "Dropping {} message for round {}: {:?}",
                message.message_type(),
                message.round(),
                err
            );
            None
        }
    }
}

/// A message waiting for its retry delay to elapse.
struct RetryTask {
    due: Instant,
    cancel: CancellationToken,
    message: BlockMessage,
}

// Ordered so that `BinaryHeap` pops the earliest `due` first.
impl Ord for RetryTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

impl PartialOrd for RetryTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RetryTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for RetryTask {}

fn start_retry_scheduler(
    queue: DispatcherHandle,
    scheduled: Receiver<RetryTask>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut pending: BinaryHeap<RetryTask> = BinaryHeap::new();
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => return,
            }

            let now = Instant::now();
            while pending.peek().is_some_and(|task| task.due <= now) {
                if let Some(task) = pending.pop() {
                    if !task.cancel.is_cancelled() {
                        queue.dispatch(task.message);
                    }
                }
            }

            let wait = pending
                .peek()
                .map_or(POLL_INTERVAL, |task| task.due.saturating_duration_since(now))
                .min(POLL_INTERVAL);
            match scheduled.recv_timeout(wait) {
                Ok(task) => pending.push(task),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::{
        networking::messages::Message,
        types::{crypto_primitives::Keypair, data_types::CryptoHash, tickets::BlockVerificationTicket},
    };

    /// Reports every message as too early until `ready` is set.
    struct LateRound {
        ready: AtomicBool,
        attempts: AtomicUsize,
        handled: AtomicUsize,
    }

    impl BlockMessageHandler for LateRound {
        fn handle_block_message(&self, message: &BlockMessage) -> Result<(), ProtocolError> {
            self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
            if !self.ready.load(AtomicOrdering::SeqCst) {
                return Err(ProtocolError::RoundNotStarted(message.round()));
            }
            self.handled.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    fn ticket_message(round: i64) -> BlockMessage {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng {}));
        let ticket = BlockVerificationTicket::new(&keypair, CryptoHash::new([0xab; 32]), RoundNumber::new(round));
        BlockMessage::new(keypair.public(), Message::VerificationTicket(ticket))
    }

    fn start(handler: Arc<LateRound>, tokens: RetryTokens) -> (JoinHandle<()>, DispatcherHandle, Sender<()>) {
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let config = DispatcherConfiguration {
            capacity: 16,
            network_delta: Duration::from_millis(50),
        };
        let (worker, handle) = start_dispatcher(config, handler, tokens, None, shutdown_receiver);
        (worker, handle, shutdown)
    }

    #[test]
    fn early_message_is_retried_until_handled() {
        let handler = Arc::new(LateRound {
            ready: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        });
        let (worker, handle, shutdown) = start(handler.clone(), RetryTokens::new());

        assert!(handle.dispatch(ticket_message(10)));
        thread::sleep(Duration::from_millis(30));
        assert!(handler.attempts.load(AtomicOrdering::SeqCst) >= 1);
        assert_eq!(handler.handled.load(AtomicOrdering::SeqCst), 0);

        handler.ready.store(true, AtomicOrdering::SeqCst);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(handler.handled.load(AtomicOrdering::SeqCst), 1);

        shutdown.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn cancelled_retries_are_not_requeued() {
        let handler = Arc::new(LateRound {
            ready: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        });
        let tokens = RetryTokens::new();
        let (worker, handle, shutdown) = start(handler.clone(), tokens.clone());

        handle.dispatch(ticket_message(10));
        while handler.attempts.load(AtomicOrdering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // The first retry is due at least 10ms after the first attempt.
        thread::sleep(Duration::from_millis(2));
        tokens.cancel_below(RoundNumber::new(11));
        handler.ready.store(true, AtomicOrdering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(handler.handled.load(AtomicOrdering::SeqCst), 0);

        shutdown.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn tokens_below_a_round_are_cancelled() {
        let tokens = RetryTokens::new();
        let old = tokens.token_for(RoundNumber::new(3));
        let current = tokens.token_for(RoundNumber::new(7));
        tokens.cancel_below(RoundNumber::new(5));
        assert!(old.is_cancelled());
        assert!(!current.is_cancelled());
        assert!(!tokens.token_for(RoundNumber::new(7)).is_cancelled());
    }
}
