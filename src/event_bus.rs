/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::events::*;
use crate::logging::Logger;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) start_round_handlers: Vec<HandlerPtr<StartRoundEvent>>,
    pub(crate) round_timeout_handlers: Vec<HandlerPtr<RoundTimeoutEvent>>,
    pub(crate) restart_round_handlers: Vec<HandlerPtr<RestartRoundEvent>>,
    pub(crate) finalize_round_handlers: Vec<HandlerPtr<FinalizeRoundEvent>>,
    pub(crate) add_vrf_share_handlers: Vec<HandlerPtr<AddVRFShareEvent>>,
    pub(crate) compute_random_seed_handlers: Vec<HandlerPtr<ComputeRandomSeedEvent>>,
    pub(crate) install_dkg_handlers: Vec<HandlerPtr<InstallDKGEvent>>,
    pub(crate) propose_block_handlers: Vec<HandlerPtr<ProposeBlockEvent>>,
    pub(crate) verify_block_handlers: Vec<HandlerPtr<VerifyBlockEvent>>,
    pub(crate) reject_block_handlers: Vec<HandlerPtr<RejectBlockEvent>>,
    pub(crate) send_ticket_handlers: Vec<HandlerPtr<SendTicketEvent>>,
    pub(crate) notarize_block_handlers: Vec<HandlerPtr<NotarizeBlockEvent>>,
    pub(crate) retry_message_handlers: Vec<HandlerPtr<RetryMessageEvent>>,
}

fn handlers<T: Logger>(log: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log {
        handlers.push(T::get_logger())
    }
    if let Some(handler) = user_handler {
        handlers.push(handler)
    }
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        start_round_handler: Option<HandlerPtr<StartRoundEvent>>,
        round_timeout_handler: Option<HandlerPtr<RoundTimeoutEvent>>,
        restart_round_handler: Option<HandlerPtr<RestartRoundEvent>>,
        finalize_round_handler: Option<HandlerPtr<FinalizeRoundEvent>>,
        add_vrf_share_handler: Option<HandlerPtr<AddVRFShareEvent>>,
        compute_random_seed_handler: Option<HandlerPtr<ComputeRandomSeedEvent>>,
        install_dkg_handler: Option<HandlerPtr<InstallDKGEvent>>,
        propose_block_handler: Option<HandlerPtr<ProposeBlockEvent>>,
        verify_block_handler: Option<HandlerPtr<VerifyBlockEvent>>,
        reject_block_handler: Option<HandlerPtr<RejectBlockEvent>>,
        send_ticket_handler: Option<HandlerPtr<SendTicketEvent>>,
        notarize_block_handler: Option<HandlerPtr<NotarizeBlockEvent>>,
        retry_message_handler: Option<HandlerPtr<RetryMessageEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            start_round_handlers: handlers(log_events, start_round_handler),
            round_timeout_handlers: handlers(log_events, round_timeout_handler),
            restart_round_handlers: handlers(log_events, restart_round_handler),
            finalize_round_handlers: handlers(log_events, finalize_round_handler),
            add_vrf_share_handlers: handlers(log_events, add_vrf_share_handler),
            compute_random_seed_handlers: handlers(log_events, compute_random_seed_handler),
            install_dkg_handlers: handlers(log_events, install_dkg_handler),
            propose_block_handlers: handlers(log_events, propose_block_handler),
            verify_block_handlers: handlers(log_events, verify_block_handler),
            reject_block_handlers: handlers(log_events, reject_block_handler),
            send_ticket_handlers: handlers(log_events, send_ticket_handler),
            notarize_block_handlers: handlers(log_events, notarize_block_handler),
            retry_message_handlers: handlers(log_events, retry_message_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start_round_handlers.is_empty()
            && self.round_timeout_handlers.is_empty()
            && self.restart_round_handlers.is_empty()
            && self.finalize_round_handlers.is_empty()
            && self.add_vrf_share_handlers.is_empty()
            && self.compute_random_seed_handlers.is_empty()
            && self.install_dkg_handlers.is_empty()
            && self.propose_block_handlers.is_empty()
            && self.verify_block_handlers.is_empty()
            && self.reject_block_handlers.is_empty()
            && self.send_ticket_handlers.is_empty()
            && self.notarize_block_handlers.is_empty()
            && self.retry_message_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartRound(start_round_event) =>
                self.start_round_handlers.iter().for_each(|handler| handler(&start_round_event)),

            Event::RoundTimeout(round_timeout_event) =>
                self.round_timeout_handlers.iter().for_each(|handler| handler(&round_timeout_event)),

            Event::RestartRound(restart_round_event) =>
                self.restart_round_handlers.iter().for_each(|handler| handler(&restart_round_event)),

            Event::FinalizeRound(finalize_round_event) =>
                self.finalize_round_handlers.iter().for_each(|handler| handler(&finalize_round_event)),

            Event::AddVRFShare(add_vrf_share_event) =>
                self.add_vrf_share_handlers.iter().for_each(|handler| handler(&add_vrf_share_event)),

            Event::ComputeRandomSeed(compute_random_seed_event) =>
                self.compute_random_seed_handlers.iter().for_each(|handler| handler(&compute_random_seed_event)),

            Event::InstallDKG(install_dkg_event) =>
                self.install_dkg_handlers.iter().for_each(|handler| handler(&install_dkg_event)),

            Event::ProposeBlock(propose_block_event) =>
                self.propose_block_handlers.iter().for_each(|handler| handler(&propose_block_event)),

            Event::VerifyBlock(verify_block_event) =>
                self.verify_block_handlers.iter().for_each(|handler| handler(&verify_block_event)),

            Event::RejectBlock(reject_block_event) =>
                self.reject_block_handlers.iter().for_each(|handler| handler(&reject_block_event)),

            Event::SendTicket(send_ticket_event) =>
                self.send_ticket_handlers.iter().for_each(|handler| handler(&send_ticket_event)),

            Event::NotarizeBlock(notarize_block_event) =>
                self.notarize_block_handlers.iter().for_each(|handler| handler(&notarize_block_event)),

            Event::RetryMessage(retry_message_event) =>
                self.retry_message_handlers.iter().for_each(|handler| handler(&retry_message_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone; wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(10)),
        }
    })
}
