/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving messages from the P2P network.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use crate::dispatcher::{messages::BlockMessage, DispatcherHandle};

use super::network::Network;

/// Spawn the poller thread, which polls the [`Network`] for messages and pushes each one, stamped with
/// its arrival time, into the dispatcher's queue.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    dispatcher: DispatcherHandle,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            dispatcher.dispatch(BlockMessage::new(origin, msg));
        } else {
            thread::yield_now()
        }
    })
}
