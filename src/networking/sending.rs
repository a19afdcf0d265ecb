/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round protocol's outbound side of the [`Network`].

use ed25519_dalek::VerifyingKey;

use crate::dispatcher::messages::MessageType;

use super::{messages::Message, network::Network};

/// Sends and broadcasts anything that converts [`Into<Message>`] on behalf of one miner.
///
/// Direct messages addressed to the miner itself are dropped, since the protocol applies its own
/// shares, tickets and blocks locally before sending them.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
    me: VerifyingKey,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N, me: VerifyingKey) -> Self {
        Self { network, me }
    }

    pub(crate) fn send<S: Into<Message>>(&mut self, peer: VerifyingKey, msg: S) {
        if peer == self.me {
            return;
        }
        let msg = msg.into();
        log::trace!(
            "Sending {} message for round {}",
            MessageType::from(&msg),
            msg.round()
        );
        self.network.send(peer, msg)
    }

    pub(crate) fn broadcast<S: Into<Message>>(&mut self, msg: S) {
        let msg = msg.into();
        log::trace!(
            "Broadcasting {} message for round {}",
            MessageType::from(&msg),
            msg.round()
        );
        self.network.broadcast(msg)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::types::{
        crypto_primitives::Keypair,
        data_types::{CryptoHash, RoundNumber},
        miner_set::MinerSet,
        tickets::BlockVerificationTicket,
    };

    #[derive(Clone, Default)]
    struct Outbox(Arc<Mutex<Vec<(Option<VerifyingKey>, Message)>>>);

    impl Network for Outbox {
        fn init_miner_set(&mut self, _: MinerSet) {}

        fn broadcast(&mut self, message: Message) {
            self.0.lock().unwrap().push((None, message))
        }

        fn send(&mut self, peer: VerifyingKey, message: Message) {
            self.0.lock().unwrap().push((Some(peer), message))
        }

        fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
            None
        }
    }

    #[test]
    fn messages_to_self_are_not_sent() {
        let me = Keypair::new(SigningKey::generate(&mut OsRng {}));
        let peer = SigningKey::generate(&mut OsRng {}).verifying_key();
        let ticket = BlockVerificationTicket::new(&me, CryptoHash::new([7u8; 32]), RoundNumber::new(4));

        let outbox = Outbox::default();
        let mut sender = SenderHandle::new(outbox.clone(), me.public());
        sender.send(me.public(), ticket);
        sender.send(peer, ticket);
        sender.broadcast(ticket);

        let sent = outbox.0.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Some(peer));
        assert_eq!(sent[1].0, None);
    }
}
