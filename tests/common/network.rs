use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use ed25519_dalek::VerifyingKey;
use miner_rounds::{
    networking::{messages::Message, network::Network},
    types::miner_set::MinerSet,
};

/// A mock network stub which passes messages from and to threads using channels.
///
/// A stub can be [partitioned](NetworkStub::set_partitioned), after which everything it sends or receives
/// is dropped.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_verifying_key: VerifyingKey,
    all_peers: HashMap<VerifyingKey, Sender<(VerifyingKey, Message)>>,
    inbox: Arc<Mutex<Receiver<(VerifyingKey, Message)>>>,
    partitioned: Arc<AtomicBool>,
}

impl NetworkStub {
    pub(crate) fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst)
    }

    fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }
}

impl Network for NetworkStub {
    fn init_miner_set(&mut self, _: MinerSet) {}

    fn broadcast(&mut self, message: Message) {
        if self.is_partitioned() {
            return;
        }
        for peer in self.all_peers.values() {
            let _ = peer.send((self.my_verifying_key, message.clone()));
        }
    }

    fn send(&mut self, peer: VerifyingKey, message: Message) {
        if self.is_partitioned() {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.my_verifying_key, message));
        }
    }

    fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
        let inbox = self.inbox.lock().unwrap();
        loop {
            match inbox.try_recv() {
                Ok(_) if self.is_partitioned() => continue,
                Ok(o_m) => return Some(o_m),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => panic!(),
            }
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = VerifyingKey>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(VerifyingKey, Receiver<(VerifyingKey, Message)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(my_verifying_key, inbox)| NetworkStub {
            my_verifying_key,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            partitioned: Arc::new(AtomicBool::new(false)),
        })
        .collect()
}
