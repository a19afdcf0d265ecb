/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use crate::types::data_types::RoundNumber;

use super::state::Round;

/// The rounds this node currently knows about, keyed by round number.
///
/// Creating a round is a get-or-create under the registry's lock, so concurrent callers asking for the
/// same round number always end up with the same [`Round`].
#[derive(Default)]
pub struct RoundRegistry {
    rounds: Mutex<BTreeMap<RoundNumber, Arc<Round>>>,
}

impl RoundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, number: RoundNumber) -> Option<Arc<Round>> {
        self.rounds.lock().unwrap().get(&number).cloned()
    }

    /// Get the round with `number`, creating it if it does not exist yet. The second value is `true`
    /// if this call created the round.
    pub fn get_or_create(&self, number: RoundNumber) -> (Arc<Round>, bool) {
        let mut rounds = self.rounds.lock().unwrap();
        if let Some(round) = rounds.get(&number) {
            return (round.clone(), false);
        }
        let round = Arc::new(Round::new(number));
        rounds.insert(number, round.clone());
        (round, true)
    }

    /// Remove every round below `number`, returning the removed rounds so that their remaining work can
    /// be cancelled.
    pub fn prune_below(&self, number: RoundNumber) -> Vec<Arc<Round>> {
        let mut rounds = self.rounds.lock().unwrap();
        let kept = rounds.split_off(&number);
        let pruned = std::mem::replace(&mut *rounds, kept);
        pruned.into_values().collect()
    }

    /// Every known round, in ascending order.
    pub fn all(&self) -> Vec<Arc<Round>> {
        self.rounds.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn concurrent_get_or_create_converges_on_one_round() {
        let registry = Arc::new(RoundRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.get_or_create(RoundNumber::new(3)))
            })
            .collect();
        let results: Vec<(Arc<Round>, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        for (round, _) in &results {
            assert!(Arc::ptr_eq(round, &results[0].0));
        }
    }

    #[test]
    fn prune_below_returns_old_rounds() {
        let registry = RoundRegistry::new();
        for n in 1..=5 {
            registry.get_or_create(RoundNumber::new(n));
        }
        let pruned = registry.prune_below(RoundNumber::new(4));
        assert_eq!(pruned.len(), 3);
        assert!(registry.get(RoundNumber::new(3)).is_none());
        assert!(registry.get(RoundNumber::new(4)).is_some());
        assert_eq!(registry.all().len(), 2);
    }
}
