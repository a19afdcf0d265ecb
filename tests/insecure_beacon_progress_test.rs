use std::time::Duration;

use log::LevelFilter;
use miner_rounds::{beacon::BeaconMode, types::data_types::RoundNumber};

mod common;

use crate::common::{
    logging::setup_logger,
    node::{start_nodes, wait_until, Node},
};

#[test]
fn insecure_beacon_progress_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Start 4 miners without key material, whose rounds start on any 3 shares.
    let nodes: Vec<Node> = start_nodes(4, 2, BeaconMode::InsecureCountOnly { quorum: 3 }, 3);

    // 2. Poll the finalized round of every miner until every miner has finalized round 3.
    log::debug!("Polling the finalized round of every miner until it is at least 3.");
    wait_until(Duration::from_secs(60), "every miner finalized round 3", || {
        nodes
            .iter()
            .all(|node| node.finalized_round() >= RoundNumber::new(3))
    });

    // 3. Seeds follow from the previous seed alone, so they agree too.
    for number in 1..=3 {
        let round = RoundNumber::new(number);
        let seeds: Vec<_> = nodes
            .iter()
            .filter_map(|node| node.miner().round(round).map(|round| round.random_seed()))
            .collect();
        assert_eq!(seeds.len(), nodes.len());
        assert!(!seeds[0].is_zero());
        assert!(seeds.iter().all(|seed| *seed == seeds[0]));
    }
}
