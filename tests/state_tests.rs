//! End-to-end scenarios for the round state machine, driven
//! synchronously through the public message and timeout handlers.

mod common;

use blsbft::consensus::messages::{ConsensusMessage, MsgInfo, RoundStep, TimeoutInfo};
use blsbft::consensus::state::ConsensusState;
use blsbft::storage::wal::{Wal, WalRecord};
use blsbft::types::{BlockId, PartSet, SignAggr, Vote, VoteKind};
use common::*;
use std::time::Duration;

fn start_height(cs: &mut ConsensusState) {
    let height = cs.round_state().height;
    cs.handle_timeout(TimeoutInfo {
        duration: Duration::ZERO,
        height,
        round: 0,
        step: RoundStep::NewHeight,
    });
}

fn peer_vote(cs: &mut ConsensusState, vote: Vote) {
    cs.handle_msg(MsgInfo::from_peer(
        ConsensusMessage::Vote(vote),
        "peer".into(),
    ));
}

fn feed_proposal_and_parts(
    cs: &mut ConsensusState,
    vals: &TestValidators,
    proposer: usize,
    round: u32,
    block_id: BlockId,
    parts: &PartSet,
) {
    let proposal = vals.proposal(proposer, 1, round, block_id, -1, BlockId::nil());
    cs.handle_msg(MsgInfo::from_peer(
        ConsensusMessage::Proposal(proposal),
        "peer".into(),
    ));
    for part in parts.parts() {
        cs.handle_msg(MsgInfo::from_peer(
            ConsensusMessage::BlockPart {
                height: 1,
                round,
                part: part.clone(),
            },
            "peer".into(),
        ));
    }
}

/// Drives a proposer node through height 1 at round 0 with the other
/// validators' votes injected. Returns the committed block id.
fn run_happy_height(node: &mut TestNode, vals: &TestValidators, proposer: usize) -> BlockId {
    start_height(&mut node.cs);
    node.cs.drain_internal_queue();

    assert_eq!(node.cs.round_state().step, RoundStep::Prevote);
    let block_id = node.cs.round_state().proposal.as_ref().unwrap().block_id;

    let peers: Vec<usize> = (0..vals.set.len()).filter(|i| *i != proposer).collect();
    for &i in &peers[..2] {
        peer_vote(&mut node.cs, vals.vote(i, 1, 0, VoteKind::Prevote, block_id));
    }
    node.cs.drain_internal_queue();
    assert_eq!(node.cs.round_state().locked_round, 0);

    for &i in &peers[..2] {
        peer_vote(&mut node.cs, vals.vote(i, 1, 0, VoteKind::Precommit, block_id));
    }
    block_id
}

#[test]
fn happy_path_commits_at_round_zero() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let mut node = make_node(&vals, proposer, test_config());

    let block_id = run_happy_height(&mut node, &vals, proposer);

    assert_eq!(node.store.height(), 1);
    assert_eq!(node.applied.lock().unwrap().as_slice(), &[1]);

    let rs = node.cs.round_state();
    assert_eq!(rs.height, 2);
    assert_eq!(rs.round, 0);
    assert_eq!(rs.step, RoundStep::NewHeight);
    assert_eq!(rs.commit_round, -1);

    // the commit promoted to LastCommit covers the block with +2/3 power
    let last_commit = rs.last_commit.as_ref().unwrap();
    assert_eq!(last_commit.maj23, block_id);
    assert!(last_commit.has_two_thirds_majority(&vals.set));
    assert!(last_commit.verify(&vals.set).unwrap());

    let seen = node.store.load_seen_commit(1).unwrap().unwrap();
    assert_eq!(seen.block_id, block_id);
    assert_eq!(seen.round, 0);
}

#[test]
fn non_proposer_prevotes_received_proposal() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());

    start_height(&mut node.cs);
    assert_eq!(node.cs.round_state().step, RoundStep::Propose);

    let (block, parts, block_id) = make_height1_block(&vals, vec![b"tx".to_vec()]);
    feed_proposal_and_parts(&mut node.cs, &vals, proposer, 0, block_id, &parts);
    node.cs.drain_internal_queue();

    let rs = node.cs.round_state();
    assert_eq!(rs.step, RoundStep::Prevote);
    assert_eq!(rs.proposal_block.as_ref().unwrap().hash(), block.hash());
    let prevotes = rs.votes.prevotes(0).unwrap();
    assert_eq!(prevotes.tallied_for(&block_id), 1, "we prevoted the proposal");
}

#[test]
fn proposal_with_bad_signature_or_pol_round_rejected() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());
    start_height(&mut node.cs);

    let (_, _, block_id) = make_height1_block(&vals, vec![]);

    // signed by the wrong validator
    let imposter = (proposer + 2) % vals.set.len();
    let forged = vals.proposal(imposter, 1, 0, block_id, -1, BlockId::nil());
    node.cs
        .handle_msg(MsgInfo::from_peer(ConsensusMessage::Proposal(forged), "peer".into()));
    assert!(node.cs.round_state().proposal.is_none());

    // POL round must be -1 or an earlier round: 0 at round 0 is invalid
    let mut bad_pol = vals.proposal(proposer, 1, 0, block_id, 0, block_id);
    bad_pol.signature = Some(
        vals.key(proposer)
            .sign(&bad_pol.sign_bytes(CHAIN_ID)),
    );
    node.cs
        .handle_msg(MsgInfo::from_peer(ConsensusMessage::Proposal(bad_pol), "peer".into()));
    assert!(node.cs.round_state().proposal.is_none());
}

#[test]
fn propose_timeout_leads_to_nil_prevote() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());
    start_height(&mut node.cs);

    node.cs.handle_timeout(TimeoutInfo {
        duration: Duration::ZERO,
        height: 1,
        round: 0,
        step: RoundStep::Propose,
    });
    node.cs.drain_internal_queue();

    let rs = node.cs.round_state();
    assert_eq!(rs.step, RoundStep::Prevote);
    let our_vote = rs.votes.prevotes(0).unwrap().votes()[our].as_ref().unwrap();
    assert!(our_vote.block_id.is_nil(), "no proposal means a nil prevote");
}

#[test]
fn stale_timeouts_are_discarded() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());
    start_height(&mut node.cs);

    let tick = TimeoutInfo {
        duration: Duration::ZERO,
        height: 1,
        round: 0,
        step: RoundStep::Propose,
    };
    node.cs.handle_timeout(tick);
    node.cs.drain_internal_queue();
    assert_eq!(node.cs.round_state().step, RoundStep::Prevote);

    // the same tick again is behind the current step now
    node.cs.handle_timeout(tick);
    node.cs.drain_internal_queue();
    assert_eq!(node.cs.round_state().step, RoundStep::Prevote);

    // a tick for another height is ignored outright
    node.cs.handle_timeout(TimeoutInfo {
        duration: Duration::ZERO,
        height: 9,
        round: 0,
        step: RoundStep::Propose,
    });
    assert_eq!(node.cs.round_state().height, 1);
}

/// A validator locked at round 0 keeps prevoting its locked block in
/// later rounds, whatever those rounds propose.
#[test]
fn lock_carries_across_rounds() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());
    start_height(&mut node.cs);

    let (block, parts, block_id) = make_height1_block(&vals, vec![b"tx".to_vec()]);
    feed_proposal_and_parts(&mut node.cs, &vals, proposer, 0, block_id, &parts);
    node.cs.drain_internal_queue();

    // two more prevotes for the block: polka, we lock and precommit it
    let others: Vec<usize> = (0..vals.set.len())
        .filter(|i| *i != our && *i != proposer)
        .collect();
    peer_vote(&mut node.cs, vals.vote(proposer, 1, 0, VoteKind::Prevote, block_id));
    peer_vote(&mut node.cs, vals.vote(others[0], 1, 0, VoteKind::Prevote, block_id));
    node.cs.drain_internal_queue();

    let rs = node.cs.round_state();
    assert_eq!(rs.locked_round, 0);
    assert_eq!(rs.locked_block.as_ref().unwrap().hash(), block.hash());
    assert_eq!(rs.step, RoundStep::Precommit);

    // the round dies: stragglers precommit nil, wait, then round 1
    peer_vote(&mut node.cs, vals.vote(proposer, 1, 0, VoteKind::Precommit, BlockId::nil()));
    peer_vote(&mut node.cs, vals.vote(others[0], 1, 0, VoteKind::Precommit, BlockId::nil()));
    assert_eq!(node.cs.round_state().step, RoundStep::PrecommitWait);

    node.cs.handle_timeout(TimeoutInfo {
        duration: Duration::ZERO,
        height: 1,
        round: 0,
        step: RoundStep::PrecommitWait,
    });
    node.cs.drain_internal_queue();

    let rs = node.cs.round_state();
    assert_eq!(rs.round, 1);
    assert_eq!(rs.locked_round, 0, "the lock survives the round change");

    // ensure we prevoted in round 1, for the locked block
    node.cs.handle_timeout(TimeoutInfo {
        duration: Duration::ZERO,
        height: 1,
        round: 1,
        step: RoundStep::Propose,
    });
    node.cs.drain_internal_queue();
    let rs = node.cs.round_state();
    let our_vote = rs.votes.prevotes(1).unwrap().votes()[our].as_ref().unwrap();
    assert_eq!(our_vote.block_id.hash, block.hash());
}

/// A +2/3 nil polka releases the lock.
#[test]
fn unlock_on_nil_polka() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());
    start_height(&mut node.cs);

    let (_, parts, block_id) = make_height1_block(&vals, vec![b"tx".to_vec()]);
    feed_proposal_and_parts(&mut node.cs, &vals, proposer, 0, block_id, &parts);
    node.cs.drain_internal_queue();

    let others: Vec<usize> = (0..vals.set.len())
        .filter(|i| *i != our && *i != proposer)
        .collect();
    peer_vote(&mut node.cs, vals.vote(proposer, 1, 0, VoteKind::Prevote, block_id));
    peer_vote(&mut node.cs, vals.vote(others[0], 1, 0, VoteKind::Prevote, block_id));
    node.cs.drain_internal_queue();
    assert_eq!(node.cs.round_state().locked_round, 0);

    // dead round, move to round 1
    peer_vote(&mut node.cs, vals.vote(proposer, 1, 0, VoteKind::Precommit, BlockId::nil()));
    peer_vote(&mut node.cs, vals.vote(others[0], 1, 0, VoteKind::Precommit, BlockId::nil()));
    node.cs.handle_timeout(TimeoutInfo {
        duration: Duration::ZERO,
        height: 1,
        round: 0,
        step: RoundStep::PrecommitWait,
    });
    node.cs.drain_internal_queue();
    assert_eq!(node.cs.round_state().round, 1);

    // everyone else prevotes nil in round 1: nil polka
    for &i in [proposer, others[0], others[1]].iter() {
        peer_vote(&mut node.cs, vals.vote(i, 1, 1, VoteKind::Prevote, BlockId::nil()));
    }
    node.cs.drain_internal_queue();

    let rs = node.cs.round_state();
    assert_eq!(rs.locked_round, -1, "nil polka unlocks");
    assert!(rs.locked_block.is_none());
    let our_precommit = rs.votes.precommits(1).unwrap().votes()[our].as_ref().unwrap();
    assert!(our_precommit.block_id.is_nil());
}

/// An aggregate whose bitmap power falls short of +2/3 is rejected and
/// leaves state untouched.
#[test]
fn short_quorum_aggregate_rejected() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());
    start_height(&mut node.cs);

    let (_, _, block_id) = make_height1_block(&vals, vec![]);
    let mut votes: Vec<Option<Vote>> = vec![None; vals.set.len()];
    votes[0] = Some(vals.vote(0, 1, 0, VoteKind::Prevote, block_id));
    votes[1] = Some(vals.vote(1, 1, 0, VoteKind::Prevote, block_id));
    let aggr =
        SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Prevote, block_id, &votes).unwrap();

    node.cs.handle_msg(MsgInfo::from_peer(
        ConsensusMessage::Maj23SignAggr(aggr),
        "peer".into(),
    ));

    let rs = node.cs.round_state();
    assert!(rs.prevote_maj23_sign_aggr.is_none());
    assert!(rs.votes.prevotes(0).unwrap().two_thirds_majority().is_none());
    assert_eq!(rs.step, RoundStep::Propose, "no transition happened");
}

/// A valid +2/3 prevote aggregate from a peer is installed and, with the
/// proposal complete, moves us to precommit.
#[test]
fn peer_prevote_aggregate_advances_to_precommit() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let our = (proposer + 1) % vals.set.len();
    let mut node = make_node(&vals, our, test_config());
    start_height(&mut node.cs);

    let (block, parts, block_id) = make_height1_block(&vals, vec![b"tx".to_vec()]);
    feed_proposal_and_parts(&mut node.cs, &vals, proposer, 0, block_id, &parts);

    let mut votes: Vec<Option<Vote>> = vec![None; vals.set.len()];
    for i in [proposer, (proposer + 2) % 4, (proposer + 3) % 4] {
        votes[i] = Some(vals.vote(i, 1, 0, VoteKind::Prevote, block_id));
    }
    let aggr =
        SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Prevote, block_id, &votes).unwrap();
    node.cs.handle_msg(MsgInfo::from_peer(
        ConsensusMessage::Maj23SignAggr(aggr),
        "peer".into(),
    ));
    node.cs.drain_internal_queue();

    let rs = node.cs.round_state();
    assert!(rs.prevote_maj23_sign_aggr.is_some());
    assert!(rs.step >= RoundStep::Precommit);
    assert_eq!(rs.locked_block.as_ref().unwrap().hash(), block.hash());
}

/// Straggler precommits for the finalized height fold into LastCommit,
/// and with skip_timeout_commit set, a full commit skips the wait.
#[test]
fn straggler_precommit_completes_last_commit_and_skips_wait() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let mut config = test_config();
    config.skip_timeout_commit = true;
    // make sure the NewHeight wait would otherwise be long
    config.timeout_commit = 60_000;
    let mut node = make_node(&vals, proposer, config);

    let block_id = run_happy_height(&mut node, &vals, proposer);
    let rs = node.cs.round_state();
    assert_eq!(rs.height, 2);
    assert_eq!(rs.step, RoundStep::NewHeight);
    assert!(!rs.last_commit.as_ref().unwrap().has_all());

    // the fourth validator's precommit arrives late
    let peers: Vec<usize> = (0..vals.set.len()).filter(|i| *i != proposer).collect();
    let straggler = peers[2];
    peer_vote(&mut node.cs, vals.vote(straggler, 1, 0, VoteKind::Precommit, block_id));
    node.cs.drain_internal_queue();

    let rs = node.cs.round_state();
    assert!(rs.last_commit.as_ref().unwrap().has_all(), "bitmap now full");
    assert_eq!(rs.height, 2);
    assert!(
        rs.step >= RoundStep::Propose,
        "skip_timeout_commit jumps straight into round 0"
    );
}

/// Crash between save_block and the WAL end-height marker: on restart
/// the store already holds the block, replay re-finalizes it, the
/// end-height marker is restored, and the application re-applies
/// idempotently.
#[test]
fn wal_replay_recovers_crash_between_save_and_end_height() {
    let vals = TestValidators::new(4, 1);
    let proposer = vals.proposer_index();
    let dir = tempfile::tempdir().unwrap();

    let mut config = test_config();
    config.cs_wal_file = dir
        .path()
        .join("node1.wal")
        .to_string_lossy()
        .into_owned();

    let mut node1 = make_node(&vals, proposer, config.clone());
    node1.cs.open_wal().unwrap();
    run_happy_height(&mut node1, &vals, proposer);
    assert_eq!(node1.store.height(), 1);

    // rebuild the WAL as it looked just before the end-height marker
    let records = Wal::read_all(dir.path().join("node1.wal").as_path()).unwrap();

    // consecutive step records at the same (height, round) are strictly
    // increasing
    let mut last_step: Option<(u64, u32, RoundStep)> = None;
    for record in &records {
        if let WalRecord::NewRoundStep {
            height,
            round,
            step,
            ..
        } = record
        {
            if let Some((lh, lr, ls)) = last_step {
                if lh == *height && lr == *round {
                    assert!(*step > ls, "step regressed within {lh}/{lr}");
                }
            }
            last_step = Some((*height, *round, *step));
        }
    }
    let cut = records
        .iter()
        .position(|r| matches!(r, WalRecord::EndHeight(_)))
        .expect("end-height was written");
    let crash_wal = dir.path().join("node2.wal");
    let mut wal2 = Wal::open(&crash_wal, false).unwrap();
    for record in &records[..cut] {
        wal2.write(record).unwrap();
    }
    drop(wal2);

    // restart: block store says height 1, application state says 0
    let mut config2 = config.clone();
    config2.cs_wal_file = crash_wal.to_string_lossy().into_owned();
    let mut node2 = make_node_with_store(&vals, proposer, config2, node1.store.clone());
    node2.cs.open_wal().unwrap();
    node2.cs.catchup_replay().unwrap();

    let rs = node2.cs.round_state();
    assert_eq!(rs.height, 2, "replay finalized the saved block");
    assert_eq!(
        node2.applied.lock().unwrap().as_slice(),
        &[1],
        "apply_block re-invoked on replay"
    );
    assert_eq!(node1.store.height(), 1, "no double save");

    // the marker the crash lost is back
    let replayed = Wal::read_all(&crash_wal).unwrap();
    assert!(replayed
        .iter()
        .any(|r| matches!(r, WalRecord::EndHeight(1))));

    // LastCommit reconstructed from the aggregate matches the stored one
    let last_commit = rs.last_commit.as_ref().unwrap();
    assert!(last_commit.has_two_thirds_majority(&vals.set));
}
