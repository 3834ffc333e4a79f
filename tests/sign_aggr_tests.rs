mod common;

use blsbft::types::{BlockId, Hash, PartSetHeader, SignAggr, Vote, VoteKind};
use common::{TestValidators, CHAIN_ID};

fn block_id(seed: u8) -> BlockId {
    BlockId {
        hash: Hash([seed; 32]),
        parts_header: PartSetHeader {
            total: 1,
            root: Hash([seed; 32]),
        },
    }
}

fn votes_for(
    vals: &TestValidators,
    indexes: &[usize],
    block_id: BlockId,
    kind: VoteKind,
) -> Vec<Option<Vote>> {
    let mut votes = vec![None; vals.set.len()];
    for &i in indexes {
        votes[i] = Some(vals.vote(i, 1, 0, kind, block_id));
    }
    votes
}

#[test]
fn aggregate_of_quorum_verifies_as_maj23() {
    let vals = TestValidators::new(4, 1);
    let b = block_id(1);
    let votes = votes_for(&vals, &[0, 1, 2], b, VoteKind::Precommit);

    let aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    assert_eq!(aggr.signers.count_set(), 3);
    assert!(aggr.verify(&vals.set).unwrap(), "3 of 4 equal weights is +2/3");
}

#[test]
fn aggregate_short_of_quorum_fails_power_test() {
    let vals = TestValidators::new(4, 1);
    let b = block_id(1);
    let votes = votes_for(&vals, &[0, 1], b, VoteKind::Precommit);

    let aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    // the signature itself is sound, only the power is short
    assert!(!aggr.verify(&vals.set).unwrap(), "2 of 4 is not +2/3");
}

#[test]
fn aggregate_skips_votes_for_other_blocks() {
    let vals = TestValidators::new(4, 1);
    let b = block_id(1);
    let mut votes = votes_for(&vals, &[0, 1, 2], b, VoteKind::Prevote);
    votes[3] = Some(vals.vote(3, 1, 0, VoteKind::Prevote, block_id(2)));

    let aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Prevote, b, &votes).unwrap();
    assert!(!aggr.signers.get(3), "vote for another block contributes no bit");
    assert!(aggr.verify(&vals.set).unwrap());
}

#[test]
fn bitmap_size_mismatch_is_an_error() {
    let vals = TestValidators::new(4, 1);
    let smaller = TestValidators::new(3, 1);
    let b = block_id(1);
    let votes = votes_for(&vals, &[0, 1, 2], b, VoteKind::Precommit);

    let aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    assert!(aggr.verify(&smaller.set).is_err());
}

#[test]
fn tampered_fields_fail_verification() {
    let vals = TestValidators::new(4, 1);
    let b = block_id(1);
    let votes = votes_for(&vals, &[0, 1, 2], b, VoteKind::Precommit);

    let mut aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    aggr.round = 1;
    assert!(aggr.verify(&vals.set).is_err(), "signature covers the round");

    let mut aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    aggr.block_id = block_id(9);
    assert!(aggr.verify(&vals.set).is_err(), "signature covers the block id");

    // claiming a signer who never signed breaks the aggregate pubkey
    let mut aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    aggr.signers.set(3, true);
    assert!(aggr.verify(&vals.set).is_err());
}

#[test]
fn commit_roundtrip() {
    let vals = TestValidators::new(4, 1);
    let b = block_id(1);
    let votes = votes_for(&vals, &[0, 1, 2], b, VoteKind::Precommit);

    let aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    let commit = aggr.make_commit().unwrap();
    assert_eq!(commit.height, 1);
    assert_eq!(commit.block_id, b);

    let rebuilt = SignAggr::from_commit(CHAIN_ID, &commit);
    assert!(rebuilt.verify(&vals.set).unwrap());
    assert!(rebuilt.has_two_thirds_majority(&vals.set));
}

#[test]
fn prevote_aggregate_cannot_make_commit() {
    let vals = TestValidators::new(4, 1);
    let b = block_id(1);
    let votes = votes_for(&vals, &[0, 1, 2], b, VoteKind::Prevote);

    let aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Prevote, b, &votes).unwrap();
    assert!(aggr.make_commit().is_err());
}

#[test]
fn straggler_vote_folds_into_aggregate() {
    let vals = TestValidators::new(4, 1);
    let b = block_id(1);
    let votes = votes_for(&vals, &[0, 1, 2], b, VoteKind::Precommit);

    let mut aggr = SignAggr::aggregate(CHAIN_ID, 1, 0, VoteKind::Precommit, b, &votes).unwrap();
    assert!(!aggr.has_all());

    let straggler = vals.vote(3, 1, 0, VoteKind::Precommit, b);
    assert!(aggr.add_vote(&straggler, &vals.set).unwrap());
    assert!(aggr.has_all());
    assert!(aggr.verify(&vals.set).unwrap());

    // folding the same signer twice is refused
    assert!(!aggr.add_vote(&straggler, &vals.set).unwrap());
}
