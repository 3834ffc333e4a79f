//! Shared fixtures: deterministic BLS validators, in-memory external
//! collaborators, and helpers for hand-crafting signed messages.

#![allow(dead_code)]

use blsbft::config::ConsensusConfig;
use blsbft::consensus::deps::{AppConnection, BlockStore, ChainState, Epoch, Mempool};
use blsbft::consensus::ConsensusState;
use blsbft::crypto::SecretKey;
use blsbft::types::{
    Block, BlockId, Commit, Hash, PartSet, PartSetHeader, Proposal, ValidatorSet, Validator, Vote,
    VoteKind,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const CHAIN_ID: &str = "testchain";
pub const PART_SIZE: usize = 64;

/// A validator set with its secret keys, reordered to match the set's
/// canonical (address-sorted) order, so index i signs for validator i.
pub struct TestValidators {
    pub seeds: Vec<[u8; 32]>,
    pub set: ValidatorSet,
}

impl TestValidators {
    pub fn new(n: usize, power: u64) -> Self {
        let seeds: Vec<[u8; 32]> = (0..n).map(|i| [i as u8 + 1; 32]).collect();
        let validators: Vec<Validator> = seeds
            .iter()
            .map(|seed| Validator::new(SecretKey::from_ikm(seed).public(), power))
            .collect();
        let set = ValidatorSet::new(validators);
        // reorder seeds to the set's sorted order
        let mut by_address: HashMap<_, [u8; 32]> = seeds
            .into_iter()
            .map(|seed| {
                let pk = SecretKey::from_ikm(&seed).public();
                (
                    blsbft::types::Address::from_pubkey_bytes(&pk.encode()),
                    seed,
                )
            })
            .collect();
        let seeds = set
            .validators()
            .iter()
            .map(|v| by_address.remove(&v.address).expect("seed for validator"))
            .collect();
        TestValidators { seeds, set }
    }

    pub fn key(&self, index: usize) -> SecretKey {
        SecretKey::from_ikm(&self.seeds[index])
    }

    /// The index of the round-0 proposer at the current accumulator state.
    pub fn proposer_index(&self) -> usize {
        let addr = self.set.proposer().address;
        self.set
            .get_by_address(&addr)
            .expect("proposer in set")
            .0
    }

    pub fn vote(
        &self,
        index: usize,
        height: u64,
        round: u32,
        kind: VoteKind,
        block_id: BlockId,
    ) -> Vote {
        let mut vote = Vote {
            validator_index: index as u32,
            validator_address: self.set.validators()[index].address,
            height,
            round,
            kind,
            block_id,
            signature: None,
        };
        vote.signature = Some(self.key(index).sign(&vote.sign_bytes(CHAIN_ID)));
        vote
    }

    pub fn proposal(
        &self,
        index: usize,
        height: u64,
        round: u32,
        block_id: BlockId,
        pol_round: i32,
        pol_block_id: BlockId,
    ) -> Proposal {
        let mut proposal = Proposal::new(
            height,
            round,
            block_id,
            pol_round,
            pol_block_id,
            self.set.validators()[index].address,
        );
        proposal.signature = Some(self.key(index).sign(&proposal.sign_bytes(CHAIN_ID)));
        proposal
    }
}

// ---------------------------------------------------------------------
// External collaborator doubles
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemStoreInner {
    height: u64,
    blocks: HashMap<u64, Block>,
    seen_commits: HashMap<u64, Commit>,
}

/// In-memory block archive.
#[derive(Default)]
pub struct MemBlockStore {
    inner: Mutex<MemStoreInner>,
}

impl BlockStore for MemBlockStore {
    fn height(&self) -> u64 {
        self.inner.lock().unwrap().height
    }

    fn save_block(&self, block: &Block, _parts: &PartSet, seen_commit: &Commit) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let height = block.header.height;
        anyhow::ensure!(height == inner.height + 1, "out of order save");
        inner.blocks.insert(height, block.clone());
        inner.seen_commits.insert(height, seen_commit.clone());
        inner.height = height;
        Ok(())
    }

    fn load_block(&self, height: u64) -> anyhow::Result<Option<Block>> {
        Ok(self.inner.lock().unwrap().blocks.get(&height).cloned())
    }

    fn load_seen_commit(&self, height: u64) -> anyhow::Result<Option<Commit>> {
        Ok(self.inner.lock().unwrap().seen_commits.get(&height).cloned())
    }

    fn load_block_commit(&self, height: u64) -> anyhow::Result<Option<Commit>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blocks
            .get(&(height + 1))
            .and_then(|b| b.last_commit.clone()))
    }
}

pub struct NullMempool;

impl Mempool for NullMempool {
    fn reap(&self, _max_bytes: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// Fixed validator set, no epoch rotation.
pub struct StaticEpoch {
    pub set: ValidatorSet,
}

impl Epoch for StaticEpoch {
    fn validators(&self, _height: u64) -> ValidatorSet {
        self.set.clone()
    }

    fn propose_transactions(&self, _role: &str, _height: u64) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    fn should_propose_next_epoch(&self, _height: u64) -> bool {
        false
    }

    fn propose_next_epoch(&self, _height: u64) -> Vec<u8> {
        Vec::new()
    }

    fn validate_next_epoch(&self, _descriptor: &[u8], _height: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records applied heights; keeps the validator set and app hash fixed.
pub struct TestApp {
    pub validators: ValidatorSet,
    pub applied: Arc<Mutex<Vec<u64>>>,
}

impl AppConnection for TestApp {
    fn apply_block(
        &mut self,
        block: &Block,
        parts_header: &PartSetHeader,
        _mempool: &dyn Mempool,
    ) -> anyhow::Result<ChainState> {
        self.applied.lock().unwrap().push(block.header.height);
        Ok(ChainState {
            chain_id: CHAIN_ID.to_string(),
            last_block_height: block.header.height,
            last_block_id: BlockId {
                hash: block.hash(),
                parts_header: *parts_header,
            },
            app_hash: Hash::ZERO,
            validators: self.validators.clone(),
            last_validators: self.validators.clone(),
        })
    }
}

// ---------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------

pub fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        chain_id: CHAIN_ID.to_string(),
        block_part_size: PART_SIZE,
        new_height_delay: 0,
        sign_aggr_gossip_delay: 0,
        timeout_commit: 0,
        ..ConsensusConfig::default()
    }
}

pub fn genesis_state(set: &ValidatorSet) -> ChainState {
    ChainState {
        chain_id: CHAIN_ID.to_string(),
        last_block_height: 0,
        last_block_id: BlockId::nil(),
        app_hash: Hash::ZERO,
        validators: set.clone(),
        last_validators: set.clone(),
    }
}

pub struct TestNode {
    pub cs: ConsensusState,
    pub store: Arc<MemBlockStore>,
    pub applied: Arc<Mutex<Vec<u64>>>,
}

/// A consensus state over in-memory collaborators, signing as the
/// validator at `our_index`.
pub fn make_node(vals: &TestValidators, our_index: usize, config: ConsensusConfig) -> TestNode {
    make_node_with_store(vals, our_index, config, Arc::new(MemBlockStore::default()))
}

/// Same, but over an existing block store (crash-recovery scenarios).
pub fn make_node_with_store(
    vals: &TestValidators,
    our_index: usize,
    config: ConsensusConfig,
    store: Arc<MemBlockStore>,
) -> TestNode {
    let applied = Arc::new(Mutex::new(Vec::new()));
    let app = TestApp {
        validators: vals.set.clone(),
        applied: applied.clone(),
    };
    let mut cs = ConsensusState::new(
        config,
        genesis_state(&vals.set),
        store.clone(),
        Arc::new(NullMempool),
        Arc::new(StaticEpoch {
            set: vals.set.clone(),
        }),
        Box::new(app),
    );
    cs.set_priv_validator(Box::new(blsbft::types::FilePrivValidator::new(
        vals.key(our_index),
    )));
    TestNode {
        cs,
        store,
        applied,
    }
}

/// A block proposable at height 1 against the genesis state.
pub fn make_height1_block(vals: &TestValidators, txs: Vec<Vec<u8>>) -> (Block, PartSet, BlockId) {
    let block = Block::make(
        1,
        CHAIN_ID.to_string(),
        txs,
        None,
        BlockId::nil(),
        vals.set.hash(),
        Hash::ZERO,
        Vec::new(),
    );
    let parts = block.make_part_set(PART_SIZE);
    let block_id = BlockId {
        hash: block.hash(),
        parts_header: parts.header(),
    };
    (block, parts, block_id)
}
