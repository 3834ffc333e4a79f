//! Interfaces to the engine's external collaborators. The consensus
//! core only ever sees these traits; concrete services (application,
//! block archive, mempool, epoch manager) live outside and are injected
//! at construction.

use crate::types::{Block, BlockId, Commit, Hash, PartSet, PartSetHeader, ValidatorSet};
use anyhow::Result;

/// Chain state as of the last applied block. Replaced wholesale after
/// each `apply_block`.
#[derive(Clone, Debug)]
pub struct ChainState {
    pub chain_id: String,
    pub last_block_height: u64,
    pub last_block_id: BlockId,
    pub app_hash: Hash,
    pub validators: ValidatorSet,
    pub last_validators: ValidatorSet,
}

/// Durable block + commit archive. Append-only; height is monotonic.
pub trait BlockStore: Send + Sync {
    fn height(&self) -> u64;
    /// Persists the block, its part set, and the local +2/3 precommit
    /// evidence that justified finalizing it.
    fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> Result<()>;
    fn load_block(&self, height: u64) -> Result<Option<Block>>;
    /// The seen-commit saved with the block at `height`.
    fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>>;
    /// The commit embedded in the block at `height + 1`.
    fn load_block_commit(&self, height: u64) -> Result<Option<Commit>>;
}

/// Source of candidate transactions.
pub trait Mempool: Send + Sync {
    fn reap(&self, max_bytes: usize) -> Vec<Vec<u8>>;
}

/// Validator-set and epoch management. Epoch boundaries may rotate the
/// validator set between heights; inside a height the set is fixed.
pub trait Epoch: Send + Sync {
    fn validators(&self, height: u64) -> ValidatorSet;
    fn propose_transactions(&self, role: &str, height: u64) -> Result<Vec<Vec<u8>>>;
    fn should_propose_next_epoch(&self, height: u64) -> bool;
    /// Encoded descriptor of the next epoch, carried as block extra data.
    fn propose_next_epoch(&self, height: u64) -> Vec<u8>;
    fn validate_next_epoch(&self, descriptor: &[u8], height: u64) -> Result<()>;
}

/// The application connection. `apply_block` executes the block against
/// application state and returns the chain state for the next height,
/// including any validator-set rotation. Blocking; called only from the
/// consensus actor during finalize.
pub trait AppConnection: Send {
    fn apply_block(
        &mut self,
        block: &Block,
        parts_header: &PartSetHeader,
        mempool: &dyn Mempool,
    ) -> Result<ChainState>;
}
