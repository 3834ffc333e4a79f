use crate::crypto::hash::sha256;
use crate::crypto::AggregateSignature;
use crate::types::part_set::{merkle_root, PartSet, PartSetHeader};
use crate::types::{BitArray, Hash};

/// Hash plus part-set header; uniquely identifies a block at a height.
/// The nil BlockId (empty hash, zero header) stands for "no block".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub hash: Hash,
    pub parts_header: PartSetHeader,
}

impl BlockId {
    pub fn nil() -> Self {
        BlockId::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.parts_header.is_zero()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            write!(f, "{}@{}", self.hash, self.parts_header)
        }
    }
}

/// The +2/3 precommit evidence carried in the next block's header chain
/// and stored alongside a saved block (seen-commit).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub height: u64,
    pub round: u32,
    pub block_id: BlockId,
    pub signers: BitArray,
    pub signature: AggregateSignature,
}

impl Commit {
    pub fn size(&self) -> usize {
        self.signers.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: u64,
    pub last_block_id: BlockId,
    pub validators_hash: Hash,
    pub app_hash: Hash,
    pub tx_root: Hash,
    /// Opaque epoch payload: when the proposer announces the next epoch,
    /// its encoded descriptor rides here.
    pub extra_data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Vec<u8>>,
    /// None only at height 1.
    pub last_commit: Option<Commit>,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn make(
        height: u64,
        chain_id: String,
        txs: Vec<Vec<u8>>,
        last_commit: Option<Commit>,
        last_block_id: BlockId,
        validators_hash: Hash,
        app_hash: Hash,
        extra_data: Vec<u8>,
    ) -> Block {
        let tx_leaves: Vec<Hash> = txs.iter().map(|tx| sha256(tx)).collect();
        Block {
            header: BlockHeader {
                chain_id,
                height,
                last_block_id,
                validators_hash,
                app_hash,
                tx_root: merkle_root(&tx_leaves),
                extra_data,
            },
            txs,
            last_commit,
        }
    }

    /// The block hash commits to the header only; the header commits to
    /// the transactions through `tx_root`.
    pub fn hash(&self) -> Hash {
        sha256(&crate::types::serialization::encode_block_header(
            &self.header,
        ))
    }

    pub fn hashes_to(&self, hash: Hash) -> bool {
        !hash.is_zero() && self.hash() == hash
    }

    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        PartSet::from_data(&crate::types::serialization::encode_block(self), part_size)
    }

    pub fn block_id(&self, part_size: usize) -> BlockId {
        BlockId {
            hash: self.hash(),
            parts_header: self.make_part_set(part_size).header(),
        }
    }
}
