use crate::crypto::Signature;
use crate::types::{Address, BlockId};

/// A round's block proposal. `pol_round`/`pol_block_id` carry the
/// proposer's proof-of-lock: the most recent round at which a +2/3
/// prevote majority for `pol_block_id` was observed, or -1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub block_id: BlockId,
    pub pol_round: i32,
    pub pol_block_id: BlockId,
    pub proposer_address: Address,
    pub signature: Option<Signature>,
}

impl Proposal {
    pub fn new(
        height: u64,
        round: u32,
        block_id: BlockId,
        pol_round: i32,
        pol_block_id: BlockId,
        proposer_address: Address,
    ) -> Self {
        Proposal {
            height,
            round,
            block_id,
            pol_round,
            pol_block_id,
            proposer_address,
            signature: None,
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        crate::types::serialization::proposal_sign_bytes(
            chain_id,
            self.height,
            self.round,
            &self.block_id,
            self.pol_round,
            &self.pol_block_id,
        )
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} {} pol={}}}",
            self.height, self.round, self.block_id, self.pol_round
        )
    }
}
