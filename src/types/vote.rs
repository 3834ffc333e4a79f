use crate::crypto::Signature;
use crate::types::{Address, BlockId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VoteKind {
    Prevote,
    Precommit,
}

impl VoteKind {
    pub fn as_u8(self) -> u8 {
        match self {
            VoteKind::Prevote => 1,
            VoteKind::Precommit => 2,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(VoteKind::Prevote),
            2 => Some(VoteKind::Precommit),
            _ => None,
        }
    }
}

impl std::fmt::Display for VoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteKind::Prevote => write!(f, "prevote"),
            VoteKind::Precommit => write!(f, "precommit"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub validator_index: u32,
    pub validator_address: Address,
    pub height: u64,
    pub round: u32,
    pub kind: VoteKind,
    pub block_id: BlockId,
    pub signature: Option<Signature>,
}

impl Vote {
    /// The canonical bytes the signature covers. Identity fields are
    /// excluded so that every signer of the same (height, round, kind,
    /// block) signs the same message, which is what makes the BLS
    /// aggregate verifiable against one message.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        crate::types::serialization::vote_sign_bytes(
            chain_id,
            self.height,
            self.round,
            self.kind,
            &self.block_id,
        )
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vote{{{} {}/{} {} by #{}}}",
            self.kind, self.height, self.round, self.block_id, self.validator_index
        )
    }
}
