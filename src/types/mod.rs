pub mod address;
pub mod bit_array;
pub mod block;
pub mod hash;
pub mod part_set;
pub mod priv_validator;
pub mod proposal;
pub mod serialization;
pub mod sign_aggr;
pub mod validator;
pub mod vote;

pub use address::Address;
pub use bit_array::BitArray;
pub use block::{Block, BlockHeader, BlockId, Commit};
pub use hash::Hash;
pub use part_set::{Part, PartSet, PartSetError, PartSetHeader};
pub use priv_validator::{FilePrivValidator, PrivValidator, SignError};
pub use proposal::Proposal;
pub use sign_aggr::{SignAggr, SignAggrError};
pub use validator::{Validator, ValidatorSet, ValidatorSetError};
pub use vote::{Vote, VoteKind};
