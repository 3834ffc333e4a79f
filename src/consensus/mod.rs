pub mod deps;
pub mod messages;
pub mod state;
pub mod ticker;
pub mod vote_set;

pub use deps::{AppConnection, BlockStore, ChainState, Epoch, Mempool};
pub use messages::{ConsensusMessage, MsgInfo, RoundStep, TimeoutInfo};
pub use state::{ConsensusError, ConsensusHandle, ConsensusState, RoundState, RoundStateSummary};
pub use ticker::TimeoutTicker;
pub use vote_set::{HeightVoteSet, VoteSet, VoteSetError};
