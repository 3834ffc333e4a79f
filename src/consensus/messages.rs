use crate::types::serialization::{
    decode_part, decode_proposal, decode_sign_aggr, decode_vote, encode_part, encode_proposal,
    encode_sign_aggr, encode_vote, CodecError, Decoder, Encoder,
};
use crate::types::{Part, Proposal, SignAggr, Vote};
use std::time::Duration;

/// Position within the per-round protocol. The numeric order is load
/// bearing: timeouts and re-entry guards compare steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RoundStep {
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    PrevoteWait = 5,
    Precommit = 6,
    PrecommitWait = 7,
    Commit = 8,
}

impl RoundStep {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(RoundStep::NewHeight),
            2 => Some(RoundStep::NewRound),
            3 => Some(RoundStep::Propose),
            4 => Some(RoundStep::Prevote),
            5 => Some(RoundStep::PrevoteWait),
            6 => Some(RoundStep::Precommit),
            7 => Some(RoundStep::PrecommitWait),
            8 => Some(RoundStep::Commit),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoundStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoundStep::NewHeight => "NewHeight",
            RoundStep::NewRound => "NewRound",
            RoundStep::Propose => "Propose",
            RoundStep::Prevote => "Prevote",
            RoundStep::PrevoteWait => "PrevoteWait",
            RoundStep::Precommit => "Precommit",
            RoundStep::PrecommitWait => "PrecommitWait",
            RoundStep::Commit => "Commit",
        };
        write!(f, "{s}")
    }
}

/// Messages that may change consensus state. Peers and our own loopback
/// speak the same language.
#[derive(Clone, Debug)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart {
        height: u64,
        round: u32,
        part: Part,
    },
    Vote(Vote),
    Maj23SignAggr(SignAggr),
}

impl ConsensusMessage {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "proposal",
            ConsensusMessage::BlockPart { .. } => "block_part",
            ConsensusMessage::Vote(_) => "vote",
            ConsensusMessage::Maj23SignAggr(_) => "maj23_sign_aggr",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        match self {
            ConsensusMessage::Proposal(p) => {
                e.put_u8(1);
                e.put_vec(&encode_proposal(p));
            }
            ConsensusMessage::BlockPart {
                height,
                round,
                part,
            } => {
                e.put_u8(2);
                e.put_u64(*height);
                e.put_u32(*round);
                e.put_vec(&encode_part(part));
            }
            ConsensusMessage::Vote(v) => {
                e.put_u8(3);
                e.put_vec(&encode_vote(v));
            }
            ConsensusMessage::Maj23SignAggr(sa) => {
                e.put_u8(4);
                e.put_vec(&encode_sign_aggr(sa));
            }
        }
        e.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut d = Decoder::new(data);
        match d.get_u8()? {
            1 => Ok(ConsensusMessage::Proposal(decode_proposal(&d.get_vec()?)?)),
            2 => Ok(ConsensusMessage::BlockPart {
                height: d.get_u64()?,
                round: d.get_u32()?,
                part: decode_part(&d.get_vec()?)?,
            }),
            3 => Ok(ConsensusMessage::Vote(decode_vote(&d.get_vec()?)?)),
            4 => Ok(ConsensusMessage::Maj23SignAggr(decode_sign_aggr(
                &d.get_vec()?,
            )?)),
            _ => Err(CodecError::Invalid("consensus message tag")),
        }
    }
}

/// A consensus message plus its origin. `peer_id: None` marks our own
/// loopback messages.
#[derive(Clone, Debug)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_id: Option<String>,
}

impl MsgInfo {
    pub fn internal(msg: ConsensusMessage) -> Self {
        MsgInfo { msg, peer_id: None }
    }

    pub fn from_peer(msg: ConsensusMessage, peer_id: String) -> Self {
        MsgInfo {
            msg,
            peer_id: Some(peer_id),
        }
    }
}

/// A scheduled or fired timeout, tagged with the (height, round, step)
/// it was armed for so stale ticks can be discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

impl TimeoutInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u64(self.duration.as_millis() as u64);
        e.put_u64(self.height);
        e.put_u32(self.round);
        e.put_u8(self.step.as_u8());
        e.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut d = Decoder::new(data);
        Ok(TimeoutInfo {
            duration: Duration::from_millis(d.get_u64()?),
            height: d.get_u64()?,
            round: d.get_u32()?,
            step: RoundStep::from_u8(d.get_u8()?).ok_or(CodecError::Invalid("round step"))?,
        })
    }
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} ; {}/{} {}",
            self.duration, self.height, self.round, self.step
        )
    }
}
