use crate::types::{BlockId, SignAggr, SignAggrError, ValidatorSet, Vote, VoteKind};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum VoteSetError {
    #[error("vote height {got} does not match vote set height {expected}")]
    UnexpectedHeight { expected: u64, got: u64 },
    #[error("vote round {got} does not match vote set round {expected}")]
    UnexpectedRound { expected: u32, got: u32 },
    #[error("vote kind {got} does not match vote set kind {expected}")]
    UnexpectedKind { expected: VoteKind, got: VoteKind },
    #[error("validator index {0} out of range")]
    IndexOutOfRange(u32),
    #[error("vote address does not match validator at index {0}")]
    AddressMismatch(u32),
    #[error("vote has no signature")]
    MissingSignature,
    #[error("invalid vote signature from validator {0}")]
    InvalidSignature(u32),
    /// The validator already voted for a different block at this
    /// (height, round, kind). Both votes are retained as evidence; the
    /// new one is not tallied.
    #[error("conflicting votes from validator {}", existing.validator_index)]
    Conflicting {
        existing: Box<Vote>,
        conflicting: Box<Vote>,
    },
    #[error("vote round {0} not tracked yet")]
    RoundNotTracked(u32),
    #[error(transparent)]
    Aggregation(#[from] SignAggrError),
}

/// All votes of one kind at one (height, round): one slot per validator
/// index, voting-power tallies per block id (nil included), and the
/// derived +2/3 flags. A verified maj23 aggregate received from a peer
/// can be installed into the same structure, so every majority check
/// reads a single tally.
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    kind: VoteKind,
    validators: ValidatorSet,
    votes: Vec<Option<Vote>>,
    tallies: BTreeMap<BlockId, u64>,
    sum: u64,
    maj23: Option<BlockId>,
    conflicts: Vec<(Vote, Vote)>,
    aggr: Option<SignAggr>,
}

impl VoteSet {
    pub fn new(chain_id: &str, height: u64, round: u32, kind: VoteKind, validators: ValidatorSet) -> Self {
        let n = validators.len();
        VoteSet {
            chain_id: chain_id.to_string(),
            height,
            round,
            kind,
            validators,
            votes: vec![None; n],
            tallies: BTreeMap::new(),
            sum: 0,
            maj23: None,
            conflicts: Vec::new(),
            aggr: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn kind(&self) -> VoteKind {
        self.kind
    }

    pub fn votes(&self) -> &[Option<Vote>] {
        &self.votes
    }

    pub fn evidence(&self) -> &[(Vote, Vote)] {
        &self.conflicts
    }

    /// Validates and tallies one vote. Ok(false) means the identical
    /// vote was already present.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::UnexpectedHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::UnexpectedRound {
                expected: self.round,
                got: vote.round,
            });
        }
        if vote.kind != self.kind {
            return Err(VoteSetError::UnexpectedKind {
                expected: self.kind,
                got: vote.kind,
            });
        }
        let index = vote.validator_index as usize;
        let validator = self
            .validators
            .get_by_index(index)
            .ok_or(VoteSetError::IndexOutOfRange(vote.validator_index))?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::AddressMismatch(vote.validator_index));
        }
        let sig = vote
            .signature
            .as_ref()
            .ok_or(VoteSetError::MissingSignature)?;
        sig.verify(&vote.sign_bytes(&self.chain_id), &validator.pub_key)
            .map_err(|_| VoteSetError::InvalidSignature(vote.validator_index))?;

        if let Some(existing) = &self.votes[index] {
            if existing.block_id == vote.block_id {
                return Ok(false);
            }
            self.conflicts.push((existing.clone(), vote.clone()));
            return Err(VoteSetError::Conflicting {
                existing: Box::new(existing.clone()),
                conflicting: Box::new(vote),
            });
        }

        let power = validator.voting_power;
        let tally = self.tallies.entry(vote.block_id).or_insert(0);
        *tally = tally.saturating_add(power);
        if self.maj23.is_none() && *tally >= self.validators.quorum() {
            self.maj23 = Some(vote.block_id);
        }
        self.sum = self.sum.saturating_add(power);
        self.votes[index] = Some(vote);
        Ok(true)
    }

    pub fn tallied_for(&self, block_id: &BlockId) -> u64 {
        self.tallies.get(block_id).copied().unwrap_or(0)
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// +2/3 of total power has voted, counting every block id and nil
    /// together.
    pub fn two_thirds_any(&self) -> bool {
        self.sum >= self.validators.quorum() || self.aggr.is_some()
    }

    /// The single block id (possibly nil) holding +2/3, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23.or_else(|| self.aggr.as_ref().map(|a| a.maj23))
    }

    /// Every validator has voted.
    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_power()
    }

    /// Installs an already-verified maj23 aggregate. Ok(false) if one is
    /// already installed.
    pub fn install_sign_aggr(&mut self, aggr: SignAggr) -> bool {
        if self.aggr.is_some() {
            return false;
        }
        self.aggr = Some(aggr);
        true
    }

    pub fn sign_aggr(&self) -> Option<&SignAggr> {
        self.aggr.as_ref()
    }

    /// The aggregate form of this set's majority: built from our own
    /// tallied votes, or the installed peer aggregate when our tally
    /// never reached +2/3 locally.
    pub fn make_sign_aggr(&self) -> Result<SignAggr, VoteSetError> {
        if let Some(target) = self.maj23 {
            return Ok(SignAggr::aggregate(
                &self.chain_id,
                self.height,
                self.round,
                self.kind,
                target,
                &self.votes,
            )?);
        }
        if let Some(aggr) = &self.aggr {
            return Ok(aggr.clone());
        }
        Err(VoteSetError::Aggregation(SignAggrError::NothingToAggregate(
            BlockId::nil(),
        )))
    }
}

#[derive(Clone, Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// The per-height family of vote sets, keyed by round. Rounds are
/// pre-created up through the tracked round so votes for rounds slightly
/// ahead of us can be parked.
#[derive(Clone, Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: ValidatorSet,
    round: u32,
    rounds: BTreeMap<u32, RoundVoteSet>,
}

impl HeightVoteSet {
    pub fn new(chain_id: &str, height: u64, validators: ValidatorSet) -> Self {
        let mut hvs = HeightVoteSet {
            chain_id: chain_id.to_string(),
            height,
            validators,
            round: 0,
            rounds: BTreeMap::new(),
        };
        hvs.ensure_round(0);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    fn ensure_round(&mut self, round: u32) {
        self.rounds.entry(round).or_insert_with(|| RoundVoteSet {
            prevotes: VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteKind::Prevote,
                self.validators.clone(),
            ),
            precommits: VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteKind::Precommit,
                self.validators.clone(),
            ),
        });
    }

    /// Pre-creates empty vote sets up through `round`.
    pub fn set_round(&mut self, round: u32) {
        for r in self.round..=round {
            self.ensure_round(r);
        }
        self.round = self.round.max(round);
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.precommits)
    }

    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::UnexpectedHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round > self.round {
            return Err(VoteSetError::RoundNotTracked(vote.round));
        }
        let set = self
            .rounds
            .get_mut(&vote.round)
            .ok_or(VoteSetError::RoundNotTracked(vote.round))?;
        match vote.kind {
            VoteKind::Prevote => set.prevotes.add_vote(vote),
            VoteKind::Precommit => set.precommits.add_vote(vote),
        }
    }

    /// Installs a verified maj23 aggregate into its round's set.
    pub fn install_sign_aggr(&mut self, aggr: SignAggr) -> Result<bool, VoteSetError> {
        if aggr.height != self.height {
            return Err(VoteSetError::UnexpectedHeight {
                expected: self.height,
                got: aggr.height,
            });
        }
        if aggr.round > self.round {
            self.set_round(aggr.round);
        }
        let set = self
            .rounds
            .get_mut(&aggr.round)
            .ok_or(VoteSetError::RoundNotTracked(aggr.round))?;
        Ok(match aggr.kind {
            VoteKind::Prevote => set.prevotes.install_sign_aggr(aggr),
            VoteKind::Precommit => set.precommits.install_sign_aggr(aggr),
        })
    }

    /// Proof-of-lock search: the highest round with a +2/3 prevote
    /// majority for a non-nil block, or (-1, nil).
    pub fn pol_info(&self) -> (i32, BlockId) {
        for (round, set) in self.rounds.iter().rev() {
            if let Some(block_id) = set.prevotes.two_thirds_majority() {
                if !block_id.is_nil() {
                    return (*round as i32, block_id);
                }
            }
        }
        (-1, BlockId::nil())
    }
}
