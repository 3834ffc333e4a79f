use crate::crypto::{AggregateSignature, BlsError};
use crate::types::validator::ValidatorSetError;
use crate::types::{BitArray, BlockId, Commit, ValidatorSet, Vote, VoteKind};

#[derive(Debug, thiserror::Error)]
pub enum SignAggrError {
    #[error("no votes for {0} to aggregate")]
    NothingToAggregate(BlockId),
    #[error("aggregate is for {got}, expected {expected}")]
    WrongKind { expected: VoteKind, got: VoteKind },
    #[error("aggregate has nil majority block")]
    NilMajority,
    #[error("vote is missing a signature")]
    MissingSignature,
    #[error("signer bit {0} already set")]
    AlreadySigned(usize),
    #[error("validator index {0} not in set")]
    UnknownSigner(usize),
    #[error(transparent)]
    ValidatorSet(#[from] ValidatorSetError),
    #[error(transparent)]
    Bls(#[from] BlsError),
}

/// A +2/3 claim in one message: "the validators flagged in `signers`
/// signed `kind` at (height, round) for `block_id`". The BLS aggregate
/// stands in for the individual signatures.
#[derive(Clone, Debug)]
pub struct SignAggr {
    pub chain_id: String,
    pub height: u64,
    pub round: u32,
    pub kind: VoteKind,
    pub block_id: BlockId,
    /// The block id this aggregate claims a majority for.
    pub maj23: BlockId,
    pub signers: BitArray,
    pub signature: AggregateSignature,
}

impl SignAggr {
    /// Builds the aggregate from a round's vote slots: every vote for
    /// `block_id` contributes its signature and sets its index bit.
    pub fn aggregate(
        chain_id: &str,
        height: u64,
        round: u32,
        kind: VoteKind,
        block_id: BlockId,
        votes: &[Option<Vote>],
    ) -> Result<SignAggr, SignAggrError> {
        let mut signers = BitArray::new(votes.len());
        let mut sigs = Vec::new();
        for (index, vote) in votes.iter().enumerate() {
            let Some(vote) = vote else { continue };
            if vote.block_id != block_id {
                continue;
            }
            let sig = vote
                .signature
                .as_ref()
                .ok_or(SignAggrError::MissingSignature)?;
            signers.set(index, true);
            sigs.push(sig.clone());
        }
        if sigs.is_empty() {
            return Err(SignAggrError::NothingToAggregate(block_id));
        }
        let signature = AggregateSignature::aggregate(sigs.iter())?;
        Ok(SignAggr {
            chain_id: chain_id.to_string(),
            height,
            round,
            kind,
            block_id,
            maj23: block_id,
            signers,
            signature,
        })
    }

    /// Verifies the aggregate against a validator set: bitmap length,
    /// the BLS signature over the canonical vote bytes, and finally the
    /// quorum test. Returns whether the tallied power reaches +2/3.
    pub fn verify(&self, validators: &ValidatorSet) -> Result<bool, SignAggrError> {
        let power = validators.tallied_power(&self.signers)?;
        let agg_pk = validators.aggregate_pubkey(&self.signers)?;
        let msg = crate::types::serialization::vote_sign_bytes(
            &self.chain_id,
            self.height,
            self.round,
            self.kind,
            &self.block_id,
        );
        self.signature
            .verify(&msg, std::iter::once(&agg_pk))
            .map_err(SignAggrError::Bls)?;
        Ok(power >= validators.quorum())
    }

    /// Power test alone, without re-verifying the signature. Used for
    /// checks on an already-verified aggregate (e.g. LastCommit).
    pub fn has_two_thirds_majority(&self, validators: &ValidatorSet) -> bool {
        validators
            .tallied_power(&self.signers)
            .map(|p| p >= validators.quorum())
            .unwrap_or(false)
    }

    /// True once every validator in the set has contributed.
    pub fn has_all(&self) -> bool {
        self.signers.all_set()
    }

    pub fn size(&self) -> usize {
        self.signers.len()
    }

    /// Folds in one more matching vote (a straggler precommit for the
    /// previous height). Ok(false) if that signer already contributed.
    pub fn add_vote(
        &mut self,
        vote: &Vote,
        validators: &ValidatorSet,
    ) -> Result<bool, SignAggrError> {
        let index = vote.validator_index as usize;
        if index >= self.signers.len() {
            return Err(SignAggrError::UnknownSigner(index));
        }
        if self.signers.get(index) {
            return Ok(false);
        }
        let validator = validators
            .get_by_index(index)
            .ok_or(SignAggrError::UnknownSigner(index))?;
        let sig = vote
            .signature
            .as_ref()
            .ok_or(SignAggrError::MissingSignature)?;
        sig.verify(&vote.sign_bytes(&self.chain_id), &validator.pub_key)?;
        self.signature.add(sig)?;
        self.signers.set(index, true);
        Ok(true)
    }

    /// Converts a maj23 precommit aggregate into the commit stored with
    /// the block.
    pub fn make_commit(&self) -> Result<Commit, SignAggrError> {
        if self.kind != VoteKind::Precommit {
            return Err(SignAggrError::WrongKind {
                expected: VoteKind::Precommit,
                got: self.kind,
            });
        }
        if self.maj23.is_nil() {
            return Err(SignAggrError::NilMajority);
        }
        Ok(Commit {
            height: self.height,
            round: self.round,
            block_id: self.maj23,
            signers: self.signers.clone(),
            signature: self.signature.clone(),
        })
    }

    /// Rebuilds the aggregate form of a stored commit; the inverse of
    /// `make_commit`.
    pub fn from_commit(chain_id: &str, commit: &Commit) -> SignAggr {
        SignAggr {
            chain_id: chain_id.to_string(),
            height: commit.height,
            round: commit.round,
            kind: VoteKind::Precommit,
            block_id: commit.block_id,
            maj23: commit.block_id,
            signers: commit.signers.clone(),
            signature: commit.signature.clone(),
        }
    }
}

impl std::fmt::Display for SignAggr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SignAggr{{{} {}/{} {} signers={}}}",
            self.kind, self.height, self.round, self.maj23, self.signers
        )
    }
}
