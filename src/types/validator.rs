use crate::crypto::hash::sha256;
use crate::crypto::{BlsError, PublicKey};
use crate::types::{Address, BitArray, Hash};

#[derive(Debug, thiserror::Error)]
pub enum ValidatorSetError {
    #[error("bitmap length {got} does not match validator set size {expected}")]
    BitmapSizeMismatch { expected: usize, got: usize },
    #[error("no signer bits set")]
    EmptyBitmap,
    #[error("accumulator count {got} does not match validator set size {expected}")]
    AccumLenMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Bls(#[from] BlsError),
}

#[derive(Clone, Debug)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: u64,
    /// Proposer-priority accumulator, advanced by the round-robin.
    pub accum: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        let address = Address::from_pubkey_bytes(&pub_key.encode());
        Validator {
            address,
            pub_key,
            voting_power,
            accum: 0,
        }
    }
}

/// Ordered validator set for one height. A validator's position in the
/// vector is its index in vote sets and aggregate bitmaps; order and
/// membership are fixed for the duration of the height.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_power: u64,
    proposer_index: usize,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Self {
        assert!(!validators.is_empty(), "empty validator set");
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        for v in &mut validators {
            v.accum = 0;
        }
        let total_power = validators
            .iter()
            .fold(0u64, |acc, v| acc.saturating_add(v.voting_power));
        let mut set = ValidatorSet {
            validators,
            total_power,
            proposer_index: 0,
        };
        // establish the round-0 proposer
        set.increment_accum(1);
        set
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Smallest voting power strictly exceeding two thirds of the total.
    pub fn quorum(&self) -> u64 {
        self.total_power.saturating_mul(2) / 3 + 1
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, v)| v.address == *address)
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// The validator selected by the most recent accumulator advance.
    pub fn proposer(&self) -> &Validator {
        &self.validators[self.proposer_index]
    }

    pub fn proposer_index(&self) -> usize {
        self.proposer_index
    }

    /// Advances the proposer round-robin by `times` steps: each step adds
    /// every validator's power to its accumulator, picks the highest
    /// (ties to the lower address) as proposer, and charges it the total
    /// power.
    pub fn increment_accum(&mut self, times: u32) {
        for _ in 0..times {
            for v in &mut self.validators {
                v.accum = v.accum.saturating_add(v.voting_power as i64);
            }
            let winner = self
                .validators
                .iter()
                .enumerate()
                .max_by(|(ai, a), (bi, b)| a.accum.cmp(&b.accum).then(bi.cmp(ai)))
                .map(|(i, _)| i)
                .expect("non-empty validator set");
            self.validators[winner].accum -= self.total_power as i64;
            self.proposer_index = winner;
        }
    }

    /// Overwrites the accumulators and proposer with persisted values,
    /// in set order.
    pub(crate) fn restore_accums(
        &mut self,
        accums: &[i64],
        proposer_index: usize,
    ) -> Result<(), ValidatorSetError> {
        if accums.len() != self.validators.len() || proposer_index >= self.validators.len() {
            return Err(ValidatorSetError::AccumLenMismatch {
                expected: self.validators.len(),
                got: accums.len(),
            });
        }
        for (v, a) in self.validators.iter_mut().zip(accums) {
            v.accum = *a;
        }
        self.proposer_index = proposer_index;
        Ok(())
    }

    /// Canonical hash over (address, pubkey, power), independent of the
    /// accumulator state.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::new();
        for v in &self.validators {
            buf.extend_from_slice(&v.address.0);
            buf.extend_from_slice(&v.pub_key.encode());
            buf.extend_from_slice(&v.voting_power.to_be_bytes());
        }
        sha256(&buf)
    }

    /// Sums the voting power of the validators whose bitmap bit is set.
    pub fn tallied_power(&self, signers: &BitArray) -> Result<u64, ValidatorSetError> {
        if signers.len() != self.validators.len() {
            return Err(ValidatorSetError::BitmapSizeMismatch {
                expected: self.validators.len(),
                got: signers.len(),
            });
        }
        Ok(signers
            .iter_set()
            .map(|i| self.validators[i].voting_power)
            .fold(0u64, |acc, p| acc.saturating_add(p)))
    }

    /// Aggregates the public keys of the validators whose bitmap bit is
    /// set, for verifying an aggregate signature.
    pub fn aggregate_pubkey(&self, signers: &BitArray) -> Result<PublicKey, ValidatorSetError> {
        if signers.len() != self.validators.len() {
            return Err(ValidatorSetError::BitmapSizeMismatch {
                expected: self.validators.len(),
                got: signers.len(),
            });
        }
        let pks: Vec<&PublicKey> = signers
            .iter_set()
            .map(|i| &self.validators[i].pub_key)
            .collect();
        if pks.is_empty() {
            return Err(ValidatorSetError::EmptyBitmap);
        }
        Ok(PublicKey::aggregate(pks)?)
    }
}
