//! BLS signatures over BLS12-381 (min-pk), wrapping `blst`.
//!
//! Rogue-key attacks are out of scope here: validators are expected to
//! register a proof of possession alongside their public key before they
//! can appear in a validator set.

use blst::{min_pk as bls, BLST_ERROR};
use rand_core::{OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Domain separation tag for vote and proposal signatures.
pub const DST: &[u8] = b"BLSBFT_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Compressed public key length.
pub const PUBLIC_KEY_BYTES_LEN: usize = 48;

/// Compressed signature length.
pub const SIGNATURE_BYTES_LEN: usize = 96;

#[derive(Debug, thiserror::Error)]
pub enum BlsError {
    #[error("error decoding key material: {0:?}")]
    Decode(BLST_ERROR),
    #[error("signature verification failure: {0:?}")]
    Verification(BLST_ERROR),
    #[error("error aggregating signatures: {0:?}")]
    SignatureAggregation(BLST_ERROR),
    #[error("error aggregating public keys: {0:?}")]
    PublicKeyAggregation(BLST_ERROR),
    #[error("nothing to aggregate")]
    EmptyAggregation,
}

/// Type-safety wrapper around a `blst` secret key.
#[derive(ZeroizeOnDrop)]
pub struct SecretKey(bls::SecretKey);

impl SecretKey {
    /// Generates a secret key from a cryptographically-secure entropy source.
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        OsRng.fill_bytes(&mut ikm);
        // key_gen only fails for less than 32 bytes of key material
        Self(bls::SecretKey::key_gen(&ikm, &[]).unwrap())
    }

    /// Derives a secret key from fixed input key material.
    pub fn from_ikm(ikm: &[u8; 32]) -> Self {
        Self(bls::SecretKey::key_gen(ikm, &[]).unwrap())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlsError> {
        bls::SecretKey::from_bytes(bytes)
            .map(Self)
            .map_err(BlsError::Decode)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg, DST, &[]))
    }

    #[inline]
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }
}

/// Type-safety wrapper around a `blst` public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(bls::PublicKey);

impl PublicKey {
    pub fn decode(bytes: &[u8]) -> Result<Self, BlsError> {
        bls::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(BlsError::Decode)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    /// Aggregates a set of public keys into one, for verifying an
    /// aggregate signature over a single shared message.
    pub fn aggregate<'a>(
        pks: impl IntoIterator<Item = &'a PublicKey>,
    ) -> Result<PublicKey, BlsError> {
        let pks: Vec<&bls::PublicKey> = pks.into_iter().map(|p| &p.0).collect();
        if pks.is_empty() {
            return Err(BlsError::EmptyAggregation);
        }
        let agg = bls::AggregatePublicKey::aggregate(&pks, true)
            .map_err(BlsError::PublicKeyAggregation)?;
        Ok(PublicKey(agg.to_public_key()))
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.0.to_bytes());
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.encode().cmp(&other.encode())
    }
}

/// A single BLS signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(bls::Signature);

impl Signature {
    pub fn verify(&self, msg: &[u8], pk: &PublicKey) -> Result<(), BlsError> {
        match self.0.verify(true, msg, DST, &[], &pk.0, true) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            err => Err(BlsError::Verification(err)),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlsError> {
        bls::Signature::from_bytes(bytes)
            .map(Self)
            .map_err(BlsError::Decode)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }
}

/// An aggregate of individual signatures over the same message.
///
/// `blst` aggregates have no verify method of their own, so the
/// aggregate is stored converted back to a bare signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateSignature(bls::Signature);

impl AggregateSignature {
    pub fn aggregate<'a>(
        sigs: impl IntoIterator<Item = &'a Signature>,
    ) -> Result<Self, BlsError> {
        let sigs: Vec<&bls::Signature> = sigs.into_iter().map(|s| &s.0).collect();
        if sigs.is_empty() {
            return Err(BlsError::EmptyAggregation);
        }
        let agg = bls::AggregateSignature::aggregate(&sigs, true)
            .map_err(BlsError::SignatureAggregation)?;
        Ok(AggregateSignature(agg.to_signature()))
    }

    /// Folds one more signature into the aggregate. Used when a straggler
    /// commit vote arrives after the aggregate was first built.
    pub fn add(&mut self, sig: &Signature) -> Result<(), BlsError> {
        let mut agg = bls::AggregateSignature::from_signature(&self.0);
        agg.add_signature(&sig.0, true)
            .map_err(BlsError::SignatureAggregation)?;
        self.0 = agg.to_signature();
        Ok(())
    }

    /// Verifies the aggregate over a single message against the
    /// aggregated public key of the contributing signers.
    pub fn verify<'a>(
        &self,
        msg: &[u8],
        pks: impl IntoIterator<Item = &'a PublicKey>,
    ) -> Result<(), BlsError> {
        let agg_pk = PublicKey::aggregate(pks)?;
        match self.0.verify(true, msg, DST, &[], &agg_pk.0, false) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            err => Err(BlsError::Verification(err)),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlsError> {
        bls::Signature::from_bytes(bytes)
            .map(Self)
            .map_err(BlsError::Decode)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }
}
