use crate::crypto::{PublicKey, SecretKey};
use crate::types::{Address, Proposal, Vote, VoteKind};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("refusing to double-sign: already signed step {last_step} at {last_height}/{last_round}")]
    DoubleSign {
        last_height: u64,
        last_round: u32,
        last_step: u8,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The validator's signing device. Tracks the last signed
/// (height, round, step) independently of the consensus actor, so a
/// conflicting signature is refused even if the actor replays or races.
pub trait PrivValidator: Send {
    fn address(&self) -> Address;
    fn pub_key(&self) -> PublicKey;
    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError>;
    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignError>;
}

const STEP_PROPOSE: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;

fn vote_step(kind: VoteKind) -> u8 {
    match kind {
        VoteKind::Prevote => STEP_PREVOTE,
        VoteKind::Precommit => STEP_PRECOMMIT,
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct LastSignState {
    height: u64,
    round: u32,
    step: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sign_bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    signature: Vec<u8>,
}

/// File-backed private validator: the secret key lives in a raw 32-byte
/// key file; the last-sign state is persisted as JSON next to it so the
/// double-sign guard survives restarts.
pub struct FilePrivValidator {
    secret: SecretKey,
    pub_key: PublicKey,
    address: Address,
    last: LastSignState,
    state_path: Option<PathBuf>,
}

impl FilePrivValidator {
    pub fn new(secret: SecretKey) -> Self {
        let pub_key = secret.public();
        let address = Address::from_pubkey_bytes(&pub_key.encode());
        FilePrivValidator {
            secret,
            pub_key,
            address,
            last: LastSignState::default(),
            state_path: None,
        }
    }

    pub fn load_or_generate<P: AsRef<Path>>(key_path: P) -> Result<Self> {
        let key_path = key_path.as_ref();
        let secret = if key_path.exists() {
            let bytes = fs::read(key_path)?;
            SecretKey::decode(&bytes).map_err(|e| anyhow::anyhow!("invalid key file: {e}"))?
        } else {
            let secret = SecretKey::generate();
            fs::write(key_path, secret.encode())?;
            secret
        };
        let mut pv = Self::new(secret);
        let state_path = key_path.with_extension("state.json");
        if state_path.exists() {
            pv.last = serde_json::from_slice(&fs::read(&state_path)?)?;
        }
        pv.state_path = Some(state_path);
        Ok(pv)
    }

    fn check_and_update(
        &mut self,
        height: u64,
        round: u32,
        step: u8,
        sign_bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, SignError> {
        let last = (self.last.height, self.last.round, self.last.step);
        match (height, round, step).cmp(&last) {
            std::cmp::Ordering::Less => Err(SignError::DoubleSign {
                last_height: self.last.height,
                last_round: self.last.round,
                last_step: self.last.step,
            }),
            std::cmp::Ordering::Equal if self.last.step != 0 => {
                // Same HRS: re-signing identical bytes returns the stored
                // signature, anything else is an equivocation attempt.
                if self.last.sign_bytes == sign_bytes {
                    Ok(Some(self.last.signature.clone()))
                } else {
                    Err(SignError::DoubleSign {
                        last_height: self.last.height,
                        last_round: self.last.round,
                        last_step: self.last.step,
                    })
                }
            }
            _ => Ok(None),
        }
    }

    fn record(&mut self, height: u64, round: u32, step: u8, sign_bytes: Vec<u8>, signature: Vec<u8>) {
        self.last = LastSignState {
            height,
            round,
            step,
            sign_bytes,
            signature,
        };
        if let Some(path) = &self.state_path {
            if let Ok(json) = serde_json::to_vec(&self.last) {
                let _ = fs::write(path, json);
            }
        }
    }
}

impl PrivValidator for FilePrivValidator {
    fn address(&self) -> Address {
        self.address
    }

    fn pub_key(&self) -> PublicKey {
        self.pub_key.clone()
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError> {
        let step = vote_step(vote.kind);
        let sign_bytes = vote.sign_bytes(chain_id);
        if let Some(stored) = self.check_and_update(vote.height, vote.round, step, &sign_bytes)? {
            vote.signature = crate::crypto::Signature::decode(&stored).ok();
            return Ok(());
        }
        let sig = self.secret.sign(&sign_bytes);
        self.record(vote.height, vote.round, step, sign_bytes, sig.encode());
        vote.signature = Some(sig);
        Ok(())
    }

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignError> {
        let sign_bytes = proposal.sign_bytes(chain_id);
        if let Some(stored) =
            self.check_and_update(proposal.height, proposal.round, STEP_PROPOSE, &sign_bytes)?
        {
            proposal.signature = crate::crypto::Signature::decode(&stored).ok();
            return Ok(());
        }
        let sig = self.secret.sign(&sign_bytes);
        self.record(
            proposal.height,
            proposal.round,
            STEP_PROPOSE,
            sign_bytes,
            sig.encode(),
        );
        proposal.signature = Some(sig);
        Ok(())
    }
}
