pub mod bls;
pub mod hash;

pub use bls::{AggregateSignature, BlsError, PublicKey, SecretKey, Signature};
