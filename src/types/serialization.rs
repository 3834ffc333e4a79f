//! Hand-rolled big-endian codec. Everything a signature covers, every
//! WAL payload, and every stored artifact goes through these functions,
//! so the byte layout is canonical by construction.

use crate::crypto::{AggregateSignature, PublicKey, Signature};
use crate::types::{
    Address, BitArray, Block, BlockHeader, BlockId, Commit, Hash, Part, PartSetHeader, Proposal,
    SignAggr, Validator, ValidatorSet, Vote, VoteKind,
};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected eof")]
    Eof,
    #[error("invalid data: {0}")]
    Invalid(&'static str),
}

pub struct Encoder {
    buf: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_vec(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_vec(s.as_bytes());
    }

    pub fn put_hash(&mut self, h: &Hash) {
        self.buf.extend_from_slice(&h.0);
    }

    pub fn put_address(&mut self, a: &Address) {
        self.buf.extend_from_slice(&a.0);
    }

    pub fn put_block_id(&mut self, id: &BlockId) {
        self.put_hash(&id.hash);
        self.put_u32(id.parts_header.total);
        self.put_hash(&id.parts_header.root);
    }

    pub fn put_bit_array(&mut self, ba: &BitArray) {
        self.put_u32(ba.len() as u32);
        let mut bytes = vec![0u8; ba.len().div_ceil(8)];
        for i in ba.iter_set() {
            bytes[i / 8] |= 1 << (i % 8);
        }
        self.put_vec(&bytes);
    }

    pub fn put_opt_signature(&mut self, sig: &Option<Signature>) {
        match sig {
            None => self.put_u8(0),
            Some(sig) => {
                self.put_u8(1);
                self.put_vec(&sig.encode());
            }
        }
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Eof);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::Invalid("bool")),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_vec(&mut self) -> Result<Vec<u8>, CodecError> {
        let n = self.get_u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.get_vec()?).map_err(|_| CodecError::Invalid("utf8"))
    }

    pub fn get_hash(&mut self) -> Result<Hash, CodecError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(Hash(out))
    }

    pub fn get_address(&mut self) -> Result<Address, CodecError> {
        let b = self.take(20)?;
        let mut out = [0u8; 20];
        out.copy_from_slice(b);
        Ok(Address(out))
    }

    pub fn get_block_id(&mut self) -> Result<BlockId, CodecError> {
        Ok(BlockId {
            hash: self.get_hash()?,
            parts_header: PartSetHeader {
                total: self.get_u32()?,
                root: self.get_hash()?,
            },
        })
    }

    pub fn get_bit_array(&mut self) -> Result<BitArray, CodecError> {
        let bits = self.get_u32()? as usize;
        let bytes = self.get_vec()?;
        if bytes.len() != bits.div_ceil(8) {
            return Err(CodecError::Invalid("bit array length"));
        }
        let mut ba = BitArray::new(bits);
        for i in 0..bits {
            if bytes[i / 8] & (1 << (i % 8)) != 0 {
                ba.set(i, true);
            }
        }
        Ok(ba)
    }

    pub fn get_opt_signature(&mut self) -> Result<Option<Signature>, CodecError> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => {
                let bytes = self.get_vec()?;
                Signature::decode(&bytes)
                    .map(Some)
                    .map_err(|_| CodecError::Invalid("signature"))
            }
            _ => Err(CodecError::Invalid("signature tag")),
        }
    }
}

// ---- canonical sign bytes ----

pub fn vote_sign_bytes(
    chain_id: &str,
    height: u64,
    round: u32,
    kind: VoteKind,
    block_id: &BlockId,
) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_str(chain_id);
    e.put_u64(height);
    e.put_u32(round);
    e.put_u8(kind.as_u8());
    e.put_block_id(block_id);
    e.into_bytes()
}

pub fn proposal_sign_bytes(
    chain_id: &str,
    height: u64,
    round: u32,
    block_id: &BlockId,
    pol_round: i32,
    pol_block_id: &BlockId,
) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_str(chain_id);
    e.put_u64(height);
    e.put_u32(round);
    e.put_block_id(block_id);
    e.put_i32(pol_round);
    e.put_block_id(pol_block_id);
    e.into_bytes()
}

// ---- block ----

pub fn encode_block_header(h: &BlockHeader) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_str(&h.chain_id);
    e.put_u64(h.height);
    e.put_block_id(&h.last_block_id);
    e.put_hash(&h.validators_hash);
    e.put_hash(&h.app_hash);
    e.put_hash(&h.tx_root);
    e.put_vec(&h.extra_data);
    e.into_bytes()
}

fn decode_block_header(d: &mut Decoder<'_>) -> Result<BlockHeader, CodecError> {
    Ok(BlockHeader {
        chain_id: d.get_str()?,
        height: d.get_u64()?,
        last_block_id: d.get_block_id()?,
        validators_hash: d.get_hash()?,
        app_hash: d.get_hash()?,
        tx_root: d.get_hash()?,
        extra_data: d.get_vec()?,
    })
}

pub fn encode_block(b: &Block) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_vec(&encode_block_header(&b.header));
    e.put_u32(b.txs.len() as u32);
    for tx in &b.txs {
        e.put_vec(tx);
    }
    match &b.last_commit {
        None => e.put_u8(0),
        Some(c) => {
            e.put_u8(1);
            e.put_vec(&encode_commit(c));
        }
    }
    e.into_bytes()
}

pub fn decode_block(data: &[u8]) -> Result<Block, CodecError> {
    let mut d = Decoder::new(data);
    let header_bytes = d.get_vec()?;
    let header = decode_block_header(&mut Decoder::new(&header_bytes))?;
    let n = d.get_u32()? as usize;
    let mut txs = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        txs.push(d.get_vec()?);
    }
    let last_commit = match d.get_u8()? {
        0 => None,
        1 => Some(decode_commit(&d.get_vec()?)?),
        _ => return Err(CodecError::Invalid("commit tag")),
    };
    Ok(Block {
        header,
        txs,
        last_commit,
    })
}

// ---- commit ----

pub fn encode_commit(c: &Commit) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_u64(c.height);
    e.put_u32(c.round);
    e.put_block_id(&c.block_id);
    e.put_bit_array(&c.signers);
    e.put_vec(&c.signature.encode());
    e.into_bytes()
}

pub fn decode_commit(data: &[u8]) -> Result<Commit, CodecError> {
    let mut d = Decoder::new(data);
    Ok(Commit {
        height: d.get_u64()?,
        round: d.get_u32()?,
        block_id: d.get_block_id()?,
        signers: d.get_bit_array()?,
        signature: AggregateSignature::decode(&d.get_vec()?)
            .map_err(|_| CodecError::Invalid("aggregate signature"))?,
    })
}

// ---- part ----

pub fn encode_part(p: &Part) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_u32(p.index);
    e.put_vec(&p.bytes);
    e.put_u32(p.proof.len() as u32);
    for h in &p.proof {
        e.put_hash(h);
    }
    e.into_bytes()
}

pub fn decode_part(data: &[u8]) -> Result<Part, CodecError> {
    let mut d = Decoder::new(data);
    let index = d.get_u32()?;
    let bytes = d.get_vec()?;
    let n = d.get_u32()? as usize;
    let mut proof = Vec::with_capacity(n.min(64));
    for _ in 0..n {
        proof.push(d.get_hash()?);
    }
    Ok(Part {
        index,
        bytes,
        proof,
    })
}

// ---- vote ----

pub fn encode_vote(v: &Vote) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_u32(v.validator_index);
    e.put_address(&v.validator_address);
    e.put_u64(v.height);
    e.put_u32(v.round);
    e.put_u8(v.kind.as_u8());
    e.put_block_id(&v.block_id);
    e.put_opt_signature(&v.signature);
    e.into_bytes()
}

pub fn decode_vote(data: &[u8]) -> Result<Vote, CodecError> {
    let mut d = Decoder::new(data);
    Ok(Vote {
        validator_index: d.get_u32()?,
        validator_address: d.get_address()?,
        height: d.get_u64()?,
        round: d.get_u32()?,
        kind: VoteKind::from_u8(d.get_u8()?).ok_or(CodecError::Invalid("vote kind"))?,
        block_id: d.get_block_id()?,
        signature: d.get_opt_signature()?,
    })
}

// ---- proposal ----

pub fn encode_proposal(p: &Proposal) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_u64(p.height);
    e.put_u32(p.round);
    e.put_block_id(&p.block_id);
    e.put_i32(p.pol_round);
    e.put_block_id(&p.pol_block_id);
    e.put_address(&p.proposer_address);
    e.put_opt_signature(&p.signature);
    e.into_bytes()
}

pub fn decode_proposal(data: &[u8]) -> Result<Proposal, CodecError> {
    let mut d = Decoder::new(data);
    Ok(Proposal {
        height: d.get_u64()?,
        round: d.get_u32()?,
        block_id: d.get_block_id()?,
        pol_round: d.get_i32()?,
        pol_block_id: d.get_block_id()?,
        proposer_address: d.get_address()?,
        signature: d.get_opt_signature()?,
    })
}

// ---- sign aggregate ----

pub fn encode_sign_aggr(sa: &SignAggr) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_str(&sa.chain_id);
    e.put_u64(sa.height);
    e.put_u32(sa.round);
    e.put_u8(sa.kind.as_u8());
    e.put_block_id(&sa.block_id);
    e.put_block_id(&sa.maj23);
    e.put_bit_array(&sa.signers);
    e.put_vec(&sa.signature.encode());
    e.into_bytes()
}

pub fn decode_sign_aggr(data: &[u8]) -> Result<SignAggr, CodecError> {
    let mut d = Decoder::new(data);
    Ok(SignAggr {
        chain_id: d.get_str()?,
        height: d.get_u64()?,
        round: d.get_u32()?,
        kind: VoteKind::from_u8(d.get_u8()?).ok_or(CodecError::Invalid("vote kind"))?,
        block_id: d.get_block_id()?,
        maj23: d.get_block_id()?,
        signers: d.get_bit_array()?,
        signature: AggregateSignature::decode(&d.get_vec()?)
            .map_err(|_| CodecError::Invalid("aggregate signature"))?,
    })
}

// ---- validator set (storage form, accumulators included) ----

pub fn encode_validator_set(vs: &ValidatorSet) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_u32(vs.len() as u32);
    e.put_u32(vs.proposer_index() as u32);
    for v in vs.validators() {
        e.put_vec(&v.pub_key.encode());
        e.put_u64(v.voting_power);
        e.put_u64(v.accum as u64);
    }
    e.into_bytes()
}

pub fn decode_validator_set(data: &[u8]) -> Result<ValidatorSet, CodecError> {
    let mut d = Decoder::new(data);
    let n = d.get_u32()? as usize;
    if n == 0 {
        return Err(CodecError::Invalid("empty validator set"));
    }
    let proposer_index = d.get_u32()? as usize;
    let mut validators = Vec::with_capacity(n);
    let mut accums = Vec::with_capacity(n);
    for _ in 0..n {
        let pub_key = PublicKey::decode(&d.get_vec()?)
            .map_err(|_| CodecError::Invalid("validator pubkey"))?;
        let power = d.get_u64()?;
        accums.push(d.get_u64()? as i64);
        validators.push(Validator::new(pub_key, power));
    }
    let mut set = ValidatorSet::new(validators);
    set.restore_accums(&accums, proposer_index)
        .map_err(|_| CodecError::Invalid("validator accums"))?;
    Ok(set)
}
