use crate::crypto::hash::{sha256, sha256_pair};
use crate::types::Hash;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PartSetError {
    #[error("part index {index} out of bounds (total {total})")]
    IndexOutOfBounds { index: u32, total: u32 },
    #[error("part proof does not hash to the part set root")]
    InvalidProof,
    #[error("part set is not expecting parts")]
    NoHeader,
}

/// Identifies a chunked block: how many parts and the merkle root over them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub root: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.root.is_zero()
    }
}

impl std::fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.total, self.root)
    }
}

/// One chunk of a serialized block, with its merkle branch up to the
/// part set root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: Vec<Hash>,
}

impl Part {
    pub fn leaf_hash(&self) -> Hash {
        sha256(&self.bytes)
    }
}

/// Computes the root of the simple merkle tree over `leaves`. An odd
/// node at any level is promoted unchanged.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::ZERO;
    }
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [l, r] => next.push(sha256_pair(l, r)),
                [l] => next.push(*l),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    level[0]
}

/// Computes the root and one inclusion branch per leaf.
fn merkle_root_and_proofs(leaves: &[Hash]) -> (Hash, Vec<Vec<Hash>>) {
    let n = leaves.len();
    if n == 0 {
        return (Hash::ZERO, Vec::new());
    }
    let mut proofs = vec![Vec::new(); n];
    // Each node carries the leaf indexes beneath it so sibling hashes can
    // be appended to the right branches while folding levels.
    let mut level: Vec<(Hash, Vec<usize>)> = leaves
        .iter()
        .enumerate()
        .map(|(i, h)| (*h, vec![i]))
        .collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [(lh, li), (rh, ri)] => {
                    for i in li {
                        proofs[*i].push(*rh);
                    }
                    for i in ri {
                        proofs[*i].push(*lh);
                    }
                    let mut under = li.clone();
                    under.extend_from_slice(ri);
                    next.push((sha256_pair(lh, rh), under));
                }
                [(lh, li)] => next.push((*lh, li.clone())),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    (level[0].0, proofs)
}

/// Verifies an inclusion branch for the leaf at `index` in a tree of
/// `width` leaves.
pub fn verify_merkle_proof(
    leaf: Hash,
    mut index: usize,
    mut width: usize,
    proof: &[Hash],
    root: &Hash,
) -> bool {
    if index >= width || width == 0 {
        return false;
    }
    let mut h = leaf;
    let mut branch = proof.iter();
    while width > 1 {
        if index % 2 == 0 {
            if index + 1 < width {
                let Some(sibling) = branch.next() else {
                    return false;
                };
                h = sha256_pair(&h, sibling);
            }
            // odd last node: promoted, nothing to fold
        } else {
            let Some(sibling) = branch.next() else {
                return false;
            };
            h = sha256_pair(sibling, &h);
        }
        index /= 2;
        width = width.div_ceil(2);
    }
    branch.next().is_none() && h == *root
}

/// A block split into fixed-size parts. Starts either complete (on the
/// proposer, from the serialized block) or empty (on receivers, from a
/// header) and fills in as parts arrive.
#[derive(Clone, Debug)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
}

impl PartSet {
    /// Chunks serialized block data into parts of at most `part_size`
    /// bytes and builds the merkle root and per-part proofs.
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        assert!(part_size > 0, "part size must be positive");
        let chunks: Vec<&[u8]> = data.chunks(part_size).collect();
        let leaves: Vec<Hash> = chunks.iter().map(|c| sha256(c)).collect();
        let (root, proofs) = merkle_root_and_proofs(&leaves);
        let parts: Vec<Option<Part>> = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (chunk, proof))| {
                Some(Part {
                    index: i as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();
        let count = parts.len() as u32;
        PartSet {
            header: PartSetHeader {
                total: count,
                root,
            },
            parts,
            count,
        }
    }

    /// An empty set expecting parts matching `header`.
    pub fn from_header(header: PartSetHeader) -> Self {
        PartSet {
            header,
            parts: vec![None; header.total as usize],
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn has_header(&self, header: PartSetHeader) -> bool {
        self.header == header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total && self.header.total > 0
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)?.as_ref()
    }

    /// Adds a part. Returns Ok(false) for a duplicate. With `verify`,
    /// the merkle branch is checked against the header root.
    pub fn add_part(&mut self, part: Part, verify: bool) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfBounds {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        if verify
            && !verify_merkle_proof(
                part.leaf_hash(),
                part.index as usize,
                self.header.total as usize,
                &part.proof,
                &self.header.root,
            )
        {
            return Err(PartSetError::InvalidProof);
        }
        self.parts[part.index as usize] = Some(part);
        self.count += 1;
        Ok(true)
    }

    /// Concatenates all parts back into the serialized block. None until
    /// complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(&part.as_ref()?.bytes);
        }
        Some(out)
    }

    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter_map(|p| p.as_ref())
    }
}
