mod common;

use blsbft::types::part_set::{merkle_root, verify_merkle_proof, PartSet, PartSetError};
use blsbft::types::serialization::{decode_block, encode_block};
use common::{make_height1_block, TestValidators};

#[test]
fn split_and_reassemble() {
    let data: Vec<u8> = (0..500u16).map(|i| i as u8).collect();
    let ps = PartSet::from_data(&data, 64);
    assert_eq!(ps.total(), 8);
    assert!(ps.is_complete());
    assert_eq!(ps.assemble().unwrap(), data);
}

#[test]
fn last_part_may_be_short() {
    let data = vec![7u8; 65];
    let ps = PartSet::from_data(&data, 64);
    assert_eq!(ps.total(), 2);
    assert_eq!(ps.get_part(1).unwrap().bytes.len(), 1);
}

#[test]
fn receiver_fills_from_header() {
    let data: Vec<u8> = (0..300u16).map(|i| (i % 251) as u8).collect();
    let complete = PartSet::from_data(&data, 64);
    let mut receiving = PartSet::from_header(complete.header());

    assert!(!receiving.is_complete());
    for part in complete.parts() {
        assert!(receiving.add_part(part.clone(), true).unwrap());
    }
    assert!(receiving.is_complete());
    assert_eq!(receiving.assemble().unwrap(), data);
}

#[test]
fn duplicate_part_is_a_noop() {
    let data = vec![1u8; 200];
    let complete = PartSet::from_data(&data, 64);
    let mut receiving = PartSet::from_header(complete.header());

    let part = complete.get_part(0).unwrap().clone();
    assert!(receiving.add_part(part.clone(), true).unwrap());
    assert!(!receiving.add_part(part, true).unwrap());
    assert_eq!(receiving.count(), 1);
}

#[test]
fn out_of_range_index_rejected() {
    let data = vec![1u8; 200];
    let complete = PartSet::from_data(&data, 64);
    let mut receiving = PartSet::from_header(complete.header());

    let mut part = complete.get_part(0).unwrap().clone();
    part.index = complete.total();
    let err = receiving.add_part(part, true).unwrap_err();
    assert!(matches!(err, PartSetError::IndexOutOfBounds { .. }));
}

#[test]
fn corrupted_part_fails_proof() {
    let data: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
    let complete = PartSet::from_data(&data, 64);
    let mut receiving = PartSet::from_header(complete.header());

    let mut part = complete.get_part(2).unwrap().clone();
    part.bytes[0] ^= 0xFF;
    let err = receiving.add_part(part, true).unwrap_err();
    assert!(matches!(err, PartSetError::InvalidProof));

    // a part claiming the wrong index fails its branch too
    let mut part = complete.get_part(2).unwrap().clone();
    part.index = 3;
    assert!(receiving.add_part(part, true).is_err());
}

#[test]
fn proofs_verify_for_odd_leaf_counts() {
    for n in 1..=9usize {
        let data = vec![0xABu8; n * 64];
        let ps = PartSet::from_data(&data, 64);
        assert_eq!(ps.total() as usize, n);
        for part in ps.parts() {
            assert!(
                verify_merkle_proof(
                    part.leaf_hash(),
                    part.index as usize,
                    n,
                    &part.proof,
                    &ps.header().root,
                ),
                "proof for part {} of {n} must verify",
                part.index
            );
        }
    }
}

#[test]
fn merkle_root_of_single_leaf_is_the_leaf() {
    let leaf = blsbft::crypto::hash::sha256(b"only");
    assert_eq!(merkle_root(&[leaf]), leaf);
}

#[test]
fn block_survives_chunking() {
    let vals = TestValidators::new(4, 1);
    let (block, parts, block_id) = make_height1_block(&vals, vec![vec![1, 2, 3], vec![4; 100]]);

    let mut receiving = PartSet::from_header(block_id.parts_header);
    for part in parts.parts() {
        receiving.add_part(part.clone(), true).unwrap();
    }
    let bytes = receiving.assemble().unwrap();
    assert_eq!(bytes, encode_block(&block));
    let decoded = decode_block(&bytes).unwrap();
    assert_eq!(decoded, block);
    assert!(decoded.hashes_to(block_id.hash));
}
