use crate::consensus::deps::BlockStore;
use crate::types::serialization::{decode_block, decode_commit, encode_block, encode_commit};
use crate::types::{Block, Commit, PartSet};
use anyhow::{anyhow, Result};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const CF_BLOCKS: &str = "blocks"; // height (u64 BE) -> encoded Block
const CF_SEEN_COMMITS: &str = "seen_commits"; // height (u64 BE) -> encoded Commit
const CF_META: &str = "meta"; // "last_height" -> u64 BE

fn height_key(h: u64) -> [u8; 8] {
    h.to_be_bytes()
}

/// RocksDB-backed block archive. Saves are a single atomic batch; the
/// height counter only moves forward.
pub struct RocksBlockStore {
    db: DB,
    height: AtomicU64,
}

impl RocksBlockStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SEEN_COMMITS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        let cf_meta = db.cf_handle(CF_META).expect("meta column family");
        let height = match db.get_cf(&cf_meta, b"last_height")? {
            Some(bytes) if bytes.len() == 8 => u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            _ => 0,
        };
        Ok(Self {
            db,
            height: AtomicU64::new(height),
        })
    }
}

impl BlockStore for RocksBlockStore {
    fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    fn save_block(&self, block: &Block, _parts: &PartSet, seen_commit: &Commit) -> Result<()> {
        let height = block.header.height;
        let last = self.height();
        if height != last + 1 {
            return Err(anyhow!(
                "save_block out of order: have height {last}, got block {height}"
            ));
        }
        let key = height_key(height);

        let cf_blocks = self.db.cf_handle(CF_BLOCKS).expect("blocks column family");
        let cf_commits = self
            .db
            .cf_handle(CF_SEEN_COMMITS)
            .expect("seen_commits column family");
        let cf_meta = self.db.cf_handle(CF_META).expect("meta column family");

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(&cf_blocks, key, encode_block(block));
        batch.put_cf(&cf_commits, key, encode_commit(seen_commit));
        batch.put_cf(&cf_meta, b"last_height", key);
        self.db.write(batch)?;
        self.height.store(height, Ordering::SeqCst);
        Ok(())
    }

    fn load_block(&self, height: u64) -> Result<Option<Block>> {
        let cf = self.db.cf_handle(CF_BLOCKS).expect("blocks column family");
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                decode_block(&bytes).map_err(|e| anyhow!("decode block {height}: {e}"))?,
            )),
        }
    }

    fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>> {
        let cf = self
            .db
            .cf_handle(CF_SEEN_COMMITS)
            .expect("seen_commits column family");
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                decode_commit(&bytes).map_err(|e| anyhow!("decode seen commit {height}: {e}"))?,
            )),
        }
    }

    fn load_block_commit(&self, height: u64) -> Result<Option<Commit>> {
        Ok(self
            .load_block(height + 1)?
            .and_then(|block| block.last_commit))
    }
}
