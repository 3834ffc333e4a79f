pub mod block_store;
pub mod wal;

pub use block_store::RocksBlockStore;
pub use wal::{Wal, WalError, WalRecord};
