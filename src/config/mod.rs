use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Consensus engine configuration. All timeouts are in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: String,

    #[serde(default = "default_timeout_propose")]
    pub timeout_propose: u64,
    #[serde(default = "default_timeout_delta")]
    pub timeout_propose_delta: u64,
    #[serde(default = "default_timeout_vote")]
    pub timeout_prevote: u64,
    #[serde(default = "default_timeout_delta")]
    pub timeout_prevote_delta: u64,
    #[serde(default = "default_timeout_vote")]
    pub timeout_precommit: u64,
    #[serde(default = "default_timeout_delta")]
    pub timeout_precommit_delta: u64,
    #[serde(default = "default_timeout_commit")]
    pub timeout_commit: u64,
    #[serde(default)]
    pub skip_timeout_commit: bool,

    /// Maximum total transaction bytes reaped into a proposal block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Chunk size for splitting a proposed block into gossip parts.
    #[serde(default = "default_block_part_size")]
    pub block_part_size: usize,

    #[serde(default = "default_wal_file")]
    pub cs_wal_file: String,
    /// Light WAL skips peer-message frames; only our own messages,
    /// timeouts and step records are persisted.
    #[serde(default)]
    pub cs_wal_light: bool,

    /// Pause before persisting a finalized block, spacing heights out.
    /// Pacing only; zero disables it.
    #[serde(default = "default_new_height_delay")]
    pub new_height_delay: u64,
    /// Pause after a maj23 precommit aggregate exists, letting gossip
    /// propagate before the next transition.
    #[serde(default = "default_sign_aggr_gossip_delay")]
    pub sign_aggr_gossip_delay: u64,
}

fn default_chain_id() -> String {
    "localnet".to_string()
}
fn default_timeout_propose() -> u64 {
    3000
}
fn default_timeout_vote() -> u64 {
    1000
}
fn default_timeout_delta() -> u64 {
    500
}
fn default_timeout_commit() -> u64 {
    1000
}
fn default_block_size() -> usize {
    512 * 1024
}
fn default_block_part_size() -> usize {
    64 * 1024
}
fn default_wal_file() -> String {
    "data/cs.wal".to_string()
}
fn default_new_height_delay() -> u64 {
    2000
}
fn default_sign_aggr_gossip_delay() -> u64 {
    100
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            timeout_propose: default_timeout_propose(),
            timeout_propose_delta: default_timeout_delta(),
            timeout_prevote: default_timeout_vote(),
            timeout_prevote_delta: default_timeout_delta(),
            timeout_precommit: default_timeout_vote(),
            timeout_precommit_delta: default_timeout_delta(),
            timeout_commit: default_timeout_commit(),
            skip_timeout_commit: false,
            block_size: default_block_size(),
            block_part_size: default_block_part_size(),
            cs_wal_file: default_wal_file(),
            cs_wal_light: false,
            new_height_delay: default_new_height_delay(),
            sign_aggr_gossip_delay: default_sign_aggr_gossip_delay(),
        }
    }
}

impl ConsensusConfig {
    /// How long to wait for a proposal at `round`.
    pub fn propose_timeout(&self, round: u32) -> Duration {
        Duration::from_millis(self.timeout_propose + self.timeout_propose_delta * round as u64)
    }

    /// After +2/3-any prevotes, how long to wait for stragglers.
    pub fn prevote_timeout(&self, round: u32) -> Duration {
        Duration::from_millis(self.timeout_prevote + self.timeout_prevote_delta * round as u64)
    }

    /// After +2/3-any precommits, how long to wait for stragglers.
    pub fn precommit_timeout(&self, round: u32) -> Duration {
        Duration::from_millis(self.timeout_precommit + self.timeout_precommit_delta * round as u64)
    }

    /// Gap between finding a commit and starting the next height.
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_commit)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }
}
