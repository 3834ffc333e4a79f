//! Write-ahead log for the consensus state machine. Every message and
//! timeout the receive routine consumes is appended here before it can
//! affect state, so a crashed node can replay itself back to exactly
//! where it stopped.
//!
//! On-disk format: a sequence of frames, each
//! `u32 BE length | 1-byte tag | payload`, where the length covers the
//! tag and payload. Tags: 0x01 peer message, 0x02 internal message,
//! 0x03 timeout, 0x04 new-round-step, 0x05 end-height. The end-height
//! payload is a fixed 8-byte big-endian height, written only after the
//! block for that height is saved and applied.

use crate::consensus::messages::{ConsensusMessage, RoundStep, TimeoutInfo};
use crate::types::serialization::{Decoder, Encoder};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const TAG_PEER_MESSAGE: u8 = 0x01;
const TAG_INTERNAL_MESSAGE: u8 = 0x02;
const TAG_TIMEOUT: u8 = 0x03;
const TAG_NEW_ROUND_STEP: u8 = 0x04;
const TAG_END_HEIGHT: u8 = 0x05;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt WAL frame")]
    CorruptFrame,
}

#[derive(Clone, Debug)]
pub enum WalRecord {
    PeerMessage(ConsensusMessage),
    InternalMessage(ConsensusMessage),
    Timeout(TimeoutInfo),
    NewRoundStep {
        height: u64,
        round: u32,
        step: RoundStep,
        /// Wall-clock at write time, unix millis. Informational only;
        /// replay does not depend on it.
        time_ms: u64,
    },
    EndHeight(u64),
}

impl WalRecord {
    fn tag(&self) -> u8 {
        match self {
            WalRecord::PeerMessage(_) => TAG_PEER_MESSAGE,
            WalRecord::InternalMessage(_) => TAG_INTERNAL_MESSAGE,
            WalRecord::Timeout(_) => TAG_TIMEOUT,
            WalRecord::NewRoundStep { .. } => TAG_NEW_ROUND_STEP,
            WalRecord::EndHeight(_) => TAG_END_HEIGHT,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            WalRecord::PeerMessage(msg) | WalRecord::InternalMessage(msg) => msg.encode(),
            WalRecord::Timeout(ti) => ti.encode(),
            WalRecord::NewRoundStep {
                height,
                round,
                step,
                time_ms,
            } => {
                let mut e = Encoder::new();
                e.put_u64(*height);
                e.put_u32(*round);
                e.put_u8(step.as_u8());
                e.put_u64(*time_ms);
                e.into_bytes()
            }
            WalRecord::EndHeight(h) => h.to_be_bytes().to_vec(),
        }
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<WalRecord, WalError> {
        match tag {
            TAG_PEER_MESSAGE => Ok(WalRecord::PeerMessage(
                ConsensusMessage::decode(payload).map_err(|_| WalError::CorruptFrame)?,
            )),
            TAG_INTERNAL_MESSAGE => Ok(WalRecord::InternalMessage(
                ConsensusMessage::decode(payload).map_err(|_| WalError::CorruptFrame)?,
            )),
            TAG_TIMEOUT => Ok(WalRecord::Timeout(
                TimeoutInfo::decode(payload).map_err(|_| WalError::CorruptFrame)?,
            )),
            TAG_NEW_ROUND_STEP => {
                let mut d = Decoder::new(payload);
                let height = d.get_u64().map_err(|_| WalError::CorruptFrame)?;
                let round = d.get_u32().map_err(|_| WalError::CorruptFrame)?;
                let step = d
                    .get_u8()
                    .ok()
                    .and_then(RoundStep::from_u8)
                    .ok_or(WalError::CorruptFrame)?;
                let time_ms = d.get_u64().map_err(|_| WalError::CorruptFrame)?;
                Ok(WalRecord::NewRoundStep {
                    height,
                    round,
                    step,
                    time_ms,
                })
            }
            TAG_END_HEIGHT => {
                if payload.len() != 8 {
                    return Err(WalError::CorruptFrame);
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(payload);
                Ok(WalRecord::EndHeight(u64::from_be_bytes(b)))
            }
            _ => Err(WalError::CorruptFrame),
        }
    }
}

pub struct Wal {
    file: File,
    path: PathBuf,
    light: bool,
}

impl Wal {
    /// Opens (or creates) the WAL in append mode. `light` skips
    /// peer-message frames, shrinking the log at the cost of replaying
    /// only our own actions.
    pub fn open(path: &Path, light: bool) -> Result<Self, WalError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Wal {
            file,
            path: path.to_path_buf(),
            light,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and flushes. Must complete before the record's
    /// event is allowed to affect state.
    pub fn write(&mut self, record: &WalRecord) -> Result<(), WalError> {
        if self.light && matches!(record, WalRecord::PeerMessage(_)) {
            return Ok(());
        }
        let payload = record.payload();
        let len = (payload.len() + 1) as u32;
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(record.tag());
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn write_end_height(&mut self, height: u64) -> Result<(), WalError> {
        self.write(&WalRecord::EndHeight(height))
    }

    /// Reads every decodable frame. A truncated or garbled tail (crash
    /// mid-write) terminates the scan cleanly; everything before it is
    /// returned.
    pub fn read_all(path: &Path) -> Result<Vec<WalRecord>, WalError> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WalError::Io(e)),
        };
        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= data.len() {
            let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                as usize;
            if len == 0 || len > MAX_FRAME_LEN || pos + 4 + len > data.len() {
                warn!(offset = pos, "stopping WAL scan at truncated frame");
                break;
            }
            let tag = data[pos + 4];
            let payload = &data[pos + 5..pos + 4 + len];
            match WalRecord::decode(tag, payload) {
                Ok(record) => records.push(record),
                Err(_) => {
                    warn!(offset = pos, tag, "stopping WAL scan at corrupt frame");
                    break;
                }
            }
            pos += 4 + len;
        }
        Ok(records)
    }
}
