//! The per-height round state machine. One actor — the receive routine —
//! owns `RoundState` and is the only writer; peers, our own loopback
//! messages, and timeout ticks arrive over bounded queues and are
//! WAL-logged before they touch state.

use crate::config::ConsensusConfig;
use crate::consensus::deps::{AppConnection, BlockStore, ChainState, Epoch, Mempool};
use crate::consensus::messages::{ConsensusMessage, MsgInfo, RoundStep, TimeoutInfo};
use crate::consensus::ticker::TimeoutTicker;
use crate::consensus::vote_set::{HeightVoteSet, VoteSetError};
use crate::metrics::Metrics;
use crate::storage::wal::{Wal, WalRecord};
use crate::types::serialization::decode_block;
use crate::types::{
    Block, BlockId, Part, PartSet, PrivValidator, Proposal, SignAggr, Vote, VoteKind,
};
use anyhow::anyhow;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

const MSG_QUEUE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("invalid proposal signature")]
    InvalidProposalSignature,
    #[error("invalid proposal POL round")]
    InvalidProposalPolRound,
    #[error("vote height mismatch")]
    VoteHeightMismatch,
    #[error("conflicting votes from validator {}", existing.validator_index)]
    ConflictingVotes {
        existing: Box<Vote>,
        conflicting: Box<Vote>,
    },
    #[error("invalid signature aggregate")]
    InvalidSignAggr,
    #[error("duplicate signature aggregate")]
    DuplicateSignAggr,
    #[error("signature aggregate lacks +2/3 power")]
    NotMaj23SignAggr,
    #[error("error adding vote: {0}")]
    AddingVote(String),
}

/// Everything the state machine knows about the height in progress.
/// Mutated only by the receive routine; readers get clones.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    pub start_time: Instant,
    /// When +2/3 precommits for a block were first observed this height.
    pub commit_time: Option<Instant>,
    pub validators: crate::types::ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    /// -1 while unlocked.
    pub locked_round: i32,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    /// -1 until entering Commit; then the round whose precommits finalize.
    pub commit_round: i32,
    /// Aggregate precommits for height - 1.
    pub last_commit: Option<SignAggr>,
    pub last_validators: crate::types::ValidatorSet,
    pub prevote_maj23_sign_aggr: Option<SignAggr>,
    pub precommit_maj23_sign_aggr: Option<SignAggr>,
}

/// Cheap shared view for other threads (RPC, gossip) without touching
/// the actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundStateSummary {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

/// Cloneable handle for feeding messages into the state machine and
/// stopping it.
#[derive(Clone)]
pub struct ConsensusHandle {
    peer_tx: Sender<MsgInfo>,
    internal_tx: Sender<MsgInfo>,
    quit_tx: Sender<()>,
    summary: Arc<Mutex<RoundStateSummary>>,
}

impl ConsensusHandle {
    /// May block if the peer queue is full.
    pub fn add_vote(&self, vote: Vote, peer_id: Option<String>) {
        self.send(ConsensusMessage::Vote(vote), peer_id);
    }

    pub fn set_proposal(&self, proposal: Proposal, peer_id: Option<String>) {
        self.send(ConsensusMessage::Proposal(proposal), peer_id);
    }

    pub fn add_block_part(&self, height: u64, round: u32, part: Part, peer_id: Option<String>) {
        self.send(
            ConsensusMessage::BlockPart {
                height,
                round,
                part,
            },
            peer_id,
        );
    }

    pub fn set_maj23_sign_aggr(&self, aggr: SignAggr, peer_id: Option<String>) {
        self.send(ConsensusMessage::Maj23SignAggr(aggr), peer_id);
    }

    pub fn send(&self, msg: ConsensusMessage, peer_id: Option<String>) {
        let mi = MsgInfo { msg, peer_id };
        let queue = if mi.peer_id.is_some() {
            &self.peer_tx
        } else {
            &self.internal_tx
        };
        let _ = queue.send(mi);
    }

    pub fn round_summary(&self) -> RoundStateSummary {
        *self.summary.lock().expect("summary lock poisoned")
    }

    pub fn quit(&self) {
        let _ = self.quit_tx.send(());
    }
}

pub struct ConsensusState {
    config: ConsensusConfig,
    rs: RoundState,
    /// Chain state up to height - 1.
    state: ChainState,

    block_store: Arc<dyn BlockStore>,
    mempool: Arc<dyn Mempool>,
    epoch: Arc<dyn Epoch>,
    app: Box<dyn AppConnection>,
    priv_validator: Option<Box<dyn PrivValidator>>,

    peer_tx: Sender<MsgInfo>,
    peer_rx: Receiver<MsgInfo>,
    internal_tx: Sender<MsgInfo>,
    internal_rx: Receiver<MsgInfo>,
    quit_tx: Sender<()>,
    quit_rx: Receiver<()>,
    outbound: Option<Sender<ConsensusMessage>>,

    ticker: TimeoutTicker,
    wal: Option<Wal>,
    /// Set while re-feeding WAL records: no sends, no signing, no sleeps.
    replay_mode: bool,
    n_steps: u64,
    height_started: Instant,

    summary: Arc<Mutex<RoundStateSummary>>,
    metrics: Metrics,
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        state: ChainState,
        block_store: Arc<dyn BlockStore>,
        mempool: Arc<dyn Mempool>,
        epoch: Arc<dyn Epoch>,
        app: Box<dyn AppConnection>,
    ) -> Self {
        let height = state.last_block_height + 1;
        let rs = RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time: Instant::now() + config.commit_timeout(),
            commit_time: None,
            validators: state.validators.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            votes: HeightVoteSet::new(&config.chain_id, height, state.validators.clone()),
            commit_round: -1,
            last_commit: None,
            last_validators: state.last_validators.clone(),
            prevote_maj23_sign_aggr: None,
            precommit_maj23_sign_aggr: None,
        };
        let (peer_tx, peer_rx) = bounded(MSG_QUEUE_SIZE);
        let (internal_tx, internal_rx) = bounded(MSG_QUEUE_SIZE);
        let (quit_tx, quit_rx) = bounded(1);
        let summary = Arc::new(Mutex::new(RoundStateSummary {
            height,
            round: 0,
            step: RoundStep::NewHeight,
        }));
        let mut cs = ConsensusState {
            config,
            rs,
            state,
            block_store,
            mempool,
            epoch,
            app,
            priv_validator: None,
            peer_tx,
            peer_rx,
            internal_tx,
            internal_rx,
            quit_tx,
            quit_rx,
            outbound: None,
            ticker: TimeoutTicker::new(),
            wal: None,
            replay_mode: false,
            n_steps: 0,
            height_started: Instant::now(),
            summary,
            metrics: Metrics::new(),
        };
        cs.reconstruct_last_commit();
        cs.metrics.height.set(cs.rs.height as i64);
        cs
    }

    pub fn set_priv_validator(&mut self, pv: Box<dyn PrivValidator>) {
        self.priv_validator = Some(pv);
    }

    /// Outgoing broadcasts (proposals, parts, votes, aggregates) are
    /// handed to this channel; the transport gossips them.
    pub fn set_outbound(&mut self, outbound: Sender<ConsensusMessage>) {
        self.outbound = Some(outbound);
    }

    pub fn set_metrics(&mut self, metrics: Metrics) {
        self.metrics = metrics;
    }

    pub fn handle(&self) -> ConsensusHandle {
        ConsensusHandle {
            peer_tx: self.peer_tx.clone(),
            internal_tx: self.internal_tx.clone(),
            quit_tx: self.quit_tx.clone(),
            summary: self.summary.clone(),
        }
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &ChainState {
        &self.state
    }

    pub fn is_proposer(&self) -> bool {
        match &self.priv_validator {
            Some(pv) => self.rs.validators.proposer().address == pv.address(),
            None => false,
        }
    }

    /// Opens the WAL at the configured path.
    pub fn open_wal(&mut self) -> anyhow::Result<()> {
        let path = std::path::PathBuf::from(&self.config.cs_wal_file);
        self.wal = Some(Wal::open(&path, self.config.cs_wal_light)?);
        Ok(())
    }

    /// Opens the WAL, replays it to catch up after a crash, and spawns
    /// the receive routine on its own thread.
    pub fn start(mut self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("consensus-state".into())
            .spawn(move || {
                if self.wal.is_none() {
                    if let Err(e) = self.open_wal() {
                        error!(error = %e, "failed to open consensus WAL");
                        return;
                    }
                }
                if let Err(e) = self.catchup_replay() {
                    warn!(error = %e, "catchup replay failed; starting anyway");
                }
                self.schedule_round0();
                self.receive_routine(0);
            })
            .expect("spawn consensus thread")
    }

    /// The actor loop. `max_steps` > 0 bounds the number of step
    /// transitions, which tests use to run a finite slice of protocol.
    pub fn receive_routine(&mut self, max_steps: u64) {
        let peer_rx = self.peer_rx.clone();
        let internal_rx = self.internal_rx.clone();
        let tock_rx = self.ticker.tock_channel().clone();
        let quit_rx = self.quit_rx.clone();
        loop {
            if max_steps > 0 && self.n_steps >= max_steps {
                warn!(steps = self.n_steps, "reached max steps, exiting receive routine");
                self.n_steps = 0;
                return;
            }
            select! {
                recv(peer_rx) -> mi => match mi {
                    Ok(mi) => self.handle_msg(mi),
                    Err(_) => return,
                },
                recv(internal_rx) -> mi => match mi {
                    Ok(mi) => self.handle_msg(mi),
                    Err(_) => return,
                },
                recv(tock_rx) -> ti => match ti {
                    Ok(ti) => self.handle_timeout(ti),
                    Err(_) => return,
                },
                recv(quit_rx) -> _ => {
                    // our own signed messages may still sit in the
                    // internal queue unlogged; the signing device's
                    // last-sign state covers that gap
                    self.ticker.stop();
                    self.wal = None;
                    return;
                }
            }
        }
    }

    /// Drains queued loopback messages synchronously. The receive
    /// routine does this continuously; direct drivers (tests, tools)
    /// call it after handlers that emit our own votes or aggregates.
    pub fn drain_internal_queue(&mut self) {
        while let Ok(mi) = self.internal_rx.try_recv() {
            self.handle_msg(mi);
        }
    }

    // ------------------------------------------------------------------
    // Event entry points
    // ------------------------------------------------------------------

    /// Dispatches one message. WAL-logs it first; state transitions on
    /// complete proposals, +2/3-any, and +2/3-majority happen inside.
    pub fn handle_msg(&mut self, mi: MsgInfo) {
        let record = match &mi.peer_id {
            Some(_) => WalRecord::PeerMessage(mi.msg.clone()),
            None => WalRecord::InternalMessage(mi.msg.clone()),
        };
        self.wal_write(record);

        let peer_id = mi.peer_id;
        match mi.msg {
            ConsensusMessage::Proposal(proposal) => {
                debug!(%proposal, "received proposal");
                match self.set_proposal(proposal) {
                    Ok(true) => self.enter_prevote(self.rs.height, self.rs.round),
                    Ok(false) => {}
                    Err(e) => warn!(peer = ?peer_id, error = %e, "rejected proposal"),
                }
            }
            ConsensusMessage::BlockPart {
                height,
                round,
                part,
            } => {
                let verify = peer_id.is_some();
                match self.add_proposal_block_part(height, part, verify) {
                    Ok(_) => self.on_proposal_progress(),
                    Err(e) => {
                        // parts for other rounds are stale, not malicious
                        if round == self.rs.round {
                            warn!(peer = ?peer_id, error = %e, "failed to add block part");
                        }
                    }
                }
            }
            ConsensusMessage::Vote(vote) => {
                match self.try_add_vote(vote, peer_id.clone()) {
                    Ok(()) => {}
                    Err(ConsensusError::VoteHeightMismatch) => {}
                    Err(ConsensusError::ConflictingVotes { .. }) => {
                        // evidence retained by the vote set; an external
                        // slashing path may punish the validator
                    }
                    Err(e) => warn!(peer = ?peer_id, error = %e, "failed to add vote"),
                }
                // let gossip carry the precommit aggregate before we race ahead
                if self.rs.precommit_maj23_sign_aggr.is_some() && !self.replay_mode {
                    let delay = self.config.sign_aggr_gossip_delay;
                    if delay > 0 {
                        std::thread::sleep(Duration::from_millis(delay));
                    }
                }
            }
            ConsensusMessage::Maj23SignAggr(aggr) => {
                debug!(%aggr, "received maj23 sign aggregate");
                if let Err(e) = self.set_maj23_sign_aggr(aggr) {
                    warn!(peer = ?peer_id, error = %e, "rejected sign aggregate");
                }
            }
        }
    }

    /// Dispatches one timeout tick; obsolete ticks are discarded by
    /// (height, round, step) comparison.
    pub fn handle_timeout(&mut self, ti: TimeoutInfo) {
        self.wal_write(WalRecord::Timeout(ti));
        debug!(timeout = %ti, "received tock");
        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            debug!(timeout = %ti, height = self.rs.height, round = self.rs.round,
                   step = %self.rs.step, "ignoring stale tock");
            return;
        }
        self.metrics.timeouts_fired.inc();
        match ti.step {
            RoundStep::NewHeight => self.enter_new_round(ti.height, 0),
            RoundStep::Propose => self.enter_prevote(ti.height, ti.round),
            RoundStep::PrevoteWait => self.enter_precommit(ti.height, ti.round),
            RoundStep::PrecommitWait => self.enter_new_round(ti.height, ti.round + 1),
            step => panic!("invalid timeout step: {step}"),
        }
    }

    // ------------------------------------------------------------------
    // Step transitions
    // ------------------------------------------------------------------

    fn enter_new_round(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != RoundStep::NewHeight)
        {
            debug!(height, round, current = %self.current_hrs(), "enter_new_round: invalid args");
            return;
        }
        info!(height, round, current = %self.current_hrs(), "entering new round");

        if round > self.rs.round {
            let delta = round - self.rs.round;
            self.rs.validators.increment_accum(delta);
        }
        self.update_round_step(round, RoundStep::NewRound);
        if round != 0 {
            // round 0 keeps whatever arrived while we waited out NewHeight
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
            self.rs.prevote_maj23_sign_aggr = None;
            self.rs.precommit_maj23_sign_aggr = None;
        }
        // track the next round too so slightly-ahead votes can be parked
        self.rs.votes.set_round(round + 1);
        self.metrics.round.set(round as i64);

        self.enter_propose(height, round);
    }

    fn enter_propose(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Propose)
        {
            debug!(height, round, current = %self.current_hrs(), "enter_propose: invalid args");
            return;
        }
        info!(height, round, current = %self.current_hrs(), "entering propose");

        // if the proposal never shows up, prevote nil after this fires
        self.schedule_timeout(
            self.config.propose_timeout(round),
            height,
            round,
            RoundStep::Propose,
        );

        if self.priv_validator.is_some() {
            if self.is_proposer() {
                info!(height, round, "our turn to propose");
                self.decide_proposal(height, round);
            } else {
                debug!(proposer = %self.rs.validators.proposer().address, "not our turn to propose");
            }
        }

        self.update_round_step(round, RoundStep::Propose);
        self.new_step();

        // our own (or an early) proposal may already be in place
        if self.rs.proposal.is_some() {
            self.enter_prevote(height, self.rs.round);
        }
    }

    fn decide_proposal(&mut self, height: u64, round: u32) {
        if self.replay_mode {
            // the proposal we signed pre-crash replays as an internal message
            return;
        }
        // locked: propose the locked block again
        let locked = match (&self.rs.locked_block, &self.rs.locked_block_parts) {
            (Some(block), Some(parts)) => Some((block.clone(), parts.clone())),
            _ => None,
        };
        let (block, parts) = match locked.or_else(|| self.create_proposal_block()) {
            Some(pair) => pair,
            None => return,
        };
        let (pol_round, pol_block_id) = self.rs.votes.pol_info();
        let block_id = BlockId {
            hash: block.hash(),
            parts_header: parts.header(),
        };
        let Some(pv) = self.priv_validator.as_mut() else {
            return;
        };
        let mut proposal = Proposal::new(height, round, block_id, pol_round, pol_block_id, pv.address());
        let chain_id = self.config.chain_id.clone();
        if let Err(e) = pv.sign_proposal(&chain_id, &mut proposal) {
            warn!(height, round, error = %e, "failed to sign proposal");
            return;
        }
        info!(height, round, proposal = %proposal, "signed proposal");
        self.send_internal(MsgInfo::internal(ConsensusMessage::Proposal(
            proposal.clone(),
        )));
        self.broadcast(ConsensusMessage::Proposal(proposal));
        for part in parts.parts() {
            let msg = ConsensusMessage::BlockPart {
                height,
                round,
                part: part.clone(),
            };
            self.send_internal(MsgInfo::internal(msg.clone()));
            self.broadcast(msg);
        }
    }

    /// Assembles the next block from mempool and epoch transactions.
    fn create_proposal_block(&self) -> Option<(Block, PartSet)> {
        let last_commit = if self.rs.height == 1 {
            None
        } else {
            let Some(lc) = self.rs.last_commit.as_ref() else {
                panic!("cannot propose at height {}: no last commit", self.rs.height);
            };
            if !lc.has_two_thirds_majority(&self.rs.last_validators) {
                panic!(
                    "cannot propose at height {}: last commit lacks +2/3 power",
                    self.rs.height
                );
            }
            match lc.make_commit() {
                Ok(commit) => Some(commit),
                Err(e) => panic!("cannot build commit from last commit aggregate: {e}"),
            }
        };

        let mut txs = self.mempool.reap(self.config.block_size);
        match self.epoch.propose_transactions("proposer", self.rs.height) {
            Ok(epoch_txs) => {
                if !epoch_txs.is_empty() {
                    debug!(count = epoch_txs.len(), "epoch proposed transactions");
                    txs.extend(epoch_txs);
                }
            }
            Err(e) => {
                warn!(error = %e, "epoch refused to propose transactions");
                return None;
            }
        }

        let extra_data = if self.epoch.should_propose_next_epoch(self.rs.height) {
            self.epoch.propose_next_epoch(self.rs.height)
        } else {
            Vec::new()
        };

        let block = Block::make(
            self.rs.height,
            self.config.chain_id.clone(),
            txs,
            last_commit,
            self.state.last_block_id,
            self.state.validators.hash(),
            self.state.app_hash,
            extra_data,
        );
        let parts = block.make_part_set(self.config.block_part_size);
        Some((block, parts))
    }

    /// The proposal block is fully received and, if the proposer claimed
    /// a POL, we hold the +2/3 prevotes backing it.
    fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round < 0 {
            return true;
        }
        self.rs
            .votes
            .prevotes(proposal.pol_round as u32)
            .map(|vs| vs.two_thirds_majority().is_some())
            .unwrap_or(false)
    }

    fn enter_prevote(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Prevote)
        {
            debug!(height, round, current = %self.current_hrs(), "enter_prevote: invalid args");
            return;
        }
        info!(height, round, current = %self.current_hrs(), "entering prevote");

        self.do_prevote();

        self.update_round_step(round, RoundStep::Prevote);
        self.new_step();
        // once +2/3-any prevotes land we move to PrevoteWait in add_vote
    }

    fn do_prevote(&mut self) {
        // locked: prevote the lock no matter what is proposed
        if let Some(locked) = &self.rs.locked_block {
            let parts_header = self
                .rs
                .locked_block_parts
                .as_ref()
                .map(|p| p.header())
                .unwrap_or_default();
            let block_id = BlockId {
                hash: locked.hash(),
                parts_header,
            };
            info!("prevote: block is locked");
            self.sign_add_vote(VoteKind::Prevote, block_id);
            return;
        }
        match &self.rs.proposal {
            None => {
                warn!("prevote: no proposal, prevoting nil");
                self.sign_add_vote(VoteKind::Prevote, BlockId::nil());
            }
            Some(proposal) => {
                // the proposal signature was checked on receipt and each
                // part is checked against the merkle root as it arrives
                let block_id = proposal.block_id;
                self.sign_add_vote(VoteKind::Prevote, block_id);
            }
        }
    }

    fn enter_prevote_wait(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::PrevoteWait)
        {
            debug!(height, round, current = %self.current_hrs(), "enter_prevote_wait: invalid args");
            return;
        }
        let any = self
            .rs
            .votes
            .prevotes(round)
            .map(|vs| vs.two_thirds_any())
            .unwrap_or(false);
        if !any {
            panic!("enter_prevote_wait({height}/{round}) without +2/3-any prevotes");
        }
        info!(height, round, current = %self.current_hrs(), "entering prevote wait");

        self.schedule_timeout(
            self.config.prevote_timeout(round),
            height,
            round,
            RoundStep::PrevoteWait,
        );
        self.update_round_step(round, RoundStep::PrevoteWait);
        self.new_step();
    }

    fn enter_precommit(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Precommit)
        {
            debug!(height, round, current = %self.current_hrs(), "enter_precommit: invalid args");
            return;
        }
        info!(height, round, current = %self.current_hrs(), "entering precommit");

        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|vs| vs.two_thirds_majority());

        match maj23 {
            // no polka: precommit nil, keep any lock
            None => {
                if self.rs.locked_block.is_some() {
                    info!("precommit: no polka while locked, precommitting nil");
                } else {
                    info!("precommit: no polka, precommitting nil");
                }
                self.sign_add_vote(VoteKind::Precommit, BlockId::nil());
            }
            // +2/3 prevoted nil: unlock and precommit nil
            Some(block_id) if block_id.is_nil() => {
                if self.rs.locked_block.is_some() {
                    info!("precommit: polka for nil, unlocking");
                    self.unlock();
                }
                self.sign_add_vote(VoteKind::Precommit, BlockId::nil());
            }
            Some(block_id) => {
                let (pol_round, _) = self.rs.votes.pol_info();
                if pol_round < round as i32 {
                    panic!("POL round {pol_round} behind current round {round}");
                }
                let locked_matches = self
                    .rs
                    .locked_block
                    .as_ref()
                    .map(|b| b.hashes_to(block_id.hash))
                    .unwrap_or(false);
                let proposal_matches = self
                    .rs
                    .proposal_block
                    .as_ref()
                    .map(|b| b.hashes_to(block_id.hash))
                    .unwrap_or(false);

                if locked_matches {
                    info!(block = %block_id, "precommit: polka for locked block, relocking");
                    self.rs.locked_round = round as i32;
                    self.sign_add_vote(VoteKind::Precommit, block_id);
                } else if proposal_matches {
                    match self.validate_proposal_block() {
                        Ok(()) => {
                            info!(block = %block_id, "precommit: polka for proposal block, locking");
                            self.rs.locked_round = round as i32;
                            self.rs.locked_block = self.rs.proposal_block.clone();
                            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                            self.sign_add_vote(VoteKind::Precommit, block_id);
                        }
                        Err(e) => {
                            // treat like a block we don't have: the polka
                            // justifies the unlock, precommit nil
                            warn!(error = %e, "precommit: polka for invalid proposal block");
                            self.unlock();
                            self.reset_parts_for(block_id);
                            self.sign_add_vote(VoteKind::Precommit, BlockId::nil());
                        }
                    }
                } else {
                    // polka for a block we missed: unlock, start fetching
                    // its parts, precommit nil
                    info!(block = %block_id, "precommit: polka for unknown block, unlocking");
                    self.unlock();
                    self.reset_parts_for(block_id);
                    self.sign_add_vote(VoteKind::Precommit, BlockId::nil());
                }
            }
        }

        self.update_round_step(round, RoundStep::Precommit);
        self.new_step();
    }

    fn unlock(&mut self) {
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
    }

    fn reset_parts_for(&mut self, block_id: BlockId) {
        let have_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(|p| p.has_header(block_id.parts_header))
            .unwrap_or(false);
        if !have_header {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts_header));
        }
    }

    fn enter_precommit_wait(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::PrecommitWait)
        {
            debug!(height, round, current = %self.current_hrs(), "enter_precommit_wait: invalid args");
            return;
        }
        let any = self
            .rs
            .votes
            .precommits(round)
            .map(|vs| vs.two_thirds_any())
            .unwrap_or(false);
        if !any {
            panic!("enter_precommit_wait({height}/{round}) without +2/3-any precommits");
        }
        info!(height, round, current = %self.current_hrs(), "entering precommit wait");

        self.schedule_timeout(
            self.config.precommit_timeout(round),
            height,
            round,
            RoundStep::PrecommitWait,
        );
        self.update_round_step(round, RoundStep::PrecommitWait);
        self.new_step();
    }

    fn enter_commit(&mut self, height: u64, commit_round: u32) {
        if self.rs.height != height || self.rs.step >= RoundStep::Commit {
            debug!(height, commit_round, current = %self.current_hrs(), "enter_commit: invalid args");
            return;
        }
        info!(height, commit_round, current = %self.current_hrs(), "entering commit");

        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|vs| vs.two_thirds_majority())
            .unwrap_or_else(|| panic!("enter_commit({height}/{commit_round}) without +2/3 precommits"));
        if block_id.is_nil() {
            panic!("enter_commit({height}/{commit_round}) with nil majority");
        }

        // the lock no longer matters; promote it if it is the commit block
        let locked_matches = self
            .rs
            .locked_block
            .as_ref()
            .map(|b| b.hashes_to(block_id.hash))
            .unwrap_or(false);
        if locked_matches {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .map(|b| b.hashes_to(block_id.hash))
            .unwrap_or(false);
        if !have_block {
            // set up to receive the committed block's parts
            self.reset_parts_for(block_id);
        }

        // cs.round stays; commit_round points at the deciding precommits
        self.rs.step = RoundStep::Commit;
        self.rs.commit_round = commit_round as i32;
        self.rs.commit_time = Some(Instant::now());
        self.new_step();

        self.try_finalize_commit(height);
    }

    /// Finalizes if the commit block is fully known.
    fn try_finalize_commit(&mut self, height: u64) {
        if self.rs.height != height {
            panic!(
                "try_finalize_commit: height mismatch cs={} given={height}",
                self.rs.height
            );
        }
        if self.rs.commit_round < 0 {
            return;
        }
        let block_id = self
            .rs
            .votes
            .precommits(self.rs.commit_round as u32)
            .and_then(|vs| vs.two_thirds_majority());
        let Some(block_id) = block_id else {
            warn!(height, "cannot finalize: no +2/3 precommit majority");
            return;
        };
        if block_id.is_nil() {
            warn!(height, "cannot finalize: +2/3 precommitted nil");
            return;
        }
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .map(|b| b.hashes_to(block_id.hash))
            .unwrap_or(false);
        if !have_block {
            warn!(height, block = %block_id, "cannot finalize: commit block not yet received");
            return;
        }
        self.finalize_commit(height);
    }

    /// Persists and applies the committed block, then advances to the
    /// next height. Ordering is load-bearing: seen-commit construction
    /// precedes the save, and the WAL end-height marker precedes the
    /// application apply, so crash recovery is unambiguous.
    fn finalize_commit(&mut self, height: u64) {
        if self.rs.height != height || self.rs.step != RoundStep::Commit {
            debug!(height, current = %self.current_hrs(), "finalize_commit: invalid args");
            return;
        }
        let commit_round = self.rs.commit_round as u32;
        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|vs| vs.two_thirds_majority())
            .unwrap_or_else(|| panic!("finalize_commit without +2/3 precommit majority"));
        let block = self
            .rs
            .proposal_block
            .clone()
            .unwrap_or_else(|| panic!("finalize_commit without the commit block"));
        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .unwrap_or_else(|| panic!("finalize_commit without the commit block parts"));
        if !parts.has_header(block_id.parts_header) {
            panic!("finalize_commit: part set header does not match commit header");
        }
        if !block.hashes_to(block_id.hash) {
            panic!("finalize_commit: proposal block does not hash to commit hash");
        }
        if let Err(e) = self.validate_block(&block) {
            panic!("+2/3 committed an invalid block: {e}");
        }

        info!(
            height,
            round = commit_round,
            txs = block.txs.len(),
            hash = %block_id.hash,
            "finalizing block"
        );

        if !self.replay_mode && self.config.new_height_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.config.new_height_delay));
        }

        let store_height = self.block_store.height();
        if store_height < block.header.height {
            // the seen-commit is our local justification; it may differ
            // from the commit embedded in the next block
            let seen_aggr = self
                .rs
                .votes
                .precommits(commit_round)
                .expect("commit round tracked")
                .make_sign_aggr()
                .unwrap_or_else(|e| panic!("cannot aggregate commit precommits: {e}"));
            let seen_commit = seen_aggr
                .make_commit()
                .unwrap_or_else(|e| panic!("cannot build seen commit: {e}"));
            if let Err(e) = self.block_store.save_block(&block, &parts, &seen_commit) {
                error!(height, error = %e, "failed to save block; halting");
                return;
            }
        } else if store_height == block.header.height {
            // replay after a crash between save and end-height
            info!(height, "finalize_commit on already stored block");
        } else {
            panic!(
                "block store height {store_height} ahead of finalizing block {}",
                block.header.height
            );
        }

        // end-height must hit the WAL before apply: a crash in between
        // replays from here and re-applies idempotently
        self.wal_write_end_height(height);

        let new_state = match self
            .app
            .apply_block(&block, &parts.header(), self.mempool.as_ref())
        {
            Ok(state) => state,
            Err(e) => {
                error!(height, error = %e, "apply_block failed; refusing to advance");
                return;
            }
        };

        self.metrics
            .height_duration
            .observe(self.height_started.elapsed().as_secs_f64());
        self.update_to_state(new_state);
        self.height_started = Instant::now();

        self.schedule_round0();
    }

    /// Resets RoundState for the next height from freshly applied chain
    /// state (validators and epoch updates included).
    fn update_to_state(&mut self, state: ChainState) {
        if self.rs.commit_round > -1 && self.rs.height > 0 && self.rs.height != state.last_block_height
        {
            panic!(
                "update_to_state expected state height {} but got {}",
                self.rs.height, state.last_block_height
            );
        }
        if self.state.last_block_height + 1 != self.rs.height {
            panic!(
                "inconsistent chain state: last height {} + 1 != consensus height {}",
                self.state.last_block_height, self.rs.height
            );
        }
        if state.last_block_height <= self.state.last_block_height {
            info!(
                new_height = state.last_block_height + 1,
                old_height = self.state.last_block_height + 1,
                "ignoring stale update_to_state"
            );
            return;
        }

        let last_precommits = if self.rs.commit_round > -1 {
            self.rs
                .votes
                .precommits(self.rs.commit_round as u32)
                .and_then(|vs| vs.make_sign_aggr().ok())
        } else {
            None
        };

        let height = state.last_block_height + 1;
        let chain_id = self.config.chain_id.clone();
        self.rs.height = height;
        self.update_round_step(0, RoundStep::NewHeight);
        self.rs.start_time = match self.rs.commit_time {
            // commit_timeout gives stragglers time; on a fresh start "now"
            // lets the first block gather transactions
            Some(commit_time) => commit_time + self.config.commit_timeout(),
            None => Instant::now() + self.config.commit_timeout(),
        };
        self.rs.validators = state.validators.clone();
        self.rs.proposal = None;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.rs.prevote_maj23_sign_aggr = None;
        self.rs.precommit_maj23_sign_aggr = None;
        self.rs.votes = HeightVoteSet::new(&chain_id, height, state.validators.clone());
        self.rs.commit_round = -1;
        self.rs.last_commit = last_precommits;
        self.rs.last_validators = state.last_validators.clone();
        self.state = state;

        self.metrics.height.set(height as i64);
        self.metrics.round.set(0);
        self.new_step();
    }

    // ------------------------------------------------------------------
    // Message acceptance
    // ------------------------------------------------------------------

    fn set_proposal(&mut self, proposal: Proposal) -> Result<bool, ConsensusError> {
        if self.rs.proposal.is_some() {
            return Ok(false);
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(false);
        }
        if self.rs.step >= RoundStep::Commit {
            return Ok(false);
        }
        // POLRound: -1, or an earlier round of this height
        if proposal.pol_round != -1
            && (proposal.pol_round < 0 || proposal.pol_round >= proposal.round as i32)
        {
            return Err(ConsensusError::InvalidProposalPolRound);
        }
        let proposer = self.rs.validators.proposer();
        let sig = proposal
            .signature
            .as_ref()
            .ok_or(ConsensusError::InvalidProposalSignature)?;
        sig.verify(&proposal.sign_bytes(&self.config.chain_id), &proposer.pub_key)
            .map_err(|_| ConsensusError::InvalidProposalSignature)?;

        self.rs.proposal_block_parts = Some(PartSet::from_header(proposal.block_id.parts_header));
        self.rs.proposal = Some(proposal);
        self.metrics.proposals_received.inc();
        Ok(true)
    }

    fn add_proposal_block_part(
        &mut self,
        height: u64,
        part: Part,
        verify: bool,
    ) -> anyhow::Result<bool> {
        // block parts can be reused across rounds; only height must match
        if self.rs.height != height {
            return Ok(false);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            debug!("not expecting a block part");
            return Ok(false);
        };
        let added = parts.add_part(part, verify)?;
        if added && parts.is_complete() {
            let bytes = parts.assemble().expect("complete part set assembles");
            let block =
                decode_block(&bytes).map_err(|e| anyhow!("decoding proposal block: {e}"))?;
            info!(height = block.header.height, hash = %block.hash(), "received complete proposal block");
            self.rs.proposal_block = Some(block);
        }
        Ok(added)
    }

    /// Transitions unlocked by the proposal block completing.
    fn on_proposal_progress(&mut self) {
        if self.rs.proposal_block.is_none() {
            return;
        }
        let height = self.rs.height;
        let round = self.rs.round;
        if self.rs.step == RoundStep::Commit {
            self.try_finalize_commit(height);
            return;
        }
        if self.rs.precommit_maj23_sign_aggr.is_some() && self.is_proposal_complete() {
            self.enter_commit(height, round);
            return;
        }
        if self.rs.step == RoundStep::Prevote && self.is_proposal_complete() {
            let maj = self
                .rs
                .votes
                .prevotes(round)
                .and_then(|vs| vs.two_thirds_majority());
            if maj.is_some() {
                self.enter_precommit(height, round);
            }
        }
    }

    fn set_maj23_sign_aggr(&mut self, aggr: SignAggr) -> Result<bool, ConsensusError> {
        if aggr.height != self.rs.height || aggr.round != self.rs.round {
            debug!(%aggr, "sign aggregate does not apply");
            return Ok(false);
        }
        if aggr.chain_id != self.config.chain_id {
            return Err(ConsensusError::InvalidSignAggr);
        }
        match aggr.verify(&self.rs.validators) {
            Ok(true) => {}
            Ok(false) => return Err(ConsensusError::NotMaj23SignAggr),
            Err(e) => {
                warn!(error = %e, "sign aggregate failed verification");
                return Err(ConsensusError::InvalidSignAggr);
            }
        }

        let height = self.rs.height;
        let round = self.rs.round;
        match aggr.kind {
            VoteKind::Prevote => {
                if self.rs.prevote_maj23_sign_aggr.is_some() {
                    return Err(ConsensusError::DuplicateSignAggr);
                }
                self.rs
                    .votes
                    .install_sign_aggr(aggr.clone())
                    .map_err(|e| ConsensusError::AddingVote(e.to_string()))?;
                self.rs.prevote_maj23_sign_aggr = Some(aggr);
                self.metrics.sign_aggrs_received.inc();
                info!(height, round, "+2/3 prevote aggregate installed");
                if self.is_proposal_complete() {
                    self.enter_precommit(height, round);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            VoteKind::Precommit => {
                if self.rs.precommit_maj23_sign_aggr.is_some() {
                    return Err(ConsensusError::DuplicateSignAggr);
                }
                self.rs
                    .votes
                    .install_sign_aggr(aggr.clone())
                    .map_err(|e| ConsensusError::AddingVote(e.to_string()))?;
                self.rs.precommit_maj23_sign_aggr = Some(aggr);
                self.metrics.sign_aggrs_received.inc();
                info!(height, round, "+2/3 precommit aggregate installed");
                if self.is_proposal_complete() {
                    self.enter_commit(height, round);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn try_add_vote(&mut self, vote: Vote, peer_id: Option<String>) -> Result<(), ConsensusError> {
        match self.add_vote(vote) {
            Ok(_) => Ok(()),
            Err(e @ ConsensusError::VoteHeightMismatch) => {
                // not an error from our state's perspective
                debug!("vote ignored: height mismatch");
                Err(e)
            }
            Err(ConsensusError::ConflictingVotes {
                existing,
                conflicting,
            }) => {
                if peer_id.is_none() {
                    warn!(
                        height = conflicting.height,
                        round = conflicting.round,
                        "conflicting vote from ourselves; was the validator state reset?"
                    );
                } else {
                    warn!(
                        validator = %conflicting.validator_address,
                        "conflicting votes; evidence retained"
                    );
                }
                self.metrics.conflicting_votes.inc();
                Err(ConsensusError::ConflictingVotes {
                    existing,
                    conflicting,
                })
            }
            Err(e) => {
                // likely a bad signature: bad peer
                warn!(peer = ?peer_id, error = %e, "error attempting to add vote");
                Err(ConsensusError::AddingVote(e.to_string()))
            }
        }
    }

    fn add_vote(&mut self, vote: Vote) -> Result<bool, ConsensusError> {
        debug!(%vote, height = self.rs.height, "adding vote");

        // straggler precommit for the previous height while we wait out
        // NewHeight: fold it into LastCommit
        if vote.height + 1 == self.rs.height
            && vote.kind == VoteKind::Precommit
            && self.rs.step == RoundStep::NewHeight
        {
            let added = {
                let Some(last_commit) = self.rs.last_commit.as_mut() else {
                    return Ok(false);
                };
                last_commit
                    .add_vote(&vote, &self.rs.last_validators)
                    .map_err(|e| ConsensusError::AddingVote(e.to_string()))?
            };
            if added {
                info!(height = vote.height, "added straggler vote to last commit");
                let has_all = self
                    .rs
                    .last_commit
                    .as_ref()
                    .map(|lc| lc.has_all())
                    .unwrap_or(false);
                if self.config.skip_timeout_commit && has_all {
                    // everyone has committed; no reason to wait
                    self.enter_new_round(self.rs.height, 0);
                }
            }
            return Ok(added);
        }

        if vote.height != self.rs.height {
            info!(
                vote_height = vote.height,
                cs_height = self.rs.height,
                "vote ignored and not added"
            );
            return Err(ConsensusError::VoteHeightMismatch);
        }

        let round = vote.round;
        let kind = vote.kind;
        match self.rs.votes.add_vote(vote) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(VoteSetError::Conflicting {
                existing,
                conflicting,
            }) => {
                return Err(ConsensusError::ConflictingVotes {
                    existing,
                    conflicting,
                })
            }
            Err(e) => return Err(ConsensusError::AddingVote(e.to_string())),
        }
        self.metrics.votes_received.inc();

        if round != self.rs.round {
            return Ok(true);
        }
        let height = self.rs.height;
        match kind {
            VoteKind::Prevote => {
                let maj = self
                    .rs
                    .votes
                    .prevotes(round)
                    .and_then(|vs| vs.two_thirds_majority());
                let any = self
                    .rs
                    .votes
                    .prevotes(round)
                    .map(|vs| vs.two_thirds_any())
                    .unwrap_or(false);
                if maj.is_some() {
                    if self.rs.prevote_maj23_sign_aggr.is_none() {
                        self.send_maj23_sign_aggr(VoteKind::Prevote);
                    }
                    if self.rs.step == RoundStep::Prevote || self.rs.step == RoundStep::PrevoteWait {
                        self.enter_precommit(height, round);
                    }
                } else if any && self.rs.step == RoundStep::Prevote {
                    self.enter_prevote_wait(height, round);
                }
            }
            VoteKind::Precommit => {
                let maj = self
                    .rs
                    .votes
                    .precommits(round)
                    .and_then(|vs| vs.two_thirds_majority());
                let any = self
                    .rs
                    .votes
                    .precommits(round)
                    .map(|vs| vs.two_thirds_any())
                    .unwrap_or(false);
                match maj {
                    Some(block_id) if !block_id.is_nil() => {
                        if self.rs.precommit_maj23_sign_aggr.is_none() {
                            self.send_maj23_sign_aggr(VoteKind::Precommit);
                        }
                        self.enter_commit(height, round);
                    }
                    Some(_) => {
                        // +2/3 precommitted nil: this round is dead
                        self.enter_new_round(height, round + 1);
                    }
                    None => {
                        if any && self.rs.step == RoundStep::Precommit {
                            self.enter_precommit_wait(height, round);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Our own signing and aggregation
    // ------------------------------------------------------------------

    fn sign_add_vote(&mut self, kind: VoteKind, block_id: BlockId) -> Option<Vote> {
        if self.replay_mode {
            // recorded votes replay through the internal queue; never re-sign
            return None;
        }
        let address = self.priv_validator.as_ref()?.address();
        let (index, _) = self.rs.validators.get_by_address(&address)?;
        let mut vote = Vote {
            validator_index: index as u32,
            validator_address: address,
            height: self.rs.height,
            round: self.rs.round,
            kind,
            block_id,
            signature: None,
        };
        let chain_id = self.config.chain_id.clone();
        let pv = self.priv_validator.as_mut()?;
        if let Err(e) = pv.sign_vote(&chain_id, &mut vote) {
            warn!(height = vote.height, round = vote.round, error = %e, "failed to sign vote");
            return None;
        }
        info!(%vote, "signed and queued vote");
        self.send_internal(MsgInfo::internal(ConsensusMessage::Vote(vote.clone())));
        self.broadcast(ConsensusMessage::Vote(vote.clone()));
        Some(vote)
    }

    /// Builds the +2/3 aggregate from this round's vote set and feeds it
    /// to ourselves and the network.
    fn send_maj23_sign_aggr(&mut self, kind: VoteKind) {
        let round = self.rs.round;
        let vs = match kind {
            VoteKind::Prevote => self.rs.votes.prevotes(round),
            VoteKind::Precommit => self.rs.votes.precommits(round),
        };
        let Some(vs) = vs else { return };
        let aggr = match vs.make_sign_aggr() {
            Ok(aggr) => aggr,
            Err(e) => {
                error!(round, %kind, error = %e, "vote set has no +2/3 to aggregate");
                return;
            }
        };
        if kind == VoteKind::Precommit && aggr.maj23.is_nil() {
            // commit evidence must name a block
            return;
        }
        info!(%aggr, "built maj23 sign aggregate");
        self.metrics.sign_aggrs_sent.inc();
        self.send_internal(MsgInfo::internal(ConsensusMessage::Maj23SignAggr(
            aggr.clone(),
        )));
        self.broadcast(ConsensusMessage::Maj23SignAggr(aggr));
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn validate_proposal_block(&self) -> anyhow::Result<()> {
        let block = self
            .rs
            .proposal_block
            .as_ref()
            .ok_or_else(|| anyhow!("no proposal block"))?;
        self.validate_block(block)
    }

    /// Header and last-commit checks against the chain state. The
    /// application's own execution checks happen later in apply_block.
    fn validate_block(&self, block: &Block) -> anyhow::Result<()> {
        let header = &block.header;
        if header.chain_id != self.config.chain_id {
            anyhow::bail!("wrong chain id {:?}", header.chain_id);
        }
        if header.height != self.state.last_block_height + 1 {
            anyhow::bail!(
                "wrong block height {}, expected {}",
                header.height,
                self.state.last_block_height + 1
            );
        }
        if header.last_block_id != self.state.last_block_id {
            anyhow::bail!("wrong last block id");
        }
        if header.app_hash != self.state.app_hash {
            anyhow::bail!("wrong app hash");
        }
        if header.validators_hash != self.state.validators.hash() {
            anyhow::bail!("wrong validators hash");
        }
        let tx_leaves: Vec<crate::types::Hash> = block
            .txs
            .iter()
            .map(|tx| crate::crypto::hash::sha256(tx))
            .collect();
        if header.tx_root != crate::types::part_set::merkle_root(&tx_leaves) {
            anyhow::bail!("tx root mismatch");
        }
        if !header.extra_data.is_empty() {
            self.epoch
                .validate_next_epoch(&header.extra_data, header.height)?;
        }
        if header.height == 1 {
            if block.last_commit.is_some() {
                anyhow::bail!("height 1 block must carry no last commit");
            }
        } else {
            let Some(last_commit) = &block.last_commit else {
                anyhow::bail!("missing last commit");
            };
            if last_commit.height != header.height - 1 {
                anyhow::bail!("last commit is for height {}", last_commit.height);
            }
            if last_commit.block_id != self.state.last_block_id {
                anyhow::bail!("last commit names the wrong block");
            }
            let aggr = SignAggr::from_commit(&self.config.chain_id, last_commit);
            match aggr.verify(&self.state.last_validators) {
                Ok(true) => {}
                Ok(false) => anyhow::bail!("last commit lacks +2/3 power"),
                Err(e) => anyhow::bail!("invalid last commit aggregate: {e}"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Rebuilds LastCommit for height - 1 from the block store's
    /// seen-commit; the block was saved before the state, so it is
    /// always there.
    fn reconstruct_last_commit(&mut self) {
        if self.state.last_block_height == 0 {
            return;
        }
        let seen_commit = match self.block_store.load_seen_commit(self.state.last_block_height) {
            Ok(Some(commit)) => commit,
            Ok(None) => panic!(
                "no seen commit for height {} in block store",
                self.state.last_block_height
            ),
            Err(e) => panic!("failed to load seen commit: {e}"),
        };
        if seen_commit.size() != self.state.last_validators.len() {
            panic!(
                "seen commit signer count {} does not match last validator set size {}",
                seen_commit.size(),
                self.state.last_validators.len()
            );
        }
        self.rs.last_commit = Some(SignAggr::from_commit(&self.config.chain_id, &seen_commit));
    }

    /// Replays WAL records written after the last end-height marker,
    /// re-feeding them through the normal handlers with outbound sends,
    /// signing, and pacing sleeps suppressed.
    pub fn catchup_replay(&mut self) -> anyhow::Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let records = Wal::read_all(wal.path())?;
        let target = self.rs.height.checked_sub(1);
        let mut start = 0usize;
        let mut found = false;
        for (i, record) in records.iter().enumerate() {
            if let WalRecord::EndHeight(h) = record {
                if Some(*h) == target {
                    start = i + 1;
                    found = true;
                }
            }
        }
        if !found && self.rs.height > 1 {
            info!(height = self.rs.height, "no WAL records for current height");
            return Ok(());
        }
        let to_replay = &records[start..];
        if to_replay.is_empty() {
            return Ok(());
        }
        info!(count = to_replay.len(), height = self.rs.height, "replaying WAL records");
        self.replay_mode = true;
        for record in to_replay.to_vec() {
            match record {
                WalRecord::PeerMessage(msg) => {
                    self.handle_msg(MsgInfo::from_peer(msg, "wal-replay".into()))
                }
                WalRecord::InternalMessage(msg) => self.handle_msg(MsgInfo::internal(msg)),
                WalRecord::Timeout(ti) => self.handle_timeout(ti),
                WalRecord::NewRoundStep {
                    height,
                    round,
                    step,
                    ..
                } => {
                    debug!(height, round, %step, "replay: round step record");
                }
                WalRecord::EndHeight(h) => {
                    debug!(height = h, "replay: end height record");
                }
            }
        }
        self.replay_mode = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn update_round_step(&mut self, round: u32, step: RoundStep) {
        self.rs.round = round;
        self.rs.step = step;
    }

    fn new_step(&mut self) {
        let time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.wal_write(WalRecord::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
            time_ms,
        });
        self.n_steps += 1;
        self.metrics.step.set(self.rs.step.as_u8() as i64);
        *self.summary.lock().expect("summary lock poisoned") = RoundStateSummary {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
        };
    }

    fn current_hrs(&self) -> String {
        format!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step)
    }

    fn schedule_timeout(&self, duration: Duration, height: u64, round: u32, step: RoundStep) {
        self.ticker.schedule(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    fn schedule_round0(&self) {
        let sleep = self
            .rs
            .start_time
            .saturating_duration_since(Instant::now());
        self.schedule_timeout(sleep, self.rs.height, 0, RoundStep::NewHeight);
    }

    /// Loopback must never block the receive routine; overflow defers to
    /// a one-shot sender. Reordering our own messages is acceptable:
    /// votes are idempotent and the signing device prevents conflicts.
    fn send_internal(&self, mi: MsgInfo) {
        if self.replay_mode {
            return;
        }
        match self.internal_tx.try_send(mi) {
            Ok(()) => {}
            Err(TrySendError::Full(mi)) => {
                warn!("internal msg queue full; deferring send to a one-shot thread");
                let tx = self.internal_tx.clone();
                std::thread::spawn(move || {
                    let _ = tx.send(mi);
                });
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn broadcast(&self, msg: ConsensusMessage) {
        if self.replay_mode {
            return;
        }
        if let Some(outbound) = &self.outbound {
            if let Err(TrySendError::Full(_)) = outbound.try_send(msg) {
                warn!("outbound queue full; dropping broadcast");
            }
        }
    }

    fn wal_write(&mut self, record: WalRecord) {
        if self.replay_mode {
            return;
        }
        if let Some(wal) = &mut self.wal {
            if let Err(e) = wal.write(&record) {
                error!(error = %e, "failed to write WAL record");
            }
        }
    }

    /// End-height is written even during replay: a crash between save
    /// and end-height leaves the marker missing, and re-finalizing on
    /// replay is exactly when it must be restored.
    fn wal_write_end_height(&mut self, height: u64) {
        if let Some(wal) = &mut self.wal {
            if let Err(e) = wal.write_end_height(height) {
                error!(error = %e, "failed to write WAL end-height");
            }
        }
    }
}
