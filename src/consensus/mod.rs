//! Consensus Module
//!
//! Drives the permissioned ledger: deterministic leader rotation over
//! the whitelist, the propose/vote/commit state machine, and catch-up
//! synchronization for nodes that fall behind.
//!
//! The engine is pure state: it never touches the network. The node
//! driver feeds it timer fires and inbound frames and turns the
//! returned outcomes into broadcasts and events.

mod leader;
mod voting;

pub use leader::Whitelist;
pub use voting::{required_approvals, VoteRound};

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::crypto::{KeyDirectory, NodeId, NodeKeypair};
use crate::ledger::{Block, Blockchain, ChainError, Mempool, Transaction, TransactionError};

/// Where the node stands in the current proposal cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusPhase {
    /// No proposal in flight.
    Idle,
    /// Local node proposed a block and is collecting votes.
    Proposing,
    /// A leader's proposal is held pending its commit announcement.
    Voting,
}

/// Result of recomputing the leader schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderUpdate {
    pub changed: bool,
    pub leader: Option<NodeId>,
    /// Local node just became leader.
    pub gained: bool,
    /// Local node just stopped being leader.
    pub lost: bool,
}

/// How to react to an inbound proposal.
#[derive(Debug)]
pub enum ProposalOutcome {
    /// Sender is not the accepted leader; proposal dropped without a vote.
    NotFromLeader,
    /// Ballot to broadcast.
    Vote { block_hash: String, approve: bool },
}

/// Result of closing the voting window.
#[derive(Debug)]
pub enum FinalizeOutcome {
    NoPending,
    /// Quorum reached; block appended locally.
    Committed(Block),
    /// Quorum missed; proposal dropped.
    Dropped {
        block_hash: String,
        approvals: usize,
        required: usize,
    },
    /// Follower window expired without a commit announcement.
    Abandoned { block_hash: String },
}

/// Result of an inbound commit announcement.
#[derive(Debug)]
pub enum NewBlockOutcome {
    Committed(Block),
    AlreadyKnown,
}

/// Ledger plus consensus state for one node.
pub struct ConsensusEngine {
    local_id: NodeId,
    whitelist: Whitelist,
    chain: Blockchain,
    mempool: Mempool,
    phase: ConsensusPhase,
    pending_block: Option<Block>,
    rounds: HashMap<String, VoteRound>,
    current_leader: Option<NodeId>,
    min_votes: usize,
    max_block_transactions: usize,
    slot_ms: u64,
}

impl ConsensusEngine {
    pub fn new(
        local_id: NodeId,
        whitelist: Whitelist,
        min_votes: usize,
        max_block_transactions: usize,
        slot_ms: u64,
    ) -> Self {
        Self {
            local_id,
            whitelist,
            chain: Blockchain::new(),
            mempool: Mempool::new(),
            phase: ConsensusPhase::Idle,
            pending_block: None,
            rounds: HashMap::new(),
            current_leader: None,
            min_votes,
            max_block_transactions,
            slot_ms,
        }
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn height(&self) -> u64 {
        self.chain.height()
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.len()
    }

    pub fn phase(&self) -> ConsensusPhase {
        self.phase
    }

    pub fn current_leader(&self) -> Option<&NodeId> {
        self.current_leader.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader.as_ref() == Some(&self.local_id)
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn whitelist_add(&mut self, id: NodeId) -> bool {
        self.whitelist.add(id)
    }

    pub fn whitelist_remove(&mut self, id: &NodeId) -> bool {
        self.whitelist.remove(id)
    }

    /// Re-run the schedule formula for the current time and height.
    pub fn recompute_leader(&mut self, now_ms: i64) -> LeaderUpdate {
        let leader = self.whitelist.leader_at(now_ms, self.height(), self.slot_ms);

        let was_leader = self.is_leader();
        let changed = leader != self.current_leader;
        self.current_leader = leader.clone();
        let is_leader_now = self.is_leader();

        if changed {
            info!(?leader, "Leader changed");
        }
        LeaderUpdate {
            changed,
            leader,
            gained: is_leader_now && !was_leader,
            lost: was_leader && !is_leader_now,
        }
    }

    /// Accept a peer's leadership claim when it is whitelisted and at
    /// least as far along as we are. A stale announcer never overrides
    /// the locally computed leader.
    pub fn on_leader_announcement(
        &mut self,
        from: &NodeId,
        leader: NodeId,
        claimed_height: u64,
    ) -> bool {
        if !self.whitelist.contains(from) {
            debug!(%from, "Ignoring leader announcement from non-whitelisted peer");
            return false;
        }
        if claimed_height < self.height() {
            debug!(%from, claimed_height, local = self.height(), "Ignoring stale leader announcement");
            return false;
        }
        if self.current_leader.as_ref() == Some(&leader) {
            return false;
        }
        info!(%leader, %from, "Accepting announced leader");
        self.current_leader = Some(leader);
        true
    }

    /// Sign (when local and unsigned), validate, and pool a locally
    /// submitted transaction. Returns the finalized transaction for
    /// broadcast.
    pub fn submit_local(
        &mut self,
        mut tx: Transaction,
        keypair: &NodeKeypair,
        keys: &KeyDirectory,
    ) -> Result<Transaction, TransactionError> {
        if tx.from == self.local_id && !tx.is_signed() {
            tx.sign(keypair);
        }
        tx.validate(keys)?;
        self.mempool.insert(tx.clone());
        Ok(tx)
    }

    /// Validate and pool a transaction received from a peer. Returns
    /// false for an already-known id. Receivers do not re-broadcast;
    /// flood control relies on set membership.
    pub fn on_remote_transaction(
        &mut self,
        tx: Transaction,
        keys: &KeyDirectory,
    ) -> Result<bool, TransactionError> {
        tx.validate(keys)?;
        Ok(self.mempool.insert(tx))
    }

    /// Leader timer fire: build, sign, and stage a proposal.
    ///
    /// Skipped while a proposal is in flight or when nothing in the
    /// mempool is eligible. Unsigned transactions are only includable
    /// by their own author.
    pub fn production_tick(&mut self, keypair: &NodeKeypair) -> Option<Block> {
        if !self.is_leader() || self.phase != ConsensusPhase::Idle {
            return None;
        }
        let local = self.local_id.clone();
        let txs = self
            .mempool
            .select(self.max_block_transactions, |tx| {
                tx.is_signed() || tx.from == local
            });
        if txs.is_empty() {
            return None;
        }

        let mut block = Block::new(
            self.height(),
            txs,
            self.chain.tip().hash.clone(),
            self.local_id.clone(),
        );
        block.sign(keypair);

        info!(index = block.index, txs = block.transactions.len(), "Proposing block");
        self.rounds.clear();
        self.rounds
            .entry(block.hash.clone())
            .or_default()
            .record(self.local_id.clone(), true);
        self.pending_block = Some(block.clone());
        self.phase = ConsensusPhase::Proposing;
        Some(block)
    }

    /// Inbound proposal from a peer session.
    pub fn on_proposal(
        &mut self,
        from: &NodeId,
        block: Block,
        keys: &KeyDirectory,
    ) -> ProposalOutcome {
        if self.current_leader.as_ref() != Some(from) {
            warn!(%from, index = block.index, "Dropping block proposal from non-leader");
            return ProposalOutcome::NotFromLeader;
        }

        let block_hash = block.hash.clone();
        let approve = match self.chain.validate_next(&block, keys) {
            Ok(()) => true,
            Err(e) => {
                warn!(index = block.index, error = %e, "Rejecting invalid proposal");
                false
            }
        };

        if approve {
            self.rounds
                .entry(block_hash.clone())
                .or_default()
                .record(self.local_id.clone(), true);
            self.pending_block = Some(block);
            self.phase = ConsensusPhase::Voting;
        }
        ProposalOutcome::Vote { block_hash, approve }
    }

    /// Record a ballot from a whitelisted voter.
    pub fn on_vote(&mut self, voter: NodeId, block_hash: String, approve: bool) -> bool {
        if !self.whitelist.contains(&voter) {
            debug!(%voter, "Ignoring vote from non-whitelisted peer");
            return false;
        }
        self.rounds.entry(block_hash).or_default().record(voter, approve)
    }

    /// Close the voting window for the pending proposal.
    pub fn finalize(&mut self, keys: &KeyDirectory) -> FinalizeOutcome {
        let Some(pending) = self.pending_block.take() else {
            self.phase = ConsensusPhase::Idle;
            return FinalizeOutcome::NoPending;
        };
        let block_hash = pending.hash.clone();

        match self.phase {
            ConsensusPhase::Proposing => {
                let approvals = self
                    .rounds
                    .get(&block_hash)
                    .map(VoteRound::approvals)
                    .unwrap_or(0);
                let required = required_approvals(self.min_votes, self.whitelist.len());
                self.phase = ConsensusPhase::Idle;
                self.rounds.clear();

                if approvals >= required {
                    match self.commit(pending, keys) {
                        Ok(block) => FinalizeOutcome::Committed(block),
                        Err(e) => {
                            warn!(error = %e, "Commit of own proposal failed");
                            FinalizeOutcome::Dropped { block_hash, approvals, required }
                        }
                    }
                } else {
                    info!(approvals, required, "Proposal missed quorum, dropping");
                    FinalizeOutcome::Dropped { block_hash, approvals, required }
                }
            }
            _ => {
                debug!(hash = %crate::crypto::hashing::short(&block_hash), "Vote window expired without commit");
                self.phase = ConsensusPhase::Idle;
                self.rounds.clear();
                FinalizeOutcome::Abandoned { block_hash }
            }
        }
    }

    /// Inbound commit announcement.
    pub fn on_new_block(
        &mut self,
        block: Block,
        keys: &KeyDirectory,
    ) -> Result<NewBlockOutcome, ChainError> {
        if block.index < self.height() {
            return Ok(NewBlockOutcome::AlreadyKnown);
        }
        let committed = self.commit(block, keys)?;
        // Whatever was pending is superseded by the commit.
        if self.pending_block.is_some() {
            self.pending_block = None;
            self.rounds.clear();
            self.phase = ConsensusPhase::Idle;
        }
        Ok(NewBlockOutcome::Committed(committed))
    }

    /// Serve a catch-up request.
    pub fn sync_response(&self, from_index: u64) -> (Vec<Block>, u64) {
        (self.chain.slice_from(from_index), self.height())
    }

    /// Apply a catch-up batch in order; stops at the first invalid
    /// block. Returns the applied blocks and the error that stopped
    /// application, if any.
    pub fn apply_sync(
        &mut self,
        blocks: Vec<Block>,
        keys: &KeyDirectory,
    ) -> (Vec<Block>, Option<ChainError>) {
        let mut applied = Vec::new();
        for block in blocks {
            if block.index < self.height() {
                continue;
            }
            match self.commit(block, keys) {
                Ok(b) => applied.push(b),
                Err(e) => {
                    warn!(error = %e, "Aborting sync batch at invalid block");
                    return (applied, Some(e));
                }
            }
        }
        // A pending proposal built on the old tip is stale now.
        if let Some(p) = &self.pending_block {
            if p.index < self.height() {
                self.pending_block = None;
                self.rounds.clear();
                self.phase = ConsensusPhase::Idle;
            }
        }
        (applied, None)
    }

    /// Validate, append, and purge committed transactions.
    fn commit(&mut self, block: Block, keys: &KeyDirectory) -> Result<Block, ChainError> {
        let ids: Vec<uuid::Uuid> = block.transaction_ids().copied().collect();
        let appended = self.chain.append(block, keys)?.clone();
        self.mempool.purge(ids.iter());
        info!(index = appended.index, txs = appended.transactions.len(), "Block committed");
        Ok(appended)
    }
}
