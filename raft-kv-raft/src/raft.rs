//! Raft Consensus Algorithm Implementation
//!
//! This module implements the core Raft consensus algorithm including:
//! - Leader election with randomized timeouts
//! - Log replication with one worker per follower
//! - Majority commit and ordered application to the state machine
//!
//! All mutable consensus state lives in one [`RaftState`] behind a single
//! exclusive lock. The guard is never held across an `.await`: tasks read
//! what they need, release the lock, await the RPC, then re-acquire the lock
//! and check that term and role still match before using the reply.

use parking_lot::{Mutex, RwLock};
use raft_kv_core::{
    LogIndex, NodeId, NodeState, NodeStatus, RaftKvError, Result, Term,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::progress::ProgressTracker;
use crate::state_machine::StateMachine;
use crate::storage::{HardStateRef, Persister};
use crate::transport::Transport;

/// Configuration for Raft
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Unique ID for this node
    pub node_id: NodeId,
    /// IDs of the other cluster members
    pub peers: Vec<NodeId>,
    /// Election timeout range (randomized between min and max)
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Delay before a failed RequestVote is sent again
    pub rpc_retry_interval: Duration,
    /// Upper bound on entries carried by one AppendEntries
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: vec![],
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_retry_interval: Duration::from_millis(50),
            max_entries_per_append: 512,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min.is_zero() {
            return Err(RaftKvError::Configuration(
                "election timeout must be positive".to_string(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftKvError::Configuration(format!(
                "election timeout min {:?} exceeds max {:?}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftKvError::Configuration(format!(
                "heartbeat interval {:?} must be below the minimum election timeout {:?}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftKvError::Configuration(
                "max_entries_per_append must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Draw an election timeout uniformly from the configured range
    fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(fastrand::u64(min..=max))
    }
}

/// Term, vote and known leader as last written to stable storage
#[derive(Debug, Clone, Copy)]
struct DurableTerm {
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
}

/// Internal state of a Raft node
struct RaftState {
    current_term: Term,
    voted_for: Option<NodeId>,
    state: NodeState,
    log: RaftLog,
    commit_index: Option<LogIndex>,
    last_applied: Option<LogIndex>,
    peers: BTreeSet<NodeId>,
    leader_id: Option<NodeId>,
    votes_received: HashSet<NodeId>,
    // Leader state, rebuilt for every leadership session
    progress: Option<ProgressTracker>,
    replicators: HashMap<NodeId, Arc<Notify>>,
    // Timing
    last_heartbeat: Instant,
    election_timeout: Duration,
}

impl RaftState {
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn has_vote_majority(&self) -> bool {
        self.votes_received.len() > self.cluster_size() / 2
    }

    fn reset_election_timer(&mut self, config: &RaftConfig) {
        self.last_heartbeat = Instant::now();
        self.election_timeout = config.random_election_timeout();
    }

    /// Whether a candidate's log is at least as up to date as ours
    fn is_log_up_to_date(&self, last_log_term: Option<Term>, last_log_index: Option<LogIndex>) -> bool {
        let our_term = self.log.last_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.log.last_index())
    }

    fn durable_term(&self) -> DurableTerm {
        DurableTerm {
            current_term: self.current_term,
            voted_for: self.voted_for,
            leader_id: self.leader_id,
        }
    }

    /// Undo an unpersisted term or vote change. The role stays as it is now.
    fn restore_term(&mut self, saved: DurableTerm) {
        self.current_term = saved.current_term;
        self.voted_for = saved.voted_for;
        self.leader_id = saved.leader_id;
    }

    fn convert_to_follower(&mut self, term: Term, config: &RaftConfig) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.reset_election_timer(config);
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.progress = None;
        // Wake the workers of the old session so they observe the change and exit
        for (_, worker) in self.replicators.drain() {
            worker.notify_one();
        }
    }

    fn convert_to_candidate(&mut self, id: NodeId, config: &RaftConfig) {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(id);
        self.reset_election_timer(config);
    }

    fn convert_to_leader(&mut self, id: NodeId) {
        self.state = NodeState::Leader;
        self.leader_id = Some(id);
        self.votes_received.clear();
        self.progress = Some(ProgressTracker::new(self.peers.iter().copied(), self.log.len()));
        self.replicators.clear();
    }

    fn hard_state(&self) -> HardStateRef<'_> {
        HardStateRef {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.entries(),
            commit_index: self.commit_index,
        }
    }

    fn status(&self, id: NodeId) -> NodeStatus {
        NodeStatus {
            id,
            term: self.current_term,
            role: self.state,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            log_len: self.log.len(),
        }
    }
}

/// What a replication worker does after handling a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicationStep {
    /// Caught up; wait for the next wake-up
    Idle,
    /// Send again right away
    Retry,
    /// The leadership session is over
    Stop,
}

/// Main Raft consensus implementation
pub struct Raft<SM: StateMachine> {
    config: RaftConfig,
    state: Mutex<RaftState>,
    state_machine: RwLock<SM>,
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    status_tx: watch::Sender<NodeStatus>,
    apply_notify: Notify,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<SM: StateMachine> Raft<SM> {
    /// Create a Raft instance, recovering any state the persister holds
    ///
    /// Entries up to the recovered commit index are replayed into the state
    /// machine before the node takes part in the cluster.
    pub fn new(
        config: RaftConfig,
        mut state_machine: SM,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let hard_state = persister.load()?.unwrap_or_default();
        let log = RaftLog::from_entries(hard_state.log);
        let commit_index = hard_state
            .commit_index
            .filter(|&index| (index as usize) < log.len());

        let history: Vec<Vec<u8>> = match commit_index {
            Some(commit) => log
                .entries_between(0, commit)
                .iter()
                .map(|e| e.command.clone())
                .collect(),
            None => Vec::new(),
        };
        state_machine.reset(&history);

        if hard_state.current_term > 0 || !log.is_empty() {
            info!(
                "Node {} recovered term {}, {} log entries, {} replayed",
                config.node_id,
                hard_state.current_term,
                log.len(),
                history.len()
            );
        }

        let peers: BTreeSet<NodeId> = config
            .peers
            .iter()
            .copied()
            .filter(|&p| p != config.node_id)
            .collect();

        let state = RaftState {
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            state: NodeState::Follower,
            log,
            commit_index,
            last_applied: commit_index,
            peers,
            leader_id: None,
            votes_received: HashSet::new(),
            progress: None,
            replicators: HashMap::new(),
            last_heartbeat: Instant::now(),
            election_timeout: config.random_election_timeout(),
        };

        let (status_tx, _) = watch::channel(state.status(config.node_id));

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(state),
            state_machine: RwLock::new(state_machine),
            transport,
            persister,
            status_tx,
            apply_notify: Notify::new(),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start the role loop and the apply worker
    pub fn start(self: &Arc<Self>) {
        info!("Starting Raft node {}", self.config.node_id);

        let role_loop = tokio::spawn(Arc::clone(self).run_role_loop());
        let apply_loop = tokio::spawn(Arc::clone(self).run_apply_loop());
        self.tasks.lock().extend([role_loop, apply_loop]);
    }

    /// Stop every background task of this node
    pub fn shutdown(&self) {
        info!("Stopping Raft node {}", self.config.node_id);
        self.stopped.store(true, Ordering::SeqCst);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let state = self.state.lock();
        for worker in state.replicators.values() {
            worker.notify_one();
        }
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Latest published status
    pub fn status(&self) -> NodeStatus {
        self.status_tx.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    /// Check if this node is the leader
    pub fn is_leader(&self) -> bool {
        self.state.lock().state == NodeState::Leader
    }

    /// The leader this node last heard from (itself when leading)
    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader_id
    }

    /// Get the current term
    pub fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    /// Copy of the whole log
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().log.entries().to_vec()
    }

    /// Current members other than this node
    pub fn peers(&self) -> Vec<NodeId> {
        self.state.lock().peers.iter().copied().collect()
    }

    /// Run `f` against the applied state
    pub fn read_state_machine<R>(&self, f: impl FnOnce(&SM) -> R) -> R {
        f(&self.state_machine.read())
    }

    /// Append a client command to the leader's log
    ///
    /// Fails with `NotLeader` unless this node currently leads. Returns the
    /// entry's index once it is durable locally; commitment is observed
    /// separately through the state machine.
    pub fn append_entry(self: &Arc<Self>, command: Vec<u8>) -> Result<LogIndex> {
        let mut state = self.state.lock();
        if state.state != NodeState::Leader {
            return Err(RaftKvError::NotLeader {
                leader_id: state.leader_id,
            });
        }

        let term = state.current_term;
        let index = state.log.append(LogEntry::new(term, command));
        if let Err(e) = self.persist(&state) {
            // Nobody has seen the entry: it was appended under this guard
            state.log.truncate_from(index);
            return Err(e);
        }

        debug!("Node {} appended command at index {} (term {})", self.config.node_id, index, term);

        self.advance_commit_index(&mut state);
        for worker in state.replicators.values() {
            worker.notify_one();
        }
        self.publish(&state);
        Ok(index)
    }

    /// Start an election now, regardless of the election timer
    pub fn campaign(self: &Arc<Self>) {
        self.start_election(true);
    }

    /// Handle an AppendEntries RPC request
    pub fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock();

        // Reply false if term < currentTerm
        if req.term < state.current_term {
            debug!(
                "Rejecting AppendEntries from {} with stale term {} (current {})",
                req.leader_id, req.term, state.current_term
            );
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
            };
        }

        if req.term > state.current_term {
            info!(
                "Node {} observed term {} from leader {}, converting to follower",
                self.config.node_id, req.term, req.leader_id
            );
            let saved = state.durable_term();
            state.convert_to_follower(req.term, &self.config);
            if let Err(e) = self.persist(&state) {
                error!("Failed to persist term {}: {}", req.term, e);
                state.restore_term(saved);
                self.publish(&state);
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                };
            }
        } else if state.state != NodeState::Follower {
            info!(
                "Node {} stepping down: {} leads term {}",
                self.config.node_id, req.leader_id, req.term
            );
            state.convert_to_follower(req.term, &self.config);
        }
        state.leader_id = Some(req.leader_id);
        state.reset_election_timer(&self.config);

        // Reply false if the log doesn't contain prev_log_index with prev_log_term
        if let Some(prev) = req.prev_log_index {
            if state.log.term_at(prev) != req.prev_log_term {
                debug!(
                    "Log mismatch at index {} (expected term {:?}, have {:?})",
                    prev,
                    req.prev_log_term,
                    state.log.term_at(prev)
                );
                self.publish(&state);
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                };
            }
        }

        let last_new_index = req.last_index();
        let first_index = req.prev_log_index.map_or(0, |prev| prev + 1);
        // First changed index and the entries that were there, for rollback
        let mut displaced: Option<(LogIndex, Vec<LogEntry>)> = None;
        for (offset, entry) in req.entries.into_iter().enumerate() {
            let index = first_index + offset as LogIndex;
            match state.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    if Some(index) <= state.commit_index {
                        error!(
                            "Refusing to overwrite committed entry {} (term {}) with term {}",
                            index, term, entry.term
                        );
                        self.publish(&state);
                        return AppendEntriesResponse {
                            term: state.current_term,
                            success: false,
                        };
                    }
                    info!(
                        "Node {} truncating conflicting entries from index {}",
                        self.config.node_id, index
                    );
                    displaced = Some((index, state.log.entries_from(index).to_vec()));
                    state.log.truncate_from(index);
                    state.log.append(entry);
                }
                None => {
                    displaced.get_or_insert_with(|| (index, Vec::new()));
                    state.log.append(entry);
                }
            }
        }

        if let Some((changed_from, previous)) = displaced {
            if let Err(e) = self.persist(&state) {
                error!("Not acknowledging AppendEntries: {}", e);
                // Keep memory in line with what storage holds
                state.log.truncate_from(changed_from);
                for entry in previous {
                    state.log.append(entry);
                }
                self.publish(&state);
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                };
            }
        }

        if let (Some(leader_commit), Some(last_new)) = (req.leader_commit, last_new_index) {
            let new_commit = leader_commit.min(last_new);
            if Some(new_commit) > state.commit_index {
                state.commit_index = Some(new_commit);
                self.apply_notify.notify_one();
            }
        }

        self.publish(&state);
        AppendEntriesResponse {
            term: state.current_term,
            success: true,
        }
    }

    /// Handle a RequestVote RPC request
    pub fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.lock();

        // Reply false if term < currentTerm
        if req.term < state.current_term {
            return RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        let saved = state.durable_term();
        let mut dirty = false;
        if req.term > state.current_term {
            info!(
                "Node {} observed term {} from candidate {}, converting to follower",
                self.config.node_id, req.term, req.candidate_id
            );
            state.convert_to_follower(req.term, &self.config);
            dirty = true;
        }

        let can_vote = state.voted_for.is_none() || state.voted_for == Some(req.candidate_id);
        let vote_granted =
            can_vote && state.is_log_up_to_date(req.last_log_term, req.last_log_index);

        if vote_granted {
            state.voted_for = Some(req.candidate_id);
            state.reset_election_timer(&self.config);
            dirty = true;
        }

        if dirty {
            if let Err(e) = self.persist(&state) {
                error!("Withholding vote for {}: {}", req.candidate_id, e);
                state.restore_term(saved);
                self.publish(&state);
                return RequestVoteResponse {
                    term: state.current_term,
                    vote_granted: false,
                };
            }
        }

        if vote_granted {
            info!(
                "Node {} granted vote to candidate {} for term {}",
                self.config.node_id, req.candidate_id, req.term
            );
        }

        self.publish(&state);
        RequestVoteResponse {
            term: state.current_term,
            vote_granted,
        }
    }

    /// Add a member to the fan-out set
    pub fn add_peer(self: &Arc<Self>, peer: NodeId) -> bool {
        if peer == self.config.node_id {
            return false;
        }

        let mut state = self.state.lock();
        if !state.peers.insert(peer) {
            return false;
        }

        if state.state == NodeState::Leader {
            let log_len = state.log.len();
            if let Some(progress) = state.progress.as_mut() {
                progress.insert_peer(peer, log_len);
            }
            let term = state.current_term;
            self.spawn_replicator(&mut state, peer, term);
        }

        info!("Node {} added peer {}", self.config.node_id, peer);
        self.publish(&state);
        true
    }

    /// Remove a member from the fan-out set
    pub fn remove_peer(&self, peer: NodeId) -> bool {
        let mut state = self.state.lock();
        if !state.peers.remove(&peer) {
            return false;
        }

        if let Some(progress) = state.progress.as_mut() {
            progress.remove_peer(peer);
        }
        if let Some(worker) = state.replicators.remove(&peer) {
            worker.notify_one();
        }
        // A smaller cluster may already hold a majority for more entries
        self.advance_commit_index(&mut state);

        info!("Node {} removed peer {}", self.config.node_id, peer);
        self.publish(&state);
        true
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn persist(&self, state: &RaftState) -> Result<()> {
        self.persister.save(state.hard_state())
    }

    fn publish(&self, state: &RaftState) {
        self.status_tx.send_replace(state.status(self.config.node_id));
    }

    fn election_deadline(&self) -> Instant {
        let state = self.state.lock();
        state.last_heartbeat + state.election_timeout
    }

    /// One loop per node, dispatching on the current role
    async fn run_role_loop(self: Arc<Self>) {
        let mut status_rx = self.status_tx.subscribe();

        loop {
            if self.is_stopped() {
                return;
            }

            let role = status_rx.borrow_and_update().role;
            match role {
                NodeState::Leader => {
                    self.broadcast_append_entries();
                    tokio::time::sleep(self.config.heartbeat_interval).await;
                }
                NodeState::Follower | NodeState::Candidate => {
                    let deadline = self.election_deadline();
                    if Instant::now() >= deadline {
                        self.start_election(false);
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = status_rx.changed() => {}
                        }
                    }
                }
            }
        }
    }

    /// Wake every replication worker (heartbeat tick)
    fn broadcast_append_entries(&self) {
        let state = self.state.lock();
        if state.state != NodeState::Leader {
            return;
        }
        for worker in state.replicators.values() {
            worker.notify_one();
        }
    }

    /// Become a candidate and solicit votes from every peer
    fn start_election(self: &Arc<Self>, force: bool) {
        let (request, peers) = {
            let mut state = self.state.lock();
            if state.state == NodeState::Leader {
                return;
            }
            // A heartbeat may have arrived since the deadline was read
            if !force && state.last_heartbeat.elapsed() < state.election_timeout {
                return;
            }

            let saved = state.durable_term();
            state.convert_to_candidate(self.config.node_id, &self.config);
            info!(
                "Node {} starting election for term {}",
                self.config.node_id, state.current_term
            );

            if let Err(e) = self.persist(&state) {
                error!("Aborting election for term {}: {}", state.current_term, e);
                state.restore_term(saved);
                state.state = NodeState::Follower;
                state.votes_received.clear();
                self.publish(&state);
                return;
            }

            if state.has_vote_majority() {
                self.become_leader(&mut state);
                self.publish(&state);
                return;
            }
            self.publish(&state);

            let request = RequestVoteRequest {
                term: state.current_term,
                candidate_id: self.config.node_id,
                last_log_index: state.log.last_index(),
                last_log_term: state.log.last_term(),
            };
            (request, state.peers.iter().copied().collect::<Vec<_>>())
        };

        for peer in peers {
            let raft = Arc::clone(self);
            tokio::spawn(async move { raft.solicit_vote(peer, request).await });
        }
    }

    fn is_candidate_for(&self, term: Term) -> bool {
        if self.is_stopped() {
            return false;
        }
        let state = self.state.lock();
        state.state == NodeState::Candidate && state.current_term == term
    }

    /// Ask one peer for its vote, retrying transport failures while the
    /// candidacy for `request.term` lasts
    async fn solicit_vote(self: Arc<Self>, peer: NodeId, request: RequestVoteRequest) {
        while self.is_candidate_for(request.term) {
            match self.transport.request_vote(peer, request).await {
                Ok(response) => {
                    self.handle_vote_response(peer, request.term, response);
                    return;
                }
                Err(e) => {
                    debug!("RequestVote to {} for term {} failed: {}", peer, request.term, e);
                    tokio::time::sleep(self.config.rpc_retry_interval).await;
                }
            }
        }
    }

    fn handle_vote_response(self: &Arc<Self>, peer: NodeId, term: Term, response: RequestVoteResponse) {
        let mut state = self.state.lock();

        if response.term > state.current_term {
            info!(
                "Node {} saw term {} in vote reply from {}, abandoning election",
                self.config.node_id, response.term, peer
            );
            self.step_down(&mut state, response.term);
            return;
        }

        if state.state != NodeState::Candidate
            || state.current_term != term
            || response.term != term
        {
            debug!("Discarding stale vote reply from {} for term {}", peer, term);
            return;
        }

        if !response.vote_granted {
            debug!("Node {} denied vote for term {}", peer, term);
            return;
        }

        state.votes_received.insert(peer);
        debug!(
            "Received vote from {} for term {} ({}/{})",
            peer,
            term,
            state.votes_received.len(),
            state.cluster_size()
        );

        if state.has_vote_majority() {
            self.become_leader(&mut state);
        }
        self.publish(&state);
    }

    fn become_leader(self: &Arc<Self>, state: &mut RaftState) {
        let votes = state.votes_received.len();
        state.convert_to_leader(self.config.node_id);
        info!(
            "Node {} became leader for term {} with {}/{} votes",
            self.config.node_id,
            state.current_term,
            votes,
            state.cluster_size()
        );

        let term = state.current_term;
        let peers: Vec<NodeId> = state.peers.iter().copied().collect();
        for peer in peers {
            self.spawn_replicator(state, peer, term);
        }
        // A single-node cluster commits on its own
        self.advance_commit_index(state);
    }

    /// Follow a higher term seen in a reply. If the new term cannot be made
    /// durable the node still gives up its role but keeps its stored term.
    fn step_down(&self, state: &mut RaftState, term: Term) {
        let saved = state.durable_term();
        state.convert_to_follower(term, &self.config);
        if let Err(e) = self.persist(state) {
            error!("Failed to persist term {}: {}", term, e);
            state.restore_term(saved);
            state.leader_id = None;
        }
        self.publish(state);
    }

    fn spawn_replicator(self: &Arc<Self>, state: &mut RaftState, peer: NodeId, term: Term) {
        let wake = Arc::new(Notify::new());
        // First round goes out immediately
        wake.notify_one();
        if let Some(previous) = state.replicators.insert(peer, Arc::clone(&wake)) {
            // Replaced: the old worker no longer owns the peer and exits when woken
            previous.notify_one();
        }

        let raft = Arc::clone(self);
        tokio::spawn(async move { raft.replicate_to(peer, term, wake).await });
    }

    /// Replication worker for one follower during one leadership term
    async fn replicate_to(self: Arc<Self>, peer: NodeId, term: Term, wake: Arc<Notify>) {
        debug!("Replication to {} started for term {}", peer, term);

        loop {
            wake.notified().await;

            loop {
                let Some(request) = self.build_append_request(peer, term, &wake) else {
                    debug!("Replication to {} for term {} finished", peer, term);
                    return;
                };
                let matched = request.last_index();

                match self.transport.append_entries(peer, request).await {
                    Ok(response) => match self.handle_append_response(peer, term, matched, response) {
                        ReplicationStep::Idle => break,
                        ReplicationStep::Retry => continue,
                        ReplicationStep::Stop => return,
                    },
                    Err(e) => {
                        debug!("AppendEntries to {} failed: {}", peer, e);
                        break;
                    }
                }
            }
        }
    }

    /// Next request for `peer`, or `None` once `worker` no longer replicates
    /// to it in `term`
    fn build_append_request(
        &self,
        peer: NodeId,
        term: Term,
        worker: &Arc<Notify>,
    ) -> Option<AppendEntriesRequest> {
        if self.is_stopped() {
            return None;
        }

        let state = self.state.lock();
        if state.state != NodeState::Leader || state.current_term != term {
            return None;
        }
        if !state
            .replicators
            .get(&peer)
            .is_some_and(|current| Arc::ptr_eq(current, worker))
        {
            return None;
        }

        let next_index = state.progress.as_ref()?.get(peer)?.next_index;
        let prev_log_index = next_index.checked_sub(1);
        let prev_log_term = prev_log_index.and_then(|prev| state.log.term_at(prev));
        let entries: Vec<LogEntry> = state
            .log
            .entries_from(next_index)
            .iter()
            .take(self.config.max_entries_per_append)
            .cloned()
            .collect();

        Some(AppendEntriesRequest {
            term,
            leader_id: self.config.node_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: state.commit_index,
        })
    }

    fn handle_append_response(
        &self,
        peer: NodeId,
        term: Term,
        matched: Option<LogIndex>,
        response: AppendEntriesResponse,
    ) -> ReplicationStep {
        let mut state = self.state.lock();

        if response.term > state.current_term {
            info!(
                "Node {} saw term {} in reply from {}, stepping down",
                self.config.node_id, response.term, peer
            );
            self.step_down(&mut state, response.term);
            return ReplicationStep::Stop;
        }

        if state.state != NodeState::Leader || state.current_term != term {
            debug!("Discarding AppendEntries reply from {} for old term {}", peer, term);
            return ReplicationStep::Stop;
        }
        if response.term != term {
            debug!("Ignoring AppendEntries reply from {} with term {}", peer, response.term);
            return ReplicationStep::Idle;
        }

        let log_len = state.log.len() as LogIndex;
        let Some(progress) = state.progress.as_mut() else {
            return ReplicationStep::Stop;
        };

        if response.success {
            progress.record_success(peer, matched);
            let next_index = progress.get(peer).map_or(log_len, |p| p.next_index);
            self.advance_commit_index(&mut state);
            self.publish(&state);
            if next_index < log_len {
                ReplicationStep::Retry
            } else {
                ReplicationStep::Idle
            }
        } else if progress.record_mismatch(peer) {
            debug!(
                "Follower {} rejected entries, next index now {:?}",
                peer,
                progress.get(peer).map(|p| p.next_index)
            );
            ReplicationStep::Retry
        } else {
            warn!("Follower {} rejected entries from the start of the log", peer);
            ReplicationStep::Idle
        }
    }

    /// Commit the highest index held by a majority, if it was created in
    /// the current term
    fn advance_commit_index(&self, state: &mut RaftState) {
        let Some(progress) = state.progress.as_ref() else {
            return;
        };
        let Some(candidate) = progress.majority_match(state.log.last_index()) else {
            return;
        };

        if Some(candidate) > state.commit_index
            && state.log.term_at(candidate) == Some(state.current_term)
        {
            state.commit_index = Some(candidate);
            debug!("Node {} commit index advanced to {}", self.config.node_id, candidate);
            self.apply_notify.notify_one();
        }
    }

    /// Apply worker: the only writer of the state machine after recovery
    async fn run_apply_loop(self: Arc<Self>) {
        loop {
            self.apply_notify.notified().await;
            if self.is_stopped() {
                return;
            }
            self.apply_committed_entries();
        }
    }

    /// Apply every entry in `(last_applied, commit_index]`, in order
    fn apply_committed_entries(&self) -> usize {
        let (first, entries) = {
            let state = self.state.lock();
            let Some(commit) = state.commit_index else {
                return 0;
            };
            let first = state.last_applied.map_or(0, |applied| applied + 1);
            if first > commit {
                return 0;
            }
            (first, state.log.entries_between(first, commit).to_vec())
        };

        let mut state_machine = self.state_machine.write();
        for (offset, entry) in entries.iter().enumerate() {
            state_machine.apply(&entry.command);

            let mut state = self.state.lock();
            state.last_applied = Some(first + offset as LogIndex);
            self.publish(&state);
        }
        drop(state_machine);

        // Record the commit index so a restart can replay up to here
        let state = self.state.lock();
        if let Err(e) = self.persist(&state) {
            warn!("Failed to record commit index {:?}: {}", state.commit_index, e);
        }

        debug!(
            "Node {} applied {} entries through index {}",
            self.config.node_id,
            entries.len(),
            first + entries.len() as LogIndex - 1
        );
        entries.len()
    }
}
