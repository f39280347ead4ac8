//! In-process cluster harness
//!
//! Nodes talk through an in-memory network that can isolate any node, so
//! partitions and crashes can be staged without sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use raft_kv_core::{KvCommand, NodeId, NodeState, RaftKvError, Result, Term};
use raft_kv_raft::{
    AppendEntriesRequest, AppendEntriesResponse, KvStateMachine, LogEntry, MemoryPersister, Raft,
    RaftConfig, RequestVoteRequest, RequestVoteResponse, Transport,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub type Node = Arc<Raft<KvStateMachine>>;

/// Message routing between the nodes of one test
#[derive(Default)]
pub struct Network {
    nodes: RwLock<HashMap<NodeId, Node>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl Network {
    fn route(&self, from: NodeId, to: NodeId) -> Result<Node> {
        let isolated = self.isolated.read();
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(RaftKvError::Network(format!("{} -> {} partitioned", from, to)));
        }
        self.nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| RaftKvError::Network(format!("node {} is down", to)))
    }

    pub fn isolate(&self, id: NodeId) {
        self.isolated.write().insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.isolated.write().remove(&id);
    }

    fn connect(&self, node: Node) {
        self.nodes.write().insert(node.id(), node);
    }

    fn disconnect(&self, id: NodeId) {
        self.nodes.write().remove(&id);
    }
}

/// Transport for one node over the shared [`Network`]
pub struct MemTransport {
    from: NodeId,
    network: Arc<Network>,
}

#[async_trait]
impl Transport for MemTransport {
    async fn request_vote(&self, target: NodeId, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let node = self.network.route(self.from, target)?;
        tokio::task::yield_now().await;
        let response = node.handle_request_vote(request);
        // The reply can be lost too
        self.network.route(target, self.from)?;
        Ok(response)
    }

    async fn append_entries(&self, target: NodeId, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let node = self.network.route(self.from, target)?;
        tokio::task::yield_now().await;
        let response = node.handle_append_entries(request);
        self.network.route(target, self.from)?;
        Ok(response)
    }
}

/// Records every (term, leader) pair any node ever published
#[derive(Default)]
pub struct LeaderLog {
    leaders: Mutex<BTreeMap<Term, HashSet<NodeId>>>,
}

impl LeaderLog {
    fn watch(self: &Arc<Self>, node: &Node) {
        let mut rx = node.subscribe();
        let log = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if status.role == NodeState::Leader {
                        log.leaders.lock().entry(status.term).or_default().insert(status.id);
                    }
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Panics if any term ever had two leaders
    pub fn assert_election_safety(&self) {
        for (term, leaders) in self.leaders.lock().iter() {
            assert!(leaders.len() <= 1, "term {} had leaders {:?}", term, leaders);
        }
    }
}

/// Samples every leader's log while it leads and checks each sample extends
/// the one before it for the same (node, term)
pub struct AppendOnlyCheck {
    stop: Arc<AtomicBool>,
    task: JoinHandle<usize>,
}

impl AppendOnlyCheck {
    fn spawn(nodes: Vec<Node>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let mut seen: HashMap<(NodeId, Term), Vec<LogEntry>> = HashMap::new();
            let mut samples = 0;
            while !done.load(Ordering::SeqCst) {
                for node in &nodes {
                    let term = node.current_term();
                    if !node.is_leader() {
                        continue;
                    }
                    let entries = node.log_entries();
                    // Only trust the sample if the node led in `term` the whole time
                    if !node.is_leader() || node.current_term() != term {
                        continue;
                    }
                    if let Some(before) = seen.get(&(node.id(), term)) {
                        assert!(
                            entries.starts_with(before),
                            "leader {} rewrote its log in term {}: {:?} -> {:?}",
                            node.id(),
                            term,
                            before,
                            entries
                        );
                    }
                    seen.insert((node.id(), term), entries);
                    samples += 1;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            samples
        });
        Self { stop, task }
    }

    /// Stop sampling; panics if any leader ever shortened or rewrote its log
    pub async fn finish(self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        self.task.await.expect("leader log was not append-only")
    }
}

pub struct TestCluster {
    pub network: Arc<Network>,
    pub leader_log: Arc<LeaderLog>,
    ids: Vec<NodeId>,
    nodes: BTreeMap<NodeId, Node>,
    persisters: BTreeMap<NodeId, Arc<MemoryPersister>>,
}

pub fn test_config(node_id: NodeId, ids: &[NodeId]) -> RaftConfig {
    RaftConfig {
        node_id,
        peers: ids.iter().copied().filter(|&id| id != node_id).collect(),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(30),
        rpc_retry_interval: Duration::from_millis(20),
        max_entries_per_append: 64,
    }
}

/// Route engine logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

impl TestCluster {
    /// Build `n` nodes with ids 1..=n; nothing runs until `start_all`
    pub fn new(n: u64) -> Self {
        init_tracing();
        let mut cluster = Self {
            network: Arc::new(Network::default()),
            leader_log: Arc::new(LeaderLog::default()),
            ids: (1..=n).collect(),
            nodes: BTreeMap::new(),
            persisters: BTreeMap::new(),
        };
        for id in cluster.ids.clone() {
            cluster.persisters.insert(id, Arc::new(MemoryPersister::new()));
            cluster.build_node(id);
        }
        cluster
    }

    fn build_node(&mut self, id: NodeId) -> Node {
        let transport = Arc::new(MemTransport {
            from: id,
            network: Arc::clone(&self.network),
        });
        let node = Raft::new(
            test_config(id, &self.ids),
            KvStateMachine::new(),
            transport,
            self.persisters[&id].clone(),
        )
        .expect("node should build");
        self.network.connect(Arc::clone(&node));
        self.nodes.insert(id, Arc::clone(&node));
        node
    }

    pub fn start_all(&self) {
        for node in self.nodes.values() {
            self.leader_log.watch(node);
            node.start();
        }
    }

    /// Start sampling the current nodes' logs while they lead
    pub fn check_leader_append_only(&self) -> AppendOnlyCheck {
        AppendOnlyCheck::spawn(self.nodes.values().cloned().collect())
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    /// Stop a node and take it off the network; its persisted state survives
    pub fn crash(&mut self, id: NodeId) {
        self.network.disconnect(id);
        if let Some(node) = self.nodes.remove(&id) {
            node.shutdown();
        }
    }

    /// Bring a crashed node back from its persisted state
    pub fn restart(&mut self, id: NodeId) -> Node {
        let node = self.build_node(id);
        self.leader_log.watch(&node);
        node.start();
        node
    }

    pub fn persister(&self, id: NodeId) -> &Arc<MemoryPersister> {
        &self.persisters[&id]
    }

    /// Wait until exactly one of `among` is leader and return it
    pub async fn wait_for_leader(&self, among: &[NodeId], timeout: Duration) -> NodeId {
        wait_for(timeout, || {
            let leaders: Vec<NodeId> = among
                .iter()
                .filter(|id| self.nodes.get(id).is_some_and(|n| n.is_leader()))
                .copied()
                .collect();
            (leaders.len() == 1).then(|| leaders[0])
        })
        .await
        .expect("timed out waiting for a single leader")
    }

    /// Submit `Set(key, value)` to `leader`
    pub fn set(&self, leader: NodeId, key: &str, value: &str) -> Result<u64> {
        let command = KvCommand::set(key, value).encode()?;
        self.node(leader).append_entry(command)
    }

    pub fn get(&self, id: NodeId, key: &str) -> Option<String> {
        self.node(id).read_state_machine(|sm| sm.get(key).map(str::to_owned))
    }

    /// Wait until every node in `on` has applied `key = value`
    pub async fn wait_for_value(&self, on: &[NodeId], key: &str, value: &str, timeout: Duration) {
        wait_for(timeout, || {
            on.iter()
                .all(|&id| self.get(id, key).as_deref() == Some(value))
                .then_some(())
        })
        .await
        .unwrap_or_else(|| panic!("timed out waiting for {} = {} on {:?}", key, value, on));
    }

    pub fn log(&self, id: NodeId) -> Vec<LogEntry> {
        self.node(id).log_entries()
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}

/// Poll `check` every 10ms until it yields a value or `timeout` passes
pub async fn wait_for<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
