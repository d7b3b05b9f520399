//! Worker runtime for a raft node.
//!
//! - **Worker thread**: owns the [`RaftNode`] and runs the event loop
//! - **Transport threads**: move raft messages to and from peers
//! - **Callers**: talk to the worker through a [`NodeHandle`] and read
//!   published state from the [`StatusBoard`]
//!
//! Communication uses crossbeam channels so the raft state machine stays
//! single-threaded while network I/O and client calls run concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result as AnyResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use raft::prelude::Message;
use tracing::{debug, error, info, warn};

use crate::NodeId;
use crate::command::LogCommand;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::fsm::Fsm;
use crate::node::{ApplyOutcome, ApplyReport, MembershipChange, NodeOptions, Proposal, RaftNode};
use crate::status::{LeadershipEvent, RaftStatus, Role, StatusBoard};
use crate::transport::{NetworkEvent, Transport};

/// Requests sent from callers to the worker thread.
///
/// Each carries a one-shot channel for the worker's answer.
enum Request {
    Propose {
        command: LogCommand,
        respond_to: Sender<Result<Option<String>>>,
    },
    ChangeMembership {
        change: MembershipChange,
        respond_to: Sender<Result<()>>,
    },
    ReadIndex {
        deadline: Instant,
        respond_to: Sender<Result<()>>,
    },
    Shutdown,
}

/// Handle for sending requests to a running raft worker.
pub struct NodeHandle {
    id: NodeId,
    request_tx: Sender<Request>,
    status: Arc<StatusBoard>,
    fsm: Arc<Fsm>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn status_board(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    pub fn status(&self) -> RaftStatus {
        self.status.current()
    }

    /// Proposes `command` and blocks until it is applied locally.
    ///
    /// Returns the value the command replaced. Fails with `NotLeader` if this
    /// node is not leader or loses leadership before the entry commits.
    pub fn propose(&self, command: LogCommand, timeout: Duration) -> Result<Option<String>> {
        let (respond_to, response) = bounded(1);
        self.submit(Request::Propose {
            command,
            respond_to,
        })?;
        self.await_response(&response, timeout, "proposal to apply")
    }

    /// Proposes a voter change and blocks until it is applied locally.
    pub fn change_membership(&self, change: MembershipChange, timeout: Duration) -> Result<()> {
        let (respond_to, response) = bounded(1);
        self.submit(Request::ChangeMembership { change, respond_to })?;
        self.await_response(&response, timeout, "membership change to apply")
    }

    /// Confirms leadership with a quorum and waits until the local state
    /// machine has applied everything committed before the confirmation.
    pub fn read_index(&self, timeout: Duration) -> Result<()> {
        let (respond_to, response) = bounded(1);
        self.submit(Request::ReadIndex {
            deadline: Instant::now() + timeout,
            respond_to,
        })?;
        self.await_response(&response, timeout, "leadership confirmation")
    }

    /// Stops the worker and waits for it to exit. Safe to call twice.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(Request::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(node_id = self.id, "raft worker panicked");
            }
        }
    }

    fn submit(&self, request: Request) -> Result<()> {
        self.status.current().check_running()?;
        self.request_tx
            .send(request)
            .map_err(|_| self.stopped_error())
    }

    fn await_response<T>(
        &self,
        response: &Receiver<Result<T>>,
        timeout: Duration,
        what: &'static str,
    ) -> Result<T> {
        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout(what)),
            Err(RecvTimeoutError::Disconnected) => Err(self.stopped_error()),
        }
    }

    fn stopped_error(&self) -> StoreError {
        match self.status.current().check_running() {
            Err(err) => err,
            Ok(()) => StoreError::Closed,
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens the raft node described by `config` and starts its worker.
///
/// Returns the handle plus a channel of leadership transitions.
///
/// # Errors
///
/// Fails if durable state cannot be loaded or the raft address cannot be
/// bound.
pub fn spawn_node(
    config: &StoreConfig,
    fsm: Arc<Fsm>,
) -> AnyResult<(NodeHandle, Receiver<LeadershipEvent>)> {
    let id = config.node_id;
    let node = RaftNode::open(NodeOptions::from_config(config), Arc::clone(&fsm))?;

    let (network_tx, network_rx) = unbounded();
    let transport = Transport::start(id, config.raft_addr.clone(), network_tx)?;
    let (request_tx, request_rx) = unbounded();
    let (events_tx, events_rx) = unbounded();
    let status = Arc::new(StatusBoard::new());

    let mut worker = Worker {
        node,
        transport,
        routes: HashMap::new(),
        request_rx,
        network_rx,
        status: Arc::clone(&status),
        events_tx,
        tick_interval: config.raft.tick_interval,
        pending_commands: BTreeMap::new(),
        pending_changes: BTreeMap::new(),
        pending_reads: HashMap::new(),
        confirmed_reads: Vec::new(),
        next_read_id: 1,
        last_role: Role::Follower,
    };
    worker.publish();

    let board = Arc::clone(&status);
    let handle = thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || match worker.run() {
            Ok(()) => {
                worker.transport.shutdown();
                board.mark_stopped();
                info!(node_id = id, "raft worker stopped");
            }
            Err(err) => {
                worker.transport.shutdown();
                error!(node_id = id, error = %format!("{err:#}"), "raft worker failed");
                board.record_failure(format!("{err:#}"));
            }
        })
        .context("failed to spawn raft worker")?;

    Ok((
        NodeHandle {
            id,
            request_tx,
            status,
            fsm,
            worker: Mutex::new(Some(handle)),
        },
        events_rx,
    ))
}

/// A consistent read waiting on the worker. Dropped once `deadline` passes,
/// since the caller has stopped listening by then.
struct PendingRead {
    deadline: Instant,
    respond_to: Sender<Result<()>>,
}

/// A proposal waiting for its entry to apply.
struct Pending<T> {
    proposal: Proposal,
    respond_to: Sender<Result<T>>,
}

/// The worker that runs the raft event loop.
///
/// Owns the node and processes three kinds of events:
/// 1. **Requests** from callers
/// 2. **Network events** from peers
/// 3. **Ticks** every `tick_interval` to drive raft timeouts
struct Worker {
    node: RaftNode,
    transport: Transport,
    /// Addresses learned from inbound envelopes, for peers not (yet) in the
    /// applied configuration.
    routes: HashMap<NodeId, String>,
    request_rx: Receiver<Request>,
    network_rx: Receiver<NetworkEvent>,
    status: Arc<StatusBoard>,
    events_tx: Sender<LeadershipEvent>,
    tick_interval: Duration,
    pending_commands: BTreeMap<u64, Pending<Option<String>>>,
    pending_changes: BTreeMap<u64, Pending<()>>,
    /// Reads waiting for quorum confirmation, keyed by request context.
    pending_reads: HashMap<u64, PendingRead>,
    /// Confirmed reads waiting for the applied index to reach their index.
    confirmed_reads: Vec<(u64, PendingRead)>,
    next_read_id: u64,
    last_role: Role,
}

impl Worker {
    /// Runs the event loop until shutdown or a storage failure.
    fn run(&mut self) -> AnyResult<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    match req {
                        Ok(Request::Shutdown) | Err(_) => break,
                        Ok(req) => self.handle_request(req),
                    }
                }
                recv(self.network_rx) -> event => {
                    if let Ok(event) = event {
                        self.handle_network(event);
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.track_leadership();
            self.publish();
        }
        Ok(())
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Propose {
                command,
                respond_to,
            } => match self.node.propose(&command) {
                Ok(proposal) => {
                    self.pending_commands.insert(
                        proposal.index,
                        Pending {
                            proposal,
                            respond_to,
                        },
                    );
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::ChangeMembership { change, respond_to } => {
                match self.node.propose_membership(&change) {
                    Ok(proposal) => {
                        debug!(node_id = self.node.id(), ?change, index = proposal.index, "proposed membership change");
                        self.pending_changes.insert(
                            proposal.index,
                            Pending {
                                proposal,
                                respond_to,
                            },
                        );
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            Request::ReadIndex {
                deadline,
                respond_to,
            } => {
                let id = self.next_read_id;
                self.next_read_id += 1;
                match self.node.read_index(id.to_be_bytes().to_vec()) {
                    Ok(()) => {
                        self.pending_reads.insert(
                            id,
                            PendingRead {
                                deadline,
                                respond_to,
                            },
                        );
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            Request::Shutdown => {}
        }
    }

    fn handle_network(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Message { from_addr, message } => {
                let from = message.from;
                if self.node.peer_addr(from).is_none() && !from_addr.is_empty() {
                    self.routes.insert(from, from_addr);
                }
                if let Err(err) = self.node.step(message) {
                    debug!(node_id = self.node.id(), from, error = %err, "ignored raft message");
                }
            }
            NetworkEvent::Unreachable(id) => self.node.report_unreachable(id),
            NetworkEvent::SnapshotSent { to, delivered } => {
                if !delivered {
                    warn!(node_id = self.node.id(), to, "snapshot delivery failed");
                }
                self.node.report_snapshot(to, delivered);
            }
        }
    }

    /// Drains all ready state from raft.
    ///
    /// Messages go out before callers are notified so replication is not held
    /// up behind channel sends.
    fn process_ready(&mut self) -> AnyResult<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            if let Some(index) = bundle.restored {
                debug!(node_id = self.node.id(), index, "state replaced by leader snapshot");
            }
            for state in bundle.read_states {
                let Ok(ctx) = <[u8; 8]>::try_from(state.request_ctx.as_slice()) else {
                    continue;
                };
                if let Some(read) = self.pending_reads.remove(&u64::from_be_bytes(ctx)) {
                    self.confirmed_reads.push((state.index, read));
                }
            }
            for report in bundle.applied {
                self.resolve(report);
            }
        }

        let applied = self.node.applied_index();
        self.fail_skipped(applied);
        self.confirmed_reads.retain(|(index, read)| {
            if *index <= applied {
                let _ = read.respond_to.send(Ok(()));
                false
            } else {
                true
            }
        });
        self.expire_reads(Instant::now());
        Ok(())
    }

    /// Forgets reads whose callers already gave up with a timeout.
    fn expire_reads(&mut self, now: Instant) {
        self.pending_reads.retain(|_, read| read.deadline > now);
        self.confirmed_reads.retain(|(_, read)| read.deadline > now);
    }

    /// Sends a raft message to its destination.
    ///
    /// Messages addressed to this node are fed straight back into raft.
    fn dispatch_message(&mut self, msg: Message) -> AnyResult<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        let to = msg.to;
        let addr = self
            .node
            .peer_addr(to)
            .or_else(|| self.routes.get(&to).cloned());
        match addr {
            Some(addr) => self.transport.send(msg, &addr),
            None => {
                debug!(node_id = self.node.id(), to, "no address for peer, dropping message");
                self.node.report_unreachable(to);
            }
        }
        Ok(())
    }

    /// Answers the caller waiting on the entry at `report.index`, if any.
    fn resolve(&mut self, report: ApplyReport) {
        if let ApplyOutcome::Membership(MembershipChange::RemoveVoter { id }) = &report.outcome {
            self.transport.disconnect(*id);
            self.routes.remove(id);
            if *id == self.node.id() {
                warn!(node_id = self.node.id(), "removed from cluster");
            }
        }

        if let Some(pending) = self.pending_commands.remove(&report.index) {
            let result = match &report.outcome {
                ApplyOutcome::Command { previous, .. } if report.term == pending.proposal.term => {
                    Ok(previous.clone())
                }
                _ => Err(StoreError::NotLeader),
            };
            let _ = pending.respond_to.send(result);
        }
        if let Some(pending) = self.pending_changes.remove(&report.index) {
            let result = if report.term != pending.proposal.term {
                Err(StoreError::NotLeader)
            } else {
                match report.outcome {
                    ApplyOutcome::Membership(_) => Ok(()),
                    ApplyOutcome::Empty => Err(StoreError::ChangeInProgress),
                    ApplyOutcome::Command { .. } => Err(StoreError::NotLeader),
                }
            };
            let _ = pending.respond_to.send(result);
        }
    }

    /// Fails proposals whose index was passed without being reported, which
    /// happens when a leader snapshot replaces the local log.
    fn fail_skipped(&mut self, applied: u64) {
        let keep = self.pending_commands.split_off(&(applied + 1));
        for (_, pending) in std::mem::replace(&mut self.pending_commands, keep) {
            let _ = pending.respond_to.send(Err(StoreError::NotLeader));
        }
        let keep = self.pending_changes.split_off(&(applied + 1));
        for (_, pending) in std::mem::replace(&mut self.pending_changes, keep) {
            let _ = pending.respond_to.send(Err(StoreError::NotLeader));
        }
    }

    /// Emits leadership events and fails unconfirmed reads on step-down.
    fn track_leadership(&mut self) {
        let role = Role::from(self.node.role());
        if role == self.last_role {
            return;
        }
        let term = self.node.term();
        info!(
            node_id = self.node.id(),
            from = ?self.last_role,
            to = ?role,
            term,
            leader = self.node.leader_id(),
            "role changed"
        );
        if role == Role::Leader {
            let _ = self.events_tx.send(LeadershipEvent::BecameLeader { term });
        } else if self.last_role == Role::Leader {
            for (_, read) in self.pending_reads.drain() {
                let _ = read.respond_to.send(Err(StoreError::NotLeader));
            }
            for (_, read) in self.confirmed_reads.drain(..) {
                let _ = read.respond_to.send(Err(StoreError::NotLeader));
            }
            let _ = self.events_tx.send(LeadershipEvent::SteppedDown { term });
        }
        self.last_role = role;
    }

    fn publish(&self) {
        let leader_id = self.node.leader_id();
        self.status.publish(RaftStatus {
            role: Role::from(self.node.role()),
            term: self.node.term(),
            leader_id: (leader_id != 0).then_some(leader_id),
            commit_index: self.node.commit_index(),
            applied_index: self.node.applied_index(),
            first_index: self.node.first_index(),
            last_index: self.node.last_index(),
            last_snapshot_index: self.node.last_snapshot_index(),
            voters: self.node.voters(),
            peers: self.node.peers(),
            failure: None,
            stopped: false,
        });
    }
}
