//! TCP transport for raft messages.
//!
//! - **Listener thread**: accepts peer connections
//! - **Connection threads**: one per inbound connection, reading frames until
//!   the peer hangs up and forwarding decoded messages to the worker
//! - **Link threads**: one per outbound peer, owning a persistent connection
//!   and draining a bounded queue
//!
//! Every frame (see [`crate::frame`]) holds a bincode [`Envelope`] wrapping the
//! prost-encoded raft `Message` plus the sender's advertised address, so a node
//! can answer a peer it has not yet learned about from the configuration.
//!
//! Nothing here ever blocks the raft worker: a full queue or a dead peer drops
//! the message and raft is told the peer is unreachable.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use prost::Message as ProstMessage;
use raft::prelude::{Message, MessageType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::NodeId;
use crate::frame::{read_frame, write_frame};

const OUTBOUND_QUEUE: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize)]
struct Envelope {
    from: NodeId,
    from_addr: String,
    message: Vec<u8>,
}

/// Events delivered from the network threads to the raft worker.
#[derive(Debug)]
pub enum NetworkEvent {
    Message { from_addr: String, message: Message },
    /// A message to this peer could not be delivered.
    Unreachable(NodeId),
    /// Outcome of sending a snapshot, for `report_snapshot`.
    SnapshotSent { to: NodeId, delivered: bool },
}

struct Link {
    addr: String,
    tx: Sender<Message>,
}

/// Outbound links plus the inbound listener of one node.
pub struct Transport {
    id: NodeId,
    advertise_addr: String,
    local_addr: SocketAddr,
    events_tx: Sender<NetworkEvent>,
    links: HashMap<NodeId, Link>,
    shutdown: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl Transport {
    /// Binds `advertise_addr` and starts accepting peer connections.
    ///
    /// Received messages and delivery failures arrive on `events_tx`.
    pub fn start(
        id: NodeId,
        advertise_addr: impl Into<String>,
        events_tx: Sender<NetworkEvent>,
    ) -> Result<Self> {
        let advertise_addr = advertise_addr.into();
        let listener = TcpListener::bind(&advertise_addr)
            .with_context(|| format!("failed to bind raft address {advertise_addr}"))?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let shutdown = Arc::clone(&shutdown);
            let events_tx = events_tx.clone();
            thread::Builder::new()
                .name(format!("raft-listener-{id}"))
                .spawn(move || accept_loop(listener, events_tx, shutdown))
                .context("failed to spawn raft listener")?
        };
        info!(node_id = id, addr = %local_addr, "raft transport listening");

        Ok(Self {
            id,
            advertise_addr,
            local_addr,
            events_tx,
            links: HashMap::new(),
            shutdown,
            listener: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues `msg` for the peer at `addr`.
    pub fn send(&mut self, msg: Message, addr: &str) {
        let to = msg.to;
        let is_snapshot = msg.msg_type() == MessageType::MsgSnapshot;

        let stale = self
            .links
            .get(&to)
            .map_or(true, |link| link.addr != addr);
        if stale {
            match self.open_link(to, addr) {
                Ok(link) => {
                    self.links.insert(to, link);
                }
                Err(err) => {
                    warn!(node_id = self.id, to, error = %err, "failed to open peer link");
                    self.report_failure(to, is_snapshot);
                    return;
                }
            }
        }
        let Some(link) = self.links.get(&to) else {
            return;
        };
        match link.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(node_id = self.id, to, "peer queue full, dropping message");
                self.report_failure(to, is_snapshot);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.links.remove(&to);
                self.report_failure(to, is_snapshot);
            }
        }
    }

    /// Forgets the link to a peer that left the cluster.
    pub fn disconnect(&mut self, id: NodeId) {
        if self.links.remove(&id).is_some() {
            debug!(node_id = self.id, peer = id, "closed peer link");
        }
    }

    /// Stops accepting connections and closes outbound links.
    ///
    /// Returns once the listening socket is closed, so the address can be
    /// bound again by a restarted node.
    pub fn shutdown(&mut self) {
        self.links.clear();
        let Some(handle) = self.listener.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = TcpStream::connect_timeout(&self.local_addr, CONNECT_TIMEOUT);
        if handle.join().is_err() {
            warn!(node_id = self.id, "raft listener panicked");
        }
        info!(node_id = self.id, "raft transport stopped");
    }

    fn open_link(&self, to: NodeId, addr: &str) -> Result<Link> {
        let (tx, rx) = bounded(OUTBOUND_QUEUE);
        let peer = PeerWriter {
            from: self.id,
            from_addr: self.advertise_addr.clone(),
            to,
            addr: addr.to_string(),
            events_tx: self.events_tx.clone(),
            stream: None,
        };
        thread::Builder::new()
            .name(format!("raft-link-{}-{to}", self.id))
            .spawn(move || peer.run(rx))
            .context("failed to spawn peer link")?;
        Ok(Link {
            addr: addr.to_string(),
            tx,
        })
    }

    fn report_failure(&self, to: NodeId, is_snapshot: bool) {
        report_failure(&self.events_tx, to, is_snapshot);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn report_failure(events_tx: &Sender<NetworkEvent>, to: NodeId, is_snapshot: bool) {
    let _ = events_tx.send(NetworkEvent::Unreachable(to));
    if is_snapshot {
        let _ = events_tx.send(NetworkEvent::SnapshotSent {
            to,
            delivered: false,
        });
    }
}

fn accept_loop(listener: TcpListener, events_tx: Sender<NetworkEvent>, shutdown: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let events_tx = events_tx.clone();
                let spawned = thread::Builder::new()
                    .name("raft-conn".into())
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, events_tx) {
                            debug!(error = %err, "raft connection closed");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn connection handler");
                }
            }
            Err(err) => warn!(error = %err, "accept error"),
        }
    }
}

/// Reads frames until the peer hangs up or the worker goes away.
fn serve_connection(stream: TcpStream, events_tx: Sender<NetworkEvent>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    while let Some(body) = read_frame(&mut reader)? {
        let envelope: Envelope =
            bincode::deserialize(&body).context("failed to decode envelope")?;
        let message =
            Message::decode(&envelope.message[..]).context("failed to decode raft message")?;
        if message.from != envelope.from {
            return Err(anyhow!(
                "envelope from {} carries message from {}",
                envelope.from,
                message.from
            ));
        }
        let event = NetworkEvent::Message {
            from_addr: envelope.from_addr,
            message,
        };
        if events_tx.send(event).is_err() {
            break;
        }
    }
    Ok(())
}

/// Owns the outbound connection to one peer.
struct PeerWriter {
    from: NodeId,
    from_addr: String,
    to: NodeId,
    addr: String,
    events_tx: Sender<NetworkEvent>,
    stream: Option<BufWriter<TcpStream>>,
}

impl PeerWriter {
    fn run(mut self, rx: Receiver<Message>) {
        for msg in rx.iter() {
            let is_snapshot = msg.msg_type() == MessageType::MsgSnapshot;
            match self.write(&msg) {
                Ok(()) => {
                    if is_snapshot {
                        let _ = self.events_tx.send(NetworkEvent::SnapshotSent {
                            to: self.to,
                            delivered: true,
                        });
                    }
                }
                Err(err) => {
                    if self.stream.take().is_some() {
                        debug!(to = self.to, addr = %self.addr, error = %err, "peer connection lost");
                    }
                    report_failure(&self.events_tx, self.to, is_snapshot);
                }
            }
        }
    }

    fn write(&mut self, msg: &Message) -> Result<()> {
        if self.stream.is_none() {
            self.stream = Some(self.connect()?);
        }
        let envelope = Envelope {
            from: self.from,
            from_addr: self.from_addr.clone(),
            message: msg.encode_to_vec(),
        };
        let body = bincode::serialize(&envelope)?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(anyhow!("no connection to {}", self.addr));
        };
        write_frame(stream, &body)?;
        stream.flush()?;
        Ok(())
    }

    fn connect(&self) -> Result<BufWriter<TcpStream>> {
        let addr = self
            .addr
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", self.addr))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", self.addr))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(BufWriter::new(stream))
    }
}
