//! Room relay: actor numbering, master election, frame routing

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::ws::protocol::{ClientFrame, PeerId, RelayFrame, Target};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room is full ({0} peers)")]
    Full(usize),

    #[error("Room is closed")]
    Closed,
}

/// Frames to deliver, addressed by recipient
pub type Deliveries = Vec<(PeerId, RelayFrame)>;

/// Peer table of one room, without any I/O.
///
/// Actor numbers start at 1 and are never reused. The master is always the
/// lowest connected actor; every change is announced exactly once.
#[derive(Debug)]
pub struct RoomState {
    name: String,
    capacity: usize,
    next_actor: u32,
    peers: BTreeSet<PeerId>,
    master: Option<PeerId>,
}

impl RoomState {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            next_actor: 1,
            peers: BTreeSet::new(),
            master: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> Option<PeerId> {
        self.master
    }

    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn join(&mut self) -> Result<(PeerId, Deliveries), RoomError> {
        if self.peers.len() >= self.capacity {
            return Err(RoomError::Full(self.capacity));
        }
        let peer = PeerId(self.next_actor);
        self.next_actor += 1;
        self.peers.insert(peer);
        let master = *self.master.get_or_insert(peer);

        let mut out: Deliveries = self
            .peers
            .iter()
            .filter(|p| **p != peer)
            .map(|p| (*p, RelayFrame::PeerJoined { peer }))
            .collect();
        out.push((
            peer,
            RelayFrame::Welcome {
                peer,
                master,
                peers: self.peers.iter().copied().collect(),
            },
        ));
        info!(room = %self.name, peer = %peer, master = %master, peers = self.peers.len(), "Peer joined room");
        Ok((peer, out))
    }

    pub fn leave(&mut self, peer: PeerId) -> Deliveries {
        if !self.peers.remove(&peer) {
            return Vec::new();
        }
        info!(room = %self.name, peer = %peer, peers = self.peers.len(), "Peer left room");

        let mut out: Deliveries = self
            .peers
            .iter()
            .map(|p| (*p, RelayFrame::PeerLeft { peer }))
            .collect();

        if self.master == Some(peer) {
            self.master = self.peers.iter().next().copied();
            if let Some(master) = self.master {
                info!(room = %self.name, master = %master, "Master reassigned");
                out.extend(
                    self.peers
                        .iter()
                        .map(|p| (*p, RelayFrame::MasterChanged { master })),
                );
            }
        }
        out
    }

    /// Stamp the sender and fan a frame out to its recipients
    pub fn route(&self, sender: PeerId, frame: ClientFrame) -> Deliveries {
        if !self.peers.contains(&sender) {
            return Vec::new();
        }
        let recipients: Vec<PeerId> = match frame.target {
            Target::All => self.peers.iter().copied().collect(),
            Target::Others => self.peers.iter().copied().filter(|p| *p != sender).collect(),
            Target::Peer(to) if self.peers.contains(&to) => vec![to],
            Target::Peer(to) => {
                debug!(room = %self.name, sender = %sender, to = %to, "Frame for unknown peer");
                return vec![(
                    sender,
                    RelayFrame::Error {
                        code: "unknown_peer".to_string(),
                        message: format!("Peer {} is not in this room", to),
                    },
                )];
            }
        };

        recipients
            .into_iter()
            .map(|to| {
                (
                    to,
                    RelayFrame::Message {
                        sender,
                        msg: frame.msg.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Commands accepted by a running room task
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        reply: oneshot::Sender<Result<PeerLink, RoomError>>,
    },
    Frame {
        peer: PeerId,
        frame: ClientFrame,
    },
    Leave {
        peer: PeerId,
    },
}

/// A connected peer's end of the room
#[derive(Debug)]
pub struct PeerLink {
    pub peer: PeerId,
    pub frames: mpsc::UnboundedReceiver<RelayFrame>,
}

/// Handle to a running room
#[derive(Clone, Debug)]
pub struct RoomHandle {
    pub name: String,
    command_tx: mpsc::Sender<RoomCommand>,
    peer_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    pub async fn join(&self) -> Result<PeerLink, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(RoomCommand::Join { reply })
            .await
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)?
    }

    pub async fn send(&self, peer: PeerId, frame: ClientFrame) -> Result<(), RoomError> {
        self.command_tx
            .send(RoomCommand::Frame { peer, frame })
            .await
            .map_err(|_| RoomError::Closed)
    }

    pub async fn leave(&self, peer: PeerId) {
        let _ = self.command_tx.send(RoomCommand::Leave { peer }).await;
    }
}

/// Room task: owns the peer table and one outbound channel per peer
pub struct Room {
    state: RoomState,
    command_rx: mpsc::Receiver<RoomCommand>,
    outbound: HashMap<PeerId, mpsc::UnboundedSender<RelayFrame>>,
    peer_count: Arc<AtomicUsize>,
}

impl Room {
    pub fn new(name: &str, capacity: usize) -> (Self, RoomHandle) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let peer_count = Arc::new(AtomicUsize::new(0));

        let handle = RoomHandle {
            name: name.to_string(),
            command_tx,
            peer_count: peer_count.clone(),
        };
        let room = Self {
            state: RoomState::new(name, capacity),
            command_rx,
            outbound: HashMap::new(),
            peer_count,
        };
        (room, handle)
    }

    /// Run until the last peer leaves or every handle is dropped
    pub async fn run(mut self) {
        info!(room = %self.state.name(), "Room opened");
        let mut had_peers = false;

        while let Some(command) = self.command_rx.recv().await {
            match command {
                RoomCommand::Join { reply } => {
                    let link = self.join();
                    had_peers |= link.is_ok();
                    if let Err(Ok(link)) = reply.send(link) {
                        // Joiner went away before the reply arrived
                        self.leave(link.peer);
                    }
                }
                RoomCommand::Frame { peer, frame } => {
                    let deliveries = self.state.route(peer, frame);
                    self.deliver(deliveries);
                }
                RoomCommand::Leave { peer } => self.leave(peer),
            }
            self.peer_count.store(self.state.len(), Ordering::Relaxed);

            if had_peers && self.state.is_empty() {
                break;
            }
        }
        info!(room = %self.state.name(), "Room closed");
    }

    fn join(&mut self) -> Result<PeerLink, RoomError> {
        let (peer, deliveries) = self.state.join()?;
        let (tx, frames) = mpsc::unbounded_channel();
        self.outbound.insert(peer, tx);
        self.deliver(deliveries);
        Ok(PeerLink { peer, frames })
    }

    fn leave(&mut self, peer: PeerId) {
        self.outbound.remove(&peer);
        let deliveries = self.state.leave(peer);
        self.deliver(deliveries);
    }

    fn deliver(&mut self, deliveries: Deliveries) {
        let mut gone = Vec::new();
        for (to, frame) in deliveries {
            if let Some(tx) = self.outbound.get(&to) {
                if tx.send(frame).is_err() {
                    gone.push(to);
                }
            }
        }
        for peer in gone {
            warn!(room = %self.state.name(), peer = %peer, "Outbound channel closed, dropping peer");
            self.leave(peer);
        }
    }
}
