//! ZeroMQ links: the coordinator binds a ROUTER, executors connect DEALERs.
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! ROUTER pushes the peer identity as first frame on recv and pops it on
//! send. DEALER sends/receives raw application frames. So:
//! - DEALER sends: `[kind, body]`
//! - ROUTER receives: `[identity, kind, body]`
//! - ROUTER sends: `[identity, kind, body]`
//! - DEALER receives: `[kind, body]`
//!
//! `kind` is one of `hello`, `welcome`, `beat`, `bye` or `msg`. Only `msg`
//! frames carry a [`Message`] envelope; the others drive membership. A peer
//! that stays silent longer than the peer timeout is reported as
//! [`LinkEvent::Disconnected`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::config::LinkConfig;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::link::{Link, LinkEvent, PeerId};
use crate::message::Message;

const HELLO: &[u8] = b"hello";
const WELCOME: &[u8] = b"welcome";
const BEAT: &[u8] = b"beat";
const BYE: &[u8] = b"bye";
const MSG: &[u8] = b"msg";

/// Split a received frame set into `(kind, body)`, skipping empty delimiters.
fn split_frames<'a>(frames: &'a [&'a [u8]]) -> Option<(&'a [u8], &'a [u8])> {
    let mut data = frames.iter().skip_while(|f| f.is_empty());
    let kind = data.next()?;
    let body = data.next().copied().unwrap_or(&[]);
    Some((kind, body))
}

/// Internal command sent from the public API to the ROUTER event loop.
enum RouterCommand {
    SendTo {
        peer: PeerId,
        body: Vec<u8>,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    Broadcast {
        body: Vec<u8>,
    },
}

/// One executor as seen by the coordinator's ROUTER.
struct RouterPeer {
    identity: Vec<u8>,
    last_seen: Instant,
}

/// State owned by the ROUTER event loop.
struct RouterState {
    peers: HashMap<PeerId, RouterPeer>,
    by_identity: HashMap<Vec<u8>, PeerId>,
    next_id: u32,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl RouterState {
    /// Look up (or admit) the peer behind a ROUTER identity.
    fn admit(&mut self, identity: &[u8]) -> (PeerId, bool) {
        if let Some(id) = self.by_identity.get(identity) {
            if let Some(peer) = self.peers.get_mut(id) {
                peer.last_seen = Instant::now();
            }
            return (*id, false);
        }
        let id = PeerId(self.next_id);
        self.next_id += 1;
        self.by_identity.insert(identity.to_vec(), id);
        self.peers.insert(
            id,
            RouterPeer {
                identity: identity.to_vec(),
                last_seen: Instant::now(),
            },
        );
        info!(peer = %id, "executor joined");
        let _ = self.events.send(LinkEvent::Connected(id));
        (id, true)
    }

    fn drop_peer(&mut self, id: PeerId, reason: &str) {
        if let Some(peer) = self.peers.remove(&id) {
            self.by_identity.remove(&peer.identity);
            info!(peer = %id, reason, "executor left");
            let _ = self.events.send(LinkEvent::Disconnected(id));
        }
    }
}

/// Coordinator side of a ZeroMQ link: a bound ROUTER socket.
///
/// The socket is owned entirely by a background task that multiplexes
/// outbound commands, inbound frames and the heartbeat timer, so the public
/// API never contends on the socket.
pub struct ZmqCoordinatorLink {
    cmd_tx: mpsc::Sender<RouterCommand>,
    events_rx: Mutex<mpsc::UnboundedReceiver<LinkEvent>>,
    _loop_handle: tokio::task::JoinHandle<()>,
}

impl ZmqCoordinatorLink {
    /// Bind a ROUTER socket on the configured endpoint.
    #[instrument(skip_all, fields(endpoint = %config.endpoint))]
    pub async fn bind(config: &LinkConfig) -> Result<Self, TransportError> {
        let endpoint = config.endpoint()?;
        endpoint.ensure_ipc_dir()?;
        endpoint.remove_stale_socket()?;

        let mut socket = RouterSocket::new();
        info!(endpoint = %endpoint, "binding ROUTER socket");
        socket.bind(&endpoint.address()).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<RouterCommand>(1024);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = RouterState {
            peers: HashMap::new(),
            by_identity: HashMap::new(),
            next_id: 1,
            events: events_tx,
        };
        let config = config.clone();
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, cmd_rx, state, config).await;
        });

        Ok(Self {
            cmd_tx,
            events_rx: Mutex::new(events_rx),
            _loop_handle: loop_handle,
        })
    }

    async fn event_loop(
        mut socket: RouterSocket,
        mut cmd_rx: mpsc::Receiver<RouterCommand>,
        mut state: RouterState,
        config: LinkConfig,
    ) {
        let mut ticker = tokio::time::interval(config.heartbeat_interval());
        let peer_timeout = config.peer_timeout();

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        RouterCommand::SendTo { peer, body, done } => {
                            let result = match state.peers.get(&peer) {
                                Some(p) => Self::send_frame(&mut socket, &p.identity, MSG, body).await,
                                None => Err(TransportError::PeerUnavailable(peer)),
                            };
                            let _ = done.send(result);
                        }
                        RouterCommand::Broadcast { body } => {
                            let identities: Vec<Vec<u8>> =
                                state.peers.values().map(|p| p.identity.clone()).collect();
                            for identity in identities {
                                if let Err(e) = Self::send_frame(&mut socket, &identity, MSG, body.clone()).await {
                                    warn!(error = %e, "ROUTER broadcast send failed");
                                }
                            }
                        }
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => Self::dispatch_inbound(&mut socket, &mut state, zmq_msg).await,
                        Err(e) => {
                            debug!(error = %e, "ROUTER recv loop ending");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let expired: Vec<PeerId> = state
                        .peers
                        .iter()
                        .filter(|(_, p)| p.last_seen.elapsed() > peer_timeout)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in expired {
                        warn!(peer = %id, timeout = ?peer_timeout, "executor heartbeat timed out");
                        state.drop_peer(id, "heartbeat timeout");
                    }
                    let identities: Vec<Vec<u8>> =
                        state.peers.values().map(|p| p.identity.clone()).collect();
                    for identity in identities {
                        let _ = Self::send_frame(&mut socket, &identity, BEAT, Vec::new()).await;
                    }
                }
                else => break,
            }
        }
    }

    async fn dispatch_inbound(socket: &mut RouterSocket, state: &mut RouterState, zmq_msg: ZmqMessage) {
        let frames: Vec<&[u8]> = zmq_msg.iter().map(|f| f.as_ref()).collect();
        if frames.len() < 2 {
            warn!(frame_count = frames.len(), "unexpected frame count on ROUTER recv");
            return;
        }
        let identity = frames[0];
        let Some((kind, body)) = split_frames(&frames[1..]) else {
            warn!("ROUTER frame without a kind");
            return;
        };

        match kind {
            HELLO => {
                let (id, _) = state.admit(identity);
                let welcome = id.0.to_be_bytes().to_vec();
                if let Err(e) = Self::send_frame(socket, identity, WELCOME, welcome).await {
                    warn!(peer = %id, error = %e, "failed to welcome executor");
                }
            }
            BEAT => {
                state.admit(identity);
            }
            BYE => {
                if let Some(id) = state.by_identity.get(identity).copied() {
                    state.drop_peer(id, "goodbye");
                }
            }
            MSG => {
                let (from, _) = state.admit(identity);
                match Message::from_bytes(body) {
                    Ok(message) => {
                        let _ = state.events.send(LinkEvent::Message { from, message });
                    }
                    Err(e) => warn!(peer = %from, error = %e, "failed to decode envelope"),
                }
            }
            other => {
                debug!(kind = ?String::from_utf8_lossy(other), "unknown frame kind on ROUTER");
            }
        }
    }

    async fn send_frame(
        socket: &mut RouterSocket,
        identity: &[u8],
        kind: &[u8],
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut zmq_msg = ZmqMessage::from(identity.to_vec());
        zmq_msg.push_back(kind.to_vec().into());
        zmq_msg.push_back(body.into());
        socket.send(zmq_msg).await?;
        Ok(())
    }
}

#[async_trait]
impl Link for ZmqCoordinatorLink {
    fn local_id(&self) -> PeerId {
        PeerId::COORDINATOR
    }

    async fn send_to(&self, peer: PeerId, message: Message) -> Result<(), TransportError> {
        let body = message.to_bytes()?;
        let (done, result) = oneshot::channel();
        self.cmd_tx
            .send(RouterCommand::SendTo { peer, body, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        result.await.map_err(|_| TransportError::Closed)?
    }

    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        let body = message.to_bytes()?;
        self.cmd_tx
            .send(RouterCommand::Broadcast { body })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<LinkEvent, TransportError> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// Internal command sent from the public API to the DEALER event loop.
enum DealerCommand {
    Send(Vec<u8>),
    Bye,
}

/// Executor side of a ZeroMQ link: a DEALER connected to the coordinator.
pub struct ZmqExecutorLink {
    id: Arc<AtomicU32>,
    cmd_tx: mpsc::Sender<DealerCommand>,
    events_rx: Mutex<mpsc::UnboundedReceiver<LinkEvent>>,
    _loop_handle: tokio::task::JoinHandle<()>,
}

impl ZmqExecutorLink {
    /// Connect a DEALER socket and wait for the coordinator's welcome.
    ///
    /// Fails with [`TransportError::Timeout`] if no welcome arrives within the
    /// peer timeout.
    #[instrument(skip_all, fields(endpoint = %config.endpoint))]
    pub async fn connect(config: &LinkConfig) -> Result<Self, TransportError> {
        let endpoint: Endpoint = config.endpoint()?;
        let mut socket = DealerSocket::new();
        info!(endpoint = %endpoint, "connecting DEALER socket");
        socket.connect(&endpoint.address()).await?;
        socket.send(ZmqMessage::from(HELLO.to_vec())).await?;

        let peer_timeout = config.peer_timeout();
        let assigned = tokio::time::timeout(peer_timeout, Self::await_welcome(&mut socket))
            .await
            .map_err(|_| TransportError::Timeout(peer_timeout))??;
        info!(peer = %assigned, "joined coordinator");

        let id = Arc::new(AtomicU32::new(assigned.0));
        let (cmd_tx, cmd_rx) = mpsc::channel::<DealerCommand>(1024);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = config.clone();
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, cmd_rx, events_tx, config).await;
        });

        Ok(Self {
            id,
            cmd_tx,
            events_rx: Mutex::new(events_rx),
            _loop_handle: loop_handle,
        })
    }

    async fn await_welcome(socket: &mut DealerSocket) -> Result<PeerId, TransportError> {
        loop {
            let zmq_msg = socket.recv().await?;
            let frames: Vec<&[u8]> = zmq_msg.iter().map(|f| f.as_ref()).collect();
            match split_frames(&frames) {
                Some((WELCOME, body)) => {
                    let bytes: [u8; 4] = body.try_into().map_err(|_| {
                        TransportError::Transport(format!(
                            "welcome frame carries {} bytes, expected 4",
                            body.len()
                        ))
                    })?;
                    return Ok(PeerId(u32::from_be_bytes(bytes)));
                }
                Some((kind, _)) => {
                    debug!(kind = ?String::from_utf8_lossy(kind), "ignoring frame before welcome");
                }
                None => {}
            }
        }
    }

    async fn event_loop(
        mut socket: DealerSocket,
        mut cmd_rx: mpsc::Receiver<DealerCommand>,
        events: mpsc::UnboundedSender<LinkEvent>,
        config: LinkConfig,
    ) {
        let mut ticker = tokio::time::interval(config.heartbeat_interval());
        let peer_timeout = config.peer_timeout();
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        DealerCommand::Send(body) => {
                            let mut zmq_msg = ZmqMessage::from(MSG.to_vec());
                            zmq_msg.push_back(body.into());
                            if let Err(e) = socket.send(zmq_msg).await {
                                warn!(error = %e, "DEALER send failed");
                            }
                        }
                        DealerCommand::Bye => {
                            let _ = socket.send(ZmqMessage::from(BYE.to_vec())).await;
                            debug!("DEALER said goodbye");
                            break;
                        }
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => {
                            last_seen = Instant::now();
                            let frames: Vec<&[u8]> = zmq_msg.iter().map(|f| f.as_ref()).collect();
                            match split_frames(&frames) {
                                Some((MSG, body)) => match Message::from_bytes(body) {
                                    Ok(message) => {
                                        let _ = events.send(LinkEvent::Message {
                                            from: PeerId::COORDINATOR,
                                            message,
                                        });
                                    }
                                    Err(e) => warn!(error = %e, "failed to decode envelope"),
                                },
                                Some((BEAT, _)) | Some((WELCOME, _)) => {}
                                Some((kind, _)) => {
                                    debug!(kind = ?String::from_utf8_lossy(kind), "unknown frame kind on DEALER");
                                }
                                None => {}
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if last_seen.elapsed() > peer_timeout {
                        warn!(timeout = ?peer_timeout, "coordinator heartbeat timed out");
                        let _ = events.send(LinkEvent::Disconnected(PeerId::COORDINATOR));
                        break;
                    }
                    let _ = socket.send(ZmqMessage::from(BEAT.to_vec())).await;
                }
                else => break,
            }
        }
    }

    /// Tell the coordinator we are leaving and stop the event loop.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(DealerCommand::Bye).await;
    }
}

#[async_trait]
impl Link for ZmqExecutorLink {
    fn local_id(&self) -> PeerId {
        PeerId(self.id.load(Ordering::Relaxed))
    }

    async fn send_to(&self, peer: PeerId, message: Message) -> Result<(), TransportError> {
        if !peer.is_coordinator() {
            return Err(TransportError::PeerUnavailable(peer));
        }
        let body = message.to_bytes()?;
        self.cmd_tx
            .send(DealerCommand::Send(body))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Executors only ever see the coordinator, so a broadcast is a unicast.
    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        self.send_to(PeerId::COORDINATOR, message).await
    }

    async fn recv(&self) -> Result<LinkEvent, TransportError> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }
}
