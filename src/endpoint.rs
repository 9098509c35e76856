//! Endpoint — the transport context tying sessions to one UDP socket.
//!
//! A single demux task owns the receive side of the socket and routes
//! datagrams by conversation id. Unknown ids carrying a Syn become new
//! inbound sessions; everything else for an unknown id is dropped. A writer
//! task serializes outbound frames from all sessions onto the socket.
//! Closed conversation ids sit in a quarantine window during which their
//! late frames are discarded and the id is not reused.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::frame::{Frame, Kind, MTU};
use crate::session::{FrameTx, Session, SessionConfig};

/// How long a closed conversation id stays unusable.
const CONV_QUARANTINE: Duration = Duration::from_secs(30);

/// Syn retransmit schedule for `open`.
const OPEN_ATTEMPTS: u32 = 4;
const OPEN_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Transport-level tuning shared by every session on the endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-session idle teardown threshold.
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Endpoint errors surfaced to callers of `open`.
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    /// No SynAck arrived within the retransmit schedule.
    OpenTimeout,
    /// The endpoint was shut down.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::OpenTimeout => write!(f, "open timed out waiting for SynAck"),
            TransportError::Closed => write!(f, "endpoint closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

struct ConvTable {
    active: HashMap<u32, mpsc::UnboundedSender<Frame>>,
    quarantine: HashMap<u32, Instant>,
    pending_open: HashMap<u32, oneshot::Sender<()>>,
}

impl ConvTable {
    fn purge_quarantine(&mut self, now: Instant) {
        self.quarantine
            .retain(|_, since| now.duration_since(*since) < CONV_QUARANTINE);
    }

    fn is_taken(&self, conv: u32) -> bool {
        self.active.contains_key(&conv)
            || self.quarantine.contains_key(&conv)
            || self.pending_open.contains_key(&conv)
    }
}

struct Inner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    table: Mutex<ConvTable>,
    out_tx: FrameTx,
    close_tx: mpsc::UnboundedSender<u32>,
    session_config: SessionConfig,
    shutdown: Notify,
}

/// Receiver half for inbound sessions produced by the endpoint.
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<Session>,
}

impl Incoming {
    /// Next inbound session, or `None` once the endpoint shuts down.
    pub async fn accept(&mut self) -> Option<Session> {
        self.rx.recv().await
    }
}

/// Shared transport context. Cheap to clone; all clones drive one socket.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Bind the UDP socket and spawn the demux and writer tasks. Returns the
    /// endpoint plus the queue of inbound sessions.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> io::Result<(Endpoint, Incoming)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            socket: socket.clone(),
            local_addr,
            table: Mutex::new(ConvTable {
                active: HashMap::new(),
                quarantine: HashMap::new(),
                pending_open: HashMap::new(),
            }),
            out_tx,
            close_tx,
            session_config: SessionConfig {
                idle_timeout: config.idle_timeout,
            },
            shutdown: Notify::new(),
        });

        tokio::spawn(writer_loop(socket, out_rx));
        tokio::spawn(demux_loop(inner.clone(), close_rx, accept_tx));

        info!("endpoint bound on {}", local_addr);
        Ok((Endpoint { inner }, Incoming { rx: accept_rx }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Dial a remote endpoint: pick an unused conversation id, send Syn with
    /// retransmits, and wait for the SynAck.
    pub async fn open(&self, remote: SocketAddr) -> Result<Session, TransportError> {
        let (conv, ack_rx) = {
            let mut table = self.inner.table.lock().unwrap();
            table.purge_quarantine(Instant::now());
            let mut rng = rand::thread_rng();
            let conv = loop {
                let candidate: u32 = rng.gen();
                if candidate != 0 && !table.is_taken(candidate) {
                    break candidate;
                }
            };
            let (tx, rx) = oneshot::channel();
            table.pending_open.insert(conv, tx);
            (conv, rx)
        };

        if let Err(e) = self.await_syn_ack(conv, remote, ack_rx).await {
            self.inner.table.lock().unwrap().pending_open.remove(&conv);
            return Err(e);
        }

        let (session, frame_tx) = Session::spawn(
            conv,
            remote,
            self.inner.out_tx.clone(),
            self.inner.session_config.clone(),
            self.inner.close_tx.clone(),
        );
        self.inner.table.lock().unwrap().active.insert(conv, frame_tx);
        debug!("opened session {} to {}", conv, remote);
        Ok(session)
    }

    async fn await_syn_ack(
        &self,
        conv: u32,
        remote: SocketAddr,
        mut ack_rx: oneshot::Receiver<()>,
    ) -> Result<(), TransportError> {
        for attempt in 0..OPEN_ATTEMPTS {
            let syn = Frame::control(conv, Kind::Syn, 0, 0, 0);
            if self.inner.out_tx.send((remote, syn)).is_err() {
                return Err(TransportError::Closed);
            }
            let wait = OPEN_BACKOFF_BASE * 2u32.pow(attempt);
            match tokio::time::timeout(wait, &mut ack_rx).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => trace!("open {}: Syn attempt {} timed out", conv, attempt + 1),
            }
        }
        Err(TransportError::OpenTimeout)
    }

    /// Stop accepting and routing. Existing sessions observe their frame
    /// channels closing and wind down.
    pub fn close(&self) {
        self.inner.shutdown.notify_waiters();
        let mut table = self.inner.table.lock().unwrap();
        table.active.clear();
        table.pending_open.clear();
    }
}

async fn writer_loop(
    socket: Arc<UdpSocket>,
    mut out_rx: mpsc::UnboundedReceiver<(SocketAddr, Frame)>,
) {
    let mut buf = [0u8; MTU];
    while let Some((peer, frame)) = out_rx.recv().await {
        match frame.encode_to(&mut buf) {
            Ok(n) => {
                if let Err(e) = socket.send_to(&buf[..n], peer).await {
                    trace!("send_to {} failed: {}", peer, e);
                }
            }
            Err(e) => warn!("dropping unencodable frame for {}: {}", peer, e),
        }
    }
}

async fn demux_loop(
    inner: Arc<Inner>,
    mut close_rx: mpsc::UnboundedReceiver<u32>,
    accept_tx: mpsc::UnboundedSender<Session>,
) {
    let mut buf = vec![0u8; MTU + 64];
    loop {
        tokio::select! {
            r = inner.socket.recv_from(&mut buf) => {
                let (n, peer) = match r {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("recv_from failed: {}", e);
                        continue;
                    }
                };
                handle_datagram(&inner, &accept_tx, &buf[..n], peer);
            }

            maybe = close_rx.recv() => {
                match maybe {
                    Some(conv) => {
                        let mut table = inner.table.lock().unwrap();
                        table.active.remove(&conv);
                        table.quarantine.insert(conv, Instant::now());
                        table.purge_quarantine(Instant::now());
                        debug!("session {} closed, id quarantined", conv);
                    }
                    None => break,
                }
            }

            _ = inner.shutdown.notified() => break,
        }
    }
}

fn handle_datagram(
    inner: &Arc<Inner>,
    accept_tx: &mpsc::UnboundedSender<Session>,
    data: &[u8],
    peer: SocketAddr,
) {
    let Some(conv) = Frame::peek_conv(data) else {
        trace!("runt datagram from {}", peer);
        return;
    };
    if conv == 0 {
        return;
    }

    // Quarantine check happens before the checksum is paid for.
    {
        let mut table = inner.table.lock().unwrap();
        table.purge_quarantine(Instant::now());
        if table.quarantine.contains_key(&conv) {
            trace!("dropping frame for quarantined conv {}", conv);
            return;
        }
    }

    let frame = match Frame::decode(data) {
        Ok(f) => f,
        Err(e) => {
            trace!("bad datagram from {}: {}", peer, e);
            return;
        }
    };

    let mut table = inner.table.lock().unwrap();

    if let Some(tx) = table.active.get(&conv) {
        // A duplicated Syn for a live conversation gets its SynAck again so
        // the dialer converges even when the first reply was lost.
        if frame.kind == Kind::Syn {
            let _ = inner.out_tx.send((peer, Frame::control(conv, Kind::SynAck, 0, 0, 0)));
            return;
        }
        if tx.send(frame).is_err() {
            table.active.remove(&conv);
            table.quarantine.insert(conv, Instant::now());
        }
        return;
    }

    if let Some(waiter) = table.pending_open.remove(&conv) {
        if frame.kind == Kind::SynAck {
            let _ = waiter.send(());
        } else {
            table.pending_open.insert(conv, waiter);
        }
        return;
    }

    if frame.kind == Kind::Syn {
        let (session, frame_tx) = Session::spawn(
            conv,
            peer,
            inner.out_tx.clone(),
            inner.session_config.clone(),
            inner.close_tx.clone(),
        );
        table.active.insert(conv, frame_tx);
        drop(table);
        let _ = inner.out_tx.send((peer, Frame::control(conv, Kind::SynAck, 0, 0, 0)));
        debug!("accepted session {} from {}", conv, peer);
        if accept_tx.send(session).is_err() {
            // Listener gone; the session will idle out.
            trace!("no listener for inbound session {}", conv);
        }
        return;
    }

    trace!("dropping {:?} for unknown conv {} from {}", frame.kind, conv, peer);
}
