//! Session — an ordered, reliable byte stream over the ARQ engine.
//!
//! One tokio task per session exclusively owns its [`ArqCore`] (the run
//! loop). `poll_write` appends to a shared coalescing buffer and notifies
//! the run loop; `poll_read` receives ordered bytes from a channel the run
//! loop fills from `ArqCore::recv`. Inbound frames arrive on a channel fed
//! by the endpoint's demux loop, and timers are driven off `ArqCore::check`.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::arq::ArqCore;
use crate::frame::Frame;

/// Outbound path shared by every session on one endpoint: a frame plus its
/// datagram destination, consumed by the endpoint's socket writer task.
pub(crate) type FrameTx = mpsc::UnboundedSender<(SocketAddr, Frame)>;

/// Write backlog threshold before `poll_write` exerts backpressure.
const MAX_WRITE_BUF: usize = 256 * 1024;

/// Longest the run loop sleeps between timer ticks, in milliseconds.
const MAX_TICK: u64 = 50;

/// Per-session tuning, owned by the endpoint configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tear the session down after this long without any inbound frame.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            idle_timeout: Duration::from_secs(120),
        }
    }
}

struct WriteBuffer {
    data: BytesMut,
    waker: Option<Waker>,
    /// Local write direction requested closed.
    shutdown: bool,
}

struct Shared {
    write_buf: Mutex<WriteBuffer>,
    write_notify: Notify,
    /// Set once the run loop exits; writes fail, reads drain then EOF.
    closed: AtomicBool,
}

impl Shared {
    fn wake_writer(&self) {
        let waker = self.write_buf.lock().unwrap().waker.take();
        if let Some(w) = waker {
            w.wake();
        }
    }
}

/// One logical reliable stream multiplexed over the endpoint's UDP socket.
///
/// Implements `tokio::io::AsyncRead` and `AsyncWrite`; to the caller it
/// behaves like a connected stream socket.
pub struct Session {
    conv: u32,
    peer: SocketAddr,
    shared: Arc<Shared>,
    read_rx: mpsc::UnboundedReceiver<Bytes>,
    recv_buf: BytesMut,
}

impl Session {
    /// Spawn the run loop for an established conversation and return the
    /// stream handle plus the channel the endpoint feeds inbound frames into.
    pub(crate) fn spawn(
        conv: u32,
        peer: SocketAddr,
        out_tx: FrameTx,
        config: SessionConfig,
        on_close: mpsc::UnboundedSender<u32>,
    ) -> (Session, mpsc::UnboundedSender<Frame>) {
        let shared = Arc::new(Shared {
            write_buf: Mutex::new(WriteBuffer {
                data: BytesMut::with_capacity(8192),
                waker: None,
                shutdown: false,
            }),
            write_notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();

        let arq = ArqCore::new(conv);
        tokio::spawn(run_loop(
            arq,
            peer,
            out_tx,
            shared.clone(),
            frame_rx,
            read_tx,
            config,
            on_close,
        ));

        let session = Session {
            conv,
            peer,
            shared,
            read_rx,
            recv_buf: BytesMut::new(),
        };
        (session, frame_tx)
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }
}

impl AsyncRead for Session {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        if !me.recv_buf.is_empty() {
            let n = buf.remaining().min(me.recv_buf.len());
            buf.put_slice(&me.recv_buf[..n]);
            me.recv_buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        match me.read_rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = buf.remaining().min(data.len());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    me.recv_buf.extend_from_slice(&data[n..]);
                }
                Poll::Ready(Ok(()))
            }
            // Channel closed: clean EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Session {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        let mut wb = self.shared.write_buf.lock().unwrap();
        if wb.shutdown {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session shut down for writing",
            )));
        }
        if wb.data.len() >= MAX_WRITE_BUF {
            wb.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let was_empty = wb.data.is_empty();
        wb.data.extend_from_slice(buf);
        drop(wb);
        if was_empty {
            self.shared.write_notify.notify_one();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.write_notify.notify_one();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.write_buf.lock().unwrap().shutdown = true;
        self.shared.write_notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The run loop winds the ARQ state down with a Fin once it sees the
        // shutdown flag; dropping the handle must not leak the task.
        self.shared.write_buf.lock().unwrap().shutdown = true;
        self.shared.write_notify.notify_one();
    }
}

/// Run loop: exclusively owns the ArqCore. Drains the coalesced write
/// buffer, feeds inbound frames, forwards ordered bytes to the read channel,
/// and drives timers.
#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut arq: ArqCore,
    peer: SocketAddr,
    out_tx: FrameTx,
    shared: Arc<Shared>,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
    read_tx: mpsc::UnboundedSender<Bytes>,
    config: SessionConfig,
    on_close: mpsc::UnboundedSender<u32>,
) {
    let conv = arq.conv();
    let start = Instant::now();
    let idle_ms = config.idle_timeout.as_millis() as u32;

    let mut read_tx = Some(read_tx);
    let mut fin_sent = false;

    loop {
        let now = start.elapsed().as_millis() as u32;

        drain_write_buf(&shared, &mut arq);

        // Honor a requested local close once the write buffer has drained.
        if !fin_sent {
            let wb = shared.write_buf.lock().unwrap();
            if wb.shutdown && wb.data.is_empty() {
                drop(wb);
                arq.close();
                fin_sent = true;
            }
        }

        arq.update(now, &mut |frame| {
            let _ = out_tx.send((peer, frame));
        });

        forward_recv(&mut arq, &mut read_tx);

        if arq.is_dead() {
            debug!("session {}: link dead, closing", conv);
            break;
        }
        if arq.idle_for(now) >= idle_ms {
            debug!("session {}: idle timeout, closing", conv);
            break;
        }
        let reader_gone = read_tx.as_ref().map_or(true, |tx| tx.is_closed());
        if fin_sent && arq.close_complete() && (arq.is_eof() || reader_gone) {
            trace!("session {}: orderly close complete", conv);
            break;
        }

        let deadline = arq.check(now);
        let delay = if !time_after(deadline, now) {
            1
        } else {
            (deadline.wrapping_sub(now) as u64).min(MAX_TICK)
        };

        tokio::select! {
            biased;

            _ = shared.write_notify.notified() => {}

            maybe = frame_rx.recv() => {
                match maybe {
                    Some(frame) => {
                        let now = start.elapsed().as_millis() as u32;
                        let _ = arq.input(&frame, now);
                        while let Ok(more) = frame_rx.try_recv() {
                            let _ = arq.input(&more, now);
                        }
                    }
                    // Endpoint dropped us (shutdown or quarantine).
                    None => break,
                }
            }

            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }
    }

    shared.closed.store(true, Ordering::Relaxed);
    shared.wake_writer();
    shared.write_notify.notify_waiters();
    drop(read_tx); // reader sees EOF
    let _ = on_close.send(conv);
}

#[inline]
fn time_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Move coalesced write-buffer bytes into the ARQ send queue. Stops at the
/// queue's capacity so backpressure propagates back to `poll_write`.
fn drain_write_buf(shared: &Shared, arq: &mut ArqCore) {
    let mut wb = shared.write_buf.lock().unwrap();
    while !wb.data.is_empty() && arq.can_send() {
        let take = wb.data.len().min(8192);
        let chunk = wb.data.split_to(take);
        if arq.send(&chunk).is_err() {
            // Queue filled mid-drain; the chunk was refused whole, put it
            // back in front.
            let mut rebuilt = BytesMut::with_capacity(chunk.len() + wb.data.len());
            rebuilt.extend_from_slice(&chunk);
            rebuilt.extend_from_slice(&wb.data);
            wb.data = rebuilt;
            break;
        }
    }
    let waker = if wb.data.len() < MAX_WRITE_BUF {
        wb.waker.take()
    } else {
        None
    };
    drop(wb);
    if let Some(w) = waker {
        w.wake();
    }
}

/// Forward all in-order bytes from the engine to the read channel; drop the
/// sender on EOF so the reader observes end-of-stream.
fn forward_recv(arq: &mut ArqCore, read_tx: &mut Option<mpsc::UnboundedSender<Bytes>>) {
    let Some(tx) = read_tx.as_ref() else { return };
    while arq.pending_recv() > 0 {
        let mut buf = BytesMut::zeroed(arq.pending_recv());
        let n = arq.recv(&mut buf);
        if n == 0 {
            break;
        }
        buf.truncate(n);
        if tx.send(buf.freeze()).is_err() {
            break;
        }
    }
    if arq.is_eof() && arq.pending_recv() == 0 {
        *read_tx = None;
    }
}

#[cfg(test)]
pub(crate) fn test_pair() -> (Session, Session) {
    lossy_test_pair(0, false)
}

/// Two sessions joined by an in-process datagram bridge that drops a
/// percentage of frames and occasionally holds one back to reorder it.
#[cfg(test)]
pub(crate) fn lossy_test_pair(loss_pct: u8, reorder: bool) -> (Session, Session) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (close_tx, _close_rx) = mpsc::unbounded_channel();

    let (a, a_in) = Session::spawn(1, addr, a_out_tx, SessionConfig::default(), close_tx.clone());
    let (b, b_in) = Session::spawn(1, addr, b_out_tx, SessionConfig::default(), close_tx);

    lossy_bridge(a_out_rx, b_in, loss_pct, reorder);
    lossy_bridge(b_out_rx, a_in, loss_pct, reorder);

    (a, b)
}

#[cfg(test)]
fn lossy_bridge(
    mut rx: mpsc::UnboundedReceiver<(SocketAddr, Frame)>,
    input: mpsc::UnboundedSender<Frame>,
    loss_pct: u8,
    reorder: bool,
) {
    tokio::spawn(async move {
        let mut state: u64 = 0x9E3779B97F4A7C15;
        let mut delayed: Option<Frame> = None;
        while let Some((_, frame)) = rx.recv().await {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let r = ((state >> 33) % 100) as u8;

            if r < loss_pct {
                continue;
            }
            if reorder && r % 10 == 0 && delayed.is_none() {
                delayed = Some(frame);
                continue;
            }
            let _ = input.send(frame);
            if let Some(d) = delayed.take() {
                let _ = input.send(d);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_session_write_read() {
        let (mut a, mut b) = test_pair();
        a.write_all(b"hello").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_session_bidirectional() {
        let (mut a, mut b) = test_pair();
        a.write_all(b"from A").await.unwrap();
        b.write_all(b"from B").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from A");
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from B");
    }

    #[tokio::test]
    async fn test_session_data_integrity_1mb() {
        let (mut a, mut b) = test_pair();
        let size = 1024 * 1024;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            for chunk in data.chunks(8192) {
                a.write_all(chunk).await.unwrap();
            }
            a
        });

        let mut received = Vec::with_capacity(size);
        let mut buf = vec![0u8; 16384];
        while received.len() < size {
            let n = b.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        let _a = writer.await.unwrap();
        assert_eq!(received.len(), size);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_session_survives_10pct_loss() {
        let (mut a, mut b) = lossy_test_pair(10, false);
        let size = 64 * 1024;
        let data: Vec<u8> = (0..size).map(|i| (i % 199) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            for chunk in data.chunks(1024) {
                a.write_all(chunk).await.unwrap();
            }
            a
        });

        let mut received = Vec::with_capacity(size);
        let mut buf = vec![0u8; 8192];
        while received.len() < size {
            match tokio::time::timeout(Duration::from_secs(30), b.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => received.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        let _a = writer.await.unwrap();
        assert_eq!(received.len(), size, "all data must survive loss");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_session_survives_reordering() {
        let (mut a, mut b) = lossy_test_pair(0, true);
        let size = 32 * 1024;
        let data: Vec<u8> = (0..size).map(|i| (i % 173) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            for chunk in data.chunks(512) {
                a.write_all(chunk).await.unwrap();
            }
            a
        });

        let mut received = Vec::with_capacity(size);
        let mut buf = vec![0u8; 8192];
        while received.len() < size {
            match tokio::time::timeout(Duration::from_secs(10), b.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => received.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        let _a = writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_session_shutdown_gives_peer_eof() {
        let (mut a, mut b) = test_pair();
        a.write_all(b"bye").await.unwrap();
        a.shutdown().await.unwrap();

        let mut collected = Vec::new();
        let mut buf = vec![0u8; 64];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), b.read(&mut buf))
                .await
                .expect("peer must see EOF")
                .unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"bye");
    }

    #[tokio::test]
    async fn test_session_write_after_shutdown_fails() {
        let (mut a, _b) = test_pair();
        a.shutdown().await.unwrap();
        assert!(a.write_all(b"fail").await.is_err());
    }

    #[tokio::test]
    async fn test_session_read_pending_without_data() {
        let (_a, mut b) = test_pair();
        let mut buf = [0u8; 64];
        let result = tokio::time::timeout(Duration::from_millis(200), b.read(&mut buf)).await;
        assert!(result.is_err(), "read with no data should stay pending");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_session_concurrent_writers() {
        let (a, mut b) = test_pair();
        let a = Arc::new(tokio::sync::Mutex::new(a));

        let num_writers = 8;
        let msgs = 50;
        let msg_size = 64;

        let mut handles = Vec::new();
        for w in 0..num_writers {
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                for m in 0..msgs {
                    let msg = vec![(w * 37 + m) as u8; msg_size];
                    let mut conn = a.lock().await;
                    conn.write_all(&msg).await.unwrap();
                }
            }));
        }

        let expected = num_writers * msgs * msg_size;
        let mut received = 0usize;
        let mut buf = vec![0u8; 16384];
        while received < expected {
            let n = b.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received += n;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(received, expected);
    }
}
