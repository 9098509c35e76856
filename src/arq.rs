//! ArqCore — the reliable-delivery engine, free of any I/O.
//!
//! One ArqCore handles one conversation. It is deliberately synchronous:
//! a single session run loop owns it exclusively and drives it with
//! `send`/`input`/`recv`/`update`/`check`. Frames the engine wants on the
//! wire are handed to the output closure passed to `update`.
//!
//! Reliability model:
//! - outbound bytes are sliced into segments of at most [`MAX_SEGMENT_SIZE`]
//!   bytes, each tagged with the next sequence number and held in the
//!   retransmission queue until cumulatively acknowledged;
//! - RTO follows Jacobson/Karels (srtt + 4 * rttvar), doubling per retry up
//!   to [`RTO_MAX`]; a segment retransmitted [`DEAD_LINK`] times marks the
//!   conversation dead;
//! - three duplicate acks trigger a fast retransmit of the first unacked
//!   segment;
//! - the congestion window grows by slow start below ssthresh and additively
//!   above it, and halves on loss (multiplicative decrease);
//! - inbound segments arriving out of order wait in a reorder buffer and are
//!   released strictly in sequence.

use std::collections::{BTreeMap, VecDeque};

use crate::frame::{Frame, Kind, MAX_SEGMENT_SIZE};

/// Initial retransmission timeout in ms, before any RTT sample.
pub const RTO_INIT: u32 = 200;
/// Lower bound for the RTO in ms.
pub const RTO_MIN: u32 = 30;
/// Upper bound for the RTO in ms.
pub const RTO_MAX: u32 = 8_000;
/// Retransmissions of a single segment before the link is declared dead.
pub const DEAD_LINK: u32 = 10;
/// Keepalive interval in ms while the conversation is otherwise silent.
pub const KEEPALIVE_INTERVAL: u32 = 15_000;
/// Local receive window in segments.
pub const RECV_WINDOW: u16 = 256;
/// Hard cap on the send window in segments.
pub const SEND_WINDOW: u16 = 256;
/// Initial congestion window in segments.
const INIT_CWND: f64 = 4.0;
/// Initial slow-start threshold in segments.
const INIT_SSTHRESH: f64 = 64.0;
/// Send queue limit in segments; `send` refuses beyond this.
const MAX_SEND_QUEUE: usize = 1024;
/// Duplicate acks that trigger a fast retransmit.
const FAST_RETRANSMIT_DUPACKS: u32 = 3;

/// ArqCore errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqError {
    /// Local side already closed for writing.
    Closed,
    /// Send queue is at capacity; retry after acks drain it.
    SendQueueFull,
    /// Frame belongs to a different conversation.
    ConvMismatch,
}

impl std::fmt::Display for ArqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArqError::Closed => write!(f, "closed for writing"),
            ArqError::SendQueueFull => write!(f, "send queue full"),
            ArqError::ConvMismatch => write!(f, "conversation id mismatch"),
        }
    }
}

impl std::error::Error for ArqError {}

/// An outbound segment awaiting acknowledgment.
struct Segment {
    seq: u32,
    fin: bool,
    payload: Vec<u8>,
    /// Time of the most recent transmission; None until first sent.
    sent_at: Option<u32>,
    /// RTO deadline for this segment.
    resend_at: u32,
    /// Per-segment RTO (doubles on retry).
    rto: u32,
    /// Transmission count.
    xmit: u32,
}

/// Sequence comparison on the wrapping u32 space.
#[inline]
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// The per-conversation reliability engine.
pub struct ArqCore {
    conv: u32,
    mss: usize,

    // Send side.
    snd_queue: VecDeque<Segment>,
    snd_nxt: u32,
    snd_una: u32,
    fin_queued: bool,

    // Receive side.
    rcv_nxt: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    /// Seq of the peer's Fin, once seen.
    peer_fin: Option<u32>,
    eof: bool,
    delivered: VecDeque<u8>,

    // RTT estimation.
    srtt: u32,
    rttvar: u32,
    rto: u32,

    // Congestion control.
    cwnd: f64,
    ssthresh: f64,
    rmt_wnd: u16,

    // Ack bookkeeping.
    ack_pending: bool,
    last_ack_seen: u32,
    dup_acks: u32,

    // Liveness.
    last_recv: u32,
    last_send: u32,
    dead: bool,
}

impl ArqCore {
    pub fn new(conv: u32) -> Self {
        ArqCore {
            conv,
            mss: MAX_SEGMENT_SIZE,
            snd_queue: VecDeque::new(),
            snd_nxt: 0,
            snd_una: 0,
            fin_queued: false,
            rcv_nxt: 0,
            reorder: BTreeMap::new(),
            peer_fin: None,
            eof: false,
            delivered: VecDeque::new(),
            srtt: 0,
            rttvar: 0,
            rto: RTO_INIT,
            cwnd: INIT_CWND,
            ssthresh: INIT_SSTHRESH,
            rmt_wnd: SEND_WINDOW,
            ack_pending: false,
            last_ack_seen: 0,
            dup_acks: 0,
            last_recv: 0,
            last_send: 0,
            dead: false,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// True once a segment has exceeded the retransmission budget.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// True when the peer closed its write direction and every in-order byte
    /// up to its Fin has been handed out via `recv`.
    pub fn is_eof(&self) -> bool {
        self.eof && self.delivered.is_empty()
    }

    /// True when the local Fin (and all data before it) has been acked.
    pub fn close_complete(&self) -> bool {
        self.fin_queued && self.snd_queue.is_empty()
    }

    /// Milliseconds since the last validated inbound frame.
    pub fn idle_for(&self, now: u32) -> u32 {
        now.wrapping_sub(self.last_recv)
    }

    /// Whether `send` currently has room.
    pub fn can_send(&self) -> bool {
        !self.fin_queued && !self.dead && self.snd_queue.len() < MAX_SEND_QUEUE
    }

    /// Bytes ready for `recv`.
    pub fn pending_recv(&self) -> usize {
        self.delivered.len()
    }

    /// Queue outbound bytes, slicing into MSS-sized segments.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ArqError> {
        if self.fin_queued {
            return Err(ArqError::Closed);
        }
        if self.snd_queue.len() >= MAX_SEND_QUEUE {
            return Err(ArqError::SendQueueFull);
        }
        for chunk in data.chunks(self.mss) {
            self.snd_queue.push_back(Segment {
                seq: self.snd_nxt,
                fin: false,
                payload: chunk.to_vec(),
                sent_at: None,
                resend_at: 0,
                rto: self.rto,
                xmit: 0,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }
        Ok(())
    }

    /// Queue an orderly close. The Fin consumes one sequence number so the
    /// peer can tell close apart from loss.
    pub fn close(&mut self) {
        if self.fin_queued {
            return;
        }
        self.fin_queued = true;
        self.snd_queue.push_back(Segment {
            seq: self.snd_nxt,
            fin: true,
            payload: Vec::new(),
            sent_at: None,
            resend_at: 0,
            rto: self.rto,
            xmit: 0,
        });
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
    }

    /// Drain in-order received bytes into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let (s1, s2) = self.delivered.as_slices();
        let n1 = buf.len().min(s1.len());
        buf[..n1].copy_from_slice(&s1[..n1]);
        let n2 = (buf.len() - n1).min(s2.len());
        if n2 > 0 {
            buf[n1..n1 + n2].copy_from_slice(&s2[..n2]);
        }
        let total = n1 + n2;
        self.delivered.drain(..total);
        total
    }

    /// Feed one validated inbound frame.
    pub fn input(&mut self, frame: &Frame, now: u32) -> Result<(), ArqError> {
        if frame.conv != self.conv {
            return Err(ArqError::ConvMismatch);
        }
        self.last_recv = now;
        self.rmt_wnd = frame.wnd;

        match frame.kind {
            Kind::Push => {
                self.input_piggyback_ack(frame.ack, now);
                self.input_segment(frame.seq, frame.payload.clone(), false);
            }
            Kind::Fin => {
                self.input_piggyback_ack(frame.ack, now);
                self.input_segment(frame.seq, Vec::new(), true);
            }
            Kind::Ack => self.input_ack(frame.ack, now),
            Kind::Ping => {
                // Liveness only; the wnd/last_recv updates above suffice.
            }
            Kind::Syn | Kind::SynAck => {
                // Handshake frames are consumed by the endpoint; a stray
                // duplicate reaching an established conversation is ignored.
            }
        }
        Ok(())
    }

    fn input_segment(&mut self, seq: u32, payload: Vec<u8>, fin: bool) {
        self.ack_pending = true;

        // Old or duplicate segment: ack again, deliver nothing.
        if seq_before(seq, self.rcv_nxt) {
            return;
        }
        // Beyond our advertised window: drop, the peer will retransmit.
        let max_accept = self.rcv_nxt.wrapping_add(RECV_WINDOW as u32);
        if !seq_before(seq, max_accept) {
            return;
        }

        if fin {
            self.peer_fin = Some(seq);
        }
        if seq == self.rcv_nxt {
            if !fin {
                self.delivered.extend(payload.iter().copied());
            }
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.flush_reorder();
        } else {
            // Out of order: park it (Fin parks as an empty marker).
            self.reorder.entry(seq).or_insert(payload);
        }

        if let Some(fin_seq) = self.peer_fin {
            if !seq_before(self.rcv_nxt, fin_seq.wrapping_add(1)) {
                self.eof = true;
            }
        }
    }

    /// Release contiguous reorder-buffer segments into the delivered queue.
    fn flush_reorder(&mut self) {
        while let Some(payload) = self.reorder.remove(&self.rcv_nxt) {
            let is_fin = self.peer_fin == Some(self.rcv_nxt);
            if !is_fin {
                self.delivered.extend(payload.iter().copied());
            }
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        }
    }

    /// Cumulative ack carried on a data frame. Only advancement is taken;
    /// duplicate-ack counting stays on standalone Ack frames, since every
    /// retransmitted segment repeats the same ack value.
    fn input_piggyback_ack(&mut self, ack: u32, now: u32) {
        if seq_before(self.snd_una, ack) {
            self.input_ack(ack, now);
        }
    }

    fn input_ack(&mut self, ack: u32, now: u32) {
        if seq_before(self.snd_una, ack) {
            // Ack advances: one RTT sample from the newest singly-transmitted
            // segment it covers (Karn's rule — retransmitted segments give
            // ambiguous samples).
            let mut acked = 0u32;
            let mut rtt_sample: Option<u32> = None;
            while let Some(seg) = self.snd_queue.front() {
                if !seq_before(seg.seq, ack) {
                    break;
                }
                if seg.xmit == 1 {
                    if let Some(sent) = seg.sent_at {
                        rtt_sample = Some(now.wrapping_sub(sent));
                    }
                }
                self.snd_queue.pop_front();
                acked += 1;
            }
            self.snd_una = ack;
            self.dup_acks = 0;
            self.last_ack_seen = ack;

            if let Some(rtt) = rtt_sample {
                self.update_rtt(rtt);
            }
            self.grow_cwnd(acked);
        } else if ack == self.last_ack_seen && ack == self.snd_una {
            // Duplicate ack while data is outstanding.
            if !self.snd_queue.is_empty() {
                self.dup_acks += 1;
                if self.dup_acks == FAST_RETRANSMIT_DUPACKS {
                    self.fast_retransmit(now);
                }
            }
        } else {
            self.last_ack_seen = ack;
            self.dup_acks = 0;
        }
    }

    fn update_rtt(&mut self, rtt: u32) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            let delta = self.srtt.abs_diff(rtt);
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
        }
        self.rto = (self.srtt + 4 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }

    fn grow_cwnd(&mut self, acked_segments: u32) {
        for _ in 0..acked_segments {
            if self.cwnd < self.ssthresh {
                self.cwnd += 1.0; // slow start
            } else {
                self.cwnd += 1.0 / self.cwnd; // additive increase
            }
        }
        self.cwnd = self.cwnd.min(SEND_WINDOW as f64);
    }

    fn on_loss(&mut self, timeout: bool) {
        self.ssthresh = (self.cwnd / 2.0).max(2.0);
        self.cwnd = if timeout { 1.0 } else { self.ssthresh };
    }

    fn fast_retransmit(&mut self, now: u32) {
        self.on_loss(false);
        if let Some(seg) = self.snd_queue.front_mut() {
            // Emission happens on the next update; mark the segment due now.
            seg.resend_at = now;
        }
    }

    /// Advertised receive window in segments.
    fn local_wnd(&self) -> u16 {
        let backlog = self.reorder.len() + self.delivered.len() / self.mss.max(1);
        RECV_WINDOW.saturating_sub(backlog.min(u16::MAX as usize) as u16)
    }

    /// Segments currently in flight (transmitted, unacked).
    fn inflight(&self) -> usize {
        self.snd_queue.iter().filter(|s| s.xmit > 0).count()
    }

    /// Drive timers and transmissions. Every frame the engine wants sent is
    /// passed to `out`.
    pub fn update<F: FnMut(Frame)>(&mut self, now: u32, out: &mut F) {
        if self.dead {
            return;
        }
        let wnd = self.local_wnd();

        // Retransmit expired in-flight segments.
        let mut lost = false;
        for seg in self.snd_queue.iter_mut() {
            if seg.xmit == 0 {
                continue;
            }
            if !time_before(now, seg.resend_at) {
                seg.xmit += 1;
                if seg.xmit > DEAD_LINK {
                    self.dead = true;
                    return;
                }
                seg.rto = (seg.rto * 2).min(RTO_MAX);
                seg.sent_at = Some(now);
                seg.resend_at = now.wrapping_add(seg.rto);
                lost = true;
                out(Frame::new(
                    self.conv,
                    if seg.fin { Kind::Fin } else { Kind::Push },
                    seg.seq,
                    self.rcv_nxt,
                    wnd,
                    seg.payload.clone(),
                ));
                self.last_send = now;
            }
        }
        if lost {
            self.on_loss(true);
        }

        // Transmit fresh segments while the window allows.
        let window = (self.cwnd as usize).min(self.rmt_wnd as usize).max(1);
        let mut inflight = self.inflight();
        for seg in self.snd_queue.iter_mut() {
            if seg.xmit > 0 {
                continue;
            }
            if inflight >= window {
                break;
            }
            seg.xmit = 1;
            seg.rto = self.rto;
            seg.sent_at = Some(now);
            seg.resend_at = now.wrapping_add(seg.rto);
            inflight += 1;
            out(Frame::new(
                self.conv,
                if seg.fin { Kind::Fin } else { Kind::Push },
                seg.seq,
                self.rcv_nxt,
                wnd,
                seg.payload.clone(),
            ));
            self.last_send = now;
            // Data frames carry the cumulative ack; nothing further pending.
            self.ack_pending = false;
        }

        // Flush a standalone cumulative ack if still owed.
        if self.ack_pending {
            self.ack_pending = false;
            out(Frame::control(self.conv, Kind::Ack, 0, self.rcv_nxt, wnd));
            self.last_send = now;
        }

        // Keepalive when the conversation has gone quiet.
        if now.wrapping_sub(self.last_send) >= KEEPALIVE_INTERVAL {
            out(Frame::control(self.conv, Kind::Ping, 0, self.rcv_nxt, wnd));
            self.last_send = now;
        }
    }

    /// Earliest time `update` needs to run again.
    pub fn check(&self, now: u32) -> u32 {
        if self.ack_pending {
            return now;
        }
        let mut next = now.wrapping_add(KEEPALIVE_INTERVAL);
        let window = (self.cwnd as usize).min(self.rmt_wnd as usize).max(1);
        let mut inflight = 0usize;
        let mut has_fresh = false;
        for seg in &self.snd_queue {
            if seg.xmit > 0 {
                inflight += 1;
                if time_before(seg.resend_at, next) {
                    next = seg.resend_at;
                }
            } else {
                has_fresh = true;
            }
        }
        if has_fresh && inflight < window {
            return now; // window has room for untransmitted data
        }
        next
    }

    #[cfg(test)]
    fn cwnd_segments(&self) -> f64 {
        self.cwnd
    }
}

#[inline]
fn time_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive `a`'s output into a vec of frames.
    fn pump(core: &mut ArqCore, now: u32) -> Vec<Frame> {
        let mut frames = Vec::new();
        core.update(now, &mut |f| frames.push(f));
        frames
    }

    fn deliver(frames: &[Frame], to: &mut ArqCore, now: u32) {
        for f in frames {
            to.input(f, now).unwrap();
        }
    }

    /// Exchange frames both ways until quiescent or `rounds` exhausted.
    fn converge(a: &mut ArqCore, b: &mut ArqCore, start: u32, rounds: u32) -> u32 {
        let mut now = start;
        for _ in 0..rounds {
            let fa = pump(a, now);
            let fb = pump(b, now);
            deliver(&fa, b, now);
            deliver(&fb, a, now);
            now += 10;
        }
        now
    }

    fn drain(core: &mut ArqCore) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = core.recv(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_send_recv_in_order() {
        let mut a = ArqCore::new(7);
        let mut b = ArqCore::new(7);

        a.send(b"hello arq").unwrap();
        converge(&mut a, &mut b, 0, 4);

        assert_eq!(drain(&mut b), b"hello arq");
        assert!(a.snd_queue.is_empty(), "all segments acked");
    }

    #[test]
    fn test_segmentation_large_send() {
        let mut a = ArqCore::new(1);
        let mut b = ArqCore::new(1);

        let data: Vec<u8> = (0..10 * MAX_SEGMENT_SIZE).map(|i| (i % 251) as u8).collect();
        a.send(&data).unwrap();
        converge(&mut a, &mut b, 0, 20);

        assert_eq!(drain(&mut b), data);
    }

    #[test]
    fn test_reordering_restored() {
        let mut a = ArqCore::new(3);
        let mut b = ArqCore::new(3);

        a.send(&vec![1u8; MAX_SEGMENT_SIZE]).unwrap();
        a.send(&vec![2u8; MAX_SEGMENT_SIZE]).unwrap();
        a.send(&vec![3u8; MAX_SEGMENT_SIZE]).unwrap();

        let mut frames = pump(&mut a, 0);
        frames.reverse(); // worst-case reordering
        deliver(&frames, &mut b, 0);

        let got = drain(&mut b);
        let mut expected = vec![1u8; MAX_SEGMENT_SIZE];
        expected.extend(vec![2u8; MAX_SEGMENT_SIZE]);
        expected.extend(vec![3u8; MAX_SEGMENT_SIZE]);
        assert_eq!(got, expected);
    }

    #[test]
    fn test_duplicate_segments_ignored() {
        let mut a = ArqCore::new(3);
        let mut b = ArqCore::new(3);

        a.send(b"once").unwrap();
        let frames = pump(&mut a, 0);
        deliver(&frames, &mut b, 0);
        deliver(&frames, &mut b, 5); // duplicates

        assert_eq!(drain(&mut b), b"once");
    }

    #[test]
    fn test_loss_recovered_by_retransmission() {
        let mut a = ArqCore::new(9);
        let mut b = ArqCore::new(9);

        a.send(b"will be lost").unwrap();
        let _dropped = pump(&mut a, 0); // never delivered

        // After the RTO fires the segment goes out again.
        let mut now = RTO_INIT + 10;
        let retrans = pump(&mut a, now);
        assert!(!retrans.is_empty(), "expected retransmission after RTO");
        deliver(&retrans, &mut b, now);
        now += 10;
        let acks = pump(&mut b, now);
        deliver(&acks, &mut a, now);

        assert_eq!(drain(&mut b), b"will be lost");
        assert!(a.snd_queue.is_empty());
    }

    #[test]
    fn test_piggybacked_ack_clears_peer_queue() {
        let mut a = ArqCore::new(9);
        let mut b = ArqCore::new(9);

        a.send(b"ping").unwrap();

        // b echoes a reply in the same tick it receives data, so its ack
        // rides on the reply Push instead of a standalone Ack frame.
        let mut now = 0;
        while now < RTO_INIT - 20 {
            let fa = pump(&mut a, now);
            deliver(&fa, &mut b, now);
            let echoed = drain(&mut b);
            if !echoed.is_empty() {
                b.send(&echoed).unwrap();
            }
            let fb = pump(&mut b, now);
            deliver(&fb, &mut a, now);
            now += 10;
        }

        assert!(
            a.snd_queue.is_empty(),
            "reply frame's ack must clear a's queue before the RTO"
        );
        assert_eq!(drain(&mut a), b"ping");
        assert!(b.snd_queue.is_empty());
    }

    #[test]
    fn test_rto_backoff_doubles_and_caps() {
        let mut a = ArqCore::new(9);
        a.send(b"x").unwrap();

        let mut now = 0;
        let mut last_gap = 0u32;
        let _ = pump(&mut a, now);
        let mut rto = a.snd_queue.front().unwrap().rto;
        for _ in 0..8 {
            now = now.wrapping_add(rto).wrapping_add(1);
            let frames = pump(&mut a, now);
            if a.is_dead() {
                break;
            }
            assert!(!frames.is_empty());
            let next_rto = a.snd_queue.front().unwrap().rto;
            assert!(next_rto >= rto, "rto must not shrink under loss");
            assert!(next_rto <= RTO_MAX);
            last_gap = next_rto;
            rto = next_rto;
        }
        assert!(last_gap <= RTO_MAX);
    }

    #[test]
    fn test_dead_link_detection() {
        let mut a = ArqCore::new(9);
        a.send(b"nobody listening").unwrap();

        let mut now = 0u32;
        for _ in 0..DEAD_LINK + 2 {
            let _ = pump(&mut a, now);
            now = now.wrapping_add(RTO_MAX + 1);
        }
        assert!(a.is_dead());
    }

    #[test]
    fn test_fast_retransmit_on_dup_acks() {
        let mut a = ArqCore::new(5);
        a.send(&vec![0u8; 4 * MAX_SEGMENT_SIZE]).unwrap();
        let frames = pump(&mut a, 0);
        assert!(frames.len() >= 4);

        // Segment 0 lost; 1..3 arrive and each provokes a duplicate ack.
        let mut b = ArqCore::new(5);
        for f in &frames[1..4] {
            b.input(f, 0).unwrap();
            let acks = pump(&mut b, 0);
            deliver(&acks, &mut a, 0);
        }

        // Fast retransmit must resend seq 0 well before its RTO.
        let resent = pump(&mut a, 1);
        assert!(
            resent.iter().any(|f| f.kind == Kind::Push && f.seq == 0),
            "expected fast retransmit of seq 0"
        );
    }

    #[test]
    fn test_cwnd_multiplicative_decrease_on_timeout() {
        let mut a = ArqCore::new(5);
        let mut b = ArqCore::new(5);

        a.send(&vec![0u8; 8 * MAX_SEGMENT_SIZE]).unwrap();
        let now = converge(&mut a, &mut b, 0, 6);
        let grown = a.cwnd_segments();
        assert!(grown > INIT_CWND, "cwnd should grow on sustained acks");

        a.send(&vec![1u8; 2 * MAX_SEGMENT_SIZE]).unwrap();
        let _lost = pump(&mut a, now);
        let _ = pump(&mut a, now + RTO_MAX + 1); // RTO fires
        assert!(a.cwnd_segments() < grown, "cwnd must shrink on timeout");
    }

    #[test]
    fn test_fin_delivers_eof_after_data() {
        let mut a = ArqCore::new(2);
        let mut b = ArqCore::new(2);

        a.send(b"last words").unwrap();
        a.close();
        converge(&mut a, &mut b, 0, 6);

        assert_eq!(drain(&mut b), b"last words");
        assert!(b.is_eof());
        assert!(a.close_complete());
    }

    #[test]
    fn test_fin_out_of_order_waits_for_data() {
        let mut a = ArqCore::new(2);
        let mut b = ArqCore::new(2);

        a.send(b"data").unwrap();
        a.close();
        let frames = pump(&mut a, 0);
        assert_eq!(frames.len(), 2);

        // Fin first, then the data segment.
        b.input(&frames[1], 0).unwrap();
        assert!(!b.is_eof(), "eof must wait for the missing data segment");
        b.input(&frames[0], 0).unwrap();
        assert_eq!(drain(&mut b), b"data");
        assert!(b.is_eof());
    }

    #[test]
    fn test_send_after_close_rejected() {
        let mut a = ArqCore::new(2);
        a.close();
        assert_eq!(a.send(b"too late"), Err(ArqError::Closed));
    }

    #[test]
    fn test_conv_mismatch_rejected() {
        let mut a = ArqCore::new(1);
        let frame = Frame::control(2, Kind::Ack, 0, 0, 0);
        assert_eq!(a.input(&frame, 0), Err(ArqError::ConvMismatch));
    }

    #[test]
    fn test_window_limits_inflight() {
        let mut a = ArqCore::new(4);
        // Far more data than the initial cwnd of 4 segments.
        a.send(&vec![0u8; 64 * MAX_SEGMENT_SIZE]).unwrap();
        let frames = pump(&mut a, 0);
        assert!(
            frames.len() <= INIT_CWND as usize,
            "initial burst {} exceeds cwnd",
            frames.len()
        );
    }

    #[test]
    fn test_keepalive_emitted_when_idle() {
        let mut a = ArqCore::new(4);
        let frames = pump(&mut a, KEEPALIVE_INTERVAL + 1);
        assert!(frames.iter().any(|f| f.kind == Kind::Ping));
    }

    #[test]
    fn test_lossy_duplicating_reordering_channel() {
        // Deterministic adversarial channel: drops ~20%, duplicates ~10%,
        // and delays every 7th frame by one round.
        let mut a = ArqCore::new(11);
        let mut b = ArqCore::new(11);

        let data: Vec<u8> = (0..40 * MAX_SEGMENT_SIZE).map(|i| (i % 199) as u8).collect();
        a.send(&data).unwrap();

        let mut rng: u64 = 0x2545F4914F6CDD1D;
        let mut next_rand = move || {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            rng
        };

        let mut now = 0u32;
        let mut held: Vec<Frame> = Vec::new();
        let mut received = Vec::new();
        let mut counter = 0u64;

        for _ in 0..4000 {
            let mut wire = pump(&mut a, now);
            wire.extend(held.drain(..));
            for f in wire {
                counter += 1;
                let r = next_rand() % 100;
                if r < 20 {
                    continue; // lost
                }
                if counter % 7 == 0 {
                    held.push(f.clone()); // delayed to next round
                    continue;
                }
                b.input(&f, now).unwrap();
                if r < 30 {
                    b.input(&f, now).unwrap(); // duplicated
                }
            }
            let back = pump(&mut b, now);
            for f in back {
                if next_rand() % 100 < 20 {
                    continue;
                }
                a.input(&f, now).unwrap();
            }
            let mut buf = [0u8; 8192];
            loop {
                let n = b.recv(&mut buf);
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            if received.len() == data.len() && a.snd_queue.is_empty() {
                break;
            }
            now += 20;
        }

        assert_eq!(received.len(), data.len(), "all bytes must arrive");
        assert_eq!(received, data, "bytes must arrive in order without corruption");
        assert!(!a.is_dead());
    }
}
