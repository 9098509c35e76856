//! Wire frame codec for the ARQ transport.
//!
//! One frame travels in exactly one UDP datagram. Layout (big-endian):
//!
//! ```text
//! conv(4) kind(1) wnd(2) seq(4) ack(4) len(2) crc(4) payload(len)
//! ```
//!
//! `crc` is CRC-32 over the whole frame with the crc field zeroed. A frame
//! that fails any decode check is indistinguishable from datagram loss to
//! the rest of the transport.

use crc32fast::Hasher;

/// Frame header size: conv(4) + kind(1) + wnd(2) + seq(4) + ack(4) + len(2) + crc(4).
pub const HEADER_SIZE: usize = 21;

/// Path MTU the transport assumes for a single datagram.
pub const MTU: usize = 1400;

/// Maximum payload bytes carried by one frame.
pub const MAX_SEGMENT_SIZE: usize = MTU - HEADER_SIZE;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// Session open request (handshake, carries the initiator's first seq).
    Syn = 0x01,
    /// Session open acknowledgment.
    SynAck = 0x02,
    /// Data segment.
    Push = 0x03,
    /// Cumulative acknowledgment; `ack` is the next expected seq.
    Ack = 0x04,
    /// Orderly close of the sender's write direction.
    Fin = 0x05,
    /// Keepalive.
    Ping = 0x06,
}

impl Kind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Kind::Syn),
            0x02 => Some(Kind::SynAck),
            0x03 => Some(Kind::Push),
            0x04 => Some(Kind::Ack),
            0x05 => Some(Kind::Fin),
            0x06 => Some(Kind::Ping),
            _ => None,
        }
    }
}

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub conv: u32,
    pub kind: Kind,
    /// Receive window advertisement, in segments.
    pub wnd: u16,
    /// Sequence number (Push/Syn/Fin); zero for Ack and Ping frames.
    pub seq: u32,
    /// Cumulative ack: next seq the sender expects from the peer.
    pub ack: u32,
    pub payload: Vec<u8>,
}

/// Frame decode errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    TooShort,
    InvalidKind,
    LengthMismatch,
    ChecksumMismatch,
    PayloadTooLarge,
    BufferTooSmall,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "frame too short"),
            FrameError::InvalidKind => write!(f, "invalid frame kind"),
            FrameError::LengthMismatch => write!(f, "payload length mismatch"),
            FrameError::ChecksumMismatch => write!(f, "checksum mismatch"),
            FrameError::PayloadTooLarge => write!(f, "payload too large"),
            FrameError::BufferTooSmall => write!(f, "buffer too small"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Frame {
    pub fn new(conv: u32, kind: Kind, seq: u32, ack: u32, wnd: u16, payload: Vec<u8>) -> Self {
        Frame { conv, kind, wnd, seq, ack, payload }
    }

    /// A payload-free control frame.
    pub fn control(conv: u32, kind: Kind, seq: u32, ack: u32, wnd: u16) -> Self {
        Frame::new(conv, kind, seq, ack, wnd, Vec::new())
    }

    /// Total encoded size.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.wire_len()];
        // wire_len always fits the buffer we just sized
        let _ = self.encode_to(&mut buf);
        buf
    }

    /// Encode into an existing buffer. Returns the number of bytes written.
    pub fn encode_to(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        let total = self.wire_len();
        if self.payload.len() > MAX_SEGMENT_SIZE {
            return Err(FrameError::PayloadTooLarge);
        }
        if buf.len() < total {
            return Err(FrameError::BufferTooSmall);
        }

        buf[0..4].copy_from_slice(&self.conv.to_be_bytes());
        buf[4] = self.kind as u8;
        buf[5..7].copy_from_slice(&self.wnd.to_be_bytes());
        buf[7..11].copy_from_slice(&self.seq.to_be_bytes());
        buf[11..15].copy_from_slice(&self.ack.to_be_bytes());
        buf[15..17].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[17..21].copy_from_slice(&[0u8; 4]); // crc placeholder
        buf[HEADER_SIZE..total].copy_from_slice(&self.payload);

        let crc = checksum(&buf[..total]);
        buf[17..21].copy_from_slice(&crc.to_be_bytes());
        Ok(total)
    }

    /// Decode and verify a frame from one datagram.
    pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::TooShort);
        }

        let conv = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let kind = Kind::from_byte(data[4]).ok_or(FrameError::InvalidKind)?;
        let wnd = u16::from_be_bytes([data[5], data[6]]);
        let seq = u32::from_be_bytes([data[7], data[8], data[9], data[10]]);
        let ack = u32::from_be_bytes([data[11], data[12], data[13], data[14]]);
        let len = u16::from_be_bytes([data[15], data[16]]) as usize;
        let crc = u32::from_be_bytes([data[17], data[18], data[19], data[20]]);

        if len > MAX_SEGMENT_SIZE {
            return Err(FrameError::PayloadTooLarge);
        }
        if data.len() != HEADER_SIZE + len {
            return Err(FrameError::LengthMismatch);
        }

        let mut check_buf = data.to_vec();
        check_buf[17..21].copy_from_slice(&[0u8; 4]);
        if checksum(&check_buf) != crc {
            return Err(FrameError::ChecksumMismatch);
        }

        Ok(Frame {
            conv,
            kind,
            wnd,
            seq,
            ack,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Peek the conversation id without full validation. Used by the demux
    /// loop to route before paying for the checksum.
    pub fn peek_conv(data: &[u8]) -> Option<u32> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
