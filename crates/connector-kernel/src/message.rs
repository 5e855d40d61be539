//! Identifiers, envelopes, and their wire layout.
//!
//! Every transport frame is a netlink header followed by a connector
//! envelope.  All fields are host byte order, as netlink is.
//!
//! ```text
//! +-------------------------------------------------------------+
//! | nlmsg_len (4) | nlmsg_type (2) | nlmsg_flags (2)             |
//! | nlmsg_seq (4) | nlmsg_pid (4)                                |
//! +-------------------------------------------------------------+
//! | idx (4) | val (4) | seq (4) | ack (4) | len (4)             |
//! +-------------------------------------------------------------+
//! | payload (len bytes) ... padding to 4-byte alignment         |
//! +-------------------------------------------------------------+
//! ```
//!
//! The payload of the control identifier is a [`CtlMsg`]:
//!
//! ```text
//! | group (4) | idx_notify_num (4) | val_notify_num (4) | len (4) |
//! | first (4) | range (4) |  x (idx_notify_num + val_notify_num)  |
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

/// Two-part identifier naming a message class.
///
/// Equality is an exact match of both fields; there are no wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CbId {
    pub idx: u32,
    pub val: u32,
}

impl CbId {
    pub const fn new(idx: u32, val: u32) -> Self {
        Self { idx, val }
    }
}

impl fmt::Display for CbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}}}", self.idx, self.val)
    }
}

// ---------------------------------------------------------------------------
// Netlink header
// ---------------------------------------------------------------------------

/// Netlink message header length.
pub const NLMSG_HDRLEN: usize = 16;
/// `nlmsg_type` of a terminal message.
pub const NLMSG_DONE: u16 = 3;

const NLMSG_ALIGNTO: usize = 4;

/// Round `len` up to netlink alignment.
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Total frame space needed for a netlink message carrying `len` bytes.
pub const fn nlmsg_space(len: usize) -> usize {
    nlmsg_align(len + NLMSG_HDRLEN)
}

/// Netlink message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMsgHdr {
    pub len: u32,
    pub ty: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHdr {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.len.to_ne_bytes());
        buf.extend_from_slice(&self.ty.to_ne_bytes());
        buf.extend_from_slice(&self.flags.to_ne_bytes());
        buf.extend_from_slice(&self.seq.to_ne_bytes());
        buf.extend_from_slice(&self.pid.to_ne_bytes());
    }

    /// Parse and validate the header at the start of an inbound frame.
    ///
    /// Rejects frames whose declared length cannot hold an envelope header,
    /// overruns the frame, or exceeds `max_msg_size`.
    pub fn parse_frame(frame: &[u8], max_msg_size: usize) -> Result<Self> {
        if frame.len() < NLMSG_HDRLEN {
            return Err(ConnectorError::MalformedFrame {
                reason: format!("{} bytes is shorter than a netlink header", frame.len()),
            });
        }

        let hdr = Self {
            len: read_u32(frame, 0),
            ty: read_u16(frame, 4),
            flags: read_u16(frame, 6),
            seq: read_u32(frame, 8),
            pid: read_u32(frame, 12),
        };

        let len = hdr.len as usize;
        if len < NLMSG_HDRLEN + CnMsg::HEADER_LEN {
            return Err(ConnectorError::MalformedFrame {
                reason: format!("nlmsg_len {len} cannot hold a connector header"),
            });
        }
        if len > frame.len() {
            return Err(ConnectorError::MalformedFrame {
                reason: format!("nlmsg_len {len} overruns {}-byte frame", frame.len()),
            });
        }
        if len > max_msg_size {
            return Err(ConnectorError::FrameTooLarge {
                size: len,
                max: max_msg_size,
            });
        }

        Ok(hdr)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A connector message envelope.
///
/// `seq` and `ack` establish request/reply genealogy: a sender picks a
/// locally unique `seq`; a reply echoes it and sets `ack = seq + 1`.  The
/// connector does not enforce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnMsg {
    pub id: CbId,
    pub seq: u32,
    pub ack: u32,
    pub data: Vec<u8>,
}

impl CnMsg {
    /// Size of the envelope header.
    pub const HEADER_LEN: usize = 20;

    pub fn new(id: CbId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            seq: 0,
            ack: 0,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    #[must_use]
    pub fn with_ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    /// Payload length as carried on the wire.
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Build a reply to this message carrying `data`.
    pub fn reply(&self, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: self.id,
            seq: self.seq,
            ack: self.seq.wrapping_add(1),
            data: data.into(),
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.idx.to_ne_bytes());
        buf.extend_from_slice(&self.id.val.to_ne_bytes());
        buf.extend_from_slice(&self.seq.to_ne_bytes());
        buf.extend_from_slice(&self.ack.to_ne_bytes());
        buf.extend_from_slice(&self.len().to_ne_bytes());
        buf.extend_from_slice(&self.data);
    }

    /// Decode an envelope from the body of a netlink message.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < Self::HEADER_LEN {
            return Err(ConnectorError::MalformedFrame {
                reason: format!("{} bytes is shorter than a connector header", body.len()),
            });
        }

        let len = read_u32(body, 16) as usize;
        let available = body.len() - Self::HEADER_LEN;
        if len > available {
            return Err(ConnectorError::MalformedFrame {
                reason: format!("payload declares {len} bytes, {available} available"),
            });
        }

        Ok(Self {
            id: CbId::new(read_u32(body, 0), read_u32(body, 4)),
            seq: read_u32(body, 8),
            ack: read_u32(body, 12),
            data: body[Self::HEADER_LEN..Self::HEADER_LEN + len].to_vec(),
        })
    }

    /// Total frame size needed to carry this message.
    pub fn frame_size(&self) -> usize {
        nlmsg_space(Self::HEADER_LEN + self.data.len())
    }

    /// Serialise this message into a complete netlink frame.
    ///
    /// The frame is allocated fallibly; an allocation failure is reported
    /// as [`ConnectorError::OutOfMemory`].
    pub fn encode_frame(&self, max_msg_size: usize) -> Result<Vec<u8>> {
        let size = self.frame_size();
        if size > max_msg_size {
            return Err(ConnectorError::FrameTooLarge {
                size,
                max: max_msg_size,
            });
        }

        let mut frame = Vec::new();
        frame
            .try_reserve_exact(size)
            .map_err(|_| ConnectorError::OutOfMemory { what: "frame" })?;

        let hdr = NlMsgHdr {
            len: size as u32,
            ty: NLMSG_DONE,
            flags: 0,
            seq: self.seq,
            pid: 0,
        };
        hdr.write(&mut frame);
        self.write(&mut frame);
        frame.resize(size, 0);
        Ok(frame)
    }

    /// Parse a complete frame without privilege checks.  Used by receivers
    /// of broadcast frames.
    pub fn decode_frame(frame: &[u8], max_msg_size: usize) -> Result<Self> {
        let hdr = NlMsgHdr::parse_frame(frame, max_msg_size)?;
        Self::decode(&frame[NLMSG_HDRLEN..hdr.len as usize])
    }
}

// ---------------------------------------------------------------------------
// Control message
// ---------------------------------------------------------------------------

/// A half-open range `[first, first + range)` of identifier fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyReq {
    pub first: u32,
    pub range: u32,
}

impl NotifyReq {
    /// Size of one range record on the wire.
    pub const LEN: usize = 8;

    pub const fn new(first: u32, range: u32) -> Self {
        Self { first, range }
    }

    pub fn contains(&self, x: u32) -> bool {
        let x = u64::from(x);
        let first = u64::from(self.first);
        x >= first && x < first + u64::from(self.range)
    }
}

/// Subscription request carried by the control identifier.
///
/// `group == 0` asks to remove matching subscriptions; any other value
/// subscribes that broadcast group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtlMsg {
    pub group: u32,
    pub idx: Vec<NotifyReq>,
    pub val: Vec<NotifyReq>,
    /// Declared byte length of the range records.
    pub len: u32,
}

impl CtlMsg {
    /// Size of the control header.
    pub const HEADER_LEN: usize = 16;

    /// Build a control message with a consistent `len`.
    pub fn new(group: u32, idx: Vec<NotifyReq>, val: Vec<NotifyReq>) -> Self {
        let len = ((idx.len() + val.len()) * NotifyReq::LEN) as u32;
        Self {
            group,
            idx,
            val,
            len,
        }
    }

    /// Serialise to the control payload layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            Self::HEADER_LEN + (self.idx.len() + self.val.len()) * NotifyReq::LEN,
        );
        buf.extend_from_slice(&self.group.to_ne_bytes());
        buf.extend_from_slice(&(self.idx.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&(self.val.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&self.len.to_ne_bytes());
        for req in self.idx.iter().chain(&self.val) {
            buf.extend_from_slice(&req.first.to_ne_bytes());
            buf.extend_from_slice(&req.range.to_ne_bytes());
        }
        buf
    }

    /// Parse a control payload, validating every length field strictly.
    ///
    /// The declared record counts must account for exactly the payload, and
    /// the declared inner length plus header must equal the payload length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_LEN {
            return Err(ConnectorError::MalformedControlMessage {
                reason: format!("{} bytes is shorter than a control header", data.len()),
            });
        }

        let group = read_u32(data, 0);
        let idx_num = read_u32(data, 4);
        let val_num = read_u32(data, 8);
        let len = read_u32(data, 12);

        let expected = Self::HEADER_LEN as u64
            + (u64::from(idx_num) + u64::from(val_num)) * NotifyReq::LEN as u64;
        if expected != data.len() as u64 {
            return Err(ConnectorError::MalformedControlMessage {
                reason: format!(
                    "{idx_num}+{val_num} ranges need {expected} bytes, got {}",
                    data.len()
                ),
            });
        }
        if u64::from(len) + Self::HEADER_LEN as u64 != data.len() as u64 {
            return Err(ConnectorError::MalformedControlMessage {
                reason: format!("declared len {len} disagrees with {} bytes", data.len()),
            });
        }

        let mut reqs = data[Self::HEADER_LEN..]
            .chunks_exact(NotifyReq::LEN)
            .map(|c| NotifyReq::new(read_u32(c, 0), read_u32(c, 4)));
        let idx = reqs.by_ref().take(idx_num as usize).collect();
        let val = reqs.collect();

        Ok(Self {
            group,
            idx,
            val,
            len,
        })
    }

    /// Whether two control messages request the same ranges.
    ///
    /// Counts, declared length and every range must match in order.  A
    /// message whose declared length disagrees with its range counts never
    /// matches.
    pub fn same_ranges(&self, other: &Self) -> bool {
        if self.idx.len() != other.idx.len() || self.val.len() != other.val.len() {
            return false;
        }
        if self.len != other.len {
            return false;
        }
        if (self.idx.len() + self.val.len()) * NotifyReq::LEN != self.len as usize {
            return false;
        }
        self.idx == other.idx && self.val == other.val
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[at..at + 2]);
    u16::from_ne_bytes(raw)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
