// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Packet command channel: common types and traits.
 *
 * Copyright (c) 2025 Code Construct
 */

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Packet command channel
//!
//! This crate carries firmware update messages over a point-to-point
//! packet link. A [`CmdChannel`] wraps one physical link (any [`Transport`]),
//! serializes senders, and reports timeouts and overflow. Logical messages
//! are split into packets with a small MCTP-style header and reassembled by
//! an [`Assembler`] on the receiving side.
//!
//! Transports are provided for an in-memory [`loopback`] pair and a
//! [`tcp`] stream.

use std::time::{Duration, Instant};

use thiserror::Error;

mod channel;
mod fragment;
pub mod loopback;
mod reassemble;
pub mod tcp;

pub use channel::{ChannelConfig, CmdChannel};
pub use reassemble::Assembler;

/// Endpoint ID
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Eid(pub u8);

impl Eid {
    /// Construct a new normal EID.
    ///
    /// Reserved, Null, and Broadcast EIDs are rejected.
    pub const fn new_normal(eid: u8) -> Result<Eid> {
        if eid <= 7 || eid == 0xff {
            Err(Error::InvalidArgument)
        } else {
            Ok(Eid(eid))
        }
    }
}

impl core::fmt::Display for Eid {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Special EID value: broadcast and/or match any.
pub const ADDR_ANY: Eid = Eid(0xff);
/// Special EID value: NULL, used for physical addressing
pub const ADDR_NULL: Eid = Eid(0x00);

/// Message tag value, 0 to [`TAG_MAX`]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TagValue(pub u8);

/// Identifies a tag and its owner
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Tag {
    /// Tag owner bit clear, used for responses.
    Unowned(TagValue),
    /// Tag owner bit set, used for requests.
    Owned(TagValue),
}

impl Tag {
    /// Returns the tag
    pub fn tag(&self) -> TagValue {
        match self {
            Self::Unowned(tag) | Self::Owned(tag) => *tag,
        }
    }

    /// Returns `true` for `Owned`
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

impl core::fmt::Display for Tag {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Tag::Owned(v) => write!(fmt, "TO,{:x}", v.0),
            Tag::Unowned(v) => write!(fmt, "!TO,{:x}", v.0),
        }
    }
}

/// Message type field, carried in the first packet of a message.
///
/// The most-significant bit is reserved and always zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MsgType(pub u8);

impl core::fmt::Display for MsgType {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Control protocol
pub const MCTP_TYPE_CONTROL: MsgType = MsgType(0x00);
/// PLDM
pub const MCTP_TYPE_PLDM: MsgType = MsgType(0x01);

/// Header version 1
pub const HEADER_VERSION_1: u8 = 1;
/// Transport header length, prefixed to every packet
pub const HEADER_LEN: usize = 4;
/// Capacity of a [`Packet`] buffer, including the transport header
pub const PACKET_CAPACITY: usize = 255;
/// Default limit for a reassembled message
pub const MAX_MESSAGE_SIZE: usize = 4096;
/// Mask for the packet sequence number
pub const SEQ_MASK: u8 = 0x03;
/// Maximum message tag number
pub const TAG_MAX: u8 = 7;

/// Failures that can occur inside a transport medium.
///
/// Transports map their native errors into one of these rather than
/// passing them through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumError {
    /// Medium could not be initialised
    Init,
    /// Invalid or unavailable network address
    Address,
    /// Connection failed or was lost
    Connect,
    /// Sending on the medium failed
    Send,
    /// Receiving on the medium failed
    Receive,
    /// Waiting for medium readiness failed
    Select,
    /// Medium-level timeout
    Timeout,
    /// Binding a local address failed
    Bind,
}

/// Channel error taxonomy
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Bad argument
    #[error("invalid argument")]
    InvalidArgument,
    /// A buffer could not be allocated or is too small
    #[error("out of memory")]
    NoMemory,
    /// Failure in receive path
    #[error("receive failed")]
    RxFailed,
    /// Failure in transmit path
    #[error("send failed")]
    TxFailed,
    /// No packet arrived before the timeout
    #[error("receive timed out")]
    RxTimeout,
    /// Transmit could not complete in time
    #[error("send timed out")]
    TxTimeout,
    /// Received more data than the maximum packet size
    #[error("packet overflow")]
    PacketOverflow,
    /// Packet is not in a state that can be processed
    #[error("invalid packet state")]
    InvalidPacketState,
    /// Packet deadline passed before processing
    #[error("packet expired")]
    PacketExpired,
    /// Packet length is not valid for the channel
    #[error("invalid packet size")]
    InvalidPacketSize,
    /// Transport medium failure
    #[error("medium failure: {0:?}")]
    Medium(MediumError),
}

/// Channel result type
pub type Result<T> = core::result::Result<T, Error>;

/// Time to wait in a blocking receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until a packet arrives
    Forever,
    /// Check once, never block
    Poll,
    /// Wait up to the duration
    After(Duration),
}

impl Timeout {
    /// Converts a millisecond count.
    ///
    /// Negative values wait forever and zero polls.
    pub fn from_millis(ms: i32) -> Self {
        match ms {
            0 => Self::Poll,
            ms if ms < 0 => Self::Forever,
            ms => Self::After(Duration::from_millis(ms.unsigned_abs().into())),
        }
    }

    /// Starts a deadline for waits spanning several receives.
    pub fn start(self) -> Deadline {
        let at = match self {
            Self::Forever => None,
            Self::Poll => Some(Instant::now()),
            // too far ahead to represent, so never expires
            Self::After(d) => Instant::now().checked_add(d),
        };
        Deadline { at, polled: false }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Self::Poll
        } else {
            Self::After(d)
        }
    }
}

/// An absolute limit for a sequence of receives, from [`Timeout::start`].
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<Instant>,
    polled: bool,
}

impl Deadline {
    /// Returns the timeout for the next receive, or `None` once expired.
    ///
    /// An elapsed deadline still yields one final `Poll`.
    pub fn remaining(&mut self) -> Option<Timeout> {
        let Some(at) = self.at else {
            return Some(Timeout::Forever);
        };
        let now = Instant::now();
        if at > now {
            return Some(Timeout::After(at - now));
        }
        if self.polled {
            None
        } else {
            self.polled = true;
            Some(Timeout::Poll)
        }
    }
}

/// Lifecycle state of a [`Packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Ready for processing or transmission
    Valid,
    /// More data arrived than the channel allows, contents truncated
    Overflow,
    /// A NACK should be sent, contents disregarded
    Nack,
    /// No response is needed
    NoResponse,
    /// The packet was not received cleanly
    RxError,
}

/// A single packet, including the transport header.
#[derive(Debug, Clone)]
pub struct Packet {
    data: heapless::Vec<u8, PACKET_CAPACITY>,
    /// Bus address. For received packets this is the sender's address,
    /// where replies are sent.
    pub dest_addr: u8,
    /// Lifecycle state
    pub state: PacketState,
    deadline: Option<Instant>,
}

impl Packet {
    /// Creates a `Valid` packet from its raw contents.
    ///
    /// Fails with `InvalidPacketSize` beyond [`PACKET_CAPACITY`].
    pub fn new(data: &[u8], dest_addr: u8) -> Result<Self> {
        let data = heapless::Vec::from_slice(data)
            .map_err(|_| Error::InvalidPacketSize)?;
        Ok(Self {
            data,
            dest_addr,
            state: PacketState::Valid,
            deadline: None,
        })
    }

    /// Packet contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Valid length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for a zero length packet
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sets or clears the processing deadline
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Processing deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Checks that the packet may be processed.
    ///
    /// Consumers must call this before looking at the payload.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::PacketExpired);
        }
        match self.state {
            PacketState::Valid => Ok(()),
            PacketState::Overflow => Err(Error::PacketOverflow),
            PacketState::RxError => Err(Error::RxFailed),
            PacketState::Nack | PacketState::NoResponse => {
                Err(Error::InvalidPacketState)
            }
        }
    }
}

/// A logical message, possibly spanning several packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message payload, not including the type byte
    pub data: Vec<u8>,
    /// Bus address of the peer
    pub dest_addr: u8,
    /// Payload bytes per packet. Zero uses the channel maximum.
    pub pkt_size: usize,
    /// Remote endpoint. The destination when sending, the source when received.
    pub eid: Eid,
    /// Message type
    pub typ: MsgType,
    /// Message tag
    pub tag: Tag,
}

impl Message {
    /// Creates a message using the channel's maximum packet size
    pub fn new(
        typ: MsgType,
        eid: Eid,
        tag: Tag,
        dest_addr: u8,
        data: Vec<u8>,
    ) -> Self {
        Self {
            data,
            dest_addr,
            pkt_size: 0,
            eid,
            typ,
            tag,
        }
    }

    /// Clears the payload so the buffer can be reused
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Result of [`Transport::receive_packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Full length of the received packet. May be larger than the
    /// buffer passed in, in which case the contents were truncated.
    pub len: usize,
    /// Bus address of the sender
    pub src_addr: u8,
}

/// A packet transport medium.
///
/// Both methods take `&self`: a channel may have one thread blocked in
/// `receive_packet` while another sends. Senders are serialized by the
/// [`CmdChannel`], receivers are expected to be a single thread.
pub trait Transport: Send + Sync {
    /// Hands one packet to the medium.
    ///
    /// Success does not imply the packet is on the wire.
    fn send_packet(&self, data: &[u8], dest_addr: u8) -> Result<()>;

    /// Waits for one packet, copying it into `buf`.
    fn receive_packet(&self, buf: &mut [u8], timeout: Timeout)
        -> Result<Received>;
}

/// Receives reassembled messages from [`CmdChannel::receive_and_process`].
pub trait Dispatch {
    /// Error returned by the dispatcher. Channel errors convert into it.
    type Error: From<Error>;

    /// Handles a complete message, taking ownership of its buffer.
    fn dispatch(
        &mut self,
        message: Message,
    ) -> core::result::Result<(), Self::Error>;
}

const FLAG_SOM: u8 = 0x80;
const FLAG_EOM: u8 = 0x40;
const SEQ_SHIFT: u8 = 4;
const FLAG_TO: u8 = 0x08;

/// Transport header at the start of each packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub dest: Eid,
    pub src: Eid,
    pub som: bool,
    pub eom: bool,
    pub seq: u8,
    pub tag: Tag,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut flags =
            (self.seq & SEQ_MASK) << SEQ_SHIFT | (self.tag.tag().0 & TAG_MAX);
        if self.som {
            flags |= FLAG_SOM;
        }
        if self.eom {
            flags |= FLAG_EOM;
        }
        if self.tag.is_owner() {
            flags |= FLAG_TO;
        }
        [HEADER_VERSION_1, self.dest.0, self.src.0, flags]
    }

    pub fn decode(packet: &[u8]) -> Result<Self> {
        let Some(&[ver, dest, src, flags]) = packet.get(..HEADER_LEN) else {
            return Err(Error::InvalidPacketSize);
        };

        if ver & 0x0f != HEADER_VERSION_1 {
            return Err(Error::InvalidPacketState);
        }

        let tv = TagValue(flags & TAG_MAX);
        let tag = if flags & FLAG_TO != 0 {
            Tag::Owned(tv)
        } else {
            Tag::Unowned(tv)
        };

        Ok(Self {
            dest: Eid(dest),
            src: Eid(src),
            som: flags & FLAG_SOM != 0,
            eom: flags & FLAG_EOM != 0,
            seq: (flags >> SEQ_SHIFT) & SEQ_MASK,
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_millis() {
        assert_eq!(Timeout::from_millis(-1), Timeout::Forever);
        assert_eq!(Timeout::from_millis(0), Timeout::Poll);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::After(Duration::from_millis(250))
        );
    }

    #[test]
    fn deadline_final_poll() {
        let mut d = Timeout::Poll.start();
        assert_eq!(d.remaining(), Some(Timeout::Poll));
        assert_eq!(d.remaining(), None);

        let mut d = Timeout::Forever.start();
        assert_eq!(d.remaining(), Some(Timeout::Forever));
    }

    #[test]
    fn deadline_far_future() {
        let mut d = Timeout::After(Duration::MAX).start();
        assert_eq!(d.remaining(), Some(Timeout::Forever));
    }

    #[test]
    fn header_fields() {
        let h = Header {
            dest: Eid(9),
            src: Eid(8),
            som: true,
            eom: false,
            seq: 3,
            tag: Tag::Owned(TagValue(5)),
        };
        let b = h.encode();
        assert_eq!(b, [1, 9, 8, 0x80 | 0x30 | 0x08 | 5]);
        assert_eq!(Header::decode(&b).unwrap(), h);

        assert_eq!(Header::decode(&b[..3]), Err(Error::InvalidPacketSize));
        assert_eq!(
            Header::decode(&[2, 9, 8, 0]),
            Err(Error::InvalidPacketState)
        );
    }

    #[test]
    fn packet_checks() {
        let mut p = Packet::new(&[1, 2, 3], 0x10).unwrap();
        assert!(p.check().is_ok());

        p.state = PacketState::Overflow;
        assert_eq!(p.check(), Err(Error::PacketOverflow));

        p.state = PacketState::Valid;
        p.set_deadline(Some(Instant::now() - Duration::from_millis(1)));
        assert!(p.is_expired());
        assert_eq!(p.check(), Err(Error::PacketExpired));

        assert_eq!(
            Packet::new(&[0u8; PACKET_CAPACITY + 1], 0).unwrap_err(),
            Error::InvalidPacketSize
        );
    }
}
