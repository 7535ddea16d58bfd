// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Command channel over a packet transport
#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::fragment::Fragmenter;
use crate::{
    Assembler, Dispatch, Eid, Error, Message, Packet, PacketState, Result,
    Timeout, Transport, HEADER_LEN, PACKET_CAPACITY,
};

/// Settings for a [`CmdChannel`]
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Identifier used in log output
    pub id: i32,
    /// Largest packet accepted or sent, including the transport header
    pub max_packet_size: usize,
    /// Received packets must be processed within this time
    pub packet_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: 0,
            max_packet_size: PACKET_CAPACITY,
            packet_timeout: None,
        }
    }
}

/// A command channel bound to one physical link.
///
/// The channel may be shared between threads. Sends are serialized so
/// that the packets of one message are never interleaved with another.
pub struct CmdChannel<T: Transport> {
    transport: T,
    id: i32,
    max_packet_size: usize,
    packet_timeout: Option<Duration>,
    overflow: AtomicBool,
    send_lock: Mutex<()>,
}

impl<T: Transport> core::fmt::Debug for CmdChannel<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CmdChannel")
            .field("id", &self.id)
            .field("max_packet_size", &self.max_packet_size)
            .field("overflow", &self.is_overflow())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> CmdChannel<T> {
    /// Creates a channel.
    ///
    /// The maximum packet size must leave room for a header and at least
    /// one payload byte, and fit a [`Packet`].
    pub fn new(transport: T, config: ChannelConfig) -> Result<Self> {
        let max = config.max_packet_size;
        if max <= HEADER_LEN + 1 || max > PACKET_CAPACITY {
            return Err(Error::InvalidArgument);
        }
        debug!("channel {} created, max packet {}", config.id, max);

        Ok(Self {
            transport,
            id: config.id,
            max_packet_size: max,
            packet_timeout: config.packet_timeout,
            overflow: AtomicBool::new(false),
            send_lock: Mutex::new(()),
        })
    }

    /// Channel identifier
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Largest packet including header
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Largest payload of a single packet
    pub fn max_payload(&self) -> usize {
        self.max_packet_size - HEADER_LEN
    }

    /// Returns `true` once an oversized packet has been received.
    ///
    /// The flag stays set until [`reset_overflow`](Self::reset_overflow).
    pub fn is_overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Clears the overflow flag
    pub fn reset_overflow(&self) {
        self.overflow.store(false, Ordering::Release);
    }

    /// Checks a packet length against this channel's limits
    pub fn validate_for_send(&self, len: usize) -> Result<()> {
        if len == 0 || len > self.max_packet_size {
            Err(Error::InvalidPacketSize)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.send_lock.lock().map_err(|_| Error::TxFailed)
    }

    /// Sends a single packet.
    ///
    /// The packet must be `Valid` and within the channel's size limit.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        self.validate_for_send(packet.len())?;
        if packet.state != PacketState::Valid {
            return Err(Error::InvalidPacketState);
        }

        let _guard = self.lock()?;
        self.transport.send_packet(packet.data(), packet.dest_addr)
    }

    /// Sends a message, fragmenting as required.
    ///
    /// All packets are built before any is sent, and the channel is held
    /// for the whole message.
    pub fn send_message(&self, message: &Message, src: Eid) -> Result<()> {
        let mtu = match message.pkt_size {
            0 => self.max_payload(),
            n => n.min(self.max_payload()),
        };

        let mut frag = Fragmenter::new(message, src, mtu)?;
        let mut packets = Vec::new();
        while let Some(p) = frag.fragment()? {
            self.validate_for_send(p.len())?;
            packets.push(p);
        }

        trace!(
            "channel {} sending {} bytes to eid {} in {} packets",
            self.id,
            message.data.len(),
            message.eid,
            packets.len()
        );

        let _guard = self.lock()?;
        for p in &packets {
            self.transport.send_packet(p.data(), p.dest_addr)?;
        }
        Ok(())
    }

    /// Waits for a single packet.
    ///
    /// A packet longer than the channel maximum is returned truncated
    /// with `Overflow` state, and sets the overflow flag.
    pub fn receive(&self, timeout: Timeout) -> Result<Packet> {
        let mut buf = [0u8; PACKET_CAPACITY];
        let r = self.transport.receive_packet(&mut buf, timeout)?;

        let len = r.len.min(self.max_packet_size);
        let mut packet = Packet::new(&buf[..len], r.src_addr)?;
        if r.len > self.max_packet_size {
            warn!(
                "channel {} overflow, {} bytes from {:#x}",
                self.id, r.len, r.src_addr
            );
            self.overflow.store(true, Ordering::Release);
            packet.state = PacketState::Overflow;
        }

        packet.set_deadline(
            self.packet_timeout.and_then(|t| Instant::now().checked_add(t)),
        );
        Ok(packet)
    }

    /// Receives one packet and feeds it to `assembler`, passing any
    /// completed message to `dispatch`.
    ///
    /// Returns `Ok(true)` when a message was dispatched.
    pub fn receive_and_process<D: Dispatch>(
        &self,
        assembler: &mut Assembler,
        dispatch: &mut D,
        timeout: Timeout,
    ) -> core::result::Result<bool, D::Error> {
        let packet = self.receive(timeout)?;

        if let Err(e) = packet.check() {
            if e == Error::PacketOverflow {
                assembler.reset();
            }
            return Err(e.into());
        }

        match assembler.receive(&packet)? {
            Some(msg) => {
                dispatch.dispatch(msg)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
