// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Message reassembly
#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::{
    Eid, Error, Header, Message, MsgType, Packet, Result, Tag, ADDR_ANY,
    ADDR_NULL, HEADER_LEN, MAX_MESSAGE_SIZE, SEQ_MASK,
};

#[derive(Debug)]
struct Flow {
    peer: Eid,
    tag: Tag,
    typ: MsgType,
    next_seq: u8,
    reply_addr: u8,
    pkt_size: usize,
}

/// Rebuilds messages from received packets.
///
/// One message is reassembled at a time. A new start-of-message packet
/// discards any partial message.
#[derive(Debug)]
pub struct Assembler {
    own_eid: Eid,
    max_message: usize,
    flow: Option<Flow>,
    message: Vec<u8>,
}

impl Assembler {
    /// Creates an assembler for packets addressed to `own_eid`
    pub fn new(own_eid: Eid) -> Self {
        Self::with_limit(own_eid, MAX_MESSAGE_SIZE)
    }

    /// Creates an assembler with a custom message size limit
    pub fn with_limit(own_eid: Eid, max_message: usize) -> Self {
        Self {
            own_eid,
            max_message,
            flow: None,
            message: Vec::new(),
        }
    }

    /// Endpoint ID that packets must be addressed to
    pub fn own_eid(&self) -> Eid {
        self.own_eid
    }

    /// Discards any partial message
    pub fn reset(&mut self) {
        self.flow = None;
        self.message.clear();
    }

    /// Returns `true` while a message is partially received
    pub fn in_progress(&self) -> bool {
        self.flow.is_some()
    }

    fn is_local_dest(&self, dest: Eid) -> bool {
        // Allow NULL EID for physical addressing
        dest == self.own_eid || dest == ADDR_NULL
    }

    /// Receives a packet, returning a message when complete.
    ///
    /// Returns `Ok(None)` when the message is incomplete, or the packet
    /// was addressed to another endpoint.
    pub fn receive(&mut self, packet: &Packet) -> Result<Option<Message>> {
        let data = packet.data();
        let header = Header::decode(data)?;

        if !self.is_local_dest(header.dest) {
            trace!("ignoring packet for eid {}", header.dest);
            return Ok(None);
        }

        let min = HEADER_LEN + header.som as usize;
        if data.len() < min {
            debug!("Short packet");
            return Err(Error::InvalidPacketSize);
        }
        let payload = &data[min..];

        if header.som {
            if header.src == ADDR_ANY {
                return Err(Error::InvalidPacketState);
            }
            if self.flow.is_some() {
                debug!("New SOM restarts reassembly");
            }
            self.message.clear();
            self.flow = Some(Flow {
                peer: header.src,
                tag: header.tag,
                typ: MsgType(data[HEADER_LEN] & 0x7f),
                next_seq: header.seq,
                reply_addr: packet.dest_addr,
                pkt_size: payload.len(),
            });
        }

        let Some(flow) = self.flow.as_mut() else {
            debug!("Packet without SOM");
            return Err(Error::InvalidPacketState);
        };

        if flow.peer != header.src || flow.tag != header.tag {
            debug!(
                "Packet from {} {} doesn't match flow {} {}",
                header.src, header.tag, flow.peer, flow.tag
            );
            return Err(Error::InvalidPacketState);
        }

        if header.seq != flow.next_seq {
            // Bad sequence halts reassembly
            debug!("Bad seq got {} expect {}", header.seq, flow.next_seq);
            self.reset();
            return Err(Error::InvalidPacketState);
        }
        flow.next_seq = (flow.next_seq + 1) & SEQ_MASK;

        if self.message.len() + payload.len() > self.max_message {
            trace!("message too long");
            self.reset();
            return Err(Error::NoMemory);
        }
        self.message.extend_from_slice(payload);

        if !header.eom {
            return Ok(None);
        }

        let Some(flow) = self.flow.take() else {
            return Err(Error::InvalidPacketState);
        };
        let data = core::mem::take(&mut self.message);
        trace!("message reassembly complete, len {}", data.len());

        Ok(Some(Message {
            data,
            dest_addr: flow.reply_addr,
            // type byte shares the first packet
            pkt_size: flow.pkt_size + 1,
            eid: flow.peer,
            typ: flow.typ,
            tag: flow.tag,
        }))
    }
}
