// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Message fragmentation
#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::{Eid, Error, Header, Message, Packet, Result, HEADER_LEN, TAG_MAX};

/// Splits a [`Message`] into packets no larger than `HEADER_LEN + mtu`.
#[derive(Debug)]
pub(crate) struct Fragmenter<'m> {
    msg: &'m Message,
    src: Eid,
    mtu: usize,
    seq: u8,

    first: bool,
    done: bool,

    // Count of payload bytes already emitted
    payload_used: usize,
}

impl<'m> Fragmenter<'m> {
    pub fn new(msg: &'m Message, src: Eid, mtu: usize) -> Result<Self> {
        if msg.tag.tag().0 > TAG_MAX || msg.typ.0 & 0x80 != 0 {
            return Err(Error::InvalidArgument);
        }
        // first packet carries the type byte plus at least one more
        if mtu < 2 {
            return Err(Error::InvalidArgument);
        }

        Ok(Self {
            msg,
            src,
            mtu,
            seq: 0,
            first: true,
            done: false,
            payload_used: 0,
        })
    }

    /// Returns the next packet, or `None` once the message is complete.
    ///
    /// An empty payload still yields a single packet with the type byte.
    pub fn fragment(&mut self) -> Result<Option<Packet>> {
        if self.done {
            return Ok(None);
        }

        let mut out = [0u8; crate::PACKET_CAPACITY];
        let mut room = self.mtu.min(out.len() - HEADER_LEN);
        let mut pos = HEADER_LEN;

        if self.first {
            out[pos] = self.msg.typ.0;
            pos += 1;
            room -= 1;
        }

        let rest = &self.msg.data[self.payload_used..];
        let l = rest.len().min(room);
        out[pos..pos + l].copy_from_slice(&rest[..l]);
        pos += l;
        self.payload_used += l;

        let eom = self.payload_used == self.msg.data.len();
        let header = Header {
            dest: self.msg.eid,
            src: self.src,
            som: self.first,
            eom,
            seq: self.seq,
            tag: self.msg.tag,
        };
        out[..HEADER_LEN].copy_from_slice(&header.encode());

        self.first = false;
        self.done = eom;
        self.seq = (self.seq + 1) & crate::SEQ_MASK;

        Packet::new(&out[..pos], self.msg.dest_addr).map(Some)
    }
}
