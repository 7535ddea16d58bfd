// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! In-memory transport, connecting two channels in one process.
//!
//! ```
//! use fwup_channel::{loopback, Timeout, Transport};
//!
//! let (a, b) = loopback::pair(0x10, 0x20);
//! a.send_packet(&[1, 2, 3], 0x20).unwrap();
//! let mut buf = [0u8; 8];
//! let r = b.receive_packet(&mut buf, Timeout::Poll).unwrap();
//! assert_eq!(r.len, 3);
//! assert_eq!(r.src_addr, 0x10);
//! ```

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Mutex;

use crate::{Error, Received, Result, Timeout, Transport};

/// One end of an in-memory link, created by [`pair`].
#[derive(Debug)]
pub struct Loopback {
    addr: u8,
    tx: Sender<(u8, Vec<u8>)>,
    rx: Mutex<Receiver<(u8, Vec<u8>)>>,
}

/// Creates two connected transports with the given bus addresses.
pub fn pair(addr_a: u8, addr_b: u8) -> (Loopback, Loopback) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (
        Loopback {
            addr: addr_a,
            tx: tx_a,
            rx: Mutex::new(rx_a),
        },
        Loopback {
            addr: addr_b,
            tx: tx_b,
            rx: Mutex::new(rx_b),
        },
    )
}

impl Loopback {
    /// Bus address of this end
    pub fn addr(&self) -> u8 {
        self.addr
    }
}

impl Transport for Loopback {
    fn send_packet(&self, data: &[u8], _dest_addr: u8) -> Result<()> {
        self.tx
            .send((self.addr, data.to_vec()))
            .map_err(|_| Error::TxFailed)
    }

    fn receive_packet(
        &self,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> Result<Received> {
        let rx = self.rx.lock().map_err(|_| Error::RxFailed)?;
        let (src_addr, data) = match timeout {
            Timeout::Forever => rx.recv().map_err(|_| Error::RxFailed)?,
            Timeout::Poll => rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty => Error::RxTimeout,
                TryRecvError::Disconnected => Error::RxFailed,
            })?,
            Timeout::After(d) => rx.recv_timeout(d).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::RxTimeout,
                RecvTimeoutError::Disconnected => Error::RxFailed,
            })?,
        };

        let l = data.len().min(buf.len());
        buf[..l].copy_from_slice(&data[..l]);
        Ok(Received {
            len: data.len(),
            src_addr,
        })
    }
}
