// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * TCP stream transport.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Packet transport over a TCP stream.
//!
//! Each packet is sent as a frame: a little-endian 16-bit length, the
//! sender's bus address, then the packet contents.
//!
//! ```no_run
//! use fwup_channel::{tcp::TcpTransport, ChannelConfig, CmdChannel};
//!
//! let t = TcpTransport::connect(fwup_channel::tcp::DEFAULT_ADDR, 0x10)?;
//! let chan = CmdChannel::new(t, ChannelConfig::default())?;
//! # Ok::<(), fwup_channel::Error>(())
//! ```

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use crate::{Error, MediumError, Received, Result, Timeout, Transport};

/// Default address for [`TcpTransport::connect`] and [`TcpTransport::bind`]
pub const DEFAULT_ADDR: &str = "127.0.0.1:5000";

/// Limit for reading the rest of a frame once its first byte arrives
const FRAME_TIMEOUT: Duration = Duration::from_secs(1);

const FRAME_HEADER_LEN: usize = 3;

/// A connected TCP stream carrying framed packets.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    addr: u8,
    rx_lock: Mutex<()>,
}

/// Maps an I/O failure onto the medium error taxonomy.
///
/// `context` is used when the error kind gives no better indication.
fn medium_error(e: &io::Error, context: MediumError) -> MediumError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => MediumError::Timeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => MediumError::Connect,
        ErrorKind::AddrInUse => MediumError::Bind,
        ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => {
            MediumError::Address
        }
        _ => context,
    }
}

fn rx_error(e: io::Error) -> Error {
    match medium_error(&e, MediumError::Receive) {
        MediumError::Timeout => Error::RxTimeout,
        m => {
            debug!("tcp receive: {e}");
            Error::Medium(m)
        }
    }
}

// Once part of a frame has been read, the stream can't be resynchronised
fn frame_error(e: io::Error) -> Error {
    debug!("tcp receive mid-frame: {e}");
    match medium_error(&e, MediumError::Receive) {
        MediumError::Timeout => Error::Medium(MediumError::Receive),
        m => Error::Medium(m),
    }
}

fn tx_error(e: io::Error) -> Error {
    match medium_error(&e, MediumError::Send) {
        MediumError::Timeout => Error::TxTimeout,
        m => {
            debug!("tcp send: {e}");
            Error::Medium(m)
        }
    }
}

impl TcpTransport {
    /// Connects to a listening peer. `addr` is our own bus address.
    pub fn connect(peer: impl ToSocketAddrs, addr: u8) -> Result<Self> {
        let stream = TcpStream::connect(peer)
            .map_err(|e| Error::Medium(medium_error(&e, MediumError::Connect)))?;
        Self::from_stream(stream, addr)
    }

    /// Binds a listener, for use with [`accept`](Self::accept).
    pub fn bind(local: impl ToSocketAddrs) -> Result<TcpListener> {
        TcpListener::bind(local)
            .map_err(|e| Error::Medium(medium_error(&e, MediumError::Bind)))
    }

    /// Waits for one peer to connect.
    pub fn accept(listener: &TcpListener, addr: u8) -> Result<Self> {
        let (stream, peer) = listener
            .accept()
            .map_err(|e| Error::Medium(medium_error(&e, MediumError::Connect)))?;
        debug!("tcp peer connected from {peer}");
        Self::from_stream(stream, addr)
    }

    /// Wraps an already connected stream
    pub fn from_stream(stream: TcpStream, addr: u8) -> Result<Self> {
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Medium(medium_error(&e, MediumError::Init)))?;
        Ok(Self {
            stream,
            addr,
            rx_lock: Mutex::new(()),
        })
    }

    /// Bus address of this end
    pub fn addr(&self) -> u8 {
        self.addr
    }

    fn set_read_timeout(&self, timeout: Timeout) -> Result<()> {
        let t = match timeout {
            Timeout::Forever => None,
            // zero is rejected by the socket layer
            Timeout::Poll => Some(Duration::from_micros(1)),
            Timeout::After(d) if d.is_zero() => Some(Duration::from_micros(1)),
            Timeout::After(d) => Some(d),
        };
        self.stream
            .set_read_timeout(t)
            .map_err(|e| Error::Medium(medium_error(&e, MediumError::Select)))
    }
}

impl Transport for TcpTransport {
    fn send_packet(&self, data: &[u8], _dest_addr: u8) -> Result<()> {
        let len = u16::try_from(data.len()).map_err(|_| Error::InvalidPacketSize)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.push(self.addr);
        frame.extend_from_slice(data);

        (&self.stream).write_all(&frame).map_err(tx_error)
    }

    fn receive_packet(
        &self,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> Result<Received> {
        let _guard = self.rx_lock.lock().map_err(|_| Error::RxFailed)?;
        let mut stream = &self.stream;

        self.set_read_timeout(timeout)?;
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        let n = stream.read(&mut hdr).map_err(rx_error)?;
        if n == 0 {
            debug!("tcp peer closed");
            return Err(Error::Medium(MediumError::Connect));
        }

        self.set_read_timeout(Timeout::After(FRAME_TIMEOUT))?;
        stream.read_exact(&mut hdr[n..]).map_err(frame_error)?;

        let len = u16::from_le_bytes([hdr[0], hdr[1]]) as usize;
        let src_addr = hdr[2];

        let l = len.min(buf.len());
        stream.read_exact(&mut buf[..l]).map_err(frame_error)?;
        if len > l {
            // drain the remainder so the stream stays framed
            let mut rest = vec![0u8; len - l];
            stream.read_exact(&mut rest).map_err(frame_error)?;
        }

        Ok(Received { len, src_addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> (TcpTransport, TcpTransport) {
        let l = TcpTransport::bind("127.0.0.1:0").unwrap();
        let local = l.local_addr().unwrap();
        let t = std::thread::spawn(move || TcpTransport::accept(&l, 0x20));
        let c = TcpTransport::connect(local, 0x10).unwrap();
        let s = t.join().unwrap().unwrap();
        (c, s)
    }

    #[test]
    fn frames() {
        let (c, s) = connected();
        c.send_packet(&[1, 2, 3, 4], 0x20).unwrap();
        c.send_packet(&[5; 10], 0x20).unwrap();

        let mut buf = [0u8; 8];
        let r = s.receive_packet(&mut buf, Timeout::from_millis(2000)).unwrap();
        assert_eq!(r, Received { len: 4, src_addr: 0x10 });
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);

        // truncated, but the following frame stays aligned
        let r = s.receive_packet(&mut buf, Timeout::from_millis(2000)).unwrap();
        assert_eq!(r.len, 10);
        assert_eq!(buf, [5; 8]);

        s.send_packet(&[7], 0x10).unwrap();
        let r = c.receive_packet(&mut buf, Timeout::Forever).unwrap();
        assert_eq!(r, Received { len: 1, src_addr: 0x20 });
    }

    #[test]
    fn poll_timeout() {
        let (c, _s) = connected();
        let mut buf = [0u8; 8];
        assert_eq!(
            c.receive_packet(&mut buf, Timeout::Poll),
            Err(Error::RxTimeout)
        );
    }

    #[test]
    fn peer_closed() {
        let (c, s) = connected();
        drop(s);
        let mut buf = [0u8; 8];
        assert_eq!(
            c.receive_packet(&mut buf, Timeout::from_millis(2000)),
            Err(Error::Medium(MediumError::Connect))
        );
    }

    #[test]
    fn error_mapping() {
        let e = io::Error::from(ErrorKind::AddrInUse);
        assert_eq!(medium_error(&e, MediumError::Init), MediumError::Bind);
        let e = io::Error::from(ErrorKind::Other);
        assert_eq!(medium_error(&e, MediumError::Send), MediumError::Send);
        assert_eq!(rx_error(ErrorKind::WouldBlock.into()), Error::RxTimeout);
        assert_eq!(tx_error(ErrorKind::TimedOut.into()), Error::TxTimeout);
    }

    #[test]
    fn stalled_frame() {
        let l = TcpTransport::bind("127.0.0.1:0").unwrap();
        let local = l.local_addr().unwrap();
        let t = std::thread::spawn(move || TcpTransport::accept(&l, 0x20));
        let mut raw = TcpStream::connect(local).unwrap();
        let s = t.join().unwrap().unwrap();

        // first header byte, then nothing for longer than the frame limit
        raw.write_all(&[3]).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            s.receive_packet(&mut buf, Timeout::from_millis(2000)),
            Err(Error::Medium(MediumError::Receive))
        );
    }

    #[test]
    fn split_frame() {
        let l = TcpTransport::bind("127.0.0.1:0").unwrap();
        let local = l.local_addr().unwrap();
        let t = std::thread::spawn(move || TcpTransport::accept(&l, 0x20));
        let mut raw = TcpStream::connect(local).unwrap();
        let s = t.join().unwrap().unwrap();

        let w = std::thread::spawn(move || {
            raw.write_all(&[3]).unwrap();
            std::thread::sleep(Duration::from_millis(300));
            raw.write_all(&[0, 0x10, 1, 2, 3]).unwrap();
            raw.write_all(&[2, 0, 0x10, 9, 9]).unwrap();
            raw
        });

        let mut buf = [0u8; 8];
        let r = s.receive_packet(&mut buf, Timeout::from_millis(2000)).unwrap();
        assert_eq!(r, Received { len: 3, src_addr: 0x10 });
        assert_eq!(&buf[..3], &[1, 2, 3]);
        let r = s.receive_packet(&mut buf, Timeout::from_millis(2000)).unwrap();
        assert_eq!(r, Received { len: 2, src_addr: 0x10 });
        assert_eq!(&buf[..2], &[9, 9]);
        let _raw = w.join().unwrap();
    }

    #[test]
    fn refused() {
        // bind then drop to find a closed port
        let l = TcpTransport::bind("127.0.0.1:0").unwrap();
        let addr = l.local_addr().unwrap();
        drop(l);
        assert_eq!(
            TcpTransport::connect(addr, 1).unwrap_err(),
            Error::Medium(MediumError::Connect)
        );
    }
}
