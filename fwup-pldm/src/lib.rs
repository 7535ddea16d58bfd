// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM base message definitions.
 *
 * Copyright (c) 2025 Code Construct
 */

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Platform Level Data Model (PLDM) message codec for firmware update
//!
//! This crate implements the base PLDM header and completion codes, plus
//! typed encoders and decoders for the PLDM for Firmware Update (type 5)
//! commands. It performs no I/O; callers move the encoded bytes over a
//! packet channel.

use core::fmt;

use nom::error::ErrorKind;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

mod buf;
pub mod fw;

pub use buf::MsgBuf;
pub use fw::*;

/// Maximum size of a PLDM message, defining buffer limits.
pub const PLDM_MAX_MSGSIZE: usize = 4096;

/// Length of a request header
pub const PLDM_REQ_HEADER_LEN: usize = 3;
/// Length of a response header, including the completion code
pub const PLDM_RSP_HEADER_LEN: usize = 4;

const HDR_RQ: u8 = 0x80;
const HDR_D: u8 = 0x40;
const IID_MASK: u8 = 0x1f;
const TYPE_MASK: u8 = 0x3f;

/// Generic PLDM error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PldmError {
    /// PLDM protocol error
    #[error("PLDM protocol error: {0}")]
    Protocol(String),
    /// Message ended before a complete structure was parsed
    #[error("Truncated PLDM {0}")]
    Truncated(&'static str),
    /// Message content could not be parsed, or had trailing bytes
    #[error("Malformed PLDM {0}")]
    Malformed(&'static str),
    /// Encoded message exceeded its buffer
    #[error("No space in message buffer")]
    NoSpace,
    /// Invalid argument
    #[error("Invalid argument")]
    InvalidArgument,
}

/// Create a `PldmError::Protocol` from a message and optional description.
///
/// Arguments are passed through `format!`.
#[macro_export]
macro_rules! proto_error {
    ($msg: expr, $desc_str: expr) => {
        $crate::PldmError::Protocol(format!("{}: {}", $msg, $desc_str))
    };
    ($msg: expr) => {
        $crate::PldmError::Protocol(format!("{}", $msg))
    };
}

/// PLDM protocol return type
pub type Result<T> = core::result::Result<T, PldmError>;

/// nom parser result
pub type VResult<I, O> = nom::IResult<I, O>;

/// Base PLDM completion codes
#[repr(u8)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum CCode {
    SUCCESS = 0,
    ERROR = 1,
    ERROR_INVALID_DATA = 2,
    ERROR_INVALID_LENGTH = 3,
    ERROR_NOT_READY = 4,
    ERROR_UNSUPPORTED_PLDM_CMD = 5,
    ERROR_INVALID_PLDM_TYPE = 32,
}

/// A completion code as carried on the wire.
///
/// Holds either a [`CCode`] or a firmware update [`FwCode`], and compares
/// equal to either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    /// `SUCCESS`
    pub const SUCCESS: Self = Self(CCode::SUCCESS as u8);

    /// Returns `true` for `SUCCESS`
    pub fn is_success(&self) -> bool {
        self.0 == CCode::SUCCESS as u8
    }
}

impl From<CCode> for CompletionCode {
    fn from(cc: CCode) -> Self {
        Self(cc as u8)
    }
}

impl From<FwCode> for CompletionCode {
    fn from(cc: FwCode) -> Self {
        Self(cc as u8)
    }
}

impl From<CompletionCode> for u8 {
    fn from(cc: CompletionCode) -> u8 {
        cc.0
    }
}

impl PartialEq<CCode> for CompletionCode {
    fn eq(&self, other: &CCode) -> bool {
        self.0 == *other as u8
    }
}

impl PartialEq<FwCode> for CompletionCode {
    fn eq(&self, other: &FwCode) -> bool {
        self.0 == *other as u8
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(c) = CCode::from_u8(self.0) {
            write!(f, "{c:?}")
        } else if let Some(c) = FwCode::from_u8(self.0) {
            write!(f, "{c:?}")
        } else {
            write!(f, "0x{:02x}", self.0)
        }
    }
}

/// Base PLDM request type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PldmRequest {
    /// PLDM Instance ID
    pub iid: u8,
    /// PLDM type.
    pub typ: u8,
    /// PLDM command code
    pub cmd: u8,
    /// PLDM command data payload
    pub data: Vec<u8>,
}

impl PldmRequest {
    /// Create a new PLDM request for a given PLDM message type and command
    /// number.
    pub fn new(typ: u8, cmd: u8) -> Self {
        Self::new_data(typ, cmd, Vec::new())
    }

    /// Create a new PLDM request with a data payload.
    pub fn new_data(typ: u8, cmd: u8, data: Vec<u8>) -> Self {
        Self {
            iid: 0,
            typ,
            cmd,
            data,
        }
    }

    /// Parse a PLDM request from a complete message.
    pub fn from_buf(buf: &[u8]) -> Result<Self> {
        let Some((hdr, data)) = buf.split_first_chunk::<PLDM_REQ_HEADER_LEN>()
        else {
            return Err(PldmError::Truncated("request header"));
        };
        if hdr[0] & HDR_RQ == 0 {
            return Err(PldmError::Malformed("request header"));
        }

        Ok(Self {
            iid: hdr[0] & IID_MASK,
            typ: hdr[1] & TYPE_MASK,
            cmd: hdr[2],
            data: data.to_vec(),
        })
    }

    /// Encode the request, header included.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(PLDM_REQ_HEADER_LEN + self.data.len());
        v.push(HDR_RQ | (self.iid & IID_MASK));
        v.push(self.typ & TYPE_MASK);
        v.push(self.cmd);
        v.extend_from_slice(&self.data);
        v
    }

    /// Create a successful response with the instance, type and command of
    /// this request.
    pub fn response(&self) -> PldmResponse {
        PldmResponse {
            iid: self.iid,
            typ: self.typ,
            cmd: self.cmd,
            cc: 0,
            data: Vec::new(),
        }
    }

    /// Create a data-less response with the given completion code.
    pub fn response_cc(&self, cc: impl Into<CompletionCode>) -> PldmResponse {
        let mut rsp = self.response();
        rsp.cc = cc.into().0;
        rsp
    }
}

/// Base PLDM response type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PldmResponse {
    /// PLDM Instance ID
    pub iid: u8,
    /// PLDM type
    pub typ: u8,
    /// PLDM command code, as in the request
    pub cmd: u8,
    /// PLDM completion code
    pub cc: u8,
    /// PLDM response data payload. Does not include the cc field.
    pub data: Vec<u8>,
}

impl PldmResponse {
    /// Parse a PLDM response from a complete message.
    pub fn from_buf(buf: &[u8]) -> Result<Self> {
        let Some((hdr, data)) = buf.split_first_chunk::<PLDM_RSP_HEADER_LEN>()
        else {
            return Err(PldmError::Truncated("response header"));
        };
        if hdr[0] & HDR_RQ != 0 {
            return Err(PldmError::Malformed("response header"));
        }

        Ok(Self {
            iid: hdr[0] & IID_MASK,
            typ: hdr[1] & TYPE_MASK,
            cmd: hdr[2],
            cc: hdr[3],
            data: data.to_vec(),
        })
    }

    /// Encode the response, header and completion code included.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(PLDM_RSP_HEADER_LEN + self.data.len());
        v.push(self.iid & IID_MASK);
        v.push(self.typ & TYPE_MASK);
        v.push(self.cmd);
        v.push(self.cc);
        v.extend_from_slice(&self.data);
        v
    }

    /// Completion code of this response
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode(self.cc)
    }

    /// Set the response payload
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }
}

/// Returns `true` when `buf` holds a PLDM request rather than a response.
///
/// Datagram (unacknowledged) messages are treated as requests.
pub fn is_request(buf: &[u8]) -> bool {
    buf.first().is_some_and(|b| b & (HDR_RQ | HDR_D) != 0)
}

/// Run `parser` over a complete message body.
///
/// Input that ends early gives `Truncated`, any other parse failure or
/// unconsumed trailing input gives `Malformed`. `what` names the
/// structure in the error.
pub fn decode<'a, O, F>(what: &'static str, buf: &'a [u8], mut parser: F) -> Result<O>
where
    F: FnMut(&'a [u8]) -> VResult<&'a [u8], O>,
{
    match parser(buf) {
        Ok((rest, o)) if rest.is_empty() => Ok(o),
        Ok((rest, _)) => {
            log::trace!("{what}: {} trailing bytes", rest.len());
            Err(PldmError::Malformed(what))
        }
        Err(nom::Err::Incomplete(_)) => Err(PldmError::Truncated(what)),
        Err(nom::Err::Error(e) | nom::Err::Failure(e))
            if e.code == ErrorKind::Eof =>
        {
            Err(PldmError::Truncated(what))
        }
        Err(_) => Err(PldmError::Malformed(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::number::complete::{le_u16, le_u8};
    use nom::sequence::tuple;

    #[test]
    fn request_header() {
        let mut req = PldmRequest::new_data(PLDM_TYPE_FW, 0x10, vec![1, 2]);
        req.iid = 0x25;
        let b = req.to_vec();
        assert_eq!(b, [0x85, 0x05, 0x10, 1, 2]);
        assert!(is_request(&b));

        let r = PldmRequest::from_buf(&b).unwrap();
        assert_eq!(r.iid, 5);
        assert_eq!(r.data, [1, 2]);

        assert_eq!(
            PldmRequest::from_buf(&b[..2]),
            Err(PldmError::Truncated("request header"))
        );
    }

    #[test]
    fn response_header() {
        let mut rsp = PldmRequest::new(PLDM_TYPE_FW, 0x13)
            .response_cc(FwCode::NOT_IN_UPDATE_MODE);
        rsp.iid = 3;
        let b = rsp.to_vec();
        assert_eq!(b, [0x03, 0x05, 0x13, 0x80]);
        assert!(!is_request(&b));

        let r = PldmResponse::from_buf(&b).unwrap();
        assert_eq!(r.completion_code(), FwCode::NOT_IN_UPDATE_MODE);
        assert!(r.data.is_empty());

        // a request is not a response
        assert!(PldmResponse::from_buf(&[0x80, 5, 1, 0]).is_err());
    }

    #[test]
    fn completion_code_display() {
        assert_eq!(CompletionCode(0).to_string(), "SUCCESS");
        assert_eq!(CompletionCode(0x8e).to_string(), "RETRY_REQUEST_UPDATE");
        assert_eq!(CompletionCode(0x7f).to_string(), "0x7f");
        assert!(CompletionCode::SUCCESS.is_success());
        assert_eq!(CompletionCode(2), CCode::ERROR_INVALID_DATA);
    }

    #[test]
    fn decode_errors() {
        fn p(b: &[u8]) -> VResult<&[u8], (u8, u16)> {
            tuple((le_u8, le_u16))(b)
        }
        assert_eq!(decode("x", &[1, 2, 3], p), Ok((1, 0x0302)));
        assert_eq!(decode("x", &[1, 2], p), Err(PldmError::Truncated("x")));
        assert_eq!(decode("x", &[1, 2, 3, 4], p), Err(PldmError::Malformed("x")));
    }

    #[test]
    fn proto_error_macro() {
        let e = proto_error!("bad thing", 3);
        assert_eq!(e, PldmError::Protocol("bad thing: 3".into()));
    }
}
