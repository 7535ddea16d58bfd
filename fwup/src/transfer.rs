// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Multipart transfers.
//!
//! Package data (GetPackageData) and device metadata (GetDeviceMetaData)
//! are both moved in portions using the same handle and flag scheme. A
//! [`Transfer`] tracks one such flow, from either end. The data transfer
//! handle is the byte offset of the next portion.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

use fwup_pldm::{
    CCode, Cmd, CompletionCode, FwCode, MultipartRequest, MultipartResponse,
    TransferFlag, TransferOperationFlag,
};

/// The data flow a [`Transfer`] carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Package data, pulled by the device
    PackageData,
    /// Device metadata, pulled by the update agent
    DeviceMetaData,
}

impl TransferKind {
    /// Command carrying this flow
    pub fn cmd(&self) -> Cmd {
        match self {
            Self::PackageData => Cmd::GetPackageData,
            Self::DeviceMetaData => Cmd::GetDeviceMetaData,
        }
    }

    /// Completion code when there is nothing to transfer
    pub fn no_data_code(&self) -> FwCode {
        match self {
            Self::PackageData => FwCode::NO_PACKAGE_DATA,
            Self::DeviceMetaData => FwCode::NO_DEVICE_METADATA,
        }
    }
}

/// Multipart transfer failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The source is empty
    #[error("No {0:?} available")]
    NoDataAvailable(TransferKind),
    /// GetFirstPart while in progress, GetNextPart while idle, or an
    /// unknown operation
    #[error("Invalid transfer operation flag")]
    InvalidTransferOperationFlag,
    /// A handle that doesn't continue the transfer
    #[error("Invalid data transfer handle {got}, expected {expected}")]
    InvalidDataTransferHandle {
        /// Handle received
        got: u32,
        /// Handle expected
        expected: u32,
    },
    /// A transfer flag out of sequence
    #[error("Unexpected transfer flag {0:?}")]
    UnexpectedTransferFlag(TransferFlag),
    /// Transferred data disagrees with the advertised size
    #[error("Transfer length mismatch, expected {expected} got {got}")]
    LengthMismatch {
        /// Advertised total size
        expected: usize,
        /// Length reached
        got: usize,
    },
}

impl TransferError {
    /// Completion code reported to the peer for this error
    pub fn completion_code(&self) -> CompletionCode {
        match self {
            Self::NoDataAvailable(kind) => kind.no_data_code().into(),
            Self::InvalidTransferOperationFlag => {
                FwCode::INVALID_TRANSFER_OPERATION_FLAG.into()
            }
            Self::InvalidDataTransferHandle { .. } => {
                FwCode::INVALID_TRANSFER_HANDLE.into()
            }
            Self::UnexpectedTransferFlag(_) => CCode::ERROR_INVALID_DATA.into(),
            Self::LengthMismatch { .. } => {
                FwCode::INVALID_TRANSFER_LENGTH.into()
            }
        }
    }
}

type Result<T> = core::result::Result<T, TransferError>;

/// Progress of one multipart transfer
#[derive(Debug, Clone)]
pub struct Transfer {
    kind: TransferKind,
    total_size: usize,
    last_handle: u32,
    in_progress: bool,
}

impl Transfer {
    /// Creates an idle transfer
    pub fn new(kind: TransferKind, total_size: usize) -> Self {
        Self {
            kind,
            total_size,
            last_handle: 0,
            in_progress: false,
        }
    }

    /// Data flow of this transfer
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Total bytes to transfer
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Sets the total, for a requester once the size is known
    pub fn set_total_size(&mut self, total_size: usize) {
        self.total_size = total_size;
    }

    /// Handle of the next portion
    pub fn last_handle(&self) -> u32 {
        self.last_handle
    }

    /// Returns `true` between the first and last portions
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Returns `true` once all data has moved
    pub fn is_complete(&self) -> bool {
        !self.in_progress
            && self.total_size > 0
            && self.last_handle as usize == self.total_size
    }

    /// Returns to idle, the next transfer starts from the beginning
    pub fn reset(&mut self) {
        self.last_handle = 0;
        self.in_progress = false;
    }

    /// Requester: the next request to send
    pub fn next_request(&self) -> MultipartRequest {
        if self.in_progress {
            MultipartRequest::new(
                TransferOperationFlag::GetNextPart,
                self.last_handle,
            )
        } else {
            MultipartRequest::new(TransferOperationFlag::GetFirstPart, 0)
        }
    }

    /// Requester: accepts a response, writing its portion into `out`.
    ///
    /// Returns `true` when the transfer has completed. On error the
    /// transfer is left unchanged.
    pub fn accept(
        &mut self,
        rsp: &MultipartResponse,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        let offset = match (rsp.flag, self.in_progress) {
            (TransferFlag::Start | TransferFlag::StartAndEnd, false) => 0,
            (TransferFlag::Middle | TransferFlag::End, true) => {
                self.last_handle as usize
            }
            (flag, _) => {
                debug!("{:?} flag {flag:?} out of sequence", self.kind);
                return Err(TransferError::UnexpectedTransferFlag(flag));
            }
        };

        if offset > out.len() {
            return Err(TransferError::InvalidDataTransferHandle {
                got: self.last_handle,
                expected: out.len() as u32,
            });
        }

        let end = offset + rsp.portion.len();
        if end > self.total_size || (rsp.flag.is_end() && end != self.total_size)
        {
            return Err(TransferError::LengthMismatch {
                expected: self.total_size,
                got: end,
            });
        }

        out.truncate(offset);
        out.extend_from_slice(&rsp.portion);

        self.last_handle = rsp.next_handle;
        self.in_progress = !rsp.flag.is_end();
        trace!(
            "{:?} accepted {} at {offset}, flag {:?}",
            self.kind,
            rsp.portion.len(),
            rsp.flag
        );
        Ok(!self.in_progress)
    }

    /// Responder: serves the next portion of `source`, at most
    /// `portion_size` bytes.
    pub fn serve(
        &mut self,
        req: &MultipartRequest,
        source: &[u8],
        portion_size: usize,
    ) -> Result<MultipartResponse> {
        if source.is_empty() {
            return Err(TransferError::NoDataAvailable(self.kind));
        }

        match req.op() {
            Some(TransferOperationFlag::GetFirstPart) => {
                if self.in_progress {
                    debug!("{:?} GetFirstPart while in progress", self.kind);
                    return Err(TransferError::InvalidTransferOperationFlag);
                }
                // handle is ignored for the first part
                self.last_handle = 0;
                self.total_size = source.len();
            }
            Some(TransferOperationFlag::GetNextPart) => {
                if !self.in_progress {
                    debug!("{:?} GetNextPart while idle", self.kind);
                    return Err(TransferError::InvalidTransferOperationFlag);
                }
                if req.handle != self.last_handle {
                    return Err(TransferError::InvalidDataTransferHandle {
                        got: req.handle,
                        expected: self.last_handle,
                    });
                }
            }
            None => return Err(TransferError::InvalidTransferOperationFlag),
        }

        let total = self.total_size.min(source.len());
        let start = self.last_handle as usize;
        if start >= total {
            // source shrank under an ongoing transfer
            self.in_progress = false;
            return Err(TransferError::InvalidDataTransferHandle {
                got: req.handle,
                expected: self.last_handle,
            });
        }
        let portion = portion_size.max(1).min(total.saturating_sub(start));
        let end = start + portion;
        let next_handle =
            u32::try_from(end).map_err(|_| TransferError::LengthMismatch {
                expected: total,
                got: end,
            })?;

        let first = start == 0;
        let last = end == total;
        let flag = match (first, last) {
            (true, true) => TransferFlag::StartAndEnd,
            (true, false) => TransferFlag::Start,
            (false, true) => TransferFlag::End,
            (false, false) => TransferFlag::Middle,
        };

        self.last_handle = next_handle;
        self.in_progress = !last;

        Ok(MultipartResponse {
            next_handle,
            flag,
            portion: source[start..end].to_vec(),
        })
    }
}
