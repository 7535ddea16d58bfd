// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Message encoding buffer

use crate::{PldmError, Result, PLDM_MAX_MSGSIZE};

/// An owned output buffer with a size limit.
///
/// Push methods fail with [`PldmError::NoSpace`] rather than growing
/// beyond the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBuf {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for MsgBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgBuf {
    /// Constructs a buffer limited to [`PLDM_MAX_MSGSIZE`]
    pub fn new() -> Self {
        Self::with_limit(PLDM_MAX_MSGSIZE)
    }

    /// Constructs a buffer with a custom limit
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Appends bytes
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining() {
            return Err(PldmError::NoSpace);
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Appends a byte
    pub fn push_le8(&mut self, v: u8) -> Result<()> {
        self.push(&[v])
    }

    /// Appends a little endian `u16`
    pub fn push_le16(&mut self, v: u16) -> Result<()> {
        self.push(&v.to_le_bytes())
    }

    /// Appends a little endian `u32`
    pub fn push_le32(&mut self, v: u32) -> Result<()> {
        self.push(&v.to_le_bytes())
    }

    /// Appends a little endian `u64`
    pub fn push_le64(&mut self, v: u64) -> Result<()> {
        self.push(&v.to_le_bytes())
    }

    /// Returns the number of bytes written
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Space left before the limit
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    /// Discards the contents, keeping the allocation
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// The written bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Takes the written bytes
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}
