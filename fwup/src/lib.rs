// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! PLDM firmware update over a packet command channel.
//!
//! [`Session`] is the update agent state machine: it decides which
//! command to issue next, interprets responses and serves the data the
//! device pulls. [`Responder`] is the firmware device side, answering
//! those commands on behalf of a [`Device`]. The [`driver`] module binds
//! either to a [`fwup_channel::CmdChannel`].

use thiserror::Error;

use fwup_pldm::{Cmd, CompletionCode, PldmError};

pub mod driver;
pub mod responder;
pub mod session;
pub mod transfer;

pub use responder::{
    ActivateResult, CommandError, ComponentDetails, Device, Responder,
    UpdatePolicy,
};
pub use session::{
    Action, Command, ComponentImage, Session, SessionConfig, SessionState,
    UpdatePlan,
};
pub use transfer::{Transfer, TransferError, TransferKind};

/// Firmware update error
#[derive(Error, Debug)]
pub enum FwupError {
    /// Transport failure
    #[error("Channel error: {0}")]
    Channel(#[from] fwup_channel::Error),
    /// Message could not be encoded or decoded
    #[error("PLDM error: {0}")]
    Pldm(#[from] PldmError),
    /// Multipart transfer failure
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    /// The peer completed a command with an error
    #[error("{0:?} failed: {1}")]
    Command(Cmd, CompletionCode),
    /// Command is not legal in the current state
    #[error("Command not valid in state {0:?}")]
    InvalidState(SessionState),
    /// A response that doesn't match the outstanding request
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    /// The peer refused to start an update
    #[error("Update aborted: {0}")]
    Aborted(CompletionCode),
    /// A buffer could not be allocated within limits
    #[error("Resource error: {0}")]
    Resource(String),
    /// No component was updated, nothing to activate
    #[error("No components were updated")]
    NothingUpdated,
    /// Bad argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Firmware update result type
pub type Result<T> = core::result::Result<T, FwupError>;
