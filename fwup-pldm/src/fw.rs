// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM for Firmware Update: PLDM type 5 messaging
 *
 * Copyright (c) 2025 Code Construct
 */

//! PLDM type 5 command codes, completion codes and messages.
//!
//! Each message type has a nom `parse` function for its body (the bytes
//! after the PLDM header and completion code) and a `write` function
//! appending the same layout to a [`MsgBuf`].

use core::fmt;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use chrono::Datelike;
use enumset::{EnumSet, EnumSetType};
use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    character::complete::{i32 as c_i32, u32 as c_u32},
    combinator::{all_consuming, map, map_opt, map_parser, map_res, rest, value},
    multi::{count, length_count},
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::{MsgBuf, PldmError, Result, VResult};

/// PLDM type for firmware update
pub const PLDM_TYPE_FW: u8 = 5;

/// Baseline transfer size, the minimum any device must accept
pub const PLDM_FW_BASELINE_TRANSFER: usize = 32;

/// Firmware update command codes
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Cmd {
    QueryDeviceIdentifiers = 0x01,
    GetFirmwareParameters = 0x02,
    RequestUpdate = 0x10,
    GetPackageData = 0x11,
    GetDeviceMetaData = 0x12,
    PassComponentTable = 0x13,
    UpdateComponent = 0x14,
    RequestFirmwareData = 0x15,
    TransferComplete = 0x16,
    VerifyComplete = 0x17,
    ApplyComplete = 0x18,
    GetMetaData = 0x19,
    ActivateFirmware = 0x1A,
    GetStatus = 0x1B,
    CancelUpdateComponent = 0x1C,
    CancelUpdate = 0x1D,
}

/// Firmware update specific completion codes
#[repr(u8)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum FwCode {
    NOT_IN_UPDATE_MODE = 0x80,
    ALREADY_IN_UPDATE_MODE = 0x81,
    DATA_OUT_OF_RANGE = 0x82,
    INVALID_TRANSFER_LENGTH = 0x83,
    INVALID_STATE_FOR_COMMAND = 0x84,
    INCOMPLETE_UPDATE = 0x85,
    BUSY_IN_BACKGROUND = 0x86,
    CANCEL_PENDING = 0x87,
    COMMAND_NOT_EXPECTED = 0x88,
    RETRY_REQUEST_FW_DATA = 0x89,
    UNABLE_TO_INITIATE_UPDATE = 0x8A,
    ACTIVATION_NOT_REQUIRED = 0x8B,
    SELF_CONTAINED_ACTIVATION_NOT_PERMITTED = 0x8C,
    NO_DEVICE_METADATA = 0x8D,
    RETRY_REQUEST_UPDATE = 0x8E,
    NO_PACKAGE_DATA = 0x8F,
    INVALID_TRANSFER_HANDLE = 0x90,
    INVALID_TRANSFER_OPERATION_FLAG = 0x91,
    ACTIVATE_PENDING_IMAGE_NOT_PERMITTED = 0x92,
    PACKAGE_DATA_ERROR = 0x93,
}

/// Firmware device state, as reported by GetStatus
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PldmFDState {
    Idle = 0,
    LearnComponents = 1,
    ReadyXfer = 2,
    Download = 3,
    Verify = 4,
    Apply = 5,
    Activate = 6,
}

impl TryFrom<u8> for PldmFDState {
    type Error = &'static str;
    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Idle),
            1 => Ok(Self::LearnComponents),
            2 => Ok(Self::ReadyXfer),
            3 => Ok(Self::Download),
            4 => Ok(Self::Verify),
            5 => Ok(Self::Apply),
            6 => Ok(Self::Activate),
            _ => Err("unknown state!"),
        }
    }
}

impl PldmFDState {
    /// Parse a single state byte
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map_res(le_u8, TryInto::<PldmFDState>::try_into)(buf)
    }
}

/// Reason for the last transition to Idle
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PldmIdleReason {
    Init = 0,
    Activate = 1,
    Cancel = 2,
    TimeoutLearn = 3,
    TimeoutReadyXfer = 4,
    TimeoutDownload = 5,
    TimeoutVerify = 6,
    TimeoutApply = 7,
}

/// Multipart transfer flag, marking the position of a portion
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TransferFlag {
    Start = 0x01,
    Middle = 0x02,
    End = 0x04,
    StartAndEnd = 0x05,
}

impl TransferFlag {
    /// Flag for item `idx` of `len` items
    pub fn for_index(idx: usize, len: usize) -> Self {
        match (idx == 0, idx + 1 >= len) {
            (true, true) => Self::StartAndEnd,
            (true, false) => Self::Start,
            (false, true) => Self::End,
            (false, false) => Self::Middle,
        }
    }

    /// Returns `true` for `Start` and `StartAndEnd`
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start | Self::StartAndEnd)
    }

    /// Returns `true` for `End` and `StartAndEnd`
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End | Self::StartAndEnd)
    }

    /// Parse a single flag byte
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map_opt(le_u8, Self::from_u8)(buf)
    }
}

/// Multipart transfer operation, selecting the first or next portion
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TransferOperationFlag {
    GetNextPart = 0,
    GetFirstPart = 1,
}

/// Result carried by TransferComplete
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TransferResult {
    Success = 0,
    Corrupt = 1,
    VersionMismatch = 2,
    Aborted = 3,
    Timeout = 9,
    Generic = 0xa,
}

/// Result carried by VerifyComplete
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum VerifyResult {
    Success = 0,
    Failure = 1,
    VersionMismatch = 2,
    FailedFdSecurityChecks = 3,
    IncompleteImage = 4,
    Timeout = 9,
    Generic = 0xa,
}

/// Result carried by ApplyComplete
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ApplyResult {
    Success = 0,
    SuccessModifiedActivation = 1,
    MemoryWriteError = 2,
    Timeout = 9,
    Generic = 0xa,
}

impl ApplyResult {
    /// Both success values
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::SuccessModifiedActivation)
    }
}

macro_rules! result_u8 {
    ($($t:ty),*) => {
        $(impl From<$t> for u8 {
            fn from(r: $t) -> u8 {
                r as u8
            }
        })*
    };
}
result_u8!(TransferResult, VerifyResult, ApplyResult, TransferFlag);

/// Component response codes for PassComponentTable and UpdateComponent
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ComponentResponseCode {
    CanBeUpdated = 0x00,
    ComparisonStampIdentical = 0x01,
    ComparisonStampLower = 0x02,
    InvalidComparisonStamp = 0x03,
    ConflictingClassification = 0x04,
    PrerequisitesNotMet = 0x05,
    NotSupported = 0x06,
    SecurityRestrictions = 0x07,
    IncompleteComponentImageSet = 0x08,
    ActiveImageNotUpdateable = 0x09,
    VersionStringIdentical = 0x0a,
    VersionStringLower = 0x0b,
}

/// A version or vendor string.
///
/// ASCII and UTF-8 strings are held as text, anything else as bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorString {
    /// Text string
    String(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
}

impl fmt::Display for DescriptorString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trim_chars = ['\0', ' '];
        match self {
            Self::String(s) => {
                write!(f, "{}", s.trim_end_matches(&trim_chars).escape_default())
            }
            Self::Bytes(bs) => {
                for b in bs.iter() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl DescriptorString {
    const TYPE_BYTES: u8 = 0;
    const TYPE_ASCII: u8 = 1;
    const TYPE_UTF8: u8 = 2;

    /// Creates a string from UTF-8 bytes
    pub fn new_utf8(v: &[u8]) -> Option<Self> {
        let s = core::str::from_utf8(v).ok()?;
        Some(Self::String(s.to_string()))
    }

    /// Creates a string from opaque bytes
    pub fn new_bytes(v: &[u8]) -> Option<Self> {
        Some(Self::Bytes(v.to_vec()))
    }

    /// Creates a text string
    pub fn new_str(s: &str) -> Self {
        Self::String(s.to_string())
    }

    /// An empty string
    pub fn empty() -> Self {
        Self::Bytes(Vec::new())
    }

    /// Returns the string type code used on the wire
    pub fn string_type(&self) -> u8 {
        match self {
            Self::String(s) if s.is_ascii() => Self::TYPE_ASCII,
            Self::String(_) => Self::TYPE_UTF8,
            Self::Bytes(_) => Self::TYPE_BYTES,
        }
    }

    /// Encoded contents
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::String(s) => s.as_bytes(),
            Self::Bytes(b) => b,
        }
    }

    /// Encoded length, which must fit a byte
    pub fn len_u8(&self) -> Result<u8> {
        u8::try_from(self.bytes().len()).map_err(|_| PldmError::InvalidArgument)
    }

    /// Writes type, length and contents
    pub fn write_adjacent(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.string_type())?;
        b.push_le8(self.len_u8()?)?;
        b.push(self.bytes())
    }
}

/// Parses a string of known type and length
pub fn parse_string<'a>(
    typ: u8,
    len: u8,
) -> impl FnMut(&'a [u8]) -> VResult<&'a [u8], DescriptorString> {
    map_opt(take(len), move |d: &[u8]| match typ {
        0 => DescriptorString::new_bytes(d),
        // ascii or utf-8
        1 | 2 => DescriptorString::new_utf8(d),
        _ => {
            debug!("unimplemented string type {typ}");
            None
        }
    })
}

/// Parses a string where type, length and data are adjacent, in that order
pub fn parse_string_adjacent(buf: &[u8]) -> VResult<&[u8], DescriptorString> {
    let (r, (typ, len)) = tuple((le_u8, le_u8))(buf)?;
    parse_string(typ, len)(r)
}

/// A device identifier descriptor
#[derive(Debug, Clone)]
pub enum Descriptor {
    /// PCI vendor ID
    PciVid(u16),
    /// IANA enterprise ID
    Iana(u32),
    /// UUID
    Uuid(uuid::Uuid),
    /// Vendor defined, with an optional title
    Vendor {
        /// Title string
        title: Option<DescriptorString>,
        /// Vendor data
        data: Vec<u8>,
    },
    /// Any other descriptor type, kept opaque
    Other {
        /// Descriptor type
        typ: u16,
        /// Descriptor data
        data: Vec<u8>,
    },
}

impl Descriptor {
    const TYPE_PCI_VID: u16 = 0x0000;
    const TYPE_IANA: u16 = 0x0001;
    const TYPE_UUID: u16 = 0x0002;
    const TYPE_VENDOR: u16 = 0xffff;

    fn parse_pcivid(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u16, Self::PciVid)(buf)
    }

    fn parse_iana(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u32, Self::Iana)(buf)
    }

    fn parse_uuid(buf: &[u8]) -> VResult<&[u8], Self> {
        map_res(take(16usize), |b| {
            let u = uuid::Uuid::from_slice(b)?;
            Ok::<Descriptor, uuid::Error>(Self::Uuid(u))
        })(buf)
    }

    fn parse_vendor(buf: &[u8]) -> VResult<&[u8], Self> {
        // Attempt to parse with a proper title string; if not present just
        // consume everything as byte data
        let f1 = |(t, d): (_, &[u8])| Self::Vendor {
            title: Some(t),
            data: d.to_vec(),
        };
        let f2 = |d: &[u8]| Self::Vendor {
            title: None,
            data: d.to_vec(),
        };
        alt((map(tuple((parse_string_adjacent, rest)), f1), map(rest, f2)))(buf)
    }

    /// Parses a type, length and value descriptor
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (typ, len)) = tuple((le_u16, le_u16))(buf)?;
        let (r, d) = take(len)(r)?;
        let (_, desc) = match typ {
            Self::TYPE_PCI_VID => all_consuming(Self::parse_pcivid)(d)?,
            Self::TYPE_IANA => all_consuming(Self::parse_iana)(d)?,
            Self::TYPE_UUID => all_consuming(Self::parse_uuid)(d)?,
            Self::TYPE_VENDOR => all_consuming(Self::parse_vendor)(d)?,
            typ => (
                &d[d.len()..],
                Self::Other {
                    typ,
                    data: d.to_vec(),
                },
            ),
        };
        Ok((r, desc))
    }

    /// Writes type, length and value
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        let mut v = MsgBuf::new();
        let typ = match self {
            Self::PciVid(id) => {
                v.push_le16(*id)?;
                Self::TYPE_PCI_VID
            }
            Self::Iana(id) => {
                v.push_le32(*id)?;
                Self::TYPE_IANA
            }
            Self::Uuid(u) => {
                v.push(u.as_bytes())?;
                Self::TYPE_UUID
            }
            Self::Vendor { title, data } => {
                if let Some(t) = title {
                    t.write_adjacent(&mut v)?;
                }
                v.push(data)?;
                Self::TYPE_VENDOR
            }
            Self::Other { typ, data } => {
                v.push(data)?;
                *typ
            }
        };
        let len =
            u16::try_from(v.len()).map_err(|_| PldmError::InvalidArgument)?;
        b.push_le16(typ)?;
        b.push_le16(len)?;
        b.push(v.as_slice())
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PciVid(id) => write!(f, "pci-vid:{:04x}", id),
            Self::Iana(id) => write!(f, "iana:{:08x}", id),
            Self::Uuid(id) => write!(f, "uuid:{}", id),
            Self::Vendor { title, data } => {
                match title {
                    Some(t) => write!(f, "vendor:{}", t)?,
                    None => write!(f, "vendor:")?,
                }
                write!(f, "[")?;
                for b in data {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "]")
            }
            Self::Other { typ, data } => {
                write!(f, "{typ:04x}:[")?;
                for b in data {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Vendor { data: s, .. }, Self::Vendor { data: o, .. }) => {
                s == o
            }
            (Self::Iana(s), Self::Iana(o)) => s == o,
            (Self::Uuid(s), Self::Uuid(o)) => s == o,
            (Self::PciVid(s), Self::PciVid(o)) => s == o,
            (
                Self::Other { typ: st, data: sd },
                Self::Other { typ: ot, data: od },
            ) => st == ot && sd == od,
            _ => false,
        }
    }
}

/// Device identifier descriptors, from QueryDeviceIdentifiers
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceIdentifiers {
    /// Descriptors, the first is the initial descriptor
    pub ids: Vec<Descriptor>,
}

impl DeviceIdentifiers {
    /// Parses a descriptor count and descriptors
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        length_count(le_u8, Descriptor::parse)(buf)
            .map(|(rest, ids)| (rest, Self { ids }))
    }

    /// Parses a QueryDeviceIdentifiers response body, which has a
    /// leading length field
    pub fn parse_response(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, len) = le_u32(buf)?;
        // length excludes the descriptor count byte
        let (r, body) = take((len as usize).saturating_add(1))(r)?;
        let (_, ids) = all_consuming(Self::parse)(body)?;
        Ok((r, ids))
    }

    /// Writes a descriptor count and descriptors
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        let n = u8::try_from(self.ids.len())
            .map_err(|_| PldmError::InvalidArgument)?;
        b.push_le8(n)?;
        for id in &self.ids {
            id.write(b)?;
        }
        Ok(())
    }

    /// Writes a QueryDeviceIdentifiers response body
    pub fn write_response(&self, b: &mut MsgBuf) -> Result<()> {
        let mut v = MsgBuf::new();
        self.write(&mut v)?;
        b.push_le32((v.len() - 1) as u32)?;
        b.push(v.as_slice())
    }
}

impl fmt::Display for DeviceIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in self.ids.iter() {
            write!(f, "{}{}", if first { "" } else { "," }, id)?;
            first = false;
        }
        Ok(())
    }
}

/// Release date of a component version
pub type PldmDate = chrono::naive::NaiveDate;

/// Parses an 8 byte `YYYYMMDD` date. All zero bytes is no date.
pub fn pldm_date_parse(buf: &[u8]) -> VResult<&[u8], Option<PldmDate>> {
    let (r, o) = alt((
        value(None, tag([0u8; 8])),
        map(
            tuple((
                map_parser(take(4u8), c_i32),
                map_parser(take(2u8), c_u32),
                map_parser(take(2u8), c_u32),
            )),
            Some,
        ),
    ))(buf)?;

    let d = o.and_then(|(y, m, d)| PldmDate::from_ymd_opt(y, m, d));

    Ok((r, d))
}

/// Writes an 8 byte `YYYYMMDD` date, or zeroes for `None`
pub fn pldm_date_write(date: Option<PldmDate>, b: &mut MsgBuf) -> Result<()> {
    match date {
        Some(d) if (0..=9999).contains(&d.year()) => {
            let s = format!("{:04}{:02}{:02}", d.year(), d.month(), d.day());
            b.push(s.as_bytes())
        }
        _ => b.push(&[0u8; 8]),
    }
}

/// A version of a component
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentVersion {
    /// Comparison stamp
    pub stamp: u32,
    /// Version string
    pub version: DescriptorString,
    /// Release date
    pub date: Option<PldmDate>,
}

impl Default for ComponentVersion {
    fn default() -> Self {
        Self {
            stamp: 0,
            version: DescriptorString::empty(),
            date: None,
        }
    }
}

impl fmt::Display for ComponentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)?;
        if let Some(d) = self.date {
            write!(f, " ({:?})", d)?;
        }
        if self.stamp != 0 {
            write!(f, " [{:08x}]", self.stamp)?;
        }
        Ok(())
    }
}

/// Component classification
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentClassification {
    Unknown,
    Other,
    Firmware,
    /// Any other classification value
    Code(u16),
}

impl From<u16> for ComponentClassification {
    fn from(x: u16) -> Self {
        match x {
            0x0000 => Self::Unknown,
            0x0001 => Self::Other,
            0x000a => Self::Firmware,
            x => Self::Code(x),
        }
    }
}

impl From<ComponentClassification> for u16 {
    fn from(c: ComponentClassification) -> u16 {
        match c {
            ComponentClassification::Unknown => 0x0000,
            ComponentClassification::Other => 0x0001,
            ComponentClassification::Firmware => 0x000a,
            ComponentClassification::Code(x) => x,
        }
    }
}

/// Activation methods supported by a component
#[allow(missing_docs)]
#[derive(EnumSetType, Debug)]
pub enum ActivationMethod {
    PendingComponentImageSet = 7,
    PendingImage = 6,
    ACPowerCycle = 5,
    DCPowerCycle = 4,
    SystemReboot = 3,
    MediumSpecificReset = 2,
    SelfContained = 1,
    Automatic = 0,
}

/// Set of [`ActivationMethod`]
pub type ActivationMethods = EnumSet<ActivationMethod>;

/// Firmware device capabilities during update
#[allow(missing_docs)]
#[derive(EnumSetType, Debug)]
pub enum DeviceCapability {
    ComponentUpdateFailureRecovery = 0,
    ComponentUpdateFailureRetry = 1,
    FDHostFunctionalityDuringUpdate = 2,
    FDPartialUpdates = 3,
    FDUpdateModeRestrictionOSActive = 4,
    FDDowngradeRestrictions = 8,
    SecurityRevisionUpdateRequest = 9,
}

/// Set of [`DeviceCapability`], ignoring unknown bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities(pub EnumSet<DeviceCapability>);

impl DeviceCapabilities {
    /// From the wire representation
    pub fn from_u32(x: u32) -> Self {
        Self(EnumSet::<DeviceCapability>::from_u32_truncated(x))
    }

    /// To the wire representation
    pub fn as_u32(&self) -> u32 {
        self.0.as_u32()
    }

    /// Returns `true` with no capabilities set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Component capabilities during update
#[allow(missing_docs)]
#[derive(EnumSetType, Debug)]
pub enum ComponentCapability {
    FDApplyState = 0,
    ComponentDowngrade = 2,
    SecurityRevisionUpdateRequest = 3,
    SecurityRevisionNotLatest = 4,
}

/// Set of [`ComponentCapability`]
pub type ComponentCapabilities = EnumSet<ComponentCapability>;

/// A ComponentParameterTable entry from GetFirmwareParameters
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Classification
    pub classification: ComponentClassification,
    /// Component identifier
    pub identifier: u16,
    /// Classification index
    pub classificationindex: u8,
    /// Currently active version
    pub active: ComponentVersion,
    /// Pending version, awaiting activation
    pub pending: ComponentVersion,
    /// Supported activation methods
    pub activation_methods: ActivationMethods,
    /// Capabilities during update
    pub caps_during_update: ComponentCapabilities,
}

impl Component {
    /// Parses a ComponentParameterTable entry
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (
            r,
            (
                classification,
                identifier,
                classificationindex,
                c1,
                c2,
                activation_methods,
                caps_during_update,
            ),
        ) = tuple((
            le_u16,
            le_u16,
            le_u8,
            tuple((le_u32, le_u8, le_u8, pldm_date_parse)),
            tuple((le_u32, le_u8, le_u8, pldm_date_parse)),
            le_u16,
            le_u32,
        ))(buf)?;

        let (r, c1_str) = parse_string(c1.1, c1.2)(r)?;
        let (r, c2_str) = parse_string(c2.1, c2.2)(r)?;

        let c = Component {
            classification: classification.into(),
            identifier,
            classificationindex,
            active: ComponentVersion {
                stamp: c1.0,
                version: c1_str,
                date: c1.3,
            },
            pending: ComponentVersion {
                stamp: c2.0,
                version: c2_str,
                date: c2.3,
            },
            activation_methods: ActivationMethods::from_u16_truncated(
                activation_methods,
            ),
            caps_during_update: ComponentCapabilities::from_u32_truncated(
                caps_during_update,
            ),
        };

        Ok((r, c))
    }

    /// Writes a ComponentParameterTable entry
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le16(self.classification.into())?;
        b.push_le16(self.identifier)?;
        b.push_le8(self.classificationindex)?;
        for v in [&self.active, &self.pending] {
            b.push_le32(v.stamp)?;
            b.push_le8(v.version.string_type())?;
            b.push_le8(v.version.len_u8()?)?;
            pldm_date_write(v.date, b)?;
        }
        b.push_le16(self.activation_methods.as_u16())?;
        b.push_le32(self.caps_during_update.as_u32())?;
        b.push(self.active.version.bytes())?;
        b.push(self.pending.version.bytes())
    }

    /// Returns `true` when `up` names this component
    pub fn matches(&self, up: &UpdateComponent) -> bool {
        self.classification == up.classification
            && self.identifier == up.identifier
            && self.classificationindex == up.classificationindex
    }
}

/// GetFirmwareParameters response
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareParameters {
    /// Device capabilities
    pub caps: DeviceCapabilities,
    /// Component parameter table
    pub components: Vec<Component>,
    /// Active component image set version
    pub active: DescriptorString,
    /// Pending component image set version
    pub pending: DescriptorString,
}

impl FirmwareParameters {
    /// Parses a GetFirmwareParameters response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, p) = tuple((le_u32, le_u16, le_u8, le_u8, le_u8, le_u8))(buf)?;

        let (
            caps,
            ccount,
            active_str_type,
            active_str_len,
            pending_str_type,
            pending_str_len,
        ) = p;

        let (r, active) = parse_string(active_str_type, active_str_len)(r)?;
        let (r, pending) = parse_string(pending_str_type, pending_str_len)(r)?;

        let (r, components) = count(Component::parse, ccount as usize)(r)?;

        let fp = FirmwareParameters {
            caps: DeviceCapabilities::from_u32(caps),
            components,
            active,
            pending,
        };

        Ok((r, fp))
    }

    /// Writes a GetFirmwareParameters response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        let n = u16::try_from(self.components.len())
            .map_err(|_| PldmError::InvalidArgument)?;
        b.push_le32(self.caps.as_u32())?;
        b.push_le16(n)?;
        b.push_le8(self.active.string_type())?;
        b.push_le8(self.active.len_u8()?)?;
        b.push_le8(self.pending.string_type())?;
        b.push_le8(self.pending.len_u8()?)?;
        b.push(self.active.bytes())?;
        b.push(self.pending.bytes())?;
        for c in &self.components {
            c.write(b)?;
        }
        Ok(())
    }
}

/// RequestUpdate request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestUpdateRequest {
    /// Largest RequestFirmwareData transfer the agent will serve
    pub max_transfer: u32,
    /// Number of components in the update
    pub num_components: u16,
    /// Maximum outstanding RequestFirmwareData requests
    pub max_outstanding: u8,
    /// Length of package data, 0 for none
    pub package_data_len: u16,
    /// Component image set version
    pub version: DescriptorString,
}

impl RequestUpdateRequest {
    /// Parses a RequestUpdate request body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (max_transfer, num_components, max_outstanding, package_data_len)) =
            tuple((le_u32, le_u16, le_u8, le_u16))(buf)?;
        let (r, version) = parse_string_adjacent(r)?;
        Ok((
            r,
            Self {
                max_transfer,
                num_components,
                max_outstanding,
                package_data_len,
                version,
            },
        ))
    }

    /// Writes a RequestUpdate request body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le32(self.max_transfer)?;
        b.push_le16(self.num_components)?;
        b.push_le8(self.max_outstanding)?;
        b.push_le16(self.package_data_len)?;
        self.version.write_adjacent(b)
    }
}

/// RequestUpdate response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUpdateResponse {
    /// Length of device metadata the agent should retrieve, 0 for none
    pub fd_metadata_len: u16,
    /// Non-zero when the device will pull package data
    pub fd_will_send_gpd: u8,
}

impl RequestUpdateResponse {
    /// Parses a RequestUpdate response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, t) = tuple((le_u16, le_u8))(buf)?;
        Ok((
            r,
            RequestUpdateResponse {
                fd_metadata_len: t.0,
                fd_will_send_gpd: t.1,
            },
        ))
    }

    /// Writes a RequestUpdate response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le16(self.fd_metadata_len)?;
        b.push_le8(self.fd_will_send_gpd)
    }
}

/// GetPackageData or GetDeviceMetaData request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartRequest {
    /// Data transfer handle
    pub handle: u32,
    /// Transfer operation flag, as received
    pub op: u8,
}

impl MultipartRequest {
    /// Creates a request
    pub fn new(op: TransferOperationFlag, handle: u32) -> Self {
        Self {
            handle,
            op: op as u8,
        }
    }

    /// Decoded operation flag, `None` when invalid
    pub fn op(&self) -> Option<TransferOperationFlag> {
        TransferOperationFlag::from_u8(self.op)
    }

    /// Parses a multipart request body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u32, le_u8)), |(handle, op)| Self { handle, op })(buf)
    }

    /// Writes a multipart request body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le32(self.handle)?;
        b.push_le8(self.op)
    }
}

/// GetPackageData or GetDeviceMetaData response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartResponse {
    /// Handle for the next portion
    pub next_handle: u32,
    /// Position of this portion
    pub flag: TransferFlag,
    /// Data portion
    pub portion: Vec<u8>,
}

impl MultipartResponse {
    /// Parses a multipart response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(
            tuple((le_u32, TransferFlag::parse, rest)),
            |(next_handle, flag, portion): (_, _, &[u8])| Self {
                next_handle,
                flag,
                portion: portion.to_vec(),
            },
        )(buf)
    }

    /// Writes a multipart response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le32(self.next_handle)?;
        b.push_le8(self.flag.into())?;
        b.push(&self.portion)
    }
}

/// A component record, from PassComponentTable or UpdateComponent.
///
/// `size` and `flags` are only present for UpdateComponent.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateComponent {
    /// Classification
    pub classification: ComponentClassification,
    /// Component identifier
    pub identifier: u16,
    /// Classification index
    pub classificationindex: u8,
    /// Comparison stamp of the new image
    pub comparisonstamp: u32,
    /// Version string of the new image
    pub version: DescriptorString,
    /// Image size in bytes
    pub size: Option<u32>,
    /// Update option flags
    pub flags: Option<u32>,
}

impl UpdateComponent {
    /// Parses a PassComponentTable record, after the transfer flag
    pub fn parse_pass_component(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (classification, identifier, classificationindex, stamp)) =
            tuple((le_u16, le_u16, le_u8, le_u32))(buf)?;
        let (r, version) = parse_string_adjacent(r)?;
        Ok((
            r,
            Self {
                classification: classification.into(),
                identifier,
                classificationindex,
                comparisonstamp: stamp,
                version,
                size: None,
                flags: None,
            },
        ))
    }

    /// Parses an UpdateComponent request body
    pub fn parse_update(buf: &[u8]) -> VResult<&[u8], Self> {
        let (
            r,
            (classification, identifier, classificationindex, stamp, size, flags),
        ) = tuple((le_u16, le_u16, le_u8, le_u32, le_u32, le_u32))(buf)?;
        let (r, version) = parse_string_adjacent(r)?;
        Ok((
            r,
            Self {
                classification: classification.into(),
                identifier,
                classificationindex,
                comparisonstamp: stamp,
                version,
                size: Some(size),
                flags: Some(flags),
            },
        ))
    }

    fn write_ident(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le16(self.classification.into())?;
        b.push_le16(self.identifier)?;
        b.push_le8(self.classificationindex)?;
        b.push_le32(self.comparisonstamp)
    }

    /// Writes a PassComponentTable request body
    pub fn write_pass_component(
        &self,
        flag: TransferFlag,
        b: &mut MsgBuf,
    ) -> Result<()> {
        b.push_le8(flag.into())?;
        self.write_ident(b)?;
        self.version.write_adjacent(b)
    }

    /// Writes an UpdateComponent request body
    pub fn write_update(&self, b: &mut MsgBuf) -> Result<()> {
        self.write_ident(b)?;
        b.push_le32(self.size.unwrap_or(0))?;
        b.push_le32(self.flags.unwrap_or(0))?;
        self.version.write_adjacent(b)
    }
}

/// PassComponentTable response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassComponentResponse {
    /// 0 when the component can be updated
    pub response: u8,
    /// A [`ComponentResponseCode`]
    pub code: u8,
}

impl PassComponentResponse {
    /// Creates a response from a component response code
    pub fn new(code: u8) -> Self {
        Self {
            response: (code != 0) as u8,
            code,
        }
    }

    /// Parses a PassComponentTable response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u8, le_u8)), |(response, code)| Self {
            response,
            code,
        })(buf)
    }

    /// Writes a PassComponentTable response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.response)?;
        b.push_le8(self.code)
    }
}

/// UpdateComponent response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateComponentResponse {
    /// 0 when the component can be updated
    pub compat_response: u8,
    /// A [`ComponentResponseCode`]
    pub compat_code: u8,
    /// Update option flags the device will honour
    pub flags_enabled: u32,
    /// Seconds before the device starts requesting data
    pub estimated_time: u16,
}

impl UpdateComponentResponse {
    /// Parses an UpdateComponent response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(
            tuple((le_u8, le_u8, le_u32, le_u16)),
            |(compat_response, compat_code, flags_enabled, estimated_time)| {
                Self {
                    compat_response,
                    compat_code,
                    flags_enabled,
                    estimated_time,
                }
            },
        )(buf)
    }

    /// Writes an UpdateComponent response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.compat_response)?;
        b.push_le8(self.compat_code)?;
        b.push_le32(self.flags_enabled)?;
        b.push_le16(self.estimated_time)
    }
}

/// RequestFirmwareData request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFirmwareData {
    /// Offset into the component image
    pub offset: u32,
    /// Bytes requested
    pub length: u32,
}

impl RequestFirmwareData {
    /// Parses a RequestFirmwareData request body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u32, le_u32)), |(offset, length)| Self {
            offset,
            length,
        })(buf)
    }

    /// Writes a RequestFirmwareData request body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le32(self.offset)?;
        b.push_le32(self.length)
    }
}

/// Single result byte of TransferComplete or VerifyComplete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultRequest {
    /// Raw result code
    pub result: u8,
}

impl ResultRequest {
    /// Parses a TransferComplete or VerifyComplete request body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u8, |result| Self { result })(buf)
    }

    /// Writes a TransferComplete or VerifyComplete request body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.result)
    }
}

/// ApplyComplete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyComplete {
    /// Raw [`ApplyResult`]
    pub result: u8,
    /// Activation methods changed by the apply
    pub methods: ActivationMethods,
}

impl ApplyComplete {
    /// Parses an ApplyComplete request body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u8, le_u16)), |(result, methods)| Self {
            result,
            methods: ActivationMethods::from_u16_truncated(methods),
        })(buf)
    }

    /// Writes an ApplyComplete request body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.result)?;
        b.push_le16(self.methods.as_u16())
    }
}

/// ActivateFirmware request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivateFirmware {
    /// Request self contained activation
    pub self_contained: bool,
}

impl ActivateFirmware {
    /// Parses an ActivateFirmware request body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u8, |b| Self {
            self_contained: b != 0,
        })(buf)
    }

    /// Writes an ActivateFirmware request body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.self_contained as u8)
    }
}

/// ActivateFirmware response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivateFirmwareResponse {
    /// Seconds for self contained activation
    pub estimated_time: u16,
}

impl ActivateFirmwareResponse {
    /// Parses an ActivateFirmware response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u16, |estimated_time| Self { estimated_time })(buf)
    }

    /// Writes an ActivateFirmware response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le16(self.estimated_time)
    }
}

/// GetStatus response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStatusResponse {
    /// Current state
    pub current_state: PldmFDState,
    /// State before the last transition
    pub previous_state: PldmFDState,
    /// Auxiliary state
    pub aux_state: u8,
    /// Auxiliary state status, a failure code when failed
    pub aux_state_status: u8,
    /// Progress, 101 when not reported
    pub progress_percent: u8,
    /// [`PldmIdleReason`] for Idle
    pub reason_code: u8,
    /// Update option flags enabled
    pub update_option_flags_enabled: u32,
}

impl GetStatusResponse {
    /// Parses a GetStatus response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, t) = tuple((
            PldmFDState::parse,
            PldmFDState::parse,
            le_u8,
            le_u8,
            le_u8,
            le_u8,
            le_u32,
        ))(buf)?;
        Ok((
            r,
            Self {
                current_state: t.0,
                previous_state: t.1,
                aux_state: t.2,
                aux_state_status: t.3,
                progress_percent: t.4,
                reason_code: t.5,
                update_option_flags_enabled: t.6,
            },
        ))
    }

    /// Writes a GetStatus response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.current_state as u8)?;
        b.push_le8(self.previous_state as u8)?;
        b.push_le8(self.aux_state)?;
        b.push_le8(self.aux_state_status)?;
        b.push_le8(self.progress_percent)?;
        b.push_le8(self.reason_code)?;
        b.push_le32(self.update_option_flags_enabled)
    }
}

impl fmt::Display for GetStatusResponse {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{:?}", self.current_state)
    }
}

/// CancelUpdate response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelUpdateResponse {
    /// Non-zero when some components are left non-functional
    pub non_functioning: u8,
    /// Bitmap of non-functional components
    pub bitmap: u64,
}

impl CancelUpdateResponse {
    /// Parses a CancelUpdate response body
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u8, le_u64)), |(non_functioning, bitmap)| Self {
            non_functioning,
            bitmap,
        })(buf)
    }

    /// Writes a CancelUpdate response body
    pub fn write(&self, b: &mut MsgBuf) -> Result<()> {
        b.push_le8(self.non_functioning)?;
        b.push_le64(self.bitmap)
    }
}
