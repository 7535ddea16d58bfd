// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware device responder
 *
 * Copyright (c) 2025 Code Construct
 */

//! PLDM Firmware Device
//!
//! [`Responder`] answers update agent commands on behalf of a [`Device`],
//! and produces the requests a device initiates (GetPackageData,
//! RequestFirmwareData and the completion notifications) from
//! [`Responder::progress`].

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use nom::{number::complete::le_u8, sequence::tuple};
use num_traits::FromPrimitive;

use fwup_channel::Eid;
use fwup_pldm::{
    decode, proto_error, ActivateFirmware, ActivateFirmwareResponse,
    ActivationMethods, ApplyComplete, ApplyResult, CCode,
    CancelUpdateResponse, Cmd, Component, ComponentClassification,
    ComponentResponseCode, CompletionCode, DescriptorString,
    DeviceCapabilities, DeviceIdentifiers, FirmwareParameters, FwCode,
    GetStatusResponse, MsgBuf, MultipartRequest, MultipartResponse,
    PassComponentResponse, PldmError, PldmFDState, PldmIdleReason,
    PldmRequest, PldmResponse, RequestFirmwareData, RequestUpdateRequest,
    RequestUpdateResponse, ResultRequest, TransferFlag, TransferResult,
    UpdateComponent, UpdateComponentResponse, VerifyResult,
    PLDM_FW_BASELINE_TRANSFER, PLDM_MAX_MSGSIZE, PLDM_RSP_HEADER_LEN,
    PLDM_TYPE_FW,
};

use crate::transfer::{Transfer, TransferError, TransferKind};
use crate::Result;

const IID_MASK: u8 = 0x1f;

// next handle and flag of a multipart response
const MULTIPART_HEADER_LEN: usize = 5;

/// A command failure, reported to the peer as a completion code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandError(pub u8);

impl From<CCode> for CommandError {
    fn from(cc: CCode) -> Self {
        Self(cc as u8)
    }
}

impl From<FwCode> for CommandError {
    fn from(cc: FwCode) -> Self {
        Self(cc as u8)
    }
}

impl From<u8> for CommandError {
    fn from(cc: u8) -> Self {
        Self(cc)
    }
}

impl From<TransferError> for CommandError {
    fn from(e: TransferError) -> Self {
        Self(e.completion_code().0)
    }
}

impl From<PldmError> for CommandError {
    fn from(e: PldmError) -> Self {
        match e {
            PldmError::Truncated(_) => CCode::ERROR_INVALID_LENGTH.into(),
            PldmError::Malformed(_) => CCode::ERROR_INVALID_DATA.into(),
            _ => CCode::ERROR.into(),
        }
    }
}

impl From<CommandError> for CompletionCode {
    fn from(e: CommandError) -> Self {
        CompletionCode(e.0)
    }
}

impl From<CommandError> for u8 {
    fn from(e: CommandError) -> Self {
        e.0
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CC: {}", CompletionCode(self.0))
    }
}

impl std::error::Error for CommandError {}

type CmdResult<T> = core::result::Result<T, CommandError>;

// Times a failed package data pull starts over from the first part
const PACKAGE_RESTARTS: u8 = 2;

struct PackagePull {
    transfer: Transfer,
    data: Vec<u8>,
    request: FDReq,
    restarts: u8,
}

impl PackagePull {
    // Returns false once out of restarts
    fn restart(&mut self) -> bool {
        if self.restarts >= PACKAGE_RESTARTS {
            return false;
        }
        self.restarts += 1;
        debug!("restarting package data pull, attempt {}", self.restarts);
        self.transfer.reset();
        self.data.clear();
        true
    }
}

enum State {
    Idle {
        reason: PldmIdleReason,
    },
    LearnComponents {
        // Set while pulling package data from the UA
        package: Option<PackagePull>,
        // A Start record has been accepted
        passed: bool,
    },
    ReadyXfer,
    Download {
        offset: usize,
        // Result to report in TransferComplete, once known
        transfer_result: Option<TransferResult>,
        // advanced when a firmware data reply is accepted
        request: FDReq,
        update_flags: u32,
        details: ComponentDetails,
    },
    Verify {
        verify_result: Option<VerifyResult>,
        request: FDReq,
        details: ComponentDetails,
    },
    Apply {
        apply_result: Option<(ApplyResult, ActivationMethods)>,
        request: FDReq,
        details: ComponentDetails,
    },
    Activate,
}

impl From<&State> for PldmFDState {
    fn from(s: &State) -> PldmFDState {
        match s {
            State::Idle { .. } => PldmFDState::Idle,
            State::LearnComponents { .. } => PldmFDState::LearnComponents,
            State::ReadyXfer => PldmFDState::ReadyXfer,
            State::Download { .. } => PldmFDState::Download,
            State::Verify { .. } => PldmFDState::Verify,
            State::Apply { .. } => PldmFDState::Apply,
            State::Activate => PldmFDState::Activate,
        }
    }
}

/// Firmware device command handler
pub struct Responder {
    /// changed only through set_state(), set_state_with() or set_idle()
    state: State,
    prev_state: PldmFDState,

    /// Owner of the update, from RequestUpdate until Idle.
    /// Other endpoints may only query, or cancel.
    ua_eid: Option<Eid>,

    // negotiated in RequestUpdate
    max_transfer: usize,
    max_message: usize,

    metadata: Transfer,
    next_iid: u8,

    // last UA activity, for the T1 timeout
    update_timestamp_fd_t1: u64,
}

impl Default for Responder {
    fn default() -> Self {
        Self::new()
    }
}

impl Responder {
    /// Milliseconds without UA activity before update mode is abandoned
    pub const FD_T1_TIMEOUT: u64 = 120_000;

    /// Creates a responder in `Idle`
    pub fn new() -> Self {
        Self::with_max_message(PLDM_MAX_MSGSIZE)
    }

    /// Creates a responder limiting the size of requested firmware data
    /// to fit a message of `max_message` bytes
    pub fn with_max_message(max_message: usize) -> Self {
        Self {
            state: State::Idle {
                reason: PldmIdleReason::Init,
            },
            prev_state: PldmFDState::Idle,
            ua_eid: None,
            max_transfer: PLDM_FW_BASELINE_TRANSFER,
            max_message: max_message.max(
                PLDM_RSP_HEADER_LEN + PLDM_FW_BASELINE_TRANSFER,
            ),
            metadata: Transfer::new(TransferKind::DeviceMetaData, 0),
            next_iid: 0,
            update_timestamp_fd_t1: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> PldmFDState {
        (&self.state).into()
    }

    /// Reason for the last return to Idle, when idle
    pub fn idle_reason(&self) -> Option<PldmIdleReason> {
        match self.state {
            State::Idle { reason } => Some(reason),
            _ => None,
        }
    }

    /// The update agent owning the current update
    pub fn ua_eid(&self) -> Option<Eid> {
        self.ua_eid
    }

    /// Handle an incoming PLDM FW request.
    ///
    /// Returns the encoded response, including error responses. Fails
    /// only when no response can be formed.
    pub fn request_in(
        &mut self,
        eid: Eid,
        buf: &[u8],
        dev: &mut impl Device,
    ) -> Result<Vec<u8>> {
        let req = PldmRequest::from_buf(buf)?;
        let rsp = self.handle(&req, eid, dev).unwrap_or_else(|e| {
            debug!("Error handling {:#04x}: {e}", req.cmd);
            req.response_cc(e)
        });
        Ok(rsp.to_vec())
    }

    fn handle(
        &mut self,
        req: &PldmRequest,
        eid: Eid,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        if req.typ != PLDM_TYPE_FW {
            trace!("request of type {} {req:?}", req.typ);
            return Err(CCode::ERROR_INVALID_PLDM_TYPE.into());
        }

        let Some(cmd) = Cmd::from_u8(req.cmd) else {
            return Err(CCode::ERROR_UNSUPPORTED_PLDM_CMD.into());
        };

        // Only the owner may drive an update
        match cmd {
            // queries and cancel from anyone
            | Cmd::QueryDeviceIdentifiers
            | Cmd::GetFirmwareParameters
            | Cmd::GetStatus
            | Cmd::CancelUpdate
            // rejected by state when already owned
            | Cmd::RequestUpdate
            => (),
            _ => {
                if let Some(ua) = self.ua_eid.filter(|ua| *ua != eid) {
                    debug!("Ignoring {cmd:?} from mismatching EID {eid}, expected {ua}");
                    return Err(CCode::ERROR_NOT_READY.into());
                }
            }
        }

        debug_assert_eq!(
            self.ua_eid.is_none(),
            matches!(self.state, State::Idle { .. }),
            "only Idle has no owner"
        );

        trace!("{cmd:?} from {eid}");

        match cmd {
            Cmd::QueryDeviceIdentifiers => self.cmd_qdi(req, dev),
            Cmd::GetFirmwareParameters => self.cmd_fwparams(req, dev),
            Cmd::RequestUpdate => self.cmd_update(req, eid, dev),
            Cmd::GetDeviceMetaData => self.cmd_metadata(req, dev),
            Cmd::PassComponentTable => self.cmd_pass_components(req, dev),
            Cmd::UpdateComponent => self.cmd_update_component(req, dev),
            Cmd::ActivateFirmware => self.cmd_activate(req, dev),
            Cmd::CancelUpdate => self.cmd_cancel_update(req, dev),
            Cmd::CancelUpdateComponent => {
                self.cmd_cancel_update_component(req, dev)
            }
            Cmd::GetStatus => self.cmd_get_status(req),
            _ => {
                trace!("{cmd:?} not handled by a device");
                Err(CCode::ERROR_UNSUPPORTED_PLDM_CMD.into())
            }
        }
    }

    /// Handle an incoming PLDM FW response
    ///
    /// These are replies to GetPackageData, RequestFirmwareData,
    /// TransferComplete, VerifyComplete and ApplyComplete.
    pub fn reply_in(
        &mut self,
        eid: Eid,
        buf: &[u8],
        dev: &mut impl Device,
    ) -> Result<()> {
        if self.ua_eid != Some(eid) {
            // No update running, or not from its owner
            return Err(proto_error!("Response from unexpected EID", eid).into());
        }

        let rsp = PldmResponse::from_buf(buf)?;
        match Cmd::from_u8(rsp.cmd) {
            Some(Cmd::GetPackageData) => self.package_response(&rsp, dev),
            Some(Cmd::RequestFirmwareData) => self.download_response(&rsp, dev),
            | Some(Cmd::TransferComplete)
            | Some(Cmd::VerifyComplete)
            | Some(Cmd::ApplyComplete)
            // Notifications only, nothing to do with the reply
            => Ok(()),
            _ => Err(proto_error!("Unsupported PLDM response").into()),
        }
    }

    fn expect_empty(req: &PldmRequest) -> CmdResult<()> {
        if req.data.is_empty() {
            Ok(())
        } else {
            Err(CCode::ERROR_INVALID_DATA.into())
        }
    }

    fn respond(req: &PldmRequest, b: MsgBuf) -> PldmResponse {
        let mut rsp = req.response();
        rsp.set_data(b.into_vec());
        rsp
    }

    fn cmd_qdi(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        Self::expect_empty(req)?;

        let mut b = MsgBuf::new();
        dev.dev_identifiers().write_response(&mut b)?;
        Ok(Self::respond(req, b))
    }

    fn cmd_fwparams(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        Self::expect_empty(req)?;

        let fwp = FirmwareParameters {
            caps: dev.capabilities(),
            components: dev.components().into(),
            active: dev.active_image_set_version(),
            pending: dev.pending_image_set_version(),
        };

        let mut b = MsgBuf::new();
        fwp.write(&mut b)?;
        Ok(Self::respond(req, b))
    }

    // Request Update
    fn cmd_update(
        &mut self,
        req: &PldmRequest,
        eid: Eid,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        if !matches!(self.state, State::Idle { .. }) {
            return Err(FwCode::ALREADY_IN_UPDATE_MODE.into());
        }

        let ru = decode("RequestUpdate", &req.data, RequestUpdateRequest::parse)?;

        match dev.request_update(&ru) {
            UpdatePolicy::Accept => (),
            UpdatePolicy::Retry => {
                debug!("device busy, UA should retry");
                return Err(FwCode::RETRY_REQUEST_UPDATE.into());
            }
            UpdatePolicy::Unable => {
                debug!("device unable to update");
                return Err(FwCode::UNABLE_TO_INITIATE_UPDATE.into());
            }
        }

        let fd_metadata_len = u16::try_from(dev.device_metadata().len())
            .map_err(|_| CCode::ERROR)?;
        let package = (ru.package_data_len > 0 && dev.wants_package_data())
            .then(|| PackagePull {
                transfer: Transfer::new(
                    TransferKind::PackageData,
                    ru.package_data_len as usize,
                ),
                data: Vec::new(),
                request: FDReq::Ready,
                restarts: 0,
            });

        let mut b = MsgBuf::new();
        RequestUpdateResponse {
            fd_metadata_len,
            fd_will_send_gpd: package.is_some() as u8,
        }
        .write(&mut b)?;

        // never below the baseline
        self.max_transfer =
            (ru.max_transfer as usize).max(PLDM_FW_BASELINE_TRANSFER);
        self.update_timestamp_fd_t1 = dev.now();
        self.metadata.reset();
        self.ua_eid = Some(eid);
        info!(
            "update mode from EID {eid}, image set {}, {} components",
            ru.version, ru.num_components
        );
        self.set_state(State::LearnComponents {
            package,
            passed: false,
        });
        Ok(Self::respond(req, b))
    }

    fn cmd_metadata(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        match self.state {
            State::LearnComponents { .. } => (),
            State::Idle { .. } => return Err(FwCode::NOT_IN_UPDATE_MODE.into()),
            _ => return Err(FwCode::INVALID_STATE_FOR_COMMAND.into()),
        }

        let mp = decode("GetDeviceMetaData", &req.data, MultipartRequest::parse)?;
        let portion = self.max_transfer.min(
            self.max_message - PLDM_RSP_HEADER_LEN - MULTIPART_HEADER_LEN,
        );
        let part = self.metadata.serve(&mp, dev.device_metadata(), portion)?;
        self.update_timestamp_fd_t1 = dev.now();

        let mut b = MsgBuf::new();
        part.write(&mut b)?;
        Ok(Self::respond(req, b))
    }

    fn cmd_pass_components(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        let passed = match self.state {
            State::LearnComponents { passed, .. } => passed,
            State::Idle { .. } => return Err(FwCode::NOT_IN_UPDATE_MODE.into()),
            _ => return Err(FwCode::INVALID_STATE_FOR_COMMAND.into()),
        };

        let (flag, up) = decode(
            "PassComponentTable",
            &req.data,
            tuple((le_u8, UpdateComponent::parse_pass_component)),
        )?;

        debug_assert!(up.flags.is_none());
        debug_assert!(up.size.is_none());

        let Some(flag) = TransferFlag::from_u8(flag) else {
            debug!("bad PassComponentTable flag {flag:#x}");
            return Err(FwCode::INVALID_STATE_FOR_COMMAND.into());
        };
        if flag.is_start() == passed {
            debug!("PassComponentTable {flag:?} out of sequence");
            return Err(FwCode::INVALID_STATE_FOR_COMMAND.into());
        }

        self.update_timestamp_fd_t1 = dev.now();

        let res = self.check_update_component(false, &up, dev);

        let mut b = MsgBuf::new();
        PassComponentResponse::new(res).write(&mut b)?;

        if let State::LearnComponents { passed, .. } = &mut self.state {
            *passed = true;
        }
        if flag.is_end() {
            self.set_state(State::ReadyXfer);
        }
        Ok(Self::respond(req, b))
    }

    // Unknown components are refused before asking the device
    fn check_update_component(
        &self,
        update: bool,
        up: &UpdateComponent,
        dev: &mut impl Device,
    ) -> u8 {
        let found = dev.components().iter().any(|c| c.matches(up));

        if found {
            dev.update_component(update, up)
        } else {
            ComponentResponseCode::NotSupported as u8
        }
    }

    fn cmd_update_component(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        match self.state {
            State::ReadyXfer => (),
            State::Idle { .. } => return Err(FwCode::NOT_IN_UPDATE_MODE.into()),
            _ => return Err(FwCode::INVALID_STATE_FOR_COMMAND.into()),
        }

        let up = decode("UpdateComponent", &req.data, UpdateComponent::parse_update)?;

        self.update_timestamp_fd_t1 = dev.now();

        let res = self.check_update_component(true, &up, dev);

        // Force Update is the only supported option
        let update_flags = up.flags.unwrap_or(0) & 0x1;

        let mut b = MsgBuf::new();
        UpdateComponentResponse {
            compat_response: (res != 0) as u8,
            compat_code: res,
            flags_enabled: update_flags,
            estimated_time: 0,
        }
        .write(&mut b)?;

        if res != 0 {
            debug!("component {:#06x} refused, code {res:#x}", up.identifier);
            return Ok(Self::respond(req, b));
        }

        let details = ComponentDetails {
            size: up.size.unwrap_or(0) as usize,
            classification: up.classification,
            identifier: up.identifier,
            index: up.classificationindex,
        };
        info!(
            "receiving component {:#06x}, {} bytes",
            details.identifier, details.size
        );

        // Nothing to fetch for an empty image
        let transfer_result =
            (details.size == 0).then_some(TransferResult::Success);

        self.set_state(State::Download {
            offset: 0,
            transfer_result,
            request: FDReq::Ready,
            update_flags,
            details,
        });
        Ok(Self::respond(req, b))
    }

    fn cmd_activate(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        let af = decode("ActivateFirmware", &req.data, ActivateFirmware::parse)?;

        match self.state {
            State::ReadyXfer => (),
            State::Idle { .. } => return Err(FwCode::NOT_IN_UPDATE_MODE.into()),
            _ => return Err(FwCode::INVALID_STATE_FOR_COMMAND.into()),
        }

        let status = dev.activate(af.self_contained);
        match status {
            ActivateResult::SUCCESS | ActivateResult::ACTIVATION_NOT_REQUIRED => (),
            _ => {
                debug!("activation failed: {status:?}");
                return Err(CommandError(status as u8));
            }
        }

        let mut b = MsgBuf::new();
        ActivateFirmwareResponse { estimated_time: 0 }.write(&mut b)?;
        let mut rsp = Self::respond(req, b);
        rsp.cc = status as u8;

        // Pass through Activate so GetStatus reports it as previous
        self.set_state(State::Activate);
        self.set_idle(PldmIdleReason::Activate);
        info!("firmware activated");
        Ok(rsp)
    }

    fn cmd_cancel_update(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        let details = match &self.state {
            State::Idle { .. } => return Err(FwCode::NOT_IN_UPDATE_MODE.into()),
            State::Activate => {
                return Err(FwCode::INVALID_STATE_FOR_COMMAND.into())
            }
            s => s.details().cloned(),
        };
        Self::expect_empty(req)?;

        let mut b = MsgBuf::new();
        CancelUpdateResponse::default().write(&mut b)?;

        if let Some(details) = details {
            dev.cancel_component(&details);
        }
        info!("update cancelled");
        self.set_idle(PldmIdleReason::Cancel);
        Ok(Self::respond(req, b))
    }

    fn cmd_cancel_update_component(
        &mut self,
        req: &PldmRequest,
        dev: &mut impl Device,
    ) -> CmdResult<PldmResponse> {
        let details = match &self.state {
            State::Idle { .. } => return Err(FwCode::NOT_IN_UPDATE_MODE.into()),
            s => s
                .details()
                .cloned()
                .ok_or(FwCode::INVALID_STATE_FOR_COMMAND)?,
        };
        Self::expect_empty(req)?;

        dev.cancel_component(&details);
        debug!("component {:#06x} cancelled", details.identifier);
        self.set_state(State::ReadyXfer);
        Ok(req.response())
    }

    fn cmd_get_status(&mut self, req: &PldmRequest) -> CmdResult<PldmResponse> {
        Self::expect_empty(req)?;

        let mut b = MsgBuf::new();
        self.get_status().write(&mut b)?;
        Ok(Self::respond(req, b))
    }

    /// Status as reported by GetStatus
    pub fn get_status(&self) -> GetStatusResponse {
        let mut st = GetStatusResponse {
            current_state: (&self.state).into(),
            previous_state: self.prev_state,
            aux_state: 0,
            aux_state_status: 0,
            progress_percent: 101,
            reason_code: PldmIdleReason::Init as u8,
            update_option_flags_enabled: 0,
        };

        match &self.state {
            State::Idle { reason } => {
                st.reason_code = *reason as u8;
                st.aux_state = 3;
            }
            State::LearnComponents {
                package: Some(p), ..
            } => {
                (st.aux_state, st.aux_state_status) = p.request.aux_state();
            }
            State::LearnComponents { package: None, .. } | State::ReadyXfer => {
                st.aux_state = 3;
            }
            State::Download {
                details,
                offset,
                update_flags,
                request,
                ..
            } => {
                if details.size > 0 {
                    let one_percent = details.size.div_ceil(100);
                    // rounds down, Download ends before 100
                    st.progress_percent = (*offset / one_percent) as u8;
                }
                st.update_option_flags_enabled = *update_flags;
                (st.aux_state, st.aux_state_status) = request.aux_state();
            }
            State::Verify { request, .. } | State::Apply { request, .. } => {
                (st.aux_state, st.aux_state_status) = request.aux_state();
            }
            State::Activate => (),
        }

        st
    }

    /// Advances device initiated exchanges.
    ///
    /// Returns a request to send to the update agent, if one is due.
    /// Should be called periodically, and after each incoming message.
    pub fn progress(&mut self, dev: &mut impl Device) -> Option<Vec<u8>> {
        trace!("progress in {:?}", PldmFDState::from(&self.state));

        if !matches!(self.state, State::Idle { .. })
            && dev.now().saturating_sub(self.update_timestamp_fd_t1)
                > Self::FD_T1_TIMEOUT
        {
            warn!("FD T1 timeout in {:?}", PldmFDState::from(&self.state));
            if let Some(details) = self.state.details() {
                dev.cancel_component(details);
            }
            self.set_state_idle_timeout();
            return None;
        }

        match self.state {
            State::LearnComponents { .. } => self.progress_package(dev),
            State::Download { .. } => self.progress_download(dev),
            State::Verify { .. } => self.progress_verify(dev),
            State::Apply { .. } => self.progress_apply(dev),
            _ => None,
        }
    }

    fn new_request(&mut self, cmd: Cmd, data: Vec<u8>) -> PldmRequest {
        let mut req = PldmRequest::new_data(PLDM_TYPE_FW, cmd as u8, data);
        req.iid = self.next_iid;
        self.next_iid = (self.next_iid + 1) & IID_MASK;
        trace!("request {cmd:?} iid {}", req.iid);
        req
    }

    fn set_request(&mut self, r: FDReq) {
        match &mut self.state {
            State::LearnComponents {
                package: Some(p), ..
            } => p.request = r,
            State::Download { request, .. }
            | State::Verify { request, .. }
            | State::Apply { request, .. } => *request = r,
            _ => (),
        }
    }

    // LearnComponents progress, pulling package data
    fn progress_package(&mut self, dev: &mut impl Device) -> Option<Vec<u8>> {
        let State::LearnComponents {
            package: Some(pull),
            ..
        } = &self.state
        else {
            return None;
        };

        if !pull.request.should_send(dev) {
            return None;
        }

        let mut b = MsgBuf::new();
        pull.transfer.next_request().write(&mut b).ok()?;
        let req = self.new_request(Cmd::GetPackageData, b.into_vec());
        self.set_request(FDReq::Sent {
            iid: req.iid,
            cmd: req.cmd,
            time: dev.now(),
        });
        Some(req.to_vec())
    }

    // Length of the next RequestFirmwareData, in Download only
    fn req_size(&self) -> usize {
        let State::Download {
            offset,
            ref details,
            ..
        } = self.state
        else {
            debug_assert!(false);
            return 0;
        };

        details
            .size
            .saturating_sub(offset)
            .min(self.max_transfer)
            .min(self.max_request())
    }

    fn progress_download(&mut self, dev: &mut impl Device) -> Option<Vec<u8>> {
        let State::Download {
            offset,
            ref request,
            transfer_result,
            ..
        } = self.state
        else {
            return None;
        };

        if !request.should_send(dev) {
            return None;
        }

        let mut b = MsgBuf::new();
        let cmd = if let Some(tr) = transfer_result {
            ResultRequest { result: tr.into() }.write(&mut b).ok()?;
            Cmd::TransferComplete
        } else {
            RequestFirmwareData {
                offset: offset as u32,
                length: self.req_size() as u32,
            }
            .write(&mut b)
            .ok()?;
            Cmd::RequestFirmwareData
        };
        let req = self.new_request(cmd, b.into_vec());

        match transfer_result {
            Some(TransferResult::Success) => self.set_state_with(|prev| {
                let State::Download { details, .. } = prev else {
                    return prev;
                };
                State::Verify {
                    verify_result: None,
                    request: FDReq::Ready,
                    details,
                }
            }),
            // stays in Download until cancelled
            Some(tr) => self.set_request(FDReq::Failed(tr.into())),
            None => self.set_request(FDReq::Sent {
                time: dev.now(),
                iid: req.iid,
                cmd: req.cmd,
            }),
        }
        Some(req.to_vec())
    }

    // Verify state progress
    fn progress_verify(&mut self, dev: &mut impl Device) -> Option<Vec<u8>> {
        let State::Verify {
            verify_result,
            request,
            details,
        } = &mut self.state
        else {
            return None;
        };

        if !request.should_send(dev) {
            return None;
        }

        let vr = *verify_result.get_or_insert_with(|| {
            let r = dev.verify(details);
            if r != VerifyResult::Success {
                trace!("Error from Device::verify(), {r:?}");
            }
            r
        });

        let mut b = MsgBuf::new();
        ResultRequest { result: vr.into() }.write(&mut b).ok()?;
        let req = self.new_request(Cmd::VerifyComplete, b.into_vec());

        if vr == VerifyResult::Success {
            self.set_state_with(|prev| {
                let State::Verify { details, .. } = prev else {
                    return prev;
                };
                State::Apply {
                    apply_result: None,
                    request: FDReq::Ready,
                    details,
                }
            });
        } else {
            // stays in Verify until cancelled
            self.set_request(FDReq::Failed(vr.into()));
        }
        Some(req.to_vec())
    }

    // Apply state progress
    fn progress_apply(&mut self, dev: &mut impl Device) -> Option<Vec<u8>> {
        let State::Apply {
            apply_result,
            request,
            details,
        } = &mut self.state
        else {
            return None;
        };

        if !request.should_send(dev) {
            return None;
        }

        let (ar, methods) = *apply_result.get_or_insert_with(|| {
            match dev.apply(details) {
                Ok(a) => (ApplyResult::Success, a),
                Err(e) => {
                    trace!("Error from Device::apply(), {e:?}");
                    (e, Default::default())
                }
            }
        });
        let identifier = details.identifier;

        let mut b = MsgBuf::new();
        ApplyComplete {
            result: ar.into(),
            methods,
        }
        .write(&mut b)
        .ok()?;
        let req = self.new_request(Cmd::ApplyComplete, b.into_vec());

        if ar.is_success() {
            info!("component {identifier:#06x} applied");
            self.set_state(State::ReadyXfer);
        } else {
            // stays in Apply until cancelled
            self.set_request(FDReq::Failed(ar.into()));
        }
        Some(req.to_vec())
    }

    fn package_response(
        &mut self,
        rsp: &PldmResponse,
        dev: &mut impl Device,
    ) -> Result<()> {
        let State::LearnComponents {
            package: Some(pull),
            ..
        } = &mut self.state
        else {
            debug!("GetPackageData response but not pulling package data");
            return Ok(());
        };

        pull.request.validate_response(rsp)?;
        pull.request = FDReq::Ready;

        let cc = rsp.completion_code();
        let data = if !cc.is_success() {
            warn!("GetPackageData failed: {cc}");
            let restart = (cc == FwCode::INVALID_TRANSFER_OPERATION_FLAG
                || cc == FwCode::INVALID_TRANSFER_HANDLE)
                && pull.restart();
            if restart {
                self.update_timestamp_fd_t1 = dev.now();
                return Ok(());
            }
            None
        } else {
            let part = decode("GetPackageData", &rsp.data, MultipartResponse::parse)?;
            match pull.transfer.accept(&part, &mut pull.data) {
                Ok(false) => {
                    self.update_timestamp_fd_t1 = dev.now();
                    return Ok(());
                }
                Ok(true) => Some(core::mem::take(&mut pull.data)),
                Err(e) => {
                    warn!("package data: {e}");
                    if pull.restart() {
                        self.update_timestamp_fd_t1 = dev.now();
                        return Ok(());
                    }
                    None
                }
            }
        };

        // pull finished, successfully or not
        if let State::LearnComponents { package, .. } = &mut self.state {
            *package = None;
        }
        self.update_timestamp_fd_t1 = dev.now();
        if let Some(data) = data {
            debug!("package data received, {} bytes", data.len());
            dev.package_data(&data);
        }
        Ok(())
    }

    fn download_response(
        &mut self,
        rsp: &PldmResponse,
        dev: &mut impl Device,
    ) -> Result<()> {
        let State::Download {
            offset,
            ref request,
            transfer_result,
            ..
        } = self.state
        else {
            debug!("firmware data outside Download");
            return Ok(());
        };

        if transfer_result.is_some() {
            debug!("firmware data after the transfer result");
            return Ok(());
        }

        request.validate_response(rsp)?;
        self.update_timestamp_fd_t1 = dev.now();

        let cc = rsp.completion_code();
        if cc == FwCode::RETRY_REQUEST_FW_DATA {
            debug!("UA asked for a retry at offset {offset}");
            self.set_request(FDReq::Ready);
            return Ok(());
        }

        let failed = if cc.is_success() {
            let expect_size = self.req_size();
            if rsp.data.len() != expect_size {
                trace!(
                    "firmware data at {offset}: expected {expect_size} bytes, got {}",
                    rsp.data.len()
                );
                // resent when the retry timer expires
                return Ok(());
            }
            None
        } else {
            warn!("RequestFirmwareData at {offset} failed: {cc}");
            Some(TransferResult::Generic)
        };

        if let State::Download {
            offset,
            request,
            details,
            transfer_result,
            ..
        } = &mut self.state
        {
            *request = FDReq::Ready;
            if let Some(f) = failed {
                *transfer_result = Some(f);
                return Ok(());
            }

            let fwdata_result = dev.firmware_data(*offset, &rsp.data, details);
            if fwdata_result == TransferResult::Success {
                *offset += rsp.data.len();
                if *offset == details.size {
                    *transfer_result = Some(TransferResult::Success);
                }
            } else {
                debug!("firmware data rejected at {offset}: {fwdata_result:?}");
                *transfer_result = Some(fwdata_result);
            }
        }

        Ok(())
    }

    // Builds the new state from the old one, moving fields across
    fn set_state_with<F>(&mut self, update: F)
    where
        F: FnOnce(State) -> State,
    {
        self.prev_state = (&self.state).into();

        // ReadyXfer is a cheap placeholder while `update` runs
        let prev = core::mem::replace(&mut self.state, State::ReadyXfer);
        let new_state = update(prev);

        debug_assert!(
            !matches!(new_state, State::Idle { .. }),
            "use set_idle() for Idle"
        );
        debug_assert!(self.ua_eid.is_some());

        self.state = new_state;
    }

    fn set_state(&mut self, new_state: State) {
        debug_assert!(
            !matches!(new_state, State::Idle { .. }),
            "use set_idle() for Idle"
        );
        debug_assert!(self.ua_eid.is_some());

        self.prev_state = (&self.state).into();
        self.state = new_state;
    }

    fn set_idle(&mut self, reason: PldmIdleReason) {
        self.prev_state = (&self.state).into();
        self.state = State::Idle { reason };
        self.ua_eid = None;
        self.metadata.reset();
    }

    fn set_state_idle_timeout(&mut self) {
        let reason = match self.state {
            State::Idle { .. } => return,
            State::LearnComponents { .. } => PldmIdleReason::TimeoutLearn,
            State::ReadyXfer => PldmIdleReason::TimeoutReadyXfer,
            State::Download { .. } => PldmIdleReason::TimeoutDownload,
            State::Verify { .. } => PldmIdleReason::TimeoutVerify,
            State::Apply { .. } => PldmIdleReason::TimeoutApply,
            // not a timeout
            State::Activate => PldmIdleReason::Activate,
        };
        self.set_idle(reason);
    }

    fn max_request(&self) -> usize {
        // response header precedes the data
        self.max_message - PLDM_RSP_HEADER_LEN
    }
}

impl State {
    // Component being transferred
    fn details(&self) -> Option<&ComponentDetails> {
        match self {
            State::Download { details, .. }
            | State::Verify { details, .. }
            | State::Apply { details, .. } => Some(details),
            _ => None,
        }
    }
}

/// Progress of the request the device currently initiates
#[derive(Debug)]
enum FDReq {
    /// Nothing outstanding
    Ready,
    /// Awaiting the reply
    Sent {
        iid: u8,
        cmd: u8,
        // send time, for retries
        time: u64,
    },
    /// A failure result was sent. Holds the code reported as aux state
    /// status until the UA cancels.
    Failed(u8),
}

impl FDReq {
    /// Milliseconds before an unanswered request is resent
    pub const RETRY_TIME: u64 = 1_000;

    // Matches type, instance id and command against the outstanding request
    fn validate_response(&self, rsp: &PldmResponse) -> fwup_pldm::Result<()> {
        let Self::Sent { iid, cmd, .. } = self else {
            trace!("reply with nothing outstanding {rsp:?}");
            return Err(proto_error!("Unexpected pldm-fw response"));
        };

        if rsp.typ != PLDM_TYPE_FW {
            trace!("reply of type {} {rsp:?}", rsp.typ);
            return Err(proto_error!("Unexpected pldm-fw response"));
        }

        if rsp.iid != *iid {
            trace!("iid mismatch, sent {self:?} got {rsp:?}");
            return Err(proto_error!("Unexpected pldm-fw response"));
        }

        if rsp.cmd != *cmd {
            trace!("cmd mismatch, sent {self:?} got {rsp:?}");
            return Err(proto_error!("Unexpected pldm-fw response"));
        }

        Ok(())
    }

    fn should_send(&self, dev: &mut impl Device) -> bool {
        match self {
            Self::Ready => true,
            Self::Sent { time, .. } => {
                dev.now().saturating_sub(*time) > Self::RETRY_TIME
            }
            Self::Failed(_) => false,
        }
    }

    // (AuxState, AuxStateStatus) for GetStatus
    fn aux_state(&self) -> (u8, u8) {
        match self {
            Self::Ready | Self::Sent { .. } => (0, 0),
            Self::Failed(e) => (2, *e),
        }
    }
}

/// The component being transferred
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDetails {
    /// Image size from UpdateComponent
    pub size: usize,
    /// Classification
    pub classification: ComponentClassification,
    /// Component identifier
    pub identifier: u16,
    /// Classification index
    pub index: u8,
}

/// Answer to a RequestUpdate, from [`Device::request_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Enter update mode
    Accept,
    /// Busy, the update agent may retry later
    Retry,
    /// Updates are not possible
    Unable,
}

/// The device being updated.
///
/// A [`Responder`] handles the protocol, calling into the device for
/// its inventory, update decisions and image storage.
pub trait Device {
    /// Identifiers for QueryDeviceIdentifiers
    fn dev_identifiers(&mut self) -> &DeviceIdentifiers;

    /// Component parameter table for GetFirmwareParameters
    fn components(&self) -> &[Component];

    /// Active component image set version
    fn active_image_set_version(&self) -> DescriptorString;

    /// Pending component image set version, empty by default
    fn pending_image_set_version(&self) -> DescriptorString {
        DescriptorString::empty()
    }

    /// Capabilities during update, none by default
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::default()
    }

    /// Decides whether to enter update mode.
    ///
    /// The default accepts every request.
    #[allow(unused)]
    fn request_update(&mut self, req: &RequestUpdateRequest) -> UpdatePolicy {
        UpdatePolicy::Accept
    }

    /// Returns `true` to pull package data when the update agent offers it
    fn wants_package_data(&self) -> bool {
        false
    }

    /// Receives the complete package data
    #[allow(unused)]
    fn package_data(&mut self, data: &[u8]) {}

    /// Device metadata offered to the update agent, empty for none
    fn device_metadata(&self) -> &[u8] {
        &[]
    }

    /// Checks a component against the device.
    ///
    /// Called with `update = false` for PassComponentTable and
    /// `update = true` for UpdateComponent, only for components listed by
    /// [`components`](Self::components). Returns 0 to accept, or a
    /// `ComponentResponseCode`.
    fn update_component(&mut self, update: bool, comp: &UpdateComponent) -> u8;

    /// Stores image data at `offset`.
    ///
    /// Data arrives in order without gaps. A failure result ends the
    /// transfer and is reported in TransferComplete.
    fn firmware_data(
        &mut self,
        offset: usize,
        data: &[u8],
        comp: &ComponentDetails,
    ) -> TransferResult;

    /// Checks a fully transferred image
    fn verify(&mut self, comp: &ComponentDetails) -> VerifyResult;

    /// Commits a verified image
    fn apply(
        &mut self,
        comp: &ComponentDetails,
    ) -> core::result::Result<ActivationMethods, ApplyResult>;

    /// Activates the applied images.
    ///
    /// Should return `INCOMPLETE_UPDATE` when a required component is
    /// missing. Succeeds by default.
    #[allow(unused)]
    fn activate(&mut self, self_contained: bool) -> ActivateResult {
        ActivateResult::SUCCESS
    }

    /// Discards a partly updated component, after a cancel or timeout
    #[allow(unused)]
    fn cancel_component(&mut self, comp: &ComponentDetails) {}

    /// Monotonic milliseconds, from any starting point
    fn now(&mut self) -> u64;
}

/// Completion codes [`Device::activate`] may return
#[repr(u8)]
#[allow(missing_docs)]
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateResult {
    SUCCESS = CCode::SUCCESS as u8,
    ERROR = CCode::ERROR as u8,
    INCOMPLETE_UPDATE = FwCode::INCOMPLETE_UPDATE as u8,
    ACTIVATION_NOT_REQUIRED = FwCode::ACTIVATION_NOT_REQUIRED as u8,
    SELF_CONTAINED_ACTIVATION_NOT_PERMITTED =
        FwCode::SELF_CONTAINED_ACTIVATION_NOT_PERMITTED as u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwup_pldm::{ComponentVersion, Descriptor, TransferOperationFlag};

    const UA: Eid = Eid(8);

    struct TestDevice {
        ids: DeviceIdentifiers,
        comps: Vec<Component>,
        now: u64,
        policy: UpdatePolicy,
        want_package: bool,
        package: Option<Vec<u8>>,
        metadata: Vec<u8>,
        image: Vec<u8>,
        cancelled: usize,
    }

    impl TestDevice {
        fn new() -> Self {
            Self {
                ids: DeviceIdentifiers {
                    ids: vec![Descriptor::PciVid(0xcc00)],
                },
                comps: vec![Component {
                    classification: ComponentClassification::Firmware,
                    identifier: 1,
                    classificationindex: 0,
                    active: ComponentVersion::default(),
                    pending: ComponentVersion::default(),
                    activation_methods: Default::default(),
                    caps_during_update: Default::default(),
                }],
                now: 1000,
                policy: UpdatePolicy::Accept,
                want_package: false,
                package: None,
                metadata: vec![],
                image: vec![],
                cancelled: 0,
            }
        }
    }

    impl Device for TestDevice {
        fn dev_identifiers(&mut self) -> &DeviceIdentifiers {
            &self.ids
        }

        fn components(&self) -> &[Component] {
            &self.comps
        }

        fn active_image_set_version(&self) -> DescriptorString {
            DescriptorString::new_str("1.0")
        }

        fn request_update(&mut self, _req: &RequestUpdateRequest) -> UpdatePolicy {
            self.policy
        }

        fn wants_package_data(&self) -> bool {
            self.want_package
        }

        fn package_data(&mut self, data: &[u8]) {
            self.package = Some(data.to_vec());
        }

        fn device_metadata(&self) -> &[u8] {
            &self.metadata
        }

        fn update_component(&mut self, _update: bool, _comp: &UpdateComponent) -> u8 {
            0
        }

        fn firmware_data(
            &mut self,
            offset: usize,
            data: &[u8],
            _comp: &ComponentDetails,
        ) -> TransferResult {
            assert_eq!(offset, self.image.len());
            self.image.extend_from_slice(data);
            TransferResult::Success
        }

        fn verify(&mut self, _comp: &ComponentDetails) -> VerifyResult {
            VerifyResult::Success
        }

        fn apply(
            &mut self,
            _comp: &ComponentDetails,
        ) -> core::result::Result<ActivationMethods, ApplyResult> {
            Ok(ActivationMethods::default())
        }

        fn cancel_component(&mut self, _comp: &ComponentDetails) {
            self.cancelled += 1;
        }

        fn now(&mut self) -> u64 {
            self.now
        }
    }

    fn request(
        cmd: Cmd,
        write: impl FnOnce(&mut MsgBuf) -> fwup_pldm::Result<()>,
    ) -> Vec<u8> {
        let mut b = MsgBuf::new();
        write(&mut b).unwrap();
        PldmRequest::new_data(PLDM_TYPE_FW, cmd as u8, b.into_vec()).to_vec()
    }

    fn send(
        r: &mut Responder,
        dev: &mut TestDevice,
        eid: Eid,
        cmd: Cmd,
        write: impl FnOnce(&mut MsgBuf) -> fwup_pldm::Result<()>,
    ) -> PldmResponse {
        let rsp = r.request_in(eid, &request(cmd, write), dev).unwrap();
        PldmResponse::from_buf(&rsp).unwrap()
    }

    fn request_update(package_data_len: u16) -> impl FnOnce(&mut MsgBuf) -> fwup_pldm::Result<()> {
        move |b| {
            RequestUpdateRequest {
                max_transfer: 64,
                num_components: 1,
                max_outstanding: 1,
                package_data_len,
                version: DescriptorString::new_str("2.0"),
            }
            .write(b)
        }
    }

    fn record(size: Option<u32>) -> UpdateComponent {
        UpdateComponent {
            classification: ComponentClassification::Firmware,
            identifier: 1,
            classificationindex: 0,
            comparisonstamp: 2,
            version: DescriptorString::new_str("2.0"),
            size,
            flags: size.map(|_| 0),
        }
    }

    fn pass(flag: u8) -> impl FnOnce(&mut MsgBuf) -> fwup_pldm::Result<()> {
        move |b| {
            b.push_le8(flag)?;
            let mut r = MsgBuf::new();
            record(None).write_pass_component(TransferFlag::Start, &mut r)?;
            // skip the flag written by write_pass_component
            b.push(&r.as_slice()[1..])
        }
    }

    // Reply to a device request, as the update agent would
    fn reply(
        r: &mut Responder,
        dev: &mut TestDevice,
        req: &[u8],
        cc: impl Into<CompletionCode>,
        data: Vec<u8>,
    ) {
        let req = PldmRequest::from_buf(req).unwrap();
        let mut rsp = req.response_cc(cc);
        rsp.set_data(data);
        r.reply_in(UA, &rsp.to_vec(), dev).unwrap();
    }

    #[test]
    fn not_in_update_mode() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();

        let rsp = send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(5));
        assert_eq!(rsp.completion_code(), FwCode::NOT_IN_UPDATE_MODE);

        let rsp = send(&mut r, &mut d, UA, Cmd::UpdateComponent, |b| {
            record(Some(10)).write_update(b)
        });
        assert_eq!(rsp.completion_code(), FwCode::NOT_IN_UPDATE_MODE);
        assert_eq!(r.state(), PldmFDState::Idle);

        let rsp = send(&mut r, &mut d, UA, Cmd::CancelUpdate, |_| Ok(()));
        assert_eq!(rsp.completion_code(), FwCode::NOT_IN_UPDATE_MODE);

        // informational commands work in any state
        let rsp = send(&mut r, &mut d, UA, Cmd::QueryDeviceIdentifiers, |_| Ok(()));
        assert!(rsp.completion_code().is_success());
        let ids = decode("", &rsp.data, DeviceIdentifiers::parse_response).unwrap();
        assert_eq!(ids, d.ids);
    }

    #[test]
    fn request_update_policy() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();

        d.policy = UpdatePolicy::Retry;
        let rsp = send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        assert_eq!(rsp.completion_code(), FwCode::RETRY_REQUEST_UPDATE);
        assert_eq!(r.state(), PldmFDState::Idle);
        assert_eq!(r.ua_eid(), None);

        d.policy = UpdatePolicy::Unable;
        let rsp = send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        assert_eq!(rsp.completion_code(), FwCode::UNABLE_TO_INITIATE_UPDATE);

        d.policy = UpdatePolicy::Accept;
        let rsp = send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        assert!(rsp.completion_code().is_success());
        assert_eq!(r.state(), PldmFDState::LearnComponents);
        assert_eq!(r.ua_eid(), Some(UA));

        let rsp = send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        assert_eq!(rsp.completion_code(), FwCode::ALREADY_IN_UPDATE_MODE);

        // bad body from idle leaves no owner behind
        let mut r = Responder::new();
        let rsp = send(&mut r, &mut d, UA, Cmd::RequestUpdate, |b| b.push_le8(1));
        assert_eq!(rsp.completion_code(), CCode::ERROR_INVALID_LENGTH);
        assert_eq!(r.ua_eid(), None);
    }

    #[test]
    fn pass_component_sequence() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));

        // UpdateComponent while learning
        let rsp = send(&mut r, &mut d, UA, Cmd::UpdateComponent, |b| {
            record(Some(10)).write_update(b)
        });
        assert_eq!(rsp.completion_code(), FwCode::INVALID_STATE_FOR_COMMAND);

        // another EID
        let rsp = send(&mut r, &mut d, Eid(9), Cmd::PassComponentTable, pass(1));
        assert_eq!(rsp.completion_code(), CCode::ERROR_NOT_READY);

        let rsp = send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(2));
        assert_eq!(rsp.completion_code(), FwCode::INVALID_STATE_FOR_COMMAND);
        let rsp = send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(3));
        assert_eq!(rsp.completion_code(), FwCode::INVALID_STATE_FOR_COMMAND);

        let rsp = send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(1));
        assert!(rsp.completion_code().is_success());
        assert_eq!(rsp.data, [0, 0]);
        let rsp = send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(1));
        assert_eq!(rsp.completion_code(), FwCode::INVALID_STATE_FOR_COMMAND);
        assert_eq!(r.state(), PldmFDState::LearnComponents);

        let rsp = send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(4));
        assert!(rsp.completion_code().is_success());
        assert_eq!(r.state(), PldmFDState::ReadyXfer);

        let rsp = send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(5));
        assert_eq!(rsp.completion_code(), FwCode::INVALID_STATE_FOR_COMMAND);
    }

    #[test]
    fn unknown_component() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(5));

        let rsp = send(&mut r, &mut d, UA, Cmd::UpdateComponent, |b| {
            UpdateComponent {
                identifier: 77,
                ..record(Some(10))
            }
            .write_update(b)
        });
        assert!(rsp.completion_code().is_success());
        let u = decode("", &rsp.data, UpdateComponentResponse::parse).unwrap();
        assert_eq!(u.compat_response, 1);
        assert_eq!(u.compat_code, ComponentResponseCode::NotSupported as u8);
        assert_eq!(r.state(), PldmFDState::ReadyXfer);
    }

    #[test]
    fn download_to_activate() {
        let mut r = Responder::with_max_message(64);
        let mut d = TestDevice::new();
        let image: Vec<u8> = (0..100u8).collect();

        send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(5));
        let rsp = send(&mut r, &mut d, UA, Cmd::UpdateComponent, |b| {
            record(Some(image.len() as u32)).write_update(b)
        });
        assert!(rsp.completion_code().is_success());
        assert_eq!(r.state(), PldmFDState::Download);

        let mut reqs = 0;
        while r.state() == PldmFDState::Download {
            let req = r.progress(&mut d).unwrap();
            let pr = PldmRequest::from_buf(&req).unwrap();
            if pr.cmd == Cmd::TransferComplete as u8 {
                assert_eq!(pr.data, [0]);
                break;
            }
            assert_eq!(pr.cmd, Cmd::RequestFirmwareData as u8);
            let rq = decode("", &pr.data, RequestFirmwareData::parse).unwrap();
            // max message less the response header
            assert!(rq.length <= 60);
            let (o, l) = (rq.offset as usize, rq.length as usize);

            // no second request while waiting
            assert!(r.progress(&mut d).is_none());
            reply(&mut r, &mut d, &req, CCode::SUCCESS, image[o..o + l].to_vec());
            reqs += 1;
        }
        assert_eq!(reqs, 2);
        assert_eq!(d.image, image);
        assert_eq!(r.state(), PldmFDState::Verify);

        let req = r.progress(&mut d).unwrap();
        assert_eq!(PldmRequest::from_buf(&req).unwrap().cmd, Cmd::VerifyComplete as u8);
        assert_eq!(r.state(), PldmFDState::Apply);
        let req = r.progress(&mut d).unwrap();
        assert_eq!(PldmRequest::from_buf(&req).unwrap().cmd, Cmd::ApplyComplete as u8);
        assert_eq!(r.state(), PldmFDState::ReadyXfer);
        assert!(r.progress(&mut d).is_none());

        let rsp = send(&mut r, &mut d, UA, Cmd::ActivateFirmware, |b| b.push_le8(0));
        assert!(rsp.completion_code().is_success());
        assert_eq!(rsp.data, [0, 0]);
        assert_eq!(r.idle_reason(), Some(PldmIdleReason::Activate));
        assert_eq!(r.get_status().previous_state, PldmFDState::Activate);
        assert_eq!(r.ua_eid(), None);
    }

    #[test]
    fn download_status_and_cancel() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(5));
        send(&mut r, &mut d, UA, Cmd::UpdateComponent, |b| {
            record(Some(200)).write_update(b)
        });

        let req = r.progress(&mut d).unwrap();
        reply(&mut r, &mut d, &req, CCode::SUCCESS, vec![0; 64]);
        let st = r.get_status();
        assert_eq!(st.current_state, PldmFDState::Download);
        assert_eq!(st.progress_percent, 32);

        // a stale response is refused
        let stale = PldmRequest::from_buf(&req).unwrap().response().to_vec();
        assert!(r.reply_in(UA, &stale, &mut d).is_err());

        // retry after the timer
        let req = r.progress(&mut d).unwrap();
        assert!(r.progress(&mut d).is_none());
        d.now += FDReq::RETRY_TIME + 1;
        let again = r.progress(&mut d).unwrap();
        assert_ne!(req[0], again[0]);
        assert_eq!(req[1..], again[1..]);

        let rsp = send(&mut r, &mut d, UA, Cmd::CancelUpdateComponent, |_| Ok(()));
        assert!(rsp.completion_code().is_success());
        assert_eq!(r.state(), PldmFDState::ReadyXfer);
        assert_eq!(d.cancelled, 1);

        let rsp = send(&mut r, &mut d, UA, Cmd::CancelUpdateComponent, |_| Ok(()));
        assert_eq!(rsp.completion_code(), FwCode::INVALID_STATE_FOR_COMMAND);

        let rsp = send(&mut r, &mut d, Eid(20), Cmd::CancelUpdate, |_| Ok(()));
        assert!(rsp.completion_code().is_success());
        assert_eq!(r.idle_reason(), Some(PldmIdleReason::Cancel));
    }

    #[test]
    fn transfer_failure_waits_for_cancel() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));
        send(&mut r, &mut d, UA, Cmd::PassComponentTable, pass(5));
        send(&mut r, &mut d, UA, Cmd::UpdateComponent, |b| {
            record(Some(40)).write_update(b)
        });

        let req = r.progress(&mut d).unwrap();
        reply(&mut r, &mut d, &req, FwCode::DATA_OUT_OF_RANGE, vec![]);
        let req = r.progress(&mut d).unwrap();
        let pr = PldmRequest::from_buf(&req).unwrap();
        assert_eq!(pr.cmd, Cmd::TransferComplete as u8);
        assert_eq!(pr.data, [TransferResult::Generic as u8]);

        assert_eq!(r.state(), PldmFDState::Download);
        assert!(r.progress(&mut d).is_none());
        let st = r.get_status();
        assert_eq!((st.aux_state, st.aux_state_status), (2, TransferResult::Generic as u8));
    }

    #[test]
    fn package_and_metadata() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        d.want_package = true;
        d.metadata = (0..70).collect();
        let package: Vec<u8> = (0..50).map(|i| i * 3).collect();

        let rsp = send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(50));
        let ru = decode("", &rsp.data, RequestUpdateResponse::parse).unwrap();
        assert_eq!(ru.fd_metadata_len, 70);
        assert_eq!(ru.fd_will_send_gpd, 1);

        // serve the pull as the update agent
        let mut ua = Transfer::new(TransferKind::PackageData, 0);
        while let Some(req) = r.progress(&mut d) {
            let pr = PldmRequest::from_buf(&req).unwrap();
            assert_eq!(pr.cmd, Cmd::GetPackageData as u8);
            let mp = decode("", &pr.data, MultipartRequest::parse).unwrap();
            let part = ua.serve(&mp, &package, 16).unwrap();
            let mut b = MsgBuf::new();
            part.write(&mut b).unwrap();
            reply(&mut r, &mut d, &req, CCode::SUCCESS, b.into_vec());
        }
        assert_eq!(d.package.as_deref(), Some(package.as_slice()));
        assert_eq!(r.get_status().aux_state, 3);

        // metadata at the negotiated 64 byte transfer size
        let rsp = send(&mut r, &mut d, UA, Cmd::GetDeviceMetaData, |b| {
            MultipartRequest::new(TransferOperationFlag::GetFirstPart, 0).write(b)
        });
        let part = decode("", &rsp.data, MultipartResponse::parse).unwrap();
        assert_eq!(part.flag, TransferFlag::Start);
        assert_eq!(part.portion.len(), 64);

        let rsp = send(&mut r, &mut d, UA, Cmd::GetDeviceMetaData, |b| {
            MultipartRequest::new(TransferOperationFlag::GetNextPart, 60).write(b)
        });
        assert_eq!(rsp.completion_code(), FwCode::INVALID_TRANSFER_HANDLE);

        let rsp = send(&mut r, &mut d, UA, Cmd::GetDeviceMetaData, |b| {
            MultipartRequest::new(TransferOperationFlag::GetNextPart, 64).write(b)
        });
        let part = decode("", &rsp.data, MultipartResponse::parse).unwrap();
        assert_eq!(part.flag, TransferFlag::End);
        assert_eq!(part.portion, d.metadata[64..]);
    }

    #[test]
    fn package_pull_restarts() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        d.want_package = true;
        let package: Vec<u8> = (0..50).collect();
        send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(50));

        let mut ua = Transfer::new(TransferKind::PackageData, 0);
        let mut serve = |r: &mut Responder, d: &mut TestDevice, req: &[u8]| {
            let pr = PldmRequest::from_buf(req).unwrap();
            let mp = decode("", &pr.data, MultipartRequest::parse).unwrap();
            match ua.serve(&mp, &package, 16) {
                Ok(part) => {
                    let mut b = MsgBuf::new();
                    part.write(&mut b).unwrap();
                    reply(r, d, req, CCode::SUCCESS, b.into_vec());
                }
                Err(e) => {
                    // the update agent abandons its side on a rejected restart
                    ua.reset();
                    reply(r, d, req, e.completion_code(), vec![]);
                }
            }
        };

        let req = r.progress(&mut d).unwrap();
        serve(&mut r, &mut d, &req);

        // a part that doesn't continue the transfer
        let req = r.progress(&mut d).unwrap();
        let part = MultipartResponse {
            next_handle: 40,
            flag: TransferFlag::Start,
            portion: vec![0; 16],
        };
        let mut b = MsgBuf::new();
        part.write(&mut b).unwrap();
        reply(&mut r, &mut d, &req, CCode::SUCCESS, b.into_vec());

        // starts over from the first part
        let req = r.progress(&mut d).unwrap();
        let pr = PldmRequest::from_buf(&req).unwrap();
        let mp = decode("", &pr.data, MultipartRequest::parse).unwrap();
        assert_eq!(mp.op(), Some(TransferOperationFlag::GetFirstPart));
        serve(&mut r, &mut d, &req);

        while let Some(req) = r.progress(&mut d) {
            serve(&mut r, &mut d, &req);
        }
        assert_eq!(d.package.as_deref(), Some(package.as_slice()));
        assert_eq!(r.state(), PldmFDState::LearnComponents);
    }

    #[test]
    fn t1_timeout() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        send(&mut r, &mut d, UA, Cmd::RequestUpdate, request_update(0));

        d.now += Responder::FD_T1_TIMEOUT;
        assert!(r.progress(&mut d).is_none());
        assert_eq!(r.state(), PldmFDState::LearnComponents);

        d.now += 1;
        r.progress(&mut d);
        assert_eq!(r.idle_reason(), Some(PldmIdleReason::TimeoutLearn));
        assert_eq!(r.ua_eid(), None);
        assert_eq!(r.get_status().reason_code, PldmIdleReason::TimeoutLearn as u8);

        // idle stays idle
        d.now += 10 * Responder::FD_T1_TIMEOUT;
        r.progress(&mut d);
        assert_eq!(r.idle_reason(), Some(PldmIdleReason::TimeoutLearn));
    }

    #[test]
    fn unsupported() {
        let mut r = Responder::new();
        let mut d = TestDevice::new();
        let rsp = send(&mut r, &mut d, UA, Cmd::GetMetaData, |_| Ok(()));
        assert_eq!(rsp.completion_code(), CCode::ERROR_UNSUPPORTED_PLDM_CMD);

        let mut req = PldmRequest::new(PLDM_TYPE_FW, 0x7f);
        req.iid = 3;
        let rsp = r.request_in(UA, &req.to_vec(), &mut d).unwrap();
        assert_eq!(rsp, [3, PLDM_TYPE_FW, 0x7f, CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8]);

        let rsp = r
            .request_in(UA, &PldmRequest::new(2, 1).to_vec(), &mut d)
            .unwrap();
        assert_eq!(rsp[3], CCode::ERROR_INVALID_PLDM_TYPE as u8);

        // responses aren't requests
        assert!(r.request_in(UA, &[0x00, 5, 1, 0], &mut d).is_err());
        // and no response is expected from anyone
        assert!(r.reply_in(UA, &[0x00, 5, 0x15, 0], &mut d).is_err());
    }
}
