// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Update agent session

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::time::Duration;

use num_traits::FromPrimitive;

use fwup_pldm::{
    decode, ActivateFirmware, ActivateFirmwareResponse, ApplyComplete,
    ApplyResult, CCode, CancelUpdateResponse, Cmd, ComponentClassification,
    CompletionCode, DescriptorString, DeviceIdentifiers, FirmwareParameters,
    FwCode, GetStatusResponse, MsgBuf, MultipartRequest, MultipartResponse,
    PassComponentResponse, PldmRequest, PldmResponse, RequestFirmwareData,
    RequestUpdateRequest, RequestUpdateResponse, ResultRequest,
    TransferFlag, TransferOperationFlag, TransferResult, UpdateComponent,
    UpdateComponentResponse, VerifyResult, PLDM_FW_BASELINE_TRANSFER,
    PLDM_MAX_MSGSIZE, PLDM_RSP_HEADER_LEN, PLDM_TYPE_FW,
};

use crate::responder::CommandError;
use crate::transfer::{Transfer, TransferKind};
use crate::{FwupError, Result};

const IID_MASK: u8 = 0x1f;

// next handle and flag of a multipart response
const MULTIPART_HEADER_LEN: usize = 5;

/// Update agent settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest RequestFirmwareData transfer served
    pub max_transfer_size: u32,
    /// Outstanding RequestFirmwareData requests the device may issue
    pub max_outstanding: u8,
    /// Portion size for package data served to the device
    pub portion_size: usize,
    /// Largest device metadata accepted
    pub max_metadata_size: usize,
    /// Time to wait for a response, or for the device's next request
    pub response_timeout: Duration,
    /// Resends of RequestUpdate when the device asks for a retry
    pub request_update_retries: u32,
    /// Delay before resending RequestUpdate
    pub retry_delay: Duration,
    /// Request self contained activation
    pub self_contained_activation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_transfer_size: 512,
            max_outstanding: 2,
            portion_size: PLDM_FW_BASELINE_TRANSFER,
            max_metadata_size: PLDM_MAX_MSGSIZE,
            response_timeout: Duration::from_secs(60),
            request_update_retries: 3,
            retry_delay: Duration::from_secs(1),
            self_contained_activation: false,
        }
    }
}

/// A component image to send
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentImage {
    /// Classification
    pub classification: ComponentClassification,
    /// Component identifier
    pub identifier: u16,
    /// Classification index
    pub classificationindex: u8,
    /// Comparison stamp of the image
    pub comparisonstamp: u32,
    /// Version string of the image
    pub version: DescriptorString,
    /// Update option flags requested
    pub update_flags: u32,
    /// Image contents
    pub image: Vec<u8>,
}

impl ComponentImage {
    /// A firmware component with no comparison stamp or flags
    pub fn new(identifier: u16, version: &str, image: Vec<u8>) -> Self {
        Self {
            classification: ComponentClassification::Firmware,
            identifier,
            classificationindex: 0,
            comparisonstamp: 0,
            version: DescriptorString::new_str(version),
            update_flags: 0,
            image,
        }
    }

    fn record(&self) -> UpdateComponent {
        UpdateComponent {
            classification: self.classification,
            identifier: self.identifier,
            classificationindex: self.classificationindex,
            comparisonstamp: self.comparisonstamp,
            version: self.version.clone(),
            size: Some(self.image.len() as u32),
            flags: Some(self.update_flags),
        }
    }
}

/// Everything sent during one update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    /// Component image set version
    pub version: DescriptorString,
    /// Package data offered to the device, may be empty
    pub package_data: Vec<u8>,
    /// Components, in PassComponentTable order
    pub components: Vec<ComponentImage>,
}

impl UpdatePlan {
    fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(FwupError::InvalidArgument("no components"));
        }
        if self.components.len() > u16::MAX as usize {
            return Err(FwupError::InvalidArgument("too many components"));
        }
        if self.package_data.len() > u16::MAX as usize {
            return Err(FwupError::InvalidArgument("package data too large"));
        }
        if self.version.len_u8().is_err() {
            return Err(FwupError::InvalidArgument("version string too long"));
        }
        for c in &self.components {
            if c.image.len() > u32::MAX as usize {
                return Err(FwupError::InvalidArgument("component too large"));
            }
            if c.version.len_u8().is_err() {
                return Err(FwupError::InvalidArgument(
                    "component version too long",
                ));
            }
        }
        Ok(())
    }
}

/// Update agent view of the device state
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LearnComponents,
    ReadyXfer,
    Download,
    Verify,
    Apply,
    Activate,
    /// The device refused the update, or a local resource limit was hit.
    /// Only [`Session::reset`] leaves this state.
    Aborted,
}

/// Commands the update agent issues
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    QueryDeviceIdentifiers,
    GetFirmwareParameters,
    RequestUpdate,
    GetDeviceMetaData,
    PassComponentTable,
    UpdateComponent,
    ActivateFirmware,
    GetStatus,
    CancelUpdateComponent,
    CancelUpdate,
}

impl Command {
    /// Command code on the wire
    pub fn cmd(&self) -> Cmd {
        match self {
            Self::QueryDeviceIdentifiers => Cmd::QueryDeviceIdentifiers,
            Self::GetFirmwareParameters => Cmd::GetFirmwareParameters,
            Self::RequestUpdate => Cmd::RequestUpdate,
            Self::GetDeviceMetaData => Cmd::GetDeviceMetaData,
            Self::PassComponentTable => Cmd::PassComponentTable,
            Self::UpdateComponent => Cmd::UpdateComponent,
            Self::ActivateFirmware => Cmd::ActivateFirmware,
            Self::GetStatus => Cmd::GetStatus,
            Self::CancelUpdateComponent => Cmd::CancelUpdateComponent,
            Self::CancelUpdate => Cmd::CancelUpdate,
        }
    }
}

/// What the session needs next, from [`Session::next_action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Issue this command
    Issue(Command),
    /// Wait for the device's next request
    AwaitRequest,
    /// Nothing more to do. Check [`Session::activated`].
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    NotPassed,
    Accepted,
    Skipped,
    Updated,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    iid: u8,
    command: Command,
}

/// One firmware update attempt, from the update agent side.
///
/// The session performs no I/O. [`issue`](Self::issue) encodes a request,
/// [`process`](Self::process) consumes its response and
/// [`handle_request`](Self::handle_request) answers requests initiated by
/// the device.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    plan: UpdatePlan,
    state: SessionState,
    cc: CompletionCode,

    next_iid: u8,
    pending: Option<Pending>,

    fd_will_send_gpd: bool,
    package: Transfer,
    package_done: bool,
    metadata: Transfer,
    metadata_buf: Vec<u8>,
    metadata_done: bool,

    passed: usize,
    outcomes: Vec<Outcome>,
    next_update: usize,
    current: Option<usize>,
    component_failed: bool,

    finished: bool,
    activated: bool,

    device_ids: Option<DeviceIdentifiers>,
    fw_params: Option<FirmwareParameters>,
    status: Option<GetStatusResponse>,
}

impl Session {
    /// Creates a session in `Idle`
    pub fn new(config: SessionConfig, plan: UpdatePlan) -> Result<Self> {
        if (config.max_transfer_size as usize) < PLDM_FW_BASELINE_TRANSFER {
            return Err(FwupError::InvalidArgument(
                "max transfer size below baseline",
            ));
        }
        plan.validate()?;
        let n = plan.components.len();
        Ok(Self {
            config,
            plan,
            state: SessionState::Idle,
            cc: CompletionCode::SUCCESS,
            next_iid: 0,
            pending: None,
            fd_will_send_gpd: false,
            package: Transfer::new(TransferKind::PackageData, 0),
            package_done: false,
            metadata: Transfer::new(TransferKind::DeviceMetaData, 0),
            metadata_buf: Vec::new(),
            metadata_done: false,
            passed: 0,
            outcomes: vec![Outcome::NotPassed; n],
            next_update: 0,
            current: None,
            component_failed: false,
            finished: false,
            activated: false,
            device_ids: None,
            fw_params: None,
            status: None,
        })
    }

    /// Replaces the plan for a new update attempt.
    ///
    /// Only possible from `Idle` or `Aborted`.
    pub fn load(&mut self, plan: UpdatePlan) -> Result<()> {
        if !matches!(self.state, SessionState::Idle | SessionState::Aborted) {
            return Err(FwupError::InvalidState(self.state));
        }
        plan.validate()?;
        self.plan = plan;
        self.reset();
        Ok(())
    }

    /// Returns to `Idle`, releasing transfer buffers
    pub fn reset(&mut self) {
        self.clear();
        self.cc = CompletionCode::SUCCESS;
        self.finished = false;
        self.activated = false;
    }

    fn clear(&mut self) {
        self.set_state(SessionState::Idle);
        self.pending = None;
        self.fd_will_send_gpd = false;
        self.package.reset();
        self.package_done = false;
        self.metadata = Transfer::new(TransferKind::DeviceMetaData, 0);
        self.metadata_buf = Vec::new();
        self.metadata_done = false;
        self.passed = 0;
        self.outcomes = vec![Outcome::NotPassed; self.plan.components.len()];
        self.next_update = 0;
        self.current = None;
        self.component_failed = false;
    }

    /// Settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The update being sent
    pub fn plan(&self) -> &UpdatePlan {
        &self.plan
    }

    /// Current state
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// Completion code of the last command processed, issued or served
    pub fn completion_code(&self) -> CompletionCode {
        self.cc
    }

    /// Returns `true` once ActivateFirmware has succeeded
    pub fn activated(&self) -> bool {
        self.activated
    }

    /// Identifiers from QueryDeviceIdentifiers
    pub fn device_identifiers(&self) -> Option<&DeviceIdentifiers> {
        self.device_ids.as_ref()
    }

    /// Parameters from GetFirmwareParameters
    pub fn firmware_parameters(&self) -> Option<&FirmwareParameters> {
        self.fw_params.as_ref()
    }

    /// Last GetStatus response
    pub fn status(&self) -> Option<&GetStatusResponse> {
        self.status.as_ref()
    }

    /// Device metadata, once fully retrieved
    pub fn device_metadata(&self) -> Option<&[u8]> {
        self.metadata_done.then_some(self.metadata_buf.as_slice())
    }

    /// Package data transfer context
    pub fn package_transfer(&self) -> &Transfer {
        &self.package
    }

    /// Device metadata transfer context
    pub fn metadata_transfer(&self) -> &Transfer {
        &self.metadata
    }

    /// Number of components applied so far
    pub fn updated_components(&self) -> usize {
        self.outcomes.iter().filter(|o| **o == Outcome::Updated).count()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            trace!("session {:?} -> {:?}", self.state, state);
        }
        self.state = state;
    }

    fn next_component(&self) -> Option<usize> {
        (self.next_update..self.outcomes.len())
            .find(|&i| self.outcomes[i] == Outcome::Accepted)
    }

    /// Decides what to do next
    pub fn next_action(&self) -> Action {
        use SessionState::*;
        if self.finished {
            return Action::Finished;
        }
        match self.state {
            Idle => {
                if self.device_ids.is_none() {
                    Action::Issue(Command::QueryDeviceIdentifiers)
                } else if self.fw_params.is_none() {
                    Action::Issue(Command::GetFirmwareParameters)
                } else {
                    Action::Issue(Command::RequestUpdate)
                }
            }
            LearnComponents => {
                if !self.package_done {
                    Action::AwaitRequest
                } else if !self.metadata_done {
                    Action::Issue(Command::GetDeviceMetaData)
                } else {
                    Action::Issue(Command::PassComponentTable)
                }
            }
            ReadyXfer => {
                if self.next_component().is_some() {
                    Action::Issue(Command::UpdateComponent)
                } else if self.updated_components() > 0 {
                    Action::Issue(Command::ActivateFirmware)
                } else {
                    Action::Issue(Command::CancelUpdate)
                }
            }
            Download | Verify | Apply => {
                if self.component_failed {
                    Action::Issue(Command::CancelUpdateComponent)
                } else {
                    Action::AwaitRequest
                }
            }
            Activate | Aborted => Action::Finished,
        }
    }

    fn check_legal(&mut self, command: Command) -> Result<()> {
        use SessionState::*;
        let st = self.state;
        let legal = match command {
            Command::QueryDeviceIdentifiers
            | Command::GetFirmwareParameters
            | Command::GetStatus => true,
            Command::RequestUpdate => st == Idle,
            Command::GetDeviceMetaData | Command::PassComponentTable => {
                st == LearnComponents
            }
            Command::UpdateComponent | Command::ActivateFirmware => {
                st == ReadyXfer
            }
            Command::CancelUpdateComponent => {
                matches!(st, Download | Verify | Apply)
            }
            Command::CancelUpdate => !matches!(st, Idle | Aborted),
        };
        if legal {
            return Ok(());
        }

        self.cc = match st {
            Idle => FwCode::NOT_IN_UPDATE_MODE,
            _ => FwCode::INVALID_STATE_FOR_COMMAND,
        }
        .into();
        debug!("{command:?} not legal in {st:?}");
        Err(FwupError::InvalidState(st))
    }

    fn encode(&self, command: Command) -> Result<Vec<u8>> {
        let mut b = MsgBuf::new();
        match command {
            Command::QueryDeviceIdentifiers
            | Command::GetFirmwareParameters
            | Command::GetStatus
            | Command::CancelUpdateComponent
            | Command::CancelUpdate => (),
            Command::RequestUpdate => RequestUpdateRequest {
                max_transfer: self.config.max_transfer_size,
                num_components: self.plan.components.len() as u16,
                max_outstanding: self.config.max_outstanding,
                package_data_len: self.plan.package_data.len() as u16,
                version: self.plan.version.clone(),
            }
            .write(&mut b)?,
            Command::GetDeviceMetaData => {
                self.metadata.next_request().write(&mut b)?
            }
            Command::PassComponentTable => {
                let n = self.plan.components.len();
                let c = self
                    .plan
                    .components
                    .get(self.passed)
                    .ok_or(FwupError::InvalidState(self.state))?;
                let flag = TransferFlag::for_index(self.passed, n);
                c.record().write_pass_component(flag, &mut b)?
            }
            Command::UpdateComponent => {
                let i = self.next_component().ok_or(
                    FwupError::InvalidArgument("no component left to update"),
                )?;
                self.plan.components[i].record().write_update(&mut b)?
            }
            Command::ActivateFirmware => ActivateFirmware {
                self_contained: self.config.self_contained_activation,
            }
            .write(&mut b)?,
        }
        Ok(b.into_vec())
    }

    /// Encodes `command` as the next request.
    ///
    /// A command that is illegal in the current state fails with
    /// `InvalidState`, recording NOT_IN_UPDATE_MODE or
    /// INVALID_STATE_FOR_COMMAND. Issuing replaces any request still
    /// awaiting a response.
    pub fn issue(&mut self, command: Command) -> Result<Vec<u8>> {
        self.check_legal(command)?;
        let data = self.encode(command)?;

        let mut req =
            PldmRequest::new_data(PLDM_TYPE_FW, command.cmd() as u8, data);
        req.iid = self.next_iid;
        self.next_iid = (self.next_iid + 1) & IID_MASK;

        let prev = self.pending.replace(Pending {
            iid: req.iid,
            command,
        });
        if let Some(p) = prev {
            debug!("{:?} iid {} abandoned", p.command, p.iid);
        }
        trace!("issue {command:?} iid {}", req.iid);
        Ok(req.to_vec())
    }

    /// Consumes the response to the outstanding request.
    ///
    /// A response that doesn't match the outstanding request fails with
    /// `UnexpectedResponse` and leaves the request outstanding. A decoded
    /// non-success completion code is returned as `Ok` and does not
    /// change state, except UNABLE_TO_INITIATE_UPDATE which aborts.
    pub fn process(&mut self, buf: &[u8]) -> Result<CompletionCode> {
        let rsp = PldmResponse::from_buf(buf)?;

        let Some(pending) = self.pending else {
            return Err(FwupError::UnexpectedResponse(format!(
                "{:#04x} iid {} with no request outstanding",
                rsp.cmd, rsp.iid
            )));
        };
        if rsp.typ != PLDM_TYPE_FW
            || rsp.iid != pending.iid
            || rsp.cmd != pending.command.cmd() as u8
        {
            return Err(FwupError::UnexpectedResponse(format!(
                "type {} cmd {:#04x} iid {}, expected {:?} iid {}",
                rsp.typ, rsp.cmd, rsp.iid, pending.command, pending.iid
            )));
        }
        self.pending = None;

        let command = pending.command;
        let cc = rsp.completion_code();
        self.cc = cc;
        trace!("{command:?} response {cc}");

        if !cc.is_success() {
            return self.process_failure(command, cc);
        }
        if let Err(e) = self.apply(command, &rsp.data) {
            if let FwupError::Pldm(pe) = &e {
                self.cc = CommandError::from(pe.clone()).into();
            }
            return Err(e);
        }
        Ok(cc)
    }

    fn process_failure(
        &mut self,
        command: Command,
        cc: CompletionCode,
    ) -> Result<CompletionCode> {
        if command == Command::RequestUpdate {
            if cc == FwCode::RETRY_REQUEST_UPDATE {
                debug!("device asked to retry RequestUpdate");
            } else if cc == FwCode::UNABLE_TO_INITIATE_UPDATE {
                warn!("device unable to initiate update");
                self.set_state(SessionState::Aborted);
                return Err(FwupError::Aborted(cc));
            }
        } else {
            debug!("{command:?} failed: {cc}");
        }
        Ok(cc)
    }

    fn apply(&mut self, command: Command, body: &[u8]) -> Result<()> {
        match command {
            Command::QueryDeviceIdentifiers => {
                let ids = decode(
                    "QueryDeviceIdentifiers",
                    body,
                    DeviceIdentifiers::parse_response,
                )?;
                debug!("device identifiers {ids}");
                self.device_ids = Some(ids);
            }
            Command::GetFirmwareParameters => {
                let fp = decode(
                    "GetFirmwareParameters",
                    body,
                    FirmwareParameters::parse,
                )?;
                debug!(
                    "active image set {}, {} components",
                    fp.active,
                    fp.components.len()
                );
                self.fw_params = Some(fp);
            }
            Command::RequestUpdate => {
                let r = decode("RequestUpdate", body, RequestUpdateResponse::parse)?;
                self.begin_update(&r)?;
            }
            Command::GetDeviceMetaData => {
                let r = decode("GetDeviceMetaData", body, MultipartResponse::parse)?;
                match self.metadata.accept(&r, &mut self.metadata_buf) {
                    Ok(true) => {
                        debug!("device metadata, {} bytes", self.metadata_buf.len());
                        self.metadata_done = true;
                    }
                    Ok(false) => (),
                    Err(e) => {
                        self.cc = e.completion_code();
                        return Err(e.into());
                    }
                }
            }
            Command::PassComponentTable => {
                let r = decode(
                    "PassComponentTable",
                    body,
                    PassComponentResponse::parse,
                )?;
                let i = self.passed;
                self.outcomes[i] = if r.response == 0 {
                    Outcome::Accepted
                } else {
                    debug!("component {i} won't be updated, code {}", r.code);
                    Outcome::Skipped
                };
                self.passed += 1;
                if self.passed == self.plan.components.len() {
                    self.set_state(SessionState::ReadyXfer);
                }
            }
            Command::UpdateComponent => {
                let r = decode(
                    "UpdateComponent",
                    body,
                    UpdateComponentResponse::parse,
                )?;
                let i = self
                    .next_component()
                    .ok_or(FwupError::InvalidState(self.state))?;
                self.next_update = i + 1;
                if r.compat_response == 0 {
                    let c = &self.plan.components[i];
                    info!(
                        "updating component {:#06x} to {}, {} bytes",
                        c.identifier,
                        c.version,
                        c.image.len()
                    );
                    self.current = Some(i);
                    self.component_failed = false;
                    self.set_state(SessionState::Download);
                } else {
                    warn!(
                        "component {i} rejected by UpdateComponent, code {}",
                        r.compat_code
                    );
                    self.outcomes[i] = Outcome::Skipped;
                }
            }
            Command::ActivateFirmware => {
                let r = decode(
                    "ActivateFirmware",
                    body,
                    ActivateFirmwareResponse::parse,
                )?;
                self.set_state(SessionState::Activate);
                info!(
                    "firmware activated, estimated time {}s",
                    r.estimated_time
                );
                self.activated = true;
                self.finished = true;
                self.set_state(SessionState::Idle);
            }
            Command::GetStatus => {
                let st = decode("GetStatus", body, GetStatusResponse::parse)?;
                debug!("device status {st}, progress {}", st.progress_percent);
                self.status = Some(st);
            }
            Command::CancelUpdateComponent => {
                if let Some(i) = self.current.take() {
                    self.outcomes[i] = Outcome::Failed;
                }
                self.component_failed = false;
                self.set_state(SessionState::ReadyXfer);
            }
            Command::CancelUpdate => {
                let r = if body.is_empty() {
                    CancelUpdateResponse::default()
                } else {
                    decode("CancelUpdate", body, CancelUpdateResponse::parse)?
                };
                if r.non_functioning != 0 {
                    warn!(
                        "update cancelled with non-functioning components {:#x}",
                        r.bitmap
                    );
                }
                info!("update cancelled");
                self.clear();
                self.finished = true;
            }
        }
        Ok(())
    }

    fn begin_update(&mut self, r: &RequestUpdateResponse) -> Result<()> {
        let len = r.fd_metadata_len as usize;
        if len > self.config.max_metadata_size {
            self.set_state(SessionState::Aborted);
            return Err(FwupError::Resource(format!(
                "device metadata of {len} bytes exceeds limit {}",
                self.config.max_metadata_size
            )));
        }
        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(len) {
            self.set_state(SessionState::Aborted);
            return Err(FwupError::Resource(format!("device metadata: {e}")));
        }
        self.metadata_buf = buf;
        self.metadata = Transfer::new(TransferKind::DeviceMetaData, len);
        self.metadata_done = len == 0;

        self.fd_will_send_gpd = r.fd_will_send_gpd != 0;
        if self.fd_will_send_gpd && self.plan.package_data.is_empty() {
            warn!("device will request package data, but there is none");
        }
        self.package.reset();
        self.package_done =
            !self.fd_will_send_gpd || self.plan.package_data.is_empty();

        info!(
            "update started, {} components, metadata {len} bytes{}",
            self.plan.components.len(),
            if self.fd_will_send_gpd { ", device pulls package data" } else { "" }
        );
        self.set_state(SessionState::LearnComponents);
        Ok(())
    }

    /// Answers a request initiated by the device.
    ///
    /// Returns the encoded response, which carries an error completion code
    /// when the request was rejected. That code is also recorded in
    /// [`completion_code`](Self::completion_code). Fails only when the
    /// request header can't be decoded.
    pub fn handle_request(&mut self, buf: &[u8]) -> Result<Vec<u8>> {
        let req = PldmRequest::from_buf(buf)?;
        let rsp = match self.serve(&req) {
            Ok(rsp) => rsp,
            Err(e) => {
                debug!("device request {:#04x} rejected: {e}", req.cmd);
                req.response_cc(e)
            }
        };
        self.cc = rsp.completion_code();
        Ok(rsp.to_vec())
    }

    fn serve(
        &mut self,
        req: &PldmRequest,
    ) -> core::result::Result<PldmResponse, CommandError> {
        use SessionState::*;

        if req.typ != PLDM_TYPE_FW {
            return Err(CCode::ERROR_INVALID_PLDM_TYPE.into());
        }
        let Some(cmd) = Cmd::from_u8(req.cmd) else {
            return Err(CCode::ERROR_UNSUPPORTED_PLDM_CMD.into());
        };
        trace!("serve {cmd:?} in {:?}", self.state);

        let expected = match cmd {
            Cmd::GetPackageData => {
                self.state == LearnComponents && self.fd_will_send_gpd
            }
            Cmd::RequestFirmwareData | Cmd::TransferComplete => {
                self.state == Download && !self.component_failed
            }
            Cmd::VerifyComplete => {
                self.state == Verify && !self.component_failed
            }
            Cmd::ApplyComplete => self.state == Apply && !self.component_failed,
            _ => return Err(CCode::ERROR_UNSUPPORTED_PLDM_CMD.into()),
        };
        if !expected {
            return Err(match self.state {
                Idle => FwCode::NOT_IN_UPDATE_MODE,
                _ => FwCode::COMMAND_NOT_EXPECTED,
            }
            .into());
        }

        let mut rsp = req.response();
        match cmd {
            Cmd::GetPackageData => {
                rsp.set_data(self.serve_package_data(&req.data)?)
            }
            Cmd::RequestFirmwareData => {
                rsp.set_data(self.serve_firmware_data(&req.data)?)
            }
            Cmd::TransferComplete => {
                let r = decode("TransferComplete", &req.data, ResultRequest::parse)?;
                if r.result == TransferResult::Success as u8 {
                    self.set_state(Verify);
                } else {
                    warn!("transfer failed: {:?}", TransferResult::from_u8(r.result));
                    self.component_failed = true;
                }
            }
            Cmd::VerifyComplete => {
                let r = decode("VerifyComplete", &req.data, ResultRequest::parse)?;
                if r.result == VerifyResult::Success as u8 {
                    self.set_state(Apply);
                } else {
                    warn!("verify failed: {:?}", VerifyResult::from_u8(r.result));
                    self.component_failed = true;
                }
            }
            Cmd::ApplyComplete => {
                let r = decode("ApplyComplete", &req.data, ApplyComplete::parse)?;
                match ApplyResult::from_u8(r.result) {
                    Some(a) if a.is_success() => self.component_applied(),
                    a => {
                        warn!("apply failed: {a:?}");
                        self.component_failed = true;
                    }
                }
            }
            _ => return Err(CCode::ERROR_UNSUPPORTED_PLDM_CMD.into()),
        }
        Ok(rsp)
    }

    fn serve_package_data(
        &mut self,
        body: &[u8],
    ) -> core::result::Result<Vec<u8>, CommandError> {
        let req = decode("GetPackageData", body, MultipartRequest::parse)?;
        let portion = self
            .config
            .portion_size
            .min(PLDM_MAX_MSGSIZE - PLDM_RSP_HEADER_LEN - MULTIPART_HEADER_LEN);
        let part = match self.package.serve(&req, &self.plan.package_data, portion)
        {
            Ok(part) => part,
            Err(e) => {
                if req.op() == Some(TransferOperationFlag::GetFirstPart) {
                    // the device is starting over, its next GetFirstPart is served
                    self.package.reset();
                }
                return Err(e.into());
            }
        };
        trace!(
            "package data {} bytes, flag {:?}",
            part.portion.len(),
            part.flag
        );
        if !self.package.in_progress() {
            debug!("package data sent");
            self.package_done = true;
        }

        let mut b = MsgBuf::new();
        part.write(&mut b)?;
        Ok(b.into_vec())
    }

    fn serve_firmware_data(
        &mut self,
        body: &[u8],
    ) -> core::result::Result<Vec<u8>, CommandError> {
        let req = decode("RequestFirmwareData", body, RequestFirmwareData::parse)?;
        let i = self.current.ok_or(FwCode::COMMAND_NOT_EXPECTED)?;
        let image = &self.plan.components[i].image;

        let (offset, length) = (req.offset as usize, req.length as usize);
        if length == 0 || length > self.config.max_transfer_size as usize {
            return Err(FwCode::INVALID_TRANSFER_LENGTH.into());
        }
        let end = offset
            .checked_add(length)
            .filter(|e| *e <= image.len())
            .ok_or(FwCode::DATA_OUT_OF_RANGE)?;

        trace!("firmware data {offset:#x}+{length:#x}");
        Ok(image[offset..end].to_vec())
    }

    fn component_applied(&mut self) {
        if let Some(i) = self.current.take() {
            self.outcomes[i] = Outcome::Updated;
            info!(
                "component {:#06x} applied",
                self.plan.components[i].identifier
            );
        }
        self.set_state(SessionState::ReadyXfer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwup_pldm::ComponentResponseCode;

    fn start_log() {
        let _ = env_logger::Builder::new()
            .filter(None, log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    }

    fn plan(package: usize, images: &[usize]) -> UpdatePlan {
        UpdatePlan {
            version: DescriptorString::new_str("set-2"),
            package_data: (0..package).map(|i| i as u8).collect(),
            components: images
                .iter()
                .enumerate()
                .map(|(i, n)| ComponentImage::new(i as u16, "2.0", vec![0xa5; *n]))
                .collect(),
        }
    }

    fn respond(
        req: &[u8],
        cc: impl Into<CompletionCode>,
        write: impl FnOnce(&mut MsgBuf) -> fwup_pldm::Result<()>,
    ) -> Vec<u8> {
        let req = PldmRequest::from_buf(req).unwrap();
        let mut b = MsgBuf::new();
        write(&mut b).unwrap();
        let mut rsp = req.response_cc(cc);
        rsp.set_data(b.into_vec());
        rsp.to_vec()
    }

    fn device_request(
        cmd: Cmd,
        write: impl FnOnce(&mut MsgBuf) -> fwup_pldm::Result<()>,
    ) -> Vec<u8> {
        let mut b = MsgBuf::new();
        write(&mut b).unwrap();
        PldmRequest::new_data(PLDM_TYPE_FW, cmd as u8, b.into_vec()).to_vec()
    }

    fn fd(
        s: &mut Session,
        cmd: Cmd,
        write: impl FnOnce(&mut MsgBuf) -> fwup_pldm::Result<()>,
    ) -> PldmResponse {
        let rsp = s.handle_request(&device_request(cmd, write)).unwrap();
        PldmResponse::from_buf(&rsp).unwrap()
    }

    fn response_cc(rsp: &[u8]) -> CompletionCode {
        PldmResponse::from_buf(rsp).unwrap().completion_code()
    }

    fn request_update(s: &mut Session, metadata_len: u16, gpd: bool) {
        let req = s.issue(Command::RequestUpdate).unwrap();
        let rsp = respond(&req, CCode::SUCCESS, |b| {
            RequestUpdateResponse {
                fd_metadata_len: metadata_len,
                fd_will_send_gpd: gpd as u8,
            }
            .write(b)
        });
        assert!(s.process(&rsp).unwrap().is_success());
    }

    fn pass_all(s: &mut Session, code: u8) {
        while s.current_state() == SessionState::LearnComponents {
            let req = s.issue(Command::PassComponentTable).unwrap();
            let rsp = respond(&req, CCode::SUCCESS, |b| {
                PassComponentResponse::new(code).write(b)
            });
            s.process(&rsp).unwrap();
        }
    }

    #[test]
    fn pass_component_before_request_update() {
        start_log();
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        assert_eq!(
            s.next_action(),
            Action::Issue(Command::QueryDeviceIdentifiers)
        );

        let e = s.issue(Command::PassComponentTable).unwrap_err();
        assert!(matches!(e, FwupError::InvalidState(SessionState::Idle)));
        assert_eq!(s.completion_code(), FwCode::NOT_IN_UPDATE_MODE);
        assert_eq!(s.current_state(), SessionState::Idle);

        assert!(s.issue(Command::UpdateComponent).is_err());
        assert_eq!(s.completion_code(), FwCode::NOT_IN_UPDATE_MODE);
        assert_eq!(s.current_state(), SessionState::Idle);
    }

    #[test]
    fn retry_request_update() {
        start_log();
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();

        let req = s.issue(Command::RequestUpdate).unwrap();
        let rsp = respond(&req, FwCode::RETRY_REQUEST_UPDATE, |_| Ok(()));
        assert_eq!(s.process(&rsp).unwrap(), FwCode::RETRY_REQUEST_UPDATE);
        assert_eq!(s.current_state(), SessionState::Idle);
        assert_eq!(s.completion_code(), FwCode::RETRY_REQUEST_UPDATE);

        request_update(&mut s, 0, false);
        assert_eq!(s.current_state(), SessionState::LearnComponents);
        assert_eq!(s.next_action(), Action::Issue(Command::PassComponentTable));
    }

    #[test]
    fn unable_to_initiate() {
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        let req = s.issue(Command::RequestUpdate).unwrap();
        let rsp = respond(&req, FwCode::UNABLE_TO_INITIATE_UPDATE, |_| Ok(()));
        let e = s.process(&rsp).unwrap_err();
        assert!(matches!(e, FwupError::Aborted(_)));
        assert_eq!(s.current_state(), SessionState::Aborted);
        assert_eq!(s.next_action(), Action::Finished);

        // only reset leaves Aborted
        assert!(s.issue(Command::RequestUpdate).is_err());
        s.load(plan(4, &[8])).unwrap();
        assert_eq!(s.current_state(), SessionState::Idle);
        assert!(s.issue(Command::RequestUpdate).is_ok());
    }

    #[test]
    fn load_while_updating() {
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        request_update(&mut s, 0, false);
        assert!(matches!(
            s.load(plan(0, &[1])),
            Err(FwupError::InvalidState(SessionState::LearnComponents))
        ));
        assert!(Session::new(SessionConfig::default(), plan(0, &[])).is_err());
    }

    #[test]
    fn package_data_pull() {
        start_log();
        let config = SessionConfig {
            portion_size: 10,
            ..Default::default()
        };
        let mut s = Session::new(config, plan(50, &[10])).unwrap();
        request_update(&mut s, 0, true);
        assert_eq!(s.next_action(), Action::AwaitRequest);

        let mut flags = vec![];
        let mut req = MultipartRequest::new(
            TransferOperationFlag::GetFirstPart,
            0,
        );
        let mut data = vec![];
        loop {
            let rsp = s
                .handle_request(&device_request(Cmd::GetPackageData, |b| {
                    req.write(b)
                }))
                .unwrap();
            let rsp = PldmResponse::from_buf(&rsp).unwrap();
            assert!(rsp.completion_code().is_success());
            let part = decode("", &rsp.data, MultipartResponse::parse).unwrap();
            flags.push(part.flag);
            data.extend_from_slice(&part.portion);
            if part.flag.is_end() {
                break;
            }
            req = MultipartRequest::new(
                TransferOperationFlag::GetNextPart,
                part.next_handle,
            );
        }

        use TransferFlag::*;
        assert_eq!(flags, [Start, Middle, Middle, Middle, End]);
        assert_eq!(data, s.plan().package_data);
        assert!(!s.package_transfer().in_progress());
        assert_eq!(s.package_transfer().last_handle(), 50);
        assert_eq!(s.next_action(), Action::Issue(Command::PassComponentTable));

        // a stray next part after the end
        let rsp = s
            .handle_request(&device_request(Cmd::GetPackageData, |b| {
                MultipartRequest::new(
                    TransferOperationFlag::GetNextPart,
                    50,
                )
                .write(b)
            }))
            .unwrap();
        assert_eq!(response_cc(&rsp), FwCode::INVALID_TRANSFER_OPERATION_FLAG);
        assert_eq!(s.completion_code(), FwCode::INVALID_TRANSFER_OPERATION_FLAG);
    }

    #[test]
    fn package_data_restart() {
        let config = SessionConfig {
            portion_size: 10,
            ..Default::default()
        };
        let mut s = Session::new(config, plan(30, &[10])).unwrap();
        request_update(&mut s, 0, true);
        let get = |s: &mut Session, op, handle| {
            let rsp = s
                .handle_request(&device_request(Cmd::GetPackageData, |b| {
                    MultipartRequest::new(op, handle).write(b)
                }))
                .unwrap();
            PldmResponse::from_buf(&rsp).unwrap()
        };

        let rsp = get(&mut s, TransferOperationFlag::GetFirstPart, 0);
        assert!(rsp.completion_code().is_success());

        // the device gave up partway, its restart is refused once
        let rsp = get(&mut s, TransferOperationFlag::GetFirstPart, 0);
        assert_eq!(
            rsp.completion_code(),
            FwCode::INVALID_TRANSFER_OPERATION_FLAG
        );
        assert!(!s.package_transfer().in_progress());
        assert_eq!(s.next_action(), Action::AwaitRequest);

        let rsp = get(&mut s, TransferOperationFlag::GetFirstPart, 0);
        let part = decode("", &rsp.data, MultipartResponse::parse).unwrap();
        assert_eq!(part.flag, TransferFlag::Start);
        assert_eq!(part.next_handle, 10);
    }

    #[test]
    fn metadata_limit() {
        let config = SessionConfig {
            max_metadata_size: 100,
            ..Default::default()
        };
        let mut s = Session::new(config, plan(0, &[10])).unwrap();
        let req = s.issue(Command::RequestUpdate).unwrap();
        let rsp = respond(&req, CCode::SUCCESS, |b| {
            RequestUpdateResponse {
                fd_metadata_len: 101,
                fd_will_send_gpd: 0,
            }
            .write(b)
        });
        assert!(matches!(s.process(&rsp), Err(FwupError::Resource(_))));
        assert_eq!(s.current_state(), SessionState::Aborted);
    }

    #[test]
    fn metadata_pull() {
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        request_update(&mut s, 12, false);
        let md: Vec<u8> = (100..112).collect();

        let mut served = Transfer::new(TransferKind::DeviceMetaData, 0);
        while s.next_action() == Action::Issue(Command::GetDeviceMetaData) {
            let req = s.issue(Command::GetDeviceMetaData).unwrap();
            let mp = decode(
                "",
                &PldmRequest::from_buf(&req).unwrap().data,
                MultipartRequest::parse,
            )
            .unwrap();
            let part = served.serve(&mp, &md, 5).unwrap();
            let rsp = respond(&req, CCode::SUCCESS, |b| part.write(b));
            s.process(&rsp).unwrap();
        }
        assert_eq!(s.device_metadata(), Some(md.as_slice()));
        assert_eq!(s.next_action(), Action::Issue(Command::PassComponentTable));
    }

    #[test]
    fn stale_response() {
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        let old = s.issue(Command::GetStatus).unwrap();
        let req = s.issue(Command::RequestUpdate).unwrap();

        let stale = respond(&old, CCode::SUCCESS, |_| Ok(()));
        assert!(matches!(
            s.process(&stale),
            Err(FwupError::UnexpectedResponse(_))
        ));

        // still waiting for the real one
        let rsp = respond(&req, CCode::SUCCESS, |b| {
            RequestUpdateResponse {
                fd_metadata_len: 0,
                fd_will_send_gpd: 0,
            }
            .write(b)
        });
        s.process(&rsp).unwrap();
        assert_eq!(s.current_state(), SessionState::LearnComponents);

        // and nothing outstanding now
        assert!(matches!(
            s.process(&rsp),
            Err(FwupError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn truncated_response() {
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        let req = s.issue(Command::RequestUpdate).unwrap();
        let rsp = respond(&req, CCode::SUCCESS, |b| b.push_le8(0));
        assert!(matches!(
            s.process(&rsp),
            Err(FwupError::Pldm(fwup_pldm::PldmError::Truncated(_)))
        ));
        assert_eq!(s.current_state(), SessionState::Idle);
        assert_eq!(s.completion_code(), CCode::ERROR_INVALID_LENGTH);
    }

    #[test]
    fn small_transfer_size() {
        let cfg = SessionConfig {
            max_transfer_size: PLDM_FW_BASELINE_TRANSFER as u32 - 1,
            ..Default::default()
        };
        assert!(matches!(
            Session::new(cfg, plan(0, &[10])),
            Err(FwupError::InvalidArgument(_))
        ));
        let cfg = SessionConfig {
            max_transfer_size: PLDM_FW_BASELINE_TRANSFER as u32,
            ..Default::default()
        };
        assert!(Session::new(cfg, plan(0, &[10])).is_ok());
    }

    #[test]
    fn component_cycle() {
        start_log();
        let mut s = Session::new(SessionConfig::default(), plan(0, &[40, 8])).unwrap();
        request_update(&mut s, 0, false);
        pass_all(&mut s, 0);
        assert_eq!(s.current_state(), SessionState::ReadyXfer);

        // a failing completion code does not advance
        let req = s.issue(Command::UpdateComponent).unwrap();
        let rsp = respond(&req, FwCode::INVALID_STATE_FOR_COMMAND, |_| Ok(()));
        assert_eq!(s.process(&rsp).unwrap(), FwCode::INVALID_STATE_FOR_COMMAND);
        assert_eq!(s.current_state(), SessionState::ReadyXfer);

        let req = s.issue(Command::UpdateComponent).unwrap();
        let rsp = respond(&req, CCode::SUCCESS, |b| {
            UpdateComponentResponse {
                compat_response: 0,
                compat_code: 0,
                flags_enabled: 0,
                estimated_time: 0,
            }
            .write(b)
        });
        s.process(&rsp).unwrap();
        assert_eq!(s.current_state(), SessionState::Download);
        assert_eq!(s.next_action(), Action::AwaitRequest);

        let r = fd(&mut s, Cmd::RequestFirmwareData, |b| {
            RequestFirmwareData {
                offset: 32,
                length: 8,
            }
            .write(b)
        });
        assert!(r.completion_code().is_success());
        assert_eq!(r.data, [0xa5; 8]);

        let r = fd(&mut s, Cmd::RequestFirmwareData, |b| {
            RequestFirmwareData {
                offset: 36,
                length: 8,
            }
            .write(b)
        });
        assert_eq!(r.completion_code(), FwCode::DATA_OUT_OF_RANGE);

        let r = fd(&mut s, Cmd::RequestFirmwareData, |b| {
            RequestFirmwareData {
                offset: 0,
                length: 513,
            }
            .write(b)
        });
        assert_eq!(r.completion_code(), FwCode::INVALID_TRANSFER_LENGTH);

        // out of order
        let r = fd(&mut s, Cmd::VerifyComplete, |b| b.push_le8(0));
        assert_eq!(r.completion_code(), FwCode::COMMAND_NOT_EXPECTED);

        fd(&mut s, Cmd::TransferComplete, |b| b.push_le8(0));
        assert_eq!(s.current_state(), SessionState::Verify);
        fd(&mut s, Cmd::VerifyComplete, |b| b.push_le8(0));
        assert_eq!(s.current_state(), SessionState::Apply);
        fd(&mut s, Cmd::ApplyComplete, |b| {
            b.push_le8(0)?;
            b.push_le16(0)
        });
        assert_eq!(s.current_state(), SessionState::ReadyXfer);
        assert_eq!(s.updated_components(), 1);

        // second component fails transfer
        let req = s.issue(Command::UpdateComponent).unwrap();
        let rsp = respond(&req, CCode::SUCCESS, |b| {
            UpdateComponentResponse {
                compat_response: 0,
                compat_code: 0,
                flags_enabled: 0,
                estimated_time: 0,
            }
            .write(b)
        });
        s.process(&rsp).unwrap();
        fd(&mut s, Cmd::TransferComplete, |b| {
            b.push_le8(TransferResult::Corrupt as u8)
        });
        assert_eq!(s.current_state(), SessionState::Download);
        assert_eq!(
            s.next_action(),
            Action::Issue(Command::CancelUpdateComponent)
        );
        let req = s.issue(Command::CancelUpdateComponent).unwrap();
        s.process(&respond(&req, CCode::SUCCESS, |_| Ok(()))).unwrap();
        assert_eq!(s.current_state(), SessionState::ReadyXfer);

        assert_eq!(s.next_action(), Action::Issue(Command::ActivateFirmware));
        let req = s.issue(Command::ActivateFirmware).unwrap();
        s.process(&respond(&req, CCode::SUCCESS, |b| {
            ActivateFirmwareResponse { estimated_time: 0 }.write(b)
        }))
        .unwrap();
        assert!(s.activated());
        assert_eq!(s.current_state(), SessionState::Idle);
        assert_eq!(s.next_action(), Action::Finished);
    }

    #[test]
    fn device_requests_out_of_state() {
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        let req = device_request(Cmd::RequestFirmwareData, |b| {
            RequestFirmwareData {
                offset: 0,
                length: 8,
            }
            .write(b)
        });
        let rsp = s.handle_request(&req).unwrap();
        assert_eq!(response_cc(&rsp), FwCode::NOT_IN_UPDATE_MODE);

        request_update(&mut s, 0, false);
        let rsp = s.handle_request(&req).unwrap();
        assert_eq!(response_cc(&rsp), FwCode::COMMAND_NOT_EXPECTED);
        assert_eq!(s.completion_code(), FwCode::COMMAND_NOT_EXPECTED);

        // not offered to the device
        let rsp = s
            .handle_request(&device_request(Cmd::GetPackageData, |b| {
                MultipartRequest::new(
                    TransferOperationFlag::GetFirstPart,
                    0,
                )
                .write(b)
            }))
            .unwrap();
        assert_eq!(response_cc(&rsp), FwCode::COMMAND_NOT_EXPECTED);

        let rsp = s
            .handle_request(&device_request(Cmd::QueryDeviceIdentifiers, |_| Ok(())))
            .unwrap();
        assert_eq!(response_cc(&rsp), CCode::ERROR_UNSUPPORTED_PLDM_CMD);
    }

    #[test]
    fn cancel_update() {
        let mut s = Session::new(SessionConfig::default(), plan(0, &[10])).unwrap();
        request_update(&mut s, 0, false);
        pass_all(&mut s, ComponentResponseCode::NotSupported as u8);
        assert_eq!(s.next_action(), Action::Issue(Command::CancelUpdate));
        let req = s.issue(Command::CancelUpdate).unwrap();
        s.process(&respond(&req, CCode::SUCCESS, |b| {
            CancelUpdateResponse::default().write(b)
        }))
        .unwrap();
        assert_eq!(s.current_state(), SessionState::Idle);
        assert_eq!(s.next_action(), Action::Finished);
        assert!(!s.activated());
    }
}
