// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Runs the update agent and the firmware device over a [`CmdChannel`].
//!
//! An [`Endpoint`] carries PLDM messages to and from one peer. [`run_session`]
//! drives a [`Session`] to completion, answering the device's requests
//! while waiting for responses. [`run_responder`] services a [`Responder`].

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::time::Duration;

use fwup_channel::{
    Assembler, CmdChannel, Dispatch, Eid, Error, Message, Tag, TagValue,
    Timeout, Transport, MCTP_TYPE_PLDM, TAG_MAX,
};
use fwup_pldm::{CompletionCode, FwCode};

use crate::session::{Action, Command, Session, SessionConfig, SessionState};
use crate::{Device, FwupError, Responder, Result, UpdatePlan};

/// Receive interval of [`run_responder`]
pub const RESPONDER_POLL: Duration = Duration::from_millis(10);

/// A received PLDM message
#[derive(Debug, Clone)]
pub struct Incoming {
    /// PLDM message, starting with the PLDM header
    pub data: Vec<u8>,
    /// Source endpoint
    pub eid: Eid,
    /// Tag of the message
    pub tag: Tag,
    /// Bus address to reply to
    pub addr: u8,
}

impl Incoming {
    /// Returns `true` for a PLDM request
    pub fn is_request(&self) -> bool {
        fwup_pldm::is_request(&self.data)
    }
}

// Holds the last message completed by the assembler
struct Inbox(Option<Message>);

impl Dispatch for Inbox {
    type Error = Error;

    fn dispatch(&mut self, m: Message) -> core::result::Result<(), Error> {
        if self.0.is_some() {
            debug!("Dropping unread message");
        }
        self.0 = Some(m);
        Ok(())
    }
}

/// PLDM messaging with one peer over a shared channel
pub struct Endpoint<'c, T: Transport> {
    chan: &'c CmdChannel<T>,
    asm: Assembler,
    own_eid: Eid,
    peer: Eid,
    peer_addr: u8,
    next_tag: u8,
}

impl<'c, T: Transport> Endpoint<'c, T> {
    /// Creates an endpoint for `own_eid`, talking to `peer` at bus
    /// address `peer_addr`.
    pub fn new(
        chan: &'c CmdChannel<T>,
        own_eid: Eid,
        peer: Eid,
        peer_addr: u8,
    ) -> Self {
        Self {
            chan,
            asm: Assembler::new(own_eid),
            own_eid,
            peer,
            peer_addr,
            next_tag: 0,
        }
    }

    /// Local endpoint ID
    pub fn own_eid(&self) -> Eid {
        self.own_eid
    }

    /// Peer endpoint ID
    pub fn peer(&self) -> Eid {
        self.peer
    }

    /// Sends a request to the peer, returning the allocated tag.
    pub fn send_request(&mut self, data: Vec<u8>) -> Result<Tag> {
        self.send_request_to(self.peer, data)
    }

    /// Sends a request to `eid`, via the peer's bus address.
    pub fn send_request_to(&mut self, eid: Eid, data: Vec<u8>) -> Result<Tag> {
        let tag = Tag::Owned(TagValue(self.next_tag));
        self.next_tag = (self.next_tag + 1) & TAG_MAX;

        let msg = Message::new(MCTP_TYPE_PLDM, eid, tag, self.peer_addr, data);
        self.chan.send_message(&msg, self.own_eid)?;
        Ok(tag)
    }

    /// Sends a response to a received request.
    pub fn send_response(&self, to: &Incoming, data: Vec<u8>) -> Result<()> {
        let tag = Tag::Unowned(to.tag.tag());
        let msg = Message::new(MCTP_TYPE_PLDM, to.eid, tag, to.addr, data);
        self.chan.send_message(&msg, self.own_eid)?;
        Ok(())
    }

    /// Waits for the next PLDM message.
    ///
    /// Other message types and bad packets are dropped. Fails with
    /// `RxTimeout` when nothing arrives in time.
    pub fn recv(&mut self, timeout: Timeout) -> Result<Incoming> {
        let mut deadline = timeout.start();
        let mut inbox = Inbox(None);

        while let Some(t) = deadline.remaining() {
            match self.chan.receive_and_process(&mut self.asm, &mut inbox, t) {
                Ok(true) => (),
                Ok(false) | Err(Error::RxTimeout) => continue,
                Err(e @ (Error::RxFailed | Error::Medium(_))) => {
                    return Err(e.into())
                }
                Err(e) => {
                    debug!("Dropped packet: {e}");
                    continue;
                }
            }

            let Some(m) = inbox.0.take() else {
                continue;
            };
            if m.typ != MCTP_TYPE_PLDM {
                trace!("Ignoring message type {:?} from {}", m.typ, m.eid);
                continue;
            }
            return Ok(Incoming {
                data: m.data,
                eid: m.eid,
                tag: m.tag,
                addr: m.dest_addr,
            });
        }
        Err(Error::RxTimeout.into())
    }
}

/// Answers a device request, if `msg` is one from the session's device.
fn answer<T: Transport>(
    ep: &mut Endpoint<T>,
    session: &mut Session,
    msg: &Incoming,
) -> Result<()> {
    if msg.eid != ep.peer() {
        debug!("Ignoring request from {}", msg.eid);
        return Ok(());
    }
    let rsp = session.handle_request(&msg.data)?;
    ep.send_response(msg, rsp)
}

/// Issues `command` and waits for its response.
///
/// Device requests arriving meanwhile are answered. Responses that don't
/// match the outstanding request are discarded. Returns the response's
/// completion code.
pub fn exchange<T: Transport>(
    ep: &mut Endpoint<T>,
    session: &mut Session,
    command: Command,
) -> Result<CompletionCode> {
    let req = session.issue(command)?;
    let sent = ep.send_request(req)?;
    let mut deadline = Timeout::from(session.config().response_timeout).start();

    loop {
        let t = deadline.remaining().ok_or(Error::RxTimeout)?;
        let msg = ep.recv(t)?;

        if msg.is_request() {
            answer(ep, session, &msg)?;
            continue;
        }
        if msg.eid != ep.peer() || msg.tag != Tag::Unowned(sent.tag()) {
            debug!("Discarding response from {} tag {}", msg.eid, msg.tag);
            continue;
        }
        match session.process(&msg.data) {
            Err(FwupError::UnexpectedResponse(e)) => {
                debug!("Discarding response: {e}");
            }
            r => return r,
        }
    }
}

/// Waits for one device request and answers it.
pub fn serve_next<T: Transport>(
    ep: &mut Endpoint<T>,
    session: &mut Session,
) -> Result<()> {
    let mut deadline = Timeout::from(session.config().response_timeout).start();
    loop {
        let t = deadline.remaining().ok_or(Error::RxTimeout)?;
        let msg = ep.recv(t)?;
        if msg.is_request() {
            return answer(ep, session, &msg);
        }
        debug!("Discarding late response from {}", msg.eid);
    }
}

/// Drives `session` until it finishes.
///
/// Succeeds once firmware has been activated. A device that keeps asking
/// for RequestUpdate to be retried is given the configured number of
/// retries.
pub fn run_session<T: Transport>(
    ep: &mut Endpoint<T>,
    session: &mut Session,
) -> Result<()> {
    let mut retries = 0;

    loop {
        match session.next_action() {
            Action::Issue(command) => {
                let cc = exchange(ep, session, command)?;
                if cc.is_success() {
                    continue;
                }

                let cfg = session.config();
                if command == Command::RequestUpdate
                    && cc == FwCode::RETRY_REQUEST_UPDATE
                    && retries < cfg.request_update_retries
                {
                    retries += 1;
                    info!(
                        "RequestUpdate retry {retries}/{} in {:?}",
                        cfg.request_update_retries, cfg.retry_delay
                    );
                    std::thread::sleep(cfg.retry_delay);
                    continue;
                }
                return Err(FwupError::Command(command.cmd(), cc));
            }
            Action::AwaitRequest => serve_next(ep, session)?,
            Action::Finished => break,
        }
    }

    if session.activated() {
        info!("update complete, {} components", session.updated_components());
        Ok(())
    } else if session.current_state() == SessionState::Aborted {
        Err(FwupError::Aborted(session.completion_code()))
    } else {
        Err(FwupError::NothingUpdated)
    }
}

/// Updates the endpoint's peer with `plan`, returning the finished session.
pub fn perform_update<T: Transport>(
    ep: &mut Endpoint<T>,
    config: SessionConfig,
    plan: UpdatePlan,
) -> Result<Session> {
    let mut session = Session::new(config, plan)?;
    run_session(ep, &mut session)?;
    Ok(session)
}

/// Services a firmware device until `stop` returns `true`.
///
/// `stop` is checked before each receive.
pub fn run_responder<T, D, F>(
    ep: &mut Endpoint<T>,
    responder: &mut Responder,
    dev: &mut D,
    mut stop: F,
) -> Result<()>
where
    T: Transport,
    D: Device,
    F: FnMut(&Responder) -> bool,
{
    while !stop(responder) {
        if let Some(req) = responder.progress(dev) {
            let ua = responder.ua_eid().unwrap_or(ep.peer());
            ep.send_request_to(ua, req)?;
        }

        let msg = match ep.recv(Timeout::After(RESPONDER_POLL)) {
            Ok(msg) => msg,
            Err(FwupError::Channel(Error::RxTimeout)) => continue,
            Err(e) => return Err(e),
        };

        if msg.is_request() {
            match responder.request_in(msg.eid, &msg.data, dev) {
                Ok(rsp) => ep.send_response(&msg, rsp)?,
                Err(e) => debug!("Bad request from {}: {e}", msg.eid),
            }
        } else if let Err(e) = responder.reply_in(msg.eid, &msg.data, dev) {
            debug!("Response from {} not used: {e}", msg.eid);
        }
    }
    Ok(())
}
