// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §12 dialog state management.
//!
//! A half-dialog is created the moment an INVITE leaves the user agent and
//! is promoted on the first response carrying a To-tag: 1xx makes the
//! dialog early, 2xx confirms it and obliges an ACK towards the Contact of
//! the response. Route sets come from the reversed Record-Route list of
//! the promoting response; local CSeq is strictly monotonic for every
//! in-dialog request except ACK and CANCEL.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use smol_str::SmolStr;
use tinysip_core::{CSeq, Headers, Method, NameAddr, Request, RequestLine, Response, SipUri};
use tinysip_parse::{parse_contact_header, parse_from_header, parse_to_header, route_set};
use tracing::{debug, warn};

/// Dialog lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a provisional response carrying a To-tag.
    Early,
    /// Established by a 2xx; the ACK has been (UAC) or is awaited (UAS).
    Confirmed,
    /// Torn down by BYE, 481 or an error response.
    Terminated,
}

/// Unique dialog identifier: (Call-ID, local tag, remote tag).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Dialog id seen from the UAC side of a response (From tag is local).
    pub fn from_response_uac(response: &Response) -> Option<Self> {
        let call_id = response.header("Call-ID")?.clone();
        let local = parse_from_header(response.header("From")?)?.tag()?.clone();
        let remote = parse_to_header(response.header("To")?)?.tag()?.clone();
        Some(Self::new(call_id, local, remote))
    }

    /// Dialog id seen from the UAS side of a request (To tag is local).
    pub fn from_request_uas(request: &Request) -> Option<Self> {
        let call_id = request.header("Call-ID")?.clone();
        let local = parse_to_header(request.header("To")?)?.tag()?.clone();
        let remote = parse_from_header(request.header("From")?)?.tag()?.clone();
        Some(Self::new(call_id, local, remote))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Pending UAC dialog: the INVITE is out, no To-tag has arrived yet.
#[derive(Debug, Clone)]
pub struct HalfDialog {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub local: NameAddr,
    pub remote: NameAddr,
    pub target: SipUri,
    pub invite_cseq: u32,
    pub secure: bool,
}

impl HalfDialog {
    /// Captures dialog-relevant state from an outgoing INVITE.
    pub fn from_invite(invite: &Request) -> Option<Self> {
        let call_id = invite.header("Call-ID")?.clone();
        let local = parse_from_header(invite.header("From")?)?;
        let local_tag = local.tag()?.clone();
        let remote = parse_to_header(invite.header("To")?)?;
        let invite_cseq = invite.header("CSeq").and_then(|v| CSeq::parse(v))?.seq;
        Some(Self {
            call_id,
            local_tag,
            local,
            remote,
            target: invite.uri().clone(),
            invite_cseq,
            secure: invite.uri().sips,
        })
    }

    /// Promotes the half-dialog on the first response bearing a To-tag.
    /// Returns `None` while the response has no tag (dialog stays half).
    pub fn promote(&self, response: &Response) -> Option<Dialog> {
        let to = parse_to_header(response.header("To")?)?;
        let remote_tag = to.tag()?.clone();

        let state = if response.is_success() {
            DialogState::Confirmed
        } else if response.is_provisional() {
            DialogState::Early
        } else {
            return None;
        };

        // Remote target from Contact; the request URI is the fallback when
        // the peer omitted one in a provisional.
        let remote_target = response
            .header("Contact")
            .and_then(parse_contact_header)
            .map(|c| c.uri)
            .unwrap_or_else(|| self.target.clone());

        // Route set: reversed Record-Route of the response (UAC view).
        let mut routes = route_set(&response.headers, "Record-Route");
        routes.reverse();

        let mut remote = self.remote.clone();
        remote.set_tag(&remote_tag);

        debug!(
            call_id = %self.call_id,
            local_tag = %self.local_tag,
            remote_tag = %remote_tag,
            state = ?state,
            "dialog promoted"
        );

        Some(Dialog {
            id: DialogId::new(self.call_id.clone(), self.local_tag.clone(), remote_tag),
            state,
            local: self.local.clone(),
            remote,
            local_seq: self.invite_cseq,
            remote_seq: None,
            remote_target,
            route_set: routes,
            secure: self.secure,
            invite_cseq: self.invite_cseq,
            last_ack: None,
        })
    }
}

/// An established dialog (early or confirmed).
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local: NameAddr,
    pub remote: NameAddr,
    /// Last CSeq we used inside this dialog.
    pub local_seq: u32,
    /// Highest CSeq seen from the peer, once known.
    pub remote_seq: Option<u32>,
    /// Where in-dialog requests go: the peer's Contact.
    pub remote_target: SipUri,
    /// Route headers for in-dialog requests, in emission order.
    pub route_set: Vec<NameAddr>,
    pub secure: bool,
    invite_cseq: u32,
    last_ack: Option<Request>,
}

impl Dialog {
    /// Updates an early dialog from the confirming 2xx: state, remote
    /// target and route set all refresh.
    pub fn confirm(&mut self, response: &Response) {
        if self.state == DialogState::Terminated {
            return;
        }
        if let Some(contact) = response.header("Contact").and_then(parse_contact_header) {
            self.remote_target = contact.uri;
        }
        let mut routes = route_set(&response.headers, "Record-Route");
        routes.reverse();
        if !routes.is_empty() {
            self.route_set = routes;
        }
        self.state = DialogState::Confirmed;
    }

    /// Builds the ACK for the 2xx that confirmed this dialog. The CSeq
    /// number equals the INVITE's; the branch must be fresh and is supplied
    /// by the caller. The ACK is remembered so 2xx retransmissions can be
    /// answered again.
    pub fn ack(&mut self, via_value: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via_value);
        headers.push("From", self.local.to_string());
        headers.push("To", self.remote.to_string());
        headers.push("Call-ID", self.call_id().clone());
        headers.push("CSeq", format!("{} ACK", self.invite_cseq));
        for route in &self.route_set {
            headers.push("Route", route.to_string());
        }
        headers.push("Max-Forwards", "70");

        let ack = Request::new(
            RequestLine::new(Method::Ack, self.remote_target.clone()),
            headers,
            Bytes::new(),
        );
        self.last_ack = Some(ack.clone());
        ack
    }

    /// Re-emits the stored ACK for a retransmitted 2xx.
    pub fn last_ack(&self) -> Option<&Request> {
        self.last_ack.as_ref()
    }

    /// Builds an in-dialog request. Consumes the next CSeq for everything
    /// but ACK and CANCEL. The Via is stamped by the caller, which owns
    /// branch generation.
    pub fn next_request(&mut self, method: Method) -> Request {
        let seq = if method.reuses_dialog_cseq() {
            self.local_seq
        } else {
            self.local_seq += 1;
            self.local_seq
        };

        let mut headers = Headers::new();
        headers.push("From", self.local.to_string());
        headers.push("To", self.remote.to_string());
        headers.push("Call-ID", self.call_id().clone());
        headers.push("CSeq", format!("{} {}", seq, method));
        for route in &self.route_set {
            headers.push("Route", route.to_string());
        }
        headers.push("Max-Forwards", "70");

        Request::new(
            RequestLine::new(method, self.remote_target.clone()),
            headers,
            Bytes::new(),
        )
    }

    /// Records an inbound in-dialog request's CSeq; rejects regressions.
    pub fn observe_remote_cseq(&mut self, seq: u32) -> bool {
        match self.remote_seq {
            Some(existing) if seq < existing => {
                warn!(dialog = %self.id, seq, existing, "out-of-order in-dialog CSeq");
                false
            }
            _ => {
                self.remote_seq = Some(seq);
                true
            }
        }
    }

    /// Confirms a UAS-side dialog when the ACK for our 2xx arrives.
    pub fn confirm_on_ack(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn call_id(&self) -> &SmolStr {
        &self.id.call_id
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }
}

/// Owns every dialog of one user agent, plus the half-dialogs whose
/// INVITE is still unanswered. Keyed by id; components reference dialogs
/// by id only.
#[derive(Debug, Default)]
pub struct DialogLayer {
    dialogs: HashMap<DialogId, Dialog>,
    half: HashMap<(SmolStr, SmolStr), HalfDialog>,
}

impl DialogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the half-dialog for an INVITE we just sent.
    pub fn register_invite(&mut self, invite: &Request) -> Option<(SmolStr, SmolStr)> {
        let half = HalfDialog::from_invite(invite)?;
        let key = (half.call_id.clone(), half.local_tag.clone());
        self.half.insert(key.clone(), half);
        Some(key)
    }

    /// Drops the half-dialog of a failed INVITE.
    pub fn abandon_invite(&mut self, key: &(SmolStr, SmolStr)) {
        self.half.remove(key);
    }

    /// Applies a response to the INVITE identified by `key`. Promotes the
    /// half-dialog or updates the already-promoted dialog, returning the
    /// dialog id when one exists afterwards.
    pub fn on_invite_response(
        &mut self,
        key: &(SmolStr, SmolStr),
        response: &Response,
    ) -> Option<DialogId> {
        let remote_tag = response
            .header("To")
            .and_then(|v| parse_to_header(v))
            .and_then(|to| to.tag().cloned())?;
        let id = DialogId::new(key.0.clone(), key.1.clone(), remote_tag);

        if self.dialogs.contains_key(&id) {
            if response.is_success() {
                if let Some(dialog) = self.dialogs.get_mut(&id) {
                    dialog.confirm(response);
                }
                self.half.remove(key);
            }
            return Some(id);
        }

        let half = self.half.get(key)?;
        let dialog = half.promote(response)?;
        if dialog.is_confirmed() {
            self.half.remove(key);
        }
        self.dialogs.insert(id.clone(), dialog);
        Some(id)
    }

    /// Registers the UAS-side dialog created by answering an INVITE with a
    /// tagged 2xx. The dialog stays early until the peer's ACK arrives.
    pub fn register_uas(&mut self, request: &Request, response: &Response) -> Option<DialogId> {
        let local = parse_to_header(response.header("To")?)?;
        let local_tag = local.tag()?.clone();
        let remote = parse_from_header(request.header("From")?)?;
        let remote_tag = remote.tag()?.clone();
        let call_id = request.header("Call-ID")?.clone();
        let id = DialogId::new(call_id, local_tag, remote_tag);
        if self.dialogs.contains_key(&id) {
            return Some(id);
        }

        let remote_target = request
            .header("Contact")
            .and_then(parse_contact_header)
            .map(|c| c.uri)
            .unwrap_or_else(|| remote.uri.clone());
        let invite_cseq = request.header("CSeq").and_then(|v| CSeq::parse(v))?.seq;

        let dialog = Dialog {
            id: id.clone(),
            state: DialogState::Early,
            local,
            remote,
            local_seq: 0,
            remote_seq: Some(invite_cseq),
            remote_target,
            // UAS view: Record-Route in received order (§12.1.1).
            route_set: route_set(&request.headers, "Record-Route"),
            secure: request.uri().sips,
            invite_cseq,
            last_ack: None,
        };
        self.dialogs.insert(id.clone(), dialog);
        Some(id)
    }

    pub fn get(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    pub fn get_mut(&mut self, id: &DialogId) -> Option<&mut Dialog> {
        self.dialogs.get_mut(id)
    }

    /// Finds the dialog an inbound in-dialog request belongs to.
    pub fn find_for_request(&mut self, request: &Request) -> Option<&mut Dialog> {
        let id = DialogId::from_request_uas(request)?;
        self.dialogs.get_mut(&id)
    }

    /// Terminates and removes a dialog, returning it when it existed.
    pub fn terminate(&mut self, id: &DialogId) -> Option<Dialog> {
        let mut dialog = self.dialogs.remove(id)?;
        dialog.terminate();
        Some(dialog)
    }

    pub fn confirmed_count(&self) -> usize {
        self.dialogs.values().filter(|d| d.is_confirmed()).count()
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }
}
