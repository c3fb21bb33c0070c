// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer: the four state machines, transaction
//! keys and matching rules, and the deadline-based timer service.
//!
//! The state machines are pure: events in, actions out. The owner (the
//! user-agent dispatcher) applies actions — transmitting bytes, scheduling
//! and cancelling timers, delivering responses upward.

use smol_str::SmolStr;
use tinysip_core::{random_hex, CSeq, Method, Request, Response, BRANCH_MAGIC_COOKIE};
use tinysip_parse::top_via;

pub mod fsm;
pub mod timer;

pub use fsm::{
    ack_for_non_2xx, ClientAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent,
    ClientNonInviteFsm, ServerAction, ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent,
    ServerNonInviteFsm, TxTermination,
};
pub use timer::{TimerHandle, TimerQueue, TimerSettings};

/// Timers referenced by the transaction state machines (RFC 3261 §17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Which side of the transaction this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxRole {
    Client,
    Server,
}

/// Transaction key per RFC 3261 §17.1.3 / §17.2.3: the top Via branch and
/// sent-by plus the method, with ACK collapsing onto the INVITE it
/// acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub sent_by: SmolStr,
    pub method: Method,
    pub role: TxRole,
}

impl TransactionKey {
    pub fn new(branch: SmolStr, sent_by: SmolStr, method: Method, role: TxRole) -> Self {
        let method = match method {
            Method::Ack => Method::Invite,
            other => other,
        };
        Self {
            branch,
            sent_by,
            method,
            role,
        }
    }

    /// Key for a request we are about to send (client side).
    pub fn for_outbound_request(req: &Request) -> Option<Self> {
        let via = top_via(&req.headers)?;
        Some(Self::new(
            via.branch()?.clone(),
            via.sent_by.clone(),
            req.method().clone(),
            TxRole::Client,
        ))
    }

    /// Key for an inbound request (server side). Returns `None` when the
    /// top Via lacks a magic-cookie branch; callers fall back to
    /// [`LegacyKey`] matching.
    pub fn for_inbound_request(req: &Request) -> Option<Self> {
        let via = top_via(&req.headers)?;
        let branch = via.branch()?;
        if !branch.starts_with(BRANCH_MAGIC_COOKIE) {
            return None;
        }
        Some(Self::new(
            branch.clone(),
            via.sent_by.clone(),
            req.method().clone(),
            TxRole::Server,
        ))
    }

    /// Key for an inbound response, matched against our own top Via and
    /// the CSeq method.
    pub fn for_inbound_response(res: &Response) -> Option<Self> {
        let via = top_via(&res.headers)?;
        let cseq = res.header("CSeq").and_then(|v| CSeq::parse(v))?;
        Some(Self::new(
            via.branch()?.clone(),
            via.sent_by.clone(),
            cseq.method,
            TxRole::Client,
        ))
    }
}

/// RFC 2543 fallback matching key for requests whose branch predates the
/// magic cookie: (Call-ID, From tag, To tag, CSeq, request-URI).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LegacyKey {
    pub call_id: SmolStr,
    pub from_tag: Option<SmolStr>,
    pub to_tag: Option<SmolStr>,
    pub cseq: SmolStr,
    pub request_uri: SmolStr,
}

impl LegacyKey {
    pub fn from_request(req: &Request) -> Option<Self> {
        let call_id = req.header("Call-ID")?.clone();
        let from_tag = req
            .header("From")
            .and_then(|v| tinysip_core::NameAddr::parse(v))
            .and_then(|addr| addr.tag().cloned());
        let to_tag = req
            .header("To")
            .and_then(|v| tinysip_core::NameAddr::parse(v))
            .and_then(|addr| addr.tag().cloned());
        let cseq = req.header("CSeq")?.clone();
        Some(Self {
            call_id,
            from_tag,
            to_tag,
            cseq,
            request_uri: SmolStr::new(req.uri().to_string()),
        })
    }
}

/// Generates a fresh RFC 3261 branch: the magic cookie plus 16 hex
/// characters from the thread-local CSPRNG.
pub fn generate_branch() -> SmolStr {
    SmolStr::new(format!("{}{}", BRANCH_MAGIC_COOKIE, random_hex(16)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tinysip_core::{Headers, RequestLine, SipUri, StatusLine};

    fn request(method: Method, headers: Vec<(&str, &str)>) -> Request {
        let mut hdrs = Headers::new();
        for (name, value) in headers {
            hdrs.push(name, value);
        }
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
            hdrs,
            Bytes::new(),
        )
    }

    #[test]
    fn generated_branches_carry_cookie_and_hex_suffix() {
        let branch = generate_branch();
        assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
        let suffix = &branch[BRANCH_MAGIC_COOKIE.len()..];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_branches_are_unique() {
        assert_ne!(generate_branch(), generate_branch());
    }

    #[test]
    fn ack_collapses_onto_invite_key() {
        let invite = request(
            Method::Invite,
            vec![
                ("Via", "SIP/2.0/UDP host:5060;branch=z9hG4bKabc"),
                ("CSeq", "1 INVITE"),
            ],
        );
        let ack = request(
            Method::Ack,
            vec![
                ("Via", "SIP/2.0/UDP host:5060;branch=z9hG4bKabc"),
                ("CSeq", "1 ACK"),
            ],
        );
        let invite_key = TransactionKey::for_inbound_request(&invite).unwrap();
        let ack_key = TransactionKey::for_inbound_request(&ack).unwrap();
        assert_eq!(invite_key, ack_key);
    }

    #[test]
    fn cancel_gets_its_own_key() {
        let invite = request(
            Method::Invite,
            vec![("Via", "SIP/2.0/UDP host;branch=z9hG4bKabc")],
        );
        let cancel = request(
            Method::Cancel,
            vec![("Via", "SIP/2.0/UDP host;branch=z9hG4bKabc")],
        );
        assert_ne!(
            TransactionKey::for_inbound_request(&invite).unwrap(),
            TransactionKey::for_inbound_request(&cancel).unwrap()
        );
    }

    #[test]
    fn pre_cookie_branch_falls_back_to_legacy_matching() {
        let req = request(
            Method::Invite,
            vec![
                ("Via", "SIP/2.0/UDP host;branch=oldstyle1"),
                ("Call-ID", "abc@host"),
                ("From", "<sip:a@b.c>;tag=f1"),
                ("To", "<sip:bob@example.com>"),
                ("CSeq", "1 INVITE"),
            ],
        );
        assert!(TransactionKey::for_inbound_request(&req).is_none());

        let key = LegacyKey::from_request(&req).unwrap();
        assert_eq!(key.call_id.as_str(), "abc@host");
        assert_eq!(key.from_tag.as_deref(), Some("f1"));
        assert_eq!(key.to_tag, None);
        assert_eq!(key.request_uri.as_str(), "sip:bob@example.com");
    }

    #[test]
    fn response_key_uses_cseq_method() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client:5060;branch=z9hG4bKxyz");
        headers.push("CSeq", "7 OPTIONS");
        let res = Response::new(StatusLine::new(200, "OK"), headers, Bytes::new());
        let key = TransactionKey::for_inbound_response(&res).unwrap();
        assert_eq!(key.method, Method::Options);
        assert_eq!(key.role, TxRole::Client);
        assert_eq!(key.sent_by.as_str(), "client:5060");
    }

    #[test]
    fn sent_by_distinguishes_hops() {
        let a = TransactionKey::new(
            SmolStr::new("z9hG4bKx"),
            SmolStr::new("host-a:5060"),
            Method::Invite,
            TxRole::Server,
        );
        let b = TransactionKey::new(
            SmolStr::new("z9hG4bKx"),
            SmolStr::new("host-b:5060"),
            Method::Invite,
            TxRole::Server,
        );
        assert_ne!(a, b);
    }
}
