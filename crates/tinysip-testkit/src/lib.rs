// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness: canned message builders and an in-memory transport.
//!
//! The [`ChannelTransport`] captures everything the user agent sends so a
//! test can play the remote peer: read the outbound datagram, craft a
//! response with [`response_to`], and inject it through the packet channel.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tinysip_core::{Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};
use tinysip_parse::parse_request;
use tinysip_transport::{Transport, TransportKind};
use tokio::sync::mpsc;

/// Constructs a minimal OPTIONS request for the provided URI string.
pub fn build_options(uri: &str) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKtest");
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", format!("<{}>", uri));
    headers.push("Call-ID", "testcallid@client.example.com");
    headers.push("CSeq", "1 OPTIONS");
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Options, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::new(),
    )
}

/// Constructs a minimal INVITE request with explicit branch and Call-ID.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP client.example.com:5060;branch={}", branch),
    );
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", format!("<{}>", uri));
    headers.push("Call-ID", call_id);
    headers.push("CSeq", "1 INVITE");
    headers.push("Max-Forwards", "70");
    headers.push("Contact", "<sip:alice@client.example.com:5060>");
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Invite, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::new(),
    )
}

/// Builds a response echoing the request's Via, From, To, Call-ID and
/// CSeq, optionally adding a To-tag and a Contact.
pub fn response_to(
    request: &Request,
    code: u16,
    reason: &str,
    to_tag: Option<&str>,
) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    if let Some(from) = request.header("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = request.header("To") {
        match to_tag {
            Some(tag) if !to.contains("tag=") => {
                headers.push("To", format!("{};tag={}", to, tag))
            }
            _ => headers.push("To", to.clone()),
        }
    }
    if let Some(call_id) = request.header("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    if let Some(cseq) = request.header("CSeq") {
        headers.push("CSeq", cseq.clone());
    }

    Response::new(StatusLine::new(code, reason), headers, Bytes::new())
}

/// Builds a 401/407 challenge for the request.
pub fn challenge_to(request: &Request, code: u16, realm: &str, nonce: &str) -> Response {
    let reason = if code == 407 {
        "Proxy Authentication Required"
    } else {
        "Unauthorized"
    };
    let header = if code == 407 {
        "Proxy-Authenticate"
    } else {
        "WWW-Authenticate"
    };
    let mut response = response_to(request, code, reason, None);
    response.headers.push(
        header,
        format!("Digest realm=\"{}\", nonce=\"{}\"", realm, nonce),
    );
    response
}

/// In-memory transport: outbound sends surface on a channel for the test
/// to inspect; inbound packets are injected by the test through the
/// dispatcher's packet channel.
pub struct ChannelTransport {
    local: SocketAddr,
    kind: TransportKind,
    sent: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
}

impl ChannelTransport {
    /// Creates the transport and the receiving end of its outbound tap.
    pub fn new(
        local: SocketAddr,
        kind: TransportKind,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(Bytes, SocketAddr)>) {
        let (sent, outbound) = mpsc::unbounded_channel();
        (
            Arc::new(Self { local, kind, sent }),
            outbound,
        )
    }

    /// Unreliable loopback bound to a fixed test address.
    pub fn udp() -> (Arc<Self>, mpsc::UnboundedReceiver<(Bytes, SocketAddr)>) {
        Self::new("192.0.2.10:5060".parse().unwrap(), TransportKind::Udp)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: Bytes, peer: SocketAddr) -> Result<()> {
        self.sent
            .send((payload, peer))
            .map_err(|_| anyhow::anyhow!("outbound tap closed"))?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

/// Reads the next outbound message from the tap and parses it as a request.
pub async fn next_request(
    outbound: &mut mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
) -> Request {
    let (bytes, _) = outbound.recv().await.expect("outbound message");
    parse_request(&bytes).expect("parsable outbound request")
}
