// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server-side behavior: answering inbound requests, automatic BYE and
//! CANCEL handling, retransmission absorption.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tinysip_core::{Headers, Method, Request, RequestLine, SipUri};
use tinysip_parse::{emit_request, parse_response};
use tinysip_testkit::{build_invite, build_options, ChannelTransport};
use tinysip_transport::{InboundPacket, TransportKind};
use tinysip_ua::{UaEvent, UserAgent, UserAgentConfig};
use tokio::sync::mpsc;

type Outbound = mpsc::UnboundedReceiver<(Bytes, std::net::SocketAddr)>;

const PEER: &str = "192.0.2.99:5060";

fn test_ua() -> (Arc<UserAgent>, Outbound, mpsc::Sender<InboundPacket>) {
    let (transport, outbound) = ChannelTransport::udp();
    let config = UserAgentConfig::for_identity("sip:alice@client.example.com").unwrap();
    let (ua, packets) = UserAgent::with_transport(config, transport);
    (Arc::new(ua), outbound, packets)
}

async fn inject(packets: &mpsc::Sender<InboundPacket>, request: &Request) {
    packets
        .send(InboundPacket {
            bytes: emit_request(request),
            peer: PEER.parse().unwrap(),
            transport: TransportKind::Udp,
        })
        .await
        .unwrap();
}

async fn next_response(outbound: &mut Outbound) -> tinysip_core::Response {
    let (bytes, _) = outbound.recv().await.expect("outbound response");
    parse_response(&bytes).expect("parsable response")
}

/// Builds the peer's ACK for our tagged 2xx: fresh branch, dialog routed.
fn peer_ack(invite: &Request, to_with_tag: &str) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKpeerack");
    headers.push("From", invite.header("From").unwrap().clone());
    headers.push("To", to_with_tag);
    headers.push("Call-ID", invite.header("Call-ID").unwrap().clone());
    headers.push("CSeq", "1 ACK");
    headers.push("Max-Forwards", "70");
    Request::new(
        RequestLine::new(
            Method::Ack,
            SipUri::parse("sip:alice@192.0.2.10:5060").unwrap(),
        ),
        headers,
        Bytes::new(),
    )
}

#[tokio::test(start_paused = true)]
async fn inbound_invite_answered_and_confirmed_by_ack() {
    let (ua, mut outbound, packets) = test_ua();
    let mut events = ua.take_events().unwrap();

    let invite = build_invite("sip:alice@192.0.2.10:5060", "z9hG4bKuas1", "uascall@peer");
    inject(&packets, &invite).await;

    // 100 Trying goes out before the application sees the request.
    let trying = next_response(&mut outbound).await;
    assert_eq!(trying.code(), 100);

    let key = match events.recv().await.unwrap() {
        UaEvent::NewRequest { key, request, peer } => {
            assert_eq!(request.method(), &Method::Invite);
            assert_eq!(peer, PEER.parse().unwrap());
            key
        }
        other => panic!("unexpected event: {:?}", other),
    };

    ua.respond(&key, 180, "Ringing", None).await;
    let ringing = next_response(&mut outbound).await;
    assert_eq!(ringing.code(), 180);
    assert!(ringing.header("To").unwrap().contains("tag="));

    ua.respond(&key, 200, "OK", Some(("application/sdp", Bytes::from_static(b"v=0\r\n"))))
        .await;
    let ok = next_response(&mut outbound).await;
    assert_eq!(ok.code(), 200);
    assert!(ok.header("Contact").is_some());
    assert_eq!(ok.body.as_ref(), b"v=0\r\n");
    let to_with_tag = ok.header("To").unwrap().to_string();

    // Dialog exists but is not confirmed until the ACK lands.
    let snapshot = ua.snapshot().await.unwrap();
    assert_eq!(snapshot.dialogs, 1);
    assert_eq!(snapshot.confirmed_dialogs, 0);

    inject(&packets, &peer_ack(&invite, &to_with_tag)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = ua.snapshot().await.unwrap();
    assert_eq!(snapshot.confirmed_dialogs, 1);
}

#[tokio::test(start_paused = true)]
async fn inbound_bye_terminates_dialog_with_200() {
    let (ua, mut outbound, packets) = test_ua();
    let mut events = ua.take_events().unwrap();

    let invite = build_invite("sip:alice@192.0.2.10:5060", "z9hG4bKuas2", "byecall@peer");
    inject(&packets, &invite).await;
    let _trying = next_response(&mut outbound).await;

    let key = match events.recv().await.unwrap() {
        UaEvent::NewRequest { key, .. } => key,
        other => panic!("unexpected event: {:?}", other),
    };
    ua.respond(&key, 200, "OK", None).await;
    let ok = next_response(&mut outbound).await;
    let to_with_tag = ok.header("To").unwrap().to_string();
    inject(&packets, &peer_ack(&invite, &to_with_tag)).await;

    // Peer hangs up.
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKpeerbye");
    headers.push("From", invite.header("From").unwrap().clone());
    headers.push("To", to_with_tag);
    headers.push("Call-ID", invite.header("Call-ID").unwrap().clone());
    headers.push("CSeq", "2 BYE");
    headers.push("Max-Forwards", "70");
    let bye = Request::new(
        RequestLine::new(
            Method::Bye,
            SipUri::parse("sip:alice@192.0.2.10:5060").unwrap(),
        ),
        headers,
        Bytes::new(),
    );
    inject(&packets, &bye).await;

    let bye_ok = next_response(&mut outbound).await;
    assert_eq!(bye_ok.code(), 200);
    assert_eq!(bye_ok.header("CSeq").unwrap().as_str(), "2 BYE");

    let mut saw_termination = false;
    while let Ok(event) = events.try_recv() {
        if let UaEvent::DialogTerminated { reason, .. } = event {
            assert_eq!(reason.as_str(), "BYE received");
            saw_termination = true;
        }
    }
    assert!(saw_termination);
    assert_eq!(ua.snapshot().await.unwrap().dialogs, 0);
}

#[tokio::test(start_paused = true)]
async fn inbound_cancel_answers_487_on_the_invite() {
    let (ua, mut outbound, packets) = test_ua();
    let mut events = ua.take_events().unwrap();

    let invite = build_invite("sip:alice@192.0.2.10:5060", "z9hG4bKuas3", "cancelcall@peer");
    inject(&packets, &invite).await;
    let _trying = next_response(&mut outbound).await;
    let _event = events.recv().await.unwrap();

    // Peer changes its mind: CANCEL on the same branch.
    let mut cancel = invite.clone();
    cancel.start = RequestLine::new(Method::Cancel, invite.uri().clone());
    cancel.headers.set("CSeq", "1 CANCEL");
    inject(&packets, &cancel).await;

    let first = next_response(&mut outbound).await;
    let second = next_response(&mut outbound).await;
    let codes = [first.code(), second.code()];
    assert!(codes.contains(&200), "CANCEL answered: {:?}", codes);
    assert!(codes.contains(&487), "INVITE terminated: {:?}", codes);
}

#[tokio::test(start_paused = true)]
async fn cancel_without_matching_invite_gets_481() {
    let (ua, mut outbound, packets) = test_ua();

    let mut cancel = build_invite("sip:alice@192.0.2.10:5060", "z9hG4bKnone", "ghost@peer");
    cancel.start = RequestLine::new(Method::Cancel, cancel.uri().clone());
    cancel.headers.set("CSeq", "1 CANCEL");
    inject(&packets, &cancel).await;

    let response = next_response(&mut outbound).await;
    assert_eq!(response.code(), 481);
    let _ = ua;
}

#[tokio::test(start_paused = true)]
async fn retransmitted_request_reuses_the_final_response() {
    let (ua, mut outbound, packets) = test_ua();
    let mut events = ua.take_events().unwrap();

    let options = build_options("sip:alice@192.0.2.10:5060");
    inject(&packets, &options).await;

    let key = match events.recv().await.unwrap() {
        UaEvent::NewRequest { key, .. } => key,
        other => panic!("unexpected event: {:?}", other),
    };
    ua.respond(&key, 200, "OK", None).await;
    let first = next_response(&mut outbound).await;
    assert_eq!(first.code(), 200);

    // The duplicate does not spawn a new transaction or a new event; the
    // stored final response goes out again.
    inject(&packets, &options).await;
    let second = next_response(&mut outbound).await;
    assert_eq!(second.code(), 200);
    assert!(events.try_recv().is_err());

    // Timer J drains the transaction after 64·T1.
    tokio::time::sleep(Duration::from_secs(33)).await;
    assert_eq!(ua.snapshot().await.unwrap().transactions, 0);
}
