// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four transaction state machines of RFC 3261 §17.
//!
//! Each FSM consumes events and yields a list of actions for the owner to
//! apply. Retransmission back-off is computed here; wall-clock scheduling
//! belongs to the owner's timer queue. Reliability of the underlying
//! transport is fixed at construction and suppresses the retransmit timers
//! (A, E, G) and zeroes the drain timers (D, I, J, K).

use std::time::Duration;

use bytes::Bytes;
use tinysip_core::{Headers, Method, Request, RequestLine, Response};
use tinysip_parse::{emit_request, emit_response};

use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState, TimerSettings,
    TimerType,
};

/// Why a transaction reached `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTermination {
    /// Normal end of life (final response handled, wait timers drained).
    Completed,
    /// Timer B or F fired without a final response.
    Timeout,
    /// Timer H fired: the peer never acknowledged our final response.
    NoAck,
    /// The transport underneath went away.
    TransportLost,
}

/// Actions emitted by the client-side state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Hand these bytes to the transport.
    Transmit(Bytes),
    /// Deliver a response to the transaction user.
    Deliver(Response),
    /// Arm a one-shot timer.
    Schedule { timer: TimerType, delay: Duration },
    /// Disarm a previously scheduled timer.
    Cancel(TimerType),
    /// The transaction reached `Terminated`.
    Terminate(TxTermination),
}

/// Actions emitted by the server-side state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    Transmit(Bytes),
    Schedule { timer: TimerType, delay: Duration },
    Cancel(TimerType),
    Terminate(TxTermination),
}

/// Events driving the client INVITE machine (RFC 3261 §17.1.1).
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TimerType),
    TransportError,
}

/// Events driving the client non-INVITE machine (RFC 3261 §17.1.2).
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TimerType),
    TransportError,
}

/// Events driving the server INVITE machine (RFC 3261 §17.2.1).
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    /// Retransmitted INVITE matched this transaction.
    ReceiveRetransmit,
    SendProvisional(Response),
    SendFinal(Response),
    ReceiveAck,
    TimerFired(TimerType),
    TransportError,
}

/// Events driving the server non-INVITE machine (RFC 3261 §17.2.2).
#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    /// Retransmitted request matched this transaction.
    ReceiveRetransmit,
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TimerType),
    TransportError,
}

/// Builds the ACK a client transaction owes for a non-2xx final response
/// (RFC 3261 §17.1.1.3): same request-URI, Via (and so branch), From,
/// Call-ID and CSeq number as the INVITE; To taken from the response.
pub fn ack_for_non_2xx(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get_all("Via").next() {
        headers.push("Via", via.clone());
    }
    for name in ["From", "Call-ID"] {
        if let Some(value) = invite.header(name) {
            headers.push(name, value.clone());
        }
    }
    if let Some(to) = response.header("To") {
        headers.push("To", to.clone());
    }
    for route in invite.headers.get_all("Route") {
        headers.push("Route", route.clone());
    }
    if let Some(cseq) = invite.header("CSeq") {
        let number = cseq.split_whitespace().next().unwrap_or("1");
        headers.push("CSeq", format!("{} ACK", number));
    }
    headers.push("Max-Forwards", "70");

    Request::new(
        RequestLine::new(Method::Ack, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
}

/// Client INVITE transaction (Calling → Proceeding → Completed → Terminated).
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    settings: TimerSettings,
    reliable: bool,
    a_interval: Duration,
    invite: Option<Request>,
    invite_bytes: Option<Bytes>,
    ack_bytes: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(settings: TimerSettings, reliable: bool) -> Self {
        Self {
            state: ClientInviteState::Calling,
            settings,
            reliable,
            a_interval: settings.t1,
            invite: None,
            invite_bytes: None,
            ack_bytes: None,
        }
    }

    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<ClientAction> {
        use ClientInviteState::*;
        match (&self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) => self.handle_send(invite),
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (Completed, ClientInviteEvent::ReceiveFinal(_)) => self.handle_final_retransmit(),
            (Calling, ClientInviteEvent::TimerFired(TimerType::A)) => self.handle_timer_a(),
            (Calling | Proceeding, ClientInviteEvent::TimerFired(TimerType::B)) => {
                self.handle_timer_b()
            }
            (Completed, ClientInviteEvent::TimerFired(TimerType::D)) => self.handle_timer_d(),
            (_, ClientInviteEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, invite: Request) -> Vec<ClientAction> {
        let bytes = emit_request(&invite);
        self.invite = Some(invite);
        self.invite_bytes = Some(bytes.clone());

        let mut actions = vec![ClientAction::Transmit(bytes)];
        if !self.reliable {
            actions.push(ClientAction::Schedule {
                timer: TimerType::A,
                delay: self.settings.t1,
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TimerType::B,
            delay: self.settings.give_up(),
        });
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientInviteState::Proceeding;
        vec![
            ClientAction::Cancel(TimerType::A),
            ClientAction::Deliver(response),
        ]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        if response.is_success() {
            // The dialog layer owns the ACK for a 2xx; the transaction is
            // done the moment the response is delivered (RFC 3261 §13.2.2.4).
            self.state = ClientInviteState::Terminated;
            return vec![
                ClientAction::Cancel(TimerType::A),
                ClientAction::Cancel(TimerType::B),
                ClientAction::Deliver(response),
                ClientAction::Terminate(TxTermination::Completed),
            ];
        }

        self.state = ClientInviteState::Completed;
        let mut actions = vec![
            ClientAction::Cancel(TimerType::A),
            ClientAction::Cancel(TimerType::B),
        ];
        if let Some(invite) = &self.invite {
            let ack = emit_request(&ack_for_non_2xx(invite, &response));
            self.ack_bytes = Some(ack.clone());
            actions.push(ClientAction::Transmit(ack));
        }
        actions.push(ClientAction::Deliver(response));
        actions.push(ClientAction::Schedule {
            timer: TimerType::D,
            delay: self.settings.timer_d(self.reliable),
        });
        actions
    }

    fn handle_final_retransmit(&mut self) -> Vec<ClientAction> {
        // Every retransmitted final response gets the same ACK again.
        match &self.ack_bytes {
            Some(ack) => vec![ClientAction::Transmit(ack.clone())],
            None => Vec::new(),
        }
    }

    fn handle_timer_a(&mut self) -> Vec<ClientAction> {
        // Timer A doubles without a cap (§17.1.1.2).
        self.a_interval = self.a_interval.saturating_mul(2);
        match &self.invite_bytes {
            Some(bytes) => vec![
                ClientAction::Transmit(bytes.clone()),
                ClientAction::Schedule {
                    timer: TimerType::A,
                    delay: self.a_interval,
                },
            ],
            None => Vec::new(),
        }
    }

    fn handle_timer_b(&mut self) -> Vec<ClientAction> {
        self.state = ClientInviteState::Terminated;
        vec![
            ClientAction::Cancel(TimerType::A),
            ClientAction::Terminate(TxTermination::Timeout),
        ]
    }

    fn handle_timer_d(&mut self) -> Vec<ClientAction> {
        self.state = ClientInviteState::Terminated;
        vec![ClientAction::Terminate(TxTermination::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ClientAction> {
        self.state = ClientInviteState::Terminated;
        vec![ClientAction::Terminate(TxTermination::TransportLost)]
    }
}

/// Client non-INVITE transaction (Trying → Proceeding → Completed →
/// Terminated).
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    settings: TimerSettings,
    reliable: bool,
    e_interval: Duration,
    request_bytes: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(settings: TimerSettings, reliable: bool) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            settings,
            reliable,
            e_interval: settings.t1,
            request_bytes: None,
        }
    }

    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<ClientAction> {
        use ClientNonInviteState::*;
        match (&self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) => self.handle_send(request),
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TimerType::E)) => {
                self.handle_timer_e()
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TimerType::F)) => {
                self.handle_timer_f()
            }
            (Completed, ClientNonInviteEvent::TimerFired(TimerType::K)) => self.handle_timer_k(),
            (_, ClientNonInviteEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<ClientAction> {
        let bytes = emit_request(&request);
        self.request_bytes = Some(bytes.clone());

        let mut actions = vec![ClientAction::Transmit(bytes)];
        if !self.reliable {
            actions.push(ClientAction::Schedule {
                timer: TimerType::E,
                delay: self.settings.t1,
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TimerType::F,
            delay: self.settings.give_up(),
        });
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Proceeding;
        vec![ClientAction::Deliver(response)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Completed;
        vec![
            ClientAction::Cancel(TimerType::E),
            ClientAction::Cancel(TimerType::F),
            ClientAction::Deliver(response),
            ClientAction::Schedule {
                timer: TimerType::K,
                delay: self.settings.drain(self.reliable),
            },
        ]
    }

    fn handle_timer_e(&mut self) -> Vec<ClientAction> {
        // In Proceeding the retransmit interval pins to T2 (§17.1.2.2);
        // in Trying it doubles up to T2.
        self.e_interval = match self.state {
            ClientNonInviteState::Proceeding => self.settings.t2,
            _ => self.e_interval.saturating_mul(2).min(self.settings.t2),
        };
        match &self.request_bytes {
            Some(bytes) => vec![
                ClientAction::Transmit(bytes.clone()),
                ClientAction::Schedule {
                    timer: TimerType::E,
                    delay: self.e_interval,
                },
            ],
            None => Vec::new(),
        }
    }

    fn handle_timer_f(&mut self) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Terminated;
        vec![
            ClientAction::Cancel(TimerType::E),
            ClientAction::Terminate(TxTermination::Timeout),
        ]
    }

    fn handle_timer_k(&mut self) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Terminated;
        vec![ClientAction::Terminate(TxTermination::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Terminated;
        vec![ClientAction::Terminate(TxTermination::TransportLost)]
    }
}

/// Server INVITE transaction (Proceeding → Completed → Confirmed →
/// Terminated).
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    settings: TimerSettings,
    reliable: bool,
    g_interval: Duration,
    last_response: Option<Bytes>,
}

impl ServerInviteFsm {
    pub fn new(settings: TimerSettings, reliable: bool) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            settings,
            reliable,
            g_interval: settings.t1,
            last_response: None,
        }
    }

    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<ServerAction> {
        use ServerInviteState::*;
        match (&self.state, event) {
            (Proceeding, ServerInviteEvent::ReceiveRetransmit) => self.retransmit_last(),
            (Proceeding, ServerInviteEvent::SendProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Proceeding, ServerInviteEvent::SendFinal(response)) => self.handle_final(response),
            (Completed, ServerInviteEvent::ReceiveRetransmit) => self.retransmit_last(),
            (Completed, ServerInviteEvent::ReceiveAck) => self.handle_ack(),
            (Completed, ServerInviteEvent::TimerFired(TimerType::G)) => self.handle_timer_g(),
            (Completed, ServerInviteEvent::TimerFired(TimerType::H)) => self.handle_timer_h(),
            (Confirmed, ServerInviteEvent::TimerFired(TimerType::I)) => self.handle_timer_i(),
            (_, ServerInviteEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    fn retransmit_last(&self) -> Vec<ServerAction> {
        match &self.last_response {
            Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
            None => Vec::new(),
        }
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ServerAction> {
        let bytes = emit_response(&response);
        self.last_response = Some(bytes.clone());
        vec![ServerAction::Transmit(bytes)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ServerAction> {
        let bytes = emit_response(&response);
        if response.is_success() {
            // Retransmission of a 2xx belongs to the TU (§13.3.1.4).
            self.state = ServerInviteState::Terminated;
            return vec![
                ServerAction::Transmit(bytes),
                ServerAction::Terminate(TxTermination::Completed),
            ];
        }

        self.state = ServerInviteState::Completed;
        self.last_response = Some(bytes.clone());
        self.g_interval = self.settings.t1;
        let mut actions = vec![ServerAction::Transmit(bytes)];
        if !self.reliable {
            actions.push(ServerAction::Schedule {
                timer: TimerType::G,
                delay: self.g_interval,
            });
        }
        actions.push(ServerAction::Schedule {
            timer: TimerType::H,
            delay: self.settings.give_up(),
        });
        actions
    }

    fn handle_ack(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Confirmed;
        vec![
            ServerAction::Cancel(TimerType::G),
            ServerAction::Cancel(TimerType::H),
            ServerAction::Schedule {
                timer: TimerType::I,
                delay: self.settings.drain(self.reliable),
            },
        ]
    }

    fn handle_timer_g(&mut self) -> Vec<ServerAction> {
        self.g_interval = self.g_interval.saturating_mul(2).min(self.settings.t2);
        match &self.last_response {
            Some(bytes) => vec![
                ServerAction::Transmit(bytes.clone()),
                ServerAction::Schedule {
                    timer: TimerType::G,
                    delay: self.g_interval,
                },
            ],
            None => Vec::new(),
        }
    }

    fn handle_timer_h(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Terminated;
        vec![
            ServerAction::Cancel(TimerType::G),
            ServerAction::Terminate(TxTermination::NoAck),
        ]
    }

    fn handle_timer_i(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Terminated;
        vec![ServerAction::Terminate(TxTermination::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Terminated;
        vec![ServerAction::Terminate(TxTermination::TransportLost)]
    }
}

/// Server non-INVITE transaction (Trying → Proceeding → Completed →
/// Terminated).
pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    settings: TimerSettings,
    reliable: bool,
    last_response: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(settings: TimerSettings, reliable: bool) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            settings,
            reliable,
            last_response: None,
        }
    }

    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<ServerAction> {
        use ServerNonInviteState::*;
        match (&self.state, event) {
            (Proceeding | Completed, ServerNonInviteEvent::ReceiveRetransmit) => {
                self.retransmit_last()
            }
            (Trying, ServerNonInviteEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                self.transmit_stored(response)
            }
            (Proceeding, ServerNonInviteEvent::SendProvisional(response)) => {
                self.transmit_stored(response)
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(response)) => {
                self.handle_final(response)
            }
            (Completed, ServerNonInviteEvent::TimerFired(TimerType::J)) => self.handle_timer_j(),
            (_, ServerNonInviteEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    fn retransmit_last(&self) -> Vec<ServerAction> {
        match &self.last_response {
            Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
            None => Vec::new(),
        }
    }

    fn transmit_stored(&mut self, response: Response) -> Vec<ServerAction> {
        let bytes = emit_response(&response);
        self.last_response = Some(bytes.clone());
        vec![ServerAction::Transmit(bytes)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ServerAction> {
        self.state = ServerNonInviteState::Completed;
        let bytes = emit_response(&response);
        self.last_response = Some(bytes.clone());
        vec![
            ServerAction::Transmit(bytes),
            ServerAction::Schedule {
                timer: TimerType::J,
                delay: self.settings.timer_j(self.reliable),
            },
        ]
    }

    fn handle_timer_j(&mut self) -> Vec<ServerAction> {
        self.state = ServerNonInviteState::Terminated;
        vec![ServerAction::Terminate(TxTermination::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ServerAction> {
        self.state = ServerNonInviteState::Terminated;
        vec![ServerAction::Terminate(TxTermination::TransportLost)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinysip_core::{Headers, SipUri, StatusLine};

    fn settings() -> TimerSettings {
        TimerSettings::default()
    }

    fn sample_invite() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client:5060;branch=z9hG4bKinv1");
        headers.push("From", "<sip:alice@example.com>;tag=f1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call1@client");
        headers.push("CSeq", "1 INVITE");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn sample_request(method: Method) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client:5060;branch=z9hG4bKreq1");
        headers.push("From", "<sip:alice@example.com>;tag=f1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call1@client");
        headers.push("CSeq", format!("1 {}", method));
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn sample_response(code: u16) -> Response {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client:5060;branch=z9hG4bKinv1");
        headers.push("From", "<sip:alice@example.com>;tag=f1");
        headers.push("To", "<sip:bob@example.com>;tag=t1");
        headers.push("Call-ID", "call1@client");
        headers.push("CSeq", "1 INVITE");
        Response::new(StatusLine::new(code, "x"), headers, Bytes::new())
    }

    fn schedules(actions: &[ClientAction], timer: TimerType) -> Vec<Duration> {
        actions
            .iter()
            .filter_map(|a| match a {
                ClientAction::Schedule { timer: t, delay } if *t == timer => Some(*delay),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn invite_client_arms_a_and_b_on_send() {
        let mut fsm = ClientInviteFsm::new(settings(), false);
        let actions = fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        assert!(matches!(actions[0], ClientAction::Transmit(_)));
        assert_eq!(schedules(&actions, TimerType::A), vec![Duration::from_millis(500)]);
        assert_eq!(schedules(&actions, TimerType::B), vec![Duration::from_secs(32)]);
    }

    #[test]
    fn invite_client_skips_timer_a_on_reliable_transport() {
        let mut fsm = ClientInviteFsm::new(settings(), true);
        let actions = fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        assert!(schedules(&actions, TimerType::A).is_empty());
        assert_eq!(schedules(&actions, TimerType::B).len(), 1);
    }

    #[test]
    fn timer_a_doubles_without_cap() {
        let mut fsm = ClientInviteFsm::new(settings(), false);
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));

        let mut intervals = Vec::new();
        for _ in 0..6 {
            let actions = fsm.on_event(ClientInviteEvent::TimerFired(TimerType::A));
            intervals.extend(schedules(&actions, TimerType::A));
        }
        let expected: Vec<Duration> = [1u64, 2, 4, 8, 16, 32]
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect();
        assert_eq!(intervals, expected);
    }

    #[test]
    fn invite_client_2xx_terminates_without_ack() {
        let mut fsm = ClientInviteFsm::new(settings(), false);
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(200)));

        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, ClientAction::Deliver(_))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TxTermination::Completed))));
        // No ACK on the wire: the dialog layer owns it for 2xx.
        assert!(!actions.iter().any(|a| matches!(a, ClientAction::Transmit(_))));
    }

    #[test]
    fn invite_client_non_2xx_acks_and_arms_timer_d() {
        let mut fsm = ClientInviteFsm::new(settings(), false);
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(486)));

        assert_eq!(fsm.state, ClientInviteState::Completed);
        let ack = actions
            .iter()
            .find_map(|a| match a {
                ClientAction::Transmit(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .expect("ack transmitted");
        let text = String::from_utf8(ack.to_vec()).unwrap();
        assert!(text.starts_with("ACK sip:bob@example.com SIP/2.0\r\n"));
        assert!(text.contains("branch=z9hG4bKinv1"));
        assert!(text.contains("CSeq: 1 ACK"));
        assert!(text.contains(";tag=t1"));
        assert_eq!(schedules(&actions, TimerType::D), vec![Duration::from_secs(32)]);
    }

    #[test]
    fn invite_client_reacks_retransmitted_final() {
        let mut fsm = ClientInviteFsm::new(settings(), false);
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(486)));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(486)));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ClientAction::Transmit(_)));
    }

    #[test]
    fn invite_client_timer_b_times_out() {
        let mut fsm = ClientInviteFsm::new(settings(), false);
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TimerType::B));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TxTermination::Timeout))));
    }

    #[test]
    fn non_invite_client_happy_path() {
        let mut fsm = ClientNonInviteFsm::new(settings(), false);
        let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(
            Method::Options,
        )));
        assert_eq!(schedules(&actions, TimerType::E), vec![Duration::from_millis(500)]);
        assert_eq!(schedules(&actions, TimerType::F), vec![Duration::from_secs(32)]);

        let actions = fsm.on_event(ClientNonInviteEvent::ReceiveFinal(sample_response(200)));
        assert_eq!(fsm.state, ClientNonInviteState::Completed);
        assert_eq!(schedules(&actions, TimerType::K), vec![Duration::from_secs(5)]);

        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TimerType::K));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TxTermination::Completed))));
    }

    #[test]
    fn non_invite_timer_e_caps_at_t2() {
        let mut fsm = ClientNonInviteFsm::new(settings(), false);
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(Method::Options)));

        let mut intervals = Vec::new();
        for _ in 0..5 {
            let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TimerType::E));
            intervals.extend(schedules(&actions, TimerType::E));
        }
        assert_eq!(
            intervals,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn non_invite_timer_e_pins_to_t2_in_proceeding() {
        let mut fsm = ClientNonInviteFsm::new(settings(), false);
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(Method::Options)));
        fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(sample_response(100)));
        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TimerType::E));
        assert_eq!(schedules(&actions, TimerType::E), vec![Duration::from_secs(4)]);
    }

    #[test]
    fn non_invite_timer_f_times_out() {
        let mut fsm = ClientNonInviteFsm::new(settings(), false);
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(Method::Options)));
        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TimerType::F));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TxTermination::Timeout))));
    }

    #[test]
    fn non_invite_reliable_gets_zero_timer_k() {
        let mut fsm = ClientNonInviteFsm::new(settings(), true);
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request(Method::Options)));
        let actions = fsm.on_event(ClientNonInviteEvent::ReceiveFinal(sample_response(200)));
        let delays: Vec<Duration> = schedules(&actions, TimerType::K);
        assert_eq!(delays, vec![Duration::ZERO]);
    }

    #[test]
    fn server_invite_non_2xx_retransmits_until_ack() {
        let mut fsm = ServerInviteFsm::new(settings(), false);
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        assert_eq!(fsm.state, ServerInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::Schedule { timer: TimerType::G, .. }
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::Schedule { timer: TimerType::H, .. }
        )));

        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TimerType::G));
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Transmit(_))));

        let actions = fsm.on_event(ServerInviteEvent::ReceiveAck);
        assert_eq!(fsm.state, ServerInviteState::Confirmed);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::Schedule { timer: TimerType::I, .. }
        )));

        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TimerType::I));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TxTermination::Completed))));
    }

    #[test]
    fn server_invite_2xx_terminates_immediately() {
        let mut fsm = ServerInviteFsm::new(settings(), false);
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Transmit(_))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TxTermination::Completed))));
    }

    #[test]
    fn server_invite_timer_h_reports_missing_ack() {
        let mut fsm = ServerInviteFsm::new(settings(), false);
        fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TimerType::H));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TxTermination::NoAck))));
    }

    #[test]
    fn server_invite_retransmit_resends_provisional() {
        let mut fsm = ServerInviteFsm::new(settings(), false);
        fsm.on_event(ServerInviteEvent::SendProvisional(sample_response(180)));
        let actions = fsm.on_event(ServerInviteEvent::ReceiveRetransmit);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ServerAction::Transmit(_)));
    }

    #[test]
    fn server_non_invite_final_arms_timer_j() {
        let mut fsm = ServerNonInviteFsm::new(settings(), false);
        let actions = fsm.on_event(ServerNonInviteEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state, ServerNonInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::Schedule { timer: TimerType::J, delay } if *delay == Duration::from_secs(32)
        )));

        let actions = fsm.on_event(ServerNonInviteEvent::ReceiveRetransmit);
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Transmit(_))));

        let actions = fsm.on_event(ServerNonInviteEvent::TimerFired(TimerType::J));
        assert_eq!(fsm.state, ServerNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TxTermination::Completed))));
    }

    #[test]
    fn transport_error_terminates_every_machine() {
        let mut invite = ClientInviteFsm::new(settings(), false);
        invite.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        assert!(invite
            .on_event(ClientInviteEvent::TransportError)
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TxTermination::TransportLost))));

        let mut non_invite = ClientNonInviteFsm::new(settings(), false);
        non_invite.on_event(ClientNonInviteEvent::SendRequest(sample_request(Method::Bye)));
        assert!(non_invite
            .on_event(ClientNonInviteEvent::TransportError)
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TxTermination::TransportLost))));
    }
}
