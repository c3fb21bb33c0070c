// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The single-task dispatcher.
//!
//! One task owns the transaction table, the dialog layer and the timer
//! queue, and consumes three event sources: user commands, inbound
//! packets, and timer fires. Each event is processed to completion before
//! the next is picked, so the tables need no locks. Handlers never block;
//! I/O is a channel/socket hand-off.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use smol_str::SmolStr;
use tinysip_auth::{CredentialSet, DigestAuthenticator, DigestChallenge};
use tinysip_core::{
    generate_tag, CSeq, Method, Request, Response, SipMessage, SipUri, StatusLine, Via,
};
use tinysip_dialog::{DialogId, DialogLayer};
use tinysip_observe::{FlowSink, FlowTracker};
use tinysip_parse::{emit_request, parse_message};
use tinysip_transaction::{
    generate_branch, ClientAction, ClientInviteEvent, ClientInviteFsm, ClientInviteState,
    ClientNonInviteEvent, ClientNonInviteFsm, LegacyKey, ServerAction, ServerInviteEvent,
    ServerInviteFsm, ServerNonInviteEvent, ServerNonInviteFsm, TimerHandle, TimerQueue,
    TimerSettings, TimerType, TransactionKey, TxRole, TxTermination,
};
use tinysip_transport::{InboundPacket, Transport};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{config::UserAgentConfig, error::UaError, event::UaEvent};

/// Completion channel of a user-initiated request.
pub(crate) type Reply = oneshot::Sender<Result<Response, UaError>>;

/// Commands from the facade into the dispatcher.
pub(crate) enum Command {
    /// Open a client transaction for a fully built request.
    Request {
        request: Request,
        peer: SocketAddr,
        reply: Reply,
    },
    /// Cancel a pending INVITE client transaction.
    Cancel { key: TransactionKey },
    /// Send a BYE inside a dialog.
    Bye { dialog: DialogId, reply: Reply },
    /// Answer a server transaction.
    Respond {
        key: TransactionKey,
        code: u16,
        reason: SmolStr,
        body: Option<(SmolStr, Bytes)>,
    },
    /// Introspection snapshot for callers and tests.
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Point-in-time view of dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub transactions: usize,
    pub dialogs: usize,
    pub confirmed_dialogs: usize,
    pub pending_timers: usize,
}

enum TxFsm {
    InviteClient(ClientInviteFsm),
    NonInviteClient(ClientNonInviteFsm),
    InviteServer(ServerInviteFsm),
    NonInviteServer(ServerNonInviteFsm),
}

/// Client-side bookkeeping needed for the challenge retry loop.
struct ClientOrigin {
    request: Request,
    /// Nonce answered by the previous retry, if any.
    answered_nonce: Option<SmolStr>,
}

struct TransactionEntry {
    key: TransactionKey,
    fsm: TxFsm,
    peer: SocketAddr,
    timer_handles: HashMap<TimerType, TimerHandle>,
    reply: Option<Reply>,
    origin: Option<ClientOrigin>,
    /// Half-dialog key while this INVITE client transaction is pending.
    invite_dialog: Option<(SmolStr, SmolStr)>,
    /// Original request of a server transaction.
    request: Option<Request>,
    /// To-tag this server transaction stamps on every non-100 response.
    local_tag: Option<SmolStr>,
    legacy: Option<LegacyKey>,
    cancel_requested: bool,
    cancel_sent: bool,
}

impl TransactionEntry {
    fn client(key: TransactionKey, peer: SocketAddr, fsm: TxFsm, reply: Reply, origin: ClientOrigin) -> Self {
        Self {
            key,
            fsm,
            peer,
            timer_handles: HashMap::new(),
            reply: Some(reply),
            origin: Some(origin),
            invite_dialog: None,
            request: None,
            local_tag: None,
            legacy: None,
            cancel_requested: false,
            cancel_sent: false,
        }
    }

    fn server(key: TransactionKey, peer: SocketAddr, fsm: TxFsm, request: Request) -> Self {
        let legacy = LegacyKey::from_request(&request);
        Self {
            key,
            fsm,
            peer,
            timer_handles: HashMap::new(),
            reply: None,
            origin: None,
            invite_dialog: None,
            request: Some(request),
            local_tag: None,
            legacy,
            cancel_requested: false,
            cancel_sent: false,
        }
    }
}

struct TimerTask {
    key: TransactionKey,
    timer: TimerType,
}

pub(crate) struct Dispatcher {
    config: UserAgentConfig,
    transport: Arc<dyn Transport>,
    reliable: bool,
    sent_by: SmolStr,
    via_transport: &'static str,
    packets: mpsc::Receiver<InboundPacket>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<UaEvent>,
    timers: TimerQueue<TimerTask>,
    transactions: HashMap<TransactionKey, TransactionEntry>,
    legacy_index: HashMap<LegacyKey, TransactionKey>,
    dialogs: DialogLayer,
    auth: DigestAuthenticator,
    flows: Arc<FlowTracker>,
    settings: TimerSettings,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: UserAgentConfig,
        transport: Arc<dyn Transport>,
        packets: mpsc::Receiver<InboundPacket>,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<UaEvent>,
        credentials: CredentialSet,
        flows: Arc<FlowTracker>,
        sent_by: SmolStr,
    ) -> Self {
        let settings = config.timers;
        let reliable = transport.reliable();
        let via_transport = transport.kind().via_transport();
        Self {
            config,
            transport,
            reliable,
            sent_by,
            via_transport,
            packets,
            commands,
            events,
            timers: TimerQueue::new(),
            transactions: HashMap::new(),
            legacy_index: HashMap::new(),
            dialogs: DialogLayer::new(),
            auth: DigestAuthenticator::new(credentials),
            flows,
            settings,
        }
    }

    /// Runs until both the command and packet channels close.
    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.timers.next_deadline();
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                pkt = self.packets.recv() => match pkt {
                    Some(pkt) => self.handle_packet(pkt).await,
                    None => break,
                },
                _ = sleep => self.handle_due_timers().await,
            }
        }
        debug!("dispatcher stopped");
    }

    // ---- commands -------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request { request, peer, reply } => {
                self.start_client_transaction(request, peer, reply, None).await;
            }
            Command::Cancel { key } => self.handle_cancel(key).await,
            Command::Bye { dialog, reply } => self.handle_bye(dialog, reply).await,
            Command::Respond { key, code, reason, body } => {
                self.handle_respond(key, code, reason, body).await;
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Snapshot {
                    transactions: self.transactions.len(),
                    dialogs: self.dialogs.len(),
                    confirmed_dialogs: self.dialogs.confirmed_count(),
                    pending_timers: self.timers.len(),
                });
            }
        }
    }

    async fn start_client_transaction(
        &mut self,
        request: Request,
        peer: SocketAddr,
        reply: Reply,
        answered_nonce: Option<SmolStr>,
    ) {
        let key = match TransactionKey::for_outbound_request(&request) {
            Some(key) => key,
            None => {
                let _ = reply.send(Err(UaError::ProtocolViolation(SmolStr::new(
                    "request without Via branch",
                ))));
                return;
            }
        };

        let origin = ClientOrigin {
            request: request.clone(),
            answered_nonce,
        };

        let mut entry = if request.method().is_invite() {
            let mut entry = TransactionEntry::client(
                key.clone(),
                peer,
                TxFsm::InviteClient(ClientInviteFsm::new(self.settings, self.reliable)),
                reply,
                origin,
            );
            entry.invite_dialog = self.dialogs.register_invite(&request);
            entry
        } else {
            TransactionEntry::client(
                key.clone(),
                peer,
                TxFsm::NonInviteClient(ClientNonInviteFsm::new(self.settings, self.reliable)),
                reply,
                origin,
            )
        };

        debug!(key = ?key, %peer, method = %request.method(), "client transaction open");
        let actions = match &mut entry.fsm {
            TxFsm::InviteClient(fsm) => fsm.on_event(ClientInviteEvent::SendInvite(request)),
            TxFsm::NonInviteClient(fsm) => fsm.on_event(ClientNonInviteEvent::SendRequest(request)),
            _ => unreachable!(),
        };
        self.transactions.insert(key.clone(), entry);
        self.apply_client_actions(&key, actions).await;
    }

    async fn handle_cancel(&mut self, key: TransactionKey) {
        let proceed = match self.transactions.get_mut(&key) {
            Some(entry) => match &entry.fsm {
                TxFsm::InviteClient(fsm) => match fsm.state {
                    ClientInviteState::Calling => {
                        // No provisional yet: CANCEL waits for the first 1xx.
                        entry.cancel_requested = true;
                        false
                    }
                    ClientInviteState::Proceeding => {
                        entry.cancel_requested = true;
                        !entry.cancel_sent
                    }
                    _ => false,
                },
                _ => false,
            },
            None => false,
        };
        if proceed {
            self.send_cancel(&key).await;
        }
    }

    /// Emits the CANCEL for a pending INVITE: same request-URI, Via (and
    /// branch), From, To, Call-ID and CSeq number, method CANCEL.
    async fn send_cancel(&mut self, invite_key: &TransactionKey) {
        let (invite, peer) = match self.transactions.get_mut(invite_key) {
            Some(entry) => {
                entry.cancel_sent = true;
                match &entry.origin {
                    Some(origin) => (origin.request.clone(), entry.peer),
                    None => return,
                }
            }
            None => return,
        };

        let mut cancel = Request::new(
            tinysip_core::RequestLine::new(Method::Cancel, invite.uri().clone()),
            tinysip_core::Headers::new(),
            Bytes::new(),
        );
        if let Some(via) = invite.headers.get_all("Via").next() {
            cancel.headers.push("Via", via.clone());
        }
        for name in ["From", "To", "Call-ID"] {
            if let Some(value) = invite.header(name) {
                cancel.headers.push(name, value.clone());
            }
        }
        if let Some(cseq) = invite.header("CSeq") {
            let number = cseq.split_whitespace().next().unwrap_or("1");
            cancel.headers.push("CSeq", format!("{} CANCEL", number));
        }
        cancel.headers.push("Max-Forwards", "70");

        info!(key = ?invite_key, "cancelling pending INVITE");
        // The CANCEL response is not interesting to the caller; the INVITE
        // completes with 487 (or 2xx if the race is lost).
        let (reply, _ignored) = oneshot::channel();
        Box::pin(self.start_client_transaction(cancel, peer, reply, None)).await;
    }

    async fn handle_bye(&mut self, dialog_id: DialogId, reply: Reply) {
        let request = match self.dialogs.get_mut(&dialog_id) {
            Some(dialog) => {
                let mut request = dialog.next_request(Method::Bye);
                let via = self.fresh_via();
                request.headers.push("Via", via);
                request
            }
            None => {
                let _ = reply.send(Err(UaError::DialogGone));
                return;
            }
        };

        let peer = match self.resolve_dialog_target(&dialog_id).await {
            Some(peer) => peer,
            None => {
                let _ = reply.send(Err(UaError::TransportLost));
                return;
            }
        };

        // BYE tears the dialog down regardless of the response.
        self.dialogs.terminate(&dialog_id);
        self.emit(UaEvent::DialogTerminated {
            id: dialog_id,
            reason: SmolStr::new("BYE sent"),
        });
        self.start_client_transaction(request, peer, reply, None).await;
    }

    async fn handle_respond(
        &mut self,
        key: TransactionKey,
        code: u16,
        reason: SmolStr,
        body: Option<(SmolStr, Bytes)>,
    ) {
        let (request, existing_tag) = match self.transactions.get(&key) {
            Some(entry) => match entry.request.clone() {
                Some(request) => (request, entry.local_tag.clone()),
                None => {
                    warn!(key = ?key, "respond on client transaction");
                    return;
                }
            },
            None => {
                warn!(key = ?key, "respond on unknown server transaction");
                return;
            }
        };

        let mut response = response_for(&request, code, reason.as_str());
        // Every response above 100 carries the transaction's To-tag.
        if code > 100 {
            let tag = existing_tag.unwrap_or_else(generate_tag);
            apply_to_tag(&mut response, &tag);
            if let Some(entry) = self.transactions.get_mut(&key) {
                entry.local_tag = Some(tag);
            }
        }
        if request.method().is_invite() && (200..300).contains(&code) {
            response
                .headers
                .push("Contact", format!("<{}>", self.local_contact_uri()));
        }
        if let Some((content_type, bytes)) = body {
            response.headers.push("Content-Type", content_type);
            response.body = bytes;
        }

        if request.method().is_invite() && (200..300).contains(&code) {
            if let Some(id) = self.dialogs.register_uas(&request, &response) {
                debug!(dialog = %id, "uas dialog registered");
            }
        }

        let provisional = code < 200;
        let actions = match self.transactions.get_mut(&key) {
            Some(entry) => match &mut entry.fsm {
                TxFsm::InviteServer(fsm) => {
                    if provisional {
                        fsm.on_event(ServerInviteEvent::SendProvisional(response))
                    } else {
                        fsm.on_event(ServerInviteEvent::SendFinal(response))
                    }
                }
                TxFsm::NonInviteServer(fsm) => {
                    if provisional {
                        fsm.on_event(ServerNonInviteEvent::SendProvisional(response))
                    } else {
                        fsm.on_event(ServerNonInviteEvent::SendFinal(response))
                    }
                }
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        self.apply_server_actions(&key, actions).await;
    }

    // ---- inbound packets ------------------------------------------------

    async fn handle_packet(&mut self, packet: InboundPacket) {
        let message = match parse_message(&packet.bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %packet.peer, error = %err, "dropping unparsable packet");
                return;
            }
        };
        self.flows.on_recv(&message, packet.peer);

        match message {
            SipMessage::Response(response) => self.handle_response(response).await,
            SipMessage::Request(request) => self.handle_request(request, packet.peer).await,
        }
    }

    async fn handle_response(&mut self, response: Response) {
        let key = match TransactionKey::for_inbound_response(&response) {
            Some(key) => key,
            None => {
                warn!("response without matchable Via/CSeq");
                return;
            }
        };
        if key.sent_by != self.sent_by {
            warn!(got = %key.sent_by, expected = %self.sent_by, "Via mismatch in response");
            return;
        }

        if self.transactions.contains_key(&key) {
            let actions = {
                let entry = self.transactions.get_mut(&key).expect("checked");
                match &mut entry.fsm {
                    TxFsm::InviteClient(fsm) => {
                        let event = if response.is_provisional() {
                            ClientInviteEvent::ReceiveProvisional(response)
                        } else {
                            ClientInviteEvent::ReceiveFinal(response)
                        };
                        fsm.on_event(event)
                    }
                    TxFsm::NonInviteClient(fsm) => {
                        let event = if response.is_provisional() {
                            ClientNonInviteEvent::ReceiveProvisional(response)
                        } else {
                            ClientNonInviteEvent::ReceiveFinal(response)
                        };
                        fsm.on_event(event)
                    }
                    _ => Vec::new(),
                }
            };
            self.apply_client_actions(&key, actions).await;
            return;
        }

        // No transaction: a 2xx retransmission for a confirmed dialog gets
        // its ACK again from the dialog layer; everything else is absorbed.
        if response.is_success() && key.method.is_invite() {
            self.re_ack_retransmitted_2xx(&response).await;
        } else {
            debug!(key = ?key, "late response absorbed");
        }
    }

    async fn re_ack_retransmitted_2xx(&mut self, response: &Response) {
        let Some(id) = DialogId::from_response_uac(response) else {
            return;
        };
        let via = self.fresh_via();
        let ack = match self.dialogs.get_mut(&id) {
            Some(dialog) if dialog.is_confirmed() => match dialog.last_ack() {
                Some(ack) => ack.clone(),
                None => dialog.ack(&via),
            },
            _ => return,
        };
        debug!(dialog = %id, "re-acking retransmitted 2xx");
        self.send_dialog_request(&id, ack).await;
    }

    async fn handle_request(&mut self, request: Request, peer: SocketAddr) {
        let key = match TransactionKey::for_inbound_request(&request) {
            Some(key) => Some(key),
            None => {
                // RFC 2543 fallback matching for pre-cookie branches.
                LegacyKey::from_request(&request)
                    .and_then(|legacy| self.legacy_index.get(&legacy).cloned())
            }
        };

        if let Some(key) = key {
            if self.transactions.contains_key(&key) {
                self.handle_matched_request(&key, &request).await;
                return;
            }
            self.handle_new_request(key, request, peer).await;
            return;
        }

        warn!(%peer, method = %request.method(), "request without usable transaction key");
    }

    /// A request matched an open server transaction: retransmission or ACK.
    async fn handle_matched_request(&mut self, key: &TransactionKey, request: &Request) {
        let is_ack = request.method() == &Method::Ack;
        let actions = {
            let entry = self.transactions.get_mut(key).expect("checked");
            match &mut entry.fsm {
                TxFsm::InviteServer(fsm) => {
                    if is_ack {
                        fsm.on_event(ServerInviteEvent::ReceiveAck)
                    } else {
                        fsm.on_event(ServerInviteEvent::ReceiveRetransmit)
                    }
                }
                TxFsm::NonInviteServer(fsm) => {
                    fsm.on_event(ServerNonInviteEvent::ReceiveRetransmit)
                }
                // A request can only legitimately match a server entry;
                // duplicates against client entries are absorbed.
                _ => Vec::new(),
            }
        };
        if is_ack {
            if let Some(dialog) = self.dialogs.find_for_request(request) {
                dialog.confirm_on_ack();
            }
        }
        self.apply_server_actions(key, actions).await;
    }

    async fn handle_new_request(
        &mut self,
        key: TransactionKey,
        request: Request,
        peer: SocketAddr,
    ) {
        match request.method() {
            Method::Ack => {
                // ACK for a 2xx never matches a transaction; it belongs to
                // the dialog.
                if let Some(dialog) = self.dialogs.find_for_request(&request) {
                    dialog.confirm_on_ack();
                    debug!(dialog = %dialog.id, "dialog confirmed by ACK");
                } else {
                    debug!("stray ACK absorbed");
                }
            }
            Method::Cancel => self.handle_inbound_cancel(key, request, peer).await,
            Method::Bye => self.handle_inbound_bye(key, request, peer).await,
            Method::Invite => {
                let entry = TransactionEntry::server(
                    key.clone(),
                    peer,
                    TxFsm::InviteServer(ServerInviteFsm::new(self.settings, self.reliable)),
                    request.clone(),
                );
                self.insert_server_entry(entry);
                // 100 Trying goes out right away; ringing and the final
                // response are the application's call.
                self.handle_respond(key.clone(), 100, SmolStr::new("Trying"), None).await;
                self.emit(UaEvent::NewRequest { key, request, peer });
            }
            _ => {
                let entry = TransactionEntry::server(
                    key.clone(),
                    peer,
                    TxFsm::NonInviteServer(ServerNonInviteFsm::new(self.settings, self.reliable)),
                    request.clone(),
                );
                self.insert_server_entry(entry);
                self.emit(UaEvent::NewRequest { key, request, peer });
            }
        }
    }

    async fn handle_inbound_cancel(
        &mut self,
        key: TransactionKey,
        request: Request,
        peer: SocketAddr,
    ) {
        let entry = TransactionEntry::server(
            key.clone(),
            peer,
            TxFsm::NonInviteServer(ServerNonInviteFsm::new(self.settings, self.reliable)),
            request,
        );
        self.insert_server_entry(entry);

        let invite_key = TransactionKey::new(
            key.branch.clone(),
            key.sent_by.clone(),
            Method::Invite,
            TxRole::Server,
        );
        if self.transactions.contains_key(&invite_key) {
            self.handle_respond(key, 200, SmolStr::new("OK"), None).await;
            self.handle_respond(
                invite_key,
                487,
                SmolStr::new("Request Terminated"),
                None,
            )
            .await;
        } else {
            self.handle_respond(
                key,
                481,
                SmolStr::new("Call/Transaction Does Not Exist"),
                None,
            )
            .await;
        }
    }

    async fn handle_inbound_bye(
        &mut self,
        key: TransactionKey,
        request: Request,
        peer: SocketAddr,
    ) {
        let entry = TransactionEntry::server(
            key.clone(),
            peer,
            TxFsm::NonInviteServer(ServerNonInviteFsm::new(self.settings, self.reliable)),
            request.clone(),
        );
        self.insert_server_entry(entry);

        let dialog_id = match self.dialogs.find_for_request(&request) {
            Some(dialog) => {
                let cseq_ok = request
                    .header("CSeq")
                    .and_then(|v| CSeq::parse(v))
                    .map(|cseq| dialog.observe_remote_cseq(cseq.seq))
                    .unwrap_or(false);
                if cseq_ok {
                    Some(dialog.id.clone())
                } else {
                    None
                }
            }
            None => None,
        };

        match dialog_id {
            Some(id) => {
                self.handle_respond(key, 200, SmolStr::new("OK"), None).await;
                self.dialogs.terminate(&id);
                self.emit(UaEvent::DialogTerminated {
                    id,
                    reason: SmolStr::new("BYE received"),
                });
            }
            None => {
                self.handle_respond(
                    key,
                    481,
                    SmolStr::new("Call/Transaction Does Not Exist"),
                    None,
                )
                .await;
            }
        }
    }

    fn insert_server_entry(&mut self, entry: TransactionEntry) {
        if let Some(legacy) = &entry.legacy {
            self.legacy_index.insert(legacy.clone(), entry.key.clone());
        }
        debug!(key = ?entry.key, peer = %entry.peer, "server transaction open");
        self.transactions.insert(entry.key.clone(), entry);
    }

    // ---- timers ---------------------------------------------------------

    async fn handle_due_timers(&mut self) {
        let now = Instant::now();
        while let Some((_, task)) = self.timers.pop_due(now) {
            self.on_timer(task).await;
        }
    }

    async fn on_timer(&mut self, task: TimerTask) {
        let TimerTask { key, timer } = task;
        let actions = match self.transactions.get_mut(&key) {
            Some(entry) => {
                entry.timer_handles.remove(&timer);
                match &mut entry.fsm {
                    TxFsm::InviteClient(fsm) => {
                        Actions::Client(fsm.on_event(ClientInviteEvent::TimerFired(timer)))
                    }
                    TxFsm::NonInviteClient(fsm) => {
                        Actions::Client(fsm.on_event(ClientNonInviteEvent::TimerFired(timer)))
                    }
                    TxFsm::InviteServer(fsm) => {
                        Actions::Server(fsm.on_event(ServerInviteEvent::TimerFired(timer)))
                    }
                    TxFsm::NonInviteServer(fsm) => {
                        Actions::Server(fsm.on_event(ServerNonInviteEvent::TimerFired(timer)))
                    }
                }
            }
            None => return,
        };
        match actions {
            Actions::Client(actions) => self.apply_client_actions(&key, actions).await,
            Actions::Server(actions) => self.apply_server_actions(&key, actions).await,
        }
    }

    // ---- action application --------------------------------------------

    async fn apply_client_actions(&mut self, key: &TransactionKey, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::Transmit(bytes) => self.transmit(key, bytes).await,
                ClientAction::Deliver(response) => self.deliver_response(key, response).await,
                ClientAction::Schedule { timer, delay } => self.schedule(key, timer, delay),
                ClientAction::Cancel(timer) => self.cancel_timer(key, timer),
                ClientAction::Terminate(reason) => self.terminate_transaction(key, reason).await,
            }
        }
    }

    async fn apply_server_actions(&mut self, key: &TransactionKey, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Transmit(bytes) => self.transmit(key, bytes).await,
                ServerAction::Schedule { timer, delay } => self.schedule(key, timer, delay),
                ServerAction::Cancel(timer) => self.cancel_timer(key, timer),
                ServerAction::Terminate(reason) => self.terminate_transaction(key, reason).await,
            }
        }
    }

    async fn transmit(&mut self, key: &TransactionKey, bytes: Bytes) {
        let peer = match self.transactions.get(key) {
            Some(entry) => entry.peer,
            None => return,
        };
        if let Ok(message) = parse_message(&bytes) {
            self.flows.on_send(&message, peer);
        }
        // UDP write failures are best effort: the retransmit timer covers
        // the loss.
        if let Err(err) = self.transport.send(bytes, peer).await {
            warn!(%peer, error = %err, "transport send failed");
            if self.reliable {
                let actions = match self.transactions.get_mut(key) {
                    Some(entry) => match &mut entry.fsm {
                        TxFsm::InviteClient(fsm) => {
                            Actions::Client(fsm.on_event(ClientInviteEvent::TransportError))
                        }
                        TxFsm::NonInviteClient(fsm) => {
                            Actions::Client(fsm.on_event(ClientNonInviteEvent::TransportError))
                        }
                        TxFsm::InviteServer(fsm) => {
                            Actions::Server(fsm.on_event(ServerInviteEvent::TransportError))
                        }
                        TxFsm::NonInviteServer(fsm) => {
                            Actions::Server(fsm.on_event(ServerNonInviteEvent::TransportError))
                        }
                    },
                    None => return,
                };
                match actions {
                    Actions::Client(actions) => {
                        Box::pin(self.apply_client_actions(key, actions)).await
                    }
                    Actions::Server(actions) => {
                        Box::pin(self.apply_server_actions(key, actions)).await
                    }
                }
            }
        }
    }

    fn schedule(&mut self, key: &TransactionKey, timer: TimerType, delay: std::time::Duration) {
        let handle = self.timers.schedule(
            delay,
            TimerTask {
                key: key.clone(),
                timer,
            },
        );
        if let Some(entry) = self.transactions.get_mut(key) {
            if let Some(stale) = entry.timer_handles.insert(timer, handle) {
                self.timers.cancel(stale);
            }
        }
    }

    fn cancel_timer(&mut self, key: &TransactionKey, timer: TimerType) {
        if let Some(entry) = self.transactions.get_mut(key) {
            if let Some(handle) = entry.timer_handles.remove(&timer) {
                self.timers.cancel(handle);
            }
        }
    }

    async fn deliver_response(&mut self, key: &TransactionKey, response: Response) {
        self.emit(UaEvent::ResponseReceived {
            key: key.clone(),
            response: response.clone(),
        });

        if response.is_provisional() {
            let (half, cancel_now) = match self.transactions.get_mut(key) {
                Some(entry) => {
                    let cancel_now = entry.cancel_requested && !entry.cancel_sent;
                    (entry.invite_dialog.clone(), cancel_now)
                }
                None => return,
            };
            if let Some(half) = &half {
                self.dialogs.on_invite_response(half, &response);
            }
            if cancel_now {
                self.send_cancel(key).await;
            }
            return;
        }

        // Final response. Challenges get one retry before surfacing.
        if response.is_challenge() {
            match self.attempt_auth_retry(key, &response).await {
                Ok(()) => return,
                Err(err) => {
                    info!(key = ?key, error = %err, "challenge not retried");
                    self.complete_reply(key, Err(err));
                    self.finish_invite_dialog(key, &response).await;
                    return;
                }
            }
        }

        self.finish_invite_dialog(key, &response).await;

        if response.start.code == 481 {
            // The peer no longer knows the dialog.
            if let Some(id) = DialogId::from_response_uac(&response) {
                if self.dialogs.terminate(&id).is_some() {
                    self.emit(UaEvent::DialogTerminated {
                        id,
                        reason: SmolStr::new("481"),
                    });
                }
            }
        }

        self.complete_reply(key, Ok(response));
    }

    /// Dialog work owed for a final response on an INVITE client
    /// transaction: promote-and-ACK on 2xx, tear down otherwise.
    async fn finish_invite_dialog(&mut self, key: &TransactionKey, response: &Response) {
        let half = match self.transactions.get(key) {
            Some(entry) => entry.invite_dialog.clone(),
            None => None,
        };
        let Some(half) = half else { return };

        if response.is_success() {
            if let Some(id) = self.dialogs.on_invite_response(&half, response) {
                let via = self.fresh_via();
                let ack = match self.dialogs.get_mut(&id) {
                    Some(dialog) => dialog.ack(&via),
                    None => return,
                };
                self.send_dialog_request(&id, ack).await;
            }
            return;
        }

        // Failed INVITE: the half-dialog dies; so does any early dialog.
        if let Some(id) = self.dialogs.on_invite_response(&half, response) {
            if self.dialogs.terminate(&id).is_some() {
                self.emit(UaEvent::DialogTerminated {
                    id,
                    reason: SmolStr::new(format!("{}", response.start.code)),
                });
            }
        }
        self.dialogs.abandon_invite(&half);
    }

    /// §4.6 challenge retry: fresh top-Via branch, CSeq+1, computed
    /// Authorization, stable Call-ID and From tag, one retry per nonce.
    async fn attempt_auth_retry(
        &mut self,
        key: &TransactionKey,
        response: &Response,
    ) -> Result<(), UaError> {
        let (origin_request, answered_nonce) = match self.transactions.get(key) {
            Some(entry) => match &entry.origin {
                Some(origin) => (origin.request.clone(), origin.answered_nonce.clone()),
                None => return Err(UaError::UnsupportedChallenge),
            },
            None => return Err(UaError::UnsupportedChallenge),
        };

        let challenge = DigestChallenge::from_response(response)?;
        if answered_nonce.as_deref() == Some(challenge.nonce.as_str()) {
            return Err(UaError::AuthFailed);
        }

        let uri = origin_request.uri().to_string();
        let authorization =
            self.auth
                .answer(&challenge, origin_request.method(), uri.as_str())?;

        let mut retried = origin_request.clone();
        let next_cseq = match retried.header("CSeq").and_then(|v| CSeq::parse(v)) {
            Some(cseq) => CSeq::new(cseq.seq + 1, cseq.method),
            None => return Err(UaError::UnsupportedChallenge),
        };
        retried.headers.set("CSeq", next_cseq.to_string());

        let fresh_branch = generate_branch();
        if let Some(via_value) = retried.headers.get("Via").cloned() {
            if let Some(mut via) = Via::parse(&via_value) {
                via.set_branch(&fresh_branch);
                retried.headers.set("Via", via.to_string());
            }
        }
        retried
            .headers
            .set(challenge.answer_header(), authorization);

        // The replaced transaction hands its reply channel over to the
        // retry; its own FSM drains through D/K as usual. A retried INVITE
        // re-registers the half-dialog under the same (Call-ID, tag) key
        // with the new CSeq when the fresh transaction opens.
        let (reply, peer) = match self.transactions.get_mut(key) {
            Some(entry) => {
                entry.invite_dialog.take();
                (entry.reply.take(), entry.peer)
            }
            None => return Err(UaError::UnsupportedChallenge),
        };
        let Some(reply) = reply else {
            return Err(UaError::AuthFailed);
        };

        info!(
            realm = %challenge.realm,
            method = %retried.method(),
            cseq = next_cseq.seq,
            "reissuing challenged request"
        );
        Box::pin(self.start_client_transaction(retried, peer, reply, Some(challenge.nonce.clone())))
            .await;
        Ok(())
    }

    async fn terminate_transaction(&mut self, key: &TransactionKey, reason: TxTermination) {
        match reason {
            TxTermination::Timeout => {
                self.emit(UaEvent::TransactionTimeout { key: key.clone() });
                self.complete_reply(key, Err(UaError::Timeout));
                let half = self
                    .transactions
                    .get(key)
                    .and_then(|e| e.invite_dialog.clone());
                if let Some(half) = half {
                    self.dialogs.abandon_invite(&half);
                }
            }
            TxTermination::TransportLost => {
                self.complete_reply(key, Err(UaError::TransportLost));
            }
            TxTermination::NoAck => {
                warn!(key = ?key, "final response never acknowledged");
                self.emit(UaEvent::TransactionTimeout { key: key.clone() });
            }
            TxTermination::Completed => {}
        }

        if let Some(entry) = self.transactions.remove(key) {
            for (_, handle) in entry.timer_handles {
                self.timers.cancel(handle);
            }
            if let Some(legacy) = entry.legacy {
                self.legacy_index.remove(&legacy);
            }
            debug!(key = ?key, ?reason, "transaction terminated");
        }
    }

    fn complete_reply(&mut self, key: &TransactionKey, outcome: Result<Response, UaError>) {
        if let Some(entry) = self.transactions.get_mut(key) {
            if let Some(reply) = entry.reply.take() {
                let _ = reply.send(outcome);
            }
        }
    }

    // ---- plumbing -------------------------------------------------------

    fn emit(&self, event: UaEvent) {
        let _ = self.events.send(event);
    }

    fn fresh_via(&self) -> String {
        format!(
            "SIP/2.0/{} {};branch={}",
            self.via_transport,
            self.sent_by,
            generate_branch()
        )
    }

    fn local_contact_uri(&self) -> String {
        let user = self
            .config
            .local_uri
            .user
            .as_ref()
            .map(|u| format!("{}@", u))
            .unwrap_or_default();
        format!("sip:{}{}", user, self.sent_by)
    }

    /// Next hop of a dialog: the first route when a route set exists,
    /// otherwise the remote target.
    async fn resolve_dialog_target(&mut self, id: &DialogId) -> Option<SocketAddr> {
        let uri = {
            let dialog = self.dialogs.get(id)?;
            dialog
                .route_set
                .first()
                .map(|route| route.uri.clone())
                .unwrap_or_else(|| dialog.remote_target.clone())
        };
        resolve_uri(&uri).await
    }

    /// Sends a dialog-routed request (ACK) outside any transaction.
    async fn send_dialog_request(&mut self, id: &DialogId, request: Request) {
        let Some(peer) = self.resolve_dialog_target(id).await else {
            warn!(dialog = %id, "no route to dialog target");
            return;
        };
        let bytes = emit_request(&request);
        self.flows.on_send(&SipMessage::Request(request), peer);
        if let Err(err) = self.transport.send(bytes, peer).await {
            warn!(%peer, error = %err, "dialog send failed");
        }
    }
}

enum Actions {
    Client(Vec<ClientAction>),
    Server(Vec<ServerAction>),
}

/// Builds a response echoing the request's identity headers (Via set,
/// From, To, Call-ID, CSeq).
fn response_for(request: &Request, code: u16, reason: &str) -> Response {
    let mut headers = tinysip_core::Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = request.header(name) {
            headers.push(name, value.clone());
        }
    }
    Response::new(StatusLine::new(code, reason), headers, Bytes::new())
}

/// Stamps the given To-tag when the To header has none (in-dialog
/// requests already carry one).
fn apply_to_tag(response: &mut Response, tag: &SmolStr) {
    let needs_tag = response
        .header("To")
        .map(|to| !to.contains("tag="))
        .unwrap_or(false);
    if needs_tag {
        let tagged = format!("{};tag={}", response.header("To").expect("checked"), tag);
        response.headers.set("To", tagged);
    }
}

/// Resolves a SIP URI to a socket address. IP literals short-circuit;
/// hostnames go through the system resolver.
pub(crate) async fn resolve_uri(uri: &SipUri) -> Option<SocketAddr> {
    let port = uri.port_or_default();
    if let Ok(ip) = uri.host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((uri.host.as_str(), port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_for_echoes_identity() {
        let mut headers = tinysip_core::Headers::new();
        headers.push("Via", "SIP/2.0/UDP peer:5060;branch=z9hG4bKx");
        headers.push("From", "<sip:a@b.c>;tag=1");
        headers.push("To", "<sip:me@here>");
        headers.push("Call-ID", "c1");
        headers.push("CSeq", "3 OPTIONS");
        let request = Request::new(
            tinysip_core::RequestLine::new(
                Method::Options,
                SipUri::parse("sip:me@here").unwrap(),
            ),
            headers,
            Bytes::new(),
        );

        let response = response_for(&request, 200, "OK");
        assert_eq!(response.header("CSeq").unwrap().as_str(), "3 OPTIONS");
        assert_eq!(response.header("Call-ID").unwrap().as_str(), "c1");
    }

    #[test]
    fn to_tag_is_stamped_only_when_absent() {
        let mut headers = tinysip_core::Headers::new();
        headers.push("To", "<sip:me@here>;tag=abc");
        let mut response = Response::new(StatusLine::new(200, "OK"), headers, Bytes::new());
        apply_to_tag(&mut response, &SmolStr::new("fresh123"));
        assert_eq!(response.header("To").unwrap().as_str(), "<sip:me@here>;tag=abc");

        let mut headers = tinysip_core::Headers::new();
        headers.push("To", "<sip:me@here>");
        let mut response = Response::new(StatusLine::new(200, "OK"), headers, Bytes::new());
        apply_to_tag(&mut response, &SmolStr::new("fresh123"));
        assert!(response.header("To").unwrap().contains("tag=fresh123"));
    }

    #[tokio::test]
    async fn resolve_prefers_ip_literals() {
        let uri = SipUri::parse("sip:192.0.2.5:5070").unwrap();
        assert_eq!(
            resolve_uri(&uri).await,
            Some("192.0.2.5:5070".parse().unwrap())
        );
        let no_port = SipUri::parse("sip:192.0.2.5").unwrap();
        assert_eq!(
            resolve_uri(&no_port).await,
            Some("192.0.2.5:5060".parse().unwrap())
        );
    }
}
