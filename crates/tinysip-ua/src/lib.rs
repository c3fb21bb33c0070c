// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP user agent facade.
//!
//! [`UserAgent`] owns a transport, a credential table, and the
//! single-task dispatcher that runs transactions and dialogs. It exposes
//! REGISTER/OPTIONS/INVITE/BYE/CANCEL operations, a server-side
//! [`respond`](UserAgent::respond), an event stream, and the signalling
//! flow log. Challenged requests (401/407) are reissued automatically
//! once per challenge when a credential for the realm is registered.
//!
//! # Example
//! ```no_run
//! use tinysip_ua::{UserAgent, UserAgentConfig};
//! # async fn example() -> anyhow::Result<()> {
//! let mut config = UserAgentConfig::for_identity("sip:alice@client.example.com").unwrap();
//! config.bind_addr = "0.0.0.0:5060".parse()?;
//! let ua = UserAgent::bind_udp(config).await?;
//! ua.add_credentials("example.com", "alice", "hunter2");
//! let response = ua.register("sip:example.com").await?;
//! println!("registered: {}", response.code());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tinysip_auth::{CredentialSet, Credentials};
use tinysip_core::{
    generate_call_id, generate_tag, Headers, Method, Request, RequestLine, Response, SipUri,
};
use tinysip_observe::FlowTracker;
use tinysip_transaction::{generate_branch, TransactionKey};
use tinysip_transport::{InboundPacket, Transport, UdpTransport};
use tokio::sync::{mpsc, oneshot};

mod config;
mod dispatcher;
mod error;
mod event;

pub use config::UserAgentConfig;
pub use dispatcher::Snapshot;
pub use error::UaError;
pub use event::UaEvent;
pub use tinysip_dialog::DialogId;

use dispatcher::{resolve_uri, Command, Dispatcher};

/// A SIP user agent bound to one transport.
pub struct UserAgent {
    config: UserAgentConfig,
    commands: mpsc::Sender<Command>,
    events: Mutex<Option<mpsc::UnboundedReceiver<UaEvent>>>,
    credentials: CredentialSet,
    flows: Arc<FlowTracker>,
    sent_by: SmolStr,
    via_transport: &'static str,
}

/// Outcome of an INVITE: the final response plus the dialog it confirmed.
#[derive(Debug, Clone)]
pub struct InviteOutcome {
    pub response: Response,
    pub dialog: Option<DialogId>,
}

/// A pending INVITE. Await [`outcome`](InviteHandle::outcome) for the
/// final response, or pass the handle to [`UserAgent::cancel`].
pub struct InviteHandle {
    key: TransactionKey,
    reply: oneshot::Receiver<Result<Response, UaError>>,
}

impl InviteHandle {
    /// The INVITE client transaction key (usable with [`UserAgent::cancel`]).
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Waits for the final response. A 2xx carries the confirmed dialog id.
    pub async fn outcome(self) -> Result<InviteOutcome, UaError> {
        let response = self.reply.await.map_err(|_| UaError::TransportLost)??;
        let dialog = if response.is_success() {
            DialogId::from_response_uac(&response)
        } else {
            None
        };
        Ok(InviteOutcome { response, dialog })
    }
}

impl UserAgent {
    /// Binds a UDP socket per the config and starts the dispatcher.
    pub async fn bind_udp(config: UserAgentConfig) -> anyhow::Result<Self> {
        let transport = UdpTransport::bind(config.bind_addr).await?;
        let (ua, packets) = Self::with_transport(config, transport.clone());
        let _receiver = transport.spawn_receiver(packets);
        Ok(ua)
    }

    /// Starts a user agent over an externally managed transport. Returns
    /// the sender inbound packets must be injected into. This is the
    /// constructor tests and custom transports use.
    pub fn with_transport(
        config: UserAgentConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::Sender<InboundPacket>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (packet_tx, packet_rx) = mpsc::channel(128);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let credentials = CredentialSet::new();
        let flows = Arc::new(FlowTracker::new());
        let sent_by = config
            .sent_by
            .clone()
            .unwrap_or_else(|| SmolStr::new(transport.local_addr().to_string()));
        let via_transport = transport.kind().via_transport();

        let dispatcher = Dispatcher::new(
            config.clone(),
            transport,
            packet_rx,
            command_rx,
            event_tx,
            credentials.clone(),
            Arc::clone(&flows),
            sent_by.clone(),
        );
        tokio::spawn(dispatcher.run());

        (
            Self {
                config,
                commands: command_tx,
                events: Mutex::new(Some(event_rx)),
                credentials,
                flows,
                sent_by,
                via_transport,
            },
            packet_tx,
        )
    }

    /// Registers the credential for a realm (one per realm, last wins).
    pub fn add_credentials(&self, realm: &str, username: &str, password: &str) {
        self.credentials.add(Credentials {
            realm: SmolStr::new(realm),
            username: SmolStr::new(username),
            password: SmolStr::new(password),
        });
    }

    /// Takes the inbound event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UaEvent>> {
        self.events.lock().take()
    }

    /// The signalling flow log.
    pub fn flows(&self) -> Arc<FlowTracker> {
        Arc::clone(&self.flows)
    }

    /// host:port this agent advertises in Via headers.
    pub fn sent_by(&self) -> &str {
        &self.sent_by
    }

    /// Sends OPTIONS to the target and waits for the final response.
    pub async fn options(&self, target: &str) -> Result<Response, UaError> {
        let uri = parse_target(target)?;
        let request = self.build_request(Method::Options, &uri, format!("<{}>", uri));
        self.transact(request, &uri).await
    }

    /// Registers the local identity at a registrar.
    pub async fn register(&self, registrar: &str) -> Result<Response, UaError> {
        let uri = parse_target(registrar)?;
        let mut request = self.build_request(
            Method::Register,
            &uri,
            format!("<{}>", self.config.local_uri),
        );
        request
            .headers
            .push("Expires", self.config.register_expires.to_string());
        self.transact(request, &uri).await
    }

    /// Starts a call. The returned handle resolves with the final
    /// response; a 2xx means the dialog is confirmed and the ACK is out.
    pub async fn invite(
        &self,
        target: &str,
        sdp: Option<Bytes>,
    ) -> Result<InviteHandle, UaError> {
        let uri = parse_target(target)?;
        let mut request = self.build_request(Method::Invite, &uri, format!("<{}>", uri));
        if let Some(sdp) = sdp {
            request.headers.push("Content-Type", "application/sdp");
            request.body = sdp;
        }

        let key = TransactionKey::for_outbound_request(&request)
            .expect("built request carries a branch");
        let peer = resolve_uri(&uri).await.ok_or(UaError::TransportLost)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                request,
                peer,
                reply: reply_tx,
            })
            .await
            .map_err(|_| UaError::TransportLost)?;

        Ok(InviteHandle {
            key,
            reply: reply_rx,
        })
    }

    /// Cancels a pending INVITE. The INVITE itself still completes
    /// (normally with 487, or 2xx when the cancel lost the race).
    pub async fn cancel(&self, handle: &InviteHandle) {
        let _ = self
            .commands
            .send(Command::Cancel {
                key: handle.key.clone(),
            })
            .await;
    }

    /// Ends a confirmed dialog with BYE.
    pub async fn bye(&self, dialog: &DialogId) -> Result<Response, UaError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Bye {
                dialog: dialog.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| UaError::TransportLost)?;
        reply_rx.await.map_err(|_| UaError::TransportLost)?
    }

    /// Answers a server transaction surfaced by
    /// [`UaEvent::NewRequest`].
    pub async fn respond(
        &self,
        key: &TransactionKey,
        code: u16,
        reason: &str,
        body: Option<(&str, Bytes)>,
    ) {
        let _ = self
            .commands
            .send(Command::Respond {
                key: key.clone(),
                code,
                reason: SmolStr::new(reason),
                body: body.map(|(content_type, bytes)| (SmolStr::new(content_type), bytes)),
            })
            .await;
    }

    /// Point-in-time counts of live transactions, dialogs and timers.
    pub async fn snapshot(&self) -> Result<Snapshot, UaError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| UaError::TransportLost)?;
        reply_rx.await.map_err(|_| UaError::TransportLost)
    }

    async fn transact(&self, request: Request, uri: &SipUri) -> Result<Response, UaError> {
        let peer = resolve_uri(uri).await.ok_or(UaError::TransportLost)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                request,
                peer,
                reply: reply_tx,
            })
            .await
            .map_err(|_| UaError::TransportLost)?;
        reply_rx.await.map_err(|_| UaError::TransportLost)?
    }

    /// Assembles an out-of-dialog request with fresh branch, tag and
    /// Call-ID.
    fn build_request(&self, method: Method, uri: &SipUri, to_value: String) -> Request {
        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={}",
                self.via_transport,
                self.sent_by,
                generate_branch()
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push(
            "From",
            format!("<{}>;tag={}", self.config.local_uri, generate_tag()),
        );
        headers.push("To", to_value);
        headers.push("Call-ID", generate_call_id(&self.config.local_uri.host));
        headers.push("CSeq", format!("1 {}", method));
        headers.push("Contact", format!("<{}>", self.local_contact()));

        Request::new(RequestLine::new(method, uri.clone()), headers, Bytes::new())
    }

    fn local_contact(&self) -> String {
        let user = self
            .config
            .local_uri
            .user
            .as_ref()
            .map(|u| format!("{}@", u))
            .unwrap_or_default();
        format!("sip:{}{}", user, self.sent_by)
    }
}

fn parse_target(target: &str) -> Result<SipUri, UaError> {
    SipUri::parse(target)
        .ok_or_else(|| UaError::ProtocolViolation(SmolStr::new("invalid target URI")))
}
