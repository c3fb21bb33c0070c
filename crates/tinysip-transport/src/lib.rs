// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Byte-oriented SIP transports.
//!
//! A [`Transport`] sends serialized messages to a peer and reports whether
//! it is reliable; inbound traffic arrives as [`InboundPacket`]s on an mpsc
//! channel owned by the dispatcher. One transport instance exists per
//! (local address, protocol) tuple. UDP forwards datagrams as-is; TCP
//! splits the stream on `\r\n\r\n` plus `Content-Length` bytes of body.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest datagram we will read in one UDP receive.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Largest head (start-line + headers) tolerated on a stream before the
/// peer is dropped.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest stream body accepted via Content-Length.
const MAX_STREAM_BODY: usize = 1024 * 1024;

/// Which protocol carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    /// Lowercase token for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }

    /// The transport token used in Via headers.
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Tcp)
    }
}

/// One inbound message plus its origin.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub bytes: Bytes,
    pub peer: SocketAddr,
    pub transport: TransportKind,
}

/// Contract the user agent consumes: send bytes to a peer, know the local
/// address, know whether delivery is reliable.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: Bytes, peer: SocketAddr) -> Result<()>;
    fn local_addr(&self) -> SocketAddr;
    fn kind(&self) -> TransportKind;
    fn reliable(&self) -> bool {
        self.kind().is_reliable()
    }
}

/// Datagram transport over one bound UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    /// Binds the socket. Receiving starts with [`UdpTransport::spawn_receiver`].
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP socket on {}", addr))?;
        let local = socket.local_addr()?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local,
        }))
    }

    /// Spawns the receive loop feeding `packets`. The loop ends when the
    /// channel closes.
    pub fn spawn_receiver(&self, packets: mpsc::Sender<InboundPacket>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        let packet = InboundPacket {
                            bytes: Bytes::copy_from_slice(&buf[..len]),
                            peer,
                            transport: TransportKind::Udp,
                        };
                        if packets.send(packet).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "udp receive failed");
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, payload: Bytes, peer: SocketAddr) -> Result<()> {
        self.socket
            .send_to(payload.as_ref(), peer)
            .await
            .with_context(|| format!("sending datagram to {}", peer))?;
        debug!(%peer, len = payload.len(), "udp datagram sent");
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }
}

/// Stream transport over one established TCP connection.
pub struct TcpTransport {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connects to `peer` and spawns the framing reader feeding `packets`.
    pub async fn connect(
        peer: SocketAddr,
        packets: mpsc::Sender<InboundPacket>,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(peer)
            .await
            .with_context(|| format!("connecting to {}", peer))?;
        let local = stream.local_addr()?;
        let (mut reader, writer) = stream.into_split();

        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8 * 1024);
            loop {
                match reader.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!(%peer, "tcp peer closed");
                        return;
                    }
                    Ok(_) => loop {
                        match extract_frame(&mut buf) {
                            Ok(Some(frame)) => {
                                let packet = InboundPacket {
                                    bytes: frame,
                                    peer,
                                    transport: TransportKind::Tcp,
                                };
                                if packets.send(packet).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(%peer, error = %err, "dropping tcp peer");
                                return;
                            }
                        }
                    },
                    Err(err) => {
                        warn!(%peer, error = %err, "tcp read failed");
                        return;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            local,
            peer,
        }))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: Bytes, _peer: SocketAddr) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(payload.as_ref())
            .await
            .with_context(|| format!("writing to {}", self.peer))?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

/// Splits one complete SIP message off the front of `buf`, if present.
///
/// A frame is complete when the head terminator has arrived plus as many
/// body bytes as the head's Content-Length declares. A missing
/// Content-Length on a stream means no body.
pub fn extract_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    let delim = b"\r\n\r\n";
    let head_end = match buf.windows(delim.len()).position(|w| w == delim) {
        Some(pos) => pos,
        None => {
            if buf.len() > MAX_HEAD_SIZE {
                anyhow::bail!("message head exceeds {} bytes", MAX_HEAD_SIZE);
            }
            return Ok(None);
        }
    };

    let body_len = content_length_of(&buf[..head_end])?;
    if body_len > MAX_STREAM_BODY {
        anyhow::bail!("declared body of {} bytes exceeds limit", body_len);
    }

    let total = head_end + delim.len() + body_len;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total).freeze()))
}

/// Scans the head for a Content-Length (or compact `l`) header value.
fn content_length_of(head: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(head).context("message head is not UTF-8")?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                return value
                    .trim()
                    .parse()
                    .context("unparsable Content-Length on stream");
            }
        }
    }
    Ok(0)
}
