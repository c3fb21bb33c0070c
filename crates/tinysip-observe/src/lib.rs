// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Passive observation of signalling flows.
//!
//! The dispatcher reports every message it sends or receives to a
//! [`FlowSink`]. The bundled [`FlowTracker`] appends
//! (timestamp, direction, peer, method/status, dialog-id, transaction-id)
//! records to an in-memory log for external rendering; it never blocks the
//! transaction layer and never mutates messages. [`TracingFlowSink`]
//! mirrors the records onto `tracing` instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use parking_lot::Mutex;
use smol_str::SmolStr;
use tinysip_core::{NameAddr, SipMessage};
use tinysip_parse::top_via;

/// Whether the user agent sent or received the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Outbound,
    Inbound,
}

/// One observed signalling event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub at: SystemTime,
    pub direction: FlowDirection,
    pub peer: SocketAddr,
    /// Method token for requests, "code reason" for responses.
    pub label: SmolStr,
    /// Set when both dialog tags are known.
    pub dialog_id: Option<SmolStr>,
    /// Top Via branch, when present.
    pub transaction_id: Option<SmolStr>,
}

impl FlowRecord {
    fn build(direction: FlowDirection, message: &SipMessage, peer: SocketAddr) -> Self {
        let label = match message {
            SipMessage::Request(req) => SmolStr::new(req.method().as_str()),
            SipMessage::Response(res) => {
                SmolStr::new(format!("{} {}", res.start.code, res.start.reason))
            }
        };
        Self {
            at: SystemTime::now(),
            direction,
            peer,
            label,
            dialog_id: dialog_id_of(message),
            transaction_id: top_via(message.headers())
                .and_then(|via| via.branch().cloned()),
        }
    }
}

/// Derives "call-id/from-tag/to-tag" once both tags exist.
fn dialog_id_of(message: &SipMessage) -> Option<SmolStr> {
    let headers = message.headers();
    let call_id = headers.get("Call-ID")?;
    let from_tag = NameAddr::parse(headers.get("From")?)?.tag()?.clone();
    let to_tag = NameAddr::parse(headers.get("To")?)?.tag()?.clone();
    Some(SmolStr::new(format!("{}/{}/{}", call_id, from_tag, to_tag)))
}

/// Receives one callback per message crossing the transport boundary.
pub trait FlowSink: Send + Sync {
    fn on_send(&self, message: &SipMessage, peer: SocketAddr);
    fn on_recv(&self, message: &SipMessage, peer: SocketAddr);
}

/// Aggregate counters over a tracker's records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub sent: usize,
    pub received: usize,
    pub by_label: HashMap<SmolStr, usize>,
}

/// Append-only recorder of signalling events.
#[derive(Debug, Default)]
pub struct FlowTracker {
    records: Mutex<Vec<FlowRecord>>,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record so far, in arrival order.
    pub fn records(&self) -> Vec<FlowRecord> {
        self.records.lock().clone()
    }

    /// Records belonging to one dialog, in arrival order.
    pub fn records_for_dialog(&self, dialog_id: &str) -> Vec<FlowRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.dialog_id.as_deref() == Some(dialog_id))
            .cloned()
            .collect()
    }

    /// Records correlated by transaction id (top Via branch).
    pub fn records_for_transaction(&self, branch: &str) -> Vec<FlowRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.transaction_id.as_deref() == Some(branch))
            .cloned()
            .collect()
    }

    /// Aggregate counts for external rendering.
    pub fn stats(&self) -> FlowStats {
        let records = self.records.lock();
        let mut stats = FlowStats::default();
        for record in records.iter() {
            match record.direction {
                FlowDirection::Outbound => stats.sent += 1,
                FlowDirection::Inbound => stats.received += 1,
            }
            let method = record
                .label
                .split_whitespace()
                .next()
                .unwrap_or_default();
            *stats.by_label.entry(SmolStr::new(method)).or_insert(0) += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl FlowSink for FlowTracker {
    fn on_send(&self, message: &SipMessage, peer: SocketAddr) {
        self.records
            .lock()
            .push(FlowRecord::build(FlowDirection::Outbound, message, peer));
    }

    fn on_recv(&self, message: &SipMessage, peer: SocketAddr) {
        self.records
            .lock()
            .push(FlowRecord::build(FlowDirection::Inbound, message, peer));
    }
}

/// Sink that logs records via `tracing` instead of retaining them.
#[derive(Debug, Default)]
pub struct TracingFlowSink;

impl FlowSink for TracingFlowSink {
    fn on_send(&self, message: &SipMessage, peer: SocketAddr) {
        let record = FlowRecord::build(FlowDirection::Outbound, message, peer);
        tracing::debug!(%peer, label = %record.label, dialog = ?record.dialog_id, "sent");
    }

    fn on_recv(&self, message: &SipMessage, peer: SocketAddr) {
        let record = FlowRecord::build(FlowDirection::Inbound, message, peer);
        tracing::debug!(%peer, label = %record.label, dialog = ?record.dialog_id, "received");
    }
}
