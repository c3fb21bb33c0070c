// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Via header value (RFC 3261 §20.42).
//!
//! Each Via hop records the transport, the sent-by address, and the branch
//! identifying the transaction. The response path may annotate the hop with
//! `received` and `rport`.

use std::fmt;

use smol_str::SmolStr;

use crate::msg::SIP_VERSION;

/// One parsed Via hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token as sent (UDP, TCP, ...).
    pub transport: SmolStr,
    /// host or host:port the request was sent from.
    pub sent_by: SmolStr,
    /// Parameters in original order; `branch` is the transaction key.
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl Via {
    /// Builds a Via hop with a branch parameter.
    pub fn new(transport: impl Into<SmolStr>, sent_by: impl Into<SmolStr>, branch: &str) -> Self {
        Self {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params: vec![(SmolStr::new("branch"), Some(SmolStr::new(branch)))],
        }
    }

    /// Parses a Via header value: `SIP/2.0/TRANSPORT sent-by(;param[=value])*`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().splitn(2, char::is_whitespace);
        let proto = parts.next()?;
        let rest = parts.next()?.trim_start();

        let mut proto_parts = proto.split('/');
        let name = proto_parts.next()?;
        let version = proto_parts.next()?;
        if !format!("{}/{}", name, version).eq_ignore_ascii_case(SIP_VERSION) {
            return None;
        }
        let transport = proto_parts.next()?;
        if transport.is_empty() {
            return None;
        }

        let mut segments = rest.split(';');
        let sent_by = segments.next()?.trim();
        if sent_by.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => params.push((
                    SmolStr::new(name.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(value.trim())),
                )),
                None => params.push((SmolStr::new(segment.to_ascii_lowercase()), None)),
            }
        }

        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            sent_by: SmolStr::new(sent_by),
            params,
        })
    }

    /// Returns a named parameter value.
    pub fn param(&self, name: &str) -> Option<&SmolStr> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_ref())
    }

    /// Returns the branch parameter, if present.
    pub fn branch(&self) -> Option<&SmolStr> {
        self.param("branch")
    }

    /// Returns the `received` annotation, if present.
    pub fn received(&self) -> Option<&SmolStr> {
        self.param("received")
    }

    /// Returns the `rport` annotation, if present with a value.
    pub fn rport(&self) -> Option<u16> {
        self.param("rport").and_then(|v| v.parse().ok())
    }

    /// Replaces (or inserts) the branch parameter.
    pub fn set_branch(&mut self, branch: &str) {
        for (name, value) in self.params.iter_mut() {
            if name.eq_ignore_ascii_case("branch") {
                *value = Some(SmolStr::new(branch));
                return;
            }
        }
        self.params
            .push((SmolStr::new("branch"), Some(SmolStr::new(branch))));
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", SIP_VERSION, self.transport, self.sent_by)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}
