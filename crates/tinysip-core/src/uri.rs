// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

/// Parsed representation of a SIP or SIPS URI (RFC 3261 §19.1).
///
/// Only the fields the stack routes on are interpreted; anything else is
/// preserved in `params`/`headers` and round-trips intact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
    pub headers: BTreeMap<SmolStr, SmolStr>,
}

impl SipUri {
    /// Constructs a plain `sip:` URI for the given host.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            sips: false,
            user: None,
            host: host.into(),
            port: None,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.trim().split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut params = BTreeMap::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if let Some((k, v)) = param.split_once('=') {
                params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                );
            } else {
                params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
            }
        }

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, host)) => (Some(SmolStr::new(user.trim())), host.trim()),
            None => (None, base),
        };

        if host_port.is_empty() {
            return None;
        }
        let (host, port) = split_host_port(host_port)?;

        let mut headers = BTreeMap::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    headers.insert(SmolStr::new(k.trim()), SmolStr::new(v.trim()));
                }
            }
        }

        Some(Self {
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
            headers,
        })
    }

    /// Returns the scheme token.
    pub fn scheme(&self) -> &'static str {
        if self.sips {
            "sips"
        } else {
            "sip"
        }
    }

    /// Returns the port to use, applying the SIP default of 5060.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }

    /// Returns the host:port authority for addressing purposes.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port_or_default())
    }

    /// Returns a named URI parameter, if present.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        let mut first = true;
        for (name, value) in &self.headers {
            write!(f, "{}{}={}", if first { "?" } else { "&" }, name, value)?;
            first = false;
        }
        Ok(())
    }
}

fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    // Bracketed IPv6 literals keep their colons.
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        return Some((host, port));
    }
    match input.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host, Some(port)))
        }
        None => Some((input, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = SipUri::parse("sip:alice@example.com:5070;transport=udp?subject=hi").unwrap();
        assert!(!uri.sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_str(), "example.com");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(
            uri.param("transport"),
            Some(&Some(SmolStr::new("udp")))
        );
        assert_eq!(uri.headers.get("subject").map(|v| v.as_str()), Some("hi"));
    }

    #[test]
    fn parses_host_only_uri() {
        let uri = SipUri::parse("sip:demo.example").unwrap();
        assert_eq!(uri.user, None);
        assert_eq!(uri.host.as_str(), "demo.example");
        assert_eq!(uri.port_or_default(), 5060);
    }

    #[test]
    fn sips_scheme_detected() {
        let uri = SipUri::parse("sips:bob@secure.example").unwrap();
        assert!(uri.sips);
        assert_eq!(uri.scheme(), "sips");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(SipUri::parse("http://example.com").is_none());
        assert!(SipUri::parse("tel:+15551234567").is_none());
    }

    #[test]
    fn display_round_trips() {
        let text = "sip:alice@example.com:5070;lr;transport=udp";
        let uri = SipUri::parse(text).unwrap();
        let reparsed = SipUri::parse(&uri.to_string()).unwrap();
        assert_eq!(uri, reparsed);
    }

    #[test]
    fn host_is_lowercased() {
        let uri = SipUri::parse("sip:Example.COM").unwrap();
        assert_eq!(uri.host.as_str(), "example.com");
    }

    #[test]
    fn bracketed_ipv6_host() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5080").unwrap();
        assert_eq!(uri.host.as_str(), "2001:db8::1");
        assert_eq!(uri.port, Some(5080));
        assert_eq!(uri.to_string(), "sip:[2001:db8::1]:5080");
    }
}
