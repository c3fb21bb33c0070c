// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client-side Digest authentication (RFC 3261 §22, MD5 only).
//!
//! Parses `WWW-Authenticate`/`Proxy-Authenticate` challenges, keeps the
//! per-(realm, nonce) nonce count, and computes the `Authorization` /
//! `Proxy-Authorization` header value for a retried request.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;
use std::sync::Arc;

use dashmap::DashMap;
use smol_str::SmolStr;
use tinysip_core::{random_hex, Method, Response};
use tracing::debug;

/// Credentials for one protection realm.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub realm: SmolStr,
    pub username: SmolStr,
    pub password: SmolStr,
}

/// Realm-keyed credential table. At most one credential per realm; adding
/// again replaces. Reads come from the dispatcher, writes from the facade.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    map: Arc<DashMap<SmolStr, Credentials>>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the credential for its realm.
    pub fn add(&self, credentials: Credentials) {
        self.map.insert(credentials.realm.clone(), credentials);
    }

    /// Looks up the credential registered for a realm.
    pub fn lookup(&self, realm: &str) -> Option<Credentials> {
        self.map.get(realm).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Authentication failures surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential registered for the challenged realm.
    NoCredential(SmolStr),
    /// The challenge is not Digest/MD5.
    UnsupportedChallenge,
    /// The 401/407 carries no parseable challenge header.
    MalformedChallenge,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::NoCredential(realm) => write!(f, "no credential for realm {:?}", realm),
            AuthError::UnsupportedChallenge => f.write_str("unsupported challenge scheme"),
            AuthError::MalformedChallenge => f.write_str("malformed challenge header"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Parsed Digest challenge from a 401/407 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: SmolStr,
    pub nonce: SmolStr,
    pub opaque: Option<SmolStr>,
    pub algorithm: SmolStr,
    pub qop_offers: Vec<SmolStr>,
    /// True when the challenge arrived in Proxy-Authenticate (407).
    pub proxy: bool,
}

impl DigestChallenge {
    /// Extracts the challenge from a 401 or 407 response.
    pub fn from_response(response: &Response) -> Result<Self, AuthError> {
        let (header, proxy) = match response.start.code {
            401 => ("WWW-Authenticate", false),
            407 => ("Proxy-Authenticate", true),
            _ => return Err(AuthError::MalformedChallenge),
        };
        let value = response
            .header(header)
            .ok_or(AuthError::MalformedChallenge)?;
        Self::parse(value, proxy)
    }

    /// Parses a `Digest realm="...", nonce="..."` header value.
    pub fn parse(value: &str, proxy: bool) -> Result<Self, AuthError> {
        let value = value.trim();
        let rest = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("Digest") => rest,
            _ => return Err(AuthError::UnsupportedChallenge),
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = SmolStr::new("MD5");
        let mut qop_offers = Vec::new();

        for (name, value) in split_challenge_params(rest) {
            match name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(SmolStr::new(value)),
                "nonce" => nonce = Some(SmolStr::new(value)),
                "opaque" => opaque = Some(SmolStr::new(value)),
                "algorithm" => algorithm = SmolStr::new(value.to_ascii_uppercase()),
                "qop" => {
                    qop_offers = value
                        .split(',')
                        .map(|q| SmolStr::new(q.trim().to_ascii_lowercase()))
                        .collect();
                }
                _ => {}
            }
        }

        if algorithm.as_str() != "MD5" {
            return Err(AuthError::UnsupportedChallenge);
        }

        Ok(Self {
            realm: realm.ok_or(AuthError::MalformedChallenge)?,
            nonce: nonce.ok_or(AuthError::MalformedChallenge)?,
            opaque,
            algorithm,
            qop_offers,
            proxy,
        })
    }

    /// Returns `auth` when offered; legacy (no qop) otherwise. `auth-int`
    /// alone is treated as unsupported elsewhere, since bodies are opaque.
    pub fn selected_qop(&self) -> Option<&str> {
        self.qop_offers
            .iter()
            .find(|q| q.as_str() == "auth")
            .map(|q| q.as_str())
    }

    /// Name of the header the answer must be carried in.
    pub fn answer_header(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }
}

/// Computes Digest answers and tracks nonce counts per (realm, nonce).
#[derive(Debug, Default)]
pub struct DigestAuthenticator {
    credentials: CredentialSet,
    nonce_counts: HashMap<(SmolStr, SmolStr), u32>,
}

impl DigestAuthenticator {
    pub fn new(credentials: CredentialSet) -> Self {
        Self {
            credentials,
            nonce_counts: HashMap::new(),
        }
    }

    /// Returns the shared credential table.
    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    /// Builds the Authorization/Proxy-Authorization header value answering
    /// `challenge` for a retried request on `uri`.
    ///
    /// The URI must be the request-URI of the retried request, verbatim.
    pub fn answer(
        &mut self,
        challenge: &DigestChallenge,
        method: &Method,
        uri: &str,
    ) -> Result<SmolStr, AuthError> {
        let creds = self
            .credentials
            .lookup(&challenge.realm)
            .ok_or_else(|| AuthError::NoCredential(challenge.realm.clone()))?;

        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            creds.username, challenge.realm, creds.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));

        let mut value = String::new();
        let _ = write!(
            value,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            creds.username, challenge.realm, challenge.nonce, uri
        );

        let response = match challenge.selected_qop() {
            Some(qop) => {
                let nc = self.next_nonce_count(&challenge.realm, &challenge.nonce);
                let cnonce = random_hex(8);
                let digest = md5_hex(&format!(
                    "{}:{}:{:08x}:{}:{}:{}",
                    ha1, challenge.nonce, nc, cnonce, qop, ha2
                ));
                let _ = write!(value, ", response=\"{}\"", digest);
                let _ = write!(value, ", qop={}, nc={:08x}, cnonce=\"{}\"", qop, nc, cnonce);
                digest
            }
            None => {
                let digest = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));
                let _ = write!(value, ", response=\"{}\"", digest);
                digest
            }
        };

        let _ = write!(value, ", algorithm=MD5");
        if let Some(opaque) = &challenge.opaque {
            let _ = write!(value, ", opaque=\"{}\"", opaque);
        }

        debug!(realm = %challenge.realm, uri, response = %response, "computed digest answer");
        Ok(SmolStr::new(value))
    }

    fn next_nonce_count(&mut self, realm: &SmolStr, nonce: &SmolStr) -> u32 {
        let count = self
            .nonce_counts
            .entry((realm.clone(), nonce.clone()))
            .or_insert(0);
        *count += 1;
        *count
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Splits `name="quoted, value", name=token, ...` respecting quotes.
fn split_challenge_params(input: &str) -> Vec<(&str, &str)> {
    let mut params = Vec::new();
    let bytes = input.as_bytes();
    let mut start = 0;
    let mut in_quotes = false;
    let mut segments = Vec::new();

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                segments.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&input[start..]);

    for segment in segments {
        if let Some((name, value)) = segment.split_once('=') {
            params.push((name.trim(), value.trim().trim_matches('"')));
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tinysip_core::{Headers, StatusLine};

    fn challenge_response(code: u16, header: &str, value: &str) -> Response {
        let mut headers = Headers::new();
        headers.push(header, value);
        Response::new(StatusLine::new(code, "x"), headers, Bytes::new())
    }

    fn set_with(realm: &str, user: &str, pass: &str) -> CredentialSet {
        let set = CredentialSet::new();
        set.add(Credentials {
            realm: SmolStr::new(realm),
            username: SmolStr::new(user),
            password: SmolStr::new(pass),
        });
        set
    }

    #[test]
    fn parses_challenge_params() {
        let c = DigestChallenge::parse(
            "Digest realm=\"sip.example.com\", nonce=\"abc123\", opaque=\"xyz\", qop=\"auth,auth-int\"",
            false,
        )
        .unwrap();
        assert_eq!(c.realm.as_str(), "sip.example.com");
        assert_eq!(c.nonce.as_str(), "abc123");
        assert_eq!(c.opaque.as_deref(), Some("xyz"));
        assert_eq!(c.selected_qop(), Some("auth"));
        assert_eq!(c.answer_header(), "Authorization");
    }

    #[test]
    fn challenge_from_407_uses_proxy_headers() {
        let res = challenge_response(
            407,
            "Proxy-Authenticate",
            "Digest realm=\"proxy\", nonce=\"n1\"",
        );
        let c = DigestChallenge::from_response(&res).unwrap();
        assert!(c.proxy);
        assert_eq!(c.answer_header(), "Proxy-Authorization");
    }

    #[test]
    fn rejects_non_digest_scheme() {
        let err = DigestChallenge::parse("Basic realm=\"x\"", false).unwrap_err();
        assert_eq!(err, AuthError::UnsupportedChallenge);
    }

    #[test]
    fn rejects_non_md5_algorithm() {
        let err = DigestChallenge::parse(
            "Digest realm=\"x\", nonce=\"n\", algorithm=SHA-256",
            false,
        )
        .unwrap_err();
        assert_eq!(err, AuthError::UnsupportedChallenge);
    }

    #[test]
    fn realm_with_embedded_comma_survives() {
        let c = DigestChallenge::parse("Digest realm=\"a, b\", nonce=\"n\"", false).unwrap();
        assert_eq!(c.realm.as_str(), "a, b");
    }

    #[test]
    fn legacy_answer_matches_rfc_formula() {
        let mut auth = DigestAuthenticator::new(set_with("x", "user", "pass"));
        let challenge = DigestChallenge::parse("Digest realm=\"x\", nonce=\"abc\"", false).unwrap();

        let value = auth
            .answer(&challenge, &Method::Register, "sip:registrar.example")
            .unwrap();

        let ha1 = md5_hex("user:x:pass");
        let ha2 = md5_hex("REGISTER:sip:registrar.example");
        let expected = md5_hex(&format!("{}:abc:{}", ha1, ha2));
        assert!(value.contains(&format!("response=\"{}\"", expected)));
        assert!(value.contains("username=\"user\""));
        assert!(value.contains("realm=\"x\""));
        assert!(value.contains("uri=\"sip:registrar.example\""));
        assert!(!value.contains("qop="));
    }

    #[test]
    fn qop_answer_carries_nc_and_cnonce() {
        let mut auth = DigestAuthenticator::new(set_with("x", "user", "pass"));
        let challenge =
            DigestChallenge::parse("Digest realm=\"x\", nonce=\"abc\", qop=\"auth\"", false)
                .unwrap();

        let value = auth
            .answer(&challenge, &Method::Invite, "sip:bob@example.com")
            .unwrap();
        assert!(value.contains("qop=auth"));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("cnonce=\""));
    }

    #[test]
    fn nonce_count_increments_per_reuse() {
        let mut auth = DigestAuthenticator::new(set_with("x", "user", "pass"));
        let challenge =
            DigestChallenge::parse("Digest realm=\"x\", nonce=\"abc\", qop=\"auth\"", false)
                .unwrap();

        let first = auth
            .answer(&challenge, &Method::Register, "sip:x")
            .unwrap();
        let second = auth
            .answer(&challenge, &Method::Register, "sip:x")
            .unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn missing_credential_names_the_realm() {
        let mut auth = DigestAuthenticator::new(CredentialSet::new());
        let challenge = DigestChallenge::parse("Digest realm=\"nope\", nonce=\"n\"", false).unwrap();
        let err = auth
            .answer(&challenge, &Method::Register, "sip:x")
            .unwrap_err();
        assert_eq!(err, AuthError::NoCredential(SmolStr::new("nope")));
    }

    #[test]
    fn opaque_is_echoed() {
        let mut auth = DigestAuthenticator::new(set_with("x", "user", "pass"));
        let challenge = DigestChallenge::parse(
            "Digest realm=\"x\", nonce=\"abc\", opaque=\"tok\"",
            false,
        )
        .unwrap();
        let value = auth.answer(&challenge, &Method::Register, "sip:x").unwrap();
        assert!(value.contains("opaque=\"tok\""));
    }

    #[test]
    fn credential_set_replaces_per_realm() {
        let set = set_with("x", "first", "p1");
        set.add(Credentials {
            realm: SmolStr::new("x"),
            username: SmolStr::new("second"),
            password: SmolStr::new("p2"),
        });
        assert_eq!(set.len(), 1);
        assert_eq!(set.lookup("x").unwrap().username.as_str(), "second");
    }
}
