// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parser and serializer.
//!
//! Parsing accepts compact header forms and folded continuation lines and
//! reports failures as [`ParseError`] carrying the byte offset of the
//! offending input. Serialization emits canonical RFC 3261 §20 header
//! casing, keeps `Via` lines on top, recomputes `Content-Length` last, and
//! never emits compact forms.
//!
//! # Example
//! ```
//! use tinysip_parse::{parse_request, emit_request};
//! use bytes::Bytes;
//! # let raw = b"OPTIONS sip:demo.example SIP/2.0\r\nVia: SIP/2.0/UDP client.example.com;branch=z9hG4bK74bf9\r\nMax-Forwards: 70\r\nTo: <sip:demo.example>\r\nFrom: <sip:alice@client.example.com>;tag=9fxced76sl\r\nCall-ID: 3848276298220188511@client.example.com\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let request = parse_request(&Bytes::from_static(raw)).unwrap();
//! let bytes = emit_request(&request);
//! ```

use bytes::{Bytes, BytesMut};
use smol_str::SmolStr;
use std::fmt;
use tinysip_core::{
    CSeq, Headers, Method, Request, RequestLine, Response, SipMessage, SipUri, StatusLine,
    msg::SIP_VERSION,
};

mod header_values;

pub use header_values::{
    expires_value, parse_contact_header, parse_cseq_header, parse_from_header, parse_to_header,
    parse_via_header, route_set, top_via,
};

/// Largest datagram the parser will look at.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// What went wrong while parsing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The start-line is not a valid request-line or status-line.
    StartLine,
    /// A header line has no colon or continues nothing.
    HeaderLine,
    /// A header required by the core is absent.
    MissingHeader(&'static str),
    /// A header that must appear exactly once appears again.
    DuplicateHeader(&'static str),
    /// The CSeq method disagrees with the request method.
    CSeqMismatch,
    /// Content-Length is unparsable or disagrees with the body.
    ContentLength,
    /// Fewer body bytes than Content-Length declared.
    TruncatedBody,
    /// The head of the message is not valid UTF-8.
    Encoding,
    /// The message exceeds [`MAX_MESSAGE_SIZE`].
    TooLarge,
}

/// Parse failure with the byte offset of the offending input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

impl ParseError {
    fn new(kind: ParseErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match &self.kind {
            ParseErrorKind::StartLine => "malformed start-line".to_string(),
            ParseErrorKind::HeaderLine => "malformed header line".to_string(),
            ParseErrorKind::MissingHeader(name) => format!("missing {} header", name),
            ParseErrorKind::DuplicateHeader(name) => format!("duplicate {} header", name),
            ParseErrorKind::CSeqMismatch => "CSeq method does not match request".to_string(),
            ParseErrorKind::ContentLength => "Content-Length disagreement".to_string(),
            ParseErrorKind::TruncatedBody => "body shorter than Content-Length".to_string(),
            ParseErrorKind::Encoding => "message head is not UTF-8".to_string(),
            ParseErrorKind::TooLarge => "message exceeds size limit".to_string(),
        };
        write!(f, "{} at byte {}", what, self.offset)
    }
}

impl std::error::Error for ParseError {}

/// Parses a request or response from raw network bytes.
pub fn parse_message(datagram: &Bytes) -> Result<SipMessage, ParseError> {
    if starts_with_version(datagram) {
        parse_response(datagram).map(SipMessage::Response)
    } else {
        parse_request(datagram).map(SipMessage::Request)
    }
}

/// Parses a SIP request from raw network bytes.
pub fn parse_request(datagram: &Bytes) -> Result<Request, ParseError> {
    let (first, headers, body) = split_message(datagram)?;

    let (method, uri) = parse_request_line(first)
        .ok_or_else(|| ParseError::new(ParseErrorKind::StartLine, 0))?;

    check_mandatory(&headers, true, datagram.len())?;
    let cseq = headers.get("CSeq").expect("checked above");
    match CSeq::parse(cseq) {
        Some(cseq) if cseq.method == method => {}
        _ => return Err(ParseError::new(ParseErrorKind::CSeqMismatch, 0)),
    }

    Ok(Request::new(RequestLine::new(method, uri), headers, body))
}

/// Parses a SIP response from raw network bytes.
pub fn parse_response(datagram: &Bytes) -> Result<Response, ParseError> {
    let (first, headers, body) = split_message(datagram)?;

    let status = parse_status_line(first)
        .ok_or_else(|| ParseError::new(ParseErrorKind::StartLine, 0))?;

    check_mandatory(&headers, false, datagram.len())?;

    Ok(Response::new(status, headers, body))
}

/// Serializes a request, recomputing `Content-Length`.
pub fn emit_request(req: &Request) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(buf, "{} {} {}\r\n", req.method(), req.uri(), SIP_VERSION);

    let mut has_max_forwards = false;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
    }
    write_headers(&mut buf, &req.headers);
    if !has_max_forwards {
        buf.push_str("Max-Forwards: 70\r\n");
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", req.body.len());

    assemble(buf, &req.body)
}

/// Serializes a response, recomputing `Content-Length`.
pub fn emit_response(res: &Response) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(buf, "{} {} {}\r\n", SIP_VERSION, res.start.code, res.start.reason);
    write_headers(&mut buf, &res.headers);
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", res.body.len());

    assemble(buf, &res.body)
}

/// Serializes either message kind.
pub fn emit_message(msg: &SipMessage) -> Bytes {
    match msg {
        SipMessage::Request(req) => emit_request(req),
        SipMessage::Response(res) => emit_response(res),
    }
}

/// Via lines first, everything else in insertion order, Content-Length
/// handled by the caller.
fn write_headers(buf: &mut String, headers: &Headers) {
    use std::fmt::Write;
    for header in headers.iter() {
        if header.name.eq_ignore_ascii_case("Via") {
            let _ = write!(buf, "Via: {}\r\n", header.value.trim());
        }
    }
    for header in headers.iter() {
        if header.name.eq_ignore_ascii_case("Via")
            || header.name.eq_ignore_ascii_case("Content-Length")
        {
            continue;
        }
        let name = canonical_header_name(&header.name);
        let _ = write!(buf, "{}: {}\r\n", name, header.value.trim());
    }
}

fn assemble(head: String, body: &Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body.as_ref());
    out.freeze()
}

fn starts_with_version(datagram: &Bytes) -> bool {
    datagram.len() >= SIP_VERSION.len()
        && datagram[..SIP_VERSION.len()].eq_ignore_ascii_case(SIP_VERSION.as_bytes())
}

/// Splits the buffer into start-line, headers and body, applying the
/// continuation-line rule and resolving compact header names.
fn split_message(datagram: &Bytes) -> Result<(&str, Headers, Bytes), ParseError> {
    if datagram.len() > MAX_MESSAGE_SIZE {
        return Err(ParseError::new(ParseErrorKind::TooLarge, MAX_MESSAGE_SIZE));
    }

    let data = datagram.as_ref();
    let delim = b"\r\n\r\n";
    let (head_end, body_start) = match data.windows(delim.len()).position(|w| w == delim) {
        Some(pos) => (pos, pos + delim.len()),
        None => (data.len(), data.len()),
    };

    let head = std::str::from_utf8(&data[..head_end])
        .map_err(|e| ParseError::new(ParseErrorKind::Encoding, e.valid_up_to()))?;
    let body_bytes = &data[body_start..];

    let mut lines = head.split("\r\n");
    let first = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| ParseError::new(ParseErrorKind::StartLine, 0))?;

    let mut headers = Headers::new();
    let mut offset = first.len() + 2;
    for line in lines {
        let line_start = offset;
        offset += line.len() + 2;
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous header value.
            match headers.iter_mut().last() {
                Some(prev) => {
                    let mut joined = prev.value.to_string();
                    joined.push(' ');
                    joined.push_str(line.trim());
                    prev.value = SmolStr::new(joined);
                }
                None => return Err(ParseError::new(ParseErrorKind::HeaderLine, line_start)),
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::new(ParseErrorKind::HeaderLine, line_start))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::new(ParseErrorKind::HeaderLine, line_start));
        }
        headers.push(canonical_header_name(name), value.trim());
    }

    let body = extract_body(body_bytes, &headers, body_start)?;
    Ok((first, headers, body))
}

fn extract_body(
    body_bytes: &[u8],
    headers: &Headers,
    body_offset: usize,
) -> Result<Bytes, ParseError> {
    let mut declared: Option<usize> = None;
    for value in headers.get_all("Content-Length") {
        let parsed: usize = value
            .trim()
            .parse()
            .map_err(|_| ParseError::new(ParseErrorKind::ContentLength, body_offset))?;
        match declared {
            Some(existing) if existing != parsed => {
                return Err(ParseError::new(ParseErrorKind::ContentLength, body_offset));
            }
            _ => declared = Some(parsed),
        }
    }

    match declared {
        Some(declared) => {
            if declared > body_bytes.len() {
                return Err(ParseError::new(ParseErrorKind::TruncatedBody, body_offset));
            }
            if declared < body_bytes.len() {
                return Err(ParseError::new(ParseErrorKind::ContentLength, body_offset));
            }
            Ok(Bytes::copy_from_slice(body_bytes))
        }
        None if body_bytes.is_empty() => Ok(Bytes::new()),
        None => Err(ParseError::new(
            ParseErrorKind::MissingHeader("Content-Length"),
            body_offset,
        )),
    }
}

fn check_mandatory(headers: &Headers, is_request: bool, len: usize) -> Result<(), ParseError> {
    const SINGLETONS: [&str; 4] = ["From", "To", "Call-ID", "CSeq"];
    for name in SINGLETONS {
        match headers.count(name) {
            0 => return Err(ParseError::new(ParseErrorKind::MissingHeader(name), len)),
            1 => {}
            _ => return Err(ParseError::new(ParseErrorKind::DuplicateHeader(name), len)),
        }
    }
    if headers.count("Via") == 0 {
        return Err(ParseError::new(ParseErrorKind::MissingHeader("Via"), len));
    }
    if is_request && headers.count("Max-Forwards") > 1 {
        return Err(ParseError::new(
            ParseErrorKind::DuplicateHeader("Max-Forwards"),
            len,
        ));
    }
    Ok(())
}

/// Parses the request-line into a method and request URI.
fn parse_request_line(line: &str) -> Option<(Method, SipUri)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim()).ok()?;

    if !version_token.eq_ignore_ascii_case(SIP_VERSION) {
        return None;
    }
    let method = Method::from_token(method_token);
    let uri = SipUri::parse(uri_token)?;
    Some((method, uri))
}

/// Parses the status-line of a SIP response.
fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>(SIP_VERSION),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line.trim()).ok()?;

    if !(100..=699).contains(&code) {
        return None;
    }
    Some(StatusLine::new(code, reason.trim()))
}

/// Resolves compact forms and normalizes known names to RFC 3261 §20 casing.
pub fn canonical_header_name(name: &str) -> SmolStr {
    let lower = name.to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "i" | "call-id" => "Call-ID",
        "m" | "contact" => "Contact",
        "f" | "from" => "From",
        "t" | "to" => "To",
        "v" | "via" => "Via",
        "l" | "content-length" => "Content-Length",
        "c" | "content-type" => "Content-Type",
        "s" | "subject" => "Subject",
        "k" | "supported" => "Supported",
        "cseq" => "CSeq",
        "max-forwards" => "Max-Forwards",
        "route" => "Route",
        "record-route" => "Record-Route",
        "expires" => "Expires",
        "allow" => "Allow",
        "user-agent" => "User-Agent",
        "www-authenticate" => "WWW-Authenticate",
        "authorization" => "Authorization",
        "proxy-authenticate" => "Proxy-Authenticate",
        "proxy-authorization" => "Proxy-Authorization",
        _ => name,
    };
    SmolStr::new(canonical)
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}
