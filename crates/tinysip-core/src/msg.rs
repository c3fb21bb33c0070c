// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri};

/// SIP protocol version token. Only SIP/2.0 exists on the wire.
pub const SIP_VERSION: &str = "SIP/2.0";

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self { method, uri }
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason-Phrase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.start.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &SipUri {
        &self.start.uri
    }

    /// Returns the first header matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&SmolStr> {
        self.headers.get(name)
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code
    }

    /// Returns the first header matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&SmolStr> {
        self.headers.get(name)
    }

    /// Returns true for a provisional response (1xx).
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.start.code)
    }

    /// Returns true for a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }

    /// Returns true for any final response (2xx-6xx).
    pub fn is_final(&self) -> bool {
        self.start.code >= 200
    }

    /// Returns true for a 401 or 407 authentication challenge.
    pub fn is_challenge(&self) -> bool {
        self.start.code == 401 || self.start.code == 407
    }
}

/// Either a SIP request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    /// Returns the headers regardless of message kind.
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => &req.headers,
            Self::Response(res) => &res.headers,
        }
    }

    /// Returns the body regardless of message kind.
    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => &req.body,
            Self::Response(res) => &res.body,
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(res: Response) -> Self {
        Self::Response(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        let uri = SipUri::parse("sip:bob@example.com").unwrap();
        Request::new(
            RequestLine::new(Method::Invite, uri),
            Headers::new(),
            Bytes::new(),
        )
    }

    #[test]
    fn request_accessors() {
        let req = sample_request();
        assert_eq!(req.method(), &Method::Invite);
        assert_eq!(req.uri().host.as_str(), "example.com");
    }

    #[test]
    fn response_predicates() {
        let ringing = Response::new(StatusLine::new(180, "Ringing"), Headers::new(), Bytes::new());
        assert!(ringing.is_provisional());
        assert!(!ringing.is_final());

        let ok = Response::new(StatusLine::new(200, "OK"), Headers::new(), Bytes::new());
        assert!(ok.is_success());
        assert!(ok.is_final());

        let unauthorized =
            Response::new(StatusLine::new(401, "Unauthorized"), Headers::new(), Bytes::new());
        assert!(unauthorized.is_challenge());
        assert!(unauthorized.is_final());
    }

    #[test]
    fn message_variant_accessors() {
        let msg = SipMessage::from(sample_request());
        assert!(msg.is_request());
        assert!(msg.as_response().is_none());
        assert!(msg.as_request().is_some());
    }
}
