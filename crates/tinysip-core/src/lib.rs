// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types: messages, headers, URIs, and methods.
//!
//! This crate provides the data model the rest of the stack is built on:
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Headers**: the ordered, case-insensitive [`Headers`] container and
//!   typed values ([`Via`], [`NameAddr`], [`CSeq`])
//! - **URIs**: [`SipUri`] (sip/sips)
//! - **Methods**: the [`Method`] enum
//!
//! Header names and values use [`SmolStr`](smol_str::SmolStr); bodies use
//! [`Bytes`](bytes::Bytes).

pub mod cseq;
pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod token;
pub mod uri;
pub mod via;

pub use cseq::CSeq;
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Request, RequestLine, Response, SipMessage, StatusLine};
pub use name_addr::NameAddr;
pub use token::{random_hex, generate_call_id, generate_tag};
pub use uri::SipUri;
pub use via::Via;

/// Magic cookie that prefixes every RFC-3261-compliant branch parameter.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Returns true if the branch carries the RFC 3261 magic cookie.
pub fn is_rfc3261_branch(branch: &str) -> bool {
    branch.starts_with(BRANCH_MAGIC_COOKIE)
}
