// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tinysip_parse::{emit_message, parse_message};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let bytes = Bytes::copy_from_slice(data);
    // Parse must never panic; anything it accepts must re-emit and
    // re-parse cleanly.
    if let Ok(message) = parse_message(&bytes) {
        let emitted = emit_message(&message);
        let _ = parse_message(&emitted);
    }
});
