//! Structured views over raw header values.
//!
//! Each helper interprets one of the fields the transaction and dialog
//! layers route on. Anything the helpers do not understand is left alone in
//! the raw header set.

use smol_str::SmolStr;
use tinysip_core::{CSeq, Headers, NameAddr, Via};

/// Parses a Via header value.
pub fn parse_via_header(value: &SmolStr) -> Option<Via> {
    Via::parse(value)
}

/// Parses a From header value into a name-addr with its tag.
pub fn parse_from_header(value: &SmolStr) -> Option<NameAddr> {
    NameAddr::parse(value)
}

/// Parses a To header value into a name-addr with its optional tag.
pub fn parse_to_header(value: &SmolStr) -> Option<NameAddr> {
    NameAddr::parse(value)
}

/// Parses a Contact header value.
pub fn parse_contact_header(value: &SmolStr) -> Option<NameAddr> {
    NameAddr::parse(value)
}

/// Parses a CSeq header value.
pub fn parse_cseq_header(value: &SmolStr) -> Option<CSeq> {
    CSeq::parse(value)
}

/// Returns the topmost Via hop of the message, parsed.
pub fn top_via(headers: &Headers) -> Option<Via> {
    headers.get_all("Via").next().and_then(|v| Via::parse(v))
}

/// Collects the named route headers (Route or Record-Route) in received
/// order. Values that fail to parse are skipped.
pub fn route_set(headers: &Headers, name: &str) -> Vec<NameAddr> {
    headers
        .get_all(name)
        .flat_map(|value| value.split(','))
        .filter_map(|segment| NameAddr::parse(segment.trim()))
        .collect()
}

/// Parses an Expires header value.
pub fn expires_value(headers: &Headers) -> Option<u32> {
    headers.get("Expires").and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinysip_core::Method;

    #[test]
    fn top_via_takes_first_hop() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP first.example.com;branch=z9hG4bKaaa");
        headers.push("Via", "SIP/2.0/TCP second.example.com;branch=z9hG4bKbbb");
        let via = top_via(&headers).unwrap();
        assert_eq!(via.sent_by.as_str(), "first.example.com");
        assert_eq!(via.branch().map(|b| b.as_str()), Some("z9hG4bKaaa"));
    }

    #[test]
    fn route_set_preserves_order_and_splits_commas() {
        let mut headers = Headers::new();
        headers.push("Record-Route", "<sip:p1.example.com;lr>, <sip:p2.example.com;lr>");
        headers.push("Record-Route", "<sip:p3.example.com;lr>");
        let routes = route_set(&headers, "Record-Route");
        let hosts: Vec<&str> = routes.iter().map(|r| r.uri.host.as_str()).collect();
        assert_eq!(hosts, vec!["p1.example.com", "p2.example.com", "p3.example.com"]);
    }

    #[test]
    fn from_and_cseq_helpers() {
        let from = parse_from_header(&SmolStr::new("<sip:alice@example.com>;tag=88sja8x")).unwrap();
        assert_eq!(from.tag().map(|t| t.as_str()), Some("88sja8x"));

        let cseq = parse_cseq_header(&SmolStr::new("2 BYE")).unwrap();
        assert_eq!(cseq.seq, 2);
        assert_eq!(cseq.method, Method::Bye);
    }

    #[test]
    fn expires_parses_number() {
        let mut headers = Headers::new();
        headers.push("Expires", "3600");
        assert_eq!(expires_value(&headers), Some(3600));
    }
}
