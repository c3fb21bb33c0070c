use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

use crate::uri::SipUri;

/// Generic name-addr value shared by From, To, Contact, Route and
/// Record-Route headers: `["display"] <uri>(;param[=value])*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl NameAddr {
    /// Wraps a bare URI with no display name or parameters.
    pub fn from_uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: BTreeMap::new(),
        }
    }

    /// Parses a name-addr or addr-spec header value.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();

        let (display_name, rest) = if let Some(stripped) = value.strip_prefix('"') {
            let end = find_quote_end(stripped)?;
            let display = unescape_quoted(&stripped[..end]);
            (Some(SmolStr::new(display)), stripped[end + 1..].trim_start())
        } else if let Some(angle) = value.find('<') {
            let display = value[..angle].trim();
            let display = if display.is_empty() {
                None
            } else {
                Some(SmolStr::new(display))
            };
            (display, &value[angle..])
        } else {
            (None, value)
        };

        let (uri_text, params_text) = if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped.find('>')?;
            (&stripped[..end], stripped[end + 1..].trim_start())
        } else {
            // addr-spec form: header parameters start at the first semicolon.
            match rest.split_once(';') {
                Some((uri, params)) => (uri, params),
                None => (rest, ""),
            }
        };

        let uri = SipUri::parse(uri_text.trim())?;

        let mut params = BTreeMap::new();
        for segment in params_text.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => {
                    params.insert(
                        SmolStr::new(name.trim().to_ascii_lowercase()),
                        Some(SmolStr::new(value.trim().trim_matches('"'))),
                    );
                }
                None => {
                    params.insert(SmolStr::new(segment.to_ascii_lowercase()), None);
                }
            }
        }

        Some(Self {
            display_name,
            uri,
            params,
        })
    }

    /// Returns a named header parameter.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }

    /// Returns the `tag` parameter carried by From/To values.
    pub fn tag(&self) -> Option<&SmolStr> {
        self.param("tag").and_then(|v| v.as_ref())
    }

    /// Sets the `tag` parameter.
    pub fn set_tag(&mut self, tag: &str) {
        self.params
            .insert(SmolStr::new("tag"), Some(SmolStr::new(tag)));
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display_name {
            if display.chars().all(is_display_token_char) {
                write!(f, "{} ", display)?;
            } else {
                write!(f, "\"{}\" ", escape_quoted(display))?;
            }
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) if needs_quoting(v) => write!(f, ";{}=\"{}\"", name, v)?,
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

fn find_quote_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn is_display_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | ' ')
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| matches!(c, ';' | ',' | '?' | '=' | ' ' | '\t' | '<' | '>'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_addr_spec() {
        let addr = NameAddr::parse("sip:alice@example.com;tag=1928301774").unwrap();
        assert_eq!(addr.display_name, None);
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(addr.tag().map(|t| t.as_str()), Some("1928301774"));
    }

    #[test]
    fn parses_angle_bracket_form() {
        let addr = NameAddr::parse("<sip:bob@example.com;lr>;tag=abc").unwrap();
        // The lr parameter belongs to the URI, the tag to the header.
        assert!(addr.uri.param("lr").is_some());
        assert_eq!(addr.tag().map(|t| t.as_str()), Some("abc"));
    }

    #[test]
    fn parses_quoted_display_name() {
        let addr = NameAddr::parse("\"Alice <Admin>\" <sip:alice@example.com>").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice <Admin>"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
    }

    #[test]
    fn parses_unquoted_display_name() {
        let addr = NameAddr::parse("Alice <sip:alice@example.com>").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn set_tag_then_display() {
        let mut addr = NameAddr::from_uri(SipUri::parse("sip:alice@example.com").unwrap());
        addr.set_tag("77f31a2c");
        assert_eq!(addr.to_string(), "<sip:alice@example.com>;tag=77f31a2c");
    }

    #[test]
    fn display_quotes_separator_values() {
        let mut addr = NameAddr::from_uri(SipUri::parse("sip:a@b.c").unwrap());
        addr.params
            .insert(SmolStr::new("note"), Some(SmolStr::new("x;y")));
        assert!(addr.to_string().contains("note=\"x;y\""));
    }

    #[test]
    fn display_round_trips() {
        let addr = NameAddr::parse("\"Bob\" <sips:bob@biloxi.example.com>;tag=a6c85cf").unwrap();
        let reparsed = NameAddr::parse(&addr.to_string()).unwrap();
        assert_eq!(addr, reparsed);
    }
}
