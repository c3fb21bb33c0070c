use std::fmt;

use smol_str::SmolStr;

/// SIP request methods understood by the stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Message,
    Unknown(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token, returning `Unknown` for extension methods.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("INVITE") {
            Method::Invite
        } else if token.eq_ignore_ascii_case("ACK") {
            Method::Ack
        } else if token.eq_ignore_ascii_case("BYE") {
            Method::Bye
        } else if token.eq_ignore_ascii_case("CANCEL") {
            Method::Cancel
        } else if token.eq_ignore_ascii_case("REGISTER") {
            Method::Register
        } else if token.eq_ignore_ascii_case("OPTIONS") {
            Method::Options
        } else if token.eq_ignore_ascii_case("INFO") {
            Method::Info
        } else if token.eq_ignore_ascii_case("MESSAGE") {
            Method::Message
        } else {
            Method::Unknown(SmolStr::new(token.to_ascii_uppercase()))
        }
    }

    /// Returns true for INVITE (the only method with its own transaction FSMs).
    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }

    /// Returns true for ACK and CANCEL, which never consume a dialog CSeq.
    pub fn reuses_dialog_cseq(&self) -> bool {
        matches!(self, Method::Ack | Method::Cancel)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods_case_insensitively() {
        assert_eq!(Method::from_token("invite"), Method::Invite);
        assert_eq!(Method::from_token("ACK"), Method::Ack);
        assert_eq!(Method::from_token("Bye"), Method::Bye);
        assert_eq!(Method::from_token("REGISTER"), Method::Register);
    }

    #[test]
    fn extension_methods_round_trip_uppercased() {
        let m = Method::from_token("subscribe");
        assert_eq!(m, Method::Unknown(SmolStr::new("SUBSCRIBE")));
        assert_eq!(m.as_str(), "SUBSCRIBE");
    }

    #[test]
    fn ack_and_cancel_reuse_dialog_cseq() {
        assert!(Method::Ack.reuses_dialog_cseq());
        assert!(Method::Cancel.reuses_dialog_cseq());
        assert!(!Method::Bye.reuses_dialog_cseq());
    }
}
