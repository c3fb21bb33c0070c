use std::fmt;

use smol_str::SmolStr;
use tinysip_parse::ParseError;

/// Errors surfaced to users of the facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UaError {
    /// Inbound bytes did not parse as a SIP message.
    Parse(ParseError),
    /// The transport under a transaction went away.
    TransportLost,
    /// Timer B or F fired before a final response arrived.
    Timeout,
    /// A challenge arrived for a realm with no registered credential.
    AuthRequired(SmolStr),
    /// The peer challenged the retried request again with the same nonce.
    AuthFailed,
    /// The challenge is not Digest/MD5.
    UnsupportedChallenge,
    /// The referenced dialog does not exist (any more).
    DialogGone,
    /// A message violated protocol expectations (missing mandatory
    /// header, CSeq mismatch, Via mismatch in a response).
    ProtocolViolation(SmolStr),
}

impl fmt::Display for UaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UaError::Parse(err) => write!(f, "parse error: {}", err),
            UaError::TransportLost => f.write_str("transport lost"),
            UaError::Timeout => f.write_str("transaction timed out"),
            UaError::AuthRequired(realm) => {
                write!(f, "authentication required for realm {:?}", realm)
            }
            UaError::AuthFailed => f.write_str("authentication failed"),
            UaError::UnsupportedChallenge => f.write_str("unsupported challenge"),
            UaError::DialogGone => f.write_str("dialog gone"),
            UaError::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
        }
    }
}

impl std::error::Error for UaError {}

impl From<ParseError> for UaError {
    fn from(err: ParseError) -> Self {
        UaError::Parse(err)
    }
}

impl From<tinysip_auth::AuthError> for UaError {
    fn from(err: tinysip_auth::AuthError) -> Self {
        match err {
            tinysip_auth::AuthError::NoCredential(realm) => UaError::AuthRequired(realm),
            tinysip_auth::AuthError::UnsupportedChallenge
            | tinysip_auth::AuthError::MalformedChallenge => UaError::UnsupportedChallenge,
        }
    }
}
