use std::net::SocketAddr;

use smol_str::SmolStr;
use tinysip_core::SipUri;
use tinysip_transaction::TimerSettings;

/// Static configuration of one user agent instance.
#[derive(Debug, Clone)]
pub struct UserAgentConfig {
    /// The identity placed in From and Contact headers.
    pub local_uri: SipUri,
    /// Bind address for [`UserAgent::bind_udp`](crate::UserAgent::bind_udp).
    pub bind_addr: SocketAddr,
    /// host:port advertised in Via; derived from the transport when unset.
    pub sent_by: Option<SmolStr>,
    /// T1/T2/T4 base values.
    pub timers: TimerSettings,
    /// Expires advertised on REGISTER.
    pub register_expires: u32,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            local_uri: SipUri::parse("sip:anonymous@localhost").expect("static uri"),
            bind_addr: "127.0.0.1:0".parse().expect("static addr"),
            sent_by: None,
            timers: TimerSettings::default(),
            register_expires: 3600,
        }
    }
}

impl UserAgentConfig {
    /// Convenience constructor from a textual local URI.
    pub fn for_identity(local_uri: &str) -> Option<Self> {
        Some(Self {
            local_uri: SipUri::parse(local_uri)?,
            ..Self::default()
        })
    }
}
