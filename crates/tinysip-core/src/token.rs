//! Random protocol tokens.
//!
//! Tags, Call-IDs and branch suffixes are lowercase hex drawn from the
//! thread-local CSPRNG.

use rand::Rng;
use smol_str::SmolStr;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Returns `len` random lowercase hex characters.
pub fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Generates an 8-hex-character From/To tag.
pub fn generate_tag() -> SmolStr {
    SmolStr::new(random_hex(8))
}

/// Generates a Call-ID: 32 hex characters scoped to the local host.
pub fn generate_call_id(local_host: &str) -> SmolStr {
    SmolStr::new(format!("{}@{}", random_hex(32), local_host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_tokens_have_requested_length() {
        assert_eq!(random_hex(16).len(), 16);
        assert!(random_hex(16).chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tags_are_eight_hex_chars() {
        let tag = generate_tag();
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn call_ids_are_scoped_to_host() {
        let call_id = generate_call_id("client.example.com");
        let (token, host) = call_id.split_once('@').unwrap();
        assert_eq!(token.len(), 32);
        assert_eq!(host, "client.example.com");
    }

    #[test]
    fn tokens_do_not_collide_trivially() {
        assert_ne!(random_hex(32), random_hex(32));
    }
}
