//! Session Id Generation and Parsing
//!
//! Ids look like `session_1718031234567_k3j9x0q2m`: the creation time in
//! milliseconds plus a random base36 suffix, so concurrent creators on
//! different clients cannot collide in practice.

use std::fmt;

const PREFIX: &str = "session_";

/// Characters used in the random suffix
const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random suffix length (36^9 ≈ 10^14 values per millisecond)
const SUFFIX_LENGTH: usize = 9;

/// Identifier of a co-listening session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id stamped with `now_ms`
    pub fn generate(now_ms: u64) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut suffix = String::with_capacity(SUFFIX_LENGTH);
        for _ in 0..SUFFIX_LENGTH {
            let idx = rng.gen_range(0..ALPHABET.len());
            suffix.push(ALPHABET[idx] as char);
        }
        SessionId(format!("{}{}_{}", PREFIX, now_ms, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a session id from user input
    ///
    /// Accepts the bare id or a share link whose last path segment is the id.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim().trim_end_matches('/');
        let candidate = trimmed
            .rsplit(|c| c == '/' || c == '=' || c == '?')
            .next()
            .unwrap_or(trimmed);

        let rest = candidate.strip_prefix(PREFIX)?;
        let (millis, suffix) = rest.split_once('_')?;

        let millis_ok = !millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit());
        let suffix_ok =
            suffix.len() == SUFFIX_LENGTH && suffix.bytes().all(|b| ALPHABET.contains(&b));

        if millis_ok && suffix_ok {
            Some(SessionId(candidate.to_string()))
        } else {
            None
        }
    }

    /// Creation time encoded in the id
    pub fn created_at_ms(&self) -> Option<u64> {
        self.0
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.split_once('_'))
            .and_then(|(millis, _)| millis.parse().ok())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let id = SessionId::generate(1_718_031_234_567);
        assert!(id.as_str().starts_with("session_1718031234567_"));
        assert_eq!(id.created_at_ms(), Some(1_718_031_234_567));
        assert_eq!(SessionId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn test_same_millisecond_does_not_collide() {
        let a = SessionId::generate(42);
        let b = SessionId::generate(42);
        // Very unlikely to be equal
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_share_links() {
        let expected = Some(SessionId("session_17_abcdef123".to_string()));
        assert_eq!(SessionId::parse("  session_17_abcdef123 "), expected);
        assert_eq!(SessionId::parse("https://vibeloop.app/listen/session_17_abcdef123"), expected);
        assert_eq!(SessionId::parse("https://vibeloop.app/listen/session_17_abcdef123/"), expected);
        assert_eq!(SessionId::parse("https://vibeloop.app/join?id=session_17_abcdef123"), expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SessionId::parse("").is_none());
        assert!(SessionId::parse("session_").is_none());
        assert!(SessionId::parse("session_abc_abcdef123").is_none()); // Non-numeric time
        assert!(SessionId::parse("session_17_ABCDEF123").is_none()); // Uppercase suffix
        assert!(SessionId::parse("session_17_abc").is_none()); // Too short
        assert!(SessionId::parse("room_17_abcdef123").is_none());
    }
}
