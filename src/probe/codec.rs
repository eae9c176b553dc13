//! Line framing for the mtr-packet protocol.
//!
//! Every request and response is one newline-terminated ASCII line whose
//! first token is the request counter:
//!
//! ```text
//! 7 send-probe local-ip-4 10.0.0.2 ip-4 8.8.8.8 timeout 5 ttl 3
//! 7 ttl-expired ip-4 10.0.0.1 round-trip-time 400
//! ```
//!
//! Tokens are never escaped, so callers must not pass tokens containing
//! whitespace.

use crate::error::CodecError;

/// Highest request counter. mtr-packet stores counters as a signed 32-bit
/// value, so ids wrap to 0 after this.
pub const MAX_REQUEST_ID: u32 = i32::MAX as u32;

/// Encode a request as `"<id> <token> <token> ...\n"`
pub fn encode<S: AsRef<str>>(id: u32, tokens: &[S]) -> String {
    let mut line = id.to_string();
    for token in tokens {
        line.push(' ');
        line.push_str(token.as_ref());
    }
    line.push('\n');
    line
}

/// Split an incoming line into its counter and response tokens
pub fn decode(line: &str) -> Result<(u32, Vec<String>), CodecError> {
    let mut tokens = line.split_ascii_whitespace();
    let counter = tokens.next().ok_or(CodecError::Empty)?;
    let id = counter
        .parse::<u32>()
        .ok()
        .filter(|id| *id <= MAX_REQUEST_ID)
        .ok_or_else(|| CodecError::BadCounter(counter.to_string()))?;
    Ok((id, tokens.map(str::to_string).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_send_probe() {
        let tokens = ["send-probe", "ip-4", "127.0.0.1", "ttl", "1"];
        assert_eq!(encode(0, &tokens), "0 send-probe ip-4 127.0.0.1 ttl 1\n");
    }

    #[test]
    fn test_encode_no_tokens() {
        let tokens: [&str; 0] = [];
        assert_eq!(encode(42, &tokens), "42\n");
    }

    #[test]
    fn test_decode_reply() {
        let (id, tokens) = decode("12 reply ip-4 127.0.0.1 round-trip-time 500\n").unwrap();
        assert_eq!(id, 12);
        assert_eq!(
            tokens,
            vec!["reply", "ip-4", "127.0.0.1", "round-trip-time", "500"]
        );
    }

    #[test]
    fn test_decode_counter_only() {
        let (id, tokens) = decode("3").unwrap();
        assert_eq!(id, 3);
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_decode_collapses_whitespace() {
        let (id, tokens) = decode("  5\tno-reply   \r\n").unwrap();
        assert_eq!(id, 5);
        assert_eq!(tokens, vec!["no-reply"]);
    }

    #[test]
    fn test_decode_empty_line() {
        assert_eq!(decode(""), Err(CodecError::Empty));
        assert_eq!(decode("   \n"), Err(CodecError::Empty));
    }

    #[test]
    fn test_decode_bad_counter() {
        assert_eq!(
            decode("reply ip-4 1.2.3.4"),
            Err(CodecError::BadCounter("reply".to_string()))
        );
        assert_eq!(decode("-1 reply"), Err(CodecError::BadCounter("-1".to_string())));
    }

    #[test]
    fn test_decode_counter_out_of_range() {
        assert!(decode("2147483647 no-reply").is_ok());
        assert_eq!(
            decode("2147483648 no-reply"),
            Err(CodecError::BadCounter("2147483648".to_string()))
        );
    }

    // ========================================================================
    // Property-based tests (proptest)
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        /// Whitespace-free tokens come back exactly as encoded
        #[test]
        fn proptest_encode_decode(
            id in 0..=MAX_REQUEST_ID,
            tokens in prop::collection::vec("[a-z0-9.:-]{1,16}", 0..10)
        ) {
            let line = encode(id, &tokens);
            prop_assert_eq!(decode(&line), Ok((id, tokens)));
        }

        /// Arbitrary input must not panic the decoder
        #[test]
        fn proptest_decode_no_panic(line in ".*") {
            let _ = decode(&line);
        }
    }
}
