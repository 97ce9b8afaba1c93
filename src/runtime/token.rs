//! Operation tokens for completion correlation.
//!
//! Each submission carries a token (io_uring `user_data`) that identifies
//! what the completion belongs to when it arrives. Request tokens carry the
//! request's table key; the two high bits tag the token type.

/// Tag bits occupy the top two bits of the token.
const TAG_SHIFT: u32 = 62;
const TAG_IO: u64 = 0;
const TAG_CANCEL: u64 = 1;
const TAG_WAKE: u64 = 2;
const KEY_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Type of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Read or write for the request stored at `key` in the request table.
    Io { key: usize },
    /// Best-effort cancellation of the request stored at `key`.
    Cancel { key: usize },
    /// Driver wake-up (eventfd read kept armed in the ring).
    Wake,
}

impl Token {
    /// Encode as a 64-bit `user_data` value.
    pub fn encode(self) -> u64 {
        match self {
            Token::Io { key } => (TAG_IO << TAG_SHIFT) | Self::key_bits(key),
            Token::Cancel { key } => (TAG_CANCEL << TAG_SHIFT) | Self::key_bits(key),
            Token::Wake => TAG_WAKE << TAG_SHIFT,
        }
    }

    /// Decode a `user_data` value.
    ///
    /// Returns `None` for values this engine never produces.
    pub fn decode(user_data: u64) -> Option<Token> {
        let key = (user_data & KEY_MASK) as usize;
        match user_data >> TAG_SHIFT {
            TAG_IO => Some(Token::Io { key }),
            TAG_CANCEL => Some(Token::Cancel { key }),
            TAG_WAKE => Some(Token::Wake),
            _ => None,
        }
    }

    fn key_bits(key: usize) -> u64 {
        let key = key as u64;
        debug_assert!(key <= KEY_MASK, "request key overflows token");
        key & KEY_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_tags_are_distinct() {
        let io = Token::Io { key: 5 }.encode();
        let cancel = Token::Cancel { key: 5 }.encode();
        let wake = Token::Wake.encode();

        assert_ne!(io, cancel);
        assert_ne!(io, wake);
        assert_eq!(io, 5);

        assert_eq!(Token::decode(io), Some(Token::Io { key: 5 }));
        assert_eq!(Token::decode(cancel), Some(Token::Cancel { key: 5 }));
        assert_eq!(Token::decode(wake), Some(Token::Wake));
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(Token::decode(u64::MAX), None);
    }
}
