//! Command encoding for the robot firmware
//!
//! Tokens starting with an uppercase ASCII letter are sent as binary frames:
//! token bytes, one byte per parameter (wrapped modulo 256) and the `~`
//! sentinel. All other tokens are sent as plain text.

use base64::{engine::general_purpose, Engine as _};
use std::fmt;
use tracing::warn;

/// Terminator of a binary frame (`~`)
pub const FRAME_SENTINEL: u8 = 126;

/// Transport marker for a binary frame rendered as text
pub const BYTES_PREFIX: &str = "bytes:";

/// Prefix of the base64 envelope accepted on decode
pub const BASE64_PREFIX: &str = "b64:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Text,
    Bytes,
}

impl Encoding {
    pub fn for_token(token: &str) -> Self {
        match token.as_bytes().first() {
            Some(first) if first.is_ascii_uppercase() => Encoding::Bytes,
            _ => Encoding::Text,
        }
    }
}

/// A firmware command before it is put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub token: String,
    pub params: Vec<i64>,
    pub encoding: Encoding,
}

/// What actually goes to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    Text(String),
    Bytes(Vec<u8>),
}

impl Command {
    pub fn new(token: impl Into<String>, params: Vec<i64>) -> Self {
        let token = token.into();
        let encoding = Encoding::for_token(&token);
        Self { token, params, encoding }
    }

    /// Bare token without parameters
    pub fn token(token: impl Into<String>) -> Self {
        Self::new(token, Vec::new())
    }

    pub fn encode(&self) -> WireCommand {
        encode(&self.token, &self.params)
    }

    /// First character of the token, used to pick completion tokens
    pub fn lead(&self) -> Option<char> {
        self.token.chars().next()
    }
}

impl fmt::Display for Command {
    /// Human readable form, `token p1 p2 ...`, used in logs for both encodings
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)?;
        for param in &self.params {
            write!(f, " {}", param)?;
        }
        Ok(())
    }
}

/// Encode a token and its parameters into a wire command
pub fn encode(token: &str, params: &[i64]) -> WireCommand {
    match Encoding::for_token(token) {
        Encoding::Bytes => {
            let mut bytes = Vec::with_capacity(token.len() + params.len() + 1);
            bytes.extend_from_slice(token.as_bytes());
            bytes.extend(params.iter().map(|p| p.rem_euclid(256) as u8));
            bytes.push(FRAME_SENTINEL);
            WireCommand::Bytes(bytes)
        }
        Encoding::Text => {
            if params.is_empty() {
                WireCommand::Text(token.to_string())
            } else {
                let joined: Vec<String> = params.iter().map(|p| p.to_string()).collect();
                WireCommand::Text(format!("{} {}", token, joined.join(" ")))
            }
        }
    }
}

impl WireCommand {
    pub fn is_binary(&self) -> bool {
        matches!(self, WireCommand::Bytes(_))
    }

    /// Raw bytes as written to a byte-oriented link
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WireCommand::Text(text) => text.as_bytes(),
            WireCommand::Bytes(bytes) => bytes,
        }
    }

    /// First character of the command, taken from the token
    pub fn lead(&self) -> Option<char> {
        match self {
            WireCommand::Text(text) => text.chars().next(),
            WireCommand::Bytes(bytes) => bytes.first().map(|b| *b as char),
        }
    }
}

impl fmt::Display for WireCommand {
    /// Text form handed to text-oriented transports; binary frames carry the `bytes:` marker
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireCommand::Text(text) => write!(f, "{}", text),
            WireCommand::Bytes(bytes) => {
                let list: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
                write!(f, "{}[{}]", BYTES_PREFIX, list.join(","))
            }
        }
    }
}

/// Decode a command string as produced for a transport back into a `Command`.
///
/// Binary layouts (`b64:` envelope or `bytes:[..]` list) carry a single
/// character token followed by signed 8-bit parameters.
pub fn decode_envelope(content: &str) -> Option<Command> {
    let content = content.trim();
    if let Some(encoded) = content.strip_prefix(BASE64_PREFIX) {
        return match general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) => decode_frame(&bytes),
            Err(e) => {
                warn!("Invalid base64 command envelope: {}", e);
                None
            }
        };
    }

    if let Some(list) = content.strip_prefix(BYTES_PREFIX) {
        let inner = list.trim().trim_start_matches('[').trim_end_matches(']');
        let mut bytes = Vec::new();
        for item in inner.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.parse::<i64>() {
                Ok(value) => bytes.push(value.rem_euclid(256) as u8),
                Err(_) => {
                    warn!("Invalid byte '{}' in command frame", item);
                    return None;
                }
            }
        }
        return decode_frame(&bytes);
    }

    let mut words = content.split_whitespace();
    let token = words.next()?;
    let params = words.filter_map(|w| w.parse::<i64>().ok()).collect();
    Some(Command::new(token, params))
}

fn decode_frame(bytes: &[u8]) -> Option<Command> {
    let (first, rest) = bytes.split_first()?;
    let rest = match rest.split_last() {
        Some((&FRAME_SENTINEL, body)) => body,
        _ => rest,
    };
    let params = rest.iter().map(|b| *b as i8 as i64).collect();
    Some(Command::new((*first as char).to_string(), params))
}

/// Base64 envelope for a wire command, the inverse of the `b64:` decode path
pub fn to_base64_envelope(command: &WireCommand) -> String {
    format!("{}{}", BASE64_PREFIX, general_purpose::STANDARD.encode(command.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercase_token_is_text() {
        assert_eq!(encode("m", &[3, 10]), WireCommand::Text("m 3 10".to_string()));
        assert_eq!(encode("kup", &[]), WireCommand::Text("kup".to_string()));
        assert_eq!(encode("j", &[-4]).to_string(), "j -4");
    }

    #[test]
    fn test_uppercase_token_is_framed() {
        assert_eq!(encode("XU", &[5, 6]), WireCommand::Bytes(vec![88, 85, 5, 6, 126]));
    }

    #[test]
    fn test_frame_layout_and_wrapping() {
        let params = [0i64, 255, 256, -1, -128, 300, 127];
        let token = "Wa";
        let WireCommand::Bytes(bytes) = encode(token, &params) else {
            panic!("expected binary frame");
        };
        assert_eq!(bytes.len(), token.len() + params.len() + 1);
        assert_eq!(*bytes.last().unwrap(), FRAME_SENTINEL);
        let body = &bytes[token.len()..token.len() + params.len()];
        assert_eq!(body, &[0, 255, 0, 255, 128, 44, 127]);
    }

    #[test]
    fn test_bytes_marker_rendering() {
        let wire = encode("B", &[20, 4]);
        assert_eq!(wire.to_string(), "bytes:[66,20,4,126]");
        assert!(wire.is_binary());
        assert_eq!(wire.lead(), Some('B'));
        assert_eq!(Command::new("B", vec![20, 4]).to_string(), "B 20 4");
    }

    #[test]
    fn test_text_decode_roundtrip() {
        for token in ["d", "ksit", "gU", "?"] {
            let decoded = decode_envelope(&encode(token, &[]).to_string()).unwrap();
            assert_eq!(decoded.token, token);
            assert!(decoded.params.is_empty());
        }
        let decoded = decode_envelope("m 0 -30 1 45").unwrap();
        assert_eq!(decoded.token, "m");
        assert_eq!(decoded.params, vec![0, -30, 1, 45]);
    }

    #[test]
    fn test_binary_envelopes_decode() {
        let wire = encode("L", &[8, -20, 9, 30]);
        let from_list = decode_envelope(&wire.to_string()).unwrap();
        assert_eq!(from_list.token, "L");
        assert_eq!(from_list.params, vec![8, -20, 9, 30]);
        assert_eq!(from_list.encoding, Encoding::Bytes);

        let from_b64 = decode_envelope(&to_base64_envelope(&wire)).unwrap();
        assert_eq!(from_b64, from_list);
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(decode_envelope("").is_none());
        assert!(decode_envelope("b64:***").is_none());
        assert!(decode_envelope("bytes:[66,x]").is_none());
        assert!(decode_envelope("bytes:[]").is_none());
    }
}
