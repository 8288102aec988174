use std::fmt;

/// Error returned when an encoded local part cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A quote character at `position` with fewer than two bytes after it.
    TruncatedEscape { position: usize },
    /// A quote character at `position` not followed by two hex digits.
    InvalidEscape { position: usize },
    /// The decoded bytes are not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TruncatedEscape { position } => {
                write!(f, "truncated escape sequence at byte {}", position)
            }
            DecodeError::InvalidEscape { position } => {
                write!(f, "invalid escape sequence at byte {}", position)
            }
            DecodeError::InvalidUtf8 => write!(f, "decoded address is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Bytes besides ASCII alphanumerics that never need escaping.
const UNRESERVED: &[u8] = b"-._~";

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || UNRESERVED.contains(&byte)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// Encode a full email address into a string that is safe as the local part
/// of an alias address.
///
/// Every byte outside the unreserved set, and every literal occurrence of the
/// quote character itself, becomes `quote` followed by two uppercase hex
/// digits. Escaping the quote character unconditionally keeps the output free
/// of unescaped quote characters, so decoding is unambiguous even when the
/// quote character is itself alphanumeric.
pub fn encode_local_part(address: &str, quote: char) -> String {
    let mut out = String::with_capacity(address.len());
    for &byte in address.as_bytes() {
        if is_unreserved(byte) && byte as char != quote {
            out.push(byte as char);
        } else {
            out.push(quote);
            out.push_str(&format!("{:02X}", byte));
        }
    }
    out
}

/// Decode a local part produced by [`encode_local_part`] back into the
/// original address.
///
/// Scans for the quote character and substitutes the byte named by the two
/// hex digits that follow it; the digits may be upper- or lowercase. Fails
/// when a quote character is not followed by exactly two hex digits.
pub fn decode_local_part(local_part: &str, quote: char) -> Result<String, DecodeError> {
    let quote_byte = quote as u8;
    let bytes = local_part.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == quote_byte {
            if i + 2 >= bytes.len() {
                return Err(DecodeError::TruncatedEscape { position: i });
            }
            match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => return Err(DecodeError::InvalidEscape { position: i }),
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| DecodeError::InvalidUtf8)
}
