//! Sendmail milter protocol codes and frame encoding.
//!
//! Every exchange is a length-prefixed binary frame: a 4-byte big-endian
//! size covering the command byte plus payload, one command byte, then the
//! payload. The command letters and capability flags follow sendmail's
//! `mfapi.h`/`mfdef.h` as spoken by Postfix and Sendmail.

use crate::session::SessionState;
use std::fmt;

/// Highest milter protocol version this filter speaks.
pub const PROTOCOL_VERSION: u32 = 6;

/// Largest frame accepted from the MTA.
pub const MAX_FRAME_SIZE: u32 = 1 << 20;

// Action capability flags (SMFIF_*), offered by the MTA during negotiation.
pub const SMFIF_ADDHDRS: u32 = 0x01;
pub const SMFIF_CHGHDRS: u32 = 0x10;

/// Commands sent by the MTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Abort,     // SMFIC_ABORT
    Body,      // SMFIC_BODY
    Connect,   // SMFIC_CONNECT
    Macro,     // SMFIC_MACRO
    BodyEnd,   // SMFIC_BODYEOB
    Helo,      // SMFIC_HELO
    Header,    // SMFIC_HEADER
    Mail,      // SMFIC_MAIL
    HeaderEnd, // SMFIC_EOH
    OptNeg,    // SMFIC_OPTNEG
    Quit,      // SMFIC_QUIT
    Rcpt,      // SMFIC_RCPT
    Data,      // SMFIC_DATA
    Unknown,   // SMFIC_UNKNOWN
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'A' => Some(Command::Abort),
            b'B' => Some(Command::Body),
            b'C' => Some(Command::Connect),
            b'D' => Some(Command::Macro),
            b'E' => Some(Command::BodyEnd),
            b'H' => Some(Command::Helo),
            b'L' => Some(Command::Header),
            b'M' => Some(Command::Mail),
            b'N' => Some(Command::HeaderEnd),
            b'O' => Some(Command::OptNeg),
            b'Q' => Some(Command::Quit),
            b'R' => Some(Command::Rcpt),
            b'T' => Some(Command::Data),
            b'U' => Some(Command::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Abort => "SMFIC_ABORT",
            Command::Body => "SMFIC_BODY",
            Command::Connect => "SMFIC_CONNECT",
            Command::Macro => "SMFIC_MACRO",
            Command::BodyEnd => "SMFIC_BODYEOB",
            Command::Helo => "SMFIC_HELO",
            Command::Header => "SMFIC_HEADER",
            Command::Mail => "SMFIC_MAIL",
            Command::HeaderEnd => "SMFIC_EOH",
            Command::OptNeg => "SMFIC_OPTNEG",
            Command::Quit => "SMFIC_QUIT",
            Command::Rcpt => "SMFIC_RCPT",
            Command::Data => "SMFIC_DATA",
            Command::Unknown => "SMFIC_UNKNOWN",
        }
    }
}

/// Replies sent back to the MTA. Each encodes to one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Continue,
    Accept,
    OptNeg {
        version: u32,
        actions: u32,
        protocol: u32,
    },
    /// SMFIR_ADDHEADER: append a header.
    AddHeader { name: String, value: String },
    /// SMFIR_CHGHEADER: replace occurrence `index` (1-based) of `name`; an
    /// empty value deletes the header instead.
    ChangeHeader {
        index: u32,
        name: String,
        value: String,
    },
}

impl Reply {
    pub fn code(&self) -> u8 {
        match self {
            Reply::Continue => b'c',
            Reply::Accept => b'a',
            Reply::OptNeg { .. } => b'O',
            Reply::AddHeader { .. } => b'h',
            Reply::ChangeHeader { .. } => b'm',
        }
    }

    /// Encode into a length-prefixed wire frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Reply::Continue | Reply::Accept => {}
            Reply::OptNeg {
                version,
                actions,
                protocol,
            } => {
                payload.extend_from_slice(&version.to_be_bytes());
                payload.extend_from_slice(&actions.to_be_bytes());
                payload.extend_from_slice(&protocol.to_be_bytes());
            }
            Reply::AddHeader { name, value } => {
                push_cstr(&mut payload, name);
                push_cstr(&mut payload, value);
            }
            Reply::ChangeHeader { index, name, value } => {
                payload.extend_from_slice(&index.to_be_bytes());
                push_cstr(&mut payload, name);
                push_cstr(&mut payload, value);
            }
        }

        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
        frame.push(self.code());
        frame.extend_from_slice(&payload);
        frame
    }
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Option negotiation offer from the MTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptNegOffer {
    pub version: u32,
    pub actions: u32,
    pub protocol: u32,
}

/// Per-connection protocol failures. Any of these closes the owning
/// connection and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame with a zero size field.
    EmptyFrame,
    /// Frame larger than [`MAX_FRAME_SIZE`].
    OversizedFrame { size: u32 },
    /// Command byte outside the known set.
    UnknownCommand { code: u8 },
    /// Known command arriving in a state that cannot accept it.
    UnexpectedCommand {
        state: SessionState,
        command: Command,
    },
    /// Negotiation payload shorter than the 12 required bytes.
    MalformedOptNeg { len: usize },
    /// Header frame without the name/value NUL separator.
    MalformedHeader,
    /// The MTA did not offer the header-modification actions this filter
    /// needs to do its job.
    IncompatibleActions { offered: u32 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::EmptyFrame => write!(f, "zero-length frame"),
            ProtocolError::OversizedFrame { size } => {
                write!(f, "frame of {} bytes exceeds limit", size)
            }
            ProtocolError::UnknownCommand { code } => {
                write!(f, "unknown command byte 0x{:02X}", code)
            }
            ProtocolError::UnexpectedCommand { state, command } => {
                write!(
                    f,
                    "unexpected {} in state {}",
                    command.as_str(),
                    state.as_str()
                )
            }
            ProtocolError::MalformedOptNeg { len } => {
                write!(f, "option negotiation payload of {} bytes", len)
            }
            ProtocolError::MalformedHeader => write!(f, "header frame without NUL separator"),
            ProtocolError::IncompatibleActions { offered } => {
                write!(
                    f,
                    "MTA offered actions 0x{:08X}, need header modification",
                    offered
                )
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Validate a frame size field before the payload is read.
pub fn check_frame_size(size: u32) -> Result<(), ProtocolError> {
    if size == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::OversizedFrame { size });
    }
    Ok(())
}

/// Parse an SMFIC_OPTNEG payload: version, action flags, protocol-step flags.
pub fn parse_optneg(payload: &[u8]) -> Result<OptNegOffer, ProtocolError> {
    if payload.len() < 12 {
        return Err(ProtocolError::MalformedOptNeg {
            len: payload.len(),
        });
    }
    Ok(OptNegOffer {
        version: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        actions: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        protocol: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
    })
}

/// Parse an SMFIC_HEADER payload: name NUL value NUL.
pub fn parse_header(payload: &[u8]) -> Result<(String, String), ProtocolError> {
    let sep = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::MalformedHeader)?;
    let name = String::from_utf8_lossy(&payload[..sep]).into_owned();
    let rest = &payload[sep + 1..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let value = String::from_utf8_lossy(&rest[..end]).into_owned();
    Ok((name, value))
}

/// Parse an SMFIC_MACRO payload into name/value pairs. The first byte names
/// the command the macros belong to; the rest is NUL-separated pairs.
pub fn parse_macros(payload: &[u8]) -> Vec<(String, String)> {
    if payload.len() < 2 {
        return Vec::new();
    }
    let mut pairs = Vec::new();
    let mut parts = payload[1..].split(|&b| b == 0);
    while let (Some(name), Some(value)) = (parts.next(), parts.next()) {
        pairs.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    pairs
}
