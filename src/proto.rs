//! Fixed size wire frames.
//!
//! Every frame is exactly [`FRAME_SIZE`] bytes, byte 0 is the message type and
//! all bytes not used by the message are zero. There is no length prefix, a
//! datagram of any other size is noise.
//!
//! | type            | layout                                                       |
//! |-----------------|--------------------------------------------------------------|
//! | `Register`      | flags(1) target ipv4(2..6) token len(6) token(7..)           |
//! | `Registered`    | -                                                            |
//! | `ConnectTo`     | peer ipv4(1..5) peer port le(5..7) token len(7) token(8..)   |
//! | `Error`         | code(1)                                                      |
//! | `Punch`         | token len(1) token(2..)                                      |
//! | `PunchSuccess`  | token len(1) token(2..)                                      |

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Size of every frame on the wire.
pub const FRAME_SIZE: usize = 64;
/// Longest token a frame carries.
pub const TOKEN_SIZE: usize = 32;
/// Default rendezvous service port.
pub const DEFAULT_PORT: u16 = 6776;

const FLAG_CONNECTOR: u8 = 1;
const FLAG_LISTENER: u8 = 1 << 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Register = 0,
    Registered = 1,
    ConnectTo = 2,
    Error = 3,
    Punch = 4,
    PunchSuccess = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(b: u8) -> Result<Self, DecodeError> {
        Ok(match b {
            0 => MessageType::Register,
            1 => MessageType::Registered,
            2 => MessageType::ConnectTo,
            3 => MessageType::Error,
            4 => MessageType::Punch,
            5 => MessageType::PunchSuccess,
            other => return Err(DecodeError::UnknownType(other)),
        })
    }
}

/// Error codes carried by [`Message::Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// no listener is registered at the requested address
    ClientNotFound = 0,
}

impl TryFrom<u8> for ErrorCode {
    type Error = DecodeError;

    fn try_from(b: u8) -> Result<Self, DecodeError> {
        match b {
            0 => Ok(ErrorCode::ClientNotFound),
            other => Err(DecodeError::UnknownErrorCode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// datagram is not exactly one frame
    Size(usize),
    UnknownType(u8),
    /// declared token length does not fit the frame
    InvalidTokenSize(u8),
    UnknownErrorCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Size(n) => write!(f, "frame size {} != {}", n, FRAME_SIZE),
            DecodeError::UnknownType(t) => write!(f, "unknown message type {}", t),
            DecodeError::InvalidTokenSize(n) => write!(f, "invalid token size {}", n),
            DecodeError::UnknownErrorCode(c) => write!(f, "unknown error code {}", c),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Session correlator shared by a connector and the listener it punches.
///
/// At most [`TOKEN_SIZE`] bytes, longer input is truncated. Not a secret.
#[derive(Copy, Clone)]
pub struct Token {
    bytes: [u8; TOKEN_SIZE],
    len: u8,
}

impl Token {
    /// Fresh random full length token.
    pub fn random() -> Self {
        Self {
            bytes: rand::random(),
            len: TOKEN_SIZE as u8,
        }
    }

    pub fn from_slice(b: &[u8]) -> Self {
        let len = b.len().min(TOKEN_SIZE);
        let mut bytes = [0; TOKEN_SIZE];
        bytes[..len].copy_from_slice(&b[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn write(&self, buf: &mut [u8], len_at: usize) {
        buf[len_at] = self.len;
        buf[len_at + 1..len_at + 1 + self.len()].copy_from_slice(self.as_bytes());
    }

    fn read(buf: &[u8], len_at: usize) -> Result<Self, DecodeError> {
        let len = buf[len_at];
        let start = len_at + 1;
        if len as usize > (buf.len() - start).min(TOKEN_SIZE) {
            return Err(DecodeError::InvalidTokenSize(len));
        }
        Ok(Self::from_slice(&buf[start..start + len as usize]))
    }
}

// exact length, byte for byte
impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(")?;
        for b in self.as_bytes().iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        if self.len() > 4 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// The connector half of a `Register` frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub target: Ipv4Addr,
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `listener` asks to be reachable at the observed address, `connect` asks
    /// the server to pair us with the listener at `target`. Both may be set.
    Register {
        listener: bool,
        connect: Option<ConnectRequest>,
    },
    Registered,
    ConnectTo {
        peer: SocketAddrV4,
        token: Token,
    },
    Error {
        code: ErrorCode,
    },
    Punch {
        token: Token,
    },
    PunchSuccess {
        token: Token,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::Registered => MessageType::Registered,
            Message::ConnectTo { .. } => MessageType::ConnectTo,
            Message::Error { .. } => MessageType::Error,
            Message::Punch { .. } => MessageType::Punch,
            Message::PunchSuccess { .. } => MessageType::PunchSuccess,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0; FRAME_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into a reused buffer. The buffer is zeroed first so nothing from
    /// a previous frame survives in the padding.
    pub fn encode_into(&self, buf: &mut [u8; FRAME_SIZE]) {
        buf.fill(0);
        buf[0] = self.message_type() as u8;

        match self {
            Message::Register { listener, connect } => {
                let mut flags = 0;
                if *listener {
                    flags |= FLAG_LISTENER;
                }
                if let Some(req) = connect {
                    flags |= FLAG_CONNECTOR;
                    buf[2..6].copy_from_slice(&req.target.octets());
                    req.token.write(buf, 6);
                }
                buf[1] = flags;
            }
            Message::Registered => {}
            Message::ConnectTo { peer, token } => {
                buf[1..5].copy_from_slice(&peer.ip().octets());
                buf[5..7].copy_from_slice(&peer.port().to_le_bytes());
                token.write(buf, 7);
            }
            Message::Error { code } => buf[1] = *code as u8,
            Message::Punch { token } | Message::PunchSuccess { token } => token.write(buf, 1),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() != FRAME_SIZE {
            return Err(DecodeError::Size(buf.len()));
        }

        Ok(match MessageType::try_from(buf[0])? {
            MessageType::Register => {
                let parts = RegisterParts::read(buf);
                Message::Register {
                    listener: parts.listener,
                    connect: parts.connect?,
                }
            }
            MessageType::Registered => Message::Registered,
            MessageType::ConnectTo => {
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_le_bytes([buf[5], buf[6]]);
                Message::ConnectTo {
                    peer: SocketAddrV4::new(ip, port),
                    token: Token::read(buf, 7)?,
                }
            }
            MessageType::Error => Message::Error {
                code: ErrorCode::try_from(buf[1])?,
            },
            MessageType::Punch => Message::Punch {
                token: Token::read(buf, 1)?,
            },
            MessageType::PunchSuccess => Message::PunchSuccess {
                token: Token::read(buf, 1)?,
            },
        })
    }
}

/// A `Register` frame with its two halves decoded independently, so a bad
/// connector half does not lose the listener half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegisterParts {
    pub(crate) listener: bool,
    pub(crate) connector: bool,
    pub(crate) connect: Result<Option<ConnectRequest>, DecodeError>,
}

impl RegisterParts {
    /// `Ok(None)` for a well sized frame of another type.
    pub(crate) fn decode(buf: &[u8]) -> Result<Option<Self>, DecodeError> {
        if buf.len() != FRAME_SIZE {
            return Err(DecodeError::Size(buf.len()));
        }

        match MessageType::try_from(buf[0])? {
            MessageType::Register => Ok(Some(Self::read(buf))),
            _ => Ok(None),
        }
    }

    fn read(buf: &[u8]) -> Self {
        let flags = buf[1];
        let connector = flags & FLAG_CONNECTOR != 0;
        let connect = if connector {
            Token::read(buf, 6).map(|token| {
                Some(ConnectRequest {
                    target: Ipv4Addr::new(buf[2], buf[3], buf[4], buf[5]),
                    token,
                })
            })
        } else {
            Ok(None)
        };

        Self {
            listener: flags & FLAG_LISTENER != 0,
            connector,
            connect,
        }
    }
}
