//! Error types for the ISOBlue protocol engine

use thiserror::Error;

/// An integer that is not a valid ISOBUS PGN.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("integer {0:#07x} does not represent a valid ISOBUS PGN")]
pub struct InvalidPgn(pub u32);

/// A frame that could not be decoded. The frame is dropped and reading continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("frame is not ASCII text")]
    NotText,

    #[error("unknown opcode {0:?}")]
    UnknownOpcode(char),

    #[error("invalid channel nibble {0:?}")]
    InvalidChannel(char),

    #[error("field `{field}` is not hex: {value:?}")]
    InvalidHex { field: &'static str, value: String },

    #[error("payload length {actual}, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: u32 },

    #[error(transparent)]
    InvalidPgn(#[from] InvalidPgn),

    #[error("{opcode} frame cannot be decoded as {expected}")]
    UnexpectedOpcode {
        opcode: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport does not support {0}")]
    Unsupported(&'static str),
}

/// Errors surfaced to socket users.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    #[error("device cannot accept commands, socket not connected")]
    ConnectFailed,

    #[error("socket is closed")]
    Closed,

    #[error("buffered sockets are read only")]
    UnsupportedOperation,

    #[error("message data of {0} bytes does not fit in a frame")]
    MessageTooLong(usize),

    #[error("device has shut down")]
    DeviceClosed,

    #[error("bridge has no more history for this socket")]
    EndOfHistory,
}
