//! Byte-stream links to the bridge
//!
//! The device only needs a way to (re)open a duplex stream and, optionally,
//! to set the pairing credential on the bridge:
//! - [`tcp::TcpTransport`] for a bridge behind a serial-to-TCP gateway
//! - [`mock::MockTransport`] for tests

pub mod mock;
pub mod tcp;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use crate::error::TransportError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open link. Dropping both halves closes it.
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Connection {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self { reader, writer }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer))
    }
}

/// Opens links to one bridge
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Set the shared pairing credential on the remote peer. Best effort.
    async fn set_credential(&self, _credential: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("pairing credentials"))
    }

    /// Human readable peer name for logs
    fn describe(&self) -> String;
}
