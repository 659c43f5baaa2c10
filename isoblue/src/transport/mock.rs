//! In-memory transport for tests
//!
//! Every successful [`MockTransport::connect`] hands the far end of a fresh
//! in-memory pipe to the paired [`MockBridge`], which plays the bridge:
//! it reads the commands the device writes and injects frames. Dropping a
//! [`MockLink`] breaks the link the same way a radio drop would.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connection, TransportError, TransportProvider};
use crate::command::Command;

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct MockTransport {
    links: mpsc::UnboundedSender<MockLink>,
    refuse_remaining: AtomicUsize,
    connects: AtomicUsize,
    credentials: Mutex<Vec<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, MockBridge) {
        let (links, accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            links,
            refuse_remaining: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            credentials: Mutex::new(Vec::new()),
        });
        (transport, MockBridge { accepted })
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse_remaining.store(count, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Credentials set through the handshake, oldest first
    pub fn credentials(&self) -> Vec<Vec<u8>> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TransportProvider for MockTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionFailed("refused by mock".to_string()));
        }

        let (device_end, bridge_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(bridge_end);
        let link = MockLink {
            reader: BufReader::new(reader),
            writer,
        };
        self.links
            .send(link)
            .map_err(|_| TransportError::ConnectionFailed("mock bridge is gone".to_string()))?;
        debug!("Mock link opened");
        Ok(Connection::from_stream(device_end))
    }

    async fn set_credential(&self, credential: &[u8]) -> Result<(), TransportError> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(credential.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Bridge side of a [`MockTransport`]
pub struct MockBridge {
    accepted: mpsc::UnboundedReceiver<MockLink>,
}

impl MockBridge {
    /// Wait for the device to open the next link.
    pub async fn accept(&mut self) -> Option<MockLink> {
        self.accepted.recv().await
    }
}

/// Bridge end of one link
pub struct MockLink {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockLink {
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    pub async fn send(&mut self, command: &Command) -> io::Result<()> {
        self.send_line(&command.to_string()).await
    }

    /// Next line the device wrote, `None` once the device side closed.
    pub async fn recv_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Next command the device wrote. Undecodable lines are an error here:
    /// the device must only ever emit valid frames.
    pub async fn recv(&mut self) -> io::Result<Option<Command>> {
        match self.recv_line().await? {
            Some(line) => line
                .parse()
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}
