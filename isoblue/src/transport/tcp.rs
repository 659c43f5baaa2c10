use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Connection, TransportError, TransportProvider};

/// Bridge reachable through a serial-to-TCP gateway
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl TransportProvider for TcpTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "{}: timed out after {:?}",
                    self.address, self.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.address, e)))?;

        // Frames are small and latency matters more than throughput
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!("TCP link to {} established", self.address);

        let (reader, writer) = stream.into_split();
        Ok(Connection::new(Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_exchange_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap()
        });

        let transport = TcpTransport::new(address.clone());
        assert_eq!(transport.describe(), format!("tcp://{}", address));
        let mut conn = transport.connect().await.unwrap();
        conn.writer.write_all(b"F000000\n").await.unwrap();
        conn.writer.flush().await.unwrap();

        assert_eq!(server.await.unwrap(), Some("F000000".to_string()));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new(address).with_connect_timeout(Duration::from_secs(1));
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_credentials_unsupported() {
        let transport = TcpTransport::new("127.0.0.1:1");
        assert!(matches!(
            transport.set_credential(b"0000").await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
