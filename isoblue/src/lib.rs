//! ISOBlue Protocol Library
//!
//! Turns the single line-oriented link to an ISOBlue bridge into filtered
//! message channels on the two ISOBUS buses it relays:
//! - PGN and message value types
//! - The bridge line protocol (FILT, WRITE, MESG, OLD_MESG, PAST, ACK, START)
//! - Live and buffered (history replay) sockets per bus
//! - A device that owns the link, reconnects on failure and never loses queued commands
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use isoblue::{Device, DeviceConfig, Pgn, TcpTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(TcpTransport::new("192.168.4.1:7000"));
//! let device = Device::connect(transport, DeviceConfig::default(), None).await;
//!
//! let socket = device.engine_bus().connect([Pgn::new(0x00F004)?]).await?;
//! loop {
//!     let message = socket.read().await?;
//!     println!("{}", message);
//! }
//! # }
//! ```

pub mod bus;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pgn;
pub mod sink;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use bus::{Bus, BusKind, SocketId};
pub use command::{Channel, Command, OpCode};
pub use config::{DeviceConfig, OverflowPolicy};
pub use device::{ConnectionState, Device};
pub use error::{FrameError, InvalidPgn, SocketError, TransportError};
pub use message::{GLOBAL_ADDRESS, Message, MessageId, NULL_ADDRESS};
pub use metrics::{DeviceMetrics, MetricsSnapshot};
pub use pgn::Pgn;
pub use sink::MessageSink;
pub use socket::{BufferedSocket, ReplayWindow, Socket};
pub use transport::mock::{MockBridge, MockLink, MockTransport};
pub use transport::tcp::TcpTransport;
pub use transport::{Connection, TransportProvider};
