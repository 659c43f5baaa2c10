//! The bridge link and its two long-lived tasks
//!
//! ```text
//! Connecting -> Connected -> Broken -> Connecting -> ...
//!                                  \-> Closed (only on shutdown)
//! ```
//!
//! The reader task decodes one line at a time and hands frames to the bus
//! named by the channel nibble. The writer task drains the shared outbound
//! queue. Each task checks its half of the link out of [`Link`] and only
//! takes the lock again to swap links, so frame I/O never waits on it.
//!
//! Whichever task first sees an I/O failure tears the link down and
//! reconnects. Teardown bumps the generation, so the other task drops its
//! stale half right away and waits for the fresh one. A command whose write
//! failed, or that was picked up while the link was going away, is kept and
//! sent again on the new link, so delivery is at least once.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::{Bus, BusKind};
use crate::command::{Command, MAX_FRAME_LEN, OpCode};
use crate::config::DeviceConfig;
use crate::error::{FrameError, SocketError, TransportError};
use crate::message::MessageId;
use crate::metrics::{DeviceMetrics, MetricsSnapshot};
use crate::pgn::Pgn;
use crate::sink::MessageSink;
use crate::socket::{BufferedSocket, ReplayWindow, raised};
use crate::transport::{BoxedReader, BoxedWriter, Connection, TransportProvider};

const STATE_EVENT_CAPACITY: usize = 32;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Broken,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Broken => "broken",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The current link. A half is `None` while its task has it checked out,
/// or while no link is up.
struct Link {
    generation: u64,
    reader: Option<BufReader<BoxedReader>>,
    writer: Option<BoxedWriter>,
}

struct Shared {
    transport: Arc<dyn TransportProvider>,
    config: DeviceConfig,
    engine: Arc<Bus>,
    implement: Arc<Bus>,
    outbound: mpsc::Sender<Command>,
    link: Mutex<Link>,
    generation: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    state_events: broadcast::Sender<ConnectionState>,
    first_live_id: watch::Sender<Option<MessageId>>,
    shutdown: watch::Sender<bool>,
    metrics: Arc<DeviceMetrics>,
}

impl Shared {
    fn bus(&self, kind: BusKind) -> &Arc<Bus> {
        match kind {
            BusKind::Engine => &self.engine,
            BusKind::Implement => &self.implement,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Move to `next` and tell subscribers. `Closed` is final.
    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            info!("Bridge link {} -> {}", previous, next);
            // Nobody listening is fine
            let _ = self.state_events.send(next);
        }
    }

    /// Connect, retrying after the backoff until it works or we shut down.
    async fn establish(&self) -> Option<Connection> {
        let shutdown = self.shutdown_signal();
        let mut attempt: u64 = 0;
        loop {
            if self.is_shutting_down() {
                return None;
            }
            attempt += 1;
            self.set_state(ConnectionState::Connecting);

            let result = tokio::select! {
                biased;
                _ = raised(Some(shutdown.clone())) => return None,
                result = self.transport.connect() => result,
            };
            match result {
                Ok(connection) => {
                    if attempt > 1 {
                        info!("Connected to {} after {} attempts", self.transport.describe(), attempt);
                    }
                    self.handshake().await;
                    return Some(connection);
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {} to {} failed: {}",
                        attempt,
                        self.transport.describe(),
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = raised(Some(shutdown.clone())) => return None,
                        _ = tokio::time::sleep(self.config.reconnect_backoff()) => {}
                    }
                }
            }
        }
    }

    async fn handshake(&self) {
        let Some(credential) = self.config.credential.as_deref() else {
            return;
        };
        match self.transport.set_credential(credential.as_bytes()).await {
            Ok(()) => debug!("Pairing credential set on {}", self.transport.describe()),
            Err(TransportError::Unsupported(what)) => {
                debug!("{} does not support {}", self.transport.describe(), what)
            }
            Err(e) => warn!(
                "Could not set pairing credential on {}: {}",
                self.transport.describe(),
                e
            ),
        }
    }

    fn install(&self, link: &mut Link, connection: Connection) {
        link.generation += 1;
        link.reader = Some(BufReader::new(connection.reader));
        link.writer = Some(connection.writer);
        self.generation.send_replace(link.generation);
        self.set_state(ConnectionState::Connected);
    }

    /// Drop the current link and bump the generation, so the task still
    /// holding a half of it lets go before the next link is up.
    fn tear_down(&self, link: &mut Link) {
        link.generation += 1;
        link.reader = None;
        link.writer = None;
        self.generation.send_replace(link.generation);
    }

    /// Replace the link of generation `failed`. A no-op when the other task
    /// already did it.
    async fn reconnect(&self, failed: u64) {
        let mut link = self.link.lock().await;
        if link.generation != failed || self.is_shutting_down() {
            return;
        }
        self.tear_down(&mut link);
        self.set_state(ConnectionState::Broken);
        self.metrics.reconnected();
        warn!("Link to {} lost, reconnecting", self.transport.describe());

        if let Some(connection) = self.establish().await {
            self.install(&mut link, connection);
        }
    }

    /// Take one half of the current link, waiting for a new link when it is gone.
    async fn checkout<T>(
        &self,
        generations: &mut watch::Receiver<u64>,
        take: impl Fn(&mut Link) -> Option<T>,
    ) -> Option<(u64, T)> {
        loop {
            if self.is_shutting_down() {
                return None;
            }
            {
                let mut link = self.link.lock().await;
                generations.borrow_and_update();
                if let Some(half) = take(&mut *link) {
                    return Some((link.generation, half));
                }
            }
            tokio::select! {
                biased;
                _ = raised(Some(self.shutdown_signal())) => return None,
                changed = generations.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, raw: &[u8]) {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return;
        }
        self.metrics.frame_received();

        let command = match Command::from_bytes(line) {
            Ok(command) => command,
            Err(e) => return self.discard(line, &e),
        };
        if matches!(command.opcode(), OpCode::Ack | OpCode::Start) {
            return self.handle_bridge_command(&command);
        }
        let Some(kind) = BusKind::from_channel(command.channel()) else {
            debug!("Ignoring {} frame on the broadcast channel", command.opcode());
            return;
        };

        match self.bus(kind).handle_command(&command).await {
            Ok(Some(id)) if command.opcode() == OpCode::Mesg => self.record_live_id(id),
            Ok(_) => {}
            Err(e) => self.discard(line, &e),
        }
    }

    fn discard(&self, line: &[u8], error: &FrameError) {
        self.metrics.frame_discarded();
        warn!("Discarding frame {:?}: {}", String::from_utf8_lossy(line), error);
    }

    fn discard_overlong(&self, len: usize) {
        self.metrics.frame_received();
        self.metrics.frame_discarded();
        let error = FrameError::Length {
            expected: MAX_FRAME_LEN,
            actual: len,
        };
        warn!("Discarding frame: {}", error);
    }

    fn handle_bridge_command(&self, command: &Command) {
        match command.opcode() {
            OpCode::Start => info!("Bridge (re)started streaming {}", command.payload()),
            _ => debug!("Bridge acknowledged {}", command.payload()),
        }
    }

    fn record_live_id(&self, id: MessageId) {
        let first = self.first_live_id.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(id);
            true
        });
        if first {
            info!("First live message observed: {}", id);
        }
    }
}

enum Frame {
    Line,
    /// A line longer than `MAX_FRAME_LEN`, skipped up to its newline
    Overlong(usize),
    Eof,
}

/// Read one line into `line`, never buffering more than `MAX_FRAME_LEN` bytes.
async fn read_frame(reader: &mut BufReader<BoxedReader>, line: &mut Vec<u8>) -> io::Result<Frame> {
    line.clear();
    let read = (&mut *reader)
        .take(MAX_FRAME_LEN as u64)
        .read_until(b'\n', line)
        .await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if read < MAX_FRAME_LEN || line.ends_with(b"\n") {
        return Ok(Frame::Line);
    }

    let mut skipped = read;
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_FRAME_LEN as u64)
            .read_until(b'\n', line)
            .await?;
        skipped += read;
        if read == 0 || line.ends_with(b"\n") {
            line.clear();
            return Ok(Frame::Overlong(skipped));
        }
    }
}

async fn run_reader(shared: Arc<Shared>) {
    let mut generations = shared.generation.subscribe();
    let mut line = Vec::with_capacity(128);

    while let Some((generation, mut reader)) = shared
        .checkout(&mut generations, |link| link.reader.take())
        .await
    {
        debug!("Reader attached to link {}", generation);
        loop {
            let read = tokio::select! {
                biased;
                _ = raised(Some(shared.shutdown_signal())) => return,
                _ = generations.changed() => break,
                read = read_frame(&mut reader, &mut line) => read,
            };
            match read {
                Ok(Frame::Eof) => {
                    warn!("Bridge closed the link");
                    shared.reconnect(generation).await;
                    break;
                }
                Ok(Frame::Line) => shared.dispatch(&line).await,
                Ok(Frame::Overlong(len)) => shared.discard_overlong(len),
                Err(e) => {
                    warn!("Error reading from bridge: {}", e);
                    shared.reconnect(generation).await;
                    break;
                }
            }
        }
    }
    debug!("Reader stopped");
}

async fn write_line(writer: &mut BoxedWriter, command: &Command) -> io::Result<()> {
    let mut line = command.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn run_writer(shared: Arc<Shared>, mut outbound: mpsc::Receiver<Command>) {
    let mut generations = shared.generation.subscribe();
    // Written to a link that broke; goes out first on the next one
    let mut pending: Option<Command> = None;

    while let Some((generation, mut writer)) = shared
        .checkout(&mut generations, |link| link.writer.take())
        .await
    {
        debug!("Writer attached to link {}", generation);
        loop {
            let command = match pending.take() {
                Some(command) => command,
                None => tokio::select! {
                    biased;
                    _ = raised(Some(shared.shutdown_signal())) => return,
                    _ = generations.changed() => break,
                    command = outbound.recv() => match command {
                        Some(command) => command,
                        None => return,
                    },
                },
            };

            let written = tokio::select! {
                biased;
                _ = raised(Some(shared.shutdown_signal())) => return,
                _ = generations.changed() => None,
                written = write_line(&mut writer, &command) => Some(written),
            };
            match written {
                None => {
                    pending = Some(command);
                    break;
                }
                Some(Ok(())) => {
                    shared.metrics.command_sent();
                    match command.opcode() {
                        OpCode::Filt | OpCode::Past => debug!("Sent {}", command),
                        _ => trace!("Sent {}", command),
                    }
                }
                Some(Err(e)) => {
                    warn!("Error writing {} to bridge: {}", command.opcode(), e);
                    pending = Some(command);
                    shared.reconnect(generation).await;
                    break;
                }
            }
        }
    }
    debug!("Writer stopped");
}

/// One ISOBlue bridge and its engine and implement buses
pub struct Device {
    shared: Arc<Shared>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Device {
    /// Connect to the bridge, retrying until it answers, and start the
    /// reader and writer tasks. `sink` sees every live message decoded.
    pub async fn connect(
        transport: Arc<dyn TransportProvider>,
        config: DeviceConfig,
        sink: Option<Arc<dyn MessageSink>>,
    ) -> Self {
        let metrics = Arc::new(DeviceMetrics::new());
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        let engine = Arc::new(Bus::new(
            BusKind::Engine,
            outbound.clone(),
            &config,
            Arc::clone(&metrics),
            sink.clone(),
        ));
        let implement = Arc::new(Bus::new(
            BusKind::Implement,
            outbound.clone(),
            &config,
            Arc::clone(&metrics),
            sink,
        ));
        let (state_events, _) = broadcast::channel(STATE_EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            transport,
            config,
            engine,
            implement,
            outbound,
            link: Mutex::new(Link {
                generation: 0,
                reader: None,
                writer: None,
            }),
            generation: watch::Sender::new(0),
            state: watch::Sender::new(ConnectionState::Connecting),
            state_events,
            first_live_id: watch::Sender::new(None),
            shutdown: watch::Sender::new(false),
            metrics,
        });

        info!("Connecting to ISOBlue bridge at {}", shared.transport.describe());
        {
            let mut link = shared.link.lock().await;
            if let Some(connection) = shared.establish().await {
                shared.install(&mut link, connection);
            }
        }

        let reader = tokio::spawn(run_reader(Arc::clone(&shared)));
        let writer = tokio::spawn(run_writer(Arc::clone(&shared), outbound_rx));
        Self {
            shared,
            tasks: StdMutex::new(vec![reader, writer]),
        }
    }

    pub fn engine_bus(&self) -> &Arc<Bus> {
        &self.shared.engine
    }

    pub fn implement_bus(&self) -> &Arc<Bus> {
        &self.shared.implement
    }

    pub fn bus(&self, kind: BusKind) -> &Arc<Bus> {
        self.shared.bus(kind)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Every state transition from now on, in order.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Id of the first live message seen on either bus
    pub fn first_live_id(&self) -> Option<MessageId> {
        *self.shared.first_live_id.borrow()
    }

    /// Replay sockets for both buses receiving stored messages with ids in
    /// `[from_id, first live id]`.
    ///
    /// Waits for the first live message if none has been seen yet.
    pub async fn create_buffered_sockets(
        &self,
        from_id: u32,
    ) -> Result<(BufferedSocket, BufferedSocket), SocketError> {
        self.create_buffered_sockets_with_filter(from_id, []).await
    }

    /// Like [`Device::create_buffered_sockets`], delivering only `pgns` (all when empty).
    pub async fn create_buffered_sockets_with_filter(
        &self,
        from_id: u32,
        pgns: impl IntoIterator<Item = Pgn>,
    ) -> Result<(BufferedSocket, BufferedSocket), SocketError> {
        let filter: HashSet<Pgn> = pgns.into_iter().collect();
        let to = self.wait_first_live_id().await?;
        let window = ReplayWindow::new(from_id, to);

        let engine = self.shared.engine.attach_buffered(window, filter.clone());
        let implement = self.shared.implement.attach_buffered(window, filter);

        debug!("Requesting history {}", window);
        self.shared
            .outbound
            .send(Command::past(from_id, to))
            .await
            .map_err(|_| SocketError::DeviceClosed)?;
        Ok((engine, implement))
    }

    async fn wait_first_live_id(&self) -> Result<MessageId, SocketError> {
        let mut ids = self.shared.first_live_id.subscribe();
        let shutdown = raised(Some(self.shared.shutdown_signal()));
        tokio::pin!(shutdown);
        loop {
            let current = *ids.borrow_and_update();
            if let Some(id) = current {
                return Ok(id);
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => return Err(SocketError::DeviceClosed),
                changed = ids.changed() => {
                    if changed.is_err() {
                        return Err(SocketError::DeviceClosed);
                    }
                }
            }
        }
    }

    /// Stop both tasks, drop the link and close every socket. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down link to {}", self.shared.transport.describe());

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Device task did not stop in time, aborting it");
                task.abort();
            }
        }
        {
            let mut link = self.shared.link.lock().await;
            link.reader = None;
            link.writer = None;
        }
        self.shared.engine.detach_all();
        self.shared.implement.detach_all();
        self.shared.set_state(ConnectionState::Closed);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        // Sockets outlive the device through their bus; wake their readers
        self.shared.engine.detach_all();
        self.shared.implement.detach_all();
        self.shared.set_state(ConnectionState::Closed);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("bridge", &self.shared.transport.describe())
            .field("state", &self.state())
            .field("first_live_id", &self.first_live_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
