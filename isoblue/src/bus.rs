//! One logical vehicle bus multiplexed over the bridge link
//!
//! A [`Bus`] keeps every socket attached to it in an arena keyed by
//! [`SocketId`]. Handles are never reused, so ids in logs stay meaningful
//! after other sockets come and go. Iteration over the arena has no order.
//!
//! The bridge applies a single PGN filter per bus, so whenever the set of
//! live sockets changes the bus sends a FILT covering all of them and
//! narrows delivery per socket in software.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::command::{Channel, Command, OpCode};
use crate::config::{DeviceConfig, OverflowPolicy};
use crate::error::{FrameError, SocketError};
use crate::message::{Message, MessageId};
use crate::metrics::DeviceMetrics;
use crate::pgn::Pgn;
use crate::sink::MessageSink;
use crate::socket::{BufferedSocket, ReplayWindow, Socket, SocketCore, raised};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Engine,
    Implement,
}

impl BusKind {
    pub const ALL: [BusKind; 2] = [BusKind::Engine, BusKind::Implement];

    pub fn channel(self) -> Channel {
        match self {
            BusKind::Engine => Channel::Engine,
            BusKind::Implement => Channel::Implement,
        }
    }

    /// The bus a channel nibble addresses. `None` for the broadcast channel.
    pub fn from_channel(channel: Channel) -> Option<Self> {
        match channel {
            Channel::Engine => Some(BusKind::Engine),
            Channel::Implement => Some(BusKind::Implement),
            Channel::Broadcast => None,
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusKind::Engine => write!(f, "engine"),
            BusKind::Implement => write!(f, "implement"),
        }
    }
}

/// Stable handle of a socket within its bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "socket {}", self.0)
    }
}

/// Producer side of a socket's inbound queue
#[derive(Clone)]
struct Inlet {
    tx: mpsc::Sender<Message>,
    closed: watch::Receiver<bool>,
}

struct LiveEntry {
    filter: HashSet<Pgn>,
    inlet: Inlet,
}

struct BufferedEntry {
    filter: HashSet<Pgn>,
    window: ReplayWindow,
    inlet: Inlet,
    history_done: watch::Sender<bool>,
}

#[derive(Default)]
struct SocketArena {
    next_id: u64,
    live: HashMap<SocketId, LiveEntry>,
    buffered: HashMap<SocketId, BufferedEntry>,
}

impl SocketArena {
    fn allocate(&mut self) -> SocketId {
        self.next_id += 1;
        SocketId(self.next_id)
    }

    /// What the bridge must pass for every live socket to see its traffic.
    /// One unfiltered socket means the bus cannot be filtered at all.
    fn combined_filter(&self) -> HashSet<Pgn> {
        if self.live.values().any(|entry| entry.filter.is_empty()) {
            return HashSet::new();
        }
        self.live
            .values()
            .flat_map(|entry| entry.filter.iter().copied())
            .collect()
    }
}

fn accepts(filter: &HashSet<Pgn>, pgn: Pgn) -> bool {
    filter.is_empty() || filter.contains(&pgn)
}

pub struct Bus {
    kind: BusKind,
    outbound: mpsc::Sender<Command>,
    sockets: Mutex<SocketArena>,
    queue_capacity: usize,
    overflow: OverflowPolicy,
    metrics: Arc<DeviceMetrics>,
    sink: Option<Arc<dyn MessageSink>>,
}

impl Bus {
    pub(crate) fn new(
        kind: BusKind,
        outbound: mpsc::Sender<Command>,
        config: &DeviceConfig,
        metrics: Arc<DeviceMetrics>,
        sink: Option<Arc<dyn MessageSink>>,
    ) -> Self {
        Self {
            kind,
            outbound,
            sockets: Mutex::new(SocketArena::default()),
            queue_capacity: config.socket_queue_capacity.max(1),
            overflow: config.overflow_policy,
            metrics,
            sink,
        }
    }

    pub fn kind(&self) -> BusKind {
        self.kind
    }

    // Never drop a socket while holding this: closing it locks again
    fn sockets(&self) -> MutexGuard<'_, SocketArena> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn live_socket_count(&self) -> usize {
        self.sockets().live.len()
    }

    pub fn buffered_socket_count(&self) -> usize {
        self.sockets().buffered.len()
    }

    /// The filter currently requested from the bridge. Empty means unfiltered.
    pub fn combined_filter(&self) -> HashSet<Pgn> {
        self.sockets().combined_filter()
    }

    /// Open a live socket receiving `pgns` (everything when empty) and update
    /// the bridge filter for this bus.
    pub async fn connect(
        self: &Arc<Self>,
        pgns: impl IntoIterator<Item = Pgn>,
    ) -> Result<Socket, SocketError> {
        let filter: HashSet<Pgn> = pgns.into_iter().collect();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);

        // The FILT is queued under the arena lock, so filters reach the
        // bridge in the order the arena changed
        let Ok(permit) = self.outbound.reserve().await else {
            warn!("{} bus: cannot send filter, device is closed", self.kind);
            return Err(SocketError::ConnectFailed);
        };
        let (id, pgn_count) = {
            let mut sockets = self.sockets();
            let id = sockets.allocate();
            sockets.live.insert(
                id,
                LiveEntry {
                    filter: filter.clone(),
                    inlet: Inlet { tx, closed: closed_rx },
                },
            );
            let combined = sockets.combined_filter();
            let pgn_count = combined.len();
            permit.send(Command::filter(self.kind.channel(), combined));
            (id, pgn_count)
        };
        let socket = Socket::new(SocketCore::new(id, Arc::clone(self), closed_tx, rx), filter);

        info!(
            "{} bus: {} connected ({} PGNs), bridge filter now {} PGNs",
            self.kind,
            id,
            socket.filter().len(),
            pgn_count
        );
        Ok(socket)
    }

    /// Build the WRITE frame for `message` on this bus.
    pub fn encode(&self, message: &Message) -> Result<Command, FrameError> {
        Command::write(self.kind.channel(), message)
    }

    pub(crate) async fn write(&self, message: &Message) -> Result<(), SocketError> {
        let command = self
            .encode(message)
            .map_err(|_| SocketError::MessageTooLong(message.data().len()))?;
        trace!("{} bus: queueing {}", self.kind, command);
        self.outbound
            .send(command)
            .await
            .map_err(|_| SocketError::DeviceClosed)
    }

    pub(crate) fn attach_buffered(
        self: &Arc<Self>,
        window: ReplayWindow,
        filter: HashSet<Pgn>,
    ) -> BufferedSocket {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let id = {
            let mut sockets = self.sockets();
            let id = sockets.allocate();
            sockets.buffered.insert(
                id,
                BufferedEntry {
                    filter,
                    window,
                    inlet: Inlet { tx, closed: closed_rx },
                    history_done: done_tx,
                },
            );
            id
        };
        debug!("{} bus: buffered {} attached for {}", self.kind, id, window);
        BufferedSocket::new(SocketCore::new(id, Arc::clone(self), closed_tx, rx), window, done_rx)
    }

    pub(crate) fn detach(&self, id: SocketId) {
        let mut sockets = self.sockets();
        if sockets.live.remove(&id).is_none() {
            sockets.buffered.remove(&id);
            debug!("{} bus: {} detached", self.kind, id);
            return;
        }
        debug!("{} bus: {} detached", self.kind, id);
        if sockets.live.is_empty() {
            return;
        }
        match self.outbound.try_reserve() {
            Ok(permit) => permit.send(Command::filter(self.kind.channel(), sockets.combined_filter())),
            Err(e) => debug!("{} bus: filter not refreshed after closing {}: {}", self.kind, id, e),
        }
    }

    /// Forget every socket. Blocked readers wake up with `Closed`.
    pub(crate) fn detach_all(&self) {
        let mut sockets = self.sockets();
        let (live, buffered) = (sockets.live.len(), sockets.buffered.len());
        sockets.live.clear();
        sockets.buffered.clear();
        if live + buffered > 0 {
            debug!(
                "{} bus: detached {} live and {} buffered sockets",
                self.kind, live, buffered
            );
        }
    }

    /// Route one frame received for this bus.
    ///
    /// Returns the id of the decoded message, `None` for sentinels and for
    /// opcodes that carry no message.
    pub async fn handle_command(&self, command: &Command) -> Result<Option<MessageId>, FrameError> {
        match command.opcode() {
            OpCode::Mesg => {
                let Some(message) = command.decode_message()? else {
                    return Ok(None);
                };
                self.deliver_live(&message).await;
                if let Some(sink) = &self.sink {
                    sink.on_message(self.kind, &message);
                }
                Ok(message.id())
            }
            OpCode::OldMesg => match command.decode_message()? {
                Some(message) => {
                    self.deliver_history(&message).await;
                    Ok(message.id())
                }
                None => {
                    self.finish_history();
                    Ok(None)
                }
            },
            other => {
                debug!("{} bus: ignoring {} frame", self.kind, other.name());
                Ok(None)
            }
        }
    }

    async fn deliver_live(&self, message: &Message) {
        let targets: Vec<(SocketId, Inlet)> = {
            let sockets = self.sockets();
            sockets
                .live
                .iter()
                .filter(|(_, entry)| accepts(&entry.filter, message.pgn()))
                .map(|(id, entry)| (*id, entry.inlet.clone()))
                .collect()
        };
        for (id, inlet) in targets {
            self.deliver(id, inlet, message.clone()).await;
        }
    }

    async fn deliver_history(&self, message: &Message) {
        let Some(message_id) = message.id() else {
            return;
        };
        let mut out_of_window = 0;
        let targets: Vec<(SocketId, Inlet)> = {
            let sockets = self.sockets();
            let mut targets = Vec::new();
            for (id, entry) in &sockets.buffered {
                if *entry.history_done.borrow() || !accepts(&entry.filter, message.pgn()) {
                    continue;
                }
                if entry.window.contains(message_id) {
                    targets.push((*id, entry.inlet.clone()));
                } else {
                    out_of_window += 1;
                }
            }
            targets
        };

        if out_of_window > 0 {
            trace!(
                "{} bus: replayed {} outside the window of {} sockets",
                self.kind, message_id, out_of_window
            );
            for _ in 0..out_of_window {
                self.metrics.replay_out_of_window();
            }
        }
        for (id, inlet) in targets {
            self.deliver(id, inlet, message.clone()).await;
        }
    }

    fn finish_history(&self) {
        let sockets = self.sockets();
        let mut finished = 0;
        for entry in sockets.buffered.values() {
            if !entry.history_done.send_replace(true) {
                finished += 1;
            }
        }
        info!("{} bus: end of history for {} buffered sockets", self.kind, finished);
    }

    async fn deliver(&self, id: SocketId, inlet: Inlet, message: Message) {
        let Inlet { tx, closed } = inlet;
        match self.overflow {
            OverflowPolicy::DropNewest => match tx.try_send(message) {
                Ok(()) => self.metrics.message_delivered(),
                Err(TrySendError::Full(message)) => {
                    self.metrics.message_dropped();
                    debug!("{} bus: {} queue full, dropped {}", self.kind, id, message.pgn());
                }
                Err(TrySendError::Closed(_)) => {}
            },
            OverflowPolicy::Block => {
                tokio::select! {
                    biased;
                    sent = tx.send(message) => {
                        if sent.is_ok() {
                            self.metrics.message_delivered();
                        }
                    }
                    _ = raised(Some(closed)) => {}
                }
            }
        }
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sockets = self.sockets();
        f.debug_struct("Bus")
            .field("kind", &self.kind)
            .field("live", &sockets.live.len())
            .field("buffered", &sockets.buffered.len())
            .field("overflow", &self.overflow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::message::GLOBAL_ADDRESS;

    struct RecordingSink {
        seen: Mutex<Vec<(BusKind, Message)>>,
    }

    impl MessageSink for RecordingSink {
        fn on_message(&self, bus: BusKind, message: &Message) {
            self.seen.lock().unwrap().push((bus, message.clone()));
        }
    }

    fn pgn(value: u32) -> Pgn {
        Pgn::new(value).unwrap()
    }

    fn bus_with(
        config: DeviceConfig,
        sink: Option<Arc<dyn MessageSink>>,
    ) -> (Arc<Bus>, mpsc::Receiver<Command>, Arc<DeviceMetrics>) {
        let (tx, rx) = mpsc::channel(16);
        let metrics = Arc::new(DeviceMetrics::new());
        let bus = Arc::new(Bus::new(BusKind::Engine, tx, &config, Arc::clone(&metrics), sink));
        (bus, rx, metrics)
    }

    fn bus() -> (Arc<Bus>, mpsc::Receiver<Command>, Arc<DeviceMetrics>) {
        bus_with(DeviceConfig::default(), None)
    }

    fn stored(id: u32, pgn_value: u32) -> Message {
        Message::new(MessageId::new(id), 0x1C, GLOBAL_ADDRESS, pgn(pgn_value), vec![1, 2, 3], 1_000_000)
    }

    fn mesg(id: u32, pgn_value: u32) -> Command {
        Command::mesg(Channel::Engine, &stored(id, pgn_value)).unwrap()
    }

    fn old_mesg(id: u32, pgn_value: u32) -> Command {
        Command::old_mesg(Channel::Engine, &stored(id, pgn_value)).unwrap()
    }

    fn filter_of(command: Command) -> Vec<u32> {
        command
            .decode_filter()
            .unwrap()
            .into_iter()
            .map(Pgn::as_u32)
            .collect()
    }

    #[test]
    fn test_bus_kind_channels() {
        assert_eq!(BusKind::Engine.channel(), Channel::Engine);
        assert_eq!(BusKind::from_channel(Channel::Implement), Some(BusKind::Implement));
        assert_eq!(BusKind::from_channel(Channel::Broadcast), None);
        assert_eq!(BusKind::Implement.to_string(), "implement");
    }

    #[tokio::test]
    async fn test_connect_sends_union_filter() {
        let (bus, mut commands, _) = bus();

        let _a = bus.connect([pgn(0x00F004)]).await.unwrap();
        assert_eq!(filter_of(commands.recv().await.unwrap()), vec![0x00F004]);

        let _b = bus.connect([pgn(0x00F005), pgn(0x00F004)]).await.unwrap();
        assert_eq!(filter_of(commands.recv().await.unwrap()), vec![0x00F004, 0x00F005]);

        let _c = bus.connect([]).await.unwrap();
        assert_eq!(filter_of(commands.recv().await.unwrap()), Vec::<u32>::new());
        assert_eq!(bus.live_socket_count(), 3);
    }

    #[tokio::test]
    async fn test_connect_fails_when_device_gone() {
        let (bus, commands, _) = bus();
        drop(commands);
        let result = bus.connect([pgn(0x00F004)]).await;
        assert_eq!(result.unwrap_err(), SocketError::ConnectFailed);
        assert_eq!(bus.live_socket_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_queue_filters_in_order() {
        let (bus, mut commands, _) = bus();
        let drain = tokio::spawn(async move {
            let mut filters = Vec::new();
            for _ in 0..32 {
                filters.push(filter_of(commands.recv().await.unwrap()));
            }
            filters
        });

        let connects: Vec<_> = (0..32u32)
            .map(|i| {
                let bus = Arc::clone(&bus);
                tokio::spawn(async move { bus.connect([pgn(0x00F000 + i)]).await.unwrap() })
            })
            .collect();
        let mut sockets = Vec::new();
        for connect in connects {
            sockets.push(connect.await.unwrap());
        }
        let filters = drain.await.unwrap();

        // Every FILT adds exactly one PGN to the one queued before it
        for (n, filter) in filters.iter().enumerate() {
            assert_eq!(filter.len(), n + 1);
        }
        let expected: Vec<u32> = (0..32u32).map(|i| 0x00F000 + i).collect();
        assert_eq!(filters[31], expected);
        assert_eq!(sockets.len(), 32);
    }

    #[tokio::test]
    async fn test_socket_ids_are_stable() {
        let (bus, _commands, _) = bus();
        let a = bus.connect([]).await.unwrap();
        let b = bus.connect([]).await.unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        drop(a);
        let c = bus.connect([]).await.unwrap();
        assert_eq!(b.id(), b_id);
        assert_ne!(c.id(), a_id);
        assert_ne!(c.id(), b_id);
    }

    #[tokio::test]
    async fn test_mesg_delivered_per_filter() {
        let (bus, _commands, metrics) = bus();
        let f004 = bus.connect([pgn(0x00F004)]).await.unwrap();
        let f005 = bus.connect([pgn(0x00F005)]).await.unwrap();
        let all = bus.connect([]).await.unwrap();

        let id = bus.handle_command(&mesg(7, 0x00F004)).await.unwrap();
        assert_eq!(id, MessageId::new(7));

        assert_eq!(f004.read().await.unwrap(), stored(7, 0x00F004));
        assert_eq!(all.read().await.unwrap(), stored(7, 0x00F004));
        let nothing = tokio::time::timeout(Duration::from_millis(50), f005.read()).await;
        assert!(nothing.is_err());
        assert_eq!(metrics.snapshot().messages_delivered, 2);
    }

    #[tokio::test]
    async fn test_sentinel_is_not_delivered() {
        let sink = Arc::new(RecordingSink { seen: Mutex::new(Vec::new()) });
        let (bus, _commands, _) = bus_with(DeviceConfig::default(), Some(sink.clone()));
        let socket = bus.connect([]).await.unwrap();

        let unstored = Message::outgoing(GLOBAL_ADDRESS, pgn(0x00F004), Vec::new());
        let sentinel = Command::mesg(Channel::Engine, &unstored).unwrap();
        assert!(sentinel.payload().starts_with("00000000"));
        assert_eq!(bus.handle_command(&sentinel).await.unwrap(), None);

        let nothing = tokio::time::timeout(Duration::from_millis(50), socket.read()).await;
        assert!(nothing.is_err());
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_sees_every_live_message_once() {
        let sink = Arc::new(RecordingSink { seen: Mutex::new(Vec::new()) });
        let (bus, _commands, _) = bus_with(DeviceConfig::default(), Some(sink.clone()));
        let _a = bus.connect([]).await.unwrap();
        let _b = bus.connect([]).await.unwrap();

        bus.handle_command(&mesg(1, 0x00F004)).await.unwrap();
        bus.handle_command(&mesg(2, 0x00EF00)).await.unwrap();

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (BusKind::Engine, stored(1, 0x00F004)));
        assert_eq!(seen[1].1.id(), MessageId::new(2));
    }

    #[tokio::test]
    async fn test_delivery_keeps_wire_order() {
        let (bus, _commands, _) = bus();
        let socket = bus.connect([]).await.unwrap();
        for id in 1..=5 {
            bus.handle_command(&mesg(id, 0x00F004)).await.unwrap();
        }
        for id in 1..=5 {
            assert_eq!(socket.read().await.unwrap().id(), MessageId::new(id));
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let config = DeviceConfig {
            socket_queue_capacity: 2,
            ..DeviceConfig::default()
        };
        let (bus, _commands, metrics) = bus_with(config, None);
        let socket = bus.connect([]).await.unwrap();
        for id in 1..=3 {
            bus.handle_command(&mesg(id, 0x00F004)).await.unwrap();
        }
        assert_eq!(socket.read().await.unwrap().id(), MessageId::new(1));
        assert_eq!(socket.read().await.unwrap().id(), MessageId::new(2));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_delivered, 2);
        assert_eq!(snapshot.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_blocking_delivery_gives_up_on_close() {
        let config = DeviceConfig {
            socket_queue_capacity: 1,
            overflow_policy: OverflowPolicy::Block,
            ..DeviceConfig::default()
        };
        let (bus, _commands, _) = bus_with(config, None);
        let socket = bus.connect([]).await.unwrap();
        bus.handle_command(&mesg(1, 0x00F004)).await.unwrap();

        let blocked = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.handle_command(&mesg(2, 0x00F004)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        socket.close();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_refreshes_filter() {
        let (bus, mut commands, _) = bus();
        let a = bus.connect([pgn(0x00F004)]).await.unwrap();
        let b = bus.connect([pgn(0x00F005)]).await.unwrap();
        commands.recv().await.unwrap();
        commands.recv().await.unwrap();

        a.close();
        a.close();
        assert_eq!(filter_of(commands.recv().await.unwrap()), vec![0x00F005]);
        assert!(commands.try_recv().is_err());

        // Last socket gone: nothing left to filter for
        drop(b);
        assert!(commands.try_recv().is_err());
        assert_eq!(bus.live_socket_count(), 0);
    }

    #[tokio::test]
    async fn test_write_encodes_for_bus_channel() {
        let (bus, mut commands, _) = bus();
        let socket = bus.connect([]).await.unwrap();
        commands.recv().await.unwrap();

        let message = Message::outgoing(0x26, pgn(0x00EF00), vec![0xDE, 0xAD]);
        socket.write(&message).await.unwrap();
        let command = commands.recv().await.unwrap();
        assert_eq!(command.to_string(), "W00ef00260002dead");

        socket.close();
        assert_eq!(socket.write(&message).await, Err(SocketError::Closed));
    }

    #[tokio::test]
    async fn test_old_mesg_respects_window() {
        let (bus, _commands, metrics) = bus();
        let live = bus.connect([]).await.unwrap();
        let history = bus.attach_buffered(ReplayWindow::new(5, MessageId::new(42).unwrap()), HashSet::new());

        for id in [3, 10, 50] {
            assert_eq!(bus.handle_command(&old_mesg(id, 0x00F004)).await.unwrap(), MessageId::new(id));
        }
        bus.handle_command(&Command::end_of_history(Channel::Engine)).await.unwrap();

        assert_eq!(history.read().await.unwrap().id(), MessageId::new(10));
        assert_eq!(history.read().await, Err(SocketError::EndOfHistory));
        assert_eq!(history.read().await, Err(SocketError::EndOfHistory));
        assert_eq!(metrics.snapshot().replays_out_of_window, 2);

        let nothing = tokio::time::timeout(Duration::from_millis(50), live.read()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_buffered_socket_is_read_only() {
        let (bus, _commands, _) = bus();
        let history = bus.attach_buffered(ReplayWindow::new(1, MessageId::new(2).unwrap()), HashSet::new());
        let message = Message::outgoing(GLOBAL_ADDRESS, pgn(0x00F004), vec![1]);
        assert_eq!(history.write(&message).await, Err(SocketError::UnsupportedOperation));
        assert_eq!(bus.buffered_socket_count(), 1);
        drop(history);
        assert_eq!(bus.buffered_socket_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_all_wakes_readers() {
        let (bus, _commands, _) = bus();
        let socket = bus.connect([]).await.unwrap();
        let reader = tokio::spawn(async move { socket.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.detach_all();
        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(result, Err(SocketError::Closed));
    }

    #[tokio::test]
    async fn test_malformed_mesg_is_an_error() {
        let (bus, _commands, _) = bus();
        let command: Command = "M0zz".parse().unwrap();
        assert!(bus.handle_command(&command).await.is_err());
    }
}
