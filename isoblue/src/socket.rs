//! Filtered views onto one bus
//!
//! A [`Socket`] receives live traffic and can write to its bus. A
//! [`BufferedSocket`] receives replayed history within a fixed id window and
//! is read only. Both own a single-consumer inbound queue fed by their bus.
//!
//! Closing is idempotent and may race with itself: the first caller detaches
//! the socket from its bus, every blocked or later reader gets
//! [`SocketError::Closed`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, mpsc, watch};

use crate::bus::{Bus, BusKind, SocketId};
use crate::error::SocketError;
use crate::message::{Message, MessageId};
use crate::pgn::Pgn;

/// Resolves once `flag` reads true. Never resolves for `None` or once the
/// flag's sender is gone, since the flag can then no longer be raised.
pub(crate) async fn raised(flag: Option<watch::Receiver<bool>>) {
    let Some(mut flag) = flag else {
        return std::future::pending().await;
    };
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Inclusive range of message ids a buffered socket accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    pub from: u32,
    pub to: MessageId,
}

impl ReplayWindow {
    pub fn new(from: u32, to: MessageId) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, id: MessageId) -> bool {
        id.as_u32() >= self.from && id <= self.to
    }
}

impl fmt::Display for ReplayWindow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to.as_u32())
    }
}

/// State shared by both socket kinds
pub(crate) struct SocketCore {
    id: SocketId,
    bus: Arc<Bus>,
    closed: watch::Sender<bool>,
    inbound: Mutex<mpsc::Receiver<Message>>,
}

impl SocketCore {
    pub(crate) fn new(
        id: SocketId,
        bus: Arc<Bus>,
        closed: watch::Sender<bool>,
        inbound: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            id,
            bus,
            closed,
            inbound: Mutex::new(inbound),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            self.bus.detach(self.id);
        }
    }

    fn accept(&self, message: Message) -> Result<Option<Message>, SocketError> {
        // A message may slip into the queue while close() is running
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        Ok(Some(message))
    }

    /// Next queued message. `Ok(None)` once `done` is raised and the queue is drained.
    async fn next(&self, done: Option<watch::Receiver<bool>>) -> Result<Option<Message>, SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        let closed = raised(Some(self.closed.subscribe()));
        tokio::pin!(closed);

        let mut inbound = tokio::select! {
            biased;
            _ = &mut closed => return Err(SocketError::Closed),
            guard = self.inbound.lock() => guard,
        };

        loop {
            match inbound.try_recv() {
                Ok(message) => return self.accept(message),
                Err(TryRecvError::Disconnected) => return Err(SocketError::Closed),
                Err(TryRecvError::Empty) => {}
            }
            let finished = done.as_ref().is_some_and(|d| *d.borrow());
            if finished {
                return Ok(None);
            }

            tokio::select! {
                biased;
                _ = &mut closed => return Err(SocketError::Closed),
                message = inbound.recv() => {
                    return match message {
                        Some(message) => self.accept(message),
                        None => Err(SocketError::Closed),
                    };
                }
                // Go round again so anything queued before the flag is read first
                _ = raised(done.clone()) => {}
            }
        }
    }
}

/// A live, filtered connection to one bus
pub struct Socket {
    core: SocketCore,
    filter: HashSet<Pgn>,
}

impl Socket {
    pub(crate) fn new(core: SocketCore, filter: HashSet<Pgn>) -> Self {
        Self { core, filter }
    }

    pub fn id(&self) -> SocketId {
        self.core.id
    }

    pub fn bus(&self) -> BusKind {
        self.core.bus.kind()
    }

    /// PGNs this socket receives. Empty means everything on the bus.
    pub fn filter(&self) -> &HashSet<Pgn> {
        &self.filter
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Wait for the next message that passes this socket's filter.
    pub async fn read(&self) -> Result<Message, SocketError> {
        self.core.next(None).await?.ok_or(SocketError::Closed)
    }

    /// Queue `message` for transmission on this socket's bus.
    pub async fn write(&self, message: &Message) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        self.core.bus.write(message).await
    }

    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.core.id)
            .field("bus", &self.bus())
            .field("filter", &self.filter)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read-only socket fed with replayed history from the bridge
pub struct BufferedSocket {
    core: SocketCore,
    window: ReplayWindow,
    history_done: watch::Receiver<bool>,
    exhausted: AtomicBool,
}

impl BufferedSocket {
    pub(crate) fn new(core: SocketCore, window: ReplayWindow, history_done: watch::Receiver<bool>) -> Self {
        Self {
            core,
            window,
            history_done,
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SocketId {
        self.core.id
    }

    pub fn bus(&self) -> BusKind {
        self.core.bus.kind()
    }

    pub fn window(&self) -> ReplayWindow {
        self.window
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Next replayed message, or [`SocketError::EndOfHistory`] once the
    /// bridge has sent everything and the queue is drained.
    pub async fn read(&self) -> Result<Message, SocketError> {
        if self.exhausted.load(Ordering::Acquire) {
            return Err(SocketError::EndOfHistory);
        }
        match self.core.next(Some(self.history_done.clone())).await? {
            Some(message) => Ok(message),
            None => {
                self.exhausted.store(true, Ordering::Release);
                Err(SocketError::EndOfHistory)
            }
        }
    }

    /// Always fails: history cannot be written.
    pub async fn write(&self, _message: &Message) -> Result<(), SocketError> {
        Err(SocketError::UnsupportedOperation)
    }

    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for BufferedSocket {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl fmt::Debug for BufferedSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferedSocket")
            .field("id", &self.core.id)
            .field("bus", &self.bus())
            .field("window", &self.window)
            .field("closed", &self.is_closed())
            .finish()
    }
}
