//! Channel abstraction between isolated execution contexts.
//!
//! An [`Endpoint`] is anything that can post a message and deliver incoming
//! ones to registered listeners. [`MessageChannel`] provides the in-process
//! implementation: an entangled pair of [`MessagePort`]s that buffer until
//! started, used both by tests and by the proxy transfer handler for the
//! private sub-channels it opens.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::protocol::Packet;

pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One message crossing an endpoint: the packet plus any transferables
/// that move with it.
#[derive(Debug, Clone)]
pub struct Message {
    /// Where the message came from, as stamped by the sending channel.
    /// Empty for channels without an origin concept.
    pub origin: String,
    pub data: Packet,
    pub transfers: Vec<Transferable>,
}

impl Message {
    pub fn new(data: Packet) -> Self {
        Self::with_transfers(data, Vec::new())
    }

    pub fn with_transfers(data: Packet, transfers: Vec<Transferable>) -> Self {
        Self {
            origin: String::new(),
            data,
            transfers,
        }
    }
}

/// A payload that moves, never copies, across the channel.
#[derive(Clone)]
pub enum Transferable {
    Port(MessagePort),
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(_) => f.write_str("Transferable::Port"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint is closed")]
    Closed,

    #[error("this endpoint cannot carry transferables")]
    TransfersUnsupported,
}

/// Duck-typed channel contract.
///
/// `start` and `close` have defaults because only some channel kinds
/// buffer or tear down.
pub trait Endpoint: Send + Sync {
    fn post_message(&self, message: Message) -> Result<(), EndpointError>;

    fn add_listener(&self, listener: MessageListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Begin delivering buffered messages.
    fn start(&self) {}

    /// Tear the channel down. Posting afterwards fails; pending deliveries
    /// are dropped.
    fn close(&self) {}
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PortState {
    listeners: Mutex<Vec<(ListenerId, MessageListener)>>,
    buffer: Mutex<Vec<Message>>,
    started: AtomicBool,
    closed: AtomicBool,
    origin: Mutex<String>,
    peer: OnceLock<Weak<PortState>>,
}

impl PortState {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            buffer: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            origin: Mutex::new(String::new()),
            peer: OnceLock::new(),
        }
    }

    fn deliver(&self, message: Message) {
        if self.closed.load(Ordering::Acquire) {
            tracing::trace!("message dropped: port closed");
            return;
        }
        if !self.started.load(Ordering::Acquire) {
            lock_or_recover(&self.buffer).push(message);
            return;
        }
        // snapshot so a listener may add or remove listeners while running
        let listeners: Vec<MessageListener> = lock_or_recover(&self.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(message.clone());
        }
    }
}

/// One half of an entangled in-process channel pair.
///
/// Clones are handles to the same half. Messages posted before the
/// receiving half has started are buffered.
#[derive(Clone)]
pub struct MessagePort {
    state: Arc<PortState>,
}

impl MessagePort {
    /// Stamp outgoing messages with an origin, the way a window-backed
    /// channel would. In-process ports default to an empty origin.
    pub fn set_origin(&self, origin: impl Into<String>) {
        *lock_or_recover(&self.state.origin) = origin.into();
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("started", &self.state.started.load(Ordering::Relaxed))
            .field("closed", &self.state.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Endpoint for MessagePort {
    fn post_message(&self, mut message: Message) -> Result<(), EndpointError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(EndpointError::Closed);
        }
        message.origin = lock_or_recover(&self.state.origin).clone();
        let peer = self
            .state
            .peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or(EndpointError::Closed)?;
        peer.deliver(message);
        Ok(())
    }

    fn add_listener(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId::fresh();
        lock_or_recover(&self.state.listeners).push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        lock_or_recover(&self.state.listeners).retain(|(lid, _)| *lid != id);
    }

    fn start(&self) {
        if self.state.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let buffered = std::mem::take(&mut *lock_or_recover(&self.state.buffer));
        for message in buffered {
            self.state.deliver(message);
        }
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        lock_or_recover(&self.state.buffer).clear();
        lock_or_recover(&self.state.listeners).clear();
        tracing::trace!("port closed");
    }
}

/// Factory for entangled port pairs.
pub struct MessageChannel;

impl MessageChannel {
    pub fn new() -> (MessagePort, MessagePort) {
        let a = Arc::new(PortState::new());
        let b = Arc::new(PortState::new());
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (MessagePort { state: a }, MessagePort { state: b })
    }
}
