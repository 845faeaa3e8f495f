//! Endpoint adapter for byte streams (pipes, sockets).
//!
//! Frames are a 4-byte length prefix plus a JSON-encoded packet, so two
//! processes can speak the protocol over any `AsyncRead`/`AsyncWrite`
//! pair. Byte streams carry data only: a message with transferables is
//! refused, since a channel half cannot cross a pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::endpoint::{Endpoint, EndpointError, ListenerId, Message, MessageListener};
use crate::protocol::Packet;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .new_codec()
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StreamShared {
    listeners: Mutex<Vec<(ListenerId, MessageListener)>>,
    closed: AtomicBool,
}

/// An [`Endpoint`] over a framed byte stream.
///
/// Construction spawns the reader and writer tasks, so it must happen
/// inside a tokio runtime.
pub struct StreamEndpoint {
    outgoing: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    shared: Arc<StreamShared>,
}

impl StreamEndpoint {
    pub fn spawn<R, W>(read: R, write: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn_with_origin(read, write, String::new())
    }

    /// Stamp incoming messages with `peer_origin`, so an exposed graph can
    /// apply its allow-list to stream peers too.
    pub fn spawn_with_origin<R, W>(read: R, write: W, peer_origin: String) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(StreamShared {
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let (outgoing, mut queued) = mpsc::unbounded_channel::<Packet>();

        let mut sink = FramedWrite::new(write, frame_codec());
        tokio::spawn(async move {
            while let Some(packet) = queued.recv().await {
                let body = match serde_json::to_vec(&packet) {
                    Ok(body) => body,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                tracing::trace!(frame_bytes = body.len(), "writing frame");
                if let Err(err) = sink.send(Bytes::from(body)).await {
                    tracing::warn!(error = %err, "stream write failed");
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let mut frames = FramedRead::new(read, frame_codec());
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error = %err, "stream read failed");
                        break;
                    }
                };
                let packet: Packet = match serde_json::from_slice(&frame) {
                    Ok(packet) => packet,
                    Err(err) => {
                        // undecodable peers get no reply, only a log line
                        tracing::warn!(error = %err, "dropping undecodable frame");
                        continue;
                    }
                };
                let listeners: Vec<MessageListener> = lock_or_recover(&reader_shared.listeners)
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect();
                let mut message = Message::new(packet);
                message.origin = peer_origin.clone();
                for listener in listeners {
                    listener(message.clone());
                }
            }
            reader_shared.closed.store(true, Ordering::Release);
            tracing::debug!("stream endpoint reader finished");
        });

        Arc::new(Self {
            outgoing: Mutex::new(Some(outgoing)),
            shared,
        })
    }
}

impl Endpoint for StreamEndpoint {
    fn post_message(&self, message: Message) -> Result<(), EndpointError> {
        if !message.transfers.is_empty() {
            return Err(EndpointError::TransfersUnsupported);
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EndpointError::Closed);
        }
        let guard = lock_or_recover(&self.outgoing);
        let sender = guard.as_ref().ok_or(EndpointError::Closed)?;
        sender
            .send(message.data)
            .map_err(|_| EndpointError::Closed)
    }

    fn add_listener(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId::fresh();
        lock_or_recover(&self.shared.listeners).push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        lock_or_recover(&self.shared.listeners).retain(|(lid, _)| *lid != id);
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        lock_or_recover(&self.outgoing).take();
        lock_or_recover(&self.shared.listeners).clear();
        tracing::trace!("stream endpoint closed");
    }
}
