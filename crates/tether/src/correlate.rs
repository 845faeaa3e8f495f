//! Matches asynchronous responses back to the in-flight calls that issued
//! them.
//!
//! One registry (and one endpoint listener) exists per wrapped endpoint.
//! Replies may arrive in any order; each pending entry is keyed by request
//! id and removed on first match, so a response resolves exactly the call
//! that issued it and resolves it at most once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::endpoint::{Endpoint, ListenerId, Message};
use crate::error::{Error, Result};
use crate::protocol::{Operation, Packet, Request, RequestId, WireValue};
use crate::transfer::TransferSlots;

/// A reply as it arrived: the wire value plus the message's transfer slots.
#[derive(Debug)]
pub(crate) struct ReplyEnvelope {
    pub value: WireValue,
    pub slots: TransferSlots,
}

pub(crate) struct CorrelationRegistry {
    endpoint: Arc<dyn Endpoint>,
    pending: Arc<DashMap<RequestId, oneshot::Sender<ReplyEnvelope>>>,
    listener: ListenerId,
}

impl CorrelationRegistry {
    pub fn attach(endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        let pending: Arc<DashMap<RequestId, oneshot::Sender<ReplyEnvelope>>> =
            Arc::new(DashMap::new());
        let table = pending.clone();
        let listener = endpoint.add_listener(Arc::new(move |message: Message| {
            let Packet::Response(response) = message.data else {
                return;
            };
            match table.remove(&response.id) {
                Some((_, resolve)) => {
                    let _ = resolve.send(ReplyEnvelope {
                        value: response.value,
                        slots: TransferSlots::from(message.transfers),
                    });
                }
                None => {
                    tracing::trace!(id = %response.id, "reply with no pending call");
                }
            }
        }));
        endpoint.start();
        Arc::new(Self {
            endpoint,
            pending,
            listener,
        })
    }

    /// Post a request and await its correlated reply.
    ///
    /// With no timeout a dropped request pends forever; a timed-out call
    /// removes its own pending entry so the table does not grow.
    pub async fn send_request(
        &self,
        op: Operation,
        transfers: TransferSlots,
        timeout: Option<Duration>,
    ) -> Result<ReplyEnvelope> {
        let id = RequestId::fresh();
        let (resolve, wait) = oneshot::channel();
        self.pending.insert(id.clone(), resolve);

        tracing::trace!(id = %id, kind = op.kind(), "posting request");
        let message = Message::with_transfers(
            Packet::Request(Request { id: id.clone(), op }),
            transfers.into_vec(),
        );
        if let Err(err) = self.endpoint.post_message(message) {
            self.pending.remove(&id);
            return Err(Error::Endpoint(err));
        }

        match timeout {
            None => wait.await.map_err(|_| Error::ChannelClosed),
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(reply) => reply.map_err(|_| Error::ChannelClosed),
                Err(_) => {
                    self.pending.remove(&id);
                    Err(Error::ReplyTimeout)
                }
            },
        }
    }

    pub fn detach(&self) {
        self.endpoint.remove_listener(self.listener);
    }
}
