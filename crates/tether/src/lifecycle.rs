//! Reference counting for remote handles.
//!
//! Every handle wrapped from one endpoint shares a `RefLifecycle`. The
//! count reaching zero sends a single RELEASE, awaits the ack, closes the
//! channel and detaches the reply listener. Explicit `release()` is the
//! primary path; dropping the last handle funnels into the same decrement
//! and finishes in the background when a runtime is available.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::codec::WireCodec;
use crate::correlate::CorrelationRegistry;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::protocol::Operation;
use crate::proxy::WrapOptions;
use crate::transfer::TransferSlots;
use crate::value::Value;

pub(crate) struct RefLifecycle {
    endpoint: Arc<dyn Endpoint>,
    correlation: Arc<CorrelationRegistry>,
    codec: WireCodec,
    options: WrapOptions,
    count: AtomicUsize,
    finished: AtomicBool,
}

impl RefLifecycle {
    pub fn attach(endpoint: Arc<dyn Endpoint>, options: WrapOptions) -> Arc<Self> {
        let correlation = CorrelationRegistry::attach(endpoint.clone());
        let codec = WireCodec::with_handlers(options.handlers.clone());
        Arc::new(Self {
            endpoint,
            correlation,
            codec,
            options,
            count: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        })
    }

    pub fn codec(&self) -> &WireCodec {
        &self.codec
    }

    pub fn register(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Post a request, await the correlated reply, and decode it.
    pub async fn round_trip(&self, op: Operation, slots: TransferSlots) -> Result<Value> {
        let reply = self
            .correlation
            .send_request(op, slots, self.options.reply_timeout)
            .await?;
        self.codec.from_wire(reply.value, &reply.slots)
    }

    /// Explicit release: the last handle tears the channel down and
    /// reports how that went.
    pub async fn release_one(&self) -> Result<()> {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish().await?;
        }
        Ok(())
    }

    /// Drop path: decrement now, finish in the background.
    pub fn forget(self: Arc<Self>) {
        if self.count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = self.finish().await {
                        tracing::debug!(error = %err, "auto-release failed");
                    }
                });
            }
            Err(_) => {
                tracing::debug!("no runtime for auto-release; endpoint left open");
            }
        }
    }

    async fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let outcome = self
            .correlation
            .send_request(
                Operation::Release { path: Vec::new() },
                TransferSlots::new(),
                self.options.reply_timeout,
            )
            .await;
        self.correlation.detach();
        self.endpoint.close();
        tracing::debug!("wrapped endpoint released");
        outcome.map(|_| ())
    }
}
