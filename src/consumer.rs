// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Consumer Streams
//!
//! A consumer is a long-lived subscription to one queue. Deliveries flow from
//! the underlying lapin consumer into a bounded event stream the worker reads
//! from, preserving broker order and pushing back through prefetch. The
//! stream is restartable: when the channel serving a consumer dies while the
//! handle is still active, the broker rewires the subscription onto a fresh
//! channel and the stream emits a [`ConsumerEvent::Resumed`] signal so the
//! worker knows the channel identity changed. In-flight deliveries from the
//! dead channel are lost and redelivered by the broker.

use lapin::acker::Acker;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::BrokerInner;
use crate::errors::AmqpError;
use crate::job::JobRequest;

/// A message received from a queue.
pub struct Delivery {
    /// The decoded job envelope, or the decode error for a malformed body
    pub envelope: Result<JobRequest, AmqpError>,
    /// Queue the message was consumed from
    pub queue: String,
    /// Per-channel delivery tag, used for acknowledgement
    pub delivery_tag: u64,
    /// Identity of the channel the message arrived on
    pub channel_id: u16,
    /// Whether the broker flagged the message as redelivered
    pub redelivered: bool,
    /// The undecoded body, kept only when envelope decoding failed so the
    /// worker can still identify the job and route it to its error exchange
    pub(crate) raw_body: Option<Vec<u8>>,
    acker: Acker,
}

impl Delivery {
    pub(crate) fn new(lapin: LapinDelivery, queue: &str, channel_id: u16) -> Delivery {
        let (envelope, raw_body) = match JobRequest::decode(&lapin.data) {
            Ok(mut request) => {
                request.delivery_tag = Some(lapin.delivery_tag);
                if request.correlation_id.is_none() {
                    request.correlation_id = lapin
                        .properties
                        .correlation_id()
                        .as_ref()
                        .map(|id| id.to_string());
                }
                (Ok(request), None)
            }
            Err(err) => (Err(err), Some(lapin.data)),
        };

        Delivery {
            envelope,
            raw_body,
            queue: queue.to_owned(),
            delivery_tag: lapin.delivery_tag,
            channel_id,
            redelivered: lapin.redelivered,
            acker: lapin.acker,
        }
    }

    /// Acknowledges the delivery on the channel it arrived on.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                warn!(
                    error = err.to_string(),
                    queue = self.queue,
                    "error acking message, its channel may be gone"
                );
                AmqpError::InternalError(err.to_string())
            })
    }

    /// Rejects the delivery without requeueing it.
    pub async fn reject(&self) -> Result<(), AmqpError> {
        self.nack(false).await
    }

    /// Negatively acknowledges the delivery.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                warn!(
                    error = err.to_string(),
                    queue = self.queue,
                    "error nacking message, its channel may be gone"
                );
                AmqpError::InternalError(err.to_string())
            })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("channel_id", &self.channel_id)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// An event on a consumer stream.
#[derive(Debug)]
pub enum ConsumerEvent {
    /// A message arrived
    Delivery(Delivery),
    /// The consumer was rewired onto a fresh channel after its channel died
    Resumed {
        /// Identity of the new channel serving the consumer
        channel_id: u16,
    },
}

/// Shared state of one consumer subscription.
///
/// Entries live in the broker's consumer registry, keyed by the channel
/// currently serving them; the pump task and the handle share them through
/// `Arc`, so neither side owns the channel relation.
pub(crate) struct ConsumerEntry {
    pub(crate) id: Uuid,
    pub(crate) queue: String,
    pub(crate) prefetch: u16,
    tag: Mutex<String>,
    active: AtomicBool,
    paused: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<ConsumerEvent>>>,
    pending: Mutex<Option<(u16, lapin::Consumer)>>,
    wakeup: Notify,
}

impl ConsumerEntry {
    pub(crate) fn new(
        queue: &str,
        prefetch: u16,
        tag: String,
        sender: mpsc::Sender<ConsumerEvent>,
    ) -> ConsumerEntry {
        ConsumerEntry {
            id: Uuid::new_v4(),
            queue: queue.to_owned(),
            prefetch,
            tag: Mutex::new(tag),
            active: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(None),
            wakeup: Notify::new(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn tag(&self) -> String {
        self.tag.lock().unwrap().clone()
    }

    pub(crate) fn set_tag(&self, tag: String) {
        *self.tag.lock().unwrap() = tag;
    }

    /// Hands a replacement lapin consumer to the pump task.
    pub(crate) fn stash_consumer(&self, channel_id: u16, consumer: lapin::Consumer) {
        *self.pending.lock().unwrap() = Some((channel_id, consumer));
        self.wakeup.notify_one();
    }

    pub(crate) fn take_consumer(&self) -> Option<(u16, lapin::Consumer)> {
        self.pending.lock().unwrap().take()
    }

    /// Sends an event downstream, returning false when the stream is gone.
    pub(crate) async fn emit(&self, event: ConsumerEvent) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Ends the downstream stream.
    pub(crate) fn close_stream(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl fmt::Debug for ConsumerEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConsumerEntry")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("prefetch", &self.prefetch)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Handle to one consumer subscription.
///
/// The handle exposes the event stream and the cancel operation. Dropping the
/// handle does not cancel the subscription; call [`ConsumerHandle::cancel`].
pub struct ConsumerHandle {
    pub(crate) entry: Arc<ConsumerEntry>,
    pub(crate) broker: Weak<BrokerInner>,
    events: Option<mpsc::Receiver<ConsumerEvent>>,
}

impl ConsumerHandle {
    pub(crate) fn new(
        entry: Arc<ConsumerEntry>,
        broker: Weak<BrokerInner>,
        events: mpsc::Receiver<ConsumerEvent>,
    ) -> ConsumerHandle {
        ConsumerHandle {
            entry,
            broker,
            events: Some(events),
        }
    }

    /// The queue this consumer is subscribed to.
    pub fn queue(&self) -> &str {
        &self.entry.queue
    }

    /// The prefetch requested for this consumer.
    pub fn prefetch(&self) -> u16 {
        self.entry.prefetch
    }

    /// Whether the subscription is still active.
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Receives the next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ConsumerEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Takes the event stream out of the handle.
    ///
    /// Used by the worker to drive the stream from its own task while the
    /// handle is kept around for cancellation. Returns `None` if the stream
    /// was already taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ConsumerEvent>> {
        self.events.take()
    }

    /// Cancels the subscription.
    ///
    /// Sends basic.cancel, removes the consumer from the registry and ends
    /// the event stream. If this was the last consumer on its channel, the
    /// channel is closed.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        match self.broker.upgrade() {
            Some(broker) => broker.cancel_entry(&self.entry).await,
            None => {
                self.entry.deactivate();
                self.entry.close_stream();
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("entry", &self.entry)
            .finish()
    }
}

/// Forwards deliveries from the lapin consumer into the event stream.
///
/// The task outlives individual channels: when the lapin stream ends while
/// the entry is still active, it asks the broker to rewire the subscription
/// and continues on the replacement consumer.
pub(crate) async fn pump(
    entry: Arc<ConsumerEntry>,
    broker: Weak<BrokerInner>,
    mut channel_id: u16,
    mut consumer: lapin::Consumer,
) {
    use futures_util::StreamExt;

    loop {
        while let Some(item) = consumer.next().await {
            match item {
                Ok(delivery) => {
                    let event =
                        ConsumerEvent::Delivery(Delivery::new(delivery, &entry.queue, channel_id));
                    if !entry.emit(event).await {
                        // Downstream is gone, tear the subscription down.
                        debug!(queue = entry.queue, "consumer stream dropped, cancelling");
                        if let Some(broker) = broker.upgrade() {
                            let _ = broker.cancel_entry(&entry).await;
                        } else {
                            entry.deactivate();
                        }
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        queue = entry.queue,
                        channel = channel_id,
                        "consumer stream error"
                    );
                    break;
                }
            }
        }

        if !entry.is_active() {
            return;
        }

        if entry.is_paused() {
            // Wait for resume_queue to hand over a fresh subscription.
            loop {
                if let Some((id, fresh)) = entry.take_consumer() {
                    channel_id = id;
                    consumer = fresh;
                    break;
                }
                if !entry.is_active() {
                    return;
                }
                entry.wakeup.notified().await;
            }
            continue;
        }

        let Some(broker) = broker.upgrade() else {
            entry.close_stream();
            return;
        };
        match broker.recover_consumer(&entry, channel_id).await {
            Some((id, fresh)) => {
                channel_id = id;
                consumer = fresh;
            }
            None => {
                entry.close_stream();
                return;
            }
        }
    }
}
