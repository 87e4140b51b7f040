// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Broker Façade
//!
//! The broker owns the single AMQP connection and everything layered on it:
//! the channel pool, topology declaration, flow-controlled publishing, and
//! the consumer registry with its rewire protocol.
//!
//! ## Connect
//!
//! `connect()` dials with retry and opens the pool. Concurrent calls join the
//! same in-flight attempt, so the connection is established exactly once no
//! matter how many tasks race on startup.
//!
//! ## Publish flow control
//!
//! `publish()` returns `true` when the message was queued without
//! back-pressure and `false` when the outgoing publish window was saturated.
//! The message is queued either way; a well-behaved producer treats `false`
//! as a signal to pause.
//!
//! ## Rewire
//!
//! Consumers are registered under the channel serving them. When that channel
//! dies, every still-active consumer on it is moved to a fresh channel:
//! prefetch is reapplied, basic.consume is reissued under a new tag, the
//! registry entry moves atomically and the consumer stream emits a single
//! `Resumed` event. A dead channel with no active consumers is benign and no
//! rewire happens.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::connect_with_retry;
use crate::config::ConnectionParams;
use crate::consumer::{pump, ConsumerEntry, ConsumerEvent, ConsumerHandle};
use crate::errors::AmqpError;
use crate::exchange::ExchangeDefinition;
use crate::pool::ChannelPool;
use crate::publisher::{Publication, Publish};
use crate::queue::{QueueBinding, QueueDefinition};
use crate::topology::Topology;

/// Size of the outgoing publish window. Publishes beyond this many in-flight
/// frame writes report back-pressure.
const PUBLISH_WINDOW: usize = 128;

type ConnectFuture = Shared<BoxFuture<'static, Result<(), AmqpError>>>;

enum ConnectState {
    Idle,
    Connecting(ConnectFuture),
    Running,
}

/// Consumers currently served by one channel.
struct ChannelConsumers {
    channel: Channel,
    entries: Vec<Arc<ConsumerEntry>>,
}

#[derive(Default)]
struct ConsumerRegistry {
    channels: HashMap<u16, ChannelConsumers>,
}

impl ConsumerRegistry {
    fn find_channel_of(&self, entry_id: Uuid) -> Option<u16> {
        self.channels
            .iter()
            .find(|(_, group)| group.entries.iter().any(|e| e.id == entry_id))
            .map(|(id, _)| *id)
    }

    fn least_loaded(&self) -> Option<u16> {
        self.channels
            .iter()
            .min_by_key(|(_, group)| group.entries.len())
            .map(|(id, _)| *id)
    }

    /// Sum of prefetches of active consumers on one channel.
    fn prefetch_sum(&self, channel_id: u16) -> u16 {
        self.channels
            .get(&channel_id)
            .map(|group| {
                group
                    .entries
                    .iter()
                    .filter(|e| e.is_active())
                    .map(|e| e.prefetch)
                    .sum()
            })
            .unwrap_or(0)
    }
}

pub(crate) struct BrokerInner {
    params: ConnectionParams,
    connect_state: StdMutex<ConnectState>,
    connection: StdMutex<Option<Arc<Connection>>>,
    pool: StdMutex<Option<Arc<ChannelPool>>>,
    consumers: Mutex<ConsumerRegistry>,
    publish_window: Arc<Semaphore>,
}

/// Façade over one AMQP connection.
///
/// Cloning is cheap; every clone drives the same connection, pool and
/// consumer registry.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Creates a broker for the given connection parameters.
    ///
    /// No I/O happens until [`Broker::connect`] is called.
    pub fn new(params: ConnectionParams) -> Broker {
        Broker {
            inner: Arc::new(BrokerInner {
                params,
                connect_state: StdMutex::new(ConnectState::Idle),
                connection: StdMutex::new(None),
                pool: StdMutex::new(None),
                consumers: Mutex::new(ConsumerRegistry::default()),
                publish_window: Arc::new(Semaphore::new(PUBLISH_WINDOW)),
            }),
        }
    }

    /// The connection parameters this broker was built with.
    pub fn params(&self) -> &ConnectionParams {
        &self.inner.params
    }

    /// Whether the broker is connected and ready.
    pub fn is_running(&self) -> bool {
        matches!(
            *self.inner.connect_state.lock().unwrap(),
            ConnectState::Running
        )
    }

    /// The channel pool, once the broker is running.
    pub fn pool(&self) -> Result<Arc<ChannelPool>, AmqpError> {
        self.inner.pool()
    }

    /// Dials the broker and opens the channel pool.
    ///
    /// The dial is retried per the connection parameters. Calling `connect`
    /// while an attempt is already in flight joins that attempt; calling it
    /// on a running broker returns immediately.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let attempt = {
            let mut state = self.inner.connect_state.lock().unwrap();
            match &*state {
                ConnectState::Running => return Ok(()),
                ConnectState::Connecting(attempt) => attempt.clone(),
                ConnectState::Idle => {
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move { BrokerInner::establish(inner).await }
                        .boxed()
                        .shared();
                    *state = ConnectState::Connecting(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.await;

        let mut state = self.inner.connect_state.lock().unwrap();
        if matches!(*state, ConnectState::Connecting(_)) {
            *state = match result {
                Ok(()) => ConnectState::Running,
                Err(_) => ConnectState::Idle,
            };
        }

        result
    }

    /// Asserts the given queues.
    pub async fn queues(&self, defs: &[QueueDefinition]) -> Result<(), AmqpError> {
        Topology::new(self.inner.pool()?).queues(defs).await
    }

    /// Asserts the given exchanges.
    pub async fn exchanges(&self, defs: &[ExchangeDefinition]) -> Result<(), AmqpError> {
        Topology::new(self.inner.pool()?).exchanges(defs).await
    }

    /// Asserts the given bindings.
    pub async fn bindings(&self, bindings: &[QueueBinding]) -> Result<(), AmqpError> {
        Topology::new(self.inner.pool()?).bindings(bindings).await
    }

    /// Returns the number of messages sitting in a queue.
    pub async fn check_queue(&self, name: &str) -> Result<u32, AmqpError> {
        Topology::new(self.inner.pool()?).check_queue(name).await
    }

    /// Starts a consumer on the given queue.
    ///
    /// The consumer is served by a channel dedicated to consuming for its
    /// whole lifetime. Once as many consume channels exist as the pool size,
    /// further consumers co-reside on the least loaded channel; prefetch is
    /// applied per consumer, so the channel's outstanding budget is the sum
    /// of its consumers' prefetches.
    ///
    /// # Parameters
    /// * `queue` - The queue to subscribe to
    /// * `prefetch` - Per-consumer prefetch, falls back to the connection
    ///   default
    ///
    /// # Returns
    /// A handle exposing the event stream and the cancel operation.
    pub async fn consume(
        &self,
        queue: &str,
        prefetch: Option<u16>,
    ) -> Result<ConsumerHandle, AmqpError> {
        let connection = self.inner.connection()?;
        let prefetch = prefetch.unwrap_or(self.inner.params.prefetch);

        let mut registry = self.inner.consumers.lock().await;

        let channel = if registry.channels.len() < self.inner.params.pool_size {
            connection
                .create_channel()
                .await
                .map_err(|err| AmqpError::ChannelError(err.to_string()))?
        } else {
            let id = registry
                .least_loaded()
                .ok_or_else(|| AmqpError::InternalError("no consume channel".into()))?;
            registry.channels[&id].channel.clone()
        };
        let channel_id = channel.id();

        channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    channel = channel_id,
                    "error configuring qos"
                );
                AmqpError::QosError(channel_id)
            })?;

        let tag = consumer_tag(queue);
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error starting consumer");
                AmqpError::ConsumerError(queue.to_owned(), err.to_string())
            })?;

        let (sender, events) = tokio::sync::mpsc::channel(prefetch.max(1) as usize);
        let entry = Arc::new(ConsumerEntry::new(queue, prefetch, tag, sender));

        registry
            .channels
            .entry(channel_id)
            .or_insert_with(|| ChannelConsumers {
                channel: channel.clone(),
                entries: vec![],
            })
            .entries
            .push(Arc::clone(&entry));

        debug!(
            queue,
            channel = channel_id,
            prefetch,
            channel_prefetch = registry.prefetch_sum(channel_id),
            "consumer registered"
        );

        tokio::spawn(pump(
            Arc::clone(&entry),
            Arc::downgrade(&self.inner),
            channel_id,
            consumer,
        ));

        Ok(ConsumerHandle::new(
            entry,
            Arc::downgrade(&self.inner),
            events,
        ))
    }

    /// Starts one consumer per queue name.
    ///
    /// Queue names may repeat; each occurrence gets its own consumer. The
    /// consumers are distributed across consume channels up to the pool size.
    pub async fn consume_over(
        &self,
        queues: impl IntoIterator<Item = impl AsRef<str>>,
        prefetch: Option<u16>,
    ) -> Result<Vec<ConsumerHandle>, AmqpError> {
        let mut handles = vec![];
        for queue in queues {
            handles.push(self.consume(queue.as_ref(), prefetch).await?);
        }
        Ok(handles)
    }

    /// Queues a message, returning the flow-control indicator.
    ///
    /// See [`Publish::publish`].
    pub async fn publish(&self, message: Publication) -> Result<bool, AmqpError> {
        Publish::publish(self, message).await
    }

    /// Publishes a message and waits for it to be written out.
    pub async fn publish_confirmed(&self, message: Publication) -> Result<(), AmqpError> {
        Publish::publish_confirmed(self, message).await
    }

    /// Stops delivering from the given queue without dropping subscriptions.
    ///
    /// Consumers on the queue are cancelled on the broker but stay
    /// registered; [`Broker::resume_queue`] re-issues basic.consume on their
    /// channel.
    pub async fn pause_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.inner.connection()?;
        let registry = self.inner.consumers.lock().await;

        for group in registry.channels.values() {
            for entry in &group.entries {
                if entry.queue != queue || !entry.is_active() || entry.is_paused() {
                    continue;
                }
                entry.set_paused(true);
                let tag = entry.tag();
                if let Err(err) = group
                    .channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await
                {
                    warn!(error = err.to_string(), queue, "error pausing consumer");
                }
            }
        }
        info!(queue, "queue paused");
        Ok(())
    }

    /// Resumes delivery from a paused queue.
    pub async fn resume_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.inner.connection()?;
        let registry = self.inner.consumers.lock().await;

        for group in registry.channels.values() {
            for entry in &group.entries {
                if entry.queue != queue || !entry.is_active() || !entry.is_paused() {
                    continue;
                }
                group
                    .channel
                    .basic_qos(entry.prefetch, BasicQosOptions { global: false })
                    .await
                    .map_err(|_| AmqpError::QosError(group.channel.id()))?;
                let tag = consumer_tag(queue);
                let consumer = group
                    .channel
                    .basic_consume(
                        queue,
                        &tag,
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), queue, "error resuming consumer");
                        AmqpError::ConsumerError(queue.to_owned(), err.to_string())
                    })?;
                entry.set_tag(tag);
                entry.set_paused(false);
                entry.stash_consumer(group.channel.id(), consumer);
            }
        }
        info!(queue, "queue resumed");
        Ok(())
    }

    /// Cancels every registered consumer.
    pub async fn cancel_all_consumers(&self) -> Result<(), AmqpError> {
        self.inner.connection()?;
        let groups = {
            let mut registry = self.inner.consumers.lock().await;
            std::mem::take(&mut registry.channels)
        };

        for (channel_id, group) in groups {
            for entry in &group.entries {
                entry.deactivate();
                let tag = entry.tag();
                if let Err(err) = group
                    .channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await
                {
                    debug!(
                        error = err.to_string(),
                        queue = entry.queue,
                        "error cancelling consumer during shutdown"
                    );
                }
                entry.close_stream();
            }
            if let Err(err) = group.channel.close(200, "no consumers remaining").await {
                debug!(
                    error = err.to_string(),
                    channel = channel_id,
                    "error closing consume channel"
                );
            }
        }
        Ok(())
    }

    /// Shuts the broker down.
    ///
    /// Cancels every consumer, waits up to `timeout_ms` for in-flight
    /// publishes to drain, then closes the pool and the connection. Fails
    /// with a precondition error when the broker never connected, and with a
    /// pool error when the connection exists but the pool was never opened.
    pub async fn shutdown(&self, timeout_ms: u64) -> Result<(), AmqpError> {
        let connection = self.inner.connection()?;
        let pool = self.inner.pool()?;

        self.cancel_all_consumers().await?;

        let window = Arc::clone(&self.inner.publish_window);
        let drained = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            window.acquire_many(PUBLISH_WINDOW as u32),
        )
        .await;
        match drained {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                timeout_ms,
                "in-flight publishes did not drain before shutdown timeout"
            ),
        }
        self.inner.publish_window.close();

        pool.close().await;
        *self.inner.pool.lock().unwrap() = None;
        *self.inner.connection.lock().unwrap() = None;
        *self.inner.connect_state.lock().unwrap() = ConnectState::Idle;

        if let Err(err) = connection.close(200, "shutdown").await {
            debug!(error = err.to_string(), "error closing connection");
        }
        info!("broker shut down");
        Ok(())
    }
}

#[async_trait]
impl Publish for Broker {
    async fn publish(&self, message: Publication) -> Result<bool, AmqpError> {
        self.inner.connection()?;
        let pool = self.inner.pool()?;

        let (permit, accepted) = match Arc::clone(&self.inner.publish_window).try_acquire_owned() {
            Ok(permit) => (permit, true),
            Err(_) => {
                debug!(
                    exchange = message.exchange,
                    routing_key = message.routing_key,
                    "publish window saturated, applying back-pressure"
                );
                let permit = Arc::clone(&self.inner.publish_window)
                    .acquire_owned()
                    .await
                    .map_err(|_| AmqpError::PoolClosed)?;
                (permit, false)
            }
        };

        tokio::spawn(async move {
            let _permit = permit;
            let result = pool
                .acquire_and_run(|channel| {
                    let message = &message;
                    async move {
                        channel
                            .basic_publish(
                                &message.exchange,
                                &message.routing_key,
                                BasicPublishOptions::default(),
                                &message.body,
                                message.properties(),
                            )
                            .await
                            .map_err(|err| {
                                AmqpError::PublishingError(
                                    message.exchange.clone(),
                                    err.to_string(),
                                )
                            })?;
                        Ok(())
                    }
                })
                .await;
            if let Err(err) = result {
                error!(error = err.to_string(), "queued publish failed");
            }
        });

        Ok(accepted)
    }

    async fn publish_confirmed(&self, message: Publication) -> Result<(), AmqpError> {
        self.inner.connection()?;
        let pool = self.inner.pool()?;

        pool.acquire_and_run(|channel| {
            let message = &message;
            async move {
                let confirm = channel
                    .basic_publish(
                        &message.exchange,
                        &message.routing_key,
                        BasicPublishOptions::default(),
                        &message.body,
                        message.properties(),
                    )
                    .await
                    .map_err(|err| {
                        AmqpError::PublishingError(message.exchange.clone(), err.to_string())
                    })?;
                confirm.await.map_err(|err| {
                    AmqpError::PublishingError(message.exchange.clone(), err.to_string())
                })?;
                Ok(())
            }
        })
        .await
    }
}

impl BrokerInner {
    async fn establish(inner: Arc<BrokerInner>) -> Result<(), AmqpError> {
        let connection = Arc::new(connect_with_retry(&inner.params).await?);
        *inner.connection.lock().unwrap() = Some(Arc::clone(&connection));

        let pool = match ChannelPool::open(Arc::clone(&connection), inner.params.pool_size).await {
            Ok(pool) => pool,
            Err(err) => {
                // A retried connect overwrites the connection slot; close the
                // dialed connection now or it is never closed at all.
                if let Err(close_err) = connection.close(200, "pool initialization failed").await {
                    debug!(
                        error = close_err.to_string(),
                        "error closing connection after failed pool open"
                    );
                }
                return Err(err);
            }
        };
        *inner.pool.lock().unwrap() = Some(pool);

        info!(
            host = %inner.params.host,
            pool_size = inner.params.pool_size,
            "broker connected"
        );
        Ok(())
    }

    pub(crate) fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        self.connection
            .lock()
            .unwrap()
            .clone()
            .ok_or(AmqpError::NotRunning)
    }

    pub(crate) fn pool(&self) -> Result<Arc<ChannelPool>, AmqpError> {
        if self.connection.lock().unwrap().is_none() {
            return Err(AmqpError::NotRunning);
        }
        self.pool
            .lock()
            .unwrap()
            .clone()
            .ok_or(AmqpError::PoolNotInitialized)
    }

    /// Moves the consumers of a dead channel onto a fresh one.
    ///
    /// Called by the pump task whose lapin stream ended. The first caller for
    /// a given dead channel performs the rewire for every active entry on it
    /// and stashes the replacement consumers; later callers pick theirs up.
    /// Returns this entry's replacement, or `None` when there is nothing to
    /// resume (entry cancelled, connection gone, or rewire failed).
    pub(crate) async fn recover_consumer(
        &self,
        entry: &Arc<ConsumerEntry>,
        dead_channel: u16,
    ) -> Option<(u16, lapin::Consumer)> {
        if let Some(replacement) = entry.take_consumer() {
            return Some(replacement);
        }

        let connection = match self.connection() {
            Ok(connection) => connection,
            Err(_) => return None,
        };
        if !connection.status().connected() {
            debug!(
                queue = entry.queue,
                "connection is gone, not rewiring consumer"
            );
            return None;
        }

        let mut registry = self.consumers.lock().await;

        // A concurrent caller may have rewired us while we waited.
        if let Some(replacement) = entry.take_consumer() {
            return Some(replacement);
        }
        if !entry.is_active() {
            return None;
        }

        let Some(group) = registry.channels.remove(&dead_channel) else {
            return None;
        };
        let survivors: Vec<Arc<ConsumerEntry>> = group
            .entries
            .into_iter()
            .filter(|e| e.is_active())
            .collect();
        if survivors.is_empty() {
            debug!(channel = dead_channel, "channel loss with no active consumers");
            return None;
        }

        info!(
            channel = dead_channel,
            consumers = survivors.len(),
            "channel lost, rewiring consumers"
        );

        let fresh = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    channel = dead_channel,
                    "could not open replacement channel, consumers are lost"
                );
                for survivor in &survivors {
                    survivor.deactivate();
                    survivor.close_stream();
                }
                return None;
            }
        };
        let fresh_id = fresh.id();

        let mut mine = None;
        let mut rewired = vec![];
        for survivor in survivors {
            if let Err(err) = fresh
                .basic_qos(survivor.prefetch, BasicQosOptions { global: false })
                .await
            {
                error!(
                    error = err.to_string(),
                    queue = survivor.queue,
                    "error reapplying prefetch during rewire"
                );
                survivor.deactivate();
                survivor.close_stream();
                continue;
            }

            let tag = consumer_tag(&survivor.queue);
            match fresh
                .basic_consume(
                    &survivor.queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => {
                    survivor.set_tag(tag);
                    if survivor.id == entry.id {
                        mine = Some((fresh_id, consumer));
                    } else {
                        survivor.stash_consumer(fresh_id, consumer);
                    }
                    survivor
                        .emit(ConsumerEvent::Resumed {
                            channel_id: fresh_id,
                        })
                        .await;
                    rewired.push(survivor);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = survivor.queue,
                        "error re-consuming during rewire"
                    );
                    survivor.deactivate();
                    survivor.close_stream();
                }
            }
        }

        if rewired.is_empty() {
            let _ = fresh.close(200, "rewire produced no consumers").await;
            return mine;
        }

        debug!(
            channel = fresh_id,
            consumers = rewired.len(),
            prefetch_sum = rewired.iter().map(|e| e.prefetch as u32).sum::<u32>(),
            "consumers rewired"
        );
        registry.channels.insert(
            fresh_id,
            ChannelConsumers {
                channel: fresh,
                entries: rewired,
            },
        );

        mine
    }

    /// Cancels one consumer and removes it from the registry.
    pub(crate) async fn cancel_entry(&self, entry: &Arc<ConsumerEntry>) -> Result<(), AmqpError> {
        entry.deactivate();

        let mut registry = self.consumers.lock().await;
        let Some(channel_id) = registry.find_channel_of(entry.id) else {
            entry.close_stream();
            return Ok(());
        };

        let tag = entry.tag();
        let mut close_channel = false;
        if let Some(group) = registry.channels.get_mut(&channel_id) {
            if let Err(err) = group
                .channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                warn!(
                    error = err.to_string(),
                    queue = entry.queue,
                    "error cancelling consumer"
                );
            }
            group.entries.retain(|e| e.id != entry.id);
            close_channel = group.entries.is_empty();
        }

        if close_channel {
            if let Some(group) = registry.channels.remove(&channel_id) {
                if let Err(err) = group.channel.close(200, "no consumers remaining").await {
                    debug!(
                        error = err.to_string(),
                        channel = channel_id,
                        "error closing consume channel"
                    );
                }
            }
        }

        entry.close_stream();
        debug!(queue = entry.queue, "consumer cancelled");
        Ok(())
    }

}

fn consumer_tag(queue: &str) -> String {
    format!("{}.{}", queue, Uuid::new_v4())
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("host", &self.inner.params.host)
            .field("running", &self.is_running())
            .finish()
    }
}
