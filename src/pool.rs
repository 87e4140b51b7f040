// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Channel Pool
//!
//! AMQP channels are cheap but not free, and most broker operations need
//! one. The pool keeps a bounded set of channels over the single connection
//! and lends them out one at a time: acquirers beyond the pool size wait in
//! FIFO order, and a channel that comes back broken is replaced before its
//! slot is handed out again. [`ChannelPool::acquire_and_run`] is the only
//! acquisition API, so a borrowed channel is released on every exit path.

use lapin::{Channel, Connection};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::errors::AmqpError;

/// Bounded pool of channels over one AMQP connection.
pub struct ChannelPool {
    connection: Arc<Connection>,
    size: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    open: bool,
    free: VecDeque<Channel>,
    waiters: VecDeque<oneshot::Sender<Channel>>,
}

impl ChannelPool {
    /// Opens a pool of `size` channels on the given connection.
    pub(crate) async fn open(
        connection: Arc<Connection>,
        size: usize,
    ) -> Result<Arc<ChannelPool>, AmqpError> {
        let mut free = VecDeque::with_capacity(size);
        for _ in 0..size {
            let channel = connection
                .create_channel()
                .await
                .map_err(|err| AmqpError::ChannelError(err.to_string()))?;
            free.push_back(channel);
        }
        debug!(size, "channel pool opened");

        Ok(Arc::new(ChannelPool {
            connection,
            size,
            state: Mutex::new(PoolState {
                open: true,
                free,
                waiters: VecDeque::new(),
            }),
        }))
    }

    /// Whether the pool is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    /// Number of channels currently available for acquisition.
    pub fn num_free_channels(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Number of channels the pool was opened with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquires a channel, runs `f` on it and releases the channel.
    ///
    /// The channel is released whether `f` succeeds or fails; a channel that
    /// is no longer connected on release is replaced before its slot becomes
    /// available again. Acquirers beyond the pool size wait in FIFO order.
    ///
    /// # Parameters
    /// * `f` - Closure invoked with the borrowed channel
    ///
    /// # Returns
    /// The result of `f`, or a pool-closed error when the pool shut down
    /// while waiting for a channel.
    pub async fn acquire_and_run<F, Fut, T>(&self, f: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let channel = self.acquire().await?;
        let result = f(channel.clone()).await;
        self.release(channel).await;
        result
    }

    async fn acquire(&self) -> Result<Channel, AmqpError> {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            if !state.open {
                return Err(AmqpError::PoolClosed);
            }
            if let Some(channel) = state.free.pop_front() {
                return Ok(channel);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        waiter.await.map_err(|_| AmqpError::PoolClosed)
    }

    async fn release(&self, channel: Channel) {
        let channel = if channel.status().connected() {
            Some(channel)
        } else {
            warn!(
                channel = channel.id(),
                "released channel is broken, replacing it"
            );
            match self.connection.create_channel().await {
                Ok(fresh) => Some(fresh),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        "could not replace broken channel, slot is lost"
                    );
                    None
                }
            }
        };

        let mut state = self.state.lock().unwrap();
        if !state.open {
            return;
        }
        let Some(mut channel) = channel else {
            return;
        };

        // Hand the channel to the oldest live waiter, or park it.
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => match waiter.send(channel) {
                    Ok(()) => return,
                    Err(returned) => channel = returned,
                },
                None => {
                    state.free.push_back(channel);
                    return;
                }
            }
        }
    }

    /// Closes the pool.
    ///
    /// Pending acquirers are cancelled with a pool-closed error and every
    /// parked channel is closed.
    pub(crate) async fn close(&self) {
        let (free, waiters) = {
            let mut state = self.state.lock().unwrap();
            state.open = false;
            (
                std::mem::take(&mut state.free),
                std::mem::take(&mut state.waiters),
            )
        };

        // Dropping the senders fails every waiter with PoolClosed.
        drop(waiters);

        for channel in free {
            if let Err(err) = channel.close(200, "pool closed").await {
                debug!(error = err.to_string(), "error closing pooled channel");
            }
        }
        debug!("channel pool closed");
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ChannelPool")
            .field("size", &self.size)
            .field("open", &state.open)
            .field("free", &state.free.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
