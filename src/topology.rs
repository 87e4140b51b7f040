// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! This module asserts queues, exchanges and bindings on the broker. Every
//! assertion runs on a pooled channel and is idempotent: redeclaring an
//! entity with identical properties is a no-op on the server. Declarations
//! within one call run in parallel, each on its own pooled channel.

use futures_util::future::join_all;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use std::sync::Arc;
use tracing::{debug, error};

use crate::errors::AmqpError;
use crate::exchange::ExchangeDefinition;
use crate::pool::ChannelPool;
use crate::queue::{QueueBinding, QueueDefinition};

/// Declares topology over pooled channels.
pub(crate) struct Topology {
    pool: Arc<ChannelPool>,
}

impl Topology {
    pub(crate) fn new(pool: Arc<ChannelPool>) -> Topology {
        Topology { pool }
    }

    /// Asserts the given queues, in parallel.
    pub(crate) async fn queues(&self, defs: &[QueueDefinition]) -> Result<(), AmqpError> {
        collect(join_all(defs.iter().map(|def| self.declare_queue(def))).await)
    }

    /// Asserts the given exchanges, in parallel.
    pub(crate) async fn exchanges(&self, defs: &[ExchangeDefinition]) -> Result<(), AmqpError> {
        collect(join_all(defs.iter().map(|def| self.declare_exchange(def))).await)
    }

    /// Asserts the given bindings, in parallel.
    pub(crate) async fn bindings(&self, bindings: &[QueueBinding]) -> Result<(), AmqpError> {
        collect(join_all(bindings.iter().map(|binding| self.bind_queue(binding))).await)
    }

    /// Passively checks a queue and returns its message count.
    pub(crate) async fn check_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.pool
            .acquire_and_run(|channel| async move {
                let queue = channel
                    .queue_declare(
                        name,
                        QueueDeclareOptions {
                            passive: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), queue = name, "queue check failed");
                        AmqpError::CheckQueueError(name.to_owned())
                    })?;
                Ok(queue.message_count())
            })
            .await
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!(queue = def.name(), "declaring queue");
        self.pool
            .acquire_and_run(|channel| async move {
                channel
                    .queue_declare(
                        def.name(),
                        QueueDeclareOptions {
                            passive: false,
                            durable: def.durable,
                            exclusive: def.exclusive,
                            auto_delete: def.auto_delete,
                            nowait: false,
                        },
                        def.arguments(),
                    )
                    .await
                    .map_err(|err| {
                        error!(
                            error = err.to_string(),
                            queue = def.name(),
                            "error declaring queue"
                        );
                        AmqpError::DeclareQueueError(def.name().to_owned())
                    })?;
                Ok(())
            })
            .await
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!(exchange = def.name(), "declaring exchange");
        self.pool
            .acquire_and_run(|channel| async move {
                channel
                    .exchange_declare(
                        def.name(),
                        def.kind.into(),
                        ExchangeDeclareOptions {
                            passive: false,
                            durable: def.durable,
                            auto_delete: def.auto_delete,
                            internal: false,
                            nowait: false,
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(
                            error = err.to_string(),
                            exchange = def.name(),
                            "error declaring exchange"
                        );
                        AmqpError::DeclareExchangeError(def.name().to_owned())
                    })?;
                Ok(())
            })
            .await
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            queue = binding.queue,
            exchange = binding.exchange,
            routing_key = binding.routing_key,
            "binding queue"
        );
        self.pool
            .acquire_and_run(|channel| async move {
                channel
                    .queue_bind(
                        &binding.queue,
                        &binding.exchange,
                        &binding.routing_key,
                        QueueBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(
                            error = err.to_string(),
                            queue = binding.queue,
                            exchange = binding.exchange,
                            "error binding queue to exchange"
                        );
                        AmqpError::BindingError(binding.exchange.clone(), binding.queue.clone())
                    })?;
                Ok(())
            })
            .await
    }
}

fn collect(results: Vec<Result<(), AmqpError>>) -> Result<(), AmqpError> {
    results.into_iter().collect()
}
