// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by every broker-facing operation
//! in the library. The `AmqpError` enum covers connection and channel failures,
//! topology declaration, publishing, consuming, job payload handling, and
//! lifecycle preconditions. Each variant carries enough context (the queue,
//! exchange or job name involved) to make the failure actionable in logs.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants are cloneable so that a single failed connection attempt can be
/// reported to every caller that joined the in-flight `connect()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection after exhausting every retry
    #[error("failure to connect after {0} attempts: {1}")]
    ConnectionError(u32, String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// An operation was attempted on a broker that never connected
    #[error("broker is not running, call connect() first")]
    NotRunning,

    /// The channel pool was never initialized for this connection
    #[error("channel pool is not initialized")]
    PoolNotInitialized,

    /// The channel pool was closed while the operation was waiting on it
    #[error("channel pool is closed")]
    PoolClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingError(String, String),

    /// Error checking a queue with a passive declaration
    #[error("failure to check queue `{0}`")]
    CheckQueueError(String),

    /// Error publishing a message to the given exchange
    #[error("failure to publish to exchange `{0}`: {1}")]
    PublishingError(String, String),

    /// Error configuring Quality of Service parameters on a channel
    #[error("failure to configure qos on channel {0}")]
    QosError(u16),

    /// Error starting a consumer on the given queue
    #[error("failure to start consumer on queue `{0}`: {1}")]
    ConsumerError(String, String),

    /// A delivery body that is not valid JSON or lacks the job name
    #[error("invalid job payload: {0}")]
    DecodeError(String),

    /// A job name with no registered definition
    #[error("unknown job `{0}`")]
    UnknownJob(String),

    /// A job name registered more than once
    #[error("job `{0}` is already registered")]
    DuplicateJob(String),

    /// A transactor that was already committed or rolled back
    #[error("transactor already concluded")]
    AlreadyConcluded,

    /// An operation that did not finish within its allotted time
    #[error("timed out after {0}ms")]
    Timeout(u64),
}
