// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! Conveyor is a background-job queue library for RabbitMQ.
//!
//! Producers enqueue named, argument-carrying job requests; worker processes
//! consume them, dispatch to registered handlers and route failures through
//! retry and error topologies. The library owns the broker-facing runtime in
//! between: a bounded pool of channels over one connection, a consumer
//! registry that survives channel loss by rewiring onto fresh channels, a
//! worker pipeline with bounded concurrency and graceful shutdown, and a
//! transactional staged-publish buffer.
//!
//! Delivery is at-least-once: handlers must tolerate redelivery, using the
//! request id or the attempt counter to deduplicate.

mod channel;
mod topology;

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod job;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod transactor;
pub mod worker;

pub use broker::Broker;
pub use client::{Client, Enqueuer};
pub use config::ConnectionParams;
pub use consumer::{ConsumerEvent, ConsumerHandle, Delivery};
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use job::{handler_fn, HandlerError, JobHandler, JobRequest};
pub use publisher::{Publication, Publish};
pub use queue::{QueueBinding, QueueDefinition};
pub use registry::{JobDefinition, JobInput, Registry};
pub use transactor::Transactor;
pub use worker::{Worker, WorkerOptions, WorkerResult, WorkerStatus};
