// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Job Registry
//!
//! The registry is the static in-process catalogue of job definitions. A
//! definition is registered once, normalized (name, routing key, retry and
//! error exchange names are derived from the queue when omitted) and kept for
//! the life of the process. The registry also derives the full AMQP topology
//! needed to run the registered jobs:
//!
//! - the primary queue for each job
//! - `<queue>.retry`: holds failed jobs for `retry_delay_ms` and dead-letters
//!   them back to the primary queue through the default exchange
//! - `<queue>.error`: terminal archival of jobs whose retries are exhausted
//! - `<queue>.delayed`: target of delayed enqueues, dead-lettered back to the
//!   primary queue once the per-message expiration elapses
//! - the retry and error exchanges and their bindings

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::errors::AmqpError;
use crate::exchange::ExchangeDefinition;
use crate::job::JobHandler;
use crate::queue::{QueueBinding, QueueDefinition};

/// Default number of retries for a job whose definition doesn't set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay before a failed job is redelivered, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u32 = 5000;

/// Input accepted by [`Registry::register_job`].
///
/// Only the queue and the handler are mandatory; everything else is derived
/// or defaulted during normalization.
#[derive(Clone)]
pub struct JobInput {
    pub name: Option<String>,
    pub queue: String,
    pub routing_key: Option<String>,
    pub exchange: Option<String>,
    pub reply_to: Option<String>,
    pub handler: Arc<dyn JobHandler>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u32>,
    pub expires_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl JobInput {
    /// Creates a job input for the given queue and handler.
    pub fn new(queue: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        JobInput {
            name: None,
            queue: queue.into(),
            routing_key: None,
            exchange: None,
            reply_to: None,
            handler,
            max_retries: None,
            retry_delay_ms: None,
            expires_ms: None,
            timeout_ms: None,
        }
    }

    /// Sets the job name. Defaults to the queue name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the routing key used at publish time. Defaults to the queue name.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Publishes through a named exchange instead of the default exchange.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Sets the reply-to queue carried in message properties.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets how many times a failing job is retried before dead-lettering.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the delay between retries, in milliseconds.
    pub fn retry_delay_ms(mut self, delay_ms: u32) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }

    /// Sets the per-message expiration applied at enqueue, in milliseconds.
    pub fn expires_ms(mut self, expires_ms: u64) -> Self {
        self.expires_ms = Some(expires_ms);
        self
    }

    /// Sets the handler execution timeout, in milliseconds.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

impl fmt::Debug for JobInput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobInput")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .finish()
    }
}

/// A normalized job definition, created by registration and kept for the
/// process lifetime.
#[derive(Clone)]
pub struct JobDefinition {
    /// Unique job name
    pub name: String,
    /// Primary queue the job is consumed from
    pub queue: String,
    /// Routing key used at publish time
    pub routing_key: String,
    /// Named exchange used at publish time, default exchange when absent
    pub exchange: Option<String>,
    /// Reply-to queue carried in message properties
    pub reply_to: Option<String>,
    /// Handler invoked by the worker
    pub handler: Arc<dyn JobHandler>,
    /// Exchange failed jobs are republished to while retries remain
    pub retry_exchange: String,
    /// Exchange failed jobs are republished to once retries are exhausted
    pub error_exchange: String,
    /// Number of retries before dead-lettering
    pub max_retries: u32,
    /// Delay between retries, in milliseconds
    pub retry_delay_ms: u32,
    /// Per-message expiration applied at enqueue, in milliseconds
    pub expires_ms: Option<u64>,
    /// Handler execution timeout, in milliseconds
    pub timeout_ms: Option<u64>,
}

impl JobDefinition {
    /// Name of the delayed-enqueue queue for this job.
    pub fn delayed_queue(&self) -> String {
        format!("{}.delayed", self.queue)
    }

    /// Name of the retry holding queue for this job.
    pub fn retry_queue(&self) -> String {
        format!("{}.retry", self.queue)
    }

    /// Name of the terminal error queue for this job.
    pub fn error_queue(&self) -> String {
        format!("{}.error", self.queue)
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("exchange", &self.exchange)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .finish()
    }
}

/// Static catalogue of registered job definitions.
///
/// The registry is append-only after topology declaration; definitions are
/// never removed or replaced.
#[derive(Default)]
pub struct Registry {
    jobs: RwLock<Vec<JobDefinition>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Normalizes and stores a job definition.
    ///
    /// The job name defaults to the queue name; the routing key defaults to
    /// the queue name; the retry and error exchanges are named
    /// `<queue>.retry` and `<queue>.error`.
    ///
    /// # Parameters
    /// * `input` - The job input to normalize
    ///
    /// # Returns
    /// The normalized definition, or an error when the name is taken.
    pub fn register_job(&self, input: JobInput) -> Result<JobDefinition, AmqpError> {
        let name = input.name.unwrap_or_else(|| input.queue.clone());
        let definition = JobDefinition {
            routing_key: input.routing_key.unwrap_or_else(|| input.queue.clone()),
            retry_exchange: format!("{}.retry", input.queue),
            error_exchange: format!("{}.error", input.queue),
            queue: input.queue,
            exchange: input.exchange,
            reply_to: input.reply_to,
            handler: input.handler,
            max_retries: input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: input.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            expires_ms: input.expires_ms,
            timeout_ms: input.timeout_ms,
            name,
        };

        let mut jobs = self.jobs.write().unwrap();
        if jobs.iter().any(|job| job.name == definition.name) {
            return Err(AmqpError::DuplicateJob(definition.name));
        }
        jobs.push(definition.clone());

        Ok(definition)
    }

    /// Looks up a definition by job name.
    pub fn get(&self, name: &str) -> Option<JobDefinition> {
        self.jobs
            .read()
            .unwrap()
            .iter()
            .find(|job| job.name == name)
            .cloned()
    }

    /// Returns the names of all registered jobs.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs
            .read()
            .unwrap()
            .iter()
            .map(|job| job.name.clone())
            .collect()
    }

    /// Returns the queues consumed by workers, deduplicated.
    pub fn worker_queues(&self) -> Vec<String> {
        let jobs = self.jobs.read().unwrap();
        let queues: BTreeSet<String> = jobs.iter().map(|job| job.queue.clone()).collect();
        queues.into_iter().collect()
    }

    /// Derives every queue the registered jobs need.
    pub fn queues(&self) -> Vec<QueueDefinition> {
        let jobs = self.jobs.read().unwrap();
        let mut seen = BTreeSet::new();
        let mut queues = vec![];

        for job in jobs.iter() {
            if !seen.insert(job.queue.clone()) {
                continue;
            }
            queues.push(QueueDefinition::new(&job.queue).durable());
            queues.push(
                QueueDefinition::new(job.retry_queue())
                    .durable()
                    .message_ttl(job.retry_delay_ms)
                    .dead_letter("", &job.queue),
            );
            queues.push(QueueDefinition::new(job.error_queue()).durable());
            queues.push(
                QueueDefinition::new(job.delayed_queue())
                    .durable()
                    .dead_letter("", &job.queue),
            );
        }

        queues
    }

    /// Derives every exchange the registered jobs need.
    pub fn exchanges(&self) -> Vec<ExchangeDefinition> {
        let jobs = self.jobs.read().unwrap();
        let mut seen = BTreeSet::new();
        let mut exchanges = vec![];

        for job in jobs.iter() {
            if let Some(exchange) = &job.exchange {
                if seen.insert(exchange.clone()) {
                    exchanges.push(ExchangeDefinition::new(exchange).durable());
                }
            }
            if seen.insert(job.retry_exchange.clone()) {
                exchanges.push(ExchangeDefinition::new(&job.retry_exchange).durable());
            }
            if seen.insert(job.error_exchange.clone()) {
                exchanges.push(ExchangeDefinition::new(&job.error_exchange).durable());
            }
        }

        exchanges
    }

    /// Derives every binding the registered jobs need.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        let jobs = self.jobs.read().unwrap();
        let mut seen = BTreeSet::new();
        let mut bindings = vec![];

        for job in jobs.iter() {
            let mut push = |queue: String, exchange: String, routing_key: String| {
                if seen.insert((queue.clone(), exchange.clone(), routing_key.clone())) {
                    bindings.push(
                        QueueBinding::new(queue)
                            .exchange(exchange)
                            .routing_key(routing_key),
                    );
                }
            };

            if let Some(exchange) = &job.exchange {
                push(job.queue.clone(), exchange.clone(), job.routing_key.clone());
            }
            push(job.retry_queue(), job.retry_exchange.clone(), job.queue.clone());
            push(job.error_queue(), job.error_exchange.clone(), job.queue.clone());
        }

        bindings
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("jobs", &self.job_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::handler_fn;
    use serde_json::Value;

    fn noop_handler() -> Arc<dyn JobHandler> {
        handler_fn(|_request| async { Ok(Value::Null) })
    }

    #[test]
    fn register_normalizes_names() {
        let registry = Registry::new();

        let def = registry
            .register_job(JobInput::new("mailer", noop_handler()))
            .unwrap();

        assert_eq!(def.name, "mailer");
        assert_eq!(def.routing_key, "mailer");
        assert_eq!(def.retry_exchange, "mailer.retry");
        assert_eq!(def.error_exchange, "mailer.error");
        assert_eq!(def.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(def.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
    }

    #[test]
    fn register_keeps_explicit_settings() {
        let registry = Registry::new();

        let def = registry
            .register_job(
                JobInput::new("mailer", noop_handler())
                    .name("send-mail")
                    .routing_key("mail.send")
                    .exchange("jobs")
                    .max_retries(7)
                    .retry_delay_ms(100)
                    .timeout_ms(2000),
            )
            .unwrap();

        assert_eq!(def.name, "send-mail");
        assert_eq!(def.routing_key, "mail.send");
        assert_eq!(def.exchange.as_deref(), Some("jobs"));
        assert_eq!(def.max_retries, 7);
        assert_eq!(def.retry_delay_ms, 100);
        assert_eq!(def.timeout_ms, Some(2000));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = Registry::new();
        registry
            .register_job(JobInput::new("mailer", noop_handler()))
            .unwrap();

        let err = registry
            .register_job(JobInput::new("mailer", noop_handler()))
            .unwrap_err();

        assert_eq!(err, AmqpError::DuplicateJob("mailer".to_owned()));
    }

    #[test]
    fn derived_topology_covers_retry_error_and_delayed() {
        let registry = Registry::new();
        registry
            .register_job(
                JobInput::new("mailer", noop_handler())
                    .exchange("jobs")
                    .retry_delay_ms(250),
            )
            .unwrap();

        let queue_names: Vec<_> = registry.queues().iter().map(|q| q.name().to_owned()).collect();
        assert_eq!(
            queue_names,
            vec!["mailer", "mailer.retry", "mailer.error", "mailer.delayed"]
        );

        let retry = registry
            .queues()
            .into_iter()
            .find(|q| q.name() == "mailer.retry")
            .unwrap();
        assert_eq!(
            retry,
            QueueDefinition::new("mailer.retry")
                .durable()
                .message_ttl(250)
                .dead_letter("", "mailer")
        );

        let exchange_names: Vec<_> = registry
            .exchanges()
            .iter()
            .map(|e| e.name().to_owned())
            .collect();
        assert_eq!(exchange_names, vec!["jobs", "mailer.retry", "mailer.error"]);

        let bindings = registry.bindings();
        assert!(bindings.contains(
            &QueueBinding::new("mailer")
                .exchange("jobs")
                .routing_key("mailer")
        ));
        assert!(bindings.contains(
            &QueueBinding::new("mailer.retry")
                .exchange("mailer.retry")
                .routing_key("mailer")
        ));
        assert!(bindings.contains(
            &QueueBinding::new("mailer.error")
                .exchange("mailer.error")
                .routing_key("mailer")
        ));
    }

    #[test]
    fn shared_queue_topology_is_deduplicated() {
        let registry = Registry::new();
        registry
            .register_job(JobInput::new("mailer", noop_handler()).name("send-mail"))
            .unwrap();
        registry
            .register_job(JobInput::new("mailer", noop_handler()).name("send-digest"))
            .unwrap();

        assert_eq!(registry.worker_queues(), vec!["mailer"]);
        assert_eq!(registry.queues().len(), 4);
        assert_eq!(registry.exchanges().len(), 2);
    }
}
