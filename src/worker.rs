// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Worker Pipeline
//!
//! The worker turns consumer streams into handler invocations. Each delivery
//! goes through decode, handler lookup and dispatch under a bounded
//! concurrency budget; the result decides how the delivery is disposed:
//!
//! - success: ack
//! - failure with retries remaining: republish to the retry exchange with
//!   the attempt counter incremented, then ack the original
//! - failure with retries exhausted: republish to the error exchange with the
//!   terminal error in headers, then ack the original
//! - handler timeout: treated as a failure
//! - undecodable body or unknown job: nack without requeue; when the body
//!   still carries the name of a registered job, it is archived on that
//!   job's error exchange first
//!
//! Acks go to the channel the message arrived on. When a consumer is rewired
//! after a channel loss, in-flight messages from the dead channel are lost;
//! their acks fail quietly and the broker redelivers the messages.
//!
//! Every processed delivery produces one [`WorkerResult`] on the worker's
//! result stream for observability.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::consumer::{ConsumerEvent, ConsumerHandle, Delivery};
use crate::errors::AmqpError;
use crate::job::JobRequest;
use crate::publisher::Publication;
use crate::registry::{JobDefinition, Registry};

/// Default number of concurrent handler invocations per worker.
pub const DEFAULT_CONCURRENCY: usize = 4;

const RESULTS_BUFFER: usize = 256;

/// Options accepted by [`Worker::new`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Queues to consume; empty means every registered worker queue
    pub queues: Vec<String>,
    /// Maximum number of in-flight handler invocations
    pub concurrency: usize,
    /// Per-consumer prefetch, falls back to the connection default
    pub prefetch: Option<u16>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            queues: vec![],
            concurrency: DEFAULT_CONCURRENCY,
            prefetch: None,
        }
    }
}

/// How a processed delivery ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Handler succeeded, delivery acked
    Success,
    /// Handler failed, job republished for a delayed retry
    Retried,
    /// Retries exhausted, job republished to the error exchange
    DeadLettered,
    /// Delivery was undecodable or named an unknown job, nacked
    Rejected,
    /// Retry or error routing failed, delivery requeued to the broker
    Requeued,
}

/// Outcome of one processed delivery.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    /// Id of the job request, when it decoded
    pub job_id: Option<Uuid>,
    /// Name of the job, when it decoded
    pub name: Option<String>,
    /// How the delivery was disposed
    pub status: WorkerStatus,
    /// The handler or decode error, when there was one
    pub error: Option<String>,
    /// The handler's result value on success
    pub result: Option<Value>,
}

/// Consumes worker queues and dispatches deliveries to job handlers.
pub struct Worker {
    broker: Broker,
    registry: Arc<Registry>,
    options: WorkerOptions,
    limiter: Arc<Semaphore>,
    handles: Vec<ConsumerHandle>,
    results_tx: mpsc::Sender<WorkerResult>,
    results_rx: Option<mpsc::Receiver<WorkerResult>>,
}

#[derive(Clone)]
struct DispatchContext {
    broker: Broker,
    registry: Arc<Registry>,
    limiter: Arc<Semaphore>,
    results: mpsc::Sender<WorkerResult>,
}

impl Worker {
    /// Creates a worker over the given broker and registry.
    pub fn new(broker: Broker, registry: Arc<Registry>, options: WorkerOptions) -> Worker {
        let (results_tx, results_rx) = mpsc::channel(RESULTS_BUFFER);
        Worker {
            limiter: Arc::new(Semaphore::new(options.concurrency.max(1))),
            broker,
            registry,
            options,
            handles: vec![],
            results_tx,
            results_rx: Some(results_rx),
        }
    }

    /// Takes the result stream out of the worker.
    ///
    /// When nobody reads the stream, results are dropped once the buffer
    /// fills; the pipeline never blocks on observability.
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<WorkerResult>> {
        self.results_rx.take()
    }

    /// Starts consuming and dispatching.
    pub async fn run(&mut self) -> Result<(), AmqpError> {
        let queues = if self.options.queues.is_empty() {
            self.registry.worker_queues()
        } else {
            self.options.queues.clone()
        };
        info!(queues = ?queues, concurrency = self.options.concurrency, "worker starting");

        let handles = self
            .broker
            .consume_over(&queues, self.options.prefetch)
            .await?;

        for mut handle in handles {
            let events = handle
                .take_events()
                .ok_or_else(|| AmqpError::InternalError("consumer stream already taken".into()))?;
            let context = DispatchContext {
                broker: self.broker.clone(),
                registry: Arc::clone(&self.registry),
                limiter: Arc::clone(&self.limiter),
                results: self.results_tx.clone(),
            };
            tokio::spawn(consume_loop(events, context));
            self.handles.push(handle);
        }

        Ok(())
    }

    /// Stops the worker: cancels its consumers and drains in-flight work.
    ///
    /// Handlers still running when the timeout elapses are abandoned, not
    /// killed; their messages are redelivered by the broker once the
    /// connection closes without an ack.
    pub async fn stop(&mut self, timeout: Duration) {
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.cancel().await {
                debug!(
                    error = err.to_string(),
                    queue = handle.queue(),
                    "error cancelling worker consumer"
                );
            }
        }

        let concurrency = self.options.concurrency.max(1) as u32;
        let drained = tokio::time::timeout(
            timeout,
            Arc::clone(&self.limiter).acquire_many_owned(concurrency),
        )
        .await;
        match drained {
            Ok(Ok(permits)) => {
                drop(permits);
                debug!("worker drained");
            }
            Ok(Err(_)) => {}
            Err(_) => warn!(
                timeout_ms = timeout.as_millis() as u64,
                "abandoning in-flight jobs after drain timeout"
            ),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queues", &self.options.queues)
            .field("concurrency", &self.options.concurrency)
            .field("consumers", &self.handles.len())
            .finish()
    }
}

/// Reads one consumer stream and spawns bounded dispatches.
async fn consume_loop(mut events: mpsc::Receiver<ConsumerEvent>, context: DispatchContext) {
    while let Some(event) = events.recv().await {
        match event {
            ConsumerEvent::Resumed { channel_id } => {
                info!(channel = channel_id, "consumer resumed on a new channel");
            }
            ConsumerEvent::Delivery(delivery) => {
                let permit = match Arc::clone(&context.limiter).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let context = context.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = dispatch(&context, delivery).await;
                    if context.results.try_send(result).is_err() {
                        debug!("worker result dropped, downstream is not consuming");
                    }
                });
            }
        }
    }
}

/// Runs one delivery through the pipeline and disposes it.
async fn dispatch(context: &DispatchContext, delivery: Delivery) -> WorkerResult {
    let request = match &delivery.envelope {
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue = delivery.queue,
                "rejecting undecodable delivery"
            );
            // The envelope is broken, but the job name may still be readable;
            // if it names a registered job, archive the body on its error
            // exchange before dropping the delivery.
            let name = delivery.raw_body.as_deref().and_then(malformed_job_name);
            if let Some(def) = name.as_deref().and_then(|name| context.registry.get(name)) {
                let publication = Publication::errored_body(
                    &def,
                    delivery.raw_body.as_deref().unwrap_or_default(),
                    &err.to_string(),
                );
                if let Err(publish_err) = context.broker.publish_confirmed(publication).await {
                    error!(
                        error = publish_err.to_string(),
                        job = def.name,
                        "error routing undecodable delivery to the error exchange"
                    );
                }
            }
            let _ = delivery.reject().await;
            return WorkerResult {
                job_id: None,
                name,
                status: WorkerStatus::Rejected,
                error: Some(err.to_string()),
                result: None,
            };
        }
        Ok(request) => request.clone(),
    };

    let Some(def) = context.registry.get(&request.name) else {
        warn!(job = request.name, "rejecting delivery for unknown job");
        let _ = delivery.reject().await;
        return WorkerResult {
            job_id: Some(request.id),
            name: Some(request.name.clone()),
            status: WorkerStatus::Rejected,
            error: Some(AmqpError::UnknownJob(request.name).to_string()),
            result: None,
        };
    };

    debug!(
        job = request.name,
        id = %request.id,
        attempt = request.attempt,
        "dispatching job"
    );

    let outcome = match def.timeout_ms {
        Some(timeout_ms) => {
            match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                def.handler.run(&request),
            )
            .await
            {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(_) => Err(format!("handler timed out after {timeout_ms}ms")),
            }
        }
        None => def.handler.run(&request).await.map_err(|err| err.to_string()),
    };

    match outcome {
        Ok(value) => {
            let _ = delivery.ack().await;
            WorkerResult {
                job_id: Some(request.id),
                name: Some(request.name.clone()),
                status: WorkerStatus::Success,
                error: None,
                result: Some(value),
            }
        }
        Err(job_error) => fail(context, &delivery, &request, &def, job_error).await,
    }
}

/// Routes a failed job through the retry or error topology.
async fn fail(
    context: &DispatchContext,
    delivery: &Delivery,
    request: &JobRequest,
    def: &JobDefinition,
    job_error: String,
) -> WorkerResult {
    let (publication, status) = match disposition_for(request.attempt, def.max_retries) {
        Disposition::Retry => {
            warn!(
                job = request.name,
                id = %request.id,
                attempt = request.attempt,
                error = job_error,
                "job failed, scheduling retry"
            );
            (
                Publication::retry(def, &request.next_attempt()),
                WorkerStatus::Retried,
            )
        }
        Disposition::DeadLetter => {
            error!(
                job = request.name,
                id = %request.id,
                attempt = request.attempt,
                error = job_error,
                "job failed with retries exhausted, dead-lettering"
            );
            (
                Publication::errored(def, request, &job_error),
                WorkerStatus::DeadLettered,
            )
        }
    };

    let routed = match publication {
        Ok(publication) => context.broker.publish_confirmed(publication).await,
        Err(err) => Err(err),
    };

    match routed {
        Ok(()) => {
            let _ = delivery.ack().await;
            WorkerResult {
                job_id: Some(request.id),
                name: Some(request.name.clone()),
                status,
                error: Some(job_error),
                result: None,
            }
        }
        Err(publish_err) => {
            // Routing failed, give the message back to the broker instead of
            // losing it.
            error!(
                error = publish_err.to_string(),
                job = request.name,
                "failure routing failed, requeueing delivery"
            );
            let _ = delivery.nack(true).await;
            WorkerResult {
                job_id: Some(request.id),
                name: Some(request.name.clone()),
                status: WorkerStatus::Requeued,
                error: Some(job_error),
                result: None,
            }
        }
    }
}

/// Pulls the job name out of a body that failed envelope decoding.
fn malformed_job_name(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .get("name")?
        .as_str()
        .map(str::to_owned)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Retry,
    DeadLetter,
}

/// Decides between a delayed retry and the error exchange.
pub(crate) fn disposition_for(attempt: u32, max_retries: u32) -> Disposition {
    if attempt < max_retries {
        Disposition::Retry
    } else {
        Disposition::DeadLetter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_retries_when_budget_remains() {
        assert_eq!(disposition_for(1, 3), Disposition::Retry);
        assert_eq!(disposition_for(2, 3), Disposition::Retry);
    }

    #[test]
    fn final_attempt_dead_letters() {
        assert_eq!(disposition_for(3, 3), Disposition::DeadLetter);
        assert_eq!(disposition_for(4, 3), Disposition::DeadLetter);
    }

    #[test]
    fn zero_retry_budget_dead_letters_immediately() {
        assert_eq!(disposition_for(1, 0), Disposition::DeadLetter);
        assert_eq!(disposition_for(1, 1), Disposition::DeadLetter);
    }

    #[test]
    fn malformed_job_name_survives_a_broken_envelope() {
        // The id is not a uuid, so envelope decoding fails, but the name is
        // still there.
        let body = br#"{"id":"not-a-uuid","name":"mailer","args":[]}"#;

        assert_eq!(malformed_job_name(body), Some("mailer".to_owned()));
    }

    #[test]
    fn malformed_job_name_gives_up_on_garbage() {
        assert_eq!(malformed_job_name(b"not json"), None);
        assert_eq!(malformed_job_name(br#"{"args":[]}"#), None);
        assert_eq!(malformed_job_name(br#"{"name":42}"#), None);
        assert_eq!(malformed_job_name(br#"[1,2,3]"#), None);
    }

    #[test]
    fn default_options_cover_all_worker_queues() {
        let options = WorkerOptions::default();

        assert!(options.queues.is_empty());
        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(options.prefetch, None);
    }
}
