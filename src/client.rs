// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Client
//!
//! The client is the application-facing surface of the library. It owns the
//! broker, the job registry, the running workers and the set of open
//! transactors, and wires them together:
//!
//! - [`Client::job`] registers a job definition and returns its enqueuer
//! - [`Client::call`] enqueues by job name
//! - [`Client::declare_amq_resources`] asserts the derived topology
//! - [`Client::worker`] starts a worker over the registered queues
//! - [`Client::shutdown`] drains everything and closes the connection
//!
//! ```no_run
//! use conveyor::client::Client;
//! use conveyor::config::ConnectionParams;
//! use conveyor::job::handler_fn;
//! use conveyor::registry::JobInput;
//! use serde_json::{json, Value};
//!
//! # async fn example() -> Result<(), conveyor::errors::AmqpError> {
//! let client = Client::new(ConnectionParams::from_env());
//!
//! let send_mail = client.job(JobInput::new(
//!     "mailer",
//!     handler_fn(|request| async move {
//!         println!("sending {:?}", request.args);
//!         Ok(Value::Null)
//!     }),
//! ))?;
//!
//! client.connect().await?;
//! client.declare_amq_resources().await?;
//! send_mail.enqueue(vec![json!({"to": "martianboy"})]).await?;
//! client.worker(Default::default()).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::ConnectionParams;
use crate::errors::AmqpError;
use crate::job::JobRequest;
use crate::publisher::{Publication, Publish};
use crate::registry::{JobDefinition, JobInput, Registry};
use crate::transactor::Transactor;
use crate::worker::{Worker, WorkerOptions, WorkerResult};

struct ClientInner {
    broker: Broker,
    registry: Arc<Registry>,
    transactors: StdMutex<Vec<Arc<Transactor>>>,
    workers: Mutex<Vec<Worker>>,
}

/// Application-facing entry point.
///
/// Cloning is cheap; every clone shares the same broker, registry, workers
/// and transactors.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client for the given connection parameters.
    pub fn new(params: ConnectionParams) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                broker: Broker::new(params),
                registry: Arc::new(Registry::new()),
                transactors: StdMutex::new(vec![]),
                workers: Mutex::new(vec![]),
            }),
        }
    }

    /// Creates a client configured from the environment.
    pub fn from_env() -> Client {
        Client::new(ConnectionParams::from_env())
    }

    /// The broker this client runs on.
    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// The job registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Connects to the broker.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.inner.broker.connect().await
    }

    /// Registers a job definition and returns its enqueuer.
    ///
    /// Jobs can be registered before connecting; topology is only asserted
    /// by [`Client::declare_amq_resources`].
    pub fn job(&self, input: JobInput) -> Result<Enqueuer, AmqpError> {
        let def = self.inner.registry.register_job(input)?;
        info!(job = def.name, queue = def.queue, "job registered");
        Ok(Enqueuer {
            name: def.name.clone(),
            client: self.clone(),
        })
    }

    /// Enqueues a job by name.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<Uuid, AmqpError> {
        let def = self.definition(name)?;
        self.enqueue_job(&def, args, None).await
    }

    /// Asserts the queues, exchanges and bindings derived from the registry.
    pub async fn declare_amq_resources(&self) -> Result<(), AmqpError> {
        let registry = &self.inner.registry;
        self.inner.broker.exchanges(&registry.exchanges()).await?;
        self.inner.broker.queues(&registry.queues()).await?;
        self.inner.broker.bindings(&registry.bindings()).await?;
        info!("amq resources declared");
        Ok(())
    }

    /// Starts a worker and returns its result stream.
    pub async fn worker(
        &self,
        options: WorkerOptions,
    ) -> Result<tokio::sync::mpsc::Receiver<WorkerResult>, AmqpError> {
        let mut worker = Worker::new(
            self.inner.broker.clone(),
            Arc::clone(&self.inner.registry),
            options,
        );
        let results = worker
            .take_results()
            .ok_or_else(|| AmqpError::InternalError("worker results already taken".into()))?;
        worker.run().await?;
        self.inner.workers.lock().await.push(worker);
        Ok(results)
    }

    /// Stops delivering from the given queue.
    pub async fn pause_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.inner.broker.pause_queue(queue).await
    }

    /// Resumes delivery from a paused queue.
    pub async fn resume_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.inner.broker.resume_queue(queue).await
    }

    /// Shuts everything down.
    ///
    /// Three phases: cancel every consumer so no new deliveries arrive, wait
    /// up to the timeout for in-flight workers and open transactors, then
    /// close the pool and the connection. Workers and transactors that miss
    /// the timeout are logged and abandoned.
    pub async fn shutdown(&self, timeout_ms: u64) -> Result<(), AmqpError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        info!(timeout_ms, "shutting down");

        self.inner.broker.cancel_all_consumers().await?;

        {
            let mut workers = self.inner.workers.lock().await;
            for worker in workers.iter_mut() {
                worker.stop(remaining(deadline)).await;
            }
            workers.clear();
        }

        let transactors: Vec<Arc<Transactor>> = {
            let mut open = self.inner.transactors.lock().unwrap();
            std::mem::take(&mut *open)
        };
        for transactor in transactors {
            if transactor.is_concluded() {
                continue;
            }
            let wait_ms = remaining(deadline).as_millis() as u64;
            if let Err(err) = transactor.wait_until(wait_ms).await {
                warn!(
                    error = err.to_string(),
                    job = transactor.job_name(),
                    "open transactor did not conclude before shutdown"
                );
            }
        }

        self.inner
            .broker
            .shutdown(remaining(deadline).as_millis() as u64)
            .await
    }

    fn definition(&self, name: &str) -> Result<JobDefinition, AmqpError> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| AmqpError::UnknownJob(name.to_owned()))
    }

    async fn enqueue_job(
        &self,
        def: &JobDefinition,
        args: Vec<serde_json::Value>,
        delay_ms: Option<u64>,
    ) -> Result<Uuid, AmqpError> {
        let request = JobRequest::new(&def.name, args);
        let publication = match delay_ms {
            Some(delay_ms) => Publication::delayed(def, &request, delay_ms)?,
            None => Publication::for_job(def, &request)?,
        };
        self.inner.broker.publish(publication).await?;
        Ok(request.id)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("broker", &self.inner.broker)
            .field("jobs", &self.inner.registry.job_names())
            .finish()
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Enqueues requests for one registered job.
#[derive(Clone)]
pub struct Enqueuer {
    name: String,
    client: Client,
}

impl Enqueuer {
    /// The job this enqueuer publishes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a job request, returning its id.
    pub async fn enqueue(&self, args: Vec<serde_json::Value>) -> Result<Uuid, AmqpError> {
        let def = self.client.definition(&self.name)?;
        self.client.enqueue_job(&def, args, None).await
    }

    /// Enqueues a job request delivered after the given delay.
    ///
    /// The request is parked on the job's delayed queue with the delay as
    /// per-message expiration and dead-letters into the primary queue when it
    /// elapses.
    pub async fn delayed(
        &self,
        args: Vec<serde_json::Value>,
        delay_ms: u64,
    ) -> Result<Uuid, AmqpError> {
        let def = self.client.definition(&self.name)?;
        self.client.enqueue_job(&def, args, Some(delay_ms)).await
    }

    /// Opens a transactor staging requests for this job.
    pub fn transaction(&self) -> Result<Arc<Transactor>, AmqpError> {
        let def = self.client.definition(&self.name)?;
        let publisher: Arc<dyn Publish> = Arc::new(self.client.inner.broker.clone());
        let transactor = Transactor::new(def, publisher);
        self.client
            .inner
            .transactors
            .lock()
            .unwrap()
            .push(Arc::clone(&transactor));
        Ok(transactor)
    }
}

impl fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Enqueuer").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::handler_fn;
    use serde_json::Value;

    fn noop_input(queue: &str) -> JobInput {
        JobInput::new(queue, handler_fn(|_r| async { Ok(Value::Null) }))
    }

    #[tokio::test]
    async fn job_registration_returns_an_enqueuer() {
        let client = Client::new(ConnectionParams::default());

        let enqueuer = client.job(noop_input("mailer")).unwrap();

        assert_eq!(enqueuer.name(), "mailer");
        assert!(client.registry().get("mailer").is_some());
    }

    #[tokio::test]
    async fn call_with_unknown_job_fails() {
        let client = Client::new(ConnectionParams::default());

        let err = client.call("nope", vec![]).await.unwrap_err();

        assert_eq!(err, AmqpError::UnknownJob("nope".to_owned()));
    }

    #[tokio::test]
    async fn enqueue_before_connect_is_a_precondition_error() {
        let client = Client::new(ConnectionParams::default());
        let enqueuer = client.job(noop_input("mailer")).unwrap();

        let err = enqueuer.enqueue(vec![]).await.unwrap_err();

        assert_eq!(err, AmqpError::NotRunning);
    }

    #[tokio::test]
    async fn shutdown_before_connect_is_a_precondition_error() {
        let client = Client::new(ConnectionParams::default());

        let err = client.shutdown(50).await.unwrap_err();

        assert_eq!(err, AmqpError::NotRunning);
    }

    #[tokio::test]
    async fn transactions_are_tracked_until_shutdown() {
        let client = Client::new(ConnectionParams::default());
        let enqueuer = client.job(noop_input("mailer")).unwrap();

        let transactor = enqueuer.transaction().unwrap();
        transactor.enqueue(vec![]).unwrap();

        assert_eq!(client.inner.transactors.lock().unwrap().len(), 1);
        transactor.rollback().await.unwrap();
        assert!(transactor.is_concluded());
    }
}
