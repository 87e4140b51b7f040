// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Transactor
//!
//! A transactor lets application code stage a burst of job publications and
//! either flush them in order (`commit`) or abandon them (`rollback`).
//! Staging is purely in-memory; no wire traffic happens before the commit.
//! A transactor concludes exactly once: the second call to either `commit`
//! or `rollback` is an error, and `wait_until` resolves when the one-shot
//! conclusion fires.
//!
//! The client keeps the set of open transactors and, on shutdown, waits a
//! bounded time for each to conclude, logging the ones that time out.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::AmqpError;
use crate::job::JobRequest;
use crate::publisher::{Publication, Publish};
use crate::registry::JobDefinition;

enum State {
    Open(Vec<JobRequest>),
    Concluded,
}

/// A staged batch of publications for one job definition.
pub struct Transactor {
    def: JobDefinition,
    publisher: Arc<dyn Publish>,
    state: Mutex<State>,
    concluded_tx: watch::Sender<bool>,
    concluded_rx: watch::Receiver<bool>,
}

impl Transactor {
    /// Creates an open transactor publishing through the given seam.
    pub(crate) fn new(def: JobDefinition, publisher: Arc<dyn Publish>) -> Arc<Transactor> {
        let (concluded_tx, concluded_rx) = watch::channel(false);
        Arc::new(Transactor {
            def,
            publisher,
            state: Mutex::new(State::Open(vec![])),
            concluded_tx,
            concluded_rx,
        })
    }

    /// The job this transactor stages requests for.
    pub fn job_name(&self) -> &str {
        &self.def.name
    }

    /// Whether the transactor has been committed or rolled back.
    pub fn is_concluded(&self) -> bool {
        *self.concluded_rx.borrow()
    }

    /// Stages a job request. No wire traffic happens.
    pub fn enqueue(&self, args: Vec<serde_json::Value>) -> Result<Uuid, AmqpError> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Concluded => Err(AmqpError::AlreadyConcluded),
            State::Open(staged) => {
                let request = JobRequest::new(&self.def.name, args);
                let id = request.id;
                staged.push(request);
                Ok(id)
            }
        }
    }

    /// Number of staged requests.
    pub fn len(&self) -> usize {
        match &*self.state.lock().unwrap() {
            State::Open(staged) => staged.len(),
            State::Concluded => 0,
        }
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the staged requests in order and concludes.
    ///
    /// The flush is best-effort: a publish failure is returned to the caller
    /// but the transactor still concludes and the remaining requests are
    /// dropped.
    pub async fn commit(&self) -> Result<(), AmqpError> {
        let staged = self.conclude()?;
        debug!(
            job = self.def.name,
            staged = staged.len(),
            "committing transactor"
        );

        let mut result = Ok(());
        for request in &staged {
            let publication = Publication::for_job(&self.def, request)?;
            if let Err(err) = self.publisher.publish_confirmed(publication).await {
                warn!(
                    error = err.to_string(),
                    job = self.def.name,
                    "transactor flush failed, dropping remaining requests"
                );
                result = Err(err);
                break;
            }
        }

        let _ = self.concluded_tx.send(true);
        result
    }

    /// Drops the staged requests and concludes.
    pub async fn rollback(&self) -> Result<(), AmqpError> {
        let staged = self.conclude()?;
        debug!(
            job = self.def.name,
            dropped = staged.len(),
            "rolling back transactor"
        );
        let _ = self.concluded_tx.send(true);
        Ok(())
    }

    /// Waits for the transactor to conclude.
    ///
    /// Resolves immediately when it already has; fails with a timeout error
    /// otherwise.
    pub async fn wait_until(&self, timeout_ms: u64) -> Result<(), AmqpError> {
        let mut concluded = self.concluded_rx.clone();
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            concluded.wait_for(|done| *done),
        )
        .await
        .map_err(|_| AmqpError::Timeout(timeout_ms))?
        .map_err(|_| AmqpError::AlreadyConcluded)?;
        Ok(())
    }

    /// Takes the staged buffer, marking the transactor concluded.
    fn conclude(&self) -> Result<Vec<JobRequest>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Concluded) {
            State::Open(staged) => Ok(staged),
            State::Concluded => Err(AmqpError::AlreadyConcluded),
        }
    }
}

impl fmt::Debug for Transactor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transactor")
            .field("job", &self.def.name)
            .field("staged", &self.len())
            .field("concluded", &self.is_concluded())
            .finish()
    }
}
