// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Job Requests and the Wire Envelope
//!
//! A [`JobRequest`] is one enqueued unit of work: a unique id, the job name
//! used to look up the handler, the JSON arguments, and the attempt counter
//! that drives retry routing. On the wire the request is a UTF-8 JSON object
//! `{id, name, args, attempt}`; the attempt counter is incremented on every
//! retry publication so redeliveries and retries stay distinguishable.
//!
//! The module also defines the [`JobHandler`] trait implemented by
//! application code, and [`handler_fn`] to lift a plain async function into
//! a handler.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AmqpError;

/// Errors returned by job handlers.
///
/// Handler failures are application-level: the worker routes them through the
/// retry or error topology and never lets them crash the pipeline.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single enqueued job request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    /// Unique id assigned at enqueue time
    pub id: Uuid,
    /// Name of the registered job definition
    pub name: String,
    /// Opaque JSON arguments forwarded to the handler
    #[serde(default)]
    pub args: Vec<Value>,
    /// Delivery attempt, starts at 1 and increments on every retry
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    /// Correlation id carried in the message properties
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    /// Delivery tag, set only once the request has been delivered
    #[serde(skip)]
    pub delivery_tag: Option<u64>,
}

fn first_attempt() -> u32 {
    1
}

impl JobRequest {
    /// Creates a new request for the given job name and arguments.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        JobRequest {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
            attempt: 1,
            correlation_id: None,
            delivery_tag: None,
        }
    }

    /// Encodes the request into its wire envelope.
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::InternalError(err.to_string()))
    }

    /// Decodes a wire envelope into a request.
    ///
    /// A body that is not valid JSON, or whose envelope lacks the `name`
    /// field, is a decode error. The worker nacks such deliveries without
    /// requeueing them.
    pub fn decode(body: &[u8]) -> Result<Self, AmqpError> {
        let request: JobRequest =
            serde_json::from_slice(body).map_err(|err| AmqpError::DecodeError(err.to_string()))?;
        if request.name.is_empty() {
            return Err(AmqpError::DecodeError("envelope lacks a job name".into()));
        }
        Ok(request)
    }

    /// Returns the request to publish for the next retry.
    ///
    /// The id and correlation id are preserved, the attempt counter is
    /// incremented, and the delivery tag is cleared.
    pub fn next_attempt(&self) -> JobRequest {
        JobRequest {
            attempt: self.attempt + 1,
            delivery_tag: None,
            ..self.clone()
        }
    }
}

/// A handler invoked by the worker for each delivered job request.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the job and returns its result value.
    async fn run(&self, request: &JobRequest) -> Result<Value, HandlerError>;
}

type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

struct FnHandler {
    f: Box<dyn Fn(JobRequest) -> HandlerFuture + Send + Sync>,
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn run(&self, request: &JobRequest) -> Result<Value, HandlerError> {
        (self.f)(request.clone()).await
    }
}

/// Lifts an async function into a [`JobHandler`].
///
/// # Example
///
/// ```
/// use conveyor::job::handler_fn;
/// use serde_json::Value;
///
/// let handler = handler_fn(|request| async move {
///     Ok(Value::String(format!("handled {}", request.name)))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |request| f(request).boxed()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let mut request = JobRequest::new("send-mail", vec![json!({"to": "martianboy"})]);
        request.correlation_id = Some(request.id.to_string());

        let body = request.encode().unwrap();
        let decoded = JobRequest::decode(&body).unwrap();

        assert_eq!(decoded.id, request.id);
        assert_eq!(decoded.name, "send-mail");
        assert_eq!(decoded.args, vec![json!({"to": "martianboy"})]);
        assert_eq!(decoded.attempt, 1);
        assert_eq!(decoded.correlation_id, request.correlation_id);
        assert_eq!(decoded.delivery_tag, None);
    }

    #[test]
    fn decode_defaults_attempt_to_one() {
        let body = format!(r#"{{"id":"{}","name":"resize","args":[]}}"#, Uuid::new_v4());

        let decoded = JobRequest::decode(body.as_bytes()).unwrap();

        assert_eq!(decoded.attempt, 1);
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = JobRequest::decode(b"not json").unwrap_err();

        assert!(matches!(err, AmqpError::DecodeError(_)));
    }

    #[test]
    fn decode_rejects_missing_name() {
        let body = format!(r#"{{"id":"{}","args":[1]}}"#, Uuid::new_v4());

        let err = JobRequest::decode(body.as_bytes()).unwrap_err();

        assert!(matches!(err, AmqpError::DecodeError(_)));
    }

    #[test]
    fn decode_rejects_empty_name() {
        let body = format!(r#"{{"id":"{}","name":"","args":[]}}"#, Uuid::new_v4());

        let err = JobRequest::decode(body.as_bytes()).unwrap_err();

        assert!(matches!(err, AmqpError::DecodeError(_)));
    }

    #[test]
    fn next_attempt_increments_and_clears_delivery_tag() {
        let mut request = JobRequest::new("transcode", vec![json!("video.mkv")]);
        request.attempt = 2;
        request.delivery_tag = Some(42);

        let next = request.next_attempt();

        assert_eq!(next.attempt, 3);
        assert_eq!(next.id, request.id);
        assert_eq!(next.delivery_tag, None);
    }

    #[tokio::test]
    async fn handler_fn_invokes_the_closure() {
        let handler = handler_fn(|request| async move { Ok(json!(request.args.len())) });
        let request = JobRequest::new("count", vec![json!(1), json!(2)]);

        let value = handler.run(&request).await.unwrap();

        assert_eq!(value, json!(2));
    }
}
