// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! This module defines [`Publication`], the outbound message handed to the
//! broker, and the [`Publish`] trait implemented by it. A publication carries
//! the routing key, the optional exchange, the body bytes and the AMQP
//! properties (correlation id, reply-to, expiration as a decimal string of
//! milliseconds). Helpers build the publications used by the job pipeline:
//! plain enqueue, delayed enqueue, retry and error republication.

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use lapin::BasicProperties;
use std::collections::BTreeMap;

use crate::errors::AmqpError;
use crate::job::JobRequest;
use crate::registry::JobDefinition;

/// Content type for all job envelopes
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the terminal error of a dead-lettered job
pub const AMQP_HEADERS_ERROR: &str = "x-job-error";
/// Header carrying the final attempt count of a dead-lettered job
pub const AMQP_HEADERS_ATTEMPTS: &str = "x-job-attempts";

/// An outbound message.
#[derive(Debug, Clone, Default)]
pub struct Publication {
    /// Target exchange, empty for the default exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Message body
    pub body: Vec<u8>,
    /// Correlation id carried in the message properties
    pub correlation_id: Option<String>,
    /// Reply-to queue carried in the message properties
    pub reply_to: Option<String>,
    /// Per-message expiration in milliseconds
    pub expiration_ms: Option<u64>,
    /// Extra message headers
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl Publication {
    /// Creates a publication to the default exchange.
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Publication {
            routing_key: routing_key.into(),
            body,
            ..Publication::default()
        }
    }

    /// Sets the target exchange.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Sets the correlation id.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the reply-to queue.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the per-message expiration, in milliseconds.
    pub fn expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    /// Adds a message header.
    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    /// Renders the AMQP properties for this publication.
    pub(crate) fn properties(&self) -> BasicProperties {
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE));

        if let Some(correlation_id) = &self.correlation_id {
            properties =
                properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
        }
        if let Some(expiration_ms) = self.expiration_ms {
            // AMQP expects the expiration as a decimal string of milliseconds.
            properties = properties.with_expiration(ShortString::from(expiration_ms.to_string()));
        }
        if !self.headers.is_empty() {
            properties = properties.with_headers(FieldTable::from(self.headers.clone()));
        }

        properties
    }

    /// Builds the enqueue publication for a job request.
    pub(crate) fn for_job(def: &JobDefinition, request: &JobRequest) -> Result<Self, AmqpError> {
        let mut publication = Publication::new(def.routing_key.clone(), request.encode()?)
            .correlation_id(correlation_of(request));
        if let Some(exchange) = &def.exchange {
            publication = publication.exchange(exchange.clone());
        }
        if let Some(reply_to) = &def.reply_to {
            publication = publication.reply_to(reply_to.clone());
        }
        if let Some(expires_ms) = def.expires_ms {
            publication = publication.expiration_ms(expires_ms);
        }
        Ok(publication)
    }

    /// Builds the delayed-enqueue publication for a job request.
    ///
    /// Delayed jobs go to `<queue>.delayed` through the default exchange with
    /// the delay as per-message expiration; the queue dead-letters expired
    /// messages back to the primary queue.
    pub(crate) fn delayed(
        def: &JobDefinition,
        request: &JobRequest,
        delay_ms: u64,
    ) -> Result<Self, AmqpError> {
        Ok(Publication::new(def.delayed_queue(), request.encode()?)
            .correlation_id(correlation_of(request))
            .expiration_ms(delay_ms))
    }

    /// Builds the retry publication for a failed job request.
    ///
    /// The caller passes the next-attempt request; the original correlation
    /// id is preserved.
    pub(crate) fn retry(def: &JobDefinition, next: &JobRequest) -> Result<Self, AmqpError> {
        Ok(Publication::new(def.queue.clone(), next.encode()?)
            .exchange(def.retry_exchange.clone())
            .correlation_id(correlation_of(next)))
    }

    /// Builds the error publication for a delivery whose body failed to
    /// decode but whose job name was still recoverable.
    ///
    /// The original body is forwarded untouched with the decode error in a
    /// message header.
    pub(crate) fn errored_body(def: &JobDefinition, body: &[u8], error: &str) -> Publication {
        Publication::new(def.queue.clone(), body.to_vec())
            .exchange(def.error_exchange.clone())
            .header(
                AMQP_HEADERS_ERROR,
                AMQPValue::LongString(LongString::from(error)),
            )
    }

    /// Builds the error publication for a job whose retries are exhausted.
    ///
    /// The terminal error and the final attempt count travel in message
    /// headers.
    pub(crate) fn errored(
        def: &JobDefinition,
        request: &JobRequest,
        error: &str,
    ) -> Result<Self, AmqpError> {
        Ok(Publication::new(def.queue.clone(), request.encode()?)
            .exchange(def.error_exchange.clone())
            .correlation_id(correlation_of(request))
            .header(
                AMQP_HEADERS_ERROR,
                AMQPValue::LongString(LongString::from(error)),
            )
            .header(
                AMQP_HEADERS_ATTEMPTS,
                AMQPValue::LongLongInt(LongLongInt::from(request.attempt as i64)),
            ))
    }
}

fn correlation_of(request: &JobRequest) -> String {
    request
        .correlation_id
        .clone()
        .unwrap_or_else(|| request.id.to_string())
}

/// The publishing seam between the job pipeline and the broker.
///
/// `publish` is the flow-controlled path: it queues the message and returns
/// `false` when the outgoing publish window is saturated, signaling a
/// well-behaved producer to pause. `publish_confirmed` waits for the frame to
/// be handed to the wire and is used where ordering matters, like flushing a
/// transactor or republishing before acking.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Queues a message, returning the flow-control indicator.
    async fn publish(&self, message: Publication) -> Result<bool, AmqpError>;

    /// Publishes a message and waits for it to be written out.
    async fn publish_confirmed(&self, message: Publication) -> Result<(), AmqpError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::handler_fn;
    use crate::registry::{JobInput, Registry};
    use serde_json::{json, Value};

    fn mailer_def() -> JobDefinition {
        let registry = Registry::new();
        registry
            .register_job(
                JobInput::new("mailer", handler_fn(|_r| async { Ok(Value::Null) }))
                    .reply_to("mailer.replies")
                    .expires_ms(60_000),
            )
            .unwrap()
    }

    #[test]
    fn properties_carry_expiration_as_decimal_string() {
        let publication = Publication::new("mailer", vec![]).expiration_ms(1500);

        let properties = publication.properties();

        assert_eq!(
            properties.expiration().as_ref().map(|e| e.as_str()),
            Some("1500")
        );
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
    }

    #[test]
    fn for_job_uses_definition_routing() {
        let def = mailer_def();
        let request = JobRequest::new("mailer", vec![json!("hi")]);

        let publication = Publication::for_job(&def, &request).unwrap();

        assert_eq!(publication.exchange, "");
        assert_eq!(publication.routing_key, "mailer");
        assert_eq!(publication.reply_to.as_deref(), Some("mailer.replies"));
        assert_eq!(publication.expiration_ms, Some(60_000));
        assert_eq!(publication.correlation_id, Some(request.id.to_string()));
    }

    #[test]
    fn delayed_targets_the_delayed_queue() {
        let def = mailer_def();
        let request = JobRequest::new("mailer", vec![]);

        let publication = Publication::delayed(&def, &request, 2500).unwrap();

        assert_eq!(publication.exchange, "");
        assert_eq!(publication.routing_key, "mailer.delayed");
        assert_eq!(publication.expiration_ms, Some(2500));
    }

    #[test]
    fn retry_targets_the_retry_exchange() {
        let def = mailer_def();
        let request = JobRequest::new("mailer", vec![]);
        let next = request.next_attempt();

        let publication = Publication::retry(&def, &next).unwrap();

        assert_eq!(publication.exchange, "mailer.retry");
        assert_eq!(publication.routing_key, "mailer");

        let decoded = JobRequest::decode(&publication.body).unwrap();
        assert_eq!(decoded.attempt, 2);
        assert_eq!(decoded.id, request.id);
    }

    #[test]
    fn errored_body_forwards_the_original_bytes() {
        let def = mailer_def();
        let body = br#"{"name":"mailer","args":[]}"#;

        let publication = Publication::errored_body(&def, body, "invalid job payload");

        assert_eq!(publication.exchange, "mailer.error");
        assert_eq!(publication.routing_key, "mailer");
        assert_eq!(publication.body, body.to_vec());
        assert_eq!(
            publication.headers.get(AMQP_HEADERS_ERROR),
            Some(&AMQPValue::LongString(LongString::from(
                "invalid job payload"
            )))
        );
    }

    #[test]
    fn errored_carries_error_headers() {
        let def = mailer_def();
        let mut request = JobRequest::new("mailer", vec![]);
        request.attempt = def.max_retries;

        let publication = Publication::errored(&def, &request, "smtp unreachable").unwrap();

        assert_eq!(publication.exchange, "mailer.error");
        assert_eq!(
            publication.headers.get(AMQP_HEADERS_ERROR),
            Some(&AMQPValue::LongString(LongString::from("smtp unreachable")))
        );
        assert_eq!(
            publication.headers.get(AMQP_HEADERS_ATTEMPTS),
            Some(&AMQPValue::LongLongInt(LongLongInt::from(
                def.max_retries as i64
            )))
        );
    }
}
