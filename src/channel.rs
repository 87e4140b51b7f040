// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Dialing
//!
//! This module establishes the single connection a broker runs on. The dial
//! is retried: `max_retries + 1` attempts with `retry_delay` between them,
//! surfacing the last underlying error once every attempt is exhausted.

use lapin::{types::LongString, Connection, ConnectionProperties};
use tracing::{debug, warn};

use crate::config::ConnectionParams;
use crate::errors::AmqpError;

/// Dials RabbitMQ with the retry policy from the connection parameters.
pub(crate) async fn connect_with_retry(
    params: &ConnectionParams,
) -> Result<Connection, AmqpError> {
    let uri = params.uri();
    let attempts = params.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!(attempt, host = %params.host, "dialing amqp broker");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(format!("conveyor.{}", std::process::id())));

        match Connection::connect(&uri, options).await {
            Ok(connection) => {
                debug!(attempt, "amqp connection established");
                return Ok(connection);
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    attempt,
                    remaining = attempts - attempt,
                    "connection attempt failed"
                );
                last_error = err.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(params.retry_delay).await;
        }
    }

    Err(AmqpError::ConnectionError(attempts, last_error))
}
