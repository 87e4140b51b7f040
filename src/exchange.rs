// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism that carries job requests to queues.
//! This module defines the exchange kinds the library declares and a builder
//! for exchange definitions. The retry and error exchanges synthesized by the
//! job registry are plain durable direct exchanges.

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: routes messages to queues on an exact match of routing keys
/// - Fanout: broadcasts messages to all bound queues
/// - Topic: routes messages on wildcard pattern matching of routing keys
/// - Headers: routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure
/// exchange definitions. Declaring the same definition twice is idempotent
/// as long as the properties are identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default the exchange is a non-durable direct exchange.
    pub fn new(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
        }
    }

    /// Returns the exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_flags() {
        let def = ExchangeDefinition::new("mailer.retry").durable().fanout();

        assert_eq!(def.name(), "mailer.retry");
        assert_eq!(def.kind, ExchangeKind::Fanout);
        assert!(def.durable);
        assert!(!def.auto_delete);
    }

    #[test]
    fn kind_converts_to_lapin() {
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        );
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Direct),
            lapin::ExchangeKind::Direct
        );
    }
}
