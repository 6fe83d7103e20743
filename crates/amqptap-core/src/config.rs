//! Worker and supervisor configuration.

use std::time::Duration;

use crate::binding::ExchangeBinding;

/// Default delay between dial attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connection supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fixed delay between failed dial attempts.
    pub retry_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Exchanges to tap on one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapConfig {
    /// AMQP URI of the broker.
    pub uri: String,

    /// Exchanges to tap, in setup order.
    pub bindings: Vec<ExchangeBinding>,
}

impl TapConfig {
    pub fn new(uri: impl Into<String>, bindings: Vec<ExchangeBinding>) -> Self {
        Self {
            uri: uri.into(),
            bindings,
        }
    }
}

/// An existing queue to consume on one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeConfig {
    pub uri: String,
    pub queue: String,
}

/// Broker to publish to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub uri: String,
}
