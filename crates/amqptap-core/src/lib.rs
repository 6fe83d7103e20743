//! amqptap core
//!
//! Taps live AMQP exchanges without disturbing their consumers, subscribes to
//! queues and publishes messages, all on top of a self-healing broker
//! connection.
//!
//! This crate provides:
//! - Connection supervisor with fixed-delay redial and a control-signal path
//! - Fan-in multiplexer over a dynamic set of streams
//! - Tap, subscribe and publish workers
//! - Management API client for topology reports

pub mod binding;
pub mod broker;
pub mod config;
pub mod control;
pub mod envelope;
pub mod error;
pub mod fanin;
pub mod publish;
pub mod subscribe;
pub mod supervisor;
pub mod tap;
pub mod topology;

mod worker;

#[cfg(test)]
mod mock;

pub use binding::{parse_bindings, ExchangeBinding};
pub use broker::amqp::AmqpDialer;
pub use broker::{Delivery, MessageProperties, OutboundMessage, TappedMessage};
pub use config::{PublishConfig, SubscribeConfig, SupervisorConfig, TapConfig};
pub use control::{ControlReceiver, ControlSignal, ReconnectAction};
pub use envelope::{Envelope, EnvelopeSender};
pub use error::{BrokerError, Result, TapError};
pub use fanin::FanIn;
pub use publish::PublishWorker;
pub use subscribe::SubscribeWorker;
pub use supervisor::{ConnectionSupervisor, Worker};
pub use tap::TapWorker;
pub use topology::TopologyClient;
