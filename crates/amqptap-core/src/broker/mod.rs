//! Broker access seam.
//!
//! Workers never talk to `lapin` directly. They use the three traits below,
//! implemented for a live broker in [`amqp`] and by an in-memory broker in
//! the test suite.

pub mod amqp;
mod message;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

use crate::error::BrokerError;

pub use message::{Delivery, MessageProperties, OutboundMessage, TappedMessage};

/// Stream of deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// AMQP exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Flags for an exchange declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

/// Flags for a queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Establishes connections to a broker.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn dial(&self, uri: &str) -> Result<Self::Connection, BrokerError>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Take the disconnect notification of this connection.
    ///
    /// Resolves with the cause once the connection is lost without being
    /// closed by us. Returns `None` if already taken.
    fn disconnected(&self) -> Option<oneshot::Receiver<BrokerError>>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel on a broker connection.
///
/// Most operation-level errors kill the channel on the broker side, after
/// which every call fails with [`BrokerError::ChannelClosed`].
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Start an auto-ack, exclusive consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError>;
}
