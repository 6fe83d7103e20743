//! Records returned by the management API.
//!
//! Only the fields the report needs are modelled. Unknown fields are ignored
//! and most fields are optional, since their presence depends on the broker
//! version and on statistics collection being enabled.

use serde::{Deserialize, Serialize};

/// `GET /api/overview`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Overview {
    #[serde(default)]
    pub cluster_name: Option<String>,

    #[serde(default)]
    pub node: Option<String>,

    #[serde(default)]
    pub rabbitmq_version: Option<String>,

    #[serde(default)]
    pub erlang_version: Option<String>,

    #[serde(default)]
    pub management_version: Option<String>,

    #[serde(default)]
    pub object_totals: Option<ObjectTotals>,
}

/// Object counts reported by the overview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectTotals {
    #[serde(default)]
    pub connections: u64,
    #[serde(default)]
    pub channels: u64,
    #[serde(default)]
    pub exchanges: u64,
    #[serde(default)]
    pub queues: u64,
    #[serde(default)]
    pub consumers: u64,
}

/// `GET /api/exchanges`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub name: String,

    pub vhost: String,

    /// Exchange type (direct, fanout, topic, headers).
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default)]
    pub internal: bool,
}

impl ExchangeInfo {
    /// The nameless default exchange is listed as an empty string.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(AMQP default)"
        } else {
            &self.name
        }
    }
}

/// `GET /api/queues`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,

    pub vhost: String,

    #[serde(default)]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default)]
    pub exclusive: bool,

    /// Ready plus unacknowledged messages.
    #[serde(default)]
    pub messages: Option<u64>,

    #[serde(default)]
    pub consumers: Option<u64>,

    #[serde(default)]
    pub state: Option<String>,
}

/// `GET /api/bindings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingInfo {
    /// Source exchange, empty for the default exchange.
    pub source: String,

    pub vhost: String,

    pub destination: String,

    /// `queue` or `exchange`.
    pub destination_type: String,

    #[serde(default)]
    pub routing_key: String,

    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// `GET /api/consumers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub consumer_tag: String,

    pub queue: QueueRef,

    #[serde(default)]
    pub channel_details: Option<ChannelDetails>,

    #[serde(default)]
    pub ack_required: bool,

    #[serde(default)]
    pub exclusive: bool,

    #[serde(default)]
    pub prefetch_count: u64,
}

/// Queue a consumer is attached to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRef {
    pub name: String,
    pub vhost: String,
}

/// Channel a consumer runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDetails {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub connection_name: Option<String>,

    #[serde(default)]
    pub peer_host: Option<String>,

    #[serde(default)]
    pub peer_port: Option<u16>,
}

/// Everything the topology report shows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub overview: Overview,
    pub exchanges: Vec<ExchangeInfo>,
    pub queues: Vec<QueueInfo>,
    pub bindings: Vec<BindingInfo>,
    pub consumers: Vec<ConsumerInfo>,
}

impl BrokerInfo {
    /// Bindings whose source is `exchange` in `vhost`.
    pub fn bindings_from<'a>(
        &'a self,
        vhost: &'a str,
        exchange: &'a str,
    ) -> impl Iterator<Item = &'a BindingInfo> + 'a {
        self.bindings
            .iter()
            .filter(move |b| b.vhost == vhost && b.source == exchange)
    }

    /// Consumers attached to `queue` in `vhost`.
    pub fn consumers_of<'a>(
        &'a self,
        vhost: &'a str,
        queue: &'a str,
    ) -> impl Iterator<Item = &'a ConsumerInfo> + 'a {
        self.consumers
            .iter()
            .filter(move |c| c.queue.vhost == vhost && c.queue.name == queue)
    }
}
