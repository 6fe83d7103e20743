//! Broker topology reporting over the management REST API.

mod client;
mod records;

pub use client::TopologyClient;
pub use records::{
    BindingInfo, BrokerInfo, ChannelDetails, ConsumerInfo, ExchangeInfo, ObjectTotals, Overview,
    QueueInfo, QueueRef,
};
