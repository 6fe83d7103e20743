//! `lapin`-backed broker implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::oneshot;

use super::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Dialer, ExchangeKind,
    ExchangeOptions, MessageProperties, OutboundMessage, QueueOptions,
};
use crate::error::BrokerError;

/// Connection name shown in the broker's management UI.
const CONNECTION_NAME: &str = "amqptap";

/// Dials real brokers using `lapin`.
#[derive(Debug, Clone, Default)]
pub struct AmqpDialer;

#[async_trait]
impl Dialer for AmqpDialer {
    type Connection = AmqpConnection;

    async fn dial(&self, uri: &str) -> Result<AmqpConnection, BrokerError> {
        let properties =
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());
        let inner = Connection::connect(uri, properties)
            .await
            .map_err(|e| BrokerError::Dial(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        inner.on_error(move |err| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(BrokerError::ConnectionClosed(err.to_string()));
            }
        });

        Ok(AmqpConnection {
            inner,
            disconnected: Mutex::new(Some(rx)),
        })
    }
}

/// Live `lapin` connection.
pub struct AmqpConnection {
    inner: Connection,
    disconnected: Mutex<Option<oneshot::Receiver<BrokerError>>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel, BrokerError> {
        let inner = self.inner.create_channel().await?;
        Ok(AmqpChannel { inner })
    }

    fn disconnected(&self) -> Option<oneshot::Receiver<BrokerError>> {
        self.disconnected.lock().ok()?.take()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

/// Live `lapin` channel.
pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        let options = ExchangeDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            ..Default::default()
        };
        self.inner
            .exchange_declare(name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            ..Default::default()
        };
        self.inner
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack: true,
            exclusive: true,
            ..Default::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;

        Ok(consumer
            .map(|item| item.map(from_lapin_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.inner
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await?;
        Ok(())
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        delivery_tag: delivery.delivery_tag,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

pub(crate) fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: short(props.content_type()),
        content_encoding: short(props.content_encoding()),
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        correlation_id: short(props.correlation_id()),
        reply_to: short(props.reply_to()),
        expiration: short(props.expiration()),
        message_id: short(props.message_id()),
        timestamp: *props.timestamp(),
        kind: short(props.kind()),
        user_id: short(props.user_id()),
        app_id: short(props.app_id()),
        headers: props
            .headers()
            .as_ref()
            .map(field_table_to_map)
            .unwrap_or_default(),
    }
}

pub(crate) fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(v) = &props.content_type {
        out = out.with_content_type(v.as_str().into());
    }
    if let Some(v) = &props.content_encoding {
        out = out.with_content_encoding(v.as_str().into());
    }
    if let Some(v) = props.delivery_mode {
        out = out.with_delivery_mode(v);
    }
    if let Some(v) = props.priority {
        out = out.with_priority(v);
    }
    if let Some(v) = &props.correlation_id {
        out = out.with_correlation_id(v.as_str().into());
    }
    if let Some(v) = &props.reply_to {
        out = out.with_reply_to(v.as_str().into());
    }
    if let Some(v) = &props.expiration {
        out = out.with_expiration(v.as_str().into());
    }
    if let Some(v) = &props.message_id {
        out = out.with_message_id(v.as_str().into());
    }
    if let Some(v) = props.timestamp {
        out = out.with_timestamp(v);
    }
    if let Some(v) = &props.kind {
        out = out.with_kind(v.as_str().into());
    }
    if let Some(v) = &props.user_id {
        out = out.with_user_id(v.as_str().into());
    }
    if let Some(v) = &props.app_id {
        out = out.with_app_id(v.as_str().into());
    }
    if !props.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &props.headers {
            table.insert(key.as_str().into(), json_to_amqp_value(value));
        }
        out = out.with_headers(table);
    }
    out
}

fn field_table_to_map(table: &FieldTable) -> BTreeMap<String, serde_json::Value> {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), amqp_value_to_json(v)))
        .collect()
}

/// Header values as JSON. Lossy: the AMQP type of a number or string is not
/// kept, and byte arrays and decimals become their debug text.
fn amqp_value_to_json(value: &AMQPValue) -> serde_json::Value {
    use serde_json::Value;

    match value {
        AMQPValue::Boolean(v) => Value::from(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::ShortString(v) => Value::from(v.as_str()),
        AMQPValue::LongString(v) => Value::from(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::FieldArray(v) => Value::Array(v.as_slice().iter().map(amqp_value_to_json).collect()),
        AMQPValue::FieldTable(v) => Value::Object(field_table_to_map(v).into_iter().collect()),
        AMQPValue::Void => Value::Null,
        other => Value::from(format!("{other:?}")),
    }
}

/// Integers go out as `LongLongInt`, other numbers as `Double` and strings
/// as `LongString`.
fn json_to_amqp_value(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;

    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(json_to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (k, v) in map {
                table.insert(k.as_str().into(), json_to_amqp_value(v));
            }
            AMQPValue::FieldTable(table)
        }
    }
}
