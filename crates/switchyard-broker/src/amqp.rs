//! AMQP 0-9-1 backend built on lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TransportError};
use crate::traits::{Acknowledger, Broker, BrokerChannel, BrokerConnection, DeliveryStream};
use crate::types::{
    AckMode, BrokerEndpoint, Credentials, Delivery, Headers, MessageProperties, OutboundMessage,
    QueueSpec,
};

/// Connects to a real broker over the network.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    connection_name: String,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self {
            connection_name: "switchyard".to_string(),
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

impl Default for AmqpBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn amqp_uri(endpoint: &BrokerEndpoint, credentials: &Credentials) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: credentials.username().to_string(),
                password: credentials.expose_password().to_string(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.vhost.clone(),
        ..AMQPUri::default()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));
        let connection = Connection::connect_uri(amqp_uri(endpoint, credentials), properties)
            .await
            .map_err(|e| match TransportError::from(e) {
                TransportError::Protocol(reason) => TransportError::ConnectionRefused(reason),
                other => other,
            })?;
        debug!(endpoint = %endpoint, user = %credentials.username(), "amqp connection opened");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Box::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_open() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .inner
            .queue_declare(&spec.name, options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(name, ExchangeKind::Direct, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
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

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream> {
        let no_ack = mode == AckMode::OnDelivery;
        let tag = format!("switchyard-{}", Uuid::new_v4().simple());
        let options = BasicConsumeOptions {
            no_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, &tag, options, FieldTable::default())
            .await?;

        let stream = consumer.map(move |item| {
            item.map(|delivery| convert_delivery(delivery, no_ack))
                .map_err(TransportError::from)
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let properties = outbound_properties(&message.properties);
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    inner: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.inner.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.inner.nack(options).await?;
        Ok(())
    }
}

fn outbound_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(kind) = &props.message_type {
        properties = properties.with_kind(ShortString::from(kind.clone()));
    }
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if !props.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &props.headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        properties = properties.with_headers(table);
    }
    properties
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortUInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongUInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        _ => None,
    }
}

fn inbound_properties(props: &BasicProperties) -> MessageProperties {
    let headers: Headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_value(value).map(|v| (key.as_str().to_string(), v))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        message_type: props.kind().as_ref().map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        headers,
    }
}

fn convert_delivery(delivery: lapin::message::Delivery, no_ack: bool) -> Delivery {
    let lapin::message::Delivery {
        data,
        properties,
        exchange,
        routing_key,
        redelivered,
        acker,
        ..
    } = delivery;

    let converted = Delivery::new(data, inbound_properties(&properties))
        .with_route(exchange.as_str(), routing_key.as_str())
        .with_redelivered(redelivered);
    if no_ack {
        converted
    } else {
        converted.with_acker(Arc::new(AmqpAcker { inner: acker }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_carries_endpoint_and_credentials() {
        let uri = amqp_uri(
            &BrokerEndpoint::new("mq.internal", 5673, "prod"),
            &Credentials::new("LLM_0@prod", "secret"),
        );
        assert_eq!(uri.authority.host, "mq.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "LLM_0@prod");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.vhost, "prod");
    }

    #[test]
    fn properties_survive_conversion() {
        let props = MessageProperties::default()
            .with_reply_to("amq.gen-abc")
            .with_correlation_id("123")
            .with_message_type("Ping")
            .with_content_type("application/json")
            .with_header("StatusCode", "200");

        let back = inbound_properties(&outbound_properties(&props));
        assert_eq!(back, props);
    }

    #[test]
    fn numeric_headers_are_stringified() {
        assert_eq!(
            header_value(&AMQPValue::LongInt(404)).as_deref(),
            Some("404")
        );
        assert_eq!(header_value(&AMQPValue::Void), None);
    }
}
