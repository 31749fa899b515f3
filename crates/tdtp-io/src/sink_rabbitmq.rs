//! RabbitMQ sink: publishes each part as one message on a direct exchange.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::packet::Packet;
use tracing::info;

use crate::sink::Sink;

pub struct RabbitMqSink {
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl RabbitMqSink {
    pub async fn connect(uri: &str, exchange: impl Into<String>, queue: impl Into<String>, routing_key: impl Into<String>) -> Result<Self> {
        let exchange = exchange.into();
        let queue = queue.into();
        let routing_key = routing_key.into();

        let conn = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        let channel = conn.create_channel().await.map_err(|e| TdtpError::Connection(e.to_string()))?;

        channel
            .exchange_declare(&exchange, ExchangeKind::Direct, ExchangeDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        channel
            .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        channel
            .queue_bind(&queue, &exchange, &routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;

        Ok(RabbitMqSink {
            channel,
            exchange,
            routing_key,
        })
    }
}

#[async_trait]
impl Sink for RabbitMqSink {
    async fn write_part(&mut self, packet: &Packet) -> Result<()> {
        let payload = packet.emit(false)?;
        self.channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        info!(exchange = %self.exchange, routing_key = %self.routing_key, "published TDTP part to rabbitmq");
        Ok(())
    }
}
