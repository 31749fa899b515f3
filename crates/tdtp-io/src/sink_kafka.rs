//! Kafka sink: publishes each part as one message, keyed by batch identity
//! so a consumer's partition assignment keeps all parts of one batch together.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::packet::Packet;
use tracing::info;

use crate::sink::Sink;

pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaSink {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        Ok(KafkaSink {
            producer,
            topic: topic.into(),
        })
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn write_part(&mut self, packet: &Packet) -> Result<()> {
        let key = packet.batch_identity().to_string();
        let payload = packet.emit(false)?;
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        self.producer
            .send(record, std::time::Duration::from_secs(30))
            .await
            .map_err(|(e, _)| TdtpError::Connection(e.to_string()))?;
        info!(topic = %self.topic, key = %key, "published TDTP part to kafka");
        Ok(())
    }
}
