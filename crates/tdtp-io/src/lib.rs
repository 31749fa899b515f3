//! Sink implementations for the ETL processor's emit stage: TDTP part
//! files, Kafka, RabbitMQ, and XLSX.

pub mod sink;
pub mod sink_kafka;
pub mod sink_rabbitmq;
pub mod sink_tdtp_file;
pub mod sink_xlsx;

pub use sink::Sink;
pub use sink_kafka::KafkaSink;
pub use sink_rabbitmq::RabbitMqSink;
pub use sink_tdtp_file::TdtpFileSink;
pub use sink_xlsx::XlsxSink;
