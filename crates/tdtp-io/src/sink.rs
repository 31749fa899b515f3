//! Sink trait: the output side of the ETL processor's emit stage. Parts
//! already come out of the streaming generator as complete [`Packet`]s, so
//! every sink just needs to persist or publish one part at a time.

use async_trait::async_trait;
use tdtp_proto::error::Result;
use tdtp_proto::packet::Packet;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Writes or publishes one part. Called once per packet in the
    /// emitted sequence, in `PartNumber` order.
    async fn write_part(&mut self, packet: &Packet) -> Result<()>;

    /// Called once after the last part has been written successfully.
    /// Sinks that batch everything into a single artifact (XLSX) do their
    /// real work here; streaming sinks default to a no-op.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
