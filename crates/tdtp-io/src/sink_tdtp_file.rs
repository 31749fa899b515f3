//! TDTP file sink: each part is written to its own file, named per the
//! `<base>_part_<N>_of_<total><ext>` convention (or, for a still-streaming
//! part whose total isn't known yet, the generator's provisional name).

use std::path::PathBuf;

use async_trait::async_trait;
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::generator::part_file_name;
use tdtp_proto::packet::Packet;
use tracing::info;

use crate::sink::Sink;

pub struct TdtpFileSink {
    dir: PathBuf,
    base_name: String,
    extension: String,
    pretty: bool,
}

impl TdtpFileSink {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>, extension: impl Into<String>, pretty: bool) -> Self {
        TdtpFileSink {
            dir: dir.into(),
            base_name: base_name.into(),
            extension: extension.into(),
            pretty,
        }
    }
}

#[async_trait]
impl Sink for TdtpFileSink {
    async fn write_part(&mut self, packet: &Packet) -> Result<()> {
        let total = packet.header.total_parts.filter(|&t| t > 0).unwrap_or(1);
        let part = packet.header.part_number.filter(|&p| p > 0).unwrap_or(1);
        let file_name = part_file_name(&self.base_name, part, total, &self.extension);
        let path = self.dir.join(file_name);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TdtpError::Other(e.into()))?;
        let bytes = packet.emit(self.pretty)?;
        tokio::fs::write(&path, &bytes).await.map_err(|e| TdtpError::Other(e.into()))?;
        info!(path = %path.display(), rows = packet.data.rows.len(), "wrote TDTP part file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_proto::packet::{Data, Header, HeaderType};
    use tdtp_proto::schema::{Field, Schema};
    use tdtp_proto::value::FieldType;

    fn sample_packet(part: u32, total: u32) -> Packet {
        Packet {
            version: "1.0".to_string(),
            header: Header {
                header_type: HeaderType::Response,
                table_name: "orders".to_string(),
                message_id: format!("m1-P{part}"),
                in_reply_to: Some("req-1".to_string()),
                part_number: Some(part),
                total_parts: Some(total),
                records_in_part: Some(1),
                timestamp: chrono::Utc::now(),
                sender: None,
                recipient: None,
            },
            query: None,
            query_context: None,
            schema: Schema::new(vec![Field::new("id", FieldType::Integer)]),
            data: Data {
                compression: None,
                checksum: None,
                rows: vec!["1".to_string()],
            },
            alarm_details: None,
        }
    }

    #[tokio::test]
    async fn writes_one_file_per_part_with_the_chosen_naming_convention() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TdtpFileSink::new(dir.path(), "orders_export", ".xml", false);
        sink.write_part(&sample_packet(1, 2)).await.unwrap();
        sink.write_part(&sample_packet(2, 2)).await.unwrap();

        assert!(dir.path().join("orders_export_part_1_of_2.xml").exists());
        assert!(dir.path().join("orders_export_part_2_of_2.xml").exists());
    }
}
