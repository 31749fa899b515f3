//! XLSX sink: unlike the streaming sinks, a workbook is one artifact, so
//! parts accumulate in memory and the whole sheet is written on `finish`.

use async_trait::async_trait;
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::packet::{split_row_fields, Packet};
use tdtp_proto::schema::Schema;
use xlsxwriter::Workbook;

use crate::sink::Sink;

pub struct XlsxSink {
    path: String,
    sheet_name: String,
    schema: Option<Schema>,
    rows: Vec<Vec<String>>,
}

impl XlsxSink {
    pub fn new(path: impl Into<String>, sheet_name: impl Into<String>) -> Self {
        XlsxSink {
            path: path.into(),
            sheet_name: sheet_name.into(),
            schema: None,
            rows: Vec::new(),
        }
    }
}

#[async_trait]
impl Sink for XlsxSink {
    async fn write_part(&mut self, packet: &Packet) -> Result<()> {
        if self.schema.is_none() {
            self.schema = Some(packet.schema.clone());
        }
        for row in packet.decoded_rows()? {
            self.rows.push(split_row_fields(&row));
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let schema = self
            .schema
            .clone()
            .unwrap_or_else(|| Schema::new(Vec::new()));
        let path = self.path.clone();
        let sheet_name = self.sheet_name.clone();
        let rows = std::mem::take(&mut self.rows);

        tokio::task::spawn_blocking(move || write_workbook(&path, &sheet_name, &schema, &rows))
            .await
            .map_err(|e| TdtpError::Other(e.into()))??;
        Ok(())
    }
}

fn write_workbook(path: &str, sheet_name: &str, schema: &Schema, rows: &[Vec<String>]) -> Result<()> {
    let workbook = Workbook::new(path).map_err(|e| TdtpError::Serialization(e.to_string()))?;
    let mut sheet = workbook
        .add_worksheet(Some(sheet_name))
        .map_err(|e| TdtpError::Serialization(e.to_string()))?;

    for (col, field) in schema.fields.iter().enumerate() {
        sheet
            .write_string(0, col as u16, &field.name, None)
            .map_err(|e| TdtpError::Serialization(e.to_string()))?;
    }
    for (row_idx, row) in rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            sheet
                .write_string((row_idx + 1) as u32, col as u16, value, None)
                .map_err(|e| TdtpError::Serialization(e.to_string()))?;
        }
    }
    workbook.close().map_err(|e| TdtpError::Serialization(e.to_string()))?;
    Ok(())
}
