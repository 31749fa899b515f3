//! Packet codec (C1): parse/emit the `<DataPacket>` XML envelope, and the
//! pipe-delimited row escaping contract shared by every row in every part.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::error::{Result, TdtpError};
use crate::query::{
    ast::{BoolOp, CompareOp, Filter, FilterNode, OrderKey, PredicateMatch},
    Query, QueryContext,
};
use crate::schema::{Field, Schema};
use crate::value::FieldType;

const PROTOCOL: &str = "TDTP";

/// Escapes field values for the pipe-delimited row encoding: `\` becomes
/// `\\`, then `|` becomes `\|`; fields are joined with unescaped `|`.
pub fn escape_row_fields(values: &[String]) -> String {
    values
        .iter()
        .map(|v| v.replace('\\', "\\\\").replace('|', "\\|"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Reverses [`escape_row_fields`]: a left-to-right scan with an `escaped`
/// flag. Seeing `\` arms the flag and the next character is appended
/// literally; an unescaped `|` terminates the current field. A trailing
/// armed backslash is appended as a literal `\`.
pub fn split_row_fields(row: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in row.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '|' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    fields.push(current);
    fields
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Reference,
    Request,
    Response,
    Alarm,
}

impl HeaderType {
    fn as_str(&self) -> &'static str {
        match self {
            HeaderType::Reference => "reference",
            HeaderType::Request => "request",
            HeaderType::Response => "response",
            HeaderType::Alarm => "alarm",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "reference" => HeaderType::Reference,
            "request" => HeaderType::Request,
            "response" => HeaderType::Response,
            "alarm" => HeaderType::Alarm,
            other => return Err(TdtpError::validation(format!("unknown header type '{other}'"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub header_type: HeaderType,
    pub table_name: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub part_number: Option<u32>,
    pub total_parts: Option<u32>,
    pub records_in_part: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
}

impl Header {
    /// The batch identity: `MessageID` with its trailing `-P<n>` suffix stripped.
    pub fn batch_identity(&self) -> &str {
        strip_part_suffix(&self.message_id)
    }
}

fn strip_part_suffix(message_id: &str) -> &str {
    if let Some(idx) = message_id.rfind("-P") {
        if message_id[idx + 2..].chars().all(|c| c.is_ascii_digit()) && !message_id[idx + 2..].is_empty() {
            return &message_id[..idx];
        }
    }
    message_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlarmSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            AlarmSeverity::Info => "info",
            AlarmSeverity::Warning => "warning",
            AlarmSeverity::Error => "error",
            AlarmSeverity::Critical => "critical",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "info" => AlarmSeverity::Info,
            "warning" => AlarmSeverity::Warning,
            "error" => AlarmSeverity::Error,
            "critical" => AlarmSeverity::Critical,
            other => return Err(TdtpError::validation(format!("unknown alarm severity '{other}'"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AlarmDetails {
    pub code: String,
    pub message: String,
    pub severity: AlarmSeverity,
}

#[derive(Debug, Clone, Default)]
pub struct Data {
    /// Currently only `zstd` is recognized.
    pub compression: Option<String>,
    /// Hex XXH3 of the compressed bytes.
    pub checksum: Option<String>,
    /// Raw pipe-delimited row strings (or a single base64 blob when compressed).
    pub rows: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub version: String,
    pub header: Header,
    pub query: Option<Query>,
    pub query_context: Option<QueryContext>,
    pub schema: Schema,
    pub data: Data,
    pub alarm_details: Option<AlarmDetails>,
}

impl Packet {
    pub fn batch_identity(&self) -> &str {
        self.header.batch_identity()
    }

    /// Opportunistically compresses the Data section in place: rows are
    /// `\n`-joined, zstd-compressed at `level`, base64-encoded into a single
    /// row, and the checksum of the encoded blob is recorded. Payloads
    /// smaller than `min_size` are left uncompressed. Returns whether
    /// compression was applied.
    pub fn compress_data(&mut self, level: i32, min_size: usize) -> Result<bool> {
        if self.data.compression.is_some() {
            return Ok(true);
        }
        match crate::compress::compress_rows(&self.data.rows, level, min_size)? {
            Some((blob, _stats)) => {
                self.data.checksum = Some(crate::compress::checksum(blob.as_bytes()));
                self.data.compression = Some("zstd".to_string());
                self.data.rows = vec![blob];
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Recovers the Data section's row strings. For a compressed packet the
    /// checksum (when present) is verified against the stored blob before
    /// any decompression is attempted.
    pub fn decoded_rows(&self) -> Result<Vec<String>> {
        match &self.data.compression {
            Some(alg) if alg == "zstd" => {
                let blob = self.data.rows.first().cloned().unwrap_or_default();
                if let Some(expected) = &self.data.checksum {
                    crate::compress::verify(blob.as_bytes(), expected)?;
                }
                crate::compress::decompress_blob(&blob)
            }
            Some(other) => Err(TdtpError::Compression(format!(
                "unsupported compression '{other}'"
            ))),
            None => Ok(self.data.rows.clone()),
        }
    }

    /// Structural validation run on every parse.
    pub fn validate(&self) -> Result<()> {
        if self.header.table_name.is_empty() {
            return Err(TdtpError::validation("Header.TableName is required"));
        }
        if self.header.message_id.is_empty() {
            return Err(TdtpError::validation("Header.MessageID is required"));
        }
        if self.header.header_type == HeaderType::Response && self.header.in_reply_to.as_deref().unwrap_or("").is_empty() {
            return Err(TdtpError::validation("response packets require InReplyTo"));
        }
        let any_part_field_set = self.header.part_number.is_some()
            || self.header.total_parts.is_some()
            || self.header.records_in_part.is_some();
        if any_part_field_set {
            let (part, total) = match (self.header.part_number, self.header.total_parts) {
                (Some(p), Some(t)) => (p, t),
                _ => {
                    return Err(TdtpError::validation(
                        "if any part-numbering field is set, PartNumber and TotalParts must both be set",
                    ))
                }
            };
            if part < 1 || part > total {
                return Err(TdtpError::validation(format!(
                    "PartNumber {part} out of range 1..={total}"
                )));
            }
        }
        if !self.data.rows.is_empty() && self.schema.fields.is_empty() {
            return Err(TdtpError::validation("Schema must be non-empty when Data has rows"));
        }
        Ok(())
    }

    /// Emits the packet as UTF-8 XML bytes.
    pub fn emit(&self, pretty: bool) -> Result<Vec<u8>> {
        let mut writer = if pretty {
            Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2)
        } else {
            Writer::new(Cursor::new(Vec::new()))
        };

        let mut root = BytesStart::new("DataPacket");
        root.push_attribute(("protocol", PROTOCOL));
        root.push_attribute(("version", self.version.as_str()));
        writer
            .write_event(Event::Start(root))
            .map_err(xml_err)?;

        write_header(&mut writer, &self.header)?;
        if let Some(q) = &self.query {
            write_query(&mut writer, q)?;
        }
        if let Some(qc) = &self.query_context {
            write_query_context(&mut writer, qc)?;
        }
        write_schema(&mut writer, &self.schema)?;
        write_data(&mut writer, &self.data)?;
        if let Some(alarm) = &self.alarm_details {
            write_alarm(&mut writer, alarm)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("DataPacket")))
            .map_err(xml_err)?;

        Ok(writer.into_inner().into_inner())
    }

    /// Parses a packet from UTF-8 XML bytes and validates it.
    pub fn parse(bytes: &[u8]) -> Result<Packet> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let mut version = None;
        let mut header = None;
        let mut query = None;
        let mut query_context = None;
        let mut schema = None;
        let mut data = None;
        let mut alarm_details = None;

        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf).map_err(xml_err)? {
                Event::Start(e) if e.name() == QName(b"DataPacket") => {
                    let protocol = attr(&e, "protocol")?.unwrap_or_default();
                    if protocol != PROTOCOL {
                        return Err(TdtpError::validation(format!("unexpected protocol '{protocol}'")));
                    }
                    version = Some(attr(&e, "version")?.ok_or_else(|| TdtpError::validation("missing version"))?);
                }
                Event::Start(e) if e.name() == QName(b"Header") => {
                    header = Some(read_header(&mut reader, &e)?);
                }
                Event::Start(e) if e.name() == QName(b"Query") => {
                    query = Some(read_query(&mut reader)?);
                }
                Event::Start(e) if e.name() == QName(b"QueryContext") => {
                    query_context = Some(read_query_context(&mut reader)?);
                }
                Event::Start(e) if e.name() == QName(b"Schema") => {
                    schema = Some(read_schema(&mut reader)?);
                }
                Event::Empty(e) if e.name() == QName(b"Schema") => {
                    schema = Some(Schema::new(Vec::new()));
                }
                Event::Start(e) if e.name() == QName(b"Data") => {
                    data = Some(read_data(&mut reader, &e)?);
                }
                Event::Empty(e) if e.name() == QName(b"Data") => {
                    data = Some(Data::default());
                }
                Event::Start(e) if e.name() == QName(b"AlarmDetails") => {
                    alarm_details = Some(read_alarm(&mut reader)?);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let header = header.ok_or_else(|| TdtpError::validation("missing Header"))?;
        let packet = Packet {
            version: version.ok_or_else(|| TdtpError::validation("missing version"))?,
            header,
            query,
            query_context,
            schema: schema.ok_or_else(|| TdtpError::validation("missing Schema"))?,
            data: data.ok_or_else(|| TdtpError::validation("missing Data"))?,
            alarm_details,
        };
        packet.validate()?;
        Ok(packet)
    }
}

fn xml_err(e: impl std::fmt::Display) -> TdtpError {
    TdtpError::Serialization(format!("xml error: {e}"))
}

fn attr(e: &BytesStart, name: &str) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|e| TdtpError::Serialization(e.to_string()))?;
        if a.key.as_ref() == name.as_bytes() {
            return Ok(Some(a.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

fn read_text_element(reader: &mut Reader<&[u8]>, tag: &str) -> Result<String> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Text(t) => text.push_str(&t.unescape().map_err(xml_err)?),
            Event::End(e) if e.name().as_ref() == tag.as_bytes() => break,
            Event::Eof => return Err(TdtpError::validation(format!("unexpected EOF in <{tag}>"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_err)?;
    Ok(())
}

// ---- Header ----

fn write_header(writer: &mut Writer<Cursor<Vec<u8>>>, header: &Header) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("Header"))).map_err(xml_err)?;
    write_text_element(writer, "Type", header.header_type.as_str())?;
    write_text_element(writer, "TableName", &header.table_name)?;
    write_text_element(writer, "MessageID", &header.message_id)?;
    if let Some(v) = &header.in_reply_to {
        write_text_element(writer, "InReplyTo", v)?;
    }
    if let Some(v) = header.part_number {
        write_text_element(writer, "PartNumber", &v.to_string())?;
    }
    if let Some(v) = header.total_parts {
        write_text_element(writer, "TotalParts", &v.to_string())?;
    }
    if let Some(v) = header.records_in_part {
        write_text_element(writer, "RecordsInPart", &v.to_string())?;
    }
    write_text_element(
        writer,
        "Timestamp",
        &header.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    )?;
    if let Some(v) = &header.sender {
        write_text_element(writer, "Sender", v)?;
    }
    if let Some(v) = &header.recipient {
        write_text_element(writer, "Recipient", v)?;
    }
    writer.write_event(Event::End(BytesEnd::new("Header"))).map_err(xml_err)?;
    Ok(())
}

fn read_header(reader: &mut Reader<&[u8]>, _start: &BytesStart) -> Result<Header> {
    let mut header_type = None;
    let mut table_name = None;
    let mut message_id = None;
    let mut in_reply_to = None;
    let mut part_number = None;
    let mut total_parts = None;
    let mut records_in_part = None;
    let mut timestamp = None;
    let mut sender = None;
    let mut recipient = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let text = read_text_element(reader, &name)?;
                match name.as_str() {
                    "Type" => header_type = Some(HeaderType::parse(&text)?),
                    "TableName" => table_name = Some(text),
                    "MessageID" => message_id = Some(text),
                    "InReplyTo" => in_reply_to = Some(text),
                    "PartNumber" => part_number = Some(parse_u32(&text)?),
                    "TotalParts" => total_parts = Some(parse_u32(&text)?),
                    "RecordsInPart" => records_in_part = Some(parse_u32(&text)?),
                    "Timestamp" => {
                        timestamp = Some(
                            DateTime::parse_from_rfc3339(&text)
                                .map_err(|e| TdtpError::validation(format!("invalid Timestamp: {e}")))?
                                .with_timezone(&Utc),
                        )
                    }
                    "Sender" => sender = Some(text),
                    "Recipient" => recipient = Some(text),
                    _ => {}
                }
            }
            Event::End(e) if e.name() == QName(b"Header") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in Header")),
            _ => {}
        }
        buf.clear();
    }

    Ok(Header {
        header_type: header_type.ok_or_else(|| TdtpError::validation("Header.Type is required"))?,
        table_name: table_name.ok_or_else(|| TdtpError::validation("Header.TableName is required"))?,
        message_id: message_id.ok_or_else(|| TdtpError::validation("Header.MessageID is required"))?,
        in_reply_to,
        part_number,
        total_parts,
        records_in_part,
        timestamp: timestamp.ok_or_else(|| TdtpError::validation("Header.Timestamp is required"))?,
        sender,
        recipient,
    })
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse().map_err(|_| TdtpError::validation(format!("expected integer, got '{s}'")))
}

// ---- Schema ----

fn write_schema(writer: &mut Writer<Cursor<Vec<u8>>>, schema: &Schema) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("Schema"))).map_err(xml_err)?;
    for field in &schema.fields {
        let mut el = BytesStart::new("Field");
        el.push_attribute(("name", field.name.as_str()));
        el.push_attribute(("type", field.field_type.as_str()));
        if let Some(len) = field.length {
            el.push_attribute(("length", len.to_string().as_str()));
        }
        if let Some(p) = field.precision {
            el.push_attribute(("precision", p.to_string().as_str()));
        }
        if let Some(s) = field.scale {
            el.push_attribute(("scale", s.to_string().as_str()));
        }
        if field.key {
            el.push_attribute(("key", "true"));
        }
        if let Some(tz) = &field.timezone {
            el.push_attribute(("timezone", tz.as_str()));
        }
        if let Some(st) = &field.subtype {
            el.push_attribute(("subtype", st.as_str()));
        }
        if field.read_only {
            el.push_attribute(("readOnly", "true"));
        }
        writer.write_event(Event::Empty(el)).map_err(xml_err)?;
    }
    writer.write_event(Event::End(BytesEnd::new("Schema"))).map_err(xml_err)?;
    Ok(())
}

fn read_schema(reader: &mut Reader<&[u8]>) -> Result<Schema> {
    let mut fields = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Empty(e) if e.name() == QName(b"Field") => {
                fields.push(parse_field_attrs(&e)?);
            }
            Event::End(e) if e.name() == QName(b"Schema") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in Schema")),
            _ => {}
        }
        buf.clear();
    }
    Ok(Schema::new(fields))
}

fn parse_field_attrs(e: &BytesStart) -> Result<Field> {
    let name = attr(e, "name")?.ok_or_else(|| TdtpError::validation("Field missing name"))?;
    let field_type = FieldType::parse(&attr(e, "type")?.ok_or_else(|| TdtpError::validation("Field missing type"))?)?;
    Ok(Field {
        name,
        field_type,
        length: attr(e, "length")?.and_then(|v| v.parse().ok()),
        precision: attr(e, "precision")?.and_then(|v| v.parse().ok()),
        scale: attr(e, "scale")?.and_then(|v| v.parse().ok()),
        key: attr(e, "key")?.as_deref() == Some("true"),
        timezone: attr(e, "timezone")?,
        subtype: attr(e, "subtype")?,
        read_only: attr(e, "readOnly")?.as_deref() == Some("true"),
    })
}

// ---- Data ----

fn write_data(writer: &mut Writer<Cursor<Vec<u8>>>, data: &Data) -> Result<()> {
    let mut el = BytesStart::new("Data");
    if let Some(c) = &data.compression {
        el.push_attribute(("compression", c.as_str()));
    }
    if let Some(c) = &data.checksum {
        el.push_attribute(("checksum", c.as_str()));
    }
    writer.write_event(Event::Start(el)).map_err(xml_err)?;
    for row in &data.rows {
        write_text_element(writer, "R", row)?;
    }
    writer.write_event(Event::End(BytesEnd::new("Data"))).map_err(xml_err)?;
    Ok(())
}

fn read_data(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Data> {
    let compression = attr(start, "compression")?;
    let checksum = attr(start, "checksum")?;
    let mut rows = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if e.name() == QName(b"R") => {
                rows.push(read_text_element(reader, "R")?);
            }
            Event::Empty(e) if e.name() == QName(b"R") => {
                rows.push(String::new());
            }
            Event::End(e) if e.name() == QName(b"Data") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in Data")),
            _ => {}
        }
        buf.clear();
    }
    Ok(Data {
        compression,
        checksum,
        rows,
    })
}

// ---- AlarmDetails ----

fn write_alarm(writer: &mut Writer<Cursor<Vec<u8>>>, alarm: &AlarmDetails) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("AlarmDetails"))).map_err(xml_err)?;
    write_text_element(writer, "Code", &alarm.code)?;
    write_text_element(writer, "Message", &alarm.message)?;
    write_text_element(writer, "Severity", alarm.severity.as_str())?;
    writer.write_event(Event::End(BytesEnd::new("AlarmDetails"))).map_err(xml_err)?;
    Ok(())
}

fn read_alarm(reader: &mut Reader<&[u8]>) -> Result<AlarmDetails> {
    let mut code = None;
    let mut message = None;
    let mut severity = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let text = read_text_element(reader, &name)?;
                match name.as_str() {
                    "Code" => code = Some(text),
                    "Message" => message = Some(text),
                    "Severity" => severity = Some(AlarmSeverity::parse(&text)?),
                    _ => {}
                }
            }
            Event::End(e) if e.name() == QName(b"AlarmDetails") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in AlarmDetails")),
            _ => {}
        }
        buf.clear();
    }
    Ok(AlarmDetails {
        code: code.ok_or_else(|| TdtpError::validation("AlarmDetails.Code required"))?,
        message: message.ok_or_else(|| TdtpError::validation("AlarmDetails.Message required"))?,
        severity: severity.ok_or_else(|| TdtpError::validation("AlarmDetails.Severity required"))?,
    })
}

// ---- Query / QueryContext ----

fn write_query(writer: &mut Writer<Cursor<Vec<u8>>>, query: &Query) -> Result<()> {
    let mut el = BytesStart::new("Query");
    el.push_attribute(("language", "TDTQL"));
    el.push_attribute(("version", "1.0"));
    writer.write_event(Event::Start(el)).map_err(xml_err)?;
    write_query_body(writer, query)?;
    writer.write_event(Event::End(BytesEnd::new("Query"))).map_err(xml_err)?;
    Ok(())
}

fn write_query_body(writer: &mut Writer<Cursor<Vec<u8>>>, query: &Query) -> Result<()> {
    if let Some(tree) = &query.filters {
        writer.write_event(Event::Start(BytesStart::new("Filters"))).map_err(xml_err)?;
        write_filter_node(writer, tree)?;
        writer.write_event(Event::End(BytesEnd::new("Filters"))).map_err(xml_err)?;
    }
    if !query.order_by.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("OrderBy"))).map_err(xml_err)?;
        for key in &query.order_by {
            let mut el = BytesStart::new("Key");
            el.push_attribute(("field", key.field.as_str()));
            el.push_attribute(("direction", if key.descending { "DESC" } else { "ASC" }));
            writer.write_event(Event::Empty(el)).map_err(xml_err)?;
        }
        writer.write_event(Event::End(BytesEnd::new("OrderBy"))).map_err(xml_err)?;
    }
    if let Some(limit) = query.limit {
        write_text_element(writer, "Limit", &limit.to_string())?;
    }
    if let Some(offset) = query.offset {
        write_text_element(writer, "Offset", &offset.to_string())?;
    }
    Ok(())
}

fn write_filter_node(writer: &mut Writer<Cursor<Vec<u8>>>, node: &FilterNode) -> Result<()> {
    match node {
        FilterNode::Leaf(f) => {
            let mut el = BytesStart::new("Filter");
            el.push_attribute(("field", f.field.as_str()));
            el.push_attribute(("operator", f.operator.to_wire()));
            if let Some(v) = &f.value {
                el.push_attribute(("value", v.as_str()));
            }
            if let Some(v2) = &f.value2 {
                el.push_attribute(("value2", v2.as_str()));
            }
            writer.write_event(Event::Empty(el)).map_err(xml_err)?;
        }
        FilterNode::Group { op, children } => {
            let tag = match op {
                BoolOp::And => "And",
                BoolOp::Or => "Or",
            };
            writer.write_event(Event::Start(BytesStart::new(tag))).map_err(xml_err)?;
            for c in children {
                write_filter_node(writer, c)?;
            }
            writer.write_event(Event::End(BytesEnd::new(tag))).map_err(xml_err)?;
        }
    }
    Ok(())
}

fn write_query_context(writer: &mut Writer<Cursor<Vec<u8>>>, ctx: &QueryContext) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("QueryContext"))).map_err(xml_err)?;
    write_query_body(writer, &ctx.query)?;
    write_text_element(writer, "Total", &ctx.total.to_string())?;
    write_text_element(writer, "AfterFilter", &ctx.after_filter.to_string())?;
    write_text_element(writer, "Returned", &ctx.returned.to_string())?;
    write_text_element(writer, "MoreDataAvailable", if ctx.more_data_available { "true" } else { "false" })?;
    if let Some(n) = ctx.next_offset {
        write_text_element(writer, "NextOffset", &n.to_string())?;
    }
    if !ctx.predicate_matches.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("PredicateMatches"))).map_err(xml_err)?;
        for pm in &ctx.predicate_matches {
            let mut el = BytesStart::new("Predicate");
            el.push_attribute(("field", pm.field.as_str()));
            el.push_attribute(("operator", pm.operator.as_str()));
            el.push_attribute(("matches", pm.matches.to_string().as_str()));
            writer.write_event(Event::Empty(el)).map_err(xml_err)?;
        }
        writer.write_event(Event::End(BytesEnd::new("PredicateMatches"))).map_err(xml_err)?;
    }
    writer.write_event(Event::End(BytesEnd::new("QueryContext"))).map_err(xml_err)?;
    Ok(())
}

fn read_query(reader: &mut Reader<&[u8]>) -> Result<Query> {
    let mut filters = None;
    let mut order_by = Vec::new();
    let mut limit = None;
    let mut offset = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if e.name() == QName(b"Filters") => {
                filters = read_filters_body(reader)?;
            }
            Event::Start(e) if e.name() == QName(b"OrderBy") => {
                order_by = read_order_by(reader)?;
            }
            Event::Start(e) if e.name() == QName(b"Limit") => {
                limit = Some(read_text_element(reader, "Limit")?.parse().map_err(|_| TdtpError::validation("invalid Limit"))?);
            }
            Event::Start(e) if e.name() == QName(b"Offset") => {
                offset = Some(read_text_element(reader, "Offset")?.parse().map_err(|_| TdtpError::validation("invalid Offset"))?);
            }
            Event::End(e) if e.name() == QName(b"Query") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in Query")),
            _ => {}
        }
        buf.clear();
    }

    Ok(Query {
        filters,
        order_by,
        limit,
        offset,
    })
}

fn read_filters_body(reader: &mut Reader<&[u8]>) -> Result<Option<FilterNode>> {
    let mut node = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Empty(e) if e.name() == QName(b"Filter") => {
                node = Some(FilterNode::Leaf(parse_filter_attrs(&e)?));
            }
            Event::Start(e) if e.name() == QName(b"And") => {
                node = Some(FilterNode::Group {
                    op: BoolOp::And,
                    children: read_group_children(reader, "And")?,
                });
            }
            Event::Start(e) if e.name() == QName(b"Or") => {
                node = Some(FilterNode::Group {
                    op: BoolOp::Or,
                    children: read_group_children(reader, "Or")?,
                });
            }
            Event::End(e) if e.name() == QName(b"Filters") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in Filters")),
            _ => {}
        }
        buf.clear();
    }
    Ok(node)
}

fn read_group_children(reader: &mut Reader<&[u8]>, tag: &str) -> Result<Vec<FilterNode>> {
    let mut children = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Empty(e) if e.name() == QName(b"Filter") => {
                children.push(FilterNode::Leaf(parse_filter_attrs(&e)?));
            }
            Event::Start(e) if e.name() == QName(b"And") => {
                children.push(FilterNode::Group {
                    op: BoolOp::And,
                    children: read_group_children(reader, "And")?,
                });
            }
            Event::Start(e) if e.name() == QName(b"Or") => {
                children.push(FilterNode::Group {
                    op: BoolOp::Or,
                    children: read_group_children(reader, "Or")?,
                });
            }
            Event::End(e) if e.name().as_ref() == tag.as_bytes() => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in filter group")),
            _ => {}
        }
        buf.clear();
    }
    Ok(children)
}

fn parse_filter_attrs(e: &BytesStart) -> Result<Filter> {
    let field = attr(e, "field")?.ok_or_else(|| TdtpError::validation("Filter missing field"))?;
    let op_token = attr(e, "operator")?.ok_or_else(|| TdtpError::validation("Filter missing operator"))?;
    let operator = CompareOp::from_wire(&op_token)
        .ok_or_else(|| TdtpError::validation(format!("unknown operator '{op_token}'")))?;
    Ok(Filter {
        field,
        operator,
        value: attr(e, "value")?,
        value2: attr(e, "value2")?,
    })
}

fn read_order_by(reader: &mut Reader<&[u8]>) -> Result<Vec<OrderKey>> {
    let mut keys = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Empty(e) if e.name() == QName(b"Key") => {
                let field = attr(&e, "field")?.ok_or_else(|| TdtpError::validation("OrderBy.Key missing field"))?;
                let descending = attr(&e, "direction")?.as_deref() == Some("DESC");
                keys.push(OrderKey { field, descending });
            }
            Event::End(e) if e.name() == QName(b"OrderBy") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in OrderBy")),
            _ => {}
        }
        buf.clear();
    }
    Ok(keys)
}

fn read_query_context(reader: &mut Reader<&[u8]>) -> Result<QueryContext> {
    let mut query = Query::default();
    let mut total = 0;
    let mut after_filter = 0;
    let mut returned = 0;
    let mut more_data_available = false;
    let mut next_offset = None;
    let mut predicate_matches = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if e.name() == QName(b"Filters") => {
                query.filters = read_filters_body(reader)?;
            }
            Event::Start(e) if e.name() == QName(b"OrderBy") => {
                query.order_by = read_order_by(reader)?;
            }
            Event::Start(e) if e.name() == QName(b"Limit") => {
                query.limit = Some(read_text_element(reader, "Limit")?.parse().unwrap_or_default());
            }
            Event::Start(e) if e.name() == QName(b"Offset") => {
                query.offset = Some(read_text_element(reader, "Offset")?.parse().unwrap_or_default());
            }
            Event::Start(e) if e.name() == QName(b"Total") => {
                total = read_text_element(reader, "Total")?.parse().unwrap_or_default();
            }
            Event::Start(e) if e.name() == QName(b"AfterFilter") => {
                after_filter = read_text_element(reader, "AfterFilter")?.parse().unwrap_or_default();
            }
            Event::Start(e) if e.name() == QName(b"Returned") => {
                returned = read_text_element(reader, "Returned")?.parse().unwrap_or_default();
            }
            Event::Start(e) if e.name() == QName(b"MoreDataAvailable") => {
                more_data_available = read_text_element(reader, "MoreDataAvailable")? == "true";
            }
            Event::Start(e) if e.name() == QName(b"NextOffset") => {
                next_offset = read_text_element(reader, "NextOffset")?.parse().ok();
            }
            Event::Start(e) if e.name() == QName(b"PredicateMatches") => {
                predicate_matches = read_predicate_matches(reader)?;
            }
            Event::End(e) if e.name() == QName(b"QueryContext") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in QueryContext")),
            _ => {}
        }
        buf.clear();
    }

    Ok(QueryContext {
        query,
        total,
        after_filter,
        returned,
        more_data_available,
        next_offset,
        predicate_matches,
    })
}

fn read_predicate_matches(reader: &mut Reader<&[u8]>) -> Result<Vec<PredicateMatch>> {
    let mut out = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Empty(e) if e.name() == QName(b"Predicate") => {
                out.push(PredicateMatch {
                    field: attr(&e, "field")?.unwrap_or_default(),
                    operator: attr(&e, "operator")?.unwrap_or_default(),
                    matches: attr(&e, "matches")?.and_then(|v| v.parse().ok()).unwrap_or(0),
                });
            }
            Event::End(e) if e.name() == QName(b"PredicateMatches") => break,
            Event::Eof => return Err(TdtpError::validation("unexpected EOF in PredicateMatches")),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldType;

    #[test]
    fn escape_round_trip_corner_case() {
        let fields = vec!["C:\\path|to|file".to_string(), "value2".to_string()];
        let joined = escape_row_fields(&fields);
        assert_eq!(joined, "C:\\\\path\\|to\\|file|value2");
        assert_eq!(split_row_fields(&joined), fields);
    }

    #[test]
    fn escape_round_trip_is_total() {
        let cases: Vec<Vec<String>> = vec![
            vec!["".to_string()],
            vec!["".to_string(), "".to_string()],
            vec!["a\\b".to_string()],
            vec!["trailing\\".to_string()],
            vec!["pipe|here".to_string(), "more\\|mixed".to_string()],
        ];
        for fields in cases {
            let joined = escape_row_fields(&fields);
            assert_eq!(split_row_fields(&joined), fields);
        }
    }

    fn minimal_packet() -> Packet {
        Packet {
            version: "1.0".to_string(),
            header: Header {
                header_type: HeaderType::Reference,
                table_name: "customers".to_string(),
                message_id: "BATCH-001-P1".to_string(),
                in_reply_to: None,
                part_number: Some(1),
                total_parts: Some(1),
                records_in_part: Some(1),
                timestamp: Utc::now(),
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

    #[test]
    fn emit_then_parse_round_trips() {
        let packet = minimal_packet();
        let xml = packet.emit(false).unwrap();
        let parsed = Packet::parse(&xml).unwrap();
        assert_eq!(parsed.header.table_name, "customers");
        assert_eq!(parsed.header.message_id, "BATCH-001-P1");
        assert_eq!(parsed.schema.fields.len(), 1);
        assert_eq!(parsed.data.rows, vec!["1".to_string()]);
    }

    #[test]
    fn response_without_in_reply_to_is_rejected() {
        let mut packet = minimal_packet();
        packet.header.header_type = HeaderType::Response;
        packet.header.in_reply_to = None;
        assert!(packet.validate().is_err());
    }

    #[test]
    fn part_number_out_of_range_is_rejected() {
        let mut packet = minimal_packet();
        packet.header.part_number = Some(3);
        packet.header.total_parts = Some(2);
        assert!(packet.validate().is_err());
    }

    #[test]
    fn batch_identity_strips_part_suffix() {
        let mut packet = minimal_packet();
        packet.header.message_id = "BATCH-001-P7".to_string();
        assert_eq!(packet.batch_identity(), "BATCH-001");
    }

    #[test]
    fn rows_without_schema_is_rejected() {
        let mut packet = minimal_packet();
        packet.schema = Schema::new(Vec::new());
        assert!(packet.validate().is_err());
    }

    #[test]
    fn compressed_data_round_trips_through_emit_and_parse() {
        let mut packet = minimal_packet();
        packet.data.rows = (0..200).map(|i| format!("{i}|row-{i}-padding-padding")).collect();
        let original_rows = packet.data.rows.clone();
        packet.header.records_in_part = Some(original_rows.len() as u32);

        assert!(packet.compress_data(3, 1024).unwrap());
        assert_eq!(packet.data.compression.as_deref(), Some("zstd"));
        assert!(packet.data.checksum.is_some());
        assert_eq!(packet.data.rows.len(), 1);

        let xml = packet.emit(false).unwrap();
        let parsed = Packet::parse(&xml).unwrap();
        assert_eq!(parsed.decoded_rows().unwrap(), original_rows);
    }

    #[test]
    fn tampered_blob_fails_checksum_before_decompression() {
        let mut packet = minimal_packet();
        packet.data.rows = (0..200).map(|i| format!("{i}|row-{i}-padding-padding")).collect();
        packet.compress_data(3, 1024).unwrap();

        let mut blob = packet.data.rows[0].clone().into_bytes();
        blob[0] ^= 0x01;
        packet.data.rows[0] = String::from_utf8(blob).unwrap();

        let err = packet.decoded_rows().unwrap_err();
        assert!(matches!(err, TdtpError::ChecksumMismatch { .. }));
    }

    #[test]
    fn small_payload_is_left_uncompressed() {
        let mut packet = minimal_packet();
        assert!(!packet.compress_data(3, 1024).unwrap());
        assert!(packet.data.compression.is_none());
    }
}
