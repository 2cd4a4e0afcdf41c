//! Message codecs for host-worker communication.
//!
//! Two wire variants implement [`MessageCodec`]:
//! - [`JsonCodec`]: line-delimited JSON, used on stream transports
//! - [`BinaryCodec`](super::binary::BinaryCodec): compact self-length-delimited
//!   schema, used on the shared-memory region
//!
//! Codecs are stateless values. Every outbound message is fully encoded into a
//! buffer before anything touches the transport, so an encode failure can never
//! leave a partial frame on the channel.

use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use super::binary::BinaryCodec;
use super::protocol::{
    ChannelType, Event, LogLevel, LogRecord, Outbound, Response, TaggedValue, Trigger, ValueKind,
    ValueMap, collect_entries,
};

/// Inbound payload could not be turned into a message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Framing(#[from] std::io::Error),

    #[error("unsupported value kind '{kind}' for key '{key}'")]
    UnsupportedValueKind { key: String, kind: String },

    #[error("value for key '{key}' is not a valid {kind}")]
    ValueMismatch { key: String, kind: ValueKind },

    #[error("unknown body encoding '{0}'")]
    UnknownBodyEncoding(String),

    #[error("invalid base64 in {field}: {source}")]
    InvalidBase64 {
        field: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("invalid datetime '{0}'")]
    InvalidDatetime(String),

    #[error("unknown log level '{0}'")]
    UnknownLogLevel(String),

    #[error("unknown channel type byte 0x{0:02x}")]
    UnknownChannelType(u8),

    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// Outbound message could not be represented on the wire.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("unsupported value for key '{key}': {reason}")]
    UnsupportedValue { key: String, reason: String },

    #[error("{field} is too large to encode ({len} bytes)")]
    TooLarge { field: &'static str, len: usize },

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("framing failed: {0}")]
    Framing(#[from] std::io::Error),
}

/// Converts between in-memory messages and wire payloads.
///
/// The worker side uses `decode_event`, `encode_response` and `encode_log`. The
/// host-side counterparts exist so hosts (and tests) can speak the same format.
pub trait MessageCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode_event(&self, raw: &[u8]) -> Result<Event, DecodeError>;

    fn encode_response(&self, response: &Response) -> Result<Bytes, EncodeError>;

    fn encode_log(&self, record: &LogRecord) -> Result<Bytes, EncodeError>;

    fn encode_event(&self, event: &Event) -> Result<Bytes, EncodeError>;

    /// Decode a worker → host message, dispatching on its channel-type byte.
    fn decode_outbound(&self, raw: &[u8]) -> Result<Outbound, DecodeError>;

    fn decode_response(&self, raw: &[u8]) -> Result<Response, DecodeError> {
        match self.decode_outbound(raw)? {
            Outbound::Response(response) => Ok(response),
            Outbound::Log(_) => Err(DecodeError::UnknownChannelType(ChannelType::Log.byte())),
        }
    }

    fn decode_log(&self, raw: &[u8]) -> Result<LogRecord, DecodeError> {
        match self.decode_outbound(raw)? {
            Outbound::Log(record) => Ok(record),
            Outbound::Response(_) => Err(DecodeError::UnknownChannelType(
                ChannelType::Response.byte(),
            )),
        }
    }
}

/// Selects one of the wire variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Binary,
}

impl WireFormat {
    pub fn codec(&self) -> Arc<dyn MessageCodec> {
        match self {
            Self::Json => Arc::new(JsonCodec::new()),
            Self::Binary => Arc::new(BinaryCodec::new()),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "binary" => Ok(Self::Binary),
            other => Err(format!(
                "invalid wire format '{other}', expected 'json' or 'binary'"
            )),
        }
    }
}

const BODY_ENCODING_BASE64: &str = "base64";
const BODY_ENCODING_TEXT: &str = "text";

/// Line-delimited JSON codec.
///
/// Inbound events are one JSON object per line. Outbound messages are a
/// channel-type byte, one JSON object and a newline. Timestamps travel as whole
/// seconds, so sub-second precision is dropped on both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    fn finish_line<T: Serialize>(prefix: Option<u8>, wire: &T) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        if let Some(prefix) = prefix {
            buf.put_u8(prefix);
        }
        let mut writer = buf.writer();
        serde_json::to_writer(&mut writer, wire)?;
        let mut buf = writer.into_inner();
        buf.put_u8(b'\n');
        let len = buf.len();
        tracing::trace!(json_size_bytes = len, "Encoding line");
        if len > 100_000 {
            tracing::info!(
                json_size_bytes = len,
                json_size_kb = len / 1024,
                "Large line being encoded"
            );
        }
        Ok(buf.freeze())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireTrigger {
    #[serde(default)]
    class: String,
    #[serde(default)]
    kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(default)]
    id: String,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    trigger: WireTrigger,
    #[serde(rename = "content-type", default)]
    content_type: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    body_encoding: Option<String>,
    #[serde(default)]
    size: i64,
    /// Whole seconds since the epoch.
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    path: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    shard_id: i64,
    #[serde(default)]
    num_shards: i64,
    #[serde(default)]
    headers: serde_json::Value,
    #[serde(default)]
    fields: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
    status_code: u16,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    body_encoding: Option<String>,
    #[serde(default)]
    headers: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireLog {
    level: String,
    message: String,
    datetime: String,
    #[serde(default)]
    with: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    key: String,
    #[serde(rename = "type")]
    kind: String,
    value: serde_json::Value,
}

fn decode_body(
    body: &str,
    encoding: Option<&str>,
    field: &str,
) -> Result<Vec<u8>, DecodeError> {
    match encoding.unwrap_or(BODY_ENCODING_BASE64) {
        BODY_ENCODING_BASE64 => BASE64
            .decode(body)
            .map_err(|source| DecodeError::InvalidBase64 {
                field: field.to_string(),
                source,
            }),
        BODY_ENCODING_TEXT => Ok(body.as_bytes().to_vec()),
        other => Err(DecodeError::UnknownBodyEncoding(other.to_string())),
    }
}

fn decode_tagged(key: &str, tag: &str, value: &serde_json::Value) -> Result<TaggedValue, DecodeError> {
    let kind = ValueKind::parse(tag).ok_or_else(|| DecodeError::UnsupportedValueKind {
        key: key.to_string(),
        kind: tag.to_string(),
    })?;
    let mismatch = || DecodeError::ValueMismatch {
        key: key.to_string(),
        kind,
    };
    match kind {
        ValueKind::String => value
            .as_str()
            .map(|s| TaggedValue::Str(s.to_string()))
            .ok_or_else(mismatch),
        ValueKind::Int64 => value.as_i64().map(TaggedValue::Int).ok_or_else(mismatch),
        ValueKind::Float64 => value.as_f64().map(TaggedValue::Float).ok_or_else(mismatch),
        ValueKind::Bytes => {
            let text = value.as_str().ok_or_else(mismatch)?;
            BASE64
                .decode(text)
                .map(TaggedValue::Bytes)
                .map_err(|source| DecodeError::InvalidBase64 {
                    field: key.to_string(),
                    source,
                })
        }
    }
}

/// Untyped value from a plain JSON object, as emitted by hosts that do not tag.
fn decode_untyped(key: &str, value: &serde_json::Value) -> Result<TaggedValue, DecodeError> {
    let unsupported = |kind: &str| DecodeError::UnsupportedValueKind {
        key: key.to_string(),
        kind: kind.to_string(),
    };
    match value {
        serde_json::Value::String(s) => Ok(TaggedValue::Str(s.clone())),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(TaggedValue::Int(i)),
            None => n
                .as_f64()
                .map(TaggedValue::Float)
                .ok_or_else(|| unsupported("number")),
        },
        serde_json::Value::Null => Err(unsupported("null")),
        serde_json::Value::Bool(_) => Err(unsupported("bool")),
        serde_json::Value::Array(_) => Err(unsupported("array")),
        serde_json::Value::Object(_) => Err(unsupported("object")),
    }
}

fn decode_map(value: &serde_json::Value) -> Result<ValueMap, DecodeError> {
    match value {
        serde_json::Value::Null => Ok(ValueMap::new()),
        serde_json::Value::Array(entries) => {
            let decoded = entries
                .iter()
                .map(|entry| -> Result<_, DecodeError> {
                    let entry: WireEntry = serde_json::from_value(entry.clone())?;
                    let value = decode_tagged(&entry.key, &entry.kind, &entry.value)?;
                    Ok((entry.key, value))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(collect_entries(decoded))
        }
        serde_json::Value::Object(object) => object
            .iter()
            .map(|(key, value)| decode_untyped(key, value).map(|v| (key.clone(), v)))
            .collect::<Result<ValueMap, DecodeError>>(),
        other => Err(DecodeError::UnsupportedValueKind {
            key: String::new(),
            kind: json_kind(other).to_string(),
        }),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn encode_map(map: &ValueMap) -> Result<serde_json::Value, EncodeError> {
    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        let json = match value {
            TaggedValue::Str(s) => serde_json::Value::String(s.clone()),
            TaggedValue::Int(i) => serde_json::Value::from(*i),
            TaggedValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| EncodeError::UnsupportedValue {
                    key: key.clone(),
                    reason: format!("float64 {f} has no JSON representation"),
                })?,
            TaggedValue::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
        };
        entries.push(serde_json::to_value(WireEntry {
            key: key.clone(),
            kind: value.kind().as_str().to_string(),
            value: json,
        })?);
    }
    Ok(serde_json::Value::Array(entries))
}

fn seconds_to_instant(seconds: i64) -> Result<DateTime<Utc>, DecodeError> {
    seconds
        .checked_mul(1000)
        .and_then(DateTime::from_timestamp_millis)
        .ok_or(DecodeError::InvalidTimestamp(seconds))
}

fn instant_to_seconds(instant: &DateTime<Utc>) -> i64 {
    instant.timestamp_millis().div_euclid(1000)
}

fn strip_line(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

impl MessageCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode_event(&self, raw: &[u8]) -> Result<Event, DecodeError> {
        let line = strip_line(raw);
        if line.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }
        let wire: WireEvent = serde_json::from_slice(line)?;
        Ok(Event {
            body: decode_body(&wire.body, wire.body_encoding.as_deref(), "body")?,
            timestamp: seconds_to_instant(wire.timestamp)?,
            headers: decode_map(&wire.headers)?,
            fields: decode_map(&wire.fields)?,
            id: wire.id,
            version: wire.version,
            trigger: Trigger {
                class: wire.trigger.class,
                kind: wire.trigger.kind,
                name: wire.trigger.name,
            },
            content_type: wire.content_type,
            size: wire.size,
            path: wire.path,
            url: wire.url,
            method: wire.method,
            shard_id: wire.shard_id,
            num_shards: wire.num_shards,
        })
    }

    fn encode_response(&self, response: &Response) -> Result<Bytes, EncodeError> {
        let wire = WireResponse {
            status_code: response.status_code,
            content_type: response.content_type.clone(),
            body: BASE64.encode(&response.body),
            body_encoding: Some(BODY_ENCODING_BASE64.to_string()),
            headers: encode_map(&response.headers)?,
        };
        Self::finish_line(Some(ChannelType::Response.byte()), &wire)
    }

    fn encode_log(&self, record: &LogRecord) -> Result<Bytes, EncodeError> {
        let wire = WireLog {
            level: record.level.as_str().to_string(),
            message: record.message.clone(),
            datetime: record.timestamp.to_rfc3339(),
            with: encode_map(&record.with)?,
        };
        Self::finish_line(Some(ChannelType::Log.byte()), &wire)
    }

    fn encode_event(&self, event: &Event) -> Result<Bytes, EncodeError> {
        let wire = WireEvent {
            id: event.id.clone(),
            version: event.version,
            trigger: WireTrigger {
                class: event.trigger.class.clone(),
                kind: event.trigger.kind.clone(),
                name: event.trigger.name.clone(),
            },
            content_type: event.content_type.clone(),
            body: BASE64.encode(&event.body),
            body_encoding: Some(BODY_ENCODING_BASE64.to_string()),
            size: event.size,
            timestamp: instant_to_seconds(&event.timestamp),
            path: event.path.clone(),
            url: event.url.clone(),
            method: event.method.clone(),
            shard_id: event.shard_id,
            num_shards: event.num_shards,
            headers: encode_map(&event.headers)?,
            fields: encode_map(&event.fields)?,
        };
        Self::finish_line(None, &wire)
    }

    fn decode_outbound(&self, raw: &[u8]) -> Result<Outbound, DecodeError> {
        let (&kind, rest) = raw.split_first().ok_or(DecodeError::Empty)?;
        let line = strip_line(rest);
        match ChannelType::from_byte(kind) {
            Some(ChannelType::Response) => {
                let wire: WireResponse = serde_json::from_slice(line)?;
                Ok(Outbound::Response(Response {
                    status_code: wire.status_code,
                    content_type: wire.content_type,
                    body: decode_body(&wire.body, wire.body_encoding.as_deref(), "body")?,
                    headers: decode_map(&wire.headers)?,
                }))
            }
            Some(ChannelType::Log) => {
                let wire: WireLog = serde_json::from_slice(line)?;
                let level = LogLevel::parse(&wire.level)
                    .ok_or_else(|| DecodeError::UnknownLogLevel(wire.level.clone()))?;
                let timestamp = DateTime::parse_from_rfc3339(&wire.datetime)
                    .map_err(|_| DecodeError::InvalidDatetime(wire.datetime.clone()))?
                    .with_timezone(&Utc);
                Ok(Outbound::Log(LogRecord {
                    level,
                    message: wire.message,
                    timestamp,
                    with: decode_map(&wire.with)?,
                }))
            }
            None => Err(DecodeError::UnknownChannelType(kind)),
        }
    }
}
