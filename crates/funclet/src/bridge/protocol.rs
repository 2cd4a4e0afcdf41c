//! Message types exchanged between the host and the worker.
//!
//! Three entities cross the wire:
//! - **Event**: one inbound unit of work (host → worker)
//! - **Response**: the result of handling one event (worker → host)
//! - **LogRecord**: a structured log line emitted while handling (worker → host)
//!
//! Header, field and `with` maps carry [`TaggedValue`]s so every value keeps its
//! wire kind through a decode/encode cycle.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Wire-level union for values in header/field/with maps.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl TaggedValue {
    /// Name of the wire kind, as used in the JSON schema.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Str(_) => ValueKind::String,
            Self::Int(_) => ValueKind::Int64,
            Self::Float(_) => ValueKind::Float64,
            Self::Bytes(_) => ValueKind::Bytes,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for TaggedValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for TaggedValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for TaggedValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for TaggedValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for TaggedValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for TaggedValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<u8>> for TaggedValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for TaggedValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

/// The four value kinds the wire protocol can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Int64,
    Float64,
    Bytes,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Bytes => "bytes",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(Self::String),
            "int64" => Some(Self::Int64),
            "float64" => Some(Self::Float64),
            "bytes" => Some(Self::Bytes),
            _ => None,
        }
    }

    /// Single-byte tag used by the binary schema.
    pub fn tag(&self) -> u8 {
        match self {
            Self::String => 0,
            Self::Int64 => 1,
            Self::Float64 => 2,
            Self::Bytes => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::String),
            1 => Some(Self::Int64),
            2 => Some(Self::Float64),
            3 => Some(Self::Bytes),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header/field/with map. Ordered by key so encoding is deterministic.
pub type ValueMap = BTreeMap<String, TaggedValue>;

/// Build a map from ordered wire entries. Later duplicates overwrite earlier ones.
pub fn collect_entries<I>(entries: I) -> ValueMap
where
    I: IntoIterator<Item = (String, TaggedValue)>,
{
    let mut map = ValueMap::new();
    for (key, value) in entries {
        map.insert(key, value);
    }
    map
}

/// Which trigger produced an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trigger {
    pub class: String,
    pub kind: String,
    pub name: String,
}

/// One inbound unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub id: String,
    pub version: i64,
    pub trigger: Trigger,
    pub content_type: String,
    pub body: Vec<u8>,
    pub size: i64,
    /// Millisecond-resolution instant.
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub url: String,
    pub method: String,
    pub shard_id: i64,
    pub num_shards: i64,
    pub headers: ValueMap,
    pub fields: ValueMap,
}

impl Event {
    pub fn header(&self, key: &str) -> Option<&TaggedValue> {
        self.headers.get(key)
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header(key).and_then(TaggedValue::as_str)
    }

    pub fn header_bytes(&self, key: &str) -> Option<&[u8]> {
        self.header(key).and_then(TaggedValue::as_bytes)
    }

    pub fn field(&self, key: &str) -> Option<&TaggedValue> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(TaggedValue::as_str)
    }

    pub fn field_i64(&self, key: &str) -> Option<i64> {
        self.field(key).and_then(TaggedValue::as_i64)
    }

    pub fn field_bytes(&self, key: &str) -> Option<&[u8]> {
        self.field(key).and_then(TaggedValue::as_bytes)
    }

    /// Body as UTF-8 text, lossy.
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

pub const DEFAULT_STATUS_CODE: u16 = 200;
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status_code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub headers: ValueMap,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status_code: DEFAULT_STATUS_CODE,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            body: Vec::new(),
            headers: ValueMap::new(),
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<TaggedValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl From<&str> for Response {
    fn from(body: &str) -> Self {
        Self::new().with_body(body)
    }
}

impl From<String> for Response {
    fn from(body: String) -> Self {
        Self::new().with_body(body)
    }
}

impl From<Vec<u8>> for Response {
    fn from(body: Vec<u8>) -> Self {
        Self::new().with_body(body)
    }
}

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }

    /// Accepts the wire names plus the aliases hosts commonly send.
    pub fn parse(level: &str) -> Option<Self> {
        match level {
            "error" | "critical" | "fatal" => Some(Self::Error),
            "warning" | "warn" => Some(Self::Warning),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Warning => 1,
            Self::Info => 2,
            Self::Debug => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Error),
            1 => Some(Self::Warning),
            2 => Some(Self::Info),
            3 => Some(Self::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown log level '{s}'"))
    }
}

/// One structured log line, sent as soon as it is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub with: ValueMap,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>, with: ValueMap) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            with,
        }
    }
}

/// Channel-type byte prefixed to every worker → host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Response,
    Log,
}

impl ChannelType {
    pub fn byte(&self) -> u8 {
        match self {
            Self::Response => b'r',
            Self::Log => b'l',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'r' => Some(Self::Response),
            b'l' => Some(Self::Log),
            _ => None,
        }
    }
}

/// A decoded worker → host message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Response(Response),
    Log(LogRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_defaults() {
        let resp = Response::new();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content_type, "text/plain");
        assert!(resp.body.is_empty());
        assert!(resp.headers.is_empty());
    }

    #[test]
    fn response_from_string_is_plain_text() {
        let resp = Response::from("a string");
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content_type, "text/plain");
        assert_eq!(resp.body, b"a string");
    }

    #[test]
    fn duplicate_entries_last_write_wins() {
        let map = collect_entries(vec![
            ("h1".to_string(), TaggedValue::from("v1")),
            ("h1".to_string(), TaggedValue::from("v2")),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map["h1"], TaggedValue::from("v2"));
    }

    #[test]
    fn event_typed_getters() {
        let mut event = Event::default();
        event.headers.insert("h".into(), "v".into());
        event.fields.insert("n".into(), 7i64.into());
        event.fields.insert("b".into(), b"raw".as_slice().into());

        assert_eq!(event.header_str("h"), Some("v"));
        assert_eq!(event.header_bytes("h"), None);
        assert_eq!(event.field_i64("n"), Some(7));
        assert_eq!(event.field_str("n"), None);
        assert_eq!(event.field_bytes("b"), Some(b"raw".as_slice()));
        assert!(event.field("missing").is_none());
    }

    #[test]
    fn value_kind_tags_are_stable() {
        for kind in [
            ValueKind::String,
            ValueKind::Int64,
            ValueKind::Float64,
            ValueKind::Bytes,
        ] {
            assert_eq!(ValueKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(ValueKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ValueKind::from_tag(9), None);
        assert_eq!(ValueKind::parse("bool"), None);
    }

    #[test]
    fn log_level_aliases() {
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("fatal"), Some(LogLevel::Error));
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error < LogLevel::Debug);
    }

    #[test]
    fn channel_type_bytes() {
        assert_eq!(ChannelType::Response.byte(), b'r');
        assert_eq!(ChannelType::Log.byte(), b'l');
        assert_eq!(ChannelType::from_byte(b'l'), Some(ChannelType::Log));
        assert_eq!(ChannelType::from_byte(b'x'), None);
    }
}
