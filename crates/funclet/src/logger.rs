//! Structured log sink handed to handlers.
//!
//! Every call encodes one [`LogRecord`] and sends it to the host before
//! returning. Problems are reported through `tracing` on stderr and never reach
//! the handler.

use std::sync::Arc;

use crate::bridge::codec::MessageCodec;
use crate::bridge::protocol::{LogLevel, LogRecord, TaggedValue, ValueMap};
use crate::bridge::transport::SharedTransport;

#[derive(Clone)]
pub struct Logger {
    transport: SharedTransport,
    codec: Arc<dyn MessageCodec>,
    max_level: LogLevel,
}

impl Logger {
    pub fn new(transport: SharedTransport, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            transport,
            codec,
            max_level: LogLevel::Debug,
        }
    }

    /// Drop records less severe than `level` before they are encoded.
    pub fn with_max_level(mut self, level: LogLevel) -> Self {
        self.max_level = level;
        self
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.max_level
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into(), ValueMap::new())
            .await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message.into(), ValueMap::new())
            .await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into(), ValueMap::new())
            .await;
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into(), ValueMap::new())
            .await;
    }

    /// `with` is a flat key, value, key, value... sequence.
    pub async fn error_with(&self, message: impl Into<String>, with: &[TaggedValue]) {
        self.log(LogLevel::Error, message.into(), with_map(with))
            .await;
    }

    pub async fn warn_with(&self, message: impl Into<String>, with: &[TaggedValue]) {
        self.log(LogLevel::Warning, message.into(), with_map(with))
            .await;
    }

    pub async fn info_with(&self, message: impl Into<String>, with: &[TaggedValue]) {
        self.log(LogLevel::Info, message.into(), with_map(with))
            .await;
    }

    pub async fn debug_with(&self, message: impl Into<String>, with: &[TaggedValue]) {
        self.log(LogLevel::Debug, message.into(), with_map(with))
            .await;
    }

    pub async fn log(&self, level: LogLevel, message: String, with: ValueMap) {
        if !self.enabled(level) {
            return;
        }
        let record = LogRecord::new(level, message, with);
        let encoded = match self.codec.encode_log(&record) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(error = %e, %level, "Failed to encode log record");
                return;
            }
        };
        let mut transport = self.transport.lock().await;
        if let Err(e) = transport.send(&encoded).await {
            tracing::error!(error = %e, %level, "Failed to send log record");
        }
    }
}

/// Pair up a flat argument list. Odd length yields an empty map; pairs whose
/// key is not a string are skipped.
pub fn with_map(args: &[TaggedValue]) -> ValueMap {
    if args.len() % 2 != 0 {
        tracing::error!(
            count = args.len(),
            "Log arguments must be key/value pairs, dropping all of them"
        );
        return ValueMap::new();
    }
    let mut map = ValueMap::new();
    for pair in args.chunks_exact(2) {
        match &pair[0] {
            TaggedValue::Str(key) => {
                map.insert(key.clone(), pair[1].clone());
            }
            other => {
                tracing::error!(key = %other, kind = %other.kind(), "Skipping log argument with non-string key");
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{JsonCodec, WireFormat};
    use crate::bridge::protocol::Outbound;
    use crate::bridge::transport::{StreamTransport, Transport};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
    use tokio::sync::Mutex;

    fn logger() -> (Logger, Lines<BufReader<DuplexStream>>) {
        let (worker, host) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(worker);
        let transport: Box<dyn Transport> = Box::new(StreamTransport::new(r, w));
        let logger = Logger::new(Arc::new(Mutex::new(transport)), WireFormat::Json.codec());
        (logger, BufReader::new(host).lines())
    }

    async fn next_record(lines: &mut Lines<BufReader<DuplexStream>>) -> LogRecord {
        let line = lines.next_line().await.unwrap().unwrap();
        match JsonCodec::new().decode_outbound(line.as_bytes()).unwrap() {
            Outbound::Log(record) => record,
            other => panic!("expected a log record, got {other:?}"),
        }
    }

    #[test]
    fn with_map_pairs_arguments() {
        let map = with_map(&["source".into(), "rabbit".into(), "weight".into(), 7.0.into()]);
        assert_eq!(map.get("source"), Some(&TaggedValue::Str("rabbit".into())));
        assert_eq!(map.get("weight"), Some(&TaggedValue::Float(7.0)));
    }

    #[test]
    fn with_map_odd_length_is_empty() {
        assert!(with_map(&["k1".into()]).is_empty());
        assert!(with_map(&["k1".into(), 1i64.into(), "k2".into()]).is_empty());
    }

    #[test]
    fn with_map_skips_non_string_keys() {
        let map = with_map(&[1i64.into(), "one".into(), "two".into(), 2i64.into()]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("two"), Some(&TaggedValue::Int(2)));
    }

    #[tokio::test]
    async fn each_call_sends_one_record() {
        let (logger, mut lines) = logger();
        logger.debug("Debug message").await;
        logger
            .error_with("Error message", &["source".into(), "rabbit".into()])
            .await;

        let first = next_record(&mut lines).await;
        assert_eq!(first.level, LogLevel::Debug);
        assert_eq!(first.message, "Debug message");
        assert!(first.with.is_empty());

        let second = next_record(&mut lines).await;
        assert_eq!(second.level, LogLevel::Error);
        assert_eq!(second.with.get("source").and_then(TaggedValue::as_str), Some("rabbit"));
    }

    #[tokio::test]
    async fn odd_arguments_still_send_the_message() {
        let (logger, mut lines) = logger();
        logger.info_with("msg", &["k1".into()]).await;

        let record = next_record(&mut lines).await;
        assert_eq!(record.message, "msg");
        assert!(record.with.is_empty());
    }

    #[tokio::test]
    async fn max_level_suppresses_less_severe_records() {
        let (logger, mut lines) = logger();
        let logger = logger.with_max_level(LogLevel::Info);
        logger.debug("hidden").await;
        logger.warn("shown").await;

        let record = next_record(&mut lines).await;
        assert_eq!(record.level, LogLevel::Warning);
        assert_eq!(record.message, "shown");
    }

    #[tokio::test]
    async fn unencodable_record_is_not_sent() {
        let (logger, mut lines) = logger();
        logger.info_with("nan", &["ratio".into(), f64::NAN.into()]).await;
        logger.info("after").await;

        let record = next_record(&mut lines).await;
        assert_eq!(record.message, "after");
    }

    #[tokio::test]
    async fn closed_host_does_not_reach_the_handler() {
        let (logger, lines) = logger();
        drop(lines);
        logger.error("nobody is listening").await;
    }
}
