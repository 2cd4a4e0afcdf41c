//! Compact binary schema for the shared-memory region.
//!
//! Framing uses LengthDelimitedCodec with a 4-byte big-endian length prefix.
//! Inbound event frames are `len | payload`; outbound frames carry the
//! channel-type byte first: `kind | len | payload`.
//!
//! Payload encoding:
//! - integers are big-endian, timestamps are native milliseconds (lossless)
//! - strings and byte blobs are `u32 len | bytes`
//! - a tagged map is `u32 count` followed by `key | u8 tag | value` entries

use chrono::{DateTime, Utc};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::codec::{DecodeError, EncodeError, MessageCodec};
use super::protocol::{
    ChannelType, Event, LogLevel, LogRecord, Outbound, Response, TaggedValue, Trigger, ValueKind,
    ValueMap,
};

/// Bytes of the length prefix in front of every payload.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn new() -> Self {
        Self
    }

    fn framing() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX_LEN)
            .max_frame_length(u32::MAX as usize)
            .new_codec()
    }

    fn frame(prefix: Option<ChannelType>, payload: BytesMut) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::with_capacity(1 + LENGTH_PREFIX_LEN + payload.len());
        if let Some(kind) = prefix {
            dst.put_u8(kind.byte());
        }
        let len = payload.len();
        Self::framing().encode(payload.freeze(), &mut dst)?;
        tracing::trace!(frame_size_bytes = len, "Encoding binary frame");
        Ok(dst.freeze())
    }

    fn unframe(raw: &[u8]) -> Result<Bytes, DecodeError> {
        // Checked up front so a corrupt prefix never sizes a buffer.
        let needed = declared_frame_len(raw);
        if needed > raw.len() {
            return Err(DecodeError::Truncated {
                needed,
                available: raw.len(),
            });
        }
        let mut src = BytesMut::from(raw);
        match Self::framing().decode(&mut src)? {
            Some(payload) if src.is_empty() => Ok(payload.freeze()),
            Some(_) => Err(DecodeError::TrailingBytes(src.len())),
            None => Err(DecodeError::Truncated {
                needed,
                available: raw.len(),
            }),
        }
    }
}

fn declared_frame_len(raw: &[u8]) -> usize {
    match raw.get(..LENGTH_PREFIX_LEN) {
        Some(prefix) => {
            let mut prefix = prefix;
            LENGTH_PREFIX_LEN.saturating_add(prefix.get_u32() as usize)
        }
        None => LENGTH_PREFIX_LEN,
    }
}

fn put_len(dst: &mut BytesMut, field: &'static str, len: usize) -> Result<(), EncodeError> {
    let len32 = u32::try_from(len).map_err(|_| EncodeError::TooLarge { field, len })?;
    dst.put_u32(len32);
    Ok(())
}

fn put_blob(dst: &mut BytesMut, field: &'static str, blob: &[u8]) -> Result<(), EncodeError> {
    put_len(dst, field, blob.len())?;
    dst.put_slice(blob);
    Ok(())
}

fn put_map(dst: &mut BytesMut, field: &'static str, map: &ValueMap) -> Result<(), EncodeError> {
    put_len(dst, field, map.len())?;
    for (key, value) in map {
        put_blob(dst, "key", key.as_bytes())?;
        dst.put_u8(value.kind().tag());
        match value {
            TaggedValue::Str(s) => put_blob(dst, "value", s.as_bytes())?,
            TaggedValue::Int(i) => dst.put_i64(*i),
            TaggedValue::Float(f) => dst.put_f64(*f),
            TaggedValue::Bytes(b) => put_blob(dst, "value", b)?,
        }
    }
    Ok(())
}

/// Bounds-checked cursor over a payload.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    fn blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len).to_vec())
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        String::from_utf8(self.blob()?).map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    fn timestamp(&mut self) -> Result<DateTime<Utc>, DecodeError> {
        let millis = self.i64()?;
        DateTime::from_timestamp_millis(millis).ok_or(DecodeError::InvalidTimestamp(millis))
    }

    fn map(&mut self) -> Result<ValueMap, DecodeError> {
        let count = self.u32()?;
        let mut map = ValueMap::new();
        for _ in 0..count {
            let key = self.string("key")?;
            let tag = self.u8()?;
            let kind = ValueKind::from_tag(tag).ok_or_else(|| DecodeError::UnsupportedValueKind {
                key: key.clone(),
                kind: format!("tag {tag}"),
            })?;
            let value = match kind {
                ValueKind::String => TaggedValue::Str(self.string("value")?),
                ValueKind::Int64 => TaggedValue::Int(self.i64()?),
                ValueKind::Float64 => TaggedValue::Float(self.f64()?),
                ValueKind::Bytes => TaggedValue::Bytes(self.blob()?),
            };
            map.insert(key, value);
        }
        Ok(map)
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

impl MessageCodec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn decode_event(&self, raw: &[u8]) -> Result<Event, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut r = Reader::new(Self::unframe(raw)?);
        let event = Event {
            id: r.string("id")?,
            version: r.i64()?,
            trigger: Trigger {
                class: r.string("trigger.class")?,
                kind: r.string("trigger.kind")?,
                name: r.string("trigger.name")?,
            },
            content_type: r.string("content_type")?,
            body: r.blob()?,
            size: r.i64()?,
            timestamp: r.timestamp()?,
            path: r.string("path")?,
            url: r.string("url")?,
            method: r.string("method")?,
            shard_id: r.i64()?,
            num_shards: r.i64()?,
            headers: r.map()?,
            fields: r.map()?,
        };
        r.finish()?;
        Ok(event)
    }

    fn encode_response(&self, response: &Response) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::new();
        dst.put_u16(response.status_code);
        put_blob(&mut dst, "content_type", response.content_type.as_bytes())?;
        put_blob(&mut dst, "body", &response.body)?;
        put_map(&mut dst, "headers", &response.headers)?;
        Self::frame(Some(ChannelType::Response), dst)
    }

    fn encode_log(&self, record: &LogRecord) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::new();
        dst.put_u8(record.level.tag());
        put_blob(&mut dst, "message", record.message.as_bytes())?;
        dst.put_i64(record.timestamp.timestamp_millis());
        put_map(&mut dst, "with", &record.with)?;
        Self::frame(Some(ChannelType::Log), dst)
    }

    fn encode_event(&self, event: &Event) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::new();
        put_blob(&mut dst, "id", event.id.as_bytes())?;
        dst.put_i64(event.version);
        put_blob(&mut dst, "trigger.class", event.trigger.class.as_bytes())?;
        put_blob(&mut dst, "trigger.kind", event.trigger.kind.as_bytes())?;
        put_blob(&mut dst, "trigger.name", event.trigger.name.as_bytes())?;
        put_blob(&mut dst, "content_type", event.content_type.as_bytes())?;
        put_blob(&mut dst, "body", &event.body)?;
        dst.put_i64(event.size);
        dst.put_i64(event.timestamp.timestamp_millis());
        put_blob(&mut dst, "path", event.path.as_bytes())?;
        put_blob(&mut dst, "url", event.url.as_bytes())?;
        put_blob(&mut dst, "method", event.method.as_bytes())?;
        dst.put_i64(event.shard_id);
        dst.put_i64(event.num_shards);
        put_map(&mut dst, "headers", &event.headers)?;
        put_map(&mut dst, "fields", &event.fields)?;
        Self::frame(None, dst)
    }

    fn decode_outbound(&self, raw: &[u8]) -> Result<Outbound, DecodeError> {
        let (&kind, rest) = raw.split_first().ok_or(DecodeError::Empty)?;
        let kind = ChannelType::from_byte(kind).ok_or(DecodeError::UnknownChannelType(kind))?;
        let mut r = Reader::new(Self::unframe(rest)?);
        let outbound = match kind {
            ChannelType::Response => Outbound::Response(Response {
                status_code: r.u16()?,
                content_type: r.string("content_type")?,
                body: r.blob()?,
                headers: r.map()?,
            }),
            ChannelType::Log => {
                let tag = r.u8()?;
                let level = LogLevel::from_tag(tag)
                    .ok_or_else(|| DecodeError::UnknownLogLevel(format!("tag {tag}")))?;
                Outbound::Log(LogRecord {
                    level,
                    message: r.string("message")?,
                    timestamp: r.timestamp()?,
                    with: r.map()?,
                })
            }
        };
        r.finish()?;
        Ok(outbound)
    }
}
