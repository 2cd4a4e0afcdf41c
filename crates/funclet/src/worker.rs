//! Worker dispatch loop.
//!
//! One event at a time: wait for the host's signal, decode the payload, invoke
//! the handler, encode the response and signal back. Every failure between the
//! signal and the reply is turned into a 500 response, so the host gets exactly
//! one response per event, in order.

use std::any::Any;
use std::backtrace::Backtrace;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tracing::Instrument;

use crate::bridge::codec::{DecodeError, EncodeError, MessageCodec, WireFormat};
use crate::bridge::protocol::{Event, LogLevel, Response};
use crate::bridge::transport::{
    DEFAULT_MAX_LINE_LENGTH, SharedTransport, Transport, TransportError, TransportInfo,
    connect_transport,
};
use crate::handler::{Context, Handler, HandlerError};
use crate::logger::Logger;

pub const FAILURE_STATUS_CODE: u16 = 500;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Codec for stream transports. Shared memory always uses binary.
    pub wire_format: WireFormat,
    /// Least severe handler log level forwarded to the host.
    pub log_level: LogLevel,
    /// Inbound line limit for stream transports.
    pub max_line_length: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Json,
            log_level: LogLevel::Debug,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl WorkerConfig {
    pub fn wire_format_for(&self, transport: &TransportInfo) -> WireFormat {
        if transport.is_shared_memory() {
            WireFormat::Binary
        } else {
            self.wire_format
        }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events: u64,
    pub failures: u64,
}

/// Why an event was answered with a failure response.
#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error("failed to decode event: {0}")]
    Decode(DecodeError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("failed to encode response: {0}")]
    Encode(EncodeError),

    #[error("response rejected by transport: {0}")]
    Oversized(TransportError),
}

impl Failure {
    fn response(&self, with_backtrace: bool) -> Response {
        let mut body = self.to_string();
        if with_backtrace {
            let captured;
            let backtrace = match self {
                Self::Handler(e) => e.backtrace(),
                _ => None,
            };
            let backtrace = match backtrace {
                Some(bt) => bt,
                None => {
                    captured = Backtrace::force_capture();
                    &captured
                }
            };
            body.push_str("\n\nbacktrace:\n");
            body.push_str(&backtrace.to_string());
        }
        Response::new()
            .with_status(FAILURE_STATUS_CODE)
            .with_content_type("text/plain")
            .with_body(body)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Serial event loop over one transport.
pub struct Dispatcher {
    transport: SharedTransport,
    codec: Arc<dyn MessageCodec>,
    handler: Arc<dyn Handler>,
    context: Context,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        transport: Box<dyn Transport>,
        codec: Arc<dyn MessageCodec>,
        handler: Arc<dyn Handler>,
        config: &WorkerConfig,
    ) -> Self {
        let transport: SharedTransport = Arc::new(Mutex::new(transport));
        let logger =
            Logger::new(Arc::clone(&transport), Arc::clone(&codec)).with_max_level(config.log_level);
        Self {
            transport,
            codec,
            handler,
            context: Context::new(logger),
            stats: DispatchStats::default(),
        }
    }

    /// Run until the host closes the channel (`Ok`) or the transport fails.
    pub async fn run(mut self) -> Result<DispatchStats, TransportError> {
        tracing::info!(codec = self.codec.name(), "Dispatcher ready");
        loop {
            let raw = match self.next_payload().await {
                Ok(raw) => raw,
                Err(e) if e.is_clean_close() => {
                    tracing::info!(
                        events = self.stats.events,
                        failures = self.stats.failures,
                        "Host closed the channel, worker exiting"
                    );
                    return Ok(self.stats);
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        events = self.stats.events,
                        failures = self.stats.failures,
                        "Transport failed while waiting for an event"
                    );
                    return Err(e);
                }
            };

            self.stats.events += 1;
            let span = tracing::debug_span!("event", seq = self.stats.events, id = tracing::field::Empty);
            let outcome = self.process(&raw).instrument(span.clone()).await;
            if let Err(e) = self.reply(outcome).instrument(span).await {
                tracing::error!(
                    error = %e,
                    events = self.stats.events,
                    failures = self.stats.failures,
                    "Transport failed while replying"
                );
                return Err(e);
            }
        }
    }

    async fn next_payload(&self) -> Result<Bytes, TransportError> {
        let mut transport = self.transport.lock().await;
        transport.wait_for_signal().await?;
        transport.read_payload().await
    }

    async fn process(&self, raw: &[u8]) -> Result<Response, Failure> {
        let event = self.codec.decode_event(raw).map_err(Failure::Decode)?;
        tracing::Span::current().record("id", event.id.as_str());
        tracing::debug!(
            method = %event.method,
            path = %event.path,
            body_len = event.body.len(),
            "Event received"
        );
        let response = self.invoke(event).await?;
        tracing::trace!(status = response.status_code, "Handler returned");
        Ok(response)
    }

    async fn invoke(&self, event: Event) -> Result<Response, HandlerError> {
        let handling = self.handler.handle(&self.context, event);
        match AssertUnwindSafe(handling).catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(HandlerError::Failed(e)),
            Err(payload) => Err(HandlerError::panicked(panic_message(payload.as_ref()))),
        }
    }

    async fn reply(&mut self, outcome: Result<Response, Failure>) -> Result<(), TransportError> {
        let failure = match outcome {
            Ok(response) => match self.try_send(&response).await? {
                None => return Ok(()),
                Some(failure) => failure,
            },
            Err(failure) => failure,
        };
        self.stats.failures += 1;
        tracing::warn!(error = %failure, "Answering event with a failure response");
        self.send_failure(&failure).await
    }

    /// `Ok(Some(_))` when this response cannot be delivered but the channel is
    /// still usable.
    async fn try_send(&self, response: &Response) -> Result<Option<Failure>, TransportError> {
        let encoded = match self.codec.encode_response(response) {
            Ok(encoded) => encoded,
            Err(e) => return Ok(Some(Failure::Encode(e))),
        };
        match self.send(&encoded).await {
            Ok(()) => {
                tracing::trace!(status = response.status_code, "Response sent");
                Ok(None)
            }
            Err(e) if e.is_per_message() => Ok(Some(Failure::Oversized(e))),
            Err(e) => Err(e),
        }
    }

    async fn send_failure(&self, failure: &Failure) -> Result<(), TransportError> {
        match self.send(&self.encode_failure(failure, true)?).await {
            Err(e) if e.is_per_message() => {
                // A small region may not hold the backtrace.
                tracing::debug!(error = %e, "Retrying failure response without backtrace");
            }
            other => return other,
        }
        self.send(&self.encode_failure(failure, false)?).await
    }

    fn encode_failure(&self, failure: &Failure, with_backtrace: bool) -> Result<Bytes, TransportError> {
        self.codec
            .encode_response(&failure.response(with_backtrace))
            .map_err(|e| TransportError::Io(io::Error::other(e)))
    }

    async fn send(&self, encoded: &[u8]) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        transport.send(encoded).await
    }
}

/// Connect to the host and serve events until it goes away.
pub async fn run_worker(
    handler: Arc<dyn Handler>,
    info: TransportInfo,
    config: WorkerConfig,
) -> Result<DispatchStats, TransportError> {
    let wire_format = config.wire_format_for(&info);
    if wire_format != config.wire_format {
        tracing::debug!(requested = ?config.wire_format, "Shared memory always uses the binary codec");
    }
    tracing::trace!(?info, "Connecting transport");
    let transport = connect_transport(info, config.max_line_length).await?;
    tracing::info!(transport = transport.kind(), ?wire_format, "Connected to host");

    Dispatcher::new(transport, wire_format.codec(), handler, &config)
        .run()
        .await
}
