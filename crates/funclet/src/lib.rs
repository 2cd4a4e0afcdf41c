//! funclet: transport and wire-protocol core for function workers.
//!
//! A worker process is handed one transport to its host, waits for events,
//! runs a [`Handler`] for each one and sends back exactly one [`Response`] per
//! event, optionally preceded by structured log records.

pub mod bridge;
pub mod builtin;
pub mod handler;
pub mod logger;
pub mod worker;

mod version;

pub use bridge::codec::{DecodeError, EncodeError, MessageCodec, WireFormat};
pub use bridge::protocol::{Event, LogLevel, LogRecord, Response, TaggedValue, Trigger};
pub use bridge::transport::{Transport, TransportError, TransportInfo, connect_transport};
pub use handler::{Context, Handler, HandlerError, LoadError, Loader, StaticLoader};
pub use logger::Logger;
pub use version::{FUNCLET_VERSION, VersionInfo};
pub use worker::{DispatchStats, Dispatcher, WorkerConfig, run_worker};
