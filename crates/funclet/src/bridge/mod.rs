//! IPC bridge between the host and the worker.
//!
//! This module provides the wire protocol, codecs and transports for
//! communication between the host process and this worker.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Event, Response, LogRecord, TaggedValue)
//! - **codec**: MessageCodec trait, errors and the line-JSON variant
//! - **binary**: compact length-delimited variant for the shared region
//! - **transport**: stream and shared-memory transports

pub mod binary;
pub mod codec;
pub mod protocol;
pub mod transport;

#[cfg(all(test, target_os = "linux"))]
pub(crate) mod test_host;
