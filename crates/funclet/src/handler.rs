//! Handler capability and the pieces it is handed.
//!
//! A handler turns one [`Event`] into one [`Response`]. It receives a
//! [`Context`] whose [`Logger`] streams records to the host while the event is
//! being processed. Handlers are resolved once at startup through a [`Loader`].

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;

use crate::bridge::protocol::{Event, Response};
use crate::logger::Logger;

/// User code invoked once per event.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one event.
    ///
    /// Errors and panics are turned into a 500 response by the dispatcher; the
    /// handler never needs to build failure responses itself.
    async fn handle(&self, ctx: &Context, event: Event) -> anyhow::Result<Response>;
}

/// Per-worker state passed to every invocation.
#[derive(Clone)]
pub struct Context {
    logger: Logger,
}

impl Context {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

/// Invocation failure, caught at the dispatcher boundary.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler returned an error: {0:#}")]
    Failed(anyhow::Error),

    #[error("handler panicked: {message}")]
    Panicked { message: String },
}

impl HandlerError {
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            message: message.into(),
        }
    }

    /// Backtrace captured where the error was created, if any.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Self::Failed(e) if e.backtrace().status() == BacktraceStatus::Captured => {
                Some(e.backtrace())
            }
            _ => None,
        }
    }
}

/// Failure to resolve a handler at startup.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("handler '{name}' not found in {location} (available: {available})")]
    NotFound {
        name: String,
        location: String,
        available: String,
    },

    #[error("failed to create handler '{name}': {message}")]
    Init { name: String, message: String },
}

/// Resolves a handler by code location and name.
pub trait Loader {
    fn load(&self, location: &str, name: &str) -> Result<Box<dyn Handler>, LoadError>;
}

pub type HandlerFactory = fn() -> anyhow::Result<Box<dyn Handler>>;

/// Loader backed by a table of factory functions compiled into the binary.
///
/// The code location is recorded for diagnostics only.
#[derive(Default)]
pub struct StaticLoader {
    factories: BTreeMap<String, HandlerFactory>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, factory: HandlerFactory) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Loader for StaticLoader {
    fn load(&self, location: &str, name: &str) -> Result<Box<dyn Handler>, LoadError> {
        let Some(factory) = self.factories.get(name) else {
            return Err(LoadError::NotFound {
                name: name.to_string(),
                location: location.to_string(),
                available: self.names().collect::<Vec<_>>().join(", "),
            });
        };
        tracing::debug!(%location, %name, "Creating handler");
        factory().map_err(|e| LoadError::Init {
            name: name.to_string(),
            message: format!("{e:#}"),
        })
    }
}
