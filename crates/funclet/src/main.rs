//! funclet-wrapper: runs one built-in handler against a host-provided transport.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgGroup, Parser};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use funclet::bridge::transport::DEFAULT_MAX_LINE_LENGTH;
use funclet::handler::Loader;
use funclet::{LogLevel, TransportInfo, VersionInfo, WireFormat, WorkerConfig, builtin};

const DEFAULT_REGION_SIZE: usize = 4 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "funclet-wrapper", version, about = "Serve events from a host over one transport")]
#[command(group(
    ArgGroup::new("transport")
        .required(true)
        .args(["port", "socket_path", "event_pipe"])
))]
struct Args {
    /// Handler name to resolve.
    #[arg(long, env = "FUNCLET_HANDLER")]
    handler: String,

    /// Where the handler code lives.
    #[arg(long, env = "FUNCLET_CODE_LOCATION")]
    code_location: String,

    /// Connect over TCP to --host on this port.
    #[arg(long, env = "FUNCLET_PORT")]
    port: Option<u16>,

    #[arg(long, env = "FUNCLET_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Connect to this Unix socket.
    #[arg(long, env = "FUNCLET_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    /// Host → worker signal FIFO (shared-memory transport).
    #[arg(long, env = "FUNCLET_EVENT_PIPE", requires_all = ["response_pipe", "shm_path"])]
    event_pipe: Option<PathBuf>,

    /// Worker → host signal FIFO.
    #[arg(long, env = "FUNCLET_RESPONSE_PIPE", requires = "event_pipe")]
    response_pipe: Option<PathBuf>,

    /// File backing the shared region.
    #[arg(long, env = "FUNCLET_SHM_PATH", requires = "event_pipe")]
    shm_path: Option<PathBuf>,

    #[arg(long, env = "FUNCLET_SHM_SIZE", default_value_t = DEFAULT_REGION_SIZE)]
    shm_size: usize,

    /// Codec for stream transports; shared memory is always binary.
    #[arg(long, env = "FUNCLET_WIRE_FORMAT", default_value = "json")]
    wire_format: WireFormat,

    /// Least severe handler log level sent to the host.
    #[arg(long, env = "FUNCLET_LOG_LEVEL", default_value = "debug")]
    log_level: LogLevel,

    /// Longest inbound line accepted on stream transports, in bytes.
    #[arg(long, env = "FUNCLET_MAX_LINE_LENGTH", default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    max_line_length: usize,
}

impl Args {
    fn transport(&self) -> anyhow::Result<TransportInfo> {
        if let Some(port) = self.port {
            return Ok(TransportInfo::Tcp {
                host: self.host.clone(),
                port,
            });
        }
        self.local_transport()
    }

    #[cfg(unix)]
    fn local_transport(&self) -> anyhow::Result<TransportInfo> {
        if let Some(path) = &self.socket_path {
            return Ok(TransportInfo::Unix { path: path.clone() });
        }
        match (&self.event_pipe, &self.response_pipe, &self.shm_path) {
            (Some(event_pipe), Some(response_pipe), Some(region_path)) => {
                Ok(TransportInfo::SharedMemory {
                    event_pipe: event_pipe.clone(),
                    response_pipe: response_pipe.clone(),
                    region_path: region_path.clone(),
                    region_size: self.shm_size,
                })
            }
            _ => anyhow::bail!("no transport selected"),
        }
    }

    #[cfg(not(unix))]
    fn local_transport(&self) -> anyhow::Result<TransportInfo> {
        anyhow::bail!("only --port is supported on this platform")
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("FUNCLET_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "funclet={level},funclet_wrapper={level}",
            level = base_level
        ))
    };

    // stdout may belong to the host; diagnostics always go to stderr.
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let info = args.transport()?;
    let handler = builtin::loader().load(&args.code_location, &args.handler)?;

    let config = WorkerConfig {
        wire_format: args.wire_format,
        log_level: args.log_level,
        max_line_length: args.max_line_length,
    };
    let stats = funclet::run_worker(Arc::from(handler), info, config).await?;
    tracing::info!(events = stats.events, failures = stats.failures, "Worker finished");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();
    tracing::info!(version = %VersionInfo::new(), handler = %args.handler, "Starting worker");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(error = %message, "Worker failed");
            ExitCode::FAILURE
        }
    }
}
