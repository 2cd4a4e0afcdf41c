//! Transports between host and worker.
//!
//! Two implementations behind one [`Transport`] contract:
//! - **StreamTransport**: duplex byte stream (TCP or Unix socket), one message per
//!   line. Message arrival is the signal; EOF is a clean shutdown.
//! - **ShmTransport**: one fixed-size memory-mapped region reused for both
//!   directions, plus two FIFOs carrying one sentinel byte per signal.
//!
//! ## Shared-memory turn discipline
//!
//! The region belongs to whichever side received the last signal. The worker
//! only writes after the host has signalled, and only signals after its write is
//! flushed with msync. If the worker sends twice in a row (a log followed by the
//! response), the second write first waits for the host's acknowledgement signal.

use std::io;
use std::path::PathBuf;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};

/// Sentinel byte the worker writes to its signal pipe.
pub const SIGNAL_BYTE: u8 = b's';

/// Longest inbound line a stream transport buffers before failing.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed its end cleanly.
    #[error("peer closed the channel")]
    Closed,

    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("payload of {len} bytes does not fit the {capacity}-byte region")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("no payload pending, wait for a signal first")]
    NoPayload,
}

impl TransportError {
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Errors that only affect the message being sent, not the channel.
    pub fn is_per_message(&self) -> bool {
        matches!(self, Self::PayloadTooLarge { .. })
    }
}

/// Blocking wait/send contract shared by every transport.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Block until the host announces a payload. `Err(Closed)` on clean shutdown.
    async fn wait_for_signal(&mut self) -> Result<(), TransportError>;

    /// Raw bytes of the payload announced by the last signal.
    async fn read_payload(&mut self) -> Result<Bytes, TransportError>;

    /// Put one complete payload on the data path, fully flushed.
    async fn write_payload(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Tell the host a payload is ready.
    async fn send_signal(&mut self) -> Result<(), TransportError>;

    /// Write then signal. Every outbound message goes through here.
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.write_payload(payload).await?;
        self.send_signal().await
    }

    fn kind(&self) -> &'static str;
}

/// Transport shared by the dispatcher and the logger. Each send holds the lock
/// for its whole write+signal.
pub type SharedTransport = std::sync::Arc<tokio::sync::Mutex<Box<dyn Transport>>>;

/// How the worker reaches its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportInfo {
    Tcp {
        host: String,
        port: u16,
    },
    #[cfg(unix)]
    Unix {
        path: PathBuf,
    },
    #[cfg(unix)]
    SharedMemory {
        event_pipe: PathBuf,
        response_pipe: PathBuf,
        region_path: PathBuf,
        region_size: usize,
    },
}

impl TransportInfo {
    pub fn is_shared_memory(&self) -> bool {
        #[cfg(unix)]
        {
            matches!(self, Self::SharedMemory { .. })
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Stream transport: one message per line over any byte stream.
pub struct StreamTransport<R, W> {
    reader: FramedRead<R, AnyDelimiterCodec>,
    writer: W,
    pending: Option<Bytes>,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_max_line_length(reader, writer, DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(reader: R, writer: W, max_line_length: usize) -> Self {
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_line_length);
        Self {
            reader: FramedRead::new(reader, codec),
            writer,
            pending: None,
        }
    }
}

fn line_error(e: AnyDelimiterCodecError) -> TransportError {
    match e {
        AnyDelimiterCodecError::Io(e) => TransportError::Io(e),
        AnyDelimiterCodecError::MaxChunkLengthExceeded => TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "inbound line exceeds maximum length",
        )),
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn wait_for_signal(&mut self) -> Result<(), TransportError> {
        loop {
            match self.reader.next().await {
                Some(Ok(line)) => {
                    let len = line.strip_suffix(b"\r").map_or(line.len(), <[u8]>::len);
                    let line = line.slice(..len);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        tracing::trace!("Skipping blank line");
                        continue;
                    }
                    self.pending = Some(line);
                    return Ok(());
                }
                Some(Err(e)) => return Err(line_error(e)),
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn read_payload(&mut self) -> Result<Bytes, TransportError> {
        self.pending.take().ok_or(TransportError::NoPayload)
    }

    async fn write_payload(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_signal(&mut self) -> Result<(), TransportError> {
        // Arrival of the flushed line is the signal.
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stream"
    }
}

#[cfg(unix)]
pub use shm::ShmTransport;

#[cfg(unix)]
mod shm {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::path::{Path, PathBuf};

    use memmap2::{MmapMut, MmapOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::unix::pipe;
    use tokio_util::bytes::Bytes;

    use super::{SIGNAL_BYTE, Transport, TransportError};
    use crate::bridge::binary::LENGTH_PREFIX_LEN;

    /// Shared-memory transport: mapped region + signal FIFOs.
    pub struct ShmTransport {
        region: MmapMut,
        events: pipe::Receiver,
        responses: pipe::Sender,
        /// Our last signal has not been answered yet; the host owns the region.
        awaiting_ack: bool,
        pending: bool,
    }

    async fn open_blocking<F>(path: &Path, open: F) -> io::Result<File>
    where
        F: FnOnce(&Path) -> io::Result<File> + Send + 'static,
    {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || open(&path))
            .await
            .map_err(|e| io::Error::other(format!("pipe open task failed: {e}")))?
    }

    impl ShmTransport {
        /// Map the region and open both signal pipes.
        ///
        /// FIFO opens block until the host opens the other end: the event pipe
        /// first, then the response pipe.
        pub async fn open(
            event_pipe: PathBuf,
            response_pipe: PathBuf,
            region_path: PathBuf,
            region_size: usize,
        ) -> Result<Self, TransportError> {
            if region_size <= LENGTH_PREFIX_LEN {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("region size {region_size} is too small"),
                )));
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&region_path)?;
            if file.metadata()?.len() < region_size as u64 {
                file.set_len(region_size as u64)?;
            }
            // Safety: the region file is shared only with the host, and the turn
            // discipline guarantees only one side touches it between signals.
            let region = unsafe { MmapOptions::new().len(region_size).map_mut(&file)? };
            tracing::debug!(path = %region_path.display(), region_size, "Mapped shared region");

            tracing::debug!(path = %event_pipe.display(), "Opening event pipe");
            let events = open_blocking(&event_pipe, |p| File::open(p)).await?;
            let events = pipe::Receiver::from_file(events)?;

            tracing::debug!(path = %response_pipe.display(), "Opening response pipe");
            let responses =
                open_blocking(&response_pipe, |p| OpenOptions::new().write(true).open(p)).await?;
            let responses = pipe::Sender::from_file(responses)?;

            tracing::info!(region_size, "Shared-memory transport ready");

            Ok(Self {
                region,
                events,
                responses,
                awaiting_ack: false,
                pending: false,
            })
        }

        pub fn capacity(&self) -> usize {
            self.region.len()
        }

        async fn read_signal(&mut self) -> Result<(), TransportError> {
            let mut byte = [0u8; 1];
            match self.events.read_exact(&mut byte).await {
                Ok(_) => {
                    tracing::trace!(signal = byte[0], "Received signal");
                    self.awaiting_ack = false;
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
                Err(e) => Err(TransportError::Io(e)),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ShmTransport {
        async fn wait_for_signal(&mut self) -> Result<(), TransportError> {
            self.read_signal().await?;
            self.pending = true;
            Ok(())
        }

        async fn read_payload(&mut self) -> Result<Bytes, TransportError> {
            if !self.pending {
                return Err(TransportError::NoPayload);
            }
            self.pending = false;

            let mut prefix = [0u8; LENGTH_PREFIX_LEN];
            prefix.copy_from_slice(&self.region[..LENGTH_PREFIX_LEN]);
            let declared = u32::from_be_bytes(prefix) as usize;
            // An oversized prefix hands the codec the whole region so it can
            // report the truncation as a decode failure.
            let end = LENGTH_PREFIX_LEN
                .saturating_add(declared)
                .min(self.region.len());
            Ok(Bytes::copy_from_slice(&self.region[..end]))
        }

        async fn write_payload(&mut self, payload: &[u8]) -> Result<(), TransportError> {
            let capacity = self.region.len();
            if payload.len() > capacity {
                return Err(TransportError::PayloadTooLarge {
                    len: payload.len(),
                    capacity,
                });
            }
            if self.awaiting_ack {
                tracing::trace!("Waiting for host to release the region");
                self.read_signal().await?;
            }
            self.region[..payload.len()].copy_from_slice(payload);
            self.region.flush_range(0, payload.len())?;
            Ok(())
        }

        async fn send_signal(&mut self) -> Result<(), TransportError> {
            self.responses.write_all(&[SIGNAL_BYTE]).await?;
            self.responses.flush().await?;
            self.awaiting_ack = true;
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "shared-memory"
        }
    }
}

/// Open the transport described by `info`. Stream transports reject inbound
/// lines longer than `max_line_length`.
pub async fn connect_transport(
    info: TransportInfo,
    max_line_length: usize,
) -> Result<Box<dyn Transport>, TransportError> {
    match info {
        TransportInfo::Tcp { host, port } => {
            tracing::debug!(%host, port, "Connecting TCP stream");
            let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            Ok(Box::new(StreamTransport::with_max_line_length(
                read_half,
                write_half,
                max_line_length,
            )))
        }
        #[cfg(unix)]
        TransportInfo::Unix { path } => {
            tracing::debug!(path = %path.display(), "Connecting Unix stream");
            let stream = tokio::net::UnixStream::connect(&path).await?;
            let (read_half, write_half) = stream.into_split();
            Ok(Box::new(StreamTransport::with_max_line_length(
                read_half,
                write_half,
                max_line_length,
            )))
        }
        #[cfg(unix)]
        TransportInfo::SharedMemory {
            event_pipe,
            response_pipe,
            region_path,
            region_size,
        } => {
            let transport =
                ShmTransport::open(event_pipe, response_pipe, region_path, region_size).await?;
            Ok(Box::new(transport))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    type DuplexTransport = StreamTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn duplex_transport() -> (DuplexTransport, DuplexStream) {
        let (worker, host) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(worker);
        (StreamTransport::new(r, w), host)
    }

    #[tokio::test]
    async fn stream_delivers_one_payload_per_line() {
        let (mut transport, mut host) = duplex_transport();
        host.write_all(b"{\"a\":1}\n\n{\"b\":2}\r\n").await.unwrap();

        transport.wait_for_signal().await.unwrap();
        assert_eq!(transport.read_payload().await.unwrap(), Bytes::from_static(b"{\"a\":1}"));
        transport.wait_for_signal().await.unwrap();
        assert_eq!(transport.read_payload().await.unwrap(), Bytes::from_static(b"{\"b\":2}"));
        assert!(matches!(
            transport.read_payload().await,
            Err(TransportError::NoPayload)
        ));
    }

    #[tokio::test]
    async fn stream_eof_is_clean_close() {
        let (mut transport, mut host) = duplex_transport();
        host.write_all(b"last-without-newline").await.unwrap();
        drop(host);

        transport.wait_for_signal().await.unwrap();
        assert_eq!(
            transport.read_payload().await.unwrap(),
            Bytes::from_static(b"last-without-newline")
        );
        let err = transport.wait_for_signal().await.unwrap_err();
        assert!(err.is_clean_close());
    }

    #[tokio::test]
    async fn stream_send_writes_whole_message() {
        let (mut transport, host) = duplex_transport();
        transport.send(b"r{\"status_code\":200}\n").await.unwrap();
        transport.send(b"l{\"level\":\"info\"}\n").await.unwrap();

        let mut lines = BufReader::new(host).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "r{\"status_code\":200}");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "l{\"level\":\"info\"}");
    }

    #[tokio::test]
    async fn stream_overlong_line_is_transport_error() {
        let (worker, mut host) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(worker);
        let mut transport = StreamTransport::with_max_line_length(r, w, 8);
        host.write_all(b"0123456789abcdef\n").await.unwrap();

        let err = transport.wait_for_signal().await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(!err.is_clean_close());
    }

    #[tokio::test]
    async fn tcp_transport_enforces_line_limit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = TransportInfo::Tcp {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
        };
        let (transport, accepted) = tokio::join!(connect_transport(info, 16), listener.accept());
        let mut transport = transport.unwrap();
        let (mut host, _) = accepted.unwrap();
        host.write_all(&[b'x'; 64]).await.unwrap();

        let err = transport.wait_for_signal().await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(!err.is_clean_close());
    }

    #[test]
    fn error_classification() {
        assert!(TransportError::Closed.is_clean_close());
        assert!(
            TransportError::PayloadTooLarge {
                len: 10,
                capacity: 4
            }
            .is_per_message()
        );
        assert!(!TransportError::Io(io::Error::other("boom")).is_per_message());
    }

    #[cfg(target_os = "linux")]
    mod shm {
        use super::super::*;
        use crate::bridge::test_host::ShmHost;

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn shm_signal_discipline() {
            let host = ShmHost::create(256);
            let info = host.info();
            let host_thread = std::thread::spawn(move || {
                let mut host = host.connect();
                host.put(b"\x00\x00\x00\x03abc");
                host.signal();
                // first worker message
                host.wait();
                let first = host.take(5);
                host.signal();
                // second worker message arrives only after the ack above
                host.wait();
                let second = host.take(5);
                (first, second)
            });

            let mut transport = connect_transport(info, DEFAULT_MAX_LINE_LENGTH).await.unwrap();
            assert_eq!(transport.kind(), "shared-memory");
            transport.wait_for_signal().await.unwrap();
            assert_eq!(
                transport.read_payload().await.unwrap(),
                Bytes::from_static(b"\x00\x00\x00\x03abc")
            );
            transport.send(b"first").await.unwrap();
            transport.send(b"secnd").await.unwrap();

            let (first, second) = host_thread.join().unwrap();
            assert_eq!(first, b"first");
            assert_eq!(second, b"secnd");
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn shm_oversized_payload_is_rejected_without_writing() {
            let host = ShmHost::create(16);
            let info = host.info();
            let host_thread = std::thread::spawn(move || {
                let host = host.connect();
                host.region_snapshot()
            });

            let mut transport = connect_transport(info, DEFAULT_MAX_LINE_LENGTH).await.unwrap();
            let err = transport.send(&[7u8; 17]).await.unwrap_err();
            assert!(matches!(
                err,
                TransportError::PayloadTooLarge {
                    len: 17,
                    capacity: 16
                }
            ));
            let snapshot = host_thread.join().unwrap();
            assert!(snapshot.iter().all(|b| *b == 0));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn shm_host_closing_event_pipe_is_clean_close() {
            let host = ShmHost::create(64);
            let info = host.info();
            let host_thread = std::thread::spawn(move || {
                let host = host.connect();
                drop(host);
            });

            let mut transport = connect_transport(info, DEFAULT_MAX_LINE_LENGTH).await.unwrap();
            host_thread.join().unwrap();
            let err = transport.wait_for_signal().await.unwrap_err();
            assert!(err.is_clean_close());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn shm_oversized_length_prefix_hands_back_whole_region() {
            let host = ShmHost::create(16);
            let info = host.info();
            let host_thread = std::thread::spawn(move || {
                let mut host = host.connect();
                host.put(&[0, 0, 1, 0]);
                host.signal();
                host
            });

            let mut transport = connect_transport(info, DEFAULT_MAX_LINE_LENGTH).await.unwrap();
            transport.wait_for_signal().await.unwrap();
            let payload = transport.read_payload().await.unwrap();
            assert_eq!(payload.len(), 16);
            drop(host_thread.join().unwrap());
        }
    }
}
