//! Blocking host side of the shared-memory protocol, used by tests.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use memmap2::MmapMut;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tempfile::TempDir;

use super::binary::LENGTH_PREFIX_LEN;
use super::codec::MessageCodec;
use super::protocol::{Event, LogRecord, Outbound, Response};
use super::transport::TransportInfo;

/// FIFOs and region file, not yet opened.
pub struct ShmHost {
    dir: TempDir,
    size: usize,
}

impl ShmHost {
    pub fn create(size: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        mkfifo(dir.path().join("event.fifo").as_path(), Mode::S_IRWXU).unwrap();
        mkfifo(dir.path().join("response.fifo").as_path(), Mode::S_IRWXU).unwrap();
        let region = File::create(dir.path().join("region")).unwrap();
        region.set_len(size as u64).unwrap();
        Self { dir, size }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn info(&self) -> TransportInfo {
        TransportInfo::SharedMemory {
            event_pipe: self.path("event.fifo"),
            response_pipe: self.path("response.fifo"),
            region_path: self.path("region"),
            region_size: self.size,
        }
    }

    /// Open both pipes (event first) and map the region. Blocks until the worker
    /// opens its ends.
    pub fn connect(self) -> ConnectedHost {
        let events = OpenOptions::new()
            .write(true)
            .open(self.path("event.fifo"))
            .unwrap();
        let responses = File::open(self.path("response.fifo")).unwrap();
        let region_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path("region"))
            .unwrap();
        // Safety: the file lives in this host's private temp dir and the worker
        // only touches it between our signal and its reply.
        let region = unsafe { MmapMut::map_mut(&region_file).unwrap() };
        ConnectedHost {
            _dir: self.dir,
            events,
            responses,
            region,
        }
    }
}

pub struct ConnectedHost {
    _dir: TempDir,
    events: File,
    responses: File,
    region: MmapMut,
}

impl ConnectedHost {
    pub fn put(&mut self, bytes: &[u8]) {
        self.region[..bytes.len()].copy_from_slice(bytes);
        self.region.flush().unwrap();
    }

    pub fn signal(&mut self) {
        self.events.write_all(b"e").unwrap();
        self.events.flush().unwrap();
    }

    /// Wait for the worker's signal. `false` once the worker closed its pipe.
    pub fn wait(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match self.responses.read(&mut byte) {
            Ok(1) => true,
            Ok(_) => false,
            Err(e) => panic!("signal read failed: {e}"),
        }
    }

    pub fn take(&self, n: usize) -> Vec<u8> {
        self.region[..n].to_vec()
    }

    pub fn region_snapshot(&self) -> Vec<u8> {
        self.region.to_vec()
    }

    pub fn send_event(&mut self, codec: &dyn MessageCodec, event: &Event) {
        let raw = codec.encode_event(event).unwrap();
        self.put(&raw);
        self.signal();
    }

    /// Wait for the next worker message and decode it from the region.
    pub fn next_outbound(&mut self, codec: &dyn MessageCodec) -> Option<Outbound> {
        if !self.wait() {
            return None;
        }
        let header = self.take(1 + LENGTH_PREFIX_LEN);
        let declared = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let raw = self.take(1 + LENGTH_PREFIX_LEN + declared);
        Some(codec.decode_outbound(&raw).unwrap())
    }

    /// Send one event and collect every log up to and including its response.
    /// Each log is acknowledged so the worker can reuse the region.
    pub fn request(
        &mut self,
        codec: &dyn MessageCodec,
        event: &Event,
    ) -> (Vec<LogRecord>, Response) {
        self.send_event(codec, event);
        let mut logs = Vec::new();
        loop {
            match self.next_outbound(codec) {
                Some(Outbound::Log(record)) => {
                    logs.push(record);
                    self.signal();
                }
                Some(Outbound::Response(response)) => return (logs, response),
                None => panic!("worker closed before responding"),
            }
        }
    }
}
