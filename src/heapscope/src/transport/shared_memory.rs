//! Shared Memory Transport
//!
//! The guest buffer lives in a host file (e.g. an ivshmem backing file
//! under /dev/shm). There is no handshake; each read maps the file and
//! copies it out whole.

use super::{Transport, TransportError, TransportResult};

use memmap2::Mmap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Transport reading a memory-backed file
pub struct SharedMemoryTransport {
    path: PathBuf,
    /// Set once the backing file has been seen
    observed: bool,
}

impl SharedMemoryTransport {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            observed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn not_ready(&self, why: &str) -> TransportError {
        TransportError::NotReady(format!("{} ({})", self.path.display(), why))
    }

    fn open(&mut self) -> TransportResult<File> {
        match File::open(&self.path) {
            Ok(file) => {
                self.observed = true;
                Ok(file)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.observed = false;
                Err(self.not_ready("file does not exist yet"))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Transport for SharedMemoryTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        self.open().map(|_| ())
    }

    async fn read(&mut self, _size: usize, _address: Option<u64>) -> TransportResult<Vec<u8>> {
        let file = self.open()?;
        if file.metadata()?.len() == 0 {
            return Err(self.not_ready("file is empty"));
        }

        // SAFETY: the mapping is copied out immediately and dropped. The
        // guest may write concurrently, which can only yield torn bytes.
        let map = unsafe { Mmap::map(&file) }?;
        debug!("Read {} bytes from {}", map.len(), self.path.display());
        Ok(map.to_vec())
    }

    async fn disconnect(&mut self) {
        self.observed = false;
    }

    fn is_connected(&self) -> bool {
        self.observed
    }

    fn needs_address(&self) -> bool {
        false
    }
}
