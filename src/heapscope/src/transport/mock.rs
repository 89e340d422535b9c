//! Mock Transport
//!
//! A scripted transport for exercising the polling controller.

use super::{Transport, TransportError, TransportResult};

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Observable state shared between a mock and its test
#[derive(Default)]
pub struct MockState {
    /// Queued read results, consumed front to back
    pub responses: VecDeque<TransportResult<Vec<u8>>>,
    /// Address passed to every read, in order
    pub reads: Vec<Option<u64>>,
    /// When each read began
    pub read_started: Vec<Instant>,
    pub connects: usize,
    pub disconnects: usize,
    pub connected: bool,
    pub fail_connect: bool,
    /// Reads currently in flight
    pub in_flight: usize,
    pub max_in_flight: usize,
}

/// A transport whose reads come from a queue.
///
/// Clones share state, so a test can keep one handle after moving the
/// other into a controller.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    needs_address: bool,
    read_delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave like the monitor channel and expect an address
    pub fn requiring_address(mut self) -> Self {
        self.needs_address = true;
        self
    }

    /// Make every read take this long
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn push_bytes(&self, bytes: Vec<u8>) {
        self.state.lock().responses.push_back(Ok(bytes));
    }

    pub fn push_error(&self, error: TransportError) {
        self.state.lock().responses.push_back(Err(error));
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }
}

impl Transport for MockTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.fail_connect {
            return Err(TransportError::ConnectionClosed);
        }
        state.connected = true;
        Ok(())
    }

    async fn read(&mut self, _size: usize, address: Option<u64>) -> TransportResult<Vec<u8>> {
        {
            let mut state = self.state.lock();
            state.reads.push(address);
            state.read_started.push(Instant::now());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::NotReady("no scripted read".to_string())))
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn needs_address(&self) -> bool {
        self.needs_address
    }
}
