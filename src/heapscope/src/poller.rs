//! Polling controller
//!
//! Drives one read per interval for the lifetime of a debugging session:
//!
//! ```text
//! Idle --start--> Live --stop / session ended / resolution failure--> Stopped
//!                  ^                                                     |
//!                  +-----------------------start-------------------------+
//! ```
//!
//! Each tick runs resolve -> connect -> read -> decode -> publish to
//! completion before the next one is considered; ticks that come due while
//! a read is outstanding are skipped. Per-tick failures are logged and
//! retried on the next tick. Only a failed address resolution ends the
//! session.

use crate::codec::{self, BUFFER_SIZE};
use crate::config::WatchConfig;
use crate::publisher::{DisplaySink, PublishKind, UpdatePublisher};
use crate::resolver::{AddressResolver, ResolutionError};
use crate::transport::{SessionTransport, Transport, TransportError, WatchTarget};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Tells the controller whether a guest/debug session is still running
pub trait SessionProbe: Send + Sync {
    fn is_active(&self) -> bool;
}

impl<F> SessionProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_active(&self) -> bool {
        self()
    }
}

/// Lifecycle state of the live view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Live,
    Stopped,
}

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published(PublishKind),
    /// Guest not publishing yet; nothing shown
    NotReady,
    /// Transient transport or decode failure; nothing shown
    Skipped,
    /// No debug session anymore
    SessionEnded,
}

/// Everything one tick touches, behind a single lock
struct PollSession<T, D> {
    transport: T,
    resolver: Option<AddressResolver>,
    publisher: UpdatePublisher<D>,
    probe: Arc<dyn SessionProbe>,
}

impl<T: Transport, D: DisplaySink> PollSession<T, D> {
    async fn tick(&mut self) -> Result<TickOutcome, ResolutionError> {
        if !self.probe.is_active() {
            return Ok(TickOutcome::SessionEnded);
        }

        let address = match self.resolver.as_mut() {
            Some(resolver) if self.transport.needs_address() => Some(resolver.resolve()?),
            _ => None,
        };

        if !self.transport.is_connected() {
            if let Err(e) = self.transport.connect().await {
                return Ok(transient(e));
            }
        }

        let bytes = match self.transport.read(BUFFER_SIZE, address).await {
            Ok(bytes) => bytes,
            Err(e) => return Ok(transient(e)),
        };

        match codec::decode(&bytes) {
            Ok(snapshot) => Ok(TickOutcome::Published(self.publisher.publish(snapshot))),
            Err(e) if e.is_not_ready() => {
                debug!("Guest buffer not initialized yet: {}", e);
                Ok(TickOutcome::NotReady)
            }
            Err(e) => {
                warn!("Discarding unreadable snapshot: {}", e);
                Ok(TickOutcome::Skipped)
            }
        }
    }

    /// Release the connection and forget the session's address
    async fn end(&mut self) {
        self.transport.disconnect().await;
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.clear();
        }
    }

    async fn fail(&mut self, err: &ResolutionError) {
        error!("Cannot locate guest buffer, live view stopped: {}", err);
        self.publisher.fail(err.to_string());
        self.end().await;
    }
}

fn transient(err: TransportError) -> TickOutcome {
    if err.is_not_ready() {
        debug!("{}", err);
        TickOutcome::NotReady
    } else {
        warn!("Transport error, retrying next tick: {}", err);
        TickOutcome::Skipped
    }
}

/// Owns the transport for a session and schedules its reads
pub struct PollingController<T, D> {
    session: Arc<Mutex<PollSession<T, D>>>,
    state: Arc<watch::Sender<PollState>>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl<D: DisplaySink + 'static> PollingController<SessionTransport, D> {
    /// Controller for whichever transport the target calls for
    pub fn for_target(
        target: &WatchTarget,
        config: &WatchConfig,
        probe: Arc<dyn SessionProbe>,
        sink: D,
    ) -> Self {
        let resolver = match target {
            WatchTarget::Monitor { symbols, .. } => Some(AddressResolver::new(
                symbols.clone(),
                config.symbols.clone(),
            )),
            WatchTarget::SharedMemory { .. } => None,
        };

        Self::new(
            SessionTransport::for_target(target, config),
            resolver,
            probe,
            sink,
            config.poll_interval(),
        )
    }
}

impl<T, D> PollingController<T, D>
where
    T: Transport + 'static,
    D: DisplaySink + 'static,
{
    pub fn new(
        transport: T,
        resolver: Option<AddressResolver>,
        probe: Arc<dyn SessionProbe>,
        sink: D,
        interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            session: Arc::new(Mutex::new(PollSession {
                transport,
                resolver,
                publisher: UpdatePublisher::new(sink),
                probe,
            })),
            state: Arc::new(state),
            interval,
            task: None,
        }
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    /// Go live: read once now, then every interval.
    ///
    /// Calling this while live restarts the timer. A resolution failure is
    /// returned here and leaves the controller stopped; every other failure
    /// is retried on later ticks.
    pub async fn start(&mut self) -> Result<(), ResolutionError> {
        if let Some(task) = self.task.take() {
            debug!("Restarting poll timer");
            task.abort();
        }

        let previous = self.state.send_replace(PollState::Live);
        let mut session = self.session.lock().await;
        if previous != PollState::Live {
            info!("Live view started");
            session.publisher.begin();
        }

        match session.tick().await {
            Ok(TickOutcome::SessionEnded) => {
                info!("No active debug session, live view stopped");
                session.end().await;
                self.state.send_replace(PollState::Stopped);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                session.fail(&e).await;
                self.state.send_replace(PollState::Stopped);
                return Err(e);
            }
        }
        drop(session);

        self.task = Some(tokio::spawn(run_loop(
            Arc::clone(&self.session),
            Arc::clone(&self.state),
            self.interval,
        )));
        Ok(())
    }

    /// Cancel the timer, disconnect, and forget the resolved address
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.session.lock().await.end().await;

        let was_live = self.state.send_if_modified(|state| {
            let live = *state == PollState::Live;
            if live {
                *state = PollState::Stopped;
            }
            live
        });
        if was_live {
            info!("Live view stopped");
        }
    }

    /// Stop and end the display session
    pub async fn dispose(mut self) {
        self.stop().await;
        self.session.lock().await.publisher.reset();
    }
}

impl<T, D> Drop for PollingController<T, D> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_loop<T, D>(
    session: Arc<Mutex<PollSession<T, D>>>,
    state: Arc<watch::Sender<PollState>>,
    period: Duration,
) where
    T: Transport,
    D: DisplaySink,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_finished = Instant::now();

    loop {
        // Skip only realigns later deadlines; the first missed one still
        // fires at once and has to be dropped here
        let due = ticker.tick().await;
        if due < last_finished {
            trace!("Dropping tick that came due during the previous read");
            continue;
        }

        let mut session = session.lock().await;
        let outcome = session.tick().await;
        last_finished = Instant::now();

        match outcome {
            Ok(TickOutcome::SessionEnded) => {
                info!("Debug session ended, live view stopped");
                session.end().await;
                state.send_replace(PollState::Stopped);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                session.fail(&e).await;
                state.send_replace(PollState::Stopped);
                break;
            }
        }
    }
}
