//! QMP Monitor Transport
//!
//! Reads guest physical memory through the hypervisor's QMP socket using
//! `human-monitor-command` + `xp`, while the guest keeps running.
//!
//! Wire protocol is newline-delimited JSON. Requests carry an integer id;
//! a background task reads every line from the socket and completes the
//! matching entry of the pending-request table.

use super::{Transport, TransportError, TransportResult};

use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Top-level key identifying the QMP greeting
const GREETING_MARKER: &str = "QMP";

/// Request id reserved for capabilities negotiation
const HANDSHAKE_ID: u64 = 0;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `0xHH` tokens in monitor output
fn hex_byte_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Literal pattern, pinned by test_hex_byte_pattern_compiles
    PATTERN.get_or_init(|| Regex::new(r"\b0[xX]([0-9a-fA-F]{2})\b").expect("valid hex byte pattern"))
}

/// Extract the byte tokens of an `xp /Nxb` dump.
///
/// Every standalone `0xHH` token is taken in order; addresses and other
/// text are skipped. The result is truncated or zero-padded to `size`.
pub fn parse_hex_dump(text: &str, size: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = hex_byte_pattern()
        .captures_iter(text)
        .filter_map(|c| u8::from_str_radix(&c[1], 16).ok())
        .collect();

    if bytes.len() != size {
        warn!(
            "Hex dump size mismatch: requested {} bytes, parsed {}",
            size,
            bytes.len()
        );
        bytes.resize(size, 0);
    }

    bytes
}

/// A request waiting for its reply
struct PendingRequest {
    command: String,
    deadline: Instant,
    reply: oneshot::Sender<TransportResult<Value>>,
}

/// Outstanding requests keyed by id, private to one connection
#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingTable {
    fn insert(&self, id: u64, request: PendingRequest) {
        self.entries.lock().insert(id, request);
    }

    fn remove(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Deliver a reply. Returns false when no request has this id.
    fn complete(&self, id: u64, result: TransportResult<Value>) -> bool {
        match self.entries.lock().remove(&id) {
            Some(request) => {
                // Requester may have given up already
                let _ = request.reply.send(result);
                true
            }
            None => false,
        }
    }

    /// Reject every request whose deadline has passed
    fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<u64> = entries
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(request) = entries.remove(id) {
                let _ = request.reply.send(Err(TransportError::Timeout {
                    id: *id,
                    command: request.command,
                }));
            }
        }

        expired.len()
    }

    fn fail_all(&self) {
        for (_, request) in self.entries.lock().drain() {
            let _ = request.reply.send(Err(TransportError::ConnectionClosed));
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// One live QMP session
struct Connection {
    writer: OwnedWriteHalf,
    pending: Arc<PendingTable>,
    next_id: u64,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Transport over a QEMU QMP unix socket
pub struct MonitorTransport {
    socket_path: PathBuf,
    handshake_timeout: Duration,
    request_timeout: Duration,
    connection: Option<Connection>,
}

impl MonitorTransport {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection: None,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.connection
            .as_ref()
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    /// Send one QMP command and wait for its reply.
    ///
    /// A timeout drops the request from the table but keeps the connection.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> TransportResult<Value> {
        let timeout = self.request_timeout;
        let conn = self
            .connection
            .as_mut()
            .filter(|c| c.is_alive())
            .ok_or(TransportError::NotConnected)?;

        let id = conn.next_id;
        conn.next_id += 1;

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(
            id,
            PendingRequest {
                command: command.to_string(),
                deadline: Instant::now() + timeout,
                reply: tx,
            },
        );

        let mut request = json!({ "execute": command, "id": id });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        trace!("QMP -> {}", request);

        if let Err(e) = send_line(&mut conn.writer, &request).await {
            conn.pending.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                conn.pending.remove(id);
                Err(TransportError::Timeout {
                    id,
                    command: command.to_string(),
                })
            }
        }
    }
}

impl Transport for MonitorTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        self.disconnect().await;

        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let limit_ms = self.handshake_timeout.as_millis() as u64;
        tokio::time::timeout(self.handshake_timeout, handshake(&mut lines, &mut write_half))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(limit_ms))??;

        let pending = Arc::new(PendingTable::default());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(lines, Arc::clone(&pending), Arc::clone(&alive)));

        self.connection = Some(Connection {
            writer: write_half,
            pending,
            next_id: HANDSHAKE_ID + 1,
            alive,
            reader,
        });

        info!("Connected to QMP monitor at {}", self.socket_path.display());
        Ok(())
    }

    async fn read(&mut self, size: usize, address: Option<u64>) -> TransportResult<Vec<u8>> {
        let address = address.ok_or(TransportError::MissingAddress)?;
        let command_line = format!("xp /{}xb {:#x}", size, address);

        let reply = self
            .execute(
                "human-monitor-command",
                Some(json!({ "command-line": command_line })),
            )
            .await?;

        let text = reply.as_str().ok_or_else(|| {
            TransportError::Protocol(format!("expected text from monitor, got {}", reply))
        })?;

        Ok(parse_hex_dump(text, size))
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.reader.abort();
            conn.alive.store(false, Ordering::SeqCst);
            conn.pending.fail_all();
            if let Err(e) = conn.writer.shutdown().await {
                debug!("Monitor socket shutdown: {}", e);
            }
            info!("Disconnected from QMP monitor");
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_alive)
    }

    fn needs_address(&self) -> bool {
        true
    }
}

async fn send_line<W>(writer: &mut W, message: &Value) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Wait for the greeting, then negotiate capabilities
async fn handshake<R, W>(lines: &mut Lines<R>, writer: &mut W) -> TransportResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = lines.next_line().await?.ok_or_else(|| {
            TransportError::Handshake("connection closed before greeting".to_string())
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = serde_json::from_str(&line)
            .map_err(|e| TransportError::Handshake(format!("invalid greeting: {}", e)))?;
        if message.get(GREETING_MARKER).is_some() {
            trace!("QMP greeting: {}", line);
            break;
        }
        trace!("Skipping message before greeting: {}", line);
    }

    send_line(
        writer,
        &json!({ "execute": "qmp_capabilities", "id": HANDSHAKE_ID }),
    )
    .await?;

    loop {
        let line = lines.next_line().await?.ok_or_else(|| {
            TransportError::Handshake("connection closed during negotiation".to_string())
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = serde_json::from_str(&line)
            .map_err(|e| TransportError::Handshake(format!("invalid reply: {}", e)))?;
        if message.get("id").and_then(Value::as_u64) != Some(HANDSHAKE_ID) {
            trace!("Skipping message during negotiation: {}", line);
            continue;
        }

        return match reply_result(&message) {
            Ok(_) => Ok(()),
            Err(TransportError::Monitor(desc)) => Err(TransportError::Handshake(desc)),
            Err(e) => Err(e),
        };
    }
}

/// Dispatch incoming lines to the pending table until the socket closes
async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                dispatch_line(&line, &pending);
                let expired = pending.sweep_expired(Instant::now());
                if expired > 0 {
                    debug!("Dropped {} expired monitor requests", expired);
                }
            }
            Ok(None) => {
                debug!("Monitor closed the connection");
                break;
            }
            Err(e) => {
                warn!("Monitor read failed: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    pending.fail_all();
}

fn dispatch_line(line: &str, pending: &PendingTable) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    trace!("QMP <- {}", line);

    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed monitor line: {}", e);
            return;
        }
    };

    if let Some(event) = message.get("event").and_then(Value::as_str) {
        trace!("Monitor event: {}", event);
        return;
    }

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        debug!("Ignoring monitor reply without id");
        return;
    };

    if !pending.complete(id, reply_result(&message)) {
        debug!("Ignoring stale monitor reply for request {}", id);
    }
}

fn reply_result(message: &Value) -> TransportResult<Value> {
    if let Some(error) = message.get("error") {
        let desc = error
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("unknown monitor error");
        return Err(TransportError::Monitor(desc.to_string()));
    }

    message
        .get("return")
        .cloned()
        .ok_or_else(|| TransportError::Protocol("reply has neither return nor error".to_string()))
}
