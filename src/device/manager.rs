use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::{EventBus, LinkEvent, StatusChange};
use crate::serial::{self, LinkIo, PortInfo, SerialBackend, SerialEndpoint};
use super::{ConnectionState, DeviceError, LinkStatus, PortScan, ReconnectPolicy, Result, ScoredPort};

const READ_CHUNK: usize = 512;
const MAX_PARTIAL_BYTES: usize = 8192;
const KEEP_PARTIAL_BYTES: usize = 4096;
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    /// Requested by a caller; resets the retry budget
    Explicit,
    /// Fired by the reconnect timer
    Scheduled,
}

type SharedWriter = Arc<Mutex<WriteHalf<Box<dyn LinkIo>>>>;

struct Session {
    id: Uuid,
    writer: SharedWriter,
    reader: JoinHandle<()>,
    /// Dropped when the session closes; pending writes watch it and bail out
    alive: watch::Sender<()>,
}

struct LinkSlot {
    state: ConnectionState,
    retry_count: u32,
    /// Bumped on every attempt so stale attempts can detect they were superseded
    attempt: u64,
    port: Option<String>,
    port_score: u8,
    session: Option<Session>,
    reconnect_timer: Option<JoinHandle<()>>,
    dynamic_switching: bool,
}

struct Inner {
    endpoint: SerialEndpoint,
    backend: Arc<dyn SerialBackend>,
    policy: ReconnectPolicy,
    events: EventBus,
    lines_tx: mpsc::Sender<String>,
    slot: Mutex<LinkSlot>,
}

/// Owns the lifecycle of the one serial device this process talks to.
///
/// Connection attempts are serialized: a connect request while another
/// attempt is in flight is coalesced into it. Failures drive a bounded
/// fixed-delay reconnect policy with at most one pending timer. Every
/// complete line read from the port is published as an event and forwarded
/// in arrival order to the line channel given at construction.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

impl DeviceManager {
    pub fn new(
        endpoint: SerialEndpoint,
        backend: Arc<dyn SerialBackend>,
        policy: ReconnectPolicy,
        events: EventBus,
        lines_tx: mpsc::Sender<String>,
        dynamic_switching: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                backend,
                policy,
                events,
                lines_tx,
                slot: Mutex::new(LinkSlot {
                    state: ConnectionState::Idle,
                    retry_count: 0,
                    attempt: 0,
                    port: None,
                    port_score: 0,
                    session: None,
                    reconnect_timer: None,
                    dynamic_switching,
                }),
            }),
        }
    }

    pub fn endpoint(&self) -> &SerialEndpoint {
        &self.inner.endpoint
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Open the configured (or best auto-detected) port.
    pub async fn connect(&self) -> Result<()> {
        self.inner.attempt(AttemptKind::Explicit, None).await
    }

    /// Close the port and suppress any automatic reconnection.
    /// Safe to call when already closed.
    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        // Exhaust the budget before closing so a racing timer cannot reopen
        slot.retry_count = self.inner.policy.max_retries;
        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }
        self.inner.close_session(&mut slot, "Disconnect requested").await;
        Ok(())
    }

    /// Drop the current session, reset the retry budget and connect again.
    pub async fn force_reconnect(&self) -> Result<()> {
        {
            let mut slot = self.inner.slot.lock().await;
            if let Some(timer) = slot.reconnect_timer.take() {
                timer.abort();
            }
            if slot.state == ConnectionState::Connecting {
                slot.retry_count = 0;
                log::debug!("Reconnect request coalesced with the attempt in flight");
                return Ok(());
            }
            self.inner.close_session(&mut slot, "Reconnect requested").await;
        }
        self.inner.attempt(AttemptKind::Explicit, None).await
    }

    /// Write raw bytes to the open port.
    ///
    /// The link lock is not held while writing, so a device that stops
    /// reading cannot block status queries or a disconnect. Closing the
    /// session cancels the write with `NotConnected`.
    pub async fn send_data(&self, data: &[u8]) -> Result<usize> {
        let (writer, mut alive) = {
            let slot = self.inner.slot.lock().await;
            let session = slot.session.as_ref().ok_or(DeviceError::NotConnected)?;
            (Arc::clone(&session.writer), session.alive.subscribe())
        };

        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        tokio::select! {
            result = write => result?,
            _ = alive.changed() => {
                log::warn!("Serial link closed while writing {} byte(s)", data.len());
                return Err(DeviceError::NotConnected);
            }
        }

        log::debug!("Sent {} byte(s) to serial device", data.len());
        self.inner.events.publish(LinkEvent::DataSent { bytes: data.len() });
        Ok(data.len())
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.slot.lock().await.state
    }

    pub async fn status(&self) -> LinkStatus {
        let slot = self.inner.slot.lock().await;
        LinkStatus {
            state: slot.state,
            port: slot.port.clone(),
            session_id: slot.session.as_ref().map(|s| s.id),
            retry_count: slot.retry_count,
            max_retries: self.inner.policy.max_retries,
            dynamic_port_switching: slot.dynamic_switching,
        }
    }

    pub async fn set_dynamic_port_switching(&self, enabled: bool) {
        let mut slot = self.inner.slot.lock().await;
        slot.dynamic_switching = enabled;
        log::info!("Dynamic port switching {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn list_candidate_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(serial::list_candidate_ports(self.inner.backend.as_ref())?)
    }

    /// Rescan ports; when dynamic switching is on and a port with a stronger
    /// vendor signature than the current one shows up, move the link there.
    pub async fn scan_for_better_ports(&self) -> Result<PortScan> {
        let ports = self.list_candidate_ports()?;
        let scored: Vec<ScoredPort> = ports
            .iter()
            .map(|port| ScoredPort {
                port: port.clone(),
                score: serial::score_port(port),
            })
            .collect();
        let best = serial::select_best_port(&ports).ok();

        let (current, should_switch) = {
            let slot = self.inner.slot.lock().await;
            let should_switch = best.as_ref().is_some_and(|best| {
                slot.dynamic_switching
                    && self.inner.endpoint.path.is_none()
                    && slot.state.is_open()
                    && slot.port.as_deref() != Some(best.port_name.as_str())
                    && serial::score_port(best) > slot.port_score
            });
            (slot.port.clone(), should_switch)
        };

        let mut switched = false;
        if let Some(best) = best.as_ref().filter(|_| should_switch) {
            log::info!(
                "Switching serial link from {:?} to better port {}",
                current,
                best.port_name
            );
            {
                let mut slot = self.inner.slot.lock().await;
                self.inner.close_session(&mut slot, "Switching to a better port").await;
            }
            match self.inner.attempt(AttemptKind::Explicit, Some(best.clone())).await {
                Ok(()) => {
                    switched = true;
                    self.inner.events.publish(LinkEvent::PortSwitched {
                        from: current.clone(),
                        to: best.port_name.clone(),
                    });
                }
                Err(e) => log::warn!("Switch to {} failed: {}", best.port_name, e),
            }
        }

        Ok(PortScan {
            ports: scored,
            current: if switched { best.as_ref().map(|b| b.port_name.clone()) } else { current },
            best,
            switched,
        })
    }
}

impl Inner {
    async fn attempt(self: &Arc<Self>, kind: AttemptKind, target: Option<PortInfo>) -> Result<()> {
        let attempt_id = {
            let mut slot = self.slot.lock().await;
            match slot.state {
                ConnectionState::Connecting => {
                    log::debug!("Connect request coalesced with the attempt in flight");
                    return Ok(());
                }
                ConnectionState::Open => return Ok(()),
                state if kind == AttemptKind::Scheduled && state != ConnectionState::Reconnecting => {
                    log::debug!("Scheduled reconnect skipped, link is {}", state);
                    return Ok(());
                }
                _ => {}
            }

            match kind {
                AttemptKind::Explicit => {
                    if let Some(timer) = slot.reconnect_timer.take() {
                        timer.abort();
                    }
                    slot.retry_count = 0;
                }
                // We are running inside the timer task; just forget its handle
                AttemptKind::Scheduled => slot.reconnect_timer = None,
            }

            slot.attempt += 1;
            let target_name = target
                .as_ref()
                .map(|p| p.port_name.clone())
                .or_else(|| self.endpoint.path.clone())
                .unwrap_or_else(|| "auto-detect".to_string());
            self.transition(
                &mut slot,
                ConnectionState::Connecting,
                format!("Attempting {} @ {} baud", target_name, self.endpoint.baud_rate),
            );
            slot.attempt
        };

        let outcome = self.open_port(target).await;

        let mut slot = self.slot.lock().await;
        if slot.attempt != attempt_id || slot.state != ConnectionState::Connecting {
            log::info!("Discarding superseded connection attempt");
            return Err(DeviceError::Superseded);
        }

        match outcome {
            Ok((port, score, io)) => {
                let (reader_half, writer_half) = tokio::io::split(io);
                let session_id = Uuid::new_v4();
                let reader = tokio::spawn(read_loop(Arc::clone(self), session_id, reader_half));
                let (alive, _) = watch::channel(());
                slot.session = Some(Session {
                    id: session_id,
                    writer: Arc::new(Mutex::new(writer_half)),
                    reader,
                    alive,
                });
                slot.port = Some(port.port_name.clone());
                slot.port_score = score;
                slot.retry_count = 0;
                self.transition(
                    &mut slot,
                    ConnectionState::Open,
                    format!("Connected: {}", port.port_name),
                );
                Ok(())
            }
            Err(e) if e.is_discovery_failure() => {
                log::error!("Serial port discovery failed: {}", e);
                self.transition(&mut slot, ConnectionState::Closed, format!("Discovery failed: {}", e));
                Err(DeviceError::SerialError(e))
            }
            Err(e) => {
                log::error!("Serial connection failed: {}", e);
                self.handle_failure(&mut slot, format!("Connection failed: {}", e));
                Err(DeviceError::SerialError(e))
            }
        }
    }

    async fn open_port(&self, target: Option<PortInfo>) -> serial::Result<(PortInfo, u8, Box<dyn LinkIo>)> {
        let port = match (target, &self.endpoint.path) {
            (Some(port), _) => port,
            (None, Some(path)) => PortInfo::bare(path.clone()),
            (None, None) => {
                let ports = serial::list_candidate_ports(self.backend.as_ref())?;
                serial::select_best_port(&ports)?
            }
        };
        let score = serial::score_port(&port);
        let io = self.backend.open(&port.port_name, self.endpoint.baud_rate).await?;
        Ok((port, score, io))
    }

    fn transition(&self, slot: &mut LinkSlot, next: ConnectionState, detail: impl Into<String>) {
        let detail = detail.into();
        let previous = slot.state;
        slot.state = next;
        log::info!("Serial link {} -> {}: {}", previous, next, detail);
        self.events.publish(LinkEvent::StatusChanged(StatusChange {
            previous,
            current: next,
            detail,
            at: Utc::now(),
        }));
    }

    /// Close after a failure and schedule a reconnect while budget remains.
    fn handle_failure(self: &Arc<Self>, slot: &mut LinkSlot, detail: String) {
        self.transition(slot, ConnectionState::Closed, detail);

        if slot.retry_count >= self.policy.max_retries {
            log::warn!(
                "Giving up after {} reconnect attempt(s); waiting for an explicit reconnect",
                self.policy.max_retries
            );
            return;
        }

        slot.retry_count += 1;
        let detail = format!(
            "Reconnect attempt {}/{} in {:?}",
            slot.retry_count, self.policy.max_retries, self.policy.delay
        );
        self.transition(slot, ConnectionState::Reconnecting, detail);
        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }
        slot.reconnect_timer = Some(tokio::spawn(Arc::clone(self).reconnect_after(self.policy.delay)));
    }

    fn reconnect_after(self: Arc<Self>, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = self.attempt(AttemptKind::Scheduled, None).await {
                log::debug!("Scheduled reconnect did not succeed: {}", e);
            }
        })
    }

    /// Tear down the open session, or cancel an attempt in progress.
    async fn close_session(&self, slot: &mut LinkSlot, detail: &str) {
        if let Some(session) = slot.session.take() {
            self.transition(slot, ConnectionState::Closing, detail);
            session.reader.abort();
            drop(session.alive);
            let writer = session.writer;
            let shutdown = async move { writer.lock().await.shutdown().await };
            match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, shutdown).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("Error shutting down serial writer: {}", e),
                Err(_) => log::warn!("Serial writer did not shut down in time, dropping it"),
            }
            let port = slot.port.clone().unwrap_or_default();
            self.transition(slot, ConnectionState::Closed, format!("Disconnected: {}", port));
        } else if matches!(slot.state, ConnectionState::Connecting | ConnectionState::Reconnecting) {
            slot.attempt += 1;
            self.transition(slot, ConnectionState::Closed, detail);
        }
    }

    async fn link_lost(self: &Arc<Self>, session_id: Uuid, reason: String) {
        let mut slot = self.slot.lock().await;
        if slot.session.as_ref().map(|s| s.id) != Some(session_id) {
            return;
        }
        // This runs on the reader task itself, so the handle is only dropped
        slot.session = None;
        log::warn!("Serial link lost: {}", reason);
        self.handle_failure(&mut slot, format!("Connection lost: {}", reason));
    }

    async fn deliver_line(&self, line: String) {
        self.events.publish(LinkEvent::LineReceived {
            raw: line.clone(),
            received_at: Utc::now(),
        });
        if self.lines_tx.send(line).await.is_err() {
            log::debug!("Line consumer gone, dropping line");
        }
    }
}

async fn read_loop(inner: Arc<Inner>, session_id: Uuid, mut reader: ReadHalf<Box<dyn LinkIo>>) {
    let mut splitter = LineSplitter::new(&inner.endpoint.line_delimiter);
    let mut buf = [0u8; READ_CHUNK];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "port closed".to_string(),
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    inner.deliver_line(line).await;
                }
            }
            Err(e) => break e.to_string(),
        }
    };

    inner.link_lost(session_id, reason).await;
}

/// Splits a byte stream into delimiter-terminated lines.
///
/// Bytes without a delimiter are buffered; once more than 8 KiB pile up only
/// the newest 4 KiB are kept.
struct LineSplitter {
    delimiter: Vec<u8>,
    partial: Vec<u8>,
}

impl LineSplitter {
    fn new(delimiter: &str) -> Self {
        Self {
            delimiter: delimiter.as_bytes().to_vec(),
            partial: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = find_delimiter(&self.partial, &self.delimiter) {
            lines.push(String::from_utf8_lossy(&self.partial[..pos]).into_owned());
            self.partial.drain(..pos + self.delimiter.len());
        }
        if self.partial.len() > MAX_PARTIAL_BYTES {
            let excess = self.partial.len() - KEEP_PARTIAL_BYTES;
            log::warn!("No line delimiter in {} bytes, trimming partial buffer", self.partial.len());
            self.partial.drain(..excess);
        }
        lines
    }
}

fn find_delimiter(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    if delimiter.is_empty() || haystack.len() < delimiter.len() {
        return None;
    }
    haystack.windows(delimiter.len()).position(|w| w == delimiter)
}
