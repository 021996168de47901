//! Event delivery: a bounded queue drained by one worker thread into the
//! connected consumer.
//!
//! Interception callbacks only ever push; the worker is the single reader.
//! A send never happens under the queue lock: the front record is copied
//! out, sent, and popped afterwards unless the queue was cleared meanwhile.

use crate::clock::Clock;
use crate::config::ConfigCell;
use crate::events::EventSink;
use crate::queue::{QueueError, RawEventQueue};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

pub const STARTED_WAKE_INTERVAL_MS: u64 = 1_000;
pub const STOPPED_WAKE_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Event queue limit exceeded")]
    QueueLimitExceeded,
    #[error("A consumer is already connected (pid {0})")]
    AlreadyConnected(u32),
    #[error("No consumer is connected")]
    NotConnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Send timed out")]
    Timeout,
    #[error("Consumer disconnected")]
    Disconnected,
    #[error("Send failed: {0}")]
    Failed(String),
}

/// Transport to the connected consumer.
pub trait EventChannel: Send + Sync {
    fn send(&self, record: &[u8], timeout: Duration) -> Result<(), ChannelError>;
}

/// Outcome of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Idle,
    MoreWork,
}

struct QueueState {
    queue: RawEventQueue,
    /// Bumped on every clear so an in-flight send never pops a newer entry.
    generation: u64,
    overflow_reported: bool,
    notified: bool,
}

#[derive(Default)]
struct Connection {
    channel: Option<Arc<dyn EventChannel>>,
    consumer_pid: Option<u32>,
    backoff_until: Option<u64>,
    grace_deadline: Option<u64>,
}

struct Shared {
    queue: Mutex<QueueState>,
    wakeup: Condvar,
    connection: Mutex<Connection>,
    config: Arc<ConfigCell>,
    clock: Arc<dyn Clock>,
    monitoring: Arc<AtomicBool>,
    wake_interval_ms: AtomicU64,
    shutdown: AtomicBool,
    sent: AtomicU64,
}

fn byte_limit(bytes: u64) -> usize {
    usize::try_from(bytes).unwrap_or(usize::MAX)
}

impl Shared {
    fn notify(&self) {
        let mut state = self.queue.lock();
        state.notified = true;
        self.wakeup.notify_one();
    }

    fn push(&self, record: &[u8]) -> Result<(), DeliveryError> {
        let mut state = self.queue.lock();
        match state.queue.push(record) {
            Ok(()) => {
                state.notified = true;
                self.wakeup.notify_one();
                Ok(())
            }
            Err(QueueError::LimitExceeded {
                entries,
                bytes,
                limit,
            }) => {
                if !state.overflow_reported {
                    state.overflow_reported = true;
                    warn!(entries, bytes, limit, "event queue limit exceeded, events dropped");
                }
                Err(DeliveryError::QueueLimitExceeded)
            }
        }
    }

    fn clear_queue(&self) {
        let mut state = self.queue.lock();
        state.queue.clear();
        state.generation += 1;
        state.overflow_reported = false;
    }

    fn detach(&self, conn: &mut Connection, now: u64) -> Option<u32> {
        conn.channel = None;
        conn.backoff_until = None;
        conn.grace_deadline = Some(now + self.config.snapshot().connection_timeout_ms);
        conn.consumer_pid.take()
    }

    fn stop_monitoring(&self, clear: bool) {
        self.monitoring.store(false, Ordering::SeqCst);
        self.wake_interval_ms
            .store(STOPPED_WAKE_INTERVAL_MS, Ordering::SeqCst);
        if clear {
            self.clear_queue();
        }
    }

    fn poll_once(&self) -> WorkState {
        let now = self.clock.now_ms();
        let channel = {
            let mut conn = self.connection.lock();
            let current = conn.channel.clone();
            match current {
                Some(channel) => channel,
                None => {
                    let expired = conn.grace_deadline.is_some_and(|deadline| now > deadline);
                    if expired {
                        conn.grace_deadline = None;
                        drop(conn);
                        warn!("stopping monitoring after unexpected disconnection");
                        self.stop_monitoring(true);
                    }
                    return WorkState::Idle;
                }
            }
        };

        let (record, generation) = {
            let state = self.queue.lock();
            match state.queue.front() {
                Some(front) => (front.to_vec(), state.generation),
                None => return WorkState::Idle,
            }
        };

        {
            let mut conn = self.connection.lock();
            if let Some(until) = conn.backoff_until {
                if now < until {
                    return WorkState::Idle;
                }
                conn.backoff_until = None;
            }
        }

        let timeout = Duration::from_millis(self.config.snapshot().send_msg_timeout_ms);
        match channel.send(&record, timeout) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                trace!(bytes = record.len(), "event sent");
                let mut state = self.queue.lock();
                if state.generation == generation {
                    state.queue.pop();
                }
                if state.queue.is_empty() {
                    state.overflow_reported = false;
                    WorkState::Idle
                } else {
                    WorkState::MoreWork
                }
            }
            Err(ChannelError::Timeout) => {
                info!("event send timed out, retrying");
                WorkState::MoreWork
            }
            Err(ChannelError::Disconnected) => {
                let mut conn = self.connection.lock();
                let still_current = conn
                    .channel
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, &channel));
                if still_current {
                    let pid = self.detach(&mut conn, now);
                    info!(pid = ?pid, "event consumer disconnected during send");
                }
                WorkState::Idle
            }
            Err(ChannelError::Failed(reason)) => {
                let backoff = self.config.snapshot().send_msg_timeout_ms;
                self.connection.lock().backoff_until = Some(now + backoff);
                error!(error = %reason, backoff_ms = backoff, "event send failed");
                WorkState::Idle
            }
        }
    }

    fn run(&self) {
        debug!("event delivery worker started");
        while !self.shutdown.load(Ordering::SeqCst) {
            if self.poll_once() == WorkState::MoreWork {
                continue;
            }
            let mut state = self.queue.lock();
            if !state.notified && !self.shutdown.load(Ordering::SeqCst) {
                let interval = self.wake_interval_ms.load(Ordering::SeqCst);
                self.wakeup
                    .wait_for(&mut state, Duration::from_millis(interval));
            }
            state.notified = false;
        }
        debug!("event delivery worker stopped");
    }
}

/// Bounded queue, consumer connection and the worker that joins them.
pub struct DeliveryPipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryPipeline {
    pub fn new(config: Arc<ConfigCell>, clock: Arc<dyn Clock>, monitoring: Arc<AtomicBool>) -> Self {
        let limit = byte_limit(config.snapshot().max_queue_size);
        let interval = if monitoring.load(Ordering::SeqCst) {
            STARTED_WAKE_INTERVAL_MS
        } else {
            STOPPED_WAKE_INTERVAL_MS
        };
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    queue: RawEventQueue::new(limit),
                    generation: 0,
                    overflow_reported: false,
                    notified: false,
                }),
                wakeup: Condvar::new(),
                connection: Mutex::new(Connection::default()),
                config,
                clock,
                monitoring,
                wake_interval_ms: AtomicU64::new(interval),
                shutdown: AtomicBool::new(false),
                sent: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the background worker. Calling it again is a no-op.
    pub fn spawn_worker(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("event-delivery".into())
            .spawn(move || shared.run())?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stops and joins the worker.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("event delivery worker panicked");
            }
        }
    }

    /// Runs one worker iteration on the calling thread.
    pub fn poll_once(&self) -> WorkState {
        self.shared.poll_once()
    }

    pub fn push(&self, record: &[u8]) -> Result<(), DeliveryError> {
        self.shared.push(record)
    }

    /// Attaches the single consumer. A second consumer is refused.
    pub fn connect(&self, pid: u32, channel: Arc<dyn EventChannel>) -> Result<(), DeliveryError> {
        {
            let mut conn = self.shared.connection.lock();
            if let Some(existing) = conn.consumer_pid.filter(|_| conn.channel.is_some()) {
                return Err(DeliveryError::AlreadyConnected(existing));
            }
            conn.channel = Some(channel);
            conn.consumer_pid = Some(pid);
            conn.backoff_until = None;
            conn.grace_deadline = None;
        }
        info!(pid, "event consumer connected");
        self.shared.notify();
        Ok(())
    }

    /// Detaches the consumer and starts the grace period after which
    /// monitoring stops and the queue is dropped.
    pub fn disconnect(&self) -> Result<u32, DeliveryError> {
        let now = self.shared.clock.now_ms();
        let pid = {
            let mut conn = self.shared.connection.lock();
            if conn.channel.is_none() {
                return Err(DeliveryError::NotConnected);
            }
            self.shared.detach(&mut conn, now)
        };
        info!(pid = ?pid, "event consumer disconnected");
        pid.ok_or(DeliveryError::NotConnected)
    }

    pub fn consumer_pid(&self) -> Option<u32> {
        let conn = self.shared.connection.lock();
        conn.channel.as_ref().and(conn.consumer_pid)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.lock().channel.is_some()
    }

    pub fn start_monitoring(&self) {
        self.shared.monitoring.store(true, Ordering::SeqCst);
        self.shared
            .wake_interval_ms
            .store(STARTED_WAKE_INTERVAL_MS, Ordering::SeqCst);
        self.shared.notify();
        info!("monitoring started");
    }

    pub fn stop_monitoring(&self, clear: bool) {
        self.shared.stop_monitoring(clear);
        info!(clear, "monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.monitoring.load(Ordering::SeqCst)
    }

    /// Picks up a new queue byte limit. Timeouts are read per send.
    pub fn reload_config(&self) {
        let limit = byte_limit(self.shared.config.snapshot().max_queue_size);
        self.shared.queue.lock().queue.set_byte_limit(limit);
        debug!(limit, "delivery pipeline reloaded");
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.shared.wake_interval_ms.load(Ordering::SeqCst))
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().queue.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.queue.lock().queue.bytes()
    }

    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }
}

impl EventSink for DeliveryPipeline {
    fn submit(&self, record: Vec<u8>) {
        // Overflow was already reported once for this episode.
        let _ = self.shared.push(&record);
    }
}

impl Drop for DeliveryPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
