//! Buffered delivery of engine events to a bounded display log.
//!
//! Engine callbacks arrive on arbitrary threads. Each callback only appends
//! to a small pending buffer under a mutex; a [`LogPump`] drains the pending
//! lines into the displayed log every [`DRAIN_INTERVAL`] and trims it to the
//! most recent [`MAX_LOG_LINES`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lines kept in each displayed log.
pub const MAX_LOG_LINES: usize = 100;

/// Interval between drains of the pending buffers.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// A connection routed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub process_name: String,
    pub pid: u32,
    pub dest_host: String,
    pub dest_port: u16,
    /// Engine description of the route taken (proxy endpoint, DIRECT, BLOCK)
    pub proxy: String,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (PID:{}) -> {}:{} via {}",
            self.process_name, self.pid, self.dest_host, self.dest_port, self.proxy
        )
    }
}

/// Event emitted by the enforcement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Diagnostic(String),
    Connection(ConnectionEvent),
}

/// Callback the engine invokes for every event.
pub type EventSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Pending lines plus the bounded displayed log.
pub struct LogBuffer {
    pending: Mutex<Vec<String>>,
    lines: Mutex<VecDeque<String>>,
    max_lines: usize,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(64)),
            lines: Mutex::new(VecDeque::with_capacity(max_lines)),
            max_lines,
        }
    }

    /// Queue a line for the next drain.
    pub fn push(&self, line: String) {
        self.pending.lock().push(line);
    }

    /// Move pending lines into the displayed log, keeping only the newest
    /// `max_lines`. Returns the number of lines moved.
    pub fn drain(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }

        let moved = batch.len();
        let mut lines = self.lines.lock();
        lines.extend(batch);
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
        moved
    }

    /// Snapshot of the displayed lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop both pending and displayed lines.
    pub fn clear(&self) {
        self.pending.lock().clear();
        self.lines.lock().clear();
    }
}

/// Activity (diagnostic) and connection logs fed by engine events.
pub struct EventLog {
    activity: LogBuffer,
    connections: LogBuffer,
    traffic_logging: AtomicBool,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_max_lines(MAX_LOG_LINES)
    }

    pub fn with_max_lines(max_lines: usize) -> Self {
        Self {
            activity: LogBuffer::new(max_lines),
            connections: LogBuffer::new(max_lines),
            traffic_logging: AtomicBool::new(true),
        }
    }

    /// Record one engine event.
    pub fn record(&self, event: EngineEvent) {
        match event {
            EngineEvent::Diagnostic(msg) => self.activity.push(stamp(&msg)),
            EngineEvent::Connection(conn) => {
                if self.traffic_logging.load(Ordering::Relaxed) {
                    self.connections.push(stamp(&conn.to_string()));
                }
            }
        }
    }

    /// Queue a locally generated activity line.
    pub fn note(&self, msg: &str) {
        self.activity.push(stamp(msg));
    }

    /// Sink suitable for [`crate::EnforcementGateway::set_event_sink`].
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let log = Arc::clone(self);
        Arc::new(move |event| log.record(event))
    }

    /// Turning traffic logging off discards all connection lines.
    pub fn set_traffic_logging(&self, enabled: bool) {
        self.traffic_logging.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.connections.clear();
        }
    }

    pub fn traffic_logging(&self) -> bool {
        self.traffic_logging.load(Ordering::Relaxed)
    }

    pub fn drain(&self) -> usize {
        self.activity.drain() + self.connections.drain()
    }

    pub fn activity(&self) -> &LogBuffer {
        &self.activity
    }

    pub fn connections(&self) -> &LogBuffer {
        &self.connections
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn stamp(msg: &str) -> String {
    format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), msg)
}

/// Background thread draining an [`EventLog`] at a fixed interval.
pub struct LogPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogPump {
    pub fn start(log: Arc<EventLog>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::park_timeout(interval);
                log.drain();
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the pump after a final drain.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("log pump thread panicked");
            }
        }
    }
}

impl Drop for LogPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}
