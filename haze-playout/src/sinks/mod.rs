//! Output sinks
//!
//! Every mixed block is offered to each enabled sink through its own bounded
//! queue. A sink runs on a dedicated thread, so a slow or broken sink only
//! ever loses its own blocks.
//!
//! Sinks are created on their worker thread from a [`SinkFactory`]; the
//! sink value itself never crosses threads (a cpal stream is not `Send`).

pub mod device;
pub mod fanout;
pub mod network;
pub mod queue;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use haze_common::config::RecoveryConfig;
use haze_common::events::{SinkHealth, SinkStatusInfo};

use crate::error::Result;

pub use device::DeviceSink;
pub use fanout::Fanout;
pub use network::NetworkSink;
pub use queue::SinkQueue;

/// A destination for program audio
pub trait OutputSink {
    /// Acquire the device or start the encoder
    fn open(&mut self) -> Result<()>;

    /// Deliver one block of interleaved samples; may block to pace the sink
    fn write(&mut self, block: &[f32]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release everything `open` acquired; the sink may be opened again
    fn close(&mut self);
}

/// Builds a sink on its worker thread
pub type SinkFactory = Box<dyn FnOnce() -> Box<dyn OutputSink> + Send>;

/// Everything the fan-out needs to run one sink
pub struct SinkSpec {
    pub name: String,
    pub kind: String,
    pub queue_blocks: usize,
    pub enabled: bool,
    pub factory: SinkFactory,
}

/// Reconnect backoff: `initial` doubling up to `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            initial: config.initial_backoff(),
            max: config.max_backoff(),
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Live status of one sink
///
/// Health, error and counters are written only by the sink's worker thread.
/// `enabled` belongs to the control plane.
#[derive(Debug)]
pub struct SinkStatus {
    name: String,
    kind: String,
    enabled: AtomicBool,
    health: Mutex<(SinkHealth, Option<String>)>,
    blocks_written: AtomicU64,
    blocks_dropped: AtomicU64,
    restarts: AtomicU64,
}

impl SinkStatus {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            enabled: AtomicBool::new(enabled),
            health: Mutex::new((SinkHealth::Ok, None)),
            blocks_written: AtomicU64::new(0),
            blocks_dropped: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn health(&self) -> SinkHealth {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    pub(crate) fn set_health(&self, health: SinkHealth, error: Option<String>) {
        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        guard.0 = health;
        if error.is_some() {
            guard.1 = error;
        }
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.blocks_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: u64) {
        self.blocks_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn info(&self) -> SinkStatusInfo {
        let (health, last_error) = self
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        SinkStatusInfo {
            name: self.name.clone(),
            kind: self.kind.clone(),
            enabled: self.is_enabled(),
            health,
            last_error,
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}
