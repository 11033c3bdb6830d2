//! Sink fan-out: one queue and one worker thread per sink
//!
//! `push` hands the same block to every enabled sink and returns at once.
//! Each worker owns its sink, writes queued blocks in order, and on failure
//! closes the sink and reopens it with exponential backoff. While a sink is
//! down its queue is discarded, so it resumes with current audio rather than
//! a backlog. A failed sink reports healthy again after its first good write.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use haze_common::events::{SinkHealth, SinkStatusInfo};
use tracing::{debug, error, info, warn};

use super::queue::{Popped, SinkQueue};
use super::{Backoff, OutputSink, SinkFactory, SinkSpec, SinkStatus};
use crate::error::{Error, Result};

/// How long a worker waits for a block before checking again
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Clean writes after which a degraded sink reports healthy again
const RECOVERY_WRITES: u32 = 50;

struct SinkHandle {
    status: Arc<SinkStatus>,
    queue: Arc<SinkQueue>,
    thread: Option<JoinHandle<()>>,
}

/// Distributes mixed blocks to every enabled sink
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<SinkHandle>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a worker thread for `spec`
    pub fn add(&mut self, spec: SinkSpec, backoff: Backoff) -> Result<()> {
        if self.sinks.iter().any(|s| s.status.name() == spec.name) {
            return Err(Error::Sink(format!("duplicate sink name '{}'", spec.name)));
        }

        let status = Arc::new(SinkStatus::new(&spec.name, &spec.kind, spec.enabled));
        let queue = Arc::new(SinkQueue::new(spec.queue_blocks));
        let worker = SinkWorker {
            status: Arc::clone(&status),
            queue: Arc::clone(&queue),
            backoff,
        };
        let factory = spec.factory;
        let thread = thread::Builder::new()
            .name(format!("haze-sink-{}", spec.name))
            .spawn(move || worker.run(factory))
            .map_err(|e| Error::Sink(format!("failed to spawn worker for '{}': {}", spec.name, e)))?;

        info!("Sink '{}' ({}) started", spec.name, spec.kind);
        self.sinks.push(SinkHandle {
            status,
            queue,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Offer `block` to every enabled sink; never blocks
    pub fn push(&self, block: Arc<[f32]>) {
        for sink in &self.sinks {
            if sink.status.is_enabled() {
                sink.queue.push(Arc::clone(&block));
            }
        }
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let sink = self
            .sinks
            .iter()
            .find(|s| s.status.name() == name)
            .ok_or_else(|| Error::Sink(format!("unknown sink '{}'", name)))?;
        sink.status.set_enabled(enabled);
        if !enabled {
            sink.queue.clear();
        }
        info!("Sink '{}' {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn statuses(&self) -> Vec<SinkStatusInfo> {
        self.sinks.iter().map(|s| s.status.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Let workers drain and close their sinks, waiting at most `timeout`
    ///
    /// Workers still running at the deadline are abandoned.
    pub fn shutdown(&mut self, timeout: Duration) {
        for sink in &self.sinks {
            sink.queue.close();
        }

        let deadline = Instant::now() + timeout;
        for sink in &mut self.sinks {
            let Some(handle) = sink.thread.take() else {
                continue;
            };
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Sink '{}' worker panicked", sink.status.name());
                }
            } else {
                warn!(
                    "Sink '{}' did not stop within {:?}, abandoning it",
                    sink.status.name(),
                    timeout
                );
            }
        }
        debug!("Fan-out shut down");
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        for sink in &self.sinks {
            sink.queue.close();
        }
    }
}

/// Owns one sink on its own thread
struct SinkWorker {
    status: Arc<SinkStatus>,
    queue: Arc<SinkQueue>,
    backoff: Backoff,
}

impl SinkWorker {
    fn run(self, factory: SinkFactory) {
        let name = self.status.name().to_string();
        let mut sink = factory();
        let mut is_open = false;
        let mut failing = false;
        let mut delay = self.backoff.initial;
        let mut clean_writes = 0u32;

        loop {
            if !self.status.is_enabled() {
                if is_open {
                    debug!("Sink '{}' disabled, closing", name);
                    sink.close();
                    is_open = false;
                }
                if self.queue.wait_closed(POLL_INTERVAL) {
                    break;
                }
                continue;
            }

            if !is_open {
                if self.queue.is_closed() && self.queue.is_empty() {
                    break;
                }
                match sink.open() {
                    Ok(()) => {
                        debug!("Sink '{}' opened", name);
                        is_open = true;
                        if failing {
                            // Resume with current audio, not what piled up while down
                            self.queue.clear();
                            self.status.add_dropped(self.queue.take_dropped());
                        }
                    }
                    Err(e) => {
                        self.fail(&name, &mut failing, format!("open failed: {}", e));
                        if self.queue.wait_closed(delay) {
                            break;
                        }
                        delay = self.backoff.next(delay);
                        continue;
                    }
                }
            }

            let block = match self.queue.pop_timeout(POLL_INTERVAL) {
                Popped::Block(block) => block,
                Popped::Empty => continue,
                Popped::Closed => break,
            };

            self.note_drops(&mut clean_writes);

            match sink.write(&block) {
                Ok(()) => {
                    self.status.add_written(1);
                    if failing {
                        info!("Sink '{}' recovered", name);
                        failing = false;
                        delay = self.backoff.initial;
                        clean_writes = 0;
                        self.status.add_restart();
                        self.status.set_health(SinkHealth::Ok, None);
                    }
                    clean_writes = clean_writes.saturating_add(1);
                    if clean_writes == RECOVERY_WRITES
                        && self.status.health() == SinkHealth::Degraded
                    {
                        self.status.set_health(SinkHealth::Ok, None);
                    }
                }
                Err(e) => {
                    self.fail(&name, &mut failing, e.to_string());
                    sink.close();
                    is_open = false;
                    if self.queue.wait_closed(delay) {
                        break;
                    }
                    delay = self.backoff.next(delay);
                }
            }
        }

        if is_open {
            if let Err(e) = sink.flush() {
                debug!("Sink '{}' flush on shutdown failed: {}", name, e);
            }
            sink.close();
        }
        self.status.add_dropped(self.queue.take_dropped());
        debug!("Sink '{}' worker exiting", name);
    }

    /// Record a failure; logs at `error` once per failure episode
    fn fail(&self, name: &str, failing: &mut bool, message: String) {
        if *failing {
            debug!("Sink '{}' still failing: {}", name, message);
        } else {
            error!("Sink '{}' failed: {}", name, message);
            *failing = true;
        }
        self.status.set_health(SinkHealth::Failed, Some(message));
        self.queue.clear();
        self.status.add_dropped(self.queue.take_dropped());
    }

    fn note_drops(&self, clean_writes: &mut u32) {
        let dropped = self.queue.take_dropped();
        if dropped == 0 {
            return;
        }
        self.status.add_dropped(dropped);
        *clean_writes = 0;
        if self.status.health() == SinkHealth::Ok {
            warn!(
                "Sink '{}' is falling behind ({} blocks dropped)",
                self.status.name(),
                dropped
            );
            self.status.set_health(SinkHealth::Degraded, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<f32>>>);

    struct CaptureSink(Captured);

    impl OutputSink for CaptureSink {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, block: &[f32]) -> Result<()> {
            self.0 .0.lock().unwrap().extend_from_slice(block);
            Ok(())
        }
        fn close(&mut self) {}
    }

    struct RefusingSink;

    impl OutputSink for RefusingSink {
        fn open(&mut self) -> Result<()> {
            Err(Error::Sink("connection refused".into()))
        }
        fn write(&mut self, _block: &[f32]) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    fn backoff() -> Backoff {
        Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        }
    }

    fn spec(name: &str, factory: SinkFactory) -> SinkSpec {
        SinkSpec {
            name: name.into(),
            kind: "test".into(),
            queue_blocks: 64,
            enabled: true,
            factory,
        }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_blocks_arrive_in_order() {
        let captured = Captured::default();
        let mut fanout = Fanout::new();
        let c = captured.clone();
        fanout
            .add(spec("cap", Box::new(move || Box::new(CaptureSink(c)))), backoff())
            .unwrap();

        for i in 0..10 {
            fanout.push(Arc::from(vec![i as f32; 2]));
        }
        fanout.shutdown(Duration::from_secs(5));

        let samples = captured.0.lock().unwrap().clone();
        let expected: Vec<f32> = (0..10).flat_map(|i| [i as f32; 2]).collect();
        assert_eq!(samples, expected);
        assert_eq!(fanout.statuses()[0].blocks_written, 10);
    }

    #[test]
    fn test_failing_sink_retries_with_backoff() {
        let mut fanout = Fanout::new();
        fanout
            .add(spec("bad", Box::new(|| Box::new(RefusingSink))), backoff())
            .unwrap();

        wait_for(|| fanout.statuses()[0].health == SinkHealth::Failed);
        let status = &fanout.statuses()[0];
        assert_eq!(status.health, SinkHealth::Failed);
        assert!(status.last_error.as_deref().unwrap_or("").contains("refused"));
        fanout.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn test_disabled_sink_receives_nothing() {
        let captured = Captured::default();
        let mut fanout = Fanout::new();
        let c = captured.clone();
        fanout
            .add(spec("cap", Box::new(move || Box::new(CaptureSink(c)))), backoff())
            .unwrap();

        fanout.set_enabled("cap", false).unwrap();
        fanout.push(Arc::from(vec![1.0; 2]));
        assert!(fanout.set_enabled("missing", true).is_err());
        fanout.shutdown(Duration::from_secs(5));

        assert!(captured.0.lock().unwrap().is_empty());
        assert!(!fanout.statuses()[0].enabled);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut fanout = Fanout::new();
        fanout
            .add(spec("a", Box::new(|| Box::new(RefusingSink))), backoff())
            .unwrap();
        assert!(fanout
            .add(spec("a", Box::new(|| Box::new(RefusingSink))), backoff())
            .is_err());
        fanout.shutdown(Duration::from_secs(5));
    }
}
