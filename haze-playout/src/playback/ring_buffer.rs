//! Lock-free PCM ring buffer between a decode thread and the mixer
//!
//! Single producer (the session's decode thread), single consumer (the mix
//! driver). Capacity is fixed at creation; the producer never overwrites
//! unread audio and stalls instead. Data moves in whole frames only.
//!
//! The consumer distinguishes two kinds of "empty":
//! - `Underrun`: nothing buffered, but the producer is still running (transient)
//! - `EndOfStream`: nothing buffered and the producer called `finish` (permanent)

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use tracing::trace;

/// Sleep between retries while the buffer is full
const STALL_SLEEP: Duration = Duration::from_millis(2);

/// Outcome of a consumer read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` whole frames were copied (possibly fewer than requested)
    Frames(usize),
    /// Empty, more audio may still arrive
    Underrun,
    /// Empty, and the producer has finished
    EndOfStream,
}

/// State shared by both halves
#[derive(Debug)]
struct Shared {
    channels: usize,
    finished: AtomicBool,
    frames_read: AtomicU64,
}

/// Constructor for a producer/consumer pair
pub struct PcmRingBuffer;

impl PcmRingBuffer {
    /// Create a buffer holding `capacity_frames` frames of `channels` channels
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity_frames: usize, channels: usize) -> (PcmProducer, PcmConsumer) {
        let channels = channels.max(1);
        let capacity_frames = capacity_frames.max(1);
        let (prod, cons) = HeapRb::<f32>::new(capacity_frames * channels).split();
        let shared = Arc::new(Shared {
            channels,
            finished: AtomicBool::new(false),
            frames_read: AtomicU64::new(0),
        });

        (
            PcmProducer {
                prod,
                shared: Arc::clone(&shared),
            },
            PcmConsumer { cons, shared },
        )
    }
}

/// Producer half, owned by the decode thread
pub struct PcmProducer {
    prod: HeapProd<f32>,
    shared: Arc<Shared>,
}

impl PcmProducer {
    /// Write as many whole frames as fit; returns samples written
    ///
    /// A trailing partial frame in `samples` is never written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let ch = self.shared.channels;
        let frames = (samples.len() / ch).min(self.prod.vacant_len() / ch);
        if frames == 0 {
            return 0;
        }
        self.prod.push_slice(&samples[..frames * ch])
    }

    /// Write everything, stalling while the buffer is full
    ///
    /// Returns `false` if `stop` was raised before all frames were written.
    pub fn write_all(&mut self, samples: &[f32], stop: &AtomicBool) -> bool {
        let ch = self.shared.channels;
        let total = samples.len() / ch * ch;
        let mut offset = 0;
        let mut stalled = false;

        while offset < total {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            let n = self.write(&samples[offset..total]);
            offset += n;
            if offset < total && n == 0 {
                if !stalled {
                    stalled = true;
                    trace!("Ring buffer full, producer stalling");
                }
                thread::sleep(STALL_SLEEP);
            }
        }
        true
    }

    /// Mark the stream complete; readers see `EndOfStream` once drained
    pub fn finish(&self) {
        self.shared.finished.store(true, Ordering::Release);
    }
}

/// Consumer half, owned by the mixer
pub struct PcmConsumer {
    cons: HeapCons<f32>,
    shared: Arc<Shared>,
}

impl PcmConsumer {
    /// Read up to `out.len() / channels` frames into `out`
    pub fn read(&mut self, out: &mut [f32]) -> ReadOutcome {
        let ch = self.shared.channels;
        let want = out.len() / ch * ch;
        if want == 0 {
            return ReadOutcome::Frames(0);
        }

        // Load the flag before looking at occupancy: a finish observed here
        // guarantees every frame written before it is already visible.
        let finished = self.shared.finished.load(Ordering::Acquire);
        let available = self.cons.occupied_len() / ch * ch;
        let n = available.min(want);

        if n > 0 {
            let read = self.cons.pop_slice(&mut out[..n]);
            self.shared
                .frames_read
                .fetch_add((read / ch) as u64, Ordering::Relaxed);
            return ReadOutcome::Frames(read / ch);
        }

        if finished {
            ReadOutcome::EndOfStream
        } else {
            ReadOutcome::Underrun
        }
    }

    pub fn available_frames(&self) -> usize {
        self.cons.occupied_len() / self.shared.channels
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Finished and fully drained
    pub fn is_exhausted(&self) -> bool {
        let finished = self.is_finished();
        finished && self.cons.occupied_len() < self.shared.channels
    }

    pub fn frames_read(&self) -> u64 {
        self.shared.frames_read.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_preserved() {
        let (mut prod, mut cons) = PcmRingBuffer::new(8, 2);
        let input: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(prod.write(&input[..6]), 6);
        assert_eq!(prod.write(&input[6..]), 6);

        let mut out = vec![0.0; 12];
        assert_eq!(cons.read(&mut out[..4]), ReadOutcome::Frames(2));
        assert_eq!(cons.read(&mut out[4..]), ReadOutcome::Frames(4));
        assert_eq!(out, input);
    }

    #[test]
    fn test_never_overwrites_unread_data() {
        let (mut prod, mut cons) = PcmRingBuffer::new(4, 2);
        let first = vec![1.0; 8];
        assert_eq!(prod.write(&first), 8);
        assert_eq!(prod.write(&[9.0; 4]), 0);

        let mut out = vec![0.0; 8];
        assert_eq!(cons.read(&mut out), ReadOutcome::Frames(4));
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_partial_frames_are_not_written() {
        let (mut prod, cons) = PcmRingBuffer::new(4, 2);
        assert_eq!(prod.write(&[0.5, 0.5, 0.5]), 2);
        assert_eq!(cons.available_frames(), 1);
    }

    #[test]
    fn test_underrun_versus_end_of_stream() {
        let (mut prod, mut cons) = PcmRingBuffer::new(4, 2);
        let mut out = vec![0.0; 4];

        assert_eq!(cons.read(&mut out), ReadOutcome::Underrun);

        prod.write(&[0.1, 0.2]);
        prod.finish();
        assert!(!cons.is_exhausted());
        assert_eq!(cons.read(&mut out), ReadOutcome::Frames(1));
        assert!(cons.is_exhausted());
        assert_eq!(cons.read(&mut out), ReadOutcome::EndOfStream);
        assert_eq!(cons.read(&mut out), ReadOutcome::EndOfStream);
        assert_eq!(cons.frames_read(), 1);
    }

    #[test]
    fn test_write_all_stalls_until_consumer_drains() {
        let (mut prod, mut cons) = PcmRingBuffer::new(4, 1);
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let data: Vec<f32> = (0..32).map(|i| i as f32).collect();
                let done = prod.write_all(&data, &stop);
                prod.finish();
                done
            })
        };

        let mut received = Vec::new();
        let mut buf = [0.0f32; 3];
        loop {
            match cons.read(&mut buf) {
                ReadOutcome::Frames(n) => received.extend_from_slice(&buf[..n]),
                ReadOutcome::Underrun => thread::sleep(Duration::from_millis(1)),
                ReadOutcome::EndOfStream => break,
            }
        }

        assert!(writer.join().unwrap());
        let expected: Vec<f32> = (0..32).map(|i| i as f32).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_write_all_honours_stop() {
        let (mut prod, _cons) = PcmRingBuffer::new(2, 1);
        let stop = AtomicBool::new(true);
        assert!(!prod.write_all(&[1.0; 8], &stop));
    }
}
