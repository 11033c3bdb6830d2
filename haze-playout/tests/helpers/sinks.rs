//! Output sinks for tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use haze_playout::error::{Error, Result};
use haze_playout::sinks::OutputSink;

/// Samples written to a `CaptureSink`, shared with the test
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<f32>>>);

impl Captured {
    pub fn samples(&self) -> Vec<f32> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub struct CaptureSink(pub Captured);

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

/// Opens fine, then fails every write; counts opens
pub struct FailingSink {
    pub opens: Arc<AtomicUsize>,
}

impl OutputSink for FailingSink {
    fn open(&mut self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, _block: &[f32]) -> Result<()> {
        Err(Error::Sink("broken pipe".into()))
    }

    fn close(&mut self) {}
}
