//! Local sound card output via cpal
//!
//! `write` feeds an internal ring buffer that the cpal callback drains, and
//! waits for space when the buffer is full. The device clock therefore paces
//! the sink thread, while the mix driver keeps running on its own timer.
//! Stream errors raised in the callback surface on the next `write`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use super::OutputSink;
use crate::audio::types::f32_to_i16;
use crate::audio::PcmFormat;
use crate::error::{Error, Result};

/// Device buffer in frames (about 200 ms at 48 kHz)
const BUFFER_FRAMES: usize = 9600;

/// A write that cannot make progress for this long fails the sink
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DeviceSink {
    device_name: Option<String>,
    format: PcmFormat,
    stream: Option<Stream>,
    producer: Option<HeapProd<f32>>,
    error_flag: Arc<AtomicBool>,
}

impl DeviceSink {
    pub fn new(device_name: Option<String>, format: PcmFormat) -> Self {
        Self {
            device_name,
            format,
            stream: None,
            producer: None,
            error_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Names of all output devices on the default host
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| Error::Sink(format!("Failed to enumerate devices: {}", e)))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// The configured device, falling back to the default one
    fn find_device(&self) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = self.device_name.as_ref() {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Sink(format!("Failed to enumerate devices: {}", e)))?;
            if let Some(dev) = devices.find(|d| d.name().ok().as_ref() == Some(name)) {
                info!("Found requested audio device: {}", name);
                return Ok(dev);
            }
            warn!("Requested device '{}' not found, falling back to default device", name);
        }

        let dev = host
            .default_output_device()
            .ok_or_else(|| Error::Sink("No default output device found".to_string()))?;
        info!(
            "Using default audio device: {}",
            dev.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        Ok(dev)
    }

    fn build_stream(
        &self,
        device: &Device,
        sample_format: SampleFormat,
        mut consumer: HeapCons<f32>,
    ) -> Result<Stream> {
        let config = StreamConfig {
            channels: self.format.channels,
            sample_rate: cpal::SampleRate(self.format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let error_flag = Arc::clone(&self.error_flag);
        let on_error = move |err: cpal::StreamError| {
            error!("Audio stream error: {} - marking for recovery", err);
            error_flag.store(true, Ordering::SeqCst);
        };

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let n = consumer.pop_slice(data);
                    data[n..].fill(0.0);
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().map(f32_to_i16).unwrap_or(0);
                    }
                },
                on_error,
                None,
            ),
            other => {
                return Err(Error::Sink(format!("Unsupported sample format: {:?}", other)));
            }
        };

        stream.map_err(|e| Error::Sink(format!("Failed to build stream: {}", e)))
    }
}

impl OutputSink for DeviceSink {
    fn open(&mut self) -> Result<()> {
        self.close();

        let device = self.find_device()?;
        let sample_format = device
            .default_output_config()
            .map_err(|e| Error::Sink(format!("Failed to get default config: {}", e)))?
            .sample_format();
        debug!(
            "Opening output stream: {} Hz, {} channels, {:?}",
            self.format.sample_rate, self.format.channels, sample_format
        );

        let (producer, consumer) =
            HeapRb::<f32>::new(self.format.samples(BUFFER_FRAMES)).split();
        self.error_flag.store(false, Ordering::SeqCst);
        let stream = self.build_stream(&device, sample_format, consumer)?;
        stream
            .play()
            .map_err(|e| Error::Sink(format!("Failed to start stream: {}", e)))?;

        self.stream = Some(stream);
        self.producer = Some(producer);
        info!("Audio stream started successfully");
        Ok(())
    }

    fn write(&mut self, block: &[f32]) -> Result<()> {
        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| Error::Sink("device not open".to_string()))?;

        let mut offset = 0;
        let mut stalled_since: Option<Instant> = None;
        while offset < block.len() {
            if self.error_flag.load(Ordering::SeqCst) {
                return Err(Error::Sink("audio stream error".to_string()));
            }
            let n = producer.push_slice(&block[offset..]);
            offset += n;
            if n > 0 {
                stalled_since = None;
                continue;
            }
            let since = *stalled_since.get_or_insert_with(Instant::now);
            if since.elapsed() > WRITE_STALL_TIMEOUT {
                return Err(Error::Sink("audio device stopped consuming".to_string()));
            }
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Failed to pause stream: {}", e);
            }
        }
        self.producer = None;
    }
}
