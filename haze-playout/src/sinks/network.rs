//! Network stream output through an `ffmpeg` encoder process
//!
//! Raw s16le PCM goes to the encoder's stdin; ffmpeg encodes and sends the
//! stream to `udp://host:port`. A write to a dead encoder (broken pipe or
//! exited process) is a sink failure; the fan-out worker reopens it.

use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use haze_common::config::NetworkSinkConfig;
use tracing::{debug, info};

use super::OutputSink;
use crate::audio::decoder::{kill_and_reap, wait_with_deadline};
use crate::audio::types::f32_to_s16le;
use crate::audio::PcmFormat;
use crate::error::{Error, Result};

pub struct NetworkSink {
    config: NetworkSinkConfig,
    format: PcmFormat,
    ffmpeg_path: String,
    grace: Duration,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    bytes: Vec<u8>,
}

impl NetworkSink {
    pub fn new(
        config: NetworkSinkConfig,
        format: PcmFormat,
        ffmpeg_path: impl Into<String>,
        grace: Duration,
    ) -> Self {
        Self {
            config,
            format,
            ffmpeg_path: ffmpeg_path.into(),
            grace,
            child: None,
            stdin: None,
            bytes: Vec::new(),
        }
    }

    pub fn url(&self) -> String {
        format!("udp://{}:{}", self.config.host, self.config.port)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-f", "s16le"])
            .args(["-ar", &self.format.sample_rate.to_string()])
            .args(["-ac", &self.format.channels.to_string()])
            .args(["-i", "pipe:0"])
            .args(["-c:a", &self.config.codec])
            .args(["-b:a", &self.config.bitrate])
            .args(["-f", &self.config.format])
            .args(["-flush_packets", "1"])
            .arg(self.url())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl OutputSink for NetworkSink {
    fn open(&mut self) -> Result<()> {
        self.close();

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| Error::Sink(format!("failed to start encoder '{}': {}", self.ffmpeg_path, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Sink("encoder stdin unavailable".to_string()))?;

        info!(
            "Streaming {} {} to {} (encoder pid={})",
            self.config.codec,
            self.config.bitrate,
            self.url(),
            child.id()
        );
        self.child = Some(child);
        self.stdin = Some(stdin);
        Ok(())
    }

    fn write(&mut self, block: &[f32]) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::Sink(format!("encoder exited with {}", status)));
            }
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Sink("encoder not running".to_string()))?;

        f32_to_s16le(block, &mut self.bytes);
        stdin
            .write_all(&self.bytes)
            .map_err(|e| Error::Sink(format!("write to encoder failed: {}", e)))
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin
                .flush()
                .map_err(|e| Error::Sink(format!("flush to encoder failed: {}", e)))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        // EOF on stdin lets the encoder finish its last packets
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if wait_with_deadline(&mut child, self.grace).is_none() {
                debug!("Encoder pid={} ignored EOF for {:?}, killing", child.id(), self.grace);
                kill_and_reap(&mut child);
            }
        }
    }
}

impl Drop for NetworkSink {
    fn drop(&mut self) {
        self.close();
    }
}
