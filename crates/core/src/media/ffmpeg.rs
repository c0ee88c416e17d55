//! Default decoding backend: `ffmpeg` as a subprocess.
//!
//! ffmpeg pulls the source, scales it and writes raw pictures of a fixed
//! size to stdout, so one `read_exact` yields one frame. stderr is drained
//! into the log and its last line is kept for error messages.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::{Decoder, DecoderFactory, Frame, PixelFormat, SourceOptions};
use crate::error::{BridgeError, Result};

const RECONNECT_DELAY_MIN: Duration = Duration::from_millis(250);
const STDERR_SETTLE: Duration = Duration::from_millis(100);

/// Spawns one `ffmpeg` process per opened source.
#[derive(Debug, Clone)]
pub struct FfmpegDecoderFactory {
    program: PathBuf,
}

impl FfmpegDecoderFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegDecoderFactory {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl DecoderFactory for FfmpegDecoderFactory {
    async fn open(&self, url: &str, options: &SourceOptions) -> Result<Box<dyn Decoder>> {
        let mut decoder = FfmpegDecoder {
            program: self.program.clone(),
            args: build_args(url, options),
            url: url.to_string(),
            format: options.pixel_format,
            width: options.width,
            height: options.height,
            reconnect: options.reconnect,
            reconnect_delay_max: options.reconnect_delay_max,
            max_reconnects: options.max_reconnects,
            process: None,
            pending: None,
            failures: 0,
            pts: 0,
        };

        let process = decoder.spawn().map_err(|e| {
            BridgeError::Connect(format!("failed to spawn {}: {e}", self.program.display()))
        })?;
        decoder.process = Some(process);

        // A source only counts as open once it produced a picture.
        match decoder.read_from_process().await {
            Ok(frame) => decoder.pending = Some(frame),
            Err(e) => {
                decoder.kill().await;
                return Err(BridgeError::Connect(e.to_string()));
            }
        }

        Ok(Box::new(decoder))
    }
}

fn push(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

/// Translate the connection policy into an ffmpeg command line.
pub fn build_args(url: &str, options: &SourceOptions) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let scheme = url.split("://").next().unwrap_or_default().to_ascii_lowercase();
    if scheme.starts_with("rtsp") {
        push(&mut args, "-rtsp_transport", options.transport.to_string());
    }
    push(&mut args, "-timeout", options.connect_timeout.as_micros().to_string());
    push(&mut args, "-buffer_size", options.buffer_size.to_string());
    push(&mut args, "-max_delay", options.max_delay.as_micros().to_string());
    if options.low_latency {
        push(&mut args, "-fflags", "nobuffer".into());
        push(&mut args, "-flags", "low_delay".into());
    }
    if options.reconnect && matches!(scheme.as_str(), "http" | "https") {
        push(&mut args, "-reconnect", "1".into());
        push(&mut args, "-reconnect_at_eof", "1".into());
        push(&mut args, "-reconnect_streamed", "1".into());
        let delay_max = options.reconnect_delay_max.as_secs().max(1);
        push(&mut args, "-reconnect_delay_max", delay_max.to_string());
    }
    push(&mut args, "-thread_queue_size", options.thread_queue_size.to_string());
    push(&mut args, "-max_error_rate", options.max_error_rate.to_string());
    push(&mut args, "-i", url.to_string());

    args.push("-an".to_string());
    push(&mut args, "-vf", format!("scale={}:{}", options.width, options.height));
    push(&mut args, "-r", options.framerate.to_string());
    push(&mut args, "-pix_fmt", options.pixel_format.name().to_string());
    push(&mut args, "-f", "rawvideo".into());
    args.push("pipe:1".to_string());
    args
}

/// Forward ffmpeg's stderr to the log, keeping the last line in `tail`.
pub(crate) fn drain_stderr(
    stderr: ChildStderr,
    label: String,
    tail: Arc<Mutex<Option<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            tracing::warn!(source = %label, "ffmpeg: {line}");
            *tail.lock() = Some(line);
        }
    })
}

struct FfmpegProcess {
    child: Child,
    stdout: ChildStdout,
    stderr_tail: Arc<Mutex<Option<String>>>,
    drain: JoinHandle<()>,
}

pub struct FfmpegDecoder {
    program: PathBuf,
    args: Vec<String>,
    url: String,
    format: PixelFormat,
    width: u32,
    height: u32,
    reconnect: bool,
    reconnect_delay_max: Duration,
    max_reconnects: u32,
    process: Option<FfmpegProcess>,
    pending: Option<Frame>,
    failures: u32,
    pts: u64,
}

impl FfmpegDecoder {
    fn spawn(&self) -> std::io::Result<FfmpegProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stdout unavailable"))?;
        let stderr_tail = Arc::new(Mutex::new(None));

        let drain = match child.stderr.take() {
            Some(stderr) => drain_stderr(stderr, self.url.clone(), stderr_tail.clone()),
            None => tokio::spawn(async {}),
        };

        tracing::debug!(url = %self.url, pid = child.id(), "ffmpeg started");

        Ok(FfmpegProcess {
            child,
            stdout,
            stderr_tail,
            drain,
        })
    }

    async fn read_from_process(&mut self) -> Result<Frame> {
        let size = self.format.frame_size(self.width, self.height);
        let Some(process) = self.process.as_mut() else {
            return Err(BridgeError::StreamEnded(format!(
                "decoder for {} is not running",
                self.url
            )));
        };

        let mut buf = vec![0u8; size];
        match process.stdout.read_exact(&mut buf).await {
            Ok(_) => {
                let data = Bytes::from(buf);
                let frame = Frame::new(self.format, self.width, self.height, self.pts, data)?;
                self.pts += 1;
                Ok(frame)
            }
            Err(e) => {
                // let the drain pick up ffmpeg's final words
                let _ = tokio::time::timeout(STDERR_SETTLE, &mut process.drain).await;
                let reason = process.stderr_tail.lock().clone().unwrap_or_else(|| e.to_string());
                self.kill().await;
                Err(BridgeError::StreamEnded(format!("ffmpeg stopped: {reason}")))
            }
        }
    }

    async fn respawn(&mut self) -> Result<()> {
        if !self.reconnect || self.failures >= self.max_reconnects {
            return Err(BridgeError::StreamEnded(format!(
                "decoder for {} exited after {} reconnect attempts",
                self.url, self.failures
            )));
        }

        let delay = RECONNECT_DELAY_MIN
            .saturating_mul(1 << self.failures.min(16))
            .min(self.reconnect_delay_max);
        self.failures += 1;
        tracing::info!(
            url = %self.url,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            "restarting decoder"
        );
        tokio::time::sleep(delay).await;

        self.process = Some(self.spawn()?);
        Ok(())
    }

    async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.child.kill().await {
                tracing::debug!(url = %self.url, error = %e, "ffmpeg already gone");
            }
            process.drain.abort();
        }
    }
}

#[async_trait]
impl Decoder for FfmpegDecoder {
    async fn read_frame(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        if self.process.is_none() {
            self.respawn().await?;
        }

        let frame = self.read_from_process().await?;
        self.failures = 0;
        Ok(frame)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.pending = None;
        self.kill().await;
        tracing::debug!(url = %self.url, "ffmpeg stopped");
        Ok(())
    }
}
