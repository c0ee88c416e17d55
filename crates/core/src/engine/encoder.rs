//! H.264 encoding for outbound video tracks.
//!
//! Each session gets its own `ffmpeg` libx264 process. Raw pictures go in on
//! stdin and an Annex B elementary stream comes out on stdout. The encoder
//! is asked to emit access unit delimiters, so the byte stream can be cut
//! into one sample per picture without parsing slice headers:
//!
//! ```text
//! [00 00 00 01 09 ..][SPS][PPS][IDR slice] [00 00 00 01 09 ..][P slice] ...
//! └──────────── access unit 0 ───────────┘ └──── access unit 1 ────┘
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::media::ffmpeg::drain_stderr;
use crate::media::{Frame, PixelFormat};

const NAL_TYPE_AUD: u8 = 9;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Path to the `ffmpeg` binary.
    pub program: PathBuf,
    /// Target bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// Nominal input frame rate, also used as sample duration.
    pub framerate: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            bitrate_kbps: 2000,
            framerate: 25,
        }
    }
}

/// Command line for encoding `width` x `height` raw pictures of `format`.
pub fn encoder_args(
    config: &EncoderConfig,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Vec<String> {
    let fps = config.framerate.max(1);
    let size = format!("{width}x{height}");
    let rate = fps.to_string();
    let bitrate = format!("{}k", config.bitrate_kbps);
    let gop = (fps * 2).to_string();
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        format.name(),
        "-s",
        size.as_str(),
        "-r",
        rate.as_str(),
        "-i",
        "pipe:0",
        "-an",
        "-c:v",
        "libx264",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-profile:v",
        "baseline",
        "-pix_fmt",
        "yuv420p",
        "-b:v",
        bitrate.as_str(),
        "-g",
        gop.as_str(),
        "-bf",
        "0",
        "-x264-params",
        "aud=1",
        "-f",
        "h264",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Cuts an Annex B byte stream into access units at AUD boundaries.
#[derive(Debug, Default)]
pub struct AccessUnitSplitter {
    buf: BytesMut,
}

impl AccessUnitSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every access unit it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut units = Vec::new();
        // an AUD at the head of the buffer opens the current unit
        while let Some(pos) = find_aud(&self.buf, 2) {
            units.push(self.buf.split_to(pos).freeze());
        }
        units
    }

    /// Return whatever is buffered as the final access unit.
    pub fn flush(&mut self) -> Option<Bytes> {
        (!self.buf.is_empty()).then(|| self.buf.split().freeze())
    }
}

/// Offset of the first AUD start code at or after `from`, including the
/// leading zero of a four-byte start code.
fn find_aud(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 3 < data.len() {
        let start_code = data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1;
        if start_code && data[i + 3] & 0x1f == NAL_TYPE_AUD {
            return Some(if data[i - 1] == 0 { i - 1 } else { i });
        }
        i += 1;
    }
    None
}

/// One running libx264 process.
pub struct H264Encoder {
    format: PixelFormat,
    width: u32,
    height: u32,
    child: Child,
    stdin: ChildStdin,
    stderr_tail: Arc<Mutex<Option<String>>>,
    reader: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl H264Encoder {
    /// Start an encoder for pictures shaped like `frame`.
    ///
    /// Encoded access units are sent to `units` as they complete.
    pub fn spawn(
        config: &EncoderConfig,
        frame: &Frame,
        units: mpsc::Sender<Bytes>,
    ) -> Result<Self> {
        let (format, width, height) = (frame.format(), frame.width(), frame.height());
        let mut child = Command::new(&config.program)
            .args(encoder_args(config, format, width, height))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(BridgeError::Io(std::io::Error::other("encoder pipes unavailable")));
        };

        let stderr_tail = Arc::new(Mutex::new(None));
        let drain = match child.stderr.take() {
            Some(stderr) => drain_stderr(stderr, "h264 encoder".to_string(), stderr_tail.clone()),
            None => tokio::spawn(async {}),
        };

        let reader = tokio::spawn(async move {
            let mut splitter = AccessUnitSplitter::new();
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for unit in splitter.push(&buf[..n]) {
                            if units.send(unit).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            if let Some(unit) = splitter.flush() {
                let _ = units.send(unit).await;
            }
        });

        tracing::debug!(%format, width, height, pid = child.id(), "h264 encoder started");

        Ok(Self {
            format,
            width,
            height,
            child,
            stdin,
            stderr_tail,
            reader,
            drain,
        })
    }

    /// Whether `frame` has the layout this encoder was started for.
    pub fn accepts(&self, frame: &Frame) -> bool {
        frame.format() == self.format
            && frame.width() == self.width
            && frame.height() == self.height
    }

    pub async fn encode(&mut self, frame: &Frame) -> Result<()> {
        if let Err(e) = self.stdin.write_all(frame.data()).await {
            let reason = self.stderr_tail.lock().clone().unwrap_or_else(|| e.to_string());
            return Err(BridgeError::Io(std::io::Error::new(e.kind(), reason)));
        }
        Ok(())
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "encoder already exited");
        }
        self.reader.abort();
        self.drain.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUD: [u8; 6] = [0, 0, 0, 1, 0x09, 0xf0];

    fn unit(payload: &[u8]) -> Vec<u8> {
        let mut v = AUD.to_vec();
        v.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn splits_at_delimiters() {
        let mut stream = unit(&[1, 2, 3]);
        stream.extend(unit(&[4, 5]));
        stream.extend(unit(&[6]));

        let mut splitter = AccessUnitSplitter::new();
        let units = splitter.push(&stream);

        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &unit(&[1, 2, 3])[..]);
        assert_eq!(&units[1][..], &unit(&[4, 5])[..]);
        assert_eq!(splitter.flush().as_deref(), Some(&unit(&[6])[..]));
        assert!(splitter.flush().is_none());
    }

    #[test]
    fn delimiter_split_across_chunks() {
        let mut stream = unit(&[7, 7, 7]);
        stream.extend(unit(&[8]));
        let cut = unit(&[7, 7, 7]).len() + 2;

        let mut splitter = AccessUnitSplitter::new();
        assert!(splitter.push(&stream[..cut]).is_empty());
        let units = splitter.push(&stream[cut..]);

        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &unit(&[7, 7, 7])[..]);
    }

    #[test]
    fn three_byte_start_codes() {
        let stream = [0, 0, 1, 0x09, 0xf0, 0, 0, 1, 0x41, 0xaa, 0, 0, 1, 0x09, 0xf0];
        let mut splitter = AccessUnitSplitter::new();
        let units = splitter.push(&stream);

        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &stream[..10]);
    }

    #[test]
    fn args_request_delimited_baseline() {
        let config = EncoderConfig {
            bitrate_kbps: 1500,
            ..Default::default()
        };
        let args = encoder_args(&config, PixelFormat::Nv12, 1280, 720);
        let joined = args.join(" ");

        assert!(joined.contains("-pix_fmt nv12 -s 1280x720 -r 25 -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -preset ultrafast -tune zerolatency"));
        assert!(joined.contains("-profile:v baseline"));
        assert!(joined.contains("-b:v 1500k"));
        assert!(joined.contains("-x264-params aud=1"));
        assert!(joined.ends_with("-f h264 pipe:1"));
    }
}
