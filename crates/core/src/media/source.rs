use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Decoder, DecoderFactory, Frame, PixelFormat};
use crate::error::{BridgeError, Result};

/// How long [`MediaSourceBinding::close`] waits for an interrupted read to
/// hand the decoder back before leaving it to be dropped.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// RTSP lower transport requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    /// Interleaved RTP over the RTSP TCP connection. Reliable and ordered.
    Tcp,
    /// RTP over UDP.
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for RtspTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RtspTransport {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(BridgeError::Validation(format!(
                "unsupported RTSP transport: {other}"
            ))),
        }
    }
}

/// Connection policy handed to the decoder when a source is opened.
///
/// These are tuning knobs for the decoding backend; the bridge itself only
/// interprets [`connect_timeout`](Self::connect_timeout) and
/// [`read_timeout`](Self::read_timeout).
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// RTSP lower transport. TCP avoids packet loss artifacts on lossy links.
    pub transport: RtspTransport,
    /// Upper bound for opening the source and decoding its first picture.
    pub connect_timeout: Duration,
    /// Upper bound for a single [`MediaSourceBinding::read`].
    pub read_timeout: Duration,
    /// Input socket buffer size in bytes.
    pub buffer_size: usize,
    /// Maximum demuxer delay.
    pub max_delay: Duration,
    /// Target picture width after scaling.
    pub width: u32,
    /// Target picture height after scaling.
    pub height: u32,
    /// Target output frame rate.
    pub framerate: u32,
    /// Pixel layout requested from the decoder.
    pub pixel_format: PixelFormat,
    /// Disable input buffering and enable low-delay decoding.
    pub low_latency: bool,
    /// Restart the decoder when the source drops.
    pub reconnect: bool,
    /// Cap for the delay between reconnect attempts.
    pub reconnect_delay_max: Duration,
    /// Consecutive reconnect attempts allowed without a decoded frame.
    pub max_reconnects: u32,
    /// Demuxer packet queue length.
    pub thread_queue_size: u32,
    /// Fraction of decode errors tolerated before the decoder gives up.
    pub max_error_rate: f32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            transport: RtspTransport::Tcp,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            buffer_size: 1_024_000,
            max_delay: Duration::from_millis(500),
            width: 1280,
            height: 720,
            framerate: 25,
            pixel_format: PixelFormat::Yuv420p,
            low_latency: true,
            reconnect: true,
            reconnect_delay_max: Duration::from_secs(2),
            max_reconnects: 3,
            thread_queue_size: 512,
            max_error_rate: 0.99,
        }
    }
}

impl SourceOptions {
    pub fn transport(mut self, transport: RtspTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn framerate(mut self, fps: u32) -> Self {
        self.framerate = fps.max(1);
        self
    }

    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }
}

/// Handle to one external decoder instance for one session.
///
/// Opening happens in [`open`](Self::open), so a binding exists only for a
/// source that produced its first picture. [`close`](Self::close) is
/// idempotent and interrupts a read that is in flight.
pub struct MediaSourceBinding {
    url: String,
    read_timeout: Duration,
    decoder: Mutex<Option<Box<dyn Decoder>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl MediaSourceBinding {
    /// Open `url` through `factory`, bounded by `options.connect_timeout`.
    pub async fn open(
        factory: &dyn DecoderFactory,
        url: &str,
        options: &SourceOptions,
    ) -> Result<Self> {
        tracing::debug!(url, transport = %options.transport, "opening source");

        let opened =
            tokio::time::timeout(options.connect_timeout, factory.open(url, options)).await;
        let decoder = match opened {
            Ok(Ok(decoder)) => decoder,
            Ok(Err(e @ BridgeError::Connect(_))) => return Err(e),
            Ok(Err(e)) => return Err(BridgeError::Connect(e.to_string())),
            Err(_) => {
                return Err(BridgeError::Connect(format!(
                    "timed out after {}ms connecting to {url}",
                    options.connect_timeout.as_millis()
                )));
            }
        };

        tracing::info!(url, "source opened");

        Ok(Self::from_decoder(url, decoder, options.read_timeout))
    }

    /// Wrap an already-open decoder.
    pub fn from_decoder(url: &str, decoder: Box<dyn Decoder>, read_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            read_timeout,
            decoder: Mutex::new(Some(decoder)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for the next picture, bounded by the read timeout.
    ///
    /// Fails with [`StreamEnded`](BridgeError::StreamEnded) on end of stream,
    /// decoder error, timeout, or when the binding is closed meanwhile.
    pub async fn read(&self) -> Result<Frame> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.closed_error()),
            result = self.read_inner() => result,
        }
    }

    async fn read_inner(&self) -> Result<Frame> {
        let mut guard = self.decoder.lock().await;
        let decoder = guard.as_mut().ok_or_else(|| self.closed_error())?;
        match tokio::time::timeout(self.read_timeout, decoder.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::StreamEnded(format!(
                "no frame within {}ms",
                self.read_timeout.as_millis()
            ))),
        }
    }

    /// Release the decoder. Safe to call any number of times.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let decoder = match tokio::time::timeout(CLOSE_GRACE, self.decoder.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                tracing::warn!(
                    url = %self.url,
                    "in-flight read still holds the decoder, dropping it"
                );
                return Ok(());
            }
        };

        if let Some(mut decoder) = decoder {
            decoder.shutdown().await?;
            tracing::debug!(url = %self.url, "source closed");
        }
        Ok(())
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::StreamEnded(format!("source {} closed", self.url))
    }
}

impl fmt::Debug for MediaSourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSourceBinding")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}
