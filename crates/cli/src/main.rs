use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bridge::engine::encoder::EncoderConfig;
use bridge::media::{PixelFormat, RtspTransport};
use bridge::{
    FfmpegDecoderFactory, Gateway, RelayConfig, ServerConfig, SourceOptions, WebRtcConfig,
    WebRtcEngine,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-bridge",
    about = "Relay RTSP cameras to browsers over WebRTC"
)]
struct Args {
    /// HTTP bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:5000")]
    bind: String,

    /// STUN/TURN server URL, repeatable
    #[arg(long = "ice-server", default_value = "stun:stun.l.google.com:19302")]
    ice_servers: Vec<String>,

    /// Output width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Output height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Output frame rate
    #[arg(long, default_value_t = 25)]
    fps: u32,

    /// Pixel format requested from the decoder
    #[arg(long, default_value = "yuv420p")]
    pix_fmt: PixelFormat,

    /// RTSP lower transport (tcp or udp)
    #[arg(long, default_value = "tcp")]
    transport: RtspTransport,

    /// Seconds allowed to open a source
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Seconds allowed for a single frame read
    #[arg(long, default_value_t = 5)]
    read_timeout: u64,

    /// Consecutive failed reads before a session's stream is given up
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Path to the ffmpeg binary
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// H.264 target bitrate in kbit/s
    #[arg(long, default_value_t = 2000)]
    bitrate: u32,

    /// Do not restart the decoder when a source drops
    #[arg(long)]
    no_reconnect: bool,

    /// Seconds allowed to drain sessions on shutdown
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            source: SourceOptions::default()
                .transport(self.transport)
                .connect_timeout(Duration::from_secs(self.connect_timeout))
                .read_timeout(Duration::from_secs(self.read_timeout))
                .resolution(self.width, self.height)
                .framerate(self.fps)
                .pixel_format(self.pix_fmt)
                .reconnect(!self.no_reconnect),
            relay: RelayConfig {
                max_retries: self.max_retries,
                ..RelayConfig::default()
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
        }
    }

    fn webrtc_config(&self) -> WebRtcConfig {
        WebRtcConfig {
            ice_servers: self.ice_servers.clone(),
            encoder: EncoderConfig {
                program: self.ffmpeg.clone(),
                bitrate_kbps: self.bitrate,
                framerate: self.fps,
            },
            ..WebRtcConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "gateway stopped");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> bridge::Result<()> {
    let config = args.server_config();
    let engine = WebRtcEngine::new(args.webrtc_config())?;
    let decoders = FfmpegDecoderFactory::new(args.ffmpeg.clone());

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let gateway = Gateway::new(config, Arc::new(engine), Arc::new(decoders));
    gateway.serve(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library() {
        let args = Args::parse_from(["rtsp-bridge"]);
        let config = args.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.source.width, 1280);
        assert_eq!(config.source.transport, RtspTransport::Tcp);
        assert!(config.source.reconnect);
        assert_eq!(config.relay.max_retries, 3);
        assert_eq!(args.webrtc_config().ice_servers, vec!["stun:stun.l.google.com:19302"]);
    }

    #[test]
    fn overrides() {
        let args = Args::parse_from([
            "rtsp-bridge",
            "--transport",
            "udp",
            "--pix-fmt",
            "nv12",
            "--no-reconnect",
            "--ice-server",
            "stun:a:3478",
            "--ice-server",
            "turn:b:3478",
        ]);
        let config = args.server_config();
        assert_eq!(config.source.transport, RtspTransport::Udp);
        assert_eq!(config.source.pixel_format, PixelFormat::Nv12);
        assert!(!config.source.reconnect);
        assert_eq!(args.webrtc_config().ice_servers.len(), 2);
    }
}
