//! [`NegotiationEngine`] backed by the `webrtc` crate.
//!
//! Each peer owns one H.264 sample track. Once a relay is attached, a pump
//! task pulls pictures from it, feeds a per-session [`H264Encoder`] and
//! writes every encoded access unit to the track as one sample.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::encoder::{EncoderConfig, H264Encoder};
use super::{
    ConnectionState, NegotiationEngine, PeerConnection, SdpType, SessionDescription, StateObserver,
};
use crate::error::{BridgeError, Result};
use crate::media::FrameRelay;

/// Encoded access units buffered between the encoder and the track.
const UNIT_QUEUE: usize = 32;
const RTCP_BUF: usize = 1500;

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// STUN/TURN server URLs offered to ICE.
    pub ice_servers: Vec<String>,
    /// Upper bound for ICE candidate gathering before answering.
    pub gather_timeout: Duration,
    pub encoder: EncoderConfig,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            gather_timeout: Duration::from_secs(5),
            encoder: EncoderConfig::default(),
        }
    }
}

fn negotiation(e: webrtc::Error) -> BridgeError {
    BridgeError::Negotiation(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

pub struct WebRtcEngine {
    api: API,
    rtc_config: RTCConfiguration,
    config: WebRtcConfig,
}

impl WebRtcEngine {
    pub fn new(config: WebRtcConfig) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(negotiation)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(negotiation)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        tracing::debug!(ice_servers = ?config.ice_servers, "webrtc engine ready");

        Ok(Self {
            api,
            rtc_config,
            config,
        })
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn new_connection(&self) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(negotiation)?,
        );

        let observers: Arc<Mutex<Vec<StateObserver>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let observers = observers.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                if let Some(state) = map_state(state) {
                    let current = observers.lock().clone();
                    for observer in current {
                        observer(state);
                    }
                }
                Box::pin(async {})
            }));
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "rtsp-bridge".to_owned(),
        ));

        Ok(Arc::new(WebRtcPeer {
            pc,
            track,
            observers,
            encoder: self.config.encoder.clone(),
            gather_timeout: self.config.gather_timeout,
            pump: Mutex::new(None),
        }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    observers: Arc<Mutex<Vec<StateObserver>>>,
    encoder: EncoderConfig,
    gather_timeout: Duration,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcPeer {
    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn on_state_change(&self, observer: StateObserver) {
        self.observers.lock().push(observer);
    }

    async fn attach_video(&self, relay: Arc<FrameRelay>) -> Result<()> {
        let track: Arc<dyn TrackLocal + Send + Sync> = self.track.clone();
        let sender = self.pc.add_track(track).await.map_err(negotiation)?;

        // RTCP has to be read for interceptors (NACK, reports) to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUF];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let pump = tokio::spawn(pump(
            relay,
            self.track.clone(),
            self.encoder.clone(),
            Arc::downgrade(&self.pc),
        ));
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn negotiate(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpType::Offer {
            return Err(BridgeError::Negotiation(format!(
                "expected an offer, got {:?}",
                offer.kind
            )));
        }

        let remote = RTCSessionDescription::offer(offer.sdp).map_err(negotiation)?;
        self.pc.set_remote_description(remote).await.map_err(negotiation)?;
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;

        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await.map_err(negotiation)?;
        if tokio::time::timeout(self.gather_timeout, gathered.recv()).await.is_err() {
            tracing::warn!(
                timeout_ms = self.gather_timeout.as_millis() as u64,
                "ice gathering incomplete, answering with partial candidates"
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| BridgeError::Negotiation("no local description".into()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn stop_tracks(&self) -> Result<()> {
        self.stop_pump();

        let mut first_error = None;
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                first_error.get_or_insert(e);
            }
        }
        for receiver in self.pc.get_receivers().await {
            if let Err(e) = receiver.stop().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(negotiation(e)))
    }

    async fn close(&self) -> Result<()> {
        self.stop_pump();
        self.pc.close().await.map_err(negotiation)
    }
}

/// Move pictures from `relay` to `track` until the relay closes or fails.
async fn pump(
    relay: Arc<FrameRelay>,
    track: Arc<TrackLocalStaticSample>,
    config: EncoderConfig,
    pc: Weak<RTCPeerConnection>,
) {
    let (units_tx, mut units_rx) = mpsc::channel::<Bytes>(UNIT_QUEUE);
    let duration = Duration::from_secs(1) / config.framerate.max(1);

    let writer = tokio::spawn(async move {
        while let Some(data) = units_rx.recv().await {
            let sample = Sample {
                data,
                duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!(error = %e, "dropping sample");
            }
        }
    });

    let mut encoder: Option<H264Encoder> = None;
    let outcome = loop {
        let frame = match relay.recv().await {
            Ok(frame) => frame,
            Err(e) => break e,
        };

        if !encoder.as_ref().is_some_and(|enc| enc.accepts(&frame)) {
            if let Some(previous) = encoder.take() {
                previous.shutdown().await;
            }
            match H264Encoder::spawn(&config, &frame, units_tx.clone()) {
                Ok(enc) => encoder = Some(enc),
                Err(e) => break e,
            }
        }

        if let Some(enc) = encoder.as_mut() {
            if let Err(e) = enc.encode(&frame).await {
                break e;
            }
        }
    };

    if let Some(enc) = encoder.take() {
        enc.shutdown().await;
    }
    drop(units_tx);
    writer.abort();

    match outcome {
        BridgeError::RelayClosed => tracing::debug!("relay closed, video pump stopped"),
        e => {
            tracing::warn!(
                url = %relay.binding().url(),
                error = %e,
                "video track failed, closing connection"
            );
            if let Some(pc) = pc.upgrade() {
                if let Err(e) = pc.close().await {
                    tracing::warn!(error = %e, "failed to close peer connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    use super::*;

    fn offline_config() -> WebRtcConfig {
        WebRtcConfig {
            ice_servers: vec![],
            gather_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn state_mapping() {
        assert_eq!(map_state(RTCPeerConnectionState::Failed), Some(ConnectionState::Failed));
        assert_eq!(map_state(RTCPeerConnectionState::Closed), Some(ConnectionState::Closed));
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn rejects_non_offer() {
        let engine = WebRtcEngine::new(offline_config()).unwrap();
        let peer = engine.new_connection().await.unwrap();
        let err = peer
            .negotiate(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Negotiation(_)));
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn answers_a_receive_only_browser_offer() {
        let engine = WebRtcEngine::new(offline_config()).unwrap();
        let peer = engine.new_connection().await.unwrap();

        let browser = engine.api.new_peer_connection(RTCConfiguration::default()).await.unwrap();
        browser
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();

        let answer = peer
            .negotiate(SessionDescription::offer(offer.sdp))
            .await
            .unwrap();
        assert_eq!(answer.kind, SdpType::Answer);
        assert!(answer.sdp.contains("m=video"));

        peer.close().await.unwrap();
        browser.close().await.unwrap();
    }
}
