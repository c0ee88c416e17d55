//! Scripted decoders and in-memory peers for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::engine::{
    ConnectionState, NegotiationEngine, PeerConnection, SessionDescription, StateObserver,
};
use crate::error::{BridgeError, Result};
use crate::media::{Decoder, DecoderFactory, Frame, FrameRelay, PixelFormat, SourceOptions};

/// What the next `read_frame` call does.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Frame,
    Fail,
    Hang,
}

#[derive(Debug, Default)]
pub(crate) struct Probe {
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

pub(crate) fn test_frame(pts: u64) -> Frame {
    let size = PixelFormat::Yuv420p.frame_size(4, 4);
    Frame::new(PixelFormat::Yuv420p, 4, 4, pts, Bytes::from(vec![pts as u8; size])).unwrap()
}

struct ScriptedDecoder {
    script: VecDeque<Step>,
    then: Step,
    probe: Arc<Probe>,
    pts: u64,
}

#[async_trait]
impl Decoder for ScriptedDecoder {
    async fn read_frame(&mut self) -> Result<Frame> {
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front().unwrap_or(self.then) {
            Step::Frame => {
                let frame = test_frame(self.pts);
                self.pts += 1;
                Ok(frame)
            }
            Step::Fail => Err(BridgeError::StreamEnded("scripted failure".into())),
            Step::Hang => std::future::pending().await,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory whose decoders replay `script`, then repeat `then` forever.
pub(crate) struct ScriptedFactory {
    script: Vec<Step>,
    then: Step,
    open_error: Option<String>,
    open_delay: Option<Duration>,
    pub probe: Arc<Probe>,
}

impl ScriptedFactory {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            then: Step::Frame,
            open_error: None,
            open_delay: None,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn unreachable(reason: &str) -> Self {
        let mut factory = Self::new(vec![]);
        factory.open_error = Some(reason.to_string());
        factory
    }

    pub fn then(mut self, step: Step) -> Self {
        self.then = step;
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }
}

#[async_trait]
impl DecoderFactory for ScriptedFactory {
    async fn open(&self, _url: &str, _options: &SourceOptions) -> Result<Box<dyn Decoder>> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.open_error {
            return Err(BridgeError::Connect(reason.clone()));
        }
        Ok(Box::new(ScriptedDecoder {
            script: self.script.iter().copied().collect(),
            then: self.then,
            probe: self.probe.clone(),
            pts: 0,
        }))
    }
}

/// In-memory peer that records every call.
#[derive(Default)]
pub(crate) struct MockPeer {
    observers: Mutex<Vec<StateObserver>>,
    pub relay: Mutex<Option<Arc<FrameRelay>>>,
    pub negotiate_error: Option<String>,
    pub fail_stop_tracks: bool,
    /// When set, `close` records the call and then never completes.
    pub hang_close: AtomicBool,
    pub stop_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl MockPeer {
    pub fn failing_stop_tracks() -> Self {
        Self {
            fail_stop_tracks: true,
            ..Default::default()
        }
    }

    /// Deliver `state` to every registered observer, as a transport would.
    pub fn emit(&self, state: ConnectionState) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(state);
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn on_state_change(&self, observer: StateObserver) {
        self.observers.lock().push(observer);
    }

    async fn attach_video(&self, relay: Arc<FrameRelay>) -> Result<()> {
        *self.relay.lock() = Some(relay);
        Ok(())
    }

    async fn negotiate(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if let Some(reason) = &self.negotiate_error {
            return Err(BridgeError::Negotiation(reason.clone()));
        }
        Ok(SessionDescription::answer(format!("{}a=mock-answer\r\n", offer.sdp)))
    }

    async fn stop_tracks(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop_tracks {
            return Err(BridgeError::Negotiation("sender already stopped".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.emit(ConnectionState::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockEngine {
    pub peers: Mutex<Vec<Arc<MockPeer>>>,
    pub negotiate_error: Option<String>,
    pub fail_stop_tracks: bool,
}

impl MockEngine {
    pub fn rejecting(reason: &str) -> Self {
        Self {
            negotiate_error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers.lock()[index].clone()
    }
}

#[async_trait]
impl NegotiationEngine for MockEngine {
    async fn new_connection(&self) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(MockPeer {
            negotiate_error: self.negotiate_error.clone(),
            fail_stop_tracks: self.fail_stop_tracks,
            ..Default::default()
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

pub(crate) const OFFER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
