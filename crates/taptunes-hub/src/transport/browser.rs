//! Browser page transport.
//!
//! The page's media element is the source of truth. Commands go out over the
//! page's websocket as JSON; native media events (`timeupdate`, `play`,
//! `pause`, `canplay`, `ended`) come back and are turned into clock samples
//! and lifecycle events. Only the most recently attached page is driven.
//!
//! Every load lands on its requested start position. When a page reloads
//! mid-track, the replacement page gets the same track back, resumed once at
//! the old position if it was playing past the resume threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use actix::prelude::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taptunes_types::PlaybackMode;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{
    PlaybackTransport, TransportError, TransportEvent, TransportEventKind, TransportEventSender,
    TransportSample,
};
use crate::clock::{ClockSample, PlaybackClock};

/// Name of the DOMException raised when autoplay is refused.
const NOT_ALLOWED_ERROR: &str = "NotAllowedError";

/// Outbound messages to a browser websocket session.
#[derive(Message)]
#[rtype(result = "()")]
pub struct BrowserOutbound(pub String);

/// Where outbound JSON for the attached page is written.
pub trait BrowserSink: Send + Sync {
    /// Returns false when the page is gone.
    fn send_text(&self, payload: String) -> bool;
}

impl BrowserSink for Recipient<BrowserOutbound> {
    fn send_text(&self, payload: String) -> bool {
        if !self.connected() {
            return false;
        }
        self.do_send(BrowserOutbound(payload));
        true
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserServerMessage {
    Hello {
        session_id: String,
    },
    Load {
        seq: u64,
        track_id: String,
        url: String,
        /// Where the media element should start.
        position_secs: f64,
    },
    Play {
        request_id: u64,
    },
    Pause,
    Seek {
        position_secs: f64,
    },
    Volume {
        volume: u8,
    },
}

/// Messages relayed from the page. `seq` echoes the `load` they belong to.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserClientMessage {
    Hello {
        name: Option<String>,
    },
    TimeUpdate {
        seq: Option<u64>,
        position_secs: f64,
        duration_secs: Option<f64>,
        paused: bool,
    },
    Play {
        seq: Option<u64>,
    },
    Pause {
        seq: Option<u64>,
    },
    CanPlay {
        seq: Option<u64>,
        duration_secs: Option<f64>,
    },
    Ended {
        seq: Option<u64>,
    },
    PlayResult {
        request_id: u64,
        ok: bool,
        error: Option<String>,
    },
    Error {
        seq: Option<u64>,
        message: String,
    },
}

struct BrowserLink {
    session_id: String,
    sink: Arc<dyn BrowserSink>,
}

#[derive(Default)]
struct BrowserState {
    link: Option<BrowserLink>,
    seq: u64,
    loading_track: Option<String>,
    confirmed_track: Option<String>,
    /// Seek applied when the pending load reports `canplay`.
    pending_seek: Option<f64>,
    /// Track and clock of a page that went away with a track loaded.
    orphaned: Option<(String, ClockSample)>,
    /// Track whose reload resume was already applied.
    last_resumed: Option<String>,
    pending_plays: HashMap<u64, oneshot::Sender<Result<(), TransportError>>>,
}

pub struct BrowserTransport {
    state: Mutex<BrowserState>,
    clock: PlaybackClock,
    events: TransportEventSender,
    media_base_url: String,
    request_timeout: Duration,
    resume_threshold_secs: f64,
    request_ids: AtomicU64,
}

impl BrowserTransport {
    pub fn new(
        events: TransportEventSender,
        media_base_url: String,
        request_timeout: Duration,
        resume_threshold_secs: f64,
    ) -> Self {
        Self {
            state: Mutex::new(BrowserState::default()),
            clock: PlaybackClock::new(),
            events,
            media_base_url,
            request_timeout,
            resume_threshold_secs,
            request_ids: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrowserState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stream URL handed to the page's media element.
    pub fn media_url(&self, track_id: &str) -> String {
        format!(
            "{}/tracks/{}/stream",
            self.media_base_url.trim_end_matches('/'),
            urlencoding::encode(track_id)
        )
    }

    pub fn is_attached(&self) -> bool {
        self.state().link.is_some()
    }

    /// Make `sink` the driven page, replacing any earlier one.
    pub fn attach(&self, sink: Arc<dyn BrowserSink>) -> String {
        let session_id = format!("page:{}", Uuid::new_v4());
        let hello = BrowserServerMessage::Hello {
            session_id: session_id.clone(),
        };
        if let Ok(text) = serde_json::to_string(&hello) {
            sink.send_text(text);
        }
        let resume = {
            let mut state = self.state();
            let replaced = state.link.replace(BrowserLink {
                session_id: session_id.clone(),
                sink,
            });
            if let Some(previous) = replaced {
                tracing::info!(
                    previous = %previous.session_id,
                    session_id = %session_id,
                    "browser: page replaced"
                );
                if let Some(track) = state.confirmed_track.take() {
                    state.orphaned = Some((track, self.clock.latest()));
                }
            } else {
                tracing::info!(session_id = %session_id, "browser: page attached");
            }
            match state.orphaned.take() {
                Some((track, clock)) => {
                    let position = self.resume_position(&mut state, &track, &clock);
                    Some((track, position))
                }
                None => None,
            }
        };
        if let Some((track_id, position_secs)) = resume {
            self.reload_on_page(track_id, position_secs);
        }
        session_id
    }

    /// Position a reloaded page resumes at. The resume only happens once per
    /// track, for a page that was playing past the threshold.
    fn resume_position(
        &self,
        state: &mut BrowserState,
        track_id: &str,
        clock: &ClockSample,
    ) -> Option<f64> {
        let eligible = clock.is_playing
            && clock.position_secs > self.resume_threshold_secs
            && state.last_resumed.as_deref() != Some(track_id);
        if !eligible {
            return None;
        }
        state.last_resumed = Some(track_id.to_string());
        Some(clock.position_secs)
    }

    /// Hand the track of a vanished page to the newly attached one under the
    /// current sequence.
    fn reload_on_page(&self, track_id: String, resume: Option<f64>) {
        let seq = {
            let mut state = self.state();
            state.loading_track = Some(track_id.clone());
            state.confirmed_track = None;
            state.pending_seek = resume;
            state.seq
        };
        tracing::info!(
            track_id = %track_id,
            resume_secs = ?resume,
            "browser: reloading track on new page"
        );
        self.clock.reset(0.0);
        let msg = BrowserServerMessage::Load {
            seq,
            url: self.media_url(&track_id),
            track_id,
            position_secs: resume.unwrap_or(0.0),
        };
        if let Err(err) = self.send(&msg) {
            tracing::warn!(error = %err, "browser: reload on new page failed");
        }
    }

    /// Forget the page if it is still the driven one.
    pub fn detach(&self, session_id: &str) {
        let seq = {
            let mut state = self.state();
            if state.link.as_ref().map(|l| l.session_id.as_str()) != Some(session_id) {
                return;
            }
            state.link = None;
            if let Some(track) = state.confirmed_track.take() {
                state.orphaned = Some((track, self.clock.latest()));
            }
            // Dropping the senders fails every in-flight play().
            state.pending_plays.clear();
            state.seq
        };
        tracing::info!(session_id = %session_id, "browser: page detached");
        self.emit(seq, TransportEventKind::Error("browser page detached".to_string()));
    }

    fn emit(&self, seq: u64, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            mode: PlaybackMode::Browser,
            seq,
            kind,
        });
    }

    fn send(&self, msg: &BrowserServerMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_string(msg)
            .map_err(|e| TransportError::Unavailable(format!("encode failed: {e}")))?;
        let sink = self
            .state()
            .link
            .as_ref()
            .map(|link| link.sink.clone())
            .ok_or_else(|| TransportError::Unavailable("no browser page attached".to_string()))?;
        if sink.send_text(payload) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("browser page disconnected".to_string()))
        }
    }

    /// Returns the sequence the message belongs to, or `None` when it is
    /// stale or comes from a replaced page.
    fn accept(&self, session_id: &str, seq: Option<u64>) -> Option<u64> {
        let state = self.state();
        let current = state.link.as_ref()?;
        if current.session_id != session_id {
            return None;
        }
        match seq {
            Some(seq) if seq != state.seq => None,
            _ => Some(state.seq),
        }
    }

    /// Apply one message received from page `session_id`.
    pub fn handle_client_message(&self, session_id: &str, msg: BrowserClientMessage) {
        match msg {
            BrowserClientMessage::Hello { name } => {
                tracing::debug!(session_id = %session_id, name = ?name, "browser: hello");
            }
            BrowserClientMessage::TimeUpdate {
                seq,
                position_secs,
                duration_secs,
                paused,
            } => {
                let Some(seq) = self.accept(session_id, seq) else { return };
                let duration = duration_secs.unwrap_or(self.clock.latest().duration_secs);
                if let Some(sample) = self.clock.observe(position_secs, duration, !paused) {
                    self.emit(seq, TransportEventKind::Sample(sample));
                }
            }
            BrowserClientMessage::Play { seq } | BrowserClientMessage::Pause { seq } => {
                let playing = matches!(msg, BrowserClientMessage::Play { .. });
                let Some(seq) = self.accept(session_id, seq) else { return };
                let latest = self.clock.latest();
                if let Some(sample) =
                    self.clock
                        .observe(latest.position_secs, latest.duration_secs, playing)
                {
                    self.emit(seq, TransportEventKind::Sample(sample));
                }
            }
            BrowserClientMessage::CanPlay { seq, duration_secs } => {
                let Some(seq) = self.accept(session_id, seq) else { return };
                self.on_can_play(seq, duration_secs);
            }
            BrowserClientMessage::Ended { seq } => {
                let Some(seq) = self.accept(session_id, seq) else { return };
                let latest = self.clock.latest();
                self.clock
                    .observe(latest.duration_secs, latest.duration_secs, false);
                self.emit(seq, TransportEventKind::Ended);
            }
            BrowserClientMessage::PlayResult {
                request_id,
                ok,
                error,
            } => {
                let waiter = self.state().pending_plays.remove(&request_id);
                let Some(waiter) = waiter else {
                    tracing::debug!(request_id, "browser: late play result dropped");
                    return;
                };
                let result = if ok {
                    Ok(())
                } else {
                    match error.as_deref() {
                        Some(NOT_ALLOWED_ERROR) => Err(TransportError::PolicyBlocked),
                        Some(other) => Err(TransportError::Unavailable(other.to_string())),
                        None => Err(TransportError::Unavailable("play rejected".to_string())),
                    }
                };
                let _ = waiter.send(result);
            }
            BrowserClientMessage::Error { seq, message } => {
                let Some(seq) = self.accept(session_id, seq) else { return };
                tracing::warn!(session_id = %session_id, error = %message, "browser: media error");
                self.emit(seq, TransportEventKind::Error(message));
            }
        }
    }

    fn on_can_play(&self, seq: u64, duration_secs: Option<f64>) {
        let seek = {
            let mut state = self.state();
            state.confirmed_track = state.loading_track.clone();
            state.pending_seek.take()
        };
        let latest = self.clock.latest();
        let position = seek.unwrap_or(latest.position_secs);
        self.clock
            .observe(position, duration_secs.unwrap_or(0.0), false);
        if let Some(position_secs) = seek {
            tracing::debug!(position_secs, "browser: seeking to start position");
            if let Err(err) = self.send(&BrowserServerMessage::Seek { position_secs }) {
                tracing::warn!(error = %err, "browser: start seek failed");
            }
        }
        self.emit(seq, TransportEventKind::CanPlay);
    }
}

#[async_trait]
impl PlaybackTransport for BrowserTransport {
    fn mode(&self) -> PlaybackMode {
        PlaybackMode::Browser
    }

    async fn load(&self, track_id: &str, start_at: f64, seq: u64) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            if state.link.is_none() {
                return Err(TransportError::Unavailable(
                    "no browser page attached".to_string(),
                ));
            }
            state.seq = seq;
            state.loading_track = Some(track_id.to_string());
            state.confirmed_track = None;
            state.orphaned = None;
            state.pending_seek = (start_at > 0.0).then_some(start_at);
        }
        self.clock.reset(0.0);
        self.send(&BrowserServerMessage::Load {
            seq,
            track_id: track_id.to_string(),
            url: self.media_url(track_id),
            position_secs: start_at.max(0.0),
        })
    }

    async fn play(&self) -> Result<(), TransportError> {
        let request_id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.state().pending_plays.insert(request_id, tx);
        if let Err(err) = self.send(&BrowserServerMessage::Play { request_id }) {
            self.state().pending_plays.remove(&request_id);
            return Err(err);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Unavailable(
                "browser page detached".to_string(),
            )),
            Err(_) => {
                self.state().pending_plays.remove(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn pause(&self) -> Result<(), TransportError> {
        self.send(&BrowserServerMessage::Pause)
    }

    async fn seek(&self, position_secs: f64) -> Result<(), TransportError> {
        self.send(&BrowserServerMessage::Seek { position_secs })
    }

    async fn set_volume(&self, volume: u8) -> Result<(), TransportError> {
        self.send(&BrowserServerMessage::Volume { volume })
    }

    async fn sample(&self) -> Result<TransportSample, TransportError> {
        let state = self.state();
        if state.link.is_none() {
            return Err(TransportError::Unavailable(
                "no browser page attached".to_string(),
            ));
        }
        Ok(TransportSample {
            track_id: state.confirmed_track.clone(),
            clock: self.clock.latest(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportEventReceiver, event_channel};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<serde_json::Value>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<serde_json::Value> {
            self.sent.lock().unwrap().clone()
        }

        fn last_of(&self, kind: &str) -> Option<serde_json::Value> {
            self.sent().into_iter().rev().find(|v| v["type"] == kind)
        }
    }

    impl BrowserSink for RecordingSink {
        fn send_text(&self, payload: String) -> bool {
            let value = serde_json::from_str(&payload).unwrap();
            self.sent.lock().unwrap().push(value);
            true
        }
    }

    fn make_transport() -> (Arc<BrowserTransport>, TransportEventReceiver) {
        let (tx, rx) = event_channel();
        let transport = BrowserTransport::new(
            tx,
            "http://hub.local:8080/".to_string(),
            Duration::from_millis(200),
            5.0,
        );
        (Arc::new(transport), rx)
    }

    fn attach(transport: &BrowserTransport) -> (Arc<RecordingSink>, String) {
        let sink = Arc::new(RecordingSink::default());
        let id = transport.attach(sink.clone());
        (sink, id)
    }

    fn parse(raw: &str) -> BrowserClientMessage {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn media_url_encodes_track_id() {
        let (transport, _rx) = make_transport();
        assert_eq!(
            transport.media_url("album/one two"),
            "http://hub.local:8080/tracks/album%2Fone%20two/stream"
        );
    }

    #[actix_web::test]
    async fn verbs_fail_without_page() {
        let (transport, _rx) = make_transport();
        assert!(matches!(
            transport.load("t1", 0.0, 1).await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(matches!(
            transport.play().await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(matches!(
            transport.sample().await,
            Err(TransportError::Unavailable(_))
        ));
    }

    #[actix_web::test]
    async fn attach_sends_hello_and_latest_page_wins() {
        let (transport, mut rx) = make_transport();
        let (first, first_id) = attach(&transport);
        let (second, second_id) = attach(&transport);
        assert_eq!(first.sent()[0]["type"], "hello");
        transport.pause().await.unwrap();
        assert!(first.last_of("pause").is_none());
        assert!(second.last_of("pause").is_some());
        transport.detach(&first_id);
        assert!(transport.is_attached());
        transport.detach(&second_id);
        assert!(!transport.is_attached());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, TransportEventKind::Error(_)));
    }

    #[actix_web::test]
    async fn play_resolves_from_play_result() {
        let (transport, _rx) = make_transport();
        let (sink, id) = attach(&transport);
        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.play().await })
        };
        let request_id = loop {
            if let Some(msg) = sink.last_of("play") {
                break msg["request_id"].as_u64().unwrap();
            }
            tokio::task::yield_now().await;
        };
        transport.handle_client_message(
            &id,
            BrowserClientMessage::PlayResult {
                request_id,
                ok: false,
                error: Some("NotAllowedError".to_string()),
            },
        );
        assert_eq!(waiter.await.unwrap(), Err(TransportError::PolicyBlocked));
    }

    #[actix_web::test]
    async fn play_times_out_without_answer() {
        let (transport, _rx) = make_transport();
        attach(&transport);
        assert_eq!(transport.play().await, Err(TransportError::Timeout));
    }

    fn seek_count(sink: &RecordingSink) -> usize {
        sink.sent().iter().filter(|v| v["type"] == "seek").count()
    }

    #[actix_web::test]
    async fn repeated_handoff_of_same_track_lands_on_position() {
        let (transport, mut rx) = make_transport();
        let (sink, id) = attach(&transport);
        transport.load("A", 42.0, 3).await.unwrap();
        assert_eq!(sink.last_of("load").unwrap()["position_secs"], 42.0);
        transport.handle_client_message(&id, parse(r#"{"type":"can_play","seq":3,"duration_secs":180.0}"#));
        assert_eq!(sink.last_of("seek").unwrap()["position_secs"], 42.0);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 3);
        assert_eq!(event.kind, TransportEventKind::CanPlay);
        let sample = transport.sample().await.unwrap();
        assert_eq!(sample.track_id.as_deref(), Some("A"));
        assert_eq!(sample.clock.position_secs, 42.0);

        transport.load("A", 90.0, 7).await.unwrap();
        transport.handle_client_message(&id, parse(r#"{"type":"can_play","seq":7,"duration_secs":180.0}"#));
        assert_eq!(sink.last_of("seek").unwrap()["position_secs"], 90.0);
        assert_eq!(transport.sample().await.unwrap().clock.position_secs, 90.0);

        transport.load("A", 3.0, 8).await.unwrap();
        transport.handle_client_message(&id, parse(r#"{"type":"can_play","seq":8}"#));
        assert_eq!(sink.last_of("seek").unwrap()["position_secs"], 3.0);
        assert_eq!(transport.sample().await.unwrap().clock.position_secs, 3.0);
    }

    #[actix_web::test]
    async fn load_from_top_sends_no_seek() {
        let (transport, _rx) = make_transport();
        let (sink, id) = attach(&transport);
        transport.load("t2", 0.0, 1).await.unwrap();
        transport.handle_client_message(&id, parse(r#"{"type":"can_play","seq":1}"#));
        assert_eq!(sink.last_of("load").unwrap()["position_secs"], 0.0);
        assert!(sink.last_of("seek").is_none());
    }

    #[actix_web::test]
    async fn reloaded_page_resumes_playing_track_once() {
        let (transport, _rx) = make_transport();
        let (_first, first_id) = attach(&transport);
        transport.load("t1", 0.0, 4).await.unwrap();
        transport.handle_client_message(&first_id, parse(r#"{"type":"can_play","seq":4,"duration_secs":300.0}"#));
        transport.handle_client_message(
            &first_id,
            parse(r#"{"type":"time_update","seq":4,"position_secs":61.0,"duration_secs":300.0,"paused":false}"#),
        );
        transport.detach(&first_id);

        let (second, second_id) = attach(&transport);
        let load = second.last_of("load").unwrap();
        assert_eq!(load["track_id"], "t1");
        assert_eq!(load["seq"], 4);
        assert_eq!(load["position_secs"], 61.0);
        transport.handle_client_message(&second_id, parse(r#"{"type":"can_play","seq":4,"duration_secs":300.0}"#));
        assert_eq!(second.last_of("seek").unwrap()["position_secs"], 61.0);
        let sample = transport.sample().await.unwrap();
        assert_eq!(sample.track_id.as_deref(), Some("t1"));
        assert_eq!(sample.clock.position_secs, 61.0);

        // A second reload of the same track starts from the top.
        transport.handle_client_message(
            &second_id,
            parse(r#"{"type":"time_update","seq":4,"position_secs":75.0,"duration_secs":300.0,"paused":false}"#),
        );
        let (third, third_id) = attach(&transport);
        assert_eq!(third.last_of("load").unwrap()["position_secs"], 0.0);
        transport.handle_client_message(&third_id, parse(r#"{"type":"can_play","seq":4}"#));
        assert_eq!(seek_count(&third), 0);
    }

    #[actix_web::test]
    async fn paused_page_reload_starts_from_top() {
        let (transport, _rx) = make_transport();
        let (_first, first_id) = attach(&transport);
        transport.load("t1", 0.0, 2).await.unwrap();
        transport.handle_client_message(&first_id, parse(r#"{"type":"can_play","seq":2,"duration_secs":300.0}"#));
        transport.handle_client_message(
            &first_id,
            parse(r#"{"type":"time_update","seq":2,"position_secs":120.0,"duration_secs":300.0,"paused":true}"#),
        );
        transport.detach(&first_id);

        let (second, second_id) = attach(&transport);
        assert_eq!(second.last_of("load").unwrap()["position_secs"], 0.0);
        transport.handle_client_message(&second_id, parse(r#"{"type":"can_play","seq":2}"#));
        assert_eq!(seek_count(&second), 0);
        assert_eq!(transport.sample().await.unwrap().track_id.as_deref(), Some("t1"));
    }

    #[actix_web::test]
    async fn stale_and_foreign_messages_are_dropped() {
        let (transport, mut rx) = make_transport();
        let (_old, old_id) = attach(&transport);
        let (_sink, id) = attach(&transport);
        transport.load("t1", 0.0, 5).await.unwrap();
        transport.handle_client_message(&old_id, parse(r#"{"type":"ended","seq":5}"#));
        transport.handle_client_message(&id, parse(r#"{"type":"ended","seq":4}"#));
        transport.handle_client_message(
            &id,
            parse(r#"{"type":"time_update","seq":5,"position_secs":1.5,"duration_secs":100.0,"paused":false}"#),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 5);
        match event.kind {
            TransportEventKind::Sample(sample) => {
                assert_eq!(sample.position_secs, 1.5);
                assert!(sample.is_playing);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
