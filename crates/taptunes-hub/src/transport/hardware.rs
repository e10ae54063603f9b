//! Hardware player transport.
//!
//! The device is driven over its REST API and polled for state at a fixed
//! interval while it is believed to be playing. Nothing is assumed to have
//! taken effect until a poll confirms it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use taptunes_types::{DeviceStatus, PlaybackEndReason, PlaybackMode};

use super::{
    PlaybackTransport, TransportError, TransportEvent, TransportEventKind, TransportEventSender,
    TransportSample, with_retry,
};
use crate::clock::{ClockSample, PlaybackClock};
use crate::config::HardwareSettings;

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    track_id: &'a str,
    position_secs: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Play,
    Pause,
    Seek,
    Next,
    Previous,
}

#[derive(Debug, Serialize)]
struct TransportRequest {
    action: DeviceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    position_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
struct VolumeRequest {
    volume: u8,
}

/// HTTP client for the device REST API.
#[derive(Clone)]
pub struct HardwareClient {
    base_url: String,
    client: Client,
}

impl HardwareClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build hardware http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Ask the device to prepare a track. 404 means it does not know it.
    pub async fn load(&self, track_id: &str, position_secs: f64) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(self.url("/load"))
            .json(&LoadRequest {
                track_id,
                position_secs,
            })
            .send()
            .await
            .map_err(|e| map_reqwest("load", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::UnknownTrack(track_id.to_string()));
        }
        check_status("load", resp.status())
    }

    pub async fn transport(
        &self,
        action: DeviceAction,
        position_secs: Option<f64>,
    ) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(self.url("/transport"))
            .json(&TransportRequest {
                action,
                position_secs,
            })
            .send()
            .await
            .map_err(|e| map_reqwest("transport", e))?;
        check_status("transport", resp.status())
    }

    pub async fn volume(&self, volume: u8) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(self.url("/volume"))
            .json(&VolumeRequest { volume })
            .send()
            .await
            .map_err(|e| map_reqwest("volume", e))?;
        check_status("volume", resp.status())
    }

    pub async fn state(&self) -> Result<DeviceStatus, TransportError> {
        let resp = self
            .client
            .get(self.url("/state"))
            .send()
            .await
            .map_err(|e| map_reqwest("state", e))?;
        check_status("state", resp.status())?;
        resp.json::<DeviceStatus>()
            .await
            .map_err(|e| TransportError::Unavailable(format!("http state decode failed: {e}")))
    }
}

fn map_reqwest(op: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Unavailable(format!("http {op} failed: {err}"))
    }
}

fn check_status(op: &str, status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Unavailable(format!(
            "http {op} failed with status {status}"
        )))
    }
}

pub struct HardwareTransport {
    client: HardwareClient,
    events: TransportEventSender,
    clock: PlaybackClock,
    seq: AtomicU64,
    track_id: Mutex<Option<String>>,
    polling: AtomicBool,
    attempts: usize,
    backoff: Duration,
}

impl HardwareTransport {
    pub fn new(
        client: HardwareClient,
        events: TransportEventSender,
        attempts: usize,
        backoff: Duration,
    ) -> Self {
        Self {
            client,
            events,
            clock: PlaybackClock::new(),
            seq: AtomicU64::new(0),
            track_id: Mutex::new(None),
            polling: AtomicBool::new(false),
            attempts,
            backoff,
        }
    }

    /// Build the transport and start its poller.
    pub fn start(
        settings: &HardwareSettings,
        events: TransportEventSender,
        backoff: Duration,
    ) -> Result<Arc<Self>> {
        let client = HardwareClient::new(&settings.base_url, settings.request_timeout)?;
        let transport = Arc::new(Self::new(
            client,
            events,
            settings.request_attempts,
            backoff,
        ));
        spawn_poller(Arc::downgrade(&transport), settings.poll_interval);
        tracing::info!(
            base_url = %settings.base_url,
            poll_ms = settings.poll_interval.as_millis() as u64,
            "hardware: transport ready"
        );
        Ok(transport)
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            mode: PlaybackMode::Hardware,
            seq: self.seq.load(Ordering::SeqCst),
            kind,
        });
    }

    fn set_track(&self, track_id: Option<String>) {
        if let Ok(mut current) = self.track_id.lock() {
            *current = track_id;
        }
    }

    /// One poll cycle; does nothing unless the device is believed playing.
    pub async fn poll_once(&self) {
        if !self.is_polling() {
            return;
        }
        match self.client.state().await {
            Ok(status) => self.apply_status(&status),
            Err(err) => {
                self.polling.store(false, Ordering::SeqCst);
                tracing::warn!(error = %err, "hardware: poll failed; polling stopped");
                self.emit(TransportEventKind::Error(err.to_string()));
            }
        }
    }

    fn apply_status(&self, status: &DeviceStatus) {
        if status.end_reason == Some(PlaybackEndReason::Eof) && !status.is_playing {
            self.polling.store(false, Ordering::SeqCst);
            let latest = self.clock.latest();
            self.clock
                .observe(latest.duration_secs, latest.duration_secs, false);
            tracing::debug!(track_id = ?status.current_track_id, "hardware: track ended");
            self.emit(TransportEventKind::Ended);
            return;
        }
        if !status.is_playing {
            self.polling.store(false, Ordering::SeqCst);
        }
        if let Some(sample) =
            self.clock
                .observe(status.position_secs, status.duration_secs, status.is_playing)
        {
            self.emit(TransportEventKind::Sample(sample));
        }
    }
}

fn spawn_poller(transport: Weak<HardwareTransport>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(transport) = transport.upgrade() else {
                break;
            };
            transport.poll_once().await;
        }
        tracing::debug!("hardware: poller stopped");
    });
}

#[async_trait]
impl PlaybackTransport for HardwareTransport {
    fn mode(&self) -> PlaybackMode {
        PlaybackMode::Hardware
    }

    /// One device request per call. Load retries belong to the reconciler,
    /// which counts them toward skipping the track.
    async fn load(&self, track_id: &str, start_at: f64, seq: u64) -> Result<(), TransportError> {
        self.seq.store(seq, Ordering::SeqCst);
        self.polling.store(false, Ordering::SeqCst);
        self.client.load(track_id, start_at).await?;
        self.set_track(Some(track_id.to_string()));
        self.clock.reset(start_at);
        self.emit(TransportEventKind::CanPlay);
        Ok(())
    }

    async fn play(&self) -> Result<(), TransportError> {
        with_retry("play", self.attempts, self.backoff, || {
            self.client.transport(DeviceAction::Play, None)
        })
        .await?;
        self.polling.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) -> Result<(), TransportError> {
        with_retry("pause", self.attempts, self.backoff, || {
            self.client.transport(DeviceAction::Pause, None)
        })
        .await?;
        self.polling.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn seek(&self, position_secs: f64) -> Result<(), TransportError> {
        with_retry("seek", self.attempts, self.backoff, || {
            self.client
                .transport(DeviceAction::Seek, Some(position_secs))
        })
        .await
    }

    async fn set_volume(&self, volume: u8) -> Result<(), TransportError> {
        with_retry("volume", self.attempts, self.backoff, || {
            self.client.volume(volume)
        })
        .await
    }

    async fn sample(&self) -> Result<TransportSample, TransportError> {
        let status = self.client.state().await?;
        let clock = ClockSample::normalized(
            status.position_secs,
            status.duration_secs,
            status.is_playing,
        );
        self.clock
            .observe(clock.position_secs, clock.duration_secs, clock.is_playing);
        if status.is_playing {
            self.polling.store(true, Ordering::SeqCst);
        }
        let track_id = status.current_track_id.or_else(|| {
            self.track_id
                .lock()
                .ok()
                .and_then(|current| current.clone())
        });
        Ok(TransportSample { track_id, clock })
    }
}
