//! Configuration loading and parsing.
//!
//! Defines the hub config schema and resolves defaults.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use taptunes_types::{LogicalAction, PlaybackMode};

/// Top-level hub configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct HubConfig {
    /// Bind address (host:port).
    pub bind: Option<String>,
    /// Base URL the browser uses to fetch track audio.
    pub media_base_url: Option<String>,
    /// Reconciler and command bus tuning.
    pub playback: Option<PlaybackConfig>,
    /// Hardware playback device settings.
    pub hardware: Option<HardwareConfig>,
    /// External trigger settings.
    pub triggers: Option<TriggersConfig>,
    /// RFID card bindings.
    pub cards: Option<Vec<CardConfig>>,
}

/// `[playback]` section.
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackConfig {
    /// Transport that is authoritative at startup.
    pub initial_mode: Option<PlaybackMode>,
    /// Minimum spacing between identical physical commands (default: 200).
    pub debounce_ms: Option<u64>,
    /// Echo-suppression window after a local action (default: 200).
    pub suppress_ms: Option<u64>,
    /// Command queue bound (default: 64).
    pub queue_capacity: Option<usize>,
    /// Consecutive load failures before a track is skipped (default: 3).
    pub max_load_attempts: Option<u32>,
    /// Base backoff between load retries (default: 200).
    pub retry_backoff_ms: Option<u64>,
    /// Position above which a reload resumes with a seek (default: 5.0).
    pub resume_threshold_secs: Option<f64>,
    /// Volume change per physical volume press (default: 5).
    pub volume_step: Option<u8>,
    /// Volume at startup (default: 75).
    pub default_volume: Option<u8>,
    /// What tapping the card of the active playlist again does.
    pub repeat_tap: Option<RepeatTapPolicy>,
}

/// `[hardware]` section.
#[derive(Debug, Default, Deserialize)]
pub struct HardwareConfig {
    /// Device REST base URL (default: http://localhost:3001).
    pub base_url: Option<String>,
    /// State poll interval while playing (default: 1000).
    pub poll_interval_ms: Option<u64>,
    /// Per-request timeout (default: 5000).
    pub request_timeout_ms: Option<u64>,
    /// Attempts for one-shot device requests (default: 3).
    pub request_attempts: Option<usize>,
}

/// `[triggers]` section.
#[derive(Debug, Default, Deserialize)]
pub struct TriggersConfig {
    /// Window in which a re-read of the same card on the same reader is dropped (default: 1000).
    pub card_cooldown_ms: Option<u64>,
}

/// `[[cards]]` entry.
#[derive(Debug, Deserialize)]
pub struct CardConfig {
    /// Card id as reported by the reader.
    pub id: String,
    /// Logical action bound to the card.
    pub action: Option<LogicalAction>,
    /// Playlist id bound to the card.
    pub playlist: Option<String>,
    /// Track ids of the bound playlist.
    pub tracks: Option<Vec<String>>,
}

/// Behaviour when the card of the already-active playlist is tapped again.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatTapPolicy {
    #[default]
    TogglePause,
    Restart,
    Stop,
    Ignore,
}

/// Resolved reconciler/bus settings.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub initial_mode: PlaybackMode,
    pub debounce: Duration,
    pub suppress: Duration,
    pub queue_capacity: usize,
    pub max_load_attempts: u32,
    pub retry_backoff: Duration,
    pub resume_threshold_secs: f64,
    pub volume_step: u8,
    pub default_volume: u8,
    pub repeat_tap: RepeatTapPolicy,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            initial_mode: PlaybackMode::Browser,
            debounce: Duration::from_millis(200),
            suppress: Duration::from_millis(200),
            queue_capacity: 64,
            max_load_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            resume_threshold_secs: 5.0,
            volume_step: 5,
            default_volume: 75,
            repeat_tap: RepeatTapPolicy::TogglePause,
        }
    }
}

/// Resolved hardware transport settings.
#[derive(Debug, Clone)]
pub struct HardwareSettings {
    pub base_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub request_attempts: usize,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            poll_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(5000),
            request_attempts: 3,
        }
    }
}

/// A card id resolved to what it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardBinding {
    Action(LogicalAction),
    Playlist {
        playlist_id: String,
        track_ids: Vec<String>,
    },
}

impl HubConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<HubConfig>(raw)?)
    }
}

/// Parse an optional bind address from config.
pub fn bind_from_config(cfg: &HubConfig) -> Result<Option<SocketAddr>> {
    let Some(bind) = cfg.bind.as_deref() else {
        return Ok(None);
    };
    let addr = bind.parse().with_context(|| format!("parse bind {bind}"))?;
    Ok(Some(addr))
}

/// Derive the media base URL from config or bind address.
pub fn media_base_url_from_config(cfg: &HubConfig, bind: SocketAddr) -> Result<String> {
    if let Some(url) = cfg.media_base_url.as_ref() {
        return Ok(url.trim_end_matches('/').to_string());
    }

    if bind.ip().is_unspecified() {
        return Err(anyhow::anyhow!(
            "media_base_url is required when bind is 0.0.0.0"
        ));
    }

    Ok(format!("http://{}", bind))
}

/// Resolve playback settings, applying defaults and bounds.
pub fn playback_settings_from_config(cfg: &HubConfig) -> Result<PlaybackSettings> {
    let defaults = PlaybackSettings::default();
    let Some(p) = cfg.playback.as_ref() else {
        return Ok(defaults);
    };
    let queue_capacity = p.queue_capacity.unwrap_or(defaults.queue_capacity);
    if queue_capacity == 0 {
        return Err(anyhow::anyhow!("playback.queue_capacity must be at least 1"));
    }
    let resume_threshold_secs = p
        .resume_threshold_secs
        .unwrap_or(defaults.resume_threshold_secs);
    if !resume_threshold_secs.is_finite() || resume_threshold_secs < 0.0 {
        return Err(anyhow::anyhow!(
            "playback.resume_threshold_secs must be a non-negative number"
        ));
    }
    Ok(PlaybackSettings {
        initial_mode: p.initial_mode.unwrap_or(defaults.initial_mode),
        debounce: p
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.debounce),
        suppress: p
            .suppress_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.suppress),
        queue_capacity,
        max_load_attempts: p.max_load_attempts.unwrap_or(defaults.max_load_attempts).max(1),
        retry_backoff: p
            .retry_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff),
        resume_threshold_secs,
        volume_step: p.volume_step.unwrap_or(defaults.volume_step).min(100),
        default_volume: p.default_volume.unwrap_or(defaults.default_volume).min(100),
        repeat_tap: p.repeat_tap.unwrap_or(defaults.repeat_tap),
    })
}

/// Resolve hardware transport settings.
pub fn hardware_settings_from_config(cfg: &HubConfig) -> Result<HardwareSettings> {
    let defaults = HardwareSettings::default();
    let Some(h) = cfg.hardware.as_ref() else {
        return Ok(defaults);
    };
    if h.poll_interval_ms == Some(0) {
        return Err(anyhow::anyhow!("hardware.poll_interval_ms must be at least 1"));
    }
    if h.request_timeout_ms == Some(0) {
        return Err(anyhow::anyhow!("hardware.request_timeout_ms must be at least 1"));
    }
    Ok(HardwareSettings {
        base_url: h
            .base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url),
        poll_interval: h
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval),
        request_timeout: h
            .request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout),
        request_attempts: h.request_attempts.unwrap_or(defaults.request_attempts).max(1),
    })
}

/// Card re-read cool-down for the RFID source.
pub fn card_cooldown_from_config(cfg: &HubConfig) -> Duration {
    cfg.triggers
        .as_ref()
        .and_then(|t| t.card_cooldown_ms)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(1000))
}

/// Resolve card bindings, rejecting entries that bind nothing or both.
pub fn cards_from_config(cfg: &HubConfig) -> Result<Vec<(String, CardBinding)>> {
    let mut cards = Vec::new();
    for card in cfg.cards.iter().flatten() {
        let id = card.id.trim();
        if id.is_empty() {
            return Err(anyhow::anyhow!("card id must not be empty"));
        }
        let binding = match (card.action, card.playlist.as_ref()) {
            (Some(action), None) => CardBinding::Action(action),
            (None, Some(playlist)) => {
                let track_ids = card.tracks.clone().unwrap_or_default();
                if track_ids.is_empty() {
                    return Err(anyhow::anyhow!("card {id}: playlist {playlist} has no tracks"));
                }
                CardBinding::Playlist {
                    playlist_id: playlist.clone(),
                    track_ids,
                }
            }
            (Some(_), Some(_)) => {
                return Err(anyhow::anyhow!("card {id}: set either action or playlist, not both"));
            }
            (None, None) => {
                return Err(anyhow::anyhow!("card {id}: missing action or playlist"));
            }
        };
        cards.push((id.to_string(), binding));
    }
    Ok(cards)
}
