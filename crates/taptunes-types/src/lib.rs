use serde::{Deserialize, Serialize};

/// Reason why playback ended on the device side.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Decoder, transport, or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// State query response reported by the hardware playback device.
///
/// Positions are in seconds; a `duration_secs` of `0.0` marks a live stream.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeviceStatus {
    /// `true` while the device is actively playing.
    pub is_playing: bool,
    /// Current playback position in seconds.
    #[serde(default)]
    pub position_secs: f64,
    /// Duration of the loaded track in seconds.
    #[serde(default)]
    pub duration_secs: f64,
    /// Track currently loaded on the device, if any.
    pub current_track_id: Option<String>,
    /// Output volume (0-100), if the device reports it.
    #[serde(default)]
    pub volume: Option<u8>,
    /// End reason when playback transitions to idle.
    #[serde(default)]
    pub end_reason: Option<PlaybackEndReason>,
}

/// Which transport is authoritative for playback.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// The in-page media element of the attached browser.
    #[default]
    Browser,
    /// The physical playback device driven over HTTP.
    Hardware,
}

impl PlaybackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackMode::Browser => "browser",
            PlaybackMode::Hardware => "hardware",
        }
    }
}

impl std::fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repeat mode for the playlist context.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Stop when the playlist ends.
    #[default]
    Off,
    /// Replay the current track.
    One,
    /// Wrap around to the first track.
    All,
}

/// Reconciler state exposed to clients.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// Nothing loaded.
    #[default]
    Idle,
    /// A track load was issued and has not started yet.
    Loading,
    Playing,
    Paused,
    /// The playlist finished.
    Ended,
    /// Playback start was rejected by the browser autoplay policy.
    AutoplayBlocked,
    /// Authority is moving between transports.
    ModeSwitching,
}

/// Read-only snapshot of the playback session published to UI clients.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionView {
    /// Authoritative transport.
    pub mode: PlaybackMode,
    pub state: PlayerState,
    /// Track that should be playing.
    pub current_track_id: Option<String>,
    /// Playlist id when the context came from a playlist (e.g. an RFID card).
    pub playlist_id: Option<String>,
    /// Ordered track ids of the playlist context.
    pub track_ids: Vec<String>,
    /// Index of the current track within `track_ids`.
    pub index: Option<usize>,
    pub is_playing: bool,
    pub position_secs: f64,
    /// `0.0` when unknown or for live streams.
    pub duration_secs: f64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    /// Output volume (0-100).
    pub volume: u8,
    /// `true` when a tap on a "resume audio" prompt is needed.
    pub pending_user_gesture: bool,
    /// Recoverable transport error, if any.
    pub last_error: Option<String>,
    /// Transient notice (e.g. a skipped track).
    pub notice: Option<String>,
    /// `true` while the command queue is shedding commands.
    pub degraded: bool,
    /// Monotonic transition counter; changes on every load and mode switch.
    pub transition_seq: u64,
}

/// Logical action produced by a physical trigger (RFID card or GPIO button).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum LogicalAction {
    PlayPause,
    Next,
    Previous,
    VolumeUp,
    VolumeDown,
}

/// Normalized trigger event delivered by an external command source.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TriggerEvent {
    pub logical_action: LogicalAction,
    /// Physical origin (e.g. `gpio:23`, `rfid:reader-1`).
    pub origin_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_status_defaults_missing_fields() {
        let status: DeviceStatus = serde_json::from_str(r#"{"is_playing":true}"#).unwrap();
        assert!(status.is_playing);
        assert_eq!(status.position_secs, 0.0);
        assert!(status.current_track_id.is_none());
        assert!(status.end_reason.is_none());
    }

    #[test]
    fn trigger_event_uses_snake_case_actions() {
        let event: TriggerEvent =
            serde_json::from_str(r#"{"logical_action":"volume_up","origin_id":"gpio:5"}"#)
                .unwrap();
        assert_eq!(event.logical_action, LogicalAction::VolumeUp);
        assert_eq!(event.origin_id, "gpio:5");
    }

    #[test]
    fn session_view_serializes_mode_and_state() {
        let view = SessionView {
            mode: PlaybackMode::Hardware,
            state: PlayerState::AutoplayBlocked,
            ..SessionView::default()
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["mode"], "hardware");
        assert_eq!(json["state"], "autoplay_blocked");
    }
}
