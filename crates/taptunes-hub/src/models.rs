//! API request/response models.
//!
//! Defines serializable payloads used by the HTTP API and OpenAPI docs.

use serde::{Deserialize, Serialize};
use taptunes_types::{PlaybackMode, RepeatMode};
use utoipa::ToSchema;

/// Common UI flags for simple transport commands.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct GestureBody {
    /// True when issued from a click/tap handler.
    #[serde(default)]
    pub gesture: bool,
}

/// Seek request payload (seconds).
#[derive(Debug, Deserialize, ToSchema)]
pub struct SeekBody {
    pub position_secs: f64,
    /// Identifies an in-progress drag; later seeks of the same drag replace
    /// queued ones.
    pub interaction: Option<u64>,
    #[serde(default)]
    pub gesture: bool,
}

/// Volume request: either an absolute level or a relative step.
#[derive(Debug, Deserialize, ToSchema)]
pub struct VolumeBody {
    pub volume: Option<u8>,
    pub delta: Option<i16>,
    #[serde(default)]
    pub gesture: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ModeBody {
    pub mode: PlaybackMode,
    #[serde(default)]
    pub gesture: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ShuffleBody {
    pub shuffle: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RepeatBody {
    pub repeat: RepeatMode,
}

/// Replace the playlist context.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PlaylistBody {
    pub playlist_id: Option<String>,
    pub track_ids: Vec<String>,
    #[serde(default)]
    pub start_index: usize,
    #[serde(default)]
    pub gesture: bool,
}

/// How the command bus treated a submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Queued,
    Superseded,
    Debounced,
    /// Repeated card read dropped by the reader cool-down.
    CoolingDown,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommandResponse {
    pub outcome: CommandOutcome,
}

/// RFID scan report.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CardScanBody {
    #[serde(alias = "cardId")]
    pub card_id: String,
    #[serde(alias = "readerId")]
    pub reader_id: Option<String>,
}
