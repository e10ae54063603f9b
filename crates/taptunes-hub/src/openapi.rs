use utoipa::OpenApi;

use crate::api;
use crate::models;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::playback::session,
        api::playback::play,
        api::playback::pause,
        api::playback::toggle,
        api::playback::stop,
        api::playback::next,
        api::playback::previous,
        api::playback::seek,
        api::playback::volume,
        api::playback::mode,
        api::playback::shuffle,
        api::playback::repeat,
        api::playback::playlist,
        api::triggers::trigger,
        api::triggers::rfid_scan,
        api::streams::session_stream,
        api::health_check::health,
    ),
    components(
        schemas(
            models::GestureBody,
            models::SeekBody,
            models::VolumeBody,
            models::ModeBody,
            models::ShuffleBody,
            models::RepeatBody,
            models::PlaylistBody,
            models::CommandOutcome,
            models::CommandResponse,
            models::CardScanBody,
            api::health_check::HealthResponse,
            taptunes_types::SessionView,
            taptunes_types::PlaybackMode,
            taptunes_types::PlayerState,
            taptunes_types::RepeatMode,
            taptunes_types::TriggerEvent,
            taptunes_types::LogicalAction,
        )
    ),
    tags(
        (name = "taptunes-hub", description = "Playback reconciliation hub API")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_control_and_trigger_paths() {
        let doc = ApiDoc::openapi();
        for path in ["/session", "/play", "/seek", "/mode", "/triggers", "/rfid/scan", "/health"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
