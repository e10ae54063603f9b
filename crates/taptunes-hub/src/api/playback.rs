//! Playback-related API handlers.
//!
//! Every control endpoint only enqueues a command; the outcome reflects what
//! the command bus did with it, not whether playback changed.

use actix_web::{get, post, web, HttpResponse, Responder};
use taptunes_types::SessionView;

use crate::command_bus::{Command, CommandKind, CommandSource, SubmitOutcome};
use crate::models::{
    CommandOutcome, CommandResponse, GestureBody, ModeBody, PlaylistBody, RepeatBody, SeekBody,
    ShuffleBody, VolumeBody,
};
use crate::state::AppState;

/// Map a bus outcome to the HTTP reply.
pub(crate) fn submit_response(outcome: SubmitOutcome) -> HttpResponse {
    match outcome {
        SubmitOutcome::Queued => HttpResponse::Accepted().json(CommandResponse {
            outcome: CommandOutcome::Queued,
        }),
        SubmitOutcome::Superseded => HttpResponse::Accepted().json(CommandResponse {
            outcome: CommandOutcome::Superseded,
        }),
        SubmitOutcome::Debounced => HttpResponse::TooManyRequests().json(CommandResponse {
            outcome: CommandOutcome::Debounced,
        }),
    }
}

fn submit_ui(
    state: &AppState,
    kind: CommandKind,
    gesture: bool,
    interaction: Option<u64>,
) -> HttpResponse {
    let cmd = Command::new(
        kind,
        CommandSource::Ui {
            gesture,
            interaction,
        },
    );
    submit_response(state.bus.submit(cmd))
}

fn gesture_of(body: Option<web::Json<GestureBody>>) -> bool {
    body.map(|b| b.gesture).unwrap_or(false)
}

#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Current session view", body = SessionView)
    )
)]
#[get("/session")]
/// Return the latest published session view.
pub async fn session(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.session())
}

#[utoipa::path(
    post,
    path = "/play",
    request_body(content = GestureBody, description = "Optional gesture flag"),
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/play")]
/// Start or resume playback.
pub async fn play(
    state: web::Data<AppState>,
    body: Option<web::Json<GestureBody>>,
) -> impl Responder {
    submit_ui(&state, CommandKind::Play, gesture_of(body), None)
}

#[utoipa::path(
    post,
    path = "/pause",
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/pause")]
/// Pause playback.
pub async fn pause(
    state: web::Data<AppState>,
    body: Option<web::Json<GestureBody>>,
) -> impl Responder {
    submit_ui(&state, CommandKind::Pause, gesture_of(body), None)
}

#[utoipa::path(
    post,
    path = "/toggle",
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/toggle")]
/// Toggle between playing and paused.
pub async fn toggle(
    state: web::Data<AppState>,
    body: Option<web::Json<GestureBody>>,
) -> impl Responder {
    submit_ui(&state, CommandKind::TogglePlayPause, gesture_of(body), None)
}

#[utoipa::path(
    post,
    path = "/stop",
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/stop")]
/// Stop playback and rewind.
pub async fn stop(
    state: web::Data<AppState>,
    body: Option<web::Json<GestureBody>>,
) -> impl Responder {
    submit_ui(&state, CommandKind::Stop, gesture_of(body), None)
}

#[utoipa::path(
    post,
    path = "/next",
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/next")]
/// Skip to the next track.
pub async fn next(
    state: web::Data<AppState>,
    body: Option<web::Json<GestureBody>>,
) -> impl Responder {
    submit_ui(&state, CommandKind::Next, gesture_of(body), None)
}

#[utoipa::path(
    post,
    path = "/previous",
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/previous")]
/// Go back to the previous track.
pub async fn previous(
    state: web::Data<AppState>,
    body: Option<web::Json<GestureBody>>,
) -> impl Responder {
    submit_ui(&state, CommandKind::Previous, gesture_of(body), None)
}

#[utoipa::path(
    post,
    path = "/seek",
    request_body = SeekBody,
    responses(
        (status = 202, description = "Seek queued or merged into a pending drag", body = CommandResponse)
    )
)]
#[post("/seek")]
/// Seek to an absolute position (seconds).
pub async fn seek(state: web::Data<AppState>, body: web::Json<SeekBody>) -> impl Responder {
    let body = body.into_inner();
    submit_ui(
        &state,
        CommandKind::Seek(body.position_secs),
        body.gesture,
        body.interaction,
    )
}

#[utoipa::path(
    post,
    path = "/volume",
    request_body = VolumeBody,
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse),
        (status = 400, description = "Neither volume nor delta given")
    )
)]
#[post("/volume")]
/// Set the volume (0-100) or step it.
pub async fn volume(state: web::Data<AppState>, body: web::Json<VolumeBody>) -> impl Responder {
    let kind = match (body.volume, body.delta) {
        (Some(volume), _) => CommandKind::SetVolume(volume.min(100)),
        (None, Some(delta)) => CommandKind::StepVolume(delta),
        (None, None) => return HttpResponse::BadRequest().body("volume or delta is required"),
    };
    submit_ui(&state, kind, body.gesture, None)
}

#[utoipa::path(
    post,
    path = "/mode",
    request_body = ModeBody,
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/mode")]
/// Move playback between the browser and the hardware player.
pub async fn mode(state: web::Data<AppState>, body: web::Json<ModeBody>) -> impl Responder {
    tracing::info!(mode = %body.mode, "mode switch request");
    submit_ui(&state, CommandKind::SetMode(body.mode), body.gesture, None)
}

#[utoipa::path(
    post,
    path = "/shuffle",
    request_body = ShuffleBody,
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/shuffle")]
pub async fn shuffle(state: web::Data<AppState>, body: web::Json<ShuffleBody>) -> impl Responder {
    submit_ui(&state, CommandKind::SetShuffle(body.shuffle), false, None)
}

#[utoipa::path(
    post,
    path = "/repeat",
    request_body = RepeatBody,
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse)
    )
)]
#[post("/repeat")]
pub async fn repeat(state: web::Data<AppState>, body: web::Json<RepeatBody>) -> impl Responder {
    submit_ui(&state, CommandKind::SetRepeat(body.repeat), false, None)
}

#[utoipa::path(
    post,
    path = "/playlist",
    request_body = PlaylistBody,
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse),
        (status = 400, description = "Empty track list")
    )
)]
#[post("/playlist")]
/// Replace the playlist and start playing it.
pub async fn playlist(state: web::Data<AppState>, body: web::Json<PlaylistBody>) -> impl Responder {
    let body = body.into_inner();
    if body.track_ids.is_empty() {
        return HttpResponse::BadRequest().body("track_ids must not be empty");
    }
    tracing::info!(
        playlist_id = ?body.playlist_id,
        tracks = body.track_ids.len(),
        "playlist request"
    );
    submit_ui(
        &state,
        CommandKind::LoadPlaylist {
            playlist_id: body.playlist_id,
            track_ids: body.track_ids,
            start_index: body.start_index,
        },
        body.gesture,
        None,
    )
}
