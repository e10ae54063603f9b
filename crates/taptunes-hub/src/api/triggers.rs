//! Physical trigger endpoints (GPIO service and RFID reader).

use actix_web::{post, web, HttpResponse, Responder};
use taptunes_types::TriggerEvent;

use crate::command_bus::SubmitOutcome;
use crate::models::{CardScanBody, CommandOutcome, CommandResponse};
use crate::state::AppState;
use crate::triggers::ScanOutcome;

use super::playback::submit_response;

#[utoipa::path(
    post,
    path = "/triggers",
    request_body = TriggerEvent,
    responses(
        (status = 202, description = "Command accepted", body = CommandResponse),
        (status = 429, description = "Debounced as button bounce", body = CommandResponse)
    )
)]
#[post("/triggers")]
/// Submit a logical action from a physical button.
pub async fn trigger(state: web::Data<AppState>, body: web::Json<TriggerEvent>) -> impl Responder {
    submit_response(state.triggers.trigger(body.into_inner()))
}

#[utoipa::path(
    post,
    path = "/rfid/scan",
    request_body = CardScanBody,
    responses(
        (status = 200, description = "Card command accepted", body = CommandResponse),
        (status = 400, description = "Missing card id"),
        (status = 404, description = "Unknown card"),
        (status = 429, description = "Repeated read dropped", body = CommandResponse)
    )
)]
#[post("/rfid/scan")]
/// Resolve a scanned card and submit what it stands for. Readers only treat
/// 200 as success.
pub async fn rfid_scan(state: web::Data<AppState>, body: web::Json<CardScanBody>) -> impl Responder {
    match state
        .triggers
        .scan_card(&body.card_id, body.reader_id.as_deref())
    {
        Ok(ScanOutcome::Submitted(SubmitOutcome::Queued)) => HttpResponse::Ok().json(CommandResponse {
            outcome: CommandOutcome::Queued,
        }),
        Ok(ScanOutcome::Submitted(outcome)) => submit_response(outcome),
        Ok(ScanOutcome::CoolingDown) => HttpResponse::TooManyRequests().json(CommandResponse {
            outcome: CommandOutcome::CoolingDown,
        }),
        Err(err) => err.into_response(),
    }
}
