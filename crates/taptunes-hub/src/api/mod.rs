//! HTTP API handlers.
//!
//! Defines the Actix routes for playback control, triggers, session views,
//! and the browser page websocket.

pub mod browser;
pub mod health_check;
pub mod playback;
pub mod streams;
pub mod triggers;

pub use browser::browser_ws;
pub use health_check::health;
pub use playback::{
    mode,
    next,
    pause,
    play,
    playlist,
    previous,
    repeat,
    seek,
    session,
    shuffle,
    stop,
    toggle,
    volume,
};
pub use streams::session_stream;
pub use triggers::{rfid_scan, trigger};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use taptunes_types::SessionView;

    use crate::api;
    use crate::command_bus::{CommandBus, CommandKind, CommandSource};
    use crate::config::CardBinding;
    use crate::events::EventBus;
    use crate::models::{CommandOutcome, CommandResponse};
    use crate::state::AppState;
    use crate::transport::browser::BrowserTransport;
    use crate::transport::event_channel;
    use crate::triggers::{ExternalCommandSource, StaticCardCatalog};

    fn make_state() -> actix_web::web::Data<AppState> {
        let bus = CommandBus::new(64, Duration::from_millis(200));
        let (events_tx, _events_rx) = event_channel();
        let browser = Arc::new(BrowserTransport::new(
            events_tx,
            "http://localhost:8080".to_string(),
            Duration::from_secs(1),
            5.0,
        ));
        let catalog = StaticCardCatalog::new(vec![(
            "04a2".to_string(),
            CardBinding::Playlist {
                playlist_id: "bedtime".to_string(),
                track_ids: vec!["t1".to_string()],
            },
        )]);
        let triggers = ExternalCommandSource::new(
            bus.clone(),
            Arc::new(catalog),
            5,
            Duration::from_millis(1000),
        );
        let (_view_tx, view_rx) = tokio::sync::watch::channel(SessionView {
            volume: 75,
            ..SessionView::default()
        });
        let state = AppState::new(bus, view_rx, browser, triggers, EventBus::new());
        actix_web::web::Data::new(state)
    }

    #[actix_web::test]
    async fn session_returns_published_view() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::session)).await;
        let req = test::TestRequest::get().uri("/session").to_request();
        let view: SessionView = test::call_and_read_body_json(&app, req).await;
        assert_eq!(view.volume, 75);
        assert!(!view.pending_user_gesture);
    }

    #[actix_web::test]
    async fn play_with_gesture_is_queued_as_ui_gesture() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::play)).await;
        let req = test::TestRequest::post()
            .uri("/play")
            .set_json(serde_json::json!({ "gesture": true }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let cmd = state.bus.try_next().unwrap();
        assert_eq!(cmd.kind, CommandKind::Play);
        assert!(cmd.source.is_user_gesture());
    }

    #[actix_web::test]
    async fn play_without_body_is_not_a_gesture() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::play)).await;
        let req = test::TestRequest::post().uri("/play").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(!state.bus.try_next().unwrap().source.is_user_gesture());
    }

    #[actix_web::test]
    async fn seek_drag_supersedes_pending_seek() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::seek)).await;
        for (position, expected) in [(10.0, CommandOutcome::Queued), (42.0, CommandOutcome::Superseded)] {
            let req = test::TestRequest::post()
                .uri("/seek")
                .set_json(serde_json::json!({ "position_secs": position, "interaction": 7 }))
                .to_request();
            let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
            assert_eq!(resp.outcome, expected);
        }
        let cmd = state.bus.try_next().unwrap();
        assert_eq!(cmd.kind, CommandKind::Seek(42.0));
        assert!(state.bus.is_empty());
    }

    #[actix_web::test]
    async fn volume_requires_level_or_delta() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::volume)).await;
        let req = test::TestRequest::post()
            .uri("/volume")
            .set_json(serde_json::json!({}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/volume")
            .set_json(serde_json::json!({ "volume": 250 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(state.bus.try_next().unwrap().kind, CommandKind::SetVolume(100));
    }

    #[actix_web::test]
    async fn bouncing_button_is_rejected_with_429() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::trigger)).await;
        let body = serde_json::json!({ "logical_action": "next", "origin_id": "gpio-23" });
        let req = test::TestRequest::post().uri("/triggers").set_json(&body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let req = test::TestRequest::post().uri("/triggers").set_json(&body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let cmd = state.bus.try_next().unwrap();
        assert_eq!(cmd.kind, CommandKind::Next);
        assert_eq!(
            cmd.source,
            CommandSource::Physical {
                origin: "gpio-23".to_string()
            }
        );
    }

    #[actix_web::test]
    async fn rfid_scan_known_and_unknown_cards() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::rfid_scan)).await;
        let req = test::TestRequest::post()
            .uri("/rfid/scan")
            .set_json(serde_json::json!({ "cardId": "04a2" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: CommandResponse = test::read_body_json(resp).await;
        assert_eq!(body.outcome, CommandOutcome::Queued);

        let req = test::TestRequest::post()
            .uri("/rfid/scan")
            .set_json(serde_json::json!({ "card_id": "04a2" }))
            .to_request();
        let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.outcome, CommandOutcome::CoolingDown);

        let req = test::TestRequest::post()
            .uri("/rfid/scan")
            .set_json(serde_json::json!({ "card_id": "ffff" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn empty_playlist_is_rejected() {
        let state = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(api::playlist)).await;
        let req = test::TestRequest::post()
            .uri("/playlist")
            .set_json(serde_json::json!({ "track_ids": [] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.bus.is_empty());
    }

    #[actix_web::test]
    async fn health_reports_build_info() {
        let app = test::init_service(App::new().service(api::health)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert!(body["git_sha"].is_string());
    }
}
