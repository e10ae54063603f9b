//! Actix server startup + app wiring.
//!
//! Builds the transports, the reconciler task, shared state, routes,
//! middleware, and OpenAPI endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_cors::Cors;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse};
use actix_web::Error;
use actix_web::{web, App, HttpServer};
use anyhow::{Context as _, Result};
use futures_util::future::{ok, LocalBoxFuture, Ready};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api;
use crate::command_bus::CommandBus;
use crate::config;
use crate::events::EventBus;
use crate::openapi;
use crate::reconciler::Reconciler;
use crate::state::AppState;
use crate::transport::browser::BrowserTransport;
use crate::transport::hardware::HardwareTransport;
use crate::transport::{event_channel, PlaybackTransport};
use crate::triggers::{ExternalCommandSource, StaticCardCatalog};

/// Build hub state, start the reconciler, and run the HTTP server.
pub(crate) async fn run(args: crate::Args) -> Result<()> {
    let cfg = load_config(args.config.as_ref())?;
    let bind = resolve_bind(args.bind, &cfg)?;
    let media_base_url = config::media_base_url_from_config(&cfg, bind)?;
    let playback = config::playback_settings_from_config(&cfg)?;
    let hardware = config::hardware_settings_from_config(&cfg)?;
    let catalog = StaticCardCatalog::new(config::cards_from_config(&cfg)?);

    tracing::info!(
        bind = %bind,
        media_base_url = %media_base_url,
        hardware = %hardware.base_url,
        initial_mode = %playback.initial_mode,
        cards = catalog.len(),
        git_sha = env!("GIT_SHA"),
        build_date = env!("BUILD_DATE"),
        "starting taptunes-hub"
    );
    if catalog.is_empty() {
        tracing::warn!("no RFID cards configured; card scans will be rejected");
    }

    let events = EventBus::new();
    let bus = CommandBus::new(playback.queue_capacity, playback.debounce);
    let (transport_tx, transport_rx) = event_channel();

    let browser = Arc::new(BrowserTransport::new(
        transport_tx.clone(),
        media_base_url,
        hardware.request_timeout,
        playback.resume_threshold_secs,
    ));
    let hardware_transport = HardwareTransport::start(&hardware, transport_tx, playback.retry_backoff)
        .context("start hardware transport")?;

    let (reconciler, view_rx) = Reconciler::new(
        playback.clone(),
        browser.clone() as Arc<dyn PlaybackTransport>,
        hardware_transport as Arc<dyn PlaybackTransport>,
        hardware.request_timeout,
        events.clone(),
    );
    actix_web::rt::spawn(reconciler.run(bus.clone(), transport_rx));

    let triggers = ExternalCommandSource::new(
        bus.clone(),
        Arc::new(catalog),
        playback.volume_step,
        config::card_cooldown_from_config(&cfg),
    );

    let state = web::Data::new(AppState::new(bus, view_rx, browser, triggers, events));

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allowed_methods(vec!["GET", "POST", "HEAD"])
            .allowed_headers(vec![actix_web::http::header::CONTENT_TYPE])
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(cors)
            .wrap(FilteredLogger)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-doc/openapi.json", openapi::ApiDoc::openapi()),
            )
            .service(api::health)
            .service(api::session)
            .service(api::session_stream)
            .service(api::play)
            .service(api::pause)
            .service(api::toggle)
            .service(api::stop)
            .service(api::next)
            .service(api::previous)
            .service(api::seek)
            .service(api::volume)
            .service(api::mode)
            .service(api::shuffle)
            .service(api::repeat)
            .service(api::playlist)
            .service(api::trigger)
            .service(api::rfid_scan)
            .service(api::browser_ws)
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}

/// Return true when the request path should be logged.
fn should_log_path(path: &str) -> bool {
    !matches!(path, "/session/stream" | "/browser/ws" | "/health")
}

/// Actix middleware that filters noisy paths from logging.
struct FilteredLogger;

impl<S, B> actix_web::dev::Transform<S, ServiceRequest> for FilteredLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = FilteredLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(FilteredLoggerMiddleware { service })
    }
}

struct FilteredLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for FilteredLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path().to_string();
        let should_log = should_log_path(&path);
        let method = req.method().clone();
        let peer = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("-")
            .to_string();
        let start = std::time::Instant::now();
        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            if should_log {
                tracing::info!(
                    method = %method,
                    path = %path,
                    status = %res.status().as_u16(),
                    peer = %peer,
                    elapsed_ms = %start.elapsed().as_millis(),
                    "http request"
                );
            }
            Ok(res)
        })
    }
}

/// Load hub config from `--config` or `config.toml` beside the executable.
/// Without either, every setting takes its default.
fn load_config(path: Option<&PathBuf>) -> Result<config::HubConfig> {
    if let Some(path) = path {
        return config::HubConfig::load(path);
    }
    let auto_path = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")));
    match auto_path {
        Some(path) if path.exists() => config::HubConfig::load(&path),
        _ => {
            tracing::warn!("no config file found; using defaults");
            Ok(config::HubConfig::default())
        }
    }
}

/// Resolve the final bind address from args + config.
fn resolve_bind(
    bind: Option<std::net::SocketAddr>,
    cfg: &config::HubConfig,
) -> Result<std::net::SocketAddr> {
    if let Some(addr) = bind {
        return Ok(addr);
    }
    Ok(config::bind_from_config(cfg)?.unwrap_or_else(|| {
        std::net::SocketAddr::from(([127, 0, 0, 1], 8080))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_paths_are_not_logged() {
        assert!(!should_log_path("/session/stream"));
        assert!(!should_log_path("/browser/ws"));
        assert!(should_log_path("/play"));
        assert!(should_log_path("/rfid/scan"));
    }

    #[test]
    fn cli_bind_overrides_config() {
        let cfg = config::HubConfig::parse("bind = \"0.0.0.0:9000\"").unwrap();
        let cli: std::net::SocketAddr = "127.0.0.1:7000".parse().unwrap();
        assert_eq!(resolve_bind(Some(cli), &cfg).unwrap(), cli);
        assert_eq!(
            resolve_bind(None, &cfg).unwrap(),
            "0.0.0.0:9000".parse::<std::net::SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_bind(None, &config::HubConfig::default()).unwrap().port(),
            8080
        );
    }
}
