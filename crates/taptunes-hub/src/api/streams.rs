//! Server-sent event streams.

use std::collections::VecDeque;
use std::time::Instant;

use actix_web::{get, web, Error, HttpResponse, Responder};
use actix_web::http::header;
use actix_web::web::Bytes;
use futures_util::{Stream, stream::unfold};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, Interval, MissedTickBehavior};

use crate::events::HubEvent;
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(15);

struct SessionStreamState {
    state: web::Data<AppState>,
    receiver: broadcast::Receiver<HubEvent>,
    interval: Interval,
    pending: VecDeque<Bytes>,
    last_session: Option<String>,
    last_ping: Instant,
}

pub(crate) fn sse_event(event: &str, data: &str) -> Bytes {
    let mut payload = String::new();
    payload.push_str("event: ");
    payload.push_str(event);
    payload.push('\n');
    for line in data.lines() {
        payload.push_str("data: ");
        payload.push_str(line);
        payload.push('\n');
    }
    payload.push('\n');
    Bytes::from(payload)
}

fn push_ping_if_needed(pending: &mut VecDeque<Bytes>, last_ping: &mut Instant) {
    if pending.is_empty() && last_ping.elapsed() >= PING_INTERVAL {
        *last_ping = Instant::now();
        pending.push_back(Bytes::from(": ping\n\n"));
    }
}

enum StreamSignal<E> {
    Tick,
    Event(Result<E, RecvError>),
}

async fn recv_signal<E: Clone>(
    receiver: &mut broadcast::Receiver<E>,
    interval: &mut Interval,
) -> StreamSignal<E> {
    tokio::select! {
        _ = interval.tick() => StreamSignal::Tick,
        result = receiver.recv() => StreamSignal::Event(result),
    }
}

fn sse_response<S>(stream: S) -> HttpResponse
where
    S: Stream<Item = Result<Bytes, Error>> + 'static,
{
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(stream)
}

impl SessionStreamState {
    /// Queue the current view unless it matches the last one sent.
    fn push_session_if_changed(&mut self) {
        let json = serde_json::to_string(&self.state.session()).unwrap_or_else(|_| "null".to_string());
        if self.last_session.as_deref() != Some(json.as_str()) {
            self.pending.push_back(sse_event("session", &json));
            self.last_session = Some(json);
        }
    }
}

#[utoipa::path(
    get,
    path = "/session/stream",
    responses(
        (status = 200, description = "Session and notice event stream")
    )
)]
#[get("/session/stream")]
/// Stream session views and skip notices via server-sent events.
pub async fn session_stream(state: web::Data<AppState>) -> impl Responder {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let receiver = state.events.subscribe();

    let mut initial = SessionStreamState {
        state: state.clone(),
        receiver,
        interval,
        pending: VecDeque::new(),
        last_session: None,
        last_ping: Instant::now(),
    };
    initial.push_session_if_changed();

    let stream = unfold(initial, |mut ctx| async move {
        loop {
            if let Some(bytes) = ctx.pending.pop_front() {
                return Some((Ok::<Bytes, Error>(bytes), ctx));
            }

            match recv_signal(&mut ctx.receiver, &mut ctx.interval).await {
                StreamSignal::Tick => {}
                StreamSignal::Event(result) => match result {
                    Ok(HubEvent::SessionChanged) => ctx.push_session_if_changed(),
                    Ok(HubEvent::Notice(message)) => {
                        let json = serde_json::json!({ "message": message }).to_string();
                        ctx.pending.push_back(sse_event("notice", &json));
                    }
                    Err(RecvError::Lagged(_)) => ctx.push_session_if_changed(),
                    Err(RecvError::Closed) => return None,
                },
            }

            push_ping_if_needed(&mut ctx.pending, &mut ctx.last_ping);
        }
    });

    sse_response(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_event_prefixes_every_line() {
        let bytes = sse_event("session", "{\"a\":1}\n{\"b\":2}");
        assert_eq!(
            bytes,
            Bytes::from("event: session\ndata: {\"a\":1}\ndata: {\"b\":2}\n\n")
        );
    }

    #[test]
    fn ping_only_when_idle_and_due() {
        let mut pending = VecDeque::new();
        let mut last_ping = Instant::now();
        push_ping_if_needed(&mut pending, &mut last_ping);
        assert!(pending.is_empty());

        let mut stale = Instant::now() - PING_INTERVAL;
        pending.push_back(Bytes::from("x"));
        push_ping_if_needed(&mut pending, &mut stale);
        assert_eq!(pending.len(), 1);

        pending.clear();
        push_ping_if_needed(&mut pending, &mut stale);
        assert_eq!(pending.pop_front(), Some(Bytes::from(": ping\n\n")));
    }
}
