//! Browser websocket API for the playback page.

use std::sync::Arc;

use actix::prelude::*;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

use crate::state::AppState;
use crate::transport::browser::{BrowserClientMessage, BrowserOutbound, BrowserSink};

pub struct BrowserWs {
    session_id: Option<String>,
    state: web::Data<AppState>,
}

impl BrowserWs {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            session_id: None,
            state,
        }
    }

    fn handle_text(&self, text: &str) {
        let Some(session_id) = self.session_id.as_deref() else { return };
        match serde_json::from_str::<BrowserClientMessage>(text) {
            Ok(msg) => self.state.browser.handle_client_message(session_id, msg),
            Err(err) => {
                tracing::debug!(session_id = %session_id, error = %err, "browser: unreadable message");
            }
        }
    }
}

impl Actor for BrowserWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let sink: Arc<dyn BrowserSink> = Arc::new(ctx.address().recipient::<BrowserOutbound>());
        self.session_id = Some(self.state.browser.attach(sink));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session_id) = self.session_id.take() {
            self.state.browser.detach(&session_id);
        }
    }
}

impl Handler<BrowserOutbound> for BrowserWs {
    type Result = ();

    fn handle(&mut self, msg: BrowserOutbound, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for BrowserWs {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(msg) => msg,
            Err(_) => {
                ctx.stop();
                return;
            }
        };
        match msg {
            ws::Message::Text(text) => self.handle_text(&text),
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => {}
            ws::Message::Close(_) => ctx.stop(),
            ws::Message::Binary(_) => {}
            ws::Message::Continuation(_) => ctx.stop(),
            ws::Message::Nop => {}
        }
    }
}

#[get("/browser/ws")]
pub async fn browser_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    ws::start(BrowserWs::new(state), &req, stream)
}
