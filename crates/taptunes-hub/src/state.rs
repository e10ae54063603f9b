//! Shared application state.
//!
//! Handlers never touch the playback session directly: they submit commands
//! to the bus and read the published view.

use std::sync::Arc;

use taptunes_types::SessionView;
use tokio::sync::watch;

use crate::command_bus::CommandBus;
use crate::events::EventBus;
use crate::transport::browser::BrowserTransport;
use crate::triggers::ExternalCommandSource;

pub struct AppState {
    pub bus: CommandBus,
    pub view: watch::Receiver<SessionView>,
    pub browser: Arc<BrowserTransport>,
    pub triggers: ExternalCommandSource,
    pub events: EventBus,
}

impl AppState {
    pub fn new(
        bus: CommandBus,
        view: watch::Receiver<SessionView>,
        browser: Arc<BrowserTransport>,
        triggers: ExternalCommandSource,
        events: EventBus,
    ) -> Self {
        Self {
            bus,
            view,
            browser,
            triggers,
            events,
        }
    }

    /// Latest published session view.
    pub fn session(&self) -> SessionView {
        self.view.borrow().clone()
    }
}
