//! Physical trigger intake (GPIO buttons and RFID readers).
//!
//! Translates logical actions and card scans into bus commands. Owns the
//! card re-read cool-down; everything about playback is left to the
//! reconciler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::HttpResponse;
use taptunes_types::{LogicalAction, TriggerEvent};
use tokio::time::Instant;

use crate::command_bus::{Command, CommandBus, CommandKind, SubmitOutcome};
use crate::config::CardBinding;

/// Reader id used when a scan does not name one.
pub const DEFAULT_READER: &str = "rfid";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("unknown card: {0}")]
    UnknownCard(String),
    #[error("card id is required")]
    EmptyCardId,
}

impl TriggerError {
    /// Convert a trigger error into an HTTP response.
    pub fn into_response(self) -> HttpResponse {
        match self {
            TriggerError::UnknownCard(card_id) => {
                HttpResponse::NotFound().body(format!("unknown card: {card_id}"))
            }
            TriggerError::EmptyCardId => HttpResponse::BadRequest().body("card id is required"),
        }
    }
}

/// Resolves card ids to what they do.
pub trait CardCatalog: Send + Sync {
    fn resolve(&self, card_id: &str) -> Option<CardBinding>;
}

/// Card table loaded from configuration.
pub struct StaticCardCatalog {
    cards: HashMap<String, CardBinding>,
}

impl StaticCardCatalog {
    pub fn new(entries: Vec<(String, CardBinding)>) -> Self {
        Self {
            cards: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

impl CardCatalog for StaticCardCatalog {
    fn resolve(&self, card_id: &str) -> Option<CardBinding> {
        self.cards.get(card_id).cloned()
    }
}

/// Result of a card scan that resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Submitted(SubmitOutcome),
    /// Same card re-read on the same reader inside the cool-down.
    CoolingDown,
}

pub struct ExternalCommandSource {
    bus: CommandBus,
    catalog: Arc<dyn CardCatalog>,
    volume_step: u8,
    card_cooldown: Duration,
    last_reads: Mutex<HashMap<String, (String, Instant)>>,
}

impl ExternalCommandSource {
    pub fn new(
        bus: CommandBus,
        catalog: Arc<dyn CardCatalog>,
        volume_step: u8,
        card_cooldown: Duration,
    ) -> Self {
        Self {
            bus,
            catalog,
            volume_step,
            card_cooldown,
            last_reads: Mutex::new(HashMap::new()),
        }
    }

    /// Command a logical action stands for.
    pub fn command_for(&self, action: LogicalAction) -> CommandKind {
        let step = i16::from(self.volume_step);
        match action {
            LogicalAction::PlayPause => CommandKind::TogglePlayPause,
            LogicalAction::Next => CommandKind::Next,
            LogicalAction::Previous => CommandKind::Previous,
            LogicalAction::VolumeUp => CommandKind::StepVolume(step),
            LogicalAction::VolumeDown => CommandKind::StepVolume(-step),
        }
    }

    pub fn trigger(&self, event: TriggerEvent) -> SubmitOutcome {
        self.trigger_at(event, Instant::now())
    }

    pub fn trigger_at(&self, event: TriggerEvent, now: Instant) -> SubmitOutcome {
        let kind = self.command_for(event.logical_action);
        tracing::debug!(action = ?event.logical_action, origin = %event.origin_id, "trigger received");
        self.bus
            .submit(Command::physical(kind, event.origin_id).at(now))
    }

    pub fn scan_card(
        &self,
        card_id: &str,
        reader_id: Option<&str>,
    ) -> Result<ScanOutcome, TriggerError> {
        self.scan_card_at(card_id, reader_id, Instant::now())
    }

    pub fn scan_card_at(
        &self,
        card_id: &str,
        reader_id: Option<&str>,
        now: Instant,
    ) -> Result<ScanOutcome, TriggerError> {
        let card_id = card_id.trim();
        if card_id.is_empty() {
            return Err(TriggerError::EmptyCardId);
        }
        let binding = self.catalog.resolve(card_id).ok_or_else(|| {
            tracing::info!(card_id = %card_id, "rfid: unknown card");
            TriggerError::UnknownCard(card_id.to_string())
        })?;
        let reader = reader_id.unwrap_or(DEFAULT_READER);
        if self.is_cooling_down(reader, card_id, now) {
            tracing::debug!(card_id = %card_id, reader = %reader, "rfid: repeated read dropped");
            return Ok(ScanOutcome::CoolingDown);
        }

        let kind = match binding {
            CardBinding::Action(action) => self.command_for(action),
            CardBinding::Playlist {
                playlist_id,
                track_ids,
            } => CommandKind::LoadPlaylist {
                playlist_id: Some(playlist_id),
                track_ids,
                start_index: 0,
            },
        };
        tracing::info!(card_id = %card_id, reader = %reader, "rfid: card scanned");
        let origin = format!("{DEFAULT_READER}:{reader}");
        Ok(ScanOutcome::Submitted(
            self.bus.submit(Command::physical(kind, origin).at(now)),
        ))
    }

    /// Records the read and reports whether it repeats the last one.
    fn is_cooling_down(&self, reader: &str, card_id: &str, now: Instant) -> bool {
        let Ok(mut reads) = self.last_reads.lock() else {
            return false;
        };
        if let Some((last_card, at)) = reads.get(reader) {
            if last_card == card_id && now.saturating_duration_since(*at) < self.card_cooldown {
                return true;
            }
        }
        reads.insert(reader.to_string(), (card_id.to_string(), now));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(bus: &CommandBus) -> ExternalCommandSource {
        let catalog = StaticCardCatalog::new(vec![
            (
                "card-a".to_string(),
                CardBinding::Playlist {
                    playlist_id: "lullabies".to_string(),
                    track_ids: vec!["t1".to_string(), "t2".to_string()],
                },
            ),
            (
                "card-b".to_string(),
                CardBinding::Action(LogicalAction::Next),
            ),
        ]);
        ExternalCommandSource::new(
            bus.clone(),
            Arc::new(catalog),
            5,
            Duration::from_millis(1000),
        )
    }

    fn bus() -> CommandBus {
        CommandBus::new(64, Duration::from_millis(200))
    }

    #[test]
    fn logical_actions_map_to_commands() {
        let bus = bus();
        let source = source(&bus);
        assert_eq!(
            source.command_for(LogicalAction::PlayPause),
            CommandKind::TogglePlayPause
        );
        assert_eq!(
            source.command_for(LogicalAction::VolumeUp),
            CommandKind::StepVolume(5)
        );
        assert_eq!(
            source.command_for(LogicalAction::VolumeDown),
            CommandKind::StepVolume(-5)
        );
    }

    #[test]
    fn five_volume_taps_yield_one_command() {
        let bus = bus();
        let source = source(&bus);
        let now = Instant::now();
        let outcomes: Vec<_> = (0..5u64)
            .map(|i| {
                source.trigger_at(
                    TriggerEvent {
                        logical_action: LogicalAction::VolumeUp,
                        origin_id: "gpio-5".to_string(),
                    },
                    now + Duration::from_millis(i * 25),
                )
            })
            .collect();
        assert_eq!(outcomes[0], SubmitOutcome::Queued);
        assert!(outcomes[1..].iter().all(|o| *o == SubmitOutcome::Debounced));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn playlist_card_loads_playlist() {
        let bus = bus();
        let source = source(&bus);
        let outcome = source.scan_card("card-a", None).unwrap();
        assert_eq!(outcome, ScanOutcome::Submitted(SubmitOutcome::Queued));
        let cmd = bus.try_next().unwrap();
        assert_eq!(
            cmd.kind,
            CommandKind::LoadPlaylist {
                playlist_id: Some("lullabies".to_string()),
                track_ids: vec!["t1".to_string(), "t2".to_string()],
                start_index: 0,
            }
        );
    }

    #[test]
    fn unknown_card_is_rejected() {
        let bus = bus();
        let source = source(&bus);
        assert_eq!(
            source.scan_card("nope", Some("r1")),
            Err(TriggerError::UnknownCard("nope".to_string()))
        );
        assert_eq!(source.scan_card("  ", None), Err(TriggerError::EmptyCardId));
        assert!(bus.is_empty());
    }

    #[test]
    fn card_cooldown_is_per_reader() {
        let bus = bus();
        let source = source(&bus);
        let now = Instant::now();
        assert_eq!(
            source.scan_card_at("card-b", Some("r1"), now),
            Ok(ScanOutcome::Submitted(SubmitOutcome::Queued))
        );
        assert_eq!(
            source.scan_card_at("card-b", Some("r1"), now + Duration::from_millis(500)),
            Ok(ScanOutcome::CoolingDown)
        );
        assert_eq!(
            source.scan_card_at("card-b", Some("r2"), now + Duration::from_millis(500)),
            Ok(ScanOutcome::Submitted(SubmitOutcome::Queued))
        );
        assert_eq!(
            source.scan_card_at("card-b", Some("r1"), now + Duration::from_millis(1500)),
            Ok(ScanOutcome::Submitted(SubmitOutcome::Queued))
        );
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn different_card_on_same_reader_is_not_cooled_down() {
        let bus = bus();
        let source = source(&bus);
        let now = Instant::now();
        source.scan_card_at("card-a", None, now).unwrap();
        let outcome = source
            .scan_card_at("card-b", None, now + Duration::from_millis(300))
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Submitted(SubmitOutcome::Queued));
    }
}
