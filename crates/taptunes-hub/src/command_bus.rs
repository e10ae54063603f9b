//! Command funnel shared by UI, hardware callbacks, and physical triggers.
//!
//! Orders commands FIFO, debounces physical bounce per origin, coalesces
//! interactive seek drags, and sheds load when the queue overflows.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use taptunes_types::{PlaybackMode, RepeatMode};
use tokio::sync::Notify;
use tokio::time::Instant;

/// What a command asks the reconciler to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Play,
    Pause,
    /// Play when paused, pause when playing (GPIO play/pause button).
    TogglePlayPause,
    Stop,
    Next,
    Previous,
    /// Absolute position in seconds.
    Seek(f64),
    SetVolume(u8),
    /// Relative volume change (physical volume buttons).
    StepVolume(i16),
    SetMode(PlaybackMode),
    SetShuffle(bool),
    SetRepeat(RepeatMode),
    /// Replace the playlist context and start playing it.
    LoadPlaylist {
        playlist_id: Option<String>,
        track_ids: Vec<String>,
        start_index: usize,
    },
}

impl CommandKind {
    /// Key used to decide whether two physical commands are "identical".
    pub fn debounce_key(&self) -> String {
        match self {
            CommandKind::Play => "play".to_string(),
            CommandKind::Pause => "pause".to_string(),
            CommandKind::TogglePlayPause => "play_pause".to_string(),
            CommandKind::Stop => "stop".to_string(),
            CommandKind::Next => "next".to_string(),
            CommandKind::Previous => "previous".to_string(),
            CommandKind::Seek(_) => "seek".to_string(),
            CommandKind::SetVolume(_) => "set_volume".to_string(),
            CommandKind::StepVolume(delta) if *delta >= 0 => "volume_up".to_string(),
            CommandKind::StepVolume(_) => "volume_down".to_string(),
            CommandKind::SetMode(mode) => format!("mode:{mode}"),
            CommandKind::SetShuffle(_) => "shuffle".to_string(),
            CommandKind::SetRepeat(_) => "repeat".to_string(),
            CommandKind::LoadPlaylist { playlist_id, .. } => {
                format!("playlist:{}", playlist_id.as_deref().unwrap_or("-"))
            }
        }
    }

    pub fn is_seek(&self) -> bool {
        matches!(self, CommandKind::Seek(_))
    }
}

/// Where a command came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    /// On-screen control. `gesture` is set when issued from a click/tap
    /// handler; `interaction` identifies an in-progress seek drag.
    Ui {
        gesture: bool,
        interaction: Option<u64>,
    },
    /// RFID reader or GPIO button, identified by its origin id.
    Physical { origin: String },
    /// Generated by the hub itself (startup resume, housekeeping).
    Synthetic,
}

impl CommandSource {
    /// True when the command proves a genuine user gesture.
    pub fn is_user_gesture(&self) -> bool {
        matches!(self, CommandSource::Ui { gesture: true, .. })
    }

    pub fn label(&self) -> String {
        match self {
            CommandSource::Ui { .. } => "ui".to_string(),
            CommandSource::Physical { origin } => format!("physical:{origin}"),
            CommandSource::Synthetic => "synthetic".to_string(),
        }
    }
}

/// A single playback request.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub source: CommandSource,
    pub issued_at: Instant,
}

impl Command {
    pub fn new(kind: CommandKind, source: CommandSource) -> Self {
        Self {
            kind,
            source,
            issued_at: Instant::now(),
        }
    }

    /// UI command; `gesture` marks click/tap handlers.
    pub fn ui(kind: CommandKind, gesture: bool) -> Self {
        Self::new(
            kind,
            CommandSource::Ui {
                gesture,
                interaction: None,
            },
        )
    }

    pub fn physical(kind: CommandKind, origin: impl Into<String>) -> Self {
        Self::new(
            kind,
            CommandSource::Physical {
                origin: origin.into(),
            },
        )
    }

    pub fn synthetic(kind: CommandKind) -> Self {
        Self::new(kind, CommandSource::Synthetic)
    }

    pub fn at(mut self, issued_at: Instant) -> Self {
        self.issued_at = issued_at;
        self
    }
}

/// Result of submitting a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Rejected as physical bounce.
    Debounced,
    /// Replaced a pending seek of the same drag.
    Superseded,
}

struct CommandQueue {
    items: VecDeque<Command>,
    capacity: usize,
    debounce: Duration,
    last_accepted: HashMap<(String, String), Instant>,
    degraded: bool,
}

impl CommandQueue {
    fn new(capacity: usize, debounce: Duration) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            debounce,
            last_accepted: HashMap::new(),
            degraded: false,
        }
    }

    fn push(&mut self, cmd: Command) -> SubmitOutcome {
        if let CommandSource::Physical { origin } = &cmd.source {
            let key = (origin.clone(), cmd.kind.debounce_key());
            if let Some(last) = self.last_accepted.get(&key) {
                if cmd.issued_at.saturating_duration_since(*last) < self.debounce {
                    return SubmitOutcome::Debounced;
                }
            }
            self.last_accepted.insert(key, cmd.issued_at);
        }

        if let (
            CommandKind::Seek(target),
            CommandSource::Ui {
                interaction: Some(id),
                ..
            },
        ) = (&cmd.kind, &cmd.source)
        {
            let pending = self.items.iter_mut().find(|queued| {
                queued.kind.is_seek()
                    && matches!(
                        queued.source,
                        CommandSource::Ui { interaction: Some(queued_id), .. } if queued_id == *id
                    )
            });
            if let Some(pending) = pending {
                pending.kind = CommandKind::Seek(*target);
                pending.issued_at = cmd.issued_at;
                return SubmitOutcome::Superseded;
            }
        }

        if self.items.len() >= self.capacity {
            let victim = self
                .items
                .iter()
                .position(|queued| !queued.kind.is_seek())
                .unwrap_or(0);
            if let Some(dropped) = self.items.remove(victim) {
                tracing::warn!(
                    kind = ?dropped.kind,
                    source = %dropped.source.label(),
                    capacity = self.capacity,
                    "command queue overflow; dropping oldest command"
                );
            }
            self.degraded = true;
        }
        self.items.push_back(cmd);
        SubmitOutcome::Queued
    }
}

/// Cloneable handle to the shared command queue.
#[derive(Clone)]
pub struct CommandBus {
    inner: Arc<Mutex<CommandQueue>>,
    notify: Arc<Notify>,
}

impl CommandBus {
    /// Create a bus with the given queue bound and physical debounce window.
    pub fn new(capacity: usize, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CommandQueue::new(capacity, debounce))),
            notify: Arc::new(Notify::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, CommandQueue> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue a command for the reconciler.
    pub fn submit(&self, cmd: Command) -> SubmitOutcome {
        let kind = cmd.kind.clone();
        let source = cmd.source.label();
        let outcome = self.queue().push(cmd);
        match outcome {
            SubmitOutcome::Queued => {
                tracing::debug!(kind = ?kind, source = %source, "command queued");
                self.notify.notify_one();
            }
            SubmitOutcome::Superseded => {
                tracing::debug!(kind = ?kind, source = %source, "seek superseded");
            }
            SubmitOutcome::Debounced => {
                tracing::debug!(kind = ?kind, source = %source, "command debounced");
            }
        }
        outcome
    }

    /// Pop the next command without waiting.
    pub fn try_next(&self) -> Option<Command> {
        self.queue().items.pop_front()
    }

    /// Wait for the next command.
    pub async fn next(&self) -> Command {
        loop {
            if let Some(cmd) = self.try_next() {
                return cmd;
            }
            self.notify.notified().await;
        }
    }

    /// Return and clear the overflow flag.
    pub fn take_degraded(&self) -> bool {
        std::mem::take(&mut self.queue().degraded)
    }

    pub fn len(&self) -> usize {
        self.queue().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
