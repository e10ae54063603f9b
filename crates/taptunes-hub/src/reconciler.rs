//! Playback reconciler: the single owner of `PlaybackSession`.
//!
//! Consumes commands from the `CommandBus` and lifecycle events from the
//! transports one at a time, drives the authoritative transport, and publishes
//! the resulting `SessionView`. Every transport event is checked against the
//! current mode and `transition_seq` before it may touch the session.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use taptunes_types::{PlaybackMode, PlayerState, RepeatMode, SessionView};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::clock::ClockSample;
use crate::command_bus::{Command, CommandBus, CommandKind};
use crate::config::{PlaybackSettings, RepeatTapPolicy};
use crate::events::EventBus;
use crate::session::{PlaybackSession, PlaylistContext};
use crate::transport::{
    PlaybackTransport, TransportError, TransportEvent, TransportEventKind, TransportEventReceiver,
    TransportSample,
};

/// Published when a track is given up on.
pub const SKIP_NOTICE: &str = "couldn't play this track, skipping";

/// Delay between samples while waiting for a mode-switch target to confirm.
const SWITCH_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Previous,
}

enum AfterFailure {
    Retry,
    Skip,
}

pub struct Reconciler {
    session: PlaybackSession,
    browser: Arc<dyn PlaybackTransport>,
    hardware: Arc<dyn PlaybackTransport>,
    settings: PlaybackSettings,
    switch_timeout: Duration,
    view_tx: watch::Sender<SessionView>,
    events: EventBus,
    rng: StdRng,
}

impl Reconciler {
    /// Create the reconciler and the receiver its views are published on.
    pub fn new(
        settings: PlaybackSettings,
        browser: Arc<dyn PlaybackTransport>,
        hardware: Arc<dyn PlaybackTransport>,
        switch_timeout: Duration,
        events: EventBus,
    ) -> (Self, watch::Receiver<SessionView>) {
        let session = PlaybackSession::new(settings.initial_mode, settings.default_volume);
        let (view_tx, view_rx) = watch::channel(session.view());
        let reconciler = Self {
            session,
            browser,
            hardware,
            settings,
            switch_timeout,
            view_tx,
            events,
            rng: StdRng::from_entropy(),
        };
        (reconciler, view_rx)
    }

    /// Replace the shuffle RNG (deterministic orders in tests).
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn view(&self) -> SessionView {
        self.session.view()
    }

    fn transport_for(&self, mode: PlaybackMode) -> Arc<dyn PlaybackTransport> {
        match mode {
            PlaybackMode::Browser => self.browser.clone(),
            PlaybackMode::Hardware => self.hardware.clone(),
        }
    }

    /// The authoritative transport.
    fn transport(&self) -> Arc<dyn PlaybackTransport> {
        self.transport_for(self.session.mode)
    }

    fn publish(&mut self) {
        let view = self.session.view();
        let changed = self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
        if changed {
            self.events.session_changed();
        }
    }

    fn suppress_sync(&mut self, now: Instant) {
        self.session.suppress_sync_until = Some(now + self.settings.suppress);
    }

    /// Playing, or about to be once the current load completes.
    fn is_active(&self) -> bool {
        match self.session.state {
            PlayerState::Playing => true,
            PlayerState::Loading => self.session.intent_playing,
            _ => false,
        }
    }

    /// Main loop: one command or transport event at a time, to completion.
    pub async fn run(mut self, bus: CommandBus, mut transport_events: TransportEventReceiver) {
        self.recover().await;
        loop {
            tokio::select! {
                cmd = bus.next() => {
                    if bus.take_degraded() {
                        self.session.degraded = true;
                    }
                    self.handle_command(cmd).await;
                    if self.session.degraded && bus.is_empty() {
                        self.session.degraded = false;
                        self.publish();
                    }
                }
                event = transport_events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_transport_event(event, Instant::now()).await;
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    /// Adopt whatever the authoritative transport is already playing.
    pub async fn recover(&mut self) {
        match self.transport().sample().await {
            Ok(TransportSample {
                track_id: Some(track_id),
                clock,
            }) => {
                tracing::info!(
                    mode = %self.session.mode,
                    track_id = %track_id,
                    position_secs = clock.position_secs,
                    "reconciler: recovered playback"
                );
                self.session.playlist =
                    PlaylistContext::new(None, vec![track_id], 0, false, &mut self.rng);
                self.session.position_secs = clock.position_secs;
                self.session.duration_secs = clock.duration_secs;
                self.session.is_playing = clock.is_playing;
                self.session.intent_playing = clock.is_playing;
                self.session.state = if clock.is_playing {
                    PlayerState::Playing
                } else {
                    PlayerState::Paused
                };
            }
            Ok(_) => {
                tracing::debug!(mode = %self.session.mode, "reconciler: nothing to recover");
            }
            Err(err) => {
                tracing::debug!(mode = %self.session.mode, error = %err, "reconciler: recovery sample failed");
            }
        }
        self.publish();
    }

    pub async fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        let gesture = cmd.source.is_user_gesture();
        tracing::debug!(kind = ?cmd.kind, source = %cmd.source.label(), state = ?self.session.state, "reconciler: command");
        self.session.notice = None;
        match cmd.kind {
            CommandKind::Play => self.play(gesture, now).await,
            CommandKind::Pause => self.pause(now).await,
            CommandKind::TogglePlayPause => {
                if self.is_active() {
                    self.pause(now).await;
                } else {
                    self.play(gesture, now).await;
                }
            }
            CommandKind::Stop => self.stop(now).await,
            CommandKind::Next => self.skip(Direction::Next).await,
            CommandKind::Previous => self.skip(Direction::Previous).await,
            CommandKind::Seek(target) => self.seek(target, now).await,
            CommandKind::SetVolume(volume) => self.set_volume(volume).await,
            CommandKind::StepVolume(delta) => {
                let volume = (i32::from(self.session.volume) + i32::from(delta)).clamp(0, 100) as u8;
                self.set_volume(volume).await;
            }
            CommandKind::SetMode(mode) => self.switch_mode(mode, now).await,
            CommandKind::SetShuffle(shuffle) => {
                self.session.shuffle = shuffle;
                self.session.playlist.set_shuffle(shuffle, &mut self.rng);
            }
            CommandKind::SetRepeat(repeat) => self.session.repeat = repeat,
            CommandKind::LoadPlaylist {
                playlist_id,
                track_ids,
                start_index,
            } => {
                self.load_playlist(playlist_id, track_ids, start_index, gesture, now)
                    .await
            }
        }
        self.publish();
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if event.mode != self.session.mode || event.seq != self.session.transition_seq {
            tracing::debug!(
                mode = %event.mode,
                seq = event.seq,
                current_seq = self.session.transition_seq,
                kind = ?event.kind,
                "reconciler: dropping stale transport event"
            );
            return;
        }
        match event.kind {
            TransportEventKind::Sample(sample) => self.on_sample(sample, now),
            TransportEventKind::CanPlay => self.on_can_play(now).await,
            TransportEventKind::Ended => self.on_ended(now).await,
            TransportEventKind::Error(message) => self.on_transport_error(message).await,
        }
        self.publish();
    }

    async fn play(&mut self, gesture: bool, now: Instant) {
        match self.session.state {
            PlayerState::AutoplayBlocked => {
                if gesture {
                    self.start_playback(now).await;
                } else {
                    tracing::debug!("reconciler: play without user gesture ignored while blocked");
                }
            }
            PlayerState::Paused => self.start_playback(now).await,
            PlayerState::Loading => self.session.intent_playing = true,
            PlayerState::Idle | PlayerState::Ended => {
                if self.session.playlist.is_empty() {
                    tracing::debug!("reconciler: play with nothing loaded");
                    return;
                }
                let mut start_at = self.session.position_secs;
                if self.session.state == PlayerState::Ended
                    || self.session.playlist.is_current_unplayable()
                {
                    match self.session.playlist.first_playable_cursor() {
                        Some(cursor) => self.session.playlist.move_to(cursor),
                        None => return,
                    }
                    start_at = 0.0;
                }
                self.session.intent_playing = true;
                self.begin_load(start_at).await;
            }
            PlayerState::Playing | PlayerState::ModeSwitching => {}
        }
    }

    /// Issue `play()` on the authoritative transport and settle the state.
    async fn start_playback(&mut self, now: Instant) {
        self.session.intent_playing = true;
        match self.transport().play().await {
            Ok(()) => {
                self.session.state = PlayerState::Playing;
                self.session.is_playing = true;
                self.session.pending_user_gesture = false;
                self.session.last_error = None;
                self.suppress_sync(now);
            }
            Err(TransportError::PolicyBlocked) => {
                tracing::info!(mode = %self.session.mode, "reconciler: playback blocked until user gesture");
                self.session.state = PlayerState::AutoplayBlocked;
                self.session.is_playing = false;
                self.session.pending_user_gesture = true;
            }
            Err(err) => self.on_adapter_error("play", err),
        }
    }

    fn on_adapter_error(&mut self, op: &str, err: TransportError) {
        tracing::warn!(op, mode = %self.session.mode, error = %err, "reconciler: transport error");
        if matches!(
            self.session.state,
            PlayerState::Playing | PlayerState::Paused | PlayerState::AutoplayBlocked
        ) {
            self.session.state = PlayerState::Paused;
            self.session.is_playing = false;
            self.session.intent_playing = false;
        }
        self.session.last_error = Some(err.to_string());
    }

    async fn pause(&mut self, now: Instant) {
        match self.session.state {
            PlayerState::Loading => self.session.intent_playing = false,
            PlayerState::AutoplayBlocked => {
                self.session.intent_playing = false;
                self.session.pending_user_gesture = false;
                self.session.state = PlayerState::Paused;
            }
            PlayerState::Playing => {
                self.session.intent_playing = false;
                match self.transport().pause().await {
                    Ok(()) => {
                        self.session.state = PlayerState::Paused;
                        self.session.is_playing = false;
                        self.suppress_sync(now);
                    }
                    Err(err) => self.on_adapter_error("pause", err),
                }
            }
            _ => {}
        }
    }

    async fn stop(&mut self, now: Instant) {
        let transport = self.transport();
        if let Err(err) = transport.pause().await {
            tracing::debug!(error = %err, "reconciler: stop pause failed");
        }
        if self.session.duration_secs > 0.0 {
            if let Err(err) = transport.seek(0.0).await {
                tracing::debug!(error = %err, "reconciler: stop rewind failed");
            }
        }
        self.session.bump_seq();
        self.session.state = PlayerState::Idle;
        self.session.is_playing = false;
        self.session.intent_playing = false;
        self.session.pending_user_gesture = false;
        self.session.position_secs = 0.0;
        self.suppress_sync(now);
    }

    async fn skip(&mut self, direction: Direction) {
        if self.session.playlist.is_empty() {
            return;
        }
        let wrap = self.session.repeat == RepeatMode::All;
        let target = match direction {
            Direction::Next => self.session.playlist.next_cursor(wrap),
            Direction::Previous => self
                .session
                .playlist
                .previous_cursor(wrap)
                .or_else(|| self.session.playlist.first_playable_cursor()),
        };
        match target {
            Some(cursor) => {
                self.session.playlist.move_to(cursor);
                self.session.load_failures = 0;
                self.session.intent_playing = true;
                self.begin_load(0.0).await;
            }
            None => self.finish_playlist().await,
        }
    }

    /// Nothing left to play.
    async fn finish_playlist(&mut self) {
        if self.session.is_playing {
            if let Err(err) = self.transport().pause().await {
                tracing::debug!(error = %err, "reconciler: pause at end failed");
            }
        }
        tracing::info!("reconciler: playlist finished");
        self.session.state = PlayerState::Ended;
        self.session.is_playing = false;
        self.session.intent_playing = false;
    }

    async fn seek(&mut self, target: f64, now: Instant) {
        let duration = self.session.duration_secs;
        if duration <= 0.0 || !target.is_finite() || self.session.current_track_id().is_none() {
            tracing::debug!(target, duration, "reconciler: seek ignored");
            return;
        }
        let target = target.clamp(0.0, duration);
        match self.transport().seek(target).await {
            Ok(()) => {
                self.session.position_secs = target;
                self.suppress_sync(now);
            }
            Err(err) => self.on_adapter_error("seek", err),
        }
    }

    async fn set_volume(&mut self, volume: u8) {
        let volume = volume.min(100);
        self.session.volume = volume;
        if let Err(err) = self.transport().set_volume(volume).await {
            self.on_adapter_error("volume", err);
        }
    }

    async fn load_playlist(
        &mut self,
        playlist_id: Option<String>,
        track_ids: Vec<String>,
        start_index: usize,
        gesture: bool,
        now: Instant,
    ) {
        let same_playlist =
            playlist_id.is_some() && playlist_id.as_deref() == self.session.playlist.playlist_id();
        let engaged = matches!(
            self.session.state,
            PlayerState::Playing | PlayerState::Paused | PlayerState::AutoplayBlocked
        );
        if same_playlist && engaged {
            let policy = self.settings.repeat_tap;
            tracing::debug!(playlist_id = ?playlist_id, policy = ?policy, "reconciler: repeat tap");
            match policy {
                RepeatTapPolicy::TogglePause => {
                    if self.is_active() {
                        self.pause(now).await;
                    } else {
                        self.play(gesture, now).await;
                    }
                    return;
                }
                RepeatTapPolicy::Stop => {
                    self.stop(now).await;
                    return;
                }
                RepeatTapPolicy::Ignore => return,
                RepeatTapPolicy::Restart => {}
            }
        }
        if track_ids.is_empty() {
            tracing::warn!(playlist_id = ?playlist_id, "reconciler: empty playlist ignored");
            return;
        }
        tracing::info!(
            playlist_id = ?playlist_id,
            tracks = track_ids.len(),
            start_index,
            "reconciler: loading playlist"
        );
        self.session.playlist = PlaylistContext::new(
            playlist_id,
            track_ids,
            start_index,
            self.session.shuffle,
            &mut self.rng,
        );
        self.session.load_failures = 0;
        self.session.pending_user_gesture = false;
        self.session.intent_playing = true;
        self.begin_load(0.0).await;
    }

    /// Load the current track on the authoritative transport, retrying and
    /// skipping unplayable tracks until one load is accepted or the playlist
    /// runs out.
    async fn begin_load(&mut self, start_at: f64) {
        let mut start_at = start_at;
        loop {
            let Some(track_id) = self.session.current_track_id().map(str::to_string) else {
                self.session.state = PlayerState::Idle;
                return;
            };
            let seq = self.session.bump_seq();
            self.session.state = PlayerState::Loading;
            self.session.is_playing = false;
            self.session.pending_user_gesture = false;
            self.session.position_secs = start_at;
            self.session.duration_secs = 0.0;
            tracing::debug!(track_id = %track_id, seq, start_at, mode = %self.session.mode, "reconciler: load");
            let err = match self.transport().load(&track_id, start_at, seq).await {
                Ok(()) => return,
                Err(err) => err,
            };
            match self.on_load_failure(&track_id, err) {
                AfterFailure::Retry => {
                    let backoff = self.settings.retry_backoff * self.session.load_failures;
                    tokio::time::sleep(backoff).await;
                }
                AfterFailure::Skip => {
                    if !self.advance_after_failure() {
                        self.finish_playlist().await;
                        return;
                    }
                    start_at = 0.0;
                }
            }
        }
    }

    fn on_load_failure(&mut self, track_id: &str, err: TransportError) -> AfterFailure {
        self.session.load_failures += 1;
        let give_up = matches!(err, TransportError::UnknownTrack(_))
            || self.session.load_failures >= self.settings.max_load_attempts;
        if !give_up {
            tracing::warn!(
                track_id = %track_id,
                attempt = self.session.load_failures,
                error = %err,
                "reconciler: load failed; retrying"
            );
            return AfterFailure::Retry;
        }
        tracing::warn!(track_id = %track_id, error = %err, "reconciler: track unplayable; skipping");
        self.session.playlist.mark_current_unplayable();
        self.session.load_failures = 0;
        self.session.last_error = Some(err.to_string());
        self.session.notice = Some(SKIP_NOTICE.to_string());
        self.events.notice(SKIP_NOTICE);
        AfterFailure::Skip
    }

    /// Move to the track after an unplayable one. Repeat-one does not apply.
    fn advance_after_failure(&mut self) -> bool {
        let wrap = self.session.repeat == RepeatMode::All;
        match self.session.playlist.next_cursor(wrap) {
            Some(cursor) => {
                self.session.playlist.move_to(cursor);
                true
            }
            None => false,
        }
    }

    fn on_sample(&mut self, sample: ClockSample, now: Instant) {
        if self.session.is_sync_suppressed(now) {
            tracing::trace!(position_secs = sample.position_secs, "reconciler: sample suppressed");
            return;
        }
        match self.session.state {
            PlayerState::Playing | PlayerState::Paused => {
                self.session.position_secs = sample.position_secs;
                self.session.duration_secs = sample.duration_secs;
                self.session.is_playing = sample.is_playing;
                self.session.intent_playing = sample.is_playing;
                self.session.state = if sample.is_playing {
                    PlayerState::Playing
                } else {
                    PlayerState::Paused
                };
            }
            PlayerState::AutoplayBlocked if sample.is_playing => {
                // Started from the page's own controls.
                self.session.position_secs = sample.position_secs;
                self.session.duration_secs = sample.duration_secs;
                self.session.is_playing = true;
                self.session.pending_user_gesture = false;
                self.session.state = PlayerState::Playing;
            }
            PlayerState::AutoplayBlocked => {
                self.session.duration_secs = sample.duration_secs;
            }
            _ => {}
        }
    }

    async fn on_can_play(&mut self, now: Instant) {
        if self.session.state != PlayerState::Loading {
            return;
        }
        self.session.load_failures = 0;
        if self.session.intent_playing {
            self.start_playback(now).await;
        } else {
            self.session.state = PlayerState::Paused;
        }
    }

    async fn on_ended(&mut self, now: Instant) {
        if self.session.duration_secs <= 0.0 {
            tracing::debug!("reconciler: ended ignored for live stream");
            return;
        }
        if !matches!(
            self.session.state,
            PlayerState::Playing | PlayerState::Paused
        ) {
            return;
        }
        tracing::debug!(track_id = ?self.session.current_track_id(), repeat = ?self.session.repeat, "reconciler: track ended");
        if self.session.repeat == RepeatMode::One {
            let transport = self.transport();
            if let Err(err) = transport.seek(0.0).await {
                self.on_adapter_error("seek", err);
                return;
            }
            self.session.position_secs = 0.0;
            self.start_playback(now).await;
            return;
        }
        let wrap = self.session.repeat == RepeatMode::All;
        match self.session.playlist.next_cursor(wrap) {
            Some(cursor) => {
                self.session.playlist.move_to(cursor);
                self.session.load_failures = 0;
                self.session.intent_playing = true;
                self.begin_load(0.0).await;
            }
            None => {
                self.session.position_secs = self.session.duration_secs;
                self.finish_playlist().await;
            }
        }
    }

    async fn on_transport_error(&mut self, message: String) {
        if self.session.state != PlayerState::Loading {
            tracing::warn!(error = %message, mode = %self.session.mode, "reconciler: transport reported error");
            self.on_adapter_error("event", TransportError::Unavailable(message));
            return;
        }
        let Some(track_id) = self.session.current_track_id().map(str::to_string) else {
            return;
        };
        match self.on_load_failure(&track_id, TransportError::Unavailable(message)) {
            AfterFailure::Retry => {
                let backoff = self.settings.retry_backoff * self.session.load_failures;
                tokio::time::sleep(backoff).await;
                self.begin_load(self.session.position_secs).await;
            }
            AfterFailure::Skip => {
                if self.advance_after_failure() {
                    self.begin_load(0.0).await;
                } else {
                    self.finish_playlist().await;
                }
            }
        }
    }

    /// Hand authority to the transport for `target`, carrying the position.
    async fn switch_mode(&mut self, target: PlaybackMode, now: Instant) {
        if target == self.session.mode {
            tracing::debug!(mode = %target, "reconciler: already in requested mode");
            return;
        }
        let Some(track_id) = self.session.current_track_id().map(str::to_string) else {
            tracing::info!(from = %self.session.mode, to = %target, "reconciler: mode switched");
            self.session.mode = target;
            self.session.bump_seq();
            return;
        };

        let was_playing = self.is_active() || self.session.state == PlayerState::AutoplayBlocked;
        let previous_state = self.session.state;
        self.session.state = PlayerState::ModeSwitching;
        self.publish();

        let old = self.transport();
        if was_playing {
            if let Err(err) = old.pause().await {
                tracing::warn!(error = %err, "reconciler: pause before mode switch failed");
            }
        }

        let position = self.session.position_secs;
        // Not committed to the session until the target confirms.
        let seq = self.session.transition_seq.wrapping_add(1);
        let candidate = self.transport_for(target);
        let timeout = self.switch_timeout;
        let confirmed: Result<TransportSample, TransportError> = async {
            candidate.load(&track_id, position, seq).await?;
            let deadline = Instant::now() + timeout;
            loop {
                match candidate.sample().await {
                    Ok(sample) if sample.track_id.as_deref() == Some(track_id.as_str()) => {
                        return Ok(sample);
                    }
                    _ if Instant::now() >= deadline => return Err(TransportError::Timeout),
                    _ => tokio::time::sleep(SWITCH_SAMPLE_INTERVAL).await,
                }
            }
        }
        .await;

        match confirmed {
            Ok(sample) => {
                tracing::info!(
                    from = %self.session.mode,
                    to = %target,
                    track_id = %track_id,
                    position_secs = sample.clock.position_secs,
                    "reconciler: mode switched"
                );
                self.session.mode = target;
                self.session.transition_seq = seq;
                self.session.position_secs = sample.clock.position_secs;
                self.session.duration_secs = sample.clock.duration_secs;
                self.session.is_playing = false;
                self.session.pending_user_gesture = false;
                self.session.last_error = None;
                if let Err(err) = candidate.set_volume(self.session.volume).await {
                    tracing::debug!(error = %err, "reconciler: volume sync after switch failed");
                }
                if was_playing {
                    self.session.state = PlayerState::Paused;
                    self.start_playback(now).await;
                } else {
                    self.session.state = match previous_state {
                        PlayerState::Idle | PlayerState::Ended => previous_state,
                        _ => PlayerState::Paused,
                    };
                }
            }
            Err(err) => {
                tracing::warn!(
                    from = %self.session.mode,
                    to = %target,
                    error = %err,
                    "reconciler: mode switch failed; keeping current mode"
                );
                if let Err(pause_err) = candidate.pause().await {
                    tracing::debug!(error = %pause_err, "reconciler: pause of failed target");
                }
                if was_playing {
                    self.session.state = PlayerState::Paused;
                    self.start_playback(now).await;
                } else {
                    self.session.state = previous_state;
                }
                self.session.last_error = Some(format!("switch to {target} failed: {err}"));
            }
        }
    }
}
