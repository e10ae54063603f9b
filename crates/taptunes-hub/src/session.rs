//! Playback session state owned by the reconciler.
//!
//! Holds the single record of what should be playing and how, plus the
//! playlist context with its fixed shuffle order.

use std::collections::HashSet;

use rand::Rng;
use rand::seq::SliceRandom;
use taptunes_types::{PlaybackMode, PlayerState, RepeatMode, SessionView};
use tokio::time::Instant;

/// Ordered track ids, the playback order over them, and the cursor into it.
///
/// The shuffle order is computed once per playlist load (or when shuffle is
/// switched on) and reused by every next/previous decision.
#[derive(Debug, Clone, Default)]
pub struct PlaylistContext {
    playlist_id: Option<String>,
    tracks: Vec<String>,
    order: Vec<usize>,
    cursor: usize,
    unplayable: HashSet<usize>,
}

impl PlaylistContext {
    /// Build a context starting at `start_index` (clamped to the track list).
    pub fn new<R: Rng + ?Sized>(
        playlist_id: Option<String>,
        tracks: Vec<String>,
        start_index: usize,
        shuffle: bool,
        rng: &mut R,
    ) -> Self {
        let start = start_index.min(tracks.len().saturating_sub(1));
        let mut ctx = Self {
            playlist_id,
            order: (0..tracks.len()).collect(),
            tracks,
            cursor: start,
            unplayable: HashSet::new(),
        };
        if shuffle {
            ctx.reshuffle(start, rng);
        }
        ctx
    }

    fn reshuffle<R: Rng + ?Sized>(&mut self, keep_first: usize, rng: &mut R) {
        let mut rest: Vec<usize> = (0..self.tracks.len()).filter(|i| *i != keep_first).collect();
        rest.shuffle(rng);
        self.order = Vec::with_capacity(self.tracks.len());
        if keep_first < self.tracks.len() {
            self.order.push(keep_first);
        }
        self.order.extend(rest);
        self.cursor = 0;
    }

    /// Switch shuffle on or off, keeping the current track current.
    pub fn set_shuffle<R: Rng + ?Sized>(&mut self, shuffle: bool, rng: &mut R) {
        let Some(current) = self.current_index() else {
            return;
        };
        if shuffle {
            self.reshuffle(current, rng);
        } else {
            self.order = (0..self.tracks.len()).collect();
            self.cursor = current;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn playlist_id(&self) -> Option<&str> {
        self.playlist_id.as_deref()
    }

    pub fn track_ids(&self) -> &[String] {
        &self.tracks
    }

    /// Index of the current track within the track list.
    pub fn current_index(&self) -> Option<usize> {
        self.order.get(self.cursor).copied()
    }

    pub fn current_track(&self) -> Option<&str> {
        self.current_index()
            .and_then(|i| self.tracks.get(i))
            .map(String::as_str)
    }

    /// Cursor of the next playable entry in playback order.
    pub fn next_cursor(&self, wrap: bool) -> Option<usize> {
        let playable = |c: &usize| !self.unplayable.contains(&self.order[*c]);
        let forward = (self.cursor + 1..self.order.len()).find(playable);
        if forward.is_some() || !wrap {
            return forward;
        }
        (0..=self.cursor.min(self.order.len().saturating_sub(1)))
            .filter(|_| !self.order.is_empty())
            .find(playable)
    }

    /// Cursor of the previous playable entry in playback order.
    pub fn previous_cursor(&self, wrap: bool) -> Option<usize> {
        let playable = |c: &usize| !self.unplayable.contains(&self.order[*c]);
        let backward = (0..self.cursor).rev().find(playable);
        if backward.is_some() || !wrap {
            return backward;
        }
        (self.cursor..self.order.len()).rev().find(playable)
    }

    /// Cursor of the first playable entry in playback order.
    pub fn first_playable_cursor(&self) -> Option<usize> {
        (0..self.order.len()).find(|c| !self.unplayable.contains(&self.order[*c]))
    }

    pub fn move_to(&mut self, cursor: usize) {
        if cursor < self.order.len() {
            self.cursor = cursor;
        }
    }

    /// Mark the current track unplayable so navigation skips it.
    pub fn mark_current_unplayable(&mut self) {
        if let Some(index) = self.current_index() {
            self.unplayable.insert(index);
        }
    }

    pub fn is_current_unplayable(&self) -> bool {
        self.current_index()
            .map(|i| self.unplayable.contains(&i))
            .unwrap_or(false)
    }
}

/// The single shared record of what is playing and how.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub mode: PlaybackMode,
    pub state: PlayerState,
    pub playlist: PlaylistContext,
    pub is_playing: bool,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub volume: u8,
    pub pending_user_gesture: bool,
    pub suppress_sync_until: Option<Instant>,
    pub transition_seq: u64,
    /// Whether playback should run once the current load completes.
    pub intent_playing: bool,
    /// Consecutive load failures on the current track.
    pub load_failures: u32,
    pub last_error: Option<String>,
    pub notice: Option<String>,
    pub degraded: bool,
}

impl PlaybackSession {
    pub fn new(mode: PlaybackMode, volume: u8) -> Self {
        Self {
            mode,
            state: PlayerState::Idle,
            playlist: PlaylistContext::default(),
            is_playing: false,
            position_secs: 0.0,
            duration_secs: 0.0,
            shuffle: false,
            repeat: RepeatMode::Off,
            volume: volume.min(100),
            pending_user_gesture: false,
            suppress_sync_until: None,
            transition_seq: 0,
            intent_playing: false,
            load_failures: 0,
            last_error: None,
            notice: None,
            degraded: false,
        }
    }

    pub fn current_track_id(&self) -> Option<&str> {
        self.playlist.current_track()
    }

    /// True while echoed samples must be ignored.
    pub fn is_sync_suppressed(&self, now: Instant) -> bool {
        self.suppress_sync_until.map(|until| now < until).unwrap_or(false)
    }

    /// Start a new transition and return its sequence number.
    pub fn bump_seq(&mut self) -> u64 {
        self.transition_seq = self.transition_seq.wrapping_add(1);
        self.transition_seq
    }

    /// Snapshot for publication.
    pub fn view(&self) -> SessionView {
        SessionView {
            mode: self.mode,
            state: self.state,
            current_track_id: self.current_track_id().map(str::to_string),
            playlist_id: self.playlist.playlist_id().map(str::to_string),
            track_ids: self.playlist.track_ids().to_vec(),
            index: self.playlist.current_index(),
            is_playing: self.is_playing,
            position_secs: self.position_secs,
            duration_secs: self.duration_secs,
            shuffle: self.shuffle,
            repeat: self.repeat,
            volume: self.volume,
            pending_user_gesture: self.pending_user_gesture,
            last_error: self.last_error.clone(),
            notice: self.notice.clone(),
            degraded: self.degraded,
            transition_seq: self.transition_seq,
        }
    }
}
