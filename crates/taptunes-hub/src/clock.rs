//! Normalized playback clock.
//!
//! Both transports feed raw position reports through a `PlaybackClock`, which
//! sanitizes them and reports whether the sample actually changed.

use tokio::sync::watch;

/// Normalized `{position, duration, is_playing}` sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockSample {
    pub position_secs: f64,
    /// `0.0` when unknown or for live streams.
    pub duration_secs: f64,
    pub is_playing: bool,
}

impl ClockSample {
    /// Build a sample from raw values, dropping NaN/negative values and
    /// clamping position to a known duration.
    pub fn normalized(position_secs: f64, duration_secs: f64, is_playing: bool) -> Self {
        let duration_secs = finite_non_negative(duration_secs);
        let mut position_secs = finite_non_negative(position_secs);
        if duration_secs > 0.0 {
            position_secs = position_secs.min(duration_secs);
        }
        Self {
            position_secs,
            duration_secs,
            is_playing,
        }
    }
}

fn finite_non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

/// Latest sample of one playable source.
pub struct PlaybackClock {
    tx: watch::Sender<ClockSample>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClockSample::default());
        Self { tx }
    }

    /// Return the most recent normalized sample.
    pub fn latest(&self) -> ClockSample {
        *self.tx.borrow()
    }

    /// Record a raw report. Returns the normalized sample when it differs from
    /// the previous one.
    pub fn observe(&self, position_secs: f64, duration_secs: f64, is_playing: bool) -> Option<ClockSample> {
        let sample = ClockSample::normalized(position_secs, duration_secs, is_playing);
        let changed = self.tx.send_if_modified(|current| {
            if *current == sample {
                false
            } else {
                *current = sample;
                true
            }
        });
        changed.then_some(sample)
    }

    /// Reset the clock for a freshly loaded track.
    pub fn reset(&self, position_secs: f64) {
        self.tx
            .send_replace(ClockSample::normalized(position_secs, 0.0, false));
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}
