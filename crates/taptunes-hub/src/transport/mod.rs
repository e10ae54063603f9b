//! Playback transport abstraction.
//!
//! A transport is one place audio can come out of: the browser page or the
//! hardware player. The reconciler drives whichever one is authoritative
//! through `PlaybackTransport` and receives lifecycle events back over an
//! unbounded channel tagged with the transition sequence that caused them.

pub mod browser;
pub mod hardware;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use taptunes_types::PlaybackMode;
use tokio::sync::mpsc;

use crate::clock::ClockSample;

/// Failure of a transport verb.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Playback start rejected by the browser autoplay policy.
    #[error("playback start blocked by autoplay policy")]
    PolicyBlocked,
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport request timed out")]
    Timeout,
    #[error("unknown track: {0}")]
    UnknownTrack(String),
}

impl TransportError {
    /// Network-ish failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_) | TransportError::Timeout)
    }
}

/// Point-in-time answer to "what are you playing and where".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportSample {
    pub track_id: Option<String>,
    pub clock: ClockSample,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Sample(ClockSample),
    /// The loaded track is ready to start.
    CanPlay,
    Ended,
    Error(String),
}

/// Lifecycle event pushed by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub mode: PlaybackMode,
    pub seq: u64,
    pub kind: TransportEventKind,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel transports use to report lifecycle events.
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Capability shared by every playback target.
#[async_trait]
pub trait PlaybackTransport: Send + Sync {
    fn mode(&self) -> PlaybackMode;

    /// Prepare `track_id` at `start_at` seconds. Events produced for this load
    /// carry `seq`.
    async fn load(&self, track_id: &str, start_at: f64, seq: u64) -> Result<(), TransportError>;

    async fn play(&self) -> Result<(), TransportError>;

    async fn pause(&self) -> Result<(), TransportError>;

    async fn seek(&self, position_secs: f64) -> Result<(), TransportError>;

    async fn set_volume(&self, volume: u8) -> Result<(), TransportError>;

    /// Fetch a fresh sample from the source of truth.
    async fn sample(&self) -> Result<TransportSample, TransportError>;
}

/// Run `op` up to `attempts` times, sleeping `backoff * attempt` between
/// retryable failures.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    attempts: usize,
    backoff: Duration,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = attempts.max(1);
    let mut last_err: Option<TransportError> = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(op = label, attempt, "transport: request recovered");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                if attempt < attempts {
                    tracing::warn!(op = label, attempt, error = %err, "transport: request failed; retrying");
                    tokio::time::sleep(backoff * attempt as u32).await;
                }
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(TransportError::Timeout))
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tokio::sync::Semaphore;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum MockCall {
        Load(String, f64, u64),
        Play,
        Pause,
        Seek(f64),
        Volume(u8),
        Sample,
    }

    #[derive(Default)]
    struct MockState {
        calls: Vec<MockCall>,
        load_results: VecDeque<Result<(), TransportError>>,
        play_results: VecDeque<Result<(), TransportError>>,
        sample_error: Option<TransportError>,
        volume_gate: Option<Arc<Semaphore>>,
        track_id: Option<String>,
        position_secs: f64,
        duration_secs: f64,
        playing: bool,
    }

    /// In-memory transport that records every verb.
    pub struct MockTransport {
        mode: PlaybackMode,
        state: Mutex<MockState>,
    }

    impl MockTransport {
        pub fn new(mode: PlaybackMode) -> Self {
            Self {
                mode,
                state: Mutex::new(MockState {
                    duration_secs: 180.0,
                    ..MockState::default()
                }),
            }
        }

        fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            let mut state = self.state.lock().unwrap();
            f(&mut state)
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.with_state(|s| s.calls.clone())
        }

        pub fn clear_calls(&self) {
            self.with_state(|s| s.calls.clear());
        }

        pub fn push_load_result(&self, result: Result<(), TransportError>) {
            self.with_state(|s| s.load_results.push_back(result));
        }

        pub fn push_play_result(&self, result: Result<(), TransportError>) {
            self.with_state(|s| s.play_results.push_back(result));
        }

        pub fn fail_samples(&self, err: Option<TransportError>) {
            self.with_state(|s| s.sample_error = err);
        }

        pub fn set_current(&self, track_id: Option<&str>, position_secs: f64, playing: bool) {
            self.with_state(|s| {
                s.track_id = track_id.map(str::to_string);
                s.position_secs = position_secs;
                s.playing = playing;
            });
        }

        pub fn is_playing(&self) -> bool {
            self.with_state(|s| s.playing)
        }

        /// Hold every `set_volume` until a permit is added to the returned gate.
        pub fn gate_volume(&self) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            self.with_state(|s| s.volume_gate = Some(gate.clone()));
            gate
        }
    }

    #[async_trait]
    impl PlaybackTransport for MockTransport {
        fn mode(&self) -> PlaybackMode {
            self.mode
        }

        async fn load(&self, track_id: &str, start_at: f64, seq: u64) -> Result<(), TransportError> {
            self.with_state(|s| {
                s.calls.push(MockCall::Load(track_id.to_string(), start_at, seq));
                let result = s.load_results.pop_front().unwrap_or(Ok(()));
                if result.is_ok() {
                    s.track_id = Some(track_id.to_string());
                    s.position_secs = start_at;
                    s.playing = false;
                }
                result
            })
        }

        async fn play(&self) -> Result<(), TransportError> {
            self.with_state(|s| {
                s.calls.push(MockCall::Play);
                let result = s.play_results.pop_front().unwrap_or(Ok(()));
                if result.is_ok() {
                    s.playing = true;
                }
                result
            })
        }

        async fn pause(&self) -> Result<(), TransportError> {
            self.with_state(|s| {
                s.calls.push(MockCall::Pause);
                s.playing = false;
                Ok(())
            })
        }

        async fn seek(&self, position_secs: f64) -> Result<(), TransportError> {
            self.with_state(|s| {
                s.calls.push(MockCall::Seek(position_secs));
                s.position_secs = position_secs;
                Ok(())
            })
        }

        async fn set_volume(&self, volume: u8) -> Result<(), TransportError> {
            let gate = self.with_state(|s| s.volume_gate.clone());
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            self.with_state(|s| {
                s.calls.push(MockCall::Volume(volume));
                Ok(())
            })
        }

        async fn sample(&self) -> Result<TransportSample, TransportError> {
            self.with_state(|s| {
                s.calls.push(MockCall::Sample);
                if let Some(err) = s.sample_error.clone() {
                    return Err(err);
                }
                Ok(TransportSample {
                    track_id: s.track_id.clone(),
                    clock: ClockSample::normalized(s.position_secs, s.duration_secs, s.playing),
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[actix_web::test]
    async fn with_retry_succeeds_after_retry() {
        let calls = AtomicUsize::new(0);
        let value = with_retry("load", 3, Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::Timeout)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(value, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[actix_web::test]
    async fn with_retry_gives_up_after_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry("load", 2, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unavailable("down".to_string()))
        })
        .await;
        assert_eq!(result, Err(TransportError::Unavailable("down".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[actix_web::test]
    async fn with_retry_does_not_retry_unknown_track() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry("load", 3, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::UnknownTrack("t1".to_string()))
        })
        .await;
        assert!(matches!(result, Err(TransportError::UnknownTrack(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
