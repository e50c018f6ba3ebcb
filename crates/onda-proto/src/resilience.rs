//! Playback recovery state machine.
//!
//! Keeps the stream audible for as long as the user intends it to be,
//! tolerating transient OS/network interruptions, while never fighting a
//! deliberate user pause.  The controller is pure: it consumes
//! [`PlayerEvent`]s and returns [`Effect`]s for the daemon loop to execute.
//! Timers are expressed as [`Effect::ScheduleRetry`] and come back in as
//! [`PlayerEvent::RetryDue`], which re-checks current intent before acting —
//! pending timers are never cancelled, so that re-check is load-bearing.
//!
//! # Phases
//! ```text
//!  Idle ──Play──▶ Starting ──started──▶ Playing
//!                    │failed               │native pause (late)
//!                    ▼                     ▼
//!                  Idle               Interrupted ──foreground──▶ Starting
//!  Playing ──error/ended──▶ Retrying ──timer──▶ Starting
//!  any ──Pause──▶ Paused (sticky until the next Play)
//! ```
//!
//! The two retry flavours differ on purpose: a stalled stream is retried
//! *without* reloading (a reload itself interrupts audibly), while
//! error/ended re-fetch the source with a fresh cache-busting stamp because
//! the old connection is unrecoverable for a live stream.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Timing windows for recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySettings {
    /// Native pauses within this window of a play request are treated as a
    /// startup artifact, not an interruption.  Some runtimes emit a spurious
    /// pause notification right after a play call succeeds.
    pub ghost_pause_window: Duration,
    /// Back-off before the forced-reload retry after a stream error.
    pub error_reload_delay: Duration,
    /// Back-off before the forced-reload retry after the stream ends.
    pub ended_reload_delay: Duration,
    /// Back-off before the plain resume retry after a stall.
    pub stall_retry_delay: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            ghost_pause_window: Duration::from_millis(1200),
            error_reload_delay: Duration::from_millis(400),
            ended_reload_delay: Duration::from_millis(600),
            stall_retry_delay: Duration::from_millis(600),
        }
    }
}

/// Where playback stands, as far as the controller can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Phase {
    /// Nothing playing and nothing wanted (or a start was refused).
    #[default]
    Idle,
    /// A start was issued and has not completed yet.
    Starting,
    /// Audio flowing.
    Playing,
    /// The user paused; sticky until the next play request.
    Paused,
    /// Something outside the user's control took playback away.
    Interrupted,
    /// A retry timer is pending after a stream error or end.
    Retrying,
}

/// What a scheduled retry should do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Re-fetch the source with a fresh cache-busting stamp, then play.
    Reload,
    /// Plain play, no reload.
    Resume,
}

/// Inputs to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The user asked for playback.
    PlayRequested { force_reload: bool },
    /// The user asked for silence.
    PauseRequested,
    /// The media backend confirmed a start attempt succeeded.
    StartSucceeded,
    /// Both start attempts (plain and muted fallback) failed.
    StartFailed,
    /// The backend reports audio flowing.
    NativePlaying,
    /// The backend paused without us asking.
    NativePause,
    /// The backend stopped receiving data but the connection may recover.
    NativeStalled,
    /// The stream ended.
    NativeEnded,
    /// The stream errored.
    NativeError,
    /// The app came back to the foreground.
    ForegroundRegained,
    /// Connectivity to the stream origin came back.
    NetworkRestored,
    /// A previously scheduled retry timer elapsed.
    RetryDue(RetryKind),
}

/// Outputs for the daemon loop to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Start playback; with `reload` the source is re-fetched with a fresh
    /// cache-busting stamp first.
    StartPlayback { reload: bool },
    /// Stop playback and silence the output.
    StopPlayback,
    /// Arm a fire-and-forget timer that re-enters as `RetryDue(kind)`.
    ScheduleRetry { kind: RetryKind, delay: Duration },
}

/// The intent-vs-reality record, one per player instance.  Never persisted.
#[derive(Debug, Clone, Default)]
pub struct PlaybackIntent {
    /// Whether the user wants audio playing.
    pub desired_playing: bool,
    /// True only when the user explicitly paused.
    pub manual_pause: bool,
    /// A pause was observed that wasn't user-initiated and wasn't right
    /// after a play attempt.
    pub interrupted_by_system: bool,
    /// Stamp of the last play request; gates the ghost-pause window.
    pub last_play_requested_at: Option<Instant>,
    /// Guards against overlapping start attempts.
    pub start_in_flight: bool,
}

impl PlaybackIntent {
    /// `manual_pause` and `interrupted_by_system` are mutually exclusive.
    pub fn invariants_hold(&self) -> bool {
        !(self.manual_pause && self.interrupted_by_system)
    }
}

pub struct RecoveryController {
    settings: RecoverySettings,
    intent: PlaybackIntent,
    phase: Phase,
}

impl RecoveryController {
    pub fn new(settings: RecoverySettings) -> Self {
        Self {
            settings,
            intent: PlaybackIntent::default(),
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn intent(&self) -> &PlaybackIntent {
        &self.intent
    }

    /// Feed one event in, get the effects out.  `now` is passed explicitly
    /// so sequences can be driven deterministically in tests.
    pub fn handle(&mut self, event: PlayerEvent, now: Instant) -> Vec<Effect> {
        let effects = match event {
            PlayerEvent::PlayRequested { force_reload } => {
                if self.intent.start_in_flight {
                    // Overlapping requests are discarded, not queued.
                    return Vec::new();
                }
                self.intent.manual_pause = false;
                self.start(now, force_reload)
            }

            PlayerEvent::PauseRequested => {
                self.intent.manual_pause = true;
                self.intent.desired_playing = false;
                self.intent.interrupted_by_system = false;
                self.phase = Phase::Paused;
                vec![Effect::StopPlayback]
            }

            PlayerEvent::StartSucceeded => {
                self.intent.start_in_flight = false;
                if !self.intent.manual_pause {
                    self.intent.desired_playing = true;
                    self.intent.interrupted_by_system = false;
                    self.phase = Phase::Playing;
                }
                Vec::new()
            }

            PlayerEvent::StartFailed => {
                // Reset the guard unconditionally; a stale flag would block
                // every later play request.
                self.intent.start_in_flight = false;
                if !self.intent.manual_pause {
                    // Silent failure: stay idle, no automatic retries.  The
                    // UI keeps a manual retry affordance.
                    self.intent.desired_playing = false;
                    self.phase = Phase::Idle;
                }
                Vec::new()
            }

            PlayerEvent::NativePlaying => {
                if !self.intent.manual_pause {
                    self.intent.desired_playing = true;
                    self.intent.interrupted_by_system = false;
                    self.phase = Phase::Playing;
                }
                Vec::new()
            }

            PlayerEvent::NativePause => {
                if self.intent.manual_pause {
                    // Expected echo of our own pause.
                } else if self.within_ghost_window(now) {
                    // Startup artifact; ignore.
                } else {
                    self.intent.interrupted_by_system = true;
                    self.phase = Phase::Interrupted;
                }
                Vec::new()
            }

            PlayerEvent::NativeStalled => {
                if self.intent.manual_pause {
                    Vec::new()
                } else {
                    // No reload: reloading would itself cause an audible gap,
                    // and stalls usually clear on their own.
                    vec![Effect::ScheduleRetry {
                        kind: RetryKind::Resume,
                        delay: self.settings.stall_retry_delay,
                    }]
                }
            }

            PlayerEvent::NativeEnded => self.schedule_reload(self.settings.ended_reload_delay),
            PlayerEvent::NativeError => self.schedule_reload(self.settings.error_reload_delay),

            PlayerEvent::ForegroundRegained => {
                if self.intent.interrupted_by_system
                    && !self.intent.manual_pause
                    && !self.intent.start_in_flight
                {
                    self.intent.interrupted_by_system = false;
                    self.start(now, false)
                } else {
                    Vec::new()
                }
            }

            PlayerEvent::NetworkRestored => {
                // Only resurrect playback the user still wants; a start that
                // was refused leaves desired_playing false and stays idle.
                if self.intent.desired_playing
                    && !self.intent.manual_pause
                    && !self.intent.start_in_flight
                    && self.phase != Phase::Playing
                    && self.phase != Phase::Starting
                {
                    self.start(now, true)
                } else {
                    Vec::new()
                }
            }

            PlayerEvent::RetryDue(kind) => self.retry_due(kind, now),
        };

        debug_assert!(self.intent.invariants_hold());
        effects
    }

    /// A scheduled timer elapsed.  Timers are never cancelled, so current
    /// intent decides whether the retry still applies.
    fn retry_due(&mut self, kind: RetryKind, now: Instant) -> Vec<Effect> {
        if self.intent.manual_pause || self.intent.start_in_flight {
            return Vec::new();
        }
        if !self.intent.desired_playing {
            return Vec::new();
        }
        match kind {
            RetryKind::Resume => {
                if self.phase == Phase::Playing {
                    // Recovered on its own while the timer was pending.
                    Vec::new()
                } else {
                    self.start(now, false)
                }
            }
            RetryKind::Reload => {
                if self.phase == Phase::Playing {
                    Vec::new()
                } else {
                    self.start(now, true)
                }
            }
        }
    }

    fn schedule_reload(&mut self, delay: Duration) -> Vec<Effect> {
        if self.intent.manual_pause {
            return Vec::new();
        }
        self.phase = Phase::Retrying;
        vec![Effect::ScheduleRetry {
            kind: RetryKind::Reload,
            delay,
        }]
    }

    fn start(&mut self, now: Instant, reload: bool) -> Vec<Effect> {
        self.intent.desired_playing = true;
        self.intent.last_play_requested_at = Some(now);
        self.intent.start_in_flight = true;
        self.phase = Phase::Starting;
        vec![Effect::StartPlayback { reload }]
    }

    fn within_ghost_window(&self, now: Instant) -> bool {
        match self.intent.last_play_requested_at {
            Some(at) => now.saturating_duration_since(at) < self.settings.ghost_pause_window,
            None => false,
        }
    }
}

/// Rewrite `url` with a fresh `ts` cache-busting stamp, adding the parameter
/// when absent and replacing it when present.  Other query parameters are
/// preserved in order.
pub fn cache_busted(url: &str, ts_millis: i64) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, query),
        None => (url, ""),
    };

    let mut params: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("ts=") && *p != "ts")
        .collect();
    let stamp = format!("ts={}", ts_millis);
    params.push(&stamp);
    format!("{}?{}", base, params.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RecoveryController {
        RecoveryController::new(RecoverySettings::default())
    }

    fn t0() -> Instant {
        Instant::now()
    }

    #[test]
    fn play_starts_and_clears_manual_pause() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PauseRequested, now);
        assert!(c.intent().manual_pause);

        let fx = c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        assert_eq!(fx, vec![Effect::StartPlayback { reload: false }]);
        assert!(!c.intent().manual_pause);
        assert!(c.intent().start_in_flight);
        assert_eq!(c.phase(), Phase::Starting);
    }

    #[test]
    fn play_while_start_in_flight_is_a_noop() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        let fx = c.handle(PlayerEvent::PlayRequested { force_reload: true }, now);
        assert!(fx.is_empty());
        assert_eq!(c.phase(), Phase::Starting);
    }

    #[test]
    fn start_failure_resets_guard_and_stays_idle() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        let fx = c.handle(PlayerEvent::StartFailed, now);
        assert!(fx.is_empty());
        assert!(!c.intent().start_in_flight);
        assert!(!c.intent().desired_playing);
        assert_eq!(c.phase(), Phase::Idle);

        // A later play request goes through.
        let fx = c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        assert_eq!(fx.len(), 1);
    }

    #[test]
    fn ghost_pause_inside_window_is_ignored() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);

        // 800ms after the play request: still inside the window.
        let later = now + Duration::from_millis(800);
        c.handle(PlayerEvent::NativePause, later);
        assert!(!c.intent().interrupted_by_system);
        assert_eq!(c.phase(), Phase::Playing);
    }

    #[test]
    fn pause_outside_window_marks_interruption() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);

        let later = now + Duration::from_secs(5);
        c.handle(PlayerEvent::NativePause, later);
        assert!(c.intent().interrupted_by_system);
        assert_eq!(c.phase(), Phase::Interrupted);
    }

    #[test]
    fn manual_pause_makes_native_pause_expected() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        c.handle(PlayerEvent::PauseRequested, now + Duration::from_secs(10));
        c.handle(PlayerEvent::NativePause, now + Duration::from_secs(10));
        assert!(!c.intent().interrupted_by_system);
        assert_eq!(c.phase(), Phase::Paused);
    }

    #[test]
    fn error_schedules_exactly_one_reload_retry() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);

        let fx = c.handle(PlayerEvent::NativeError, now + Duration::from_secs(30));
        assert_eq!(
            fx,
            vec![Effect::ScheduleRetry {
                kind: RetryKind::Reload,
                delay: Duration::from_millis(400),
            }]
        );
        assert_eq!(c.phase(), Phase::Retrying);
    }

    #[test]
    fn ended_uses_its_own_backoff() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        let fx = c.handle(PlayerEvent::NativeEnded, now + Duration::from_secs(30));
        assert_eq!(
            fx,
            vec![Effect::ScheduleRetry {
                kind: RetryKind::Reload,
                delay: Duration::from_millis(600),
            }]
        );
    }

    #[test]
    fn stall_schedules_plain_resume_only_when_not_paused() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);

        let fx = c.handle(PlayerEvent::NativeStalled, now + Duration::from_secs(30));
        assert_eq!(
            fx,
            vec![Effect::ScheduleRetry {
                kind: RetryKind::Resume,
                delay: Duration::from_millis(600),
            }]
        );

        c.handle(PlayerEvent::PauseRequested, now + Duration::from_secs(31));
        let fx = c.handle(PlayerEvent::NativeStalled, now + Duration::from_secs(32));
        assert!(fx.is_empty());
    }

    #[test]
    fn stale_retry_respects_manual_pause() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        c.handle(PlayerEvent::NativeError, now + Duration::from_secs(30));
        // The user pauses before the pending timer fires.
        c.handle(PlayerEvent::PauseRequested, now + Duration::from_secs(30));

        let fx = c.handle(
            PlayerEvent::RetryDue(RetryKind::Reload),
            now + Duration::from_secs(31),
        );
        assert!(fx.is_empty());
        assert_eq!(c.phase(), Phase::Paused);
    }

    #[test]
    fn resume_retry_is_dropped_when_playback_recovered() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        c.handle(PlayerEvent::NativeStalled, now + Duration::from_secs(30));
        // Stall cleared on its own before the timer fired.
        c.handle(PlayerEvent::NativePlaying, now + Duration::from_secs(30));

        let fx = c.handle(
            PlayerEvent::RetryDue(RetryKind::Resume),
            now + Duration::from_secs(31),
        );
        assert!(fx.is_empty());
    }

    #[test]
    fn retry_due_issues_reload_start() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        c.handle(PlayerEvent::NativeError, now + Duration::from_secs(30));

        let fx = c.handle(
            PlayerEvent::RetryDue(RetryKind::Reload),
            now + Duration::from_secs(31),
        );
        assert_eq!(fx, vec![Effect::StartPlayback { reload: true }]);
        assert!(c.intent().start_in_flight);
    }

    #[test]
    fn foreground_regained_without_interruption_is_a_noop() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        let fx = c.handle(PlayerEvent::ForegroundRegained, now + Duration::from_secs(5));
        assert!(fx.is_empty());
        assert_eq!(c.phase(), Phase::Playing);
    }

    #[test]
    fn network_restored_reloads_only_wanted_playback() {
        let mut c = controller();
        let now = t0();

        // Nothing wanted yet: no effect.
        assert!(c.handle(PlayerEvent::NetworkRestored, now).is_empty());

        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        c.handle(PlayerEvent::NativePause, now + Duration::from_secs(5));
        assert_eq!(c.phase(), Phase::Interrupted);

        let fx = c.handle(PlayerEvent::NetworkRestored, now + Duration::from_secs(6));
        assert_eq!(fx, vec![Effect::StartPlayback { reload: true }]);
    }

    #[test]
    fn network_restored_while_playing_is_a_noop() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        assert!(c
            .handle(PlayerEvent::NetworkRestored, now + Duration::from_secs(5))
            .is_empty());
    }

    #[test]
    fn manual_pause_and_interruption_never_coexist() {
        let mut c = controller();
        let now = t0();
        c.handle(PlayerEvent::PlayRequested { force_reload: false }, now);
        c.handle(PlayerEvent::StartSucceeded, now);
        c.handle(PlayerEvent::NativePause, now + Duration::from_secs(5));
        assert!(c.intent().interrupted_by_system);

        c.handle(PlayerEvent::PauseRequested, now + Duration::from_secs(6));
        assert!(c.intent().invariants_hold());
        assert!(c.intent().manual_pause);
        assert!(!c.intent().interrupted_by_system);
    }

    #[test]
    fn cache_busted_appends_and_replaces() {
        assert_eq!(
            cache_busted("https://radio.example/live", 17),
            "https://radio.example/live?ts=17"
        );
        assert_eq!(
            cache_busted("https://radio.example/live?fmt=mp3", 17),
            "https://radio.example/live?fmt=mp3&ts=17"
        );
        assert_eq!(
            cache_busted("https://radio.example/live?ts=3&fmt=mp3", 17),
            "https://radio.example/live?fmt=mp3&ts=17"
        );
        assert_eq!(
            cache_busted("https://radio.example/live?ts=3", 17),
            "https://radio.example/live?ts=17"
        );
    }
}
