//! End-to-end sequences through the recovery controller, driven the way the
//! daemon loop drives it: events in, effects executed (here: recorded),
//! timer firings re-entered as `RetryDue`.

use std::time::{Duration, Instant};

use onda_proto::resilience::{
    Effect, PlayerEvent, Phase, RecoveryController, RecoverySettings, RetryKind,
};

fn drive(
    c: &mut RecoveryController,
    events: &[(PlayerEvent, u64)],
    base: Instant,
) -> Vec<Effect> {
    let mut all = Vec::new();
    for (event, at_ms) in events {
        all.extend(c.handle(*event, base + Duration::from_millis(*at_ms)));
    }
    all
}

#[test]
fn os_interruption_resumes_once_on_foreground() {
    let mut c = RecoveryController::new(RecoverySettings::default());
    let base = Instant::now();

    let effects = drive(
        &mut c,
        &[
            (PlayerEvent::PlayRequested { force_reload: false }, 0),
            (PlayerEvent::StartSucceeded, 100),
            // A phone call takes audio focus five seconds in.
            (PlayerEvent::NativePause, 5_000),
            (PlayerEvent::ForegroundRegained, 20_000),
        ],
        base,
    );

    let starts: Vec<_> = effects
        .iter()
        .filter(|e| matches!(e, Effect::StartPlayback { .. }))
        .collect();
    // One start for the initial play, exactly one more for the resume —
    // and the resume must not reload.
    assert_eq!(starts.len(), 2);
    assert_eq!(*starts[1], Effect::StartPlayback { reload: false });
    assert!(!c.intent().interrupted_by_system);

    // A second foreground event changes nothing further once the start
    // confirmation lands.
    c.handle(PlayerEvent::StartSucceeded, base + Duration::from_millis(20_100));
    let fx = c.handle(
        PlayerEvent::ForegroundRegained,
        base + Duration::from_millis(21_000),
    );
    assert!(fx.is_empty());
}

#[test]
fn ghost_pause_storm_never_marks_interruption() {
    let mut c = RecoveryController::new(RecoverySettings::default());
    let base = Instant::now();

    drive(
        &mut c,
        &[
            (PlayerEvent::PlayRequested { force_reload: false }, 0),
            (PlayerEvent::StartSucceeded, 50),
            (PlayerEvent::NativePause, 100),
            (PlayerEvent::NativePause, 600),
            (PlayerEvent::NativePause, 1_199),
        ],
        base,
    );

    assert!(!c.intent().interrupted_by_system);
    assert_eq!(c.phase(), Phase::Playing);
}

#[test]
fn manual_pause_outlives_every_pending_timer() {
    let mut c = RecoveryController::new(RecoverySettings::default());
    let base = Instant::now();

    let effects = drive(
        &mut c,
        &[
            (PlayerEvent::PlayRequested { force_reload: false }, 0),
            (PlayerEvent::StartSucceeded, 50),
            (PlayerEvent::NativeStalled, 5_000),
            (PlayerEvent::NativeError, 5_100),
            (PlayerEvent::PauseRequested, 5_200),
            // Both timers fire after the pause.
            (PlayerEvent::RetryDue(RetryKind::Resume), 5_600),
            (PlayerEvent::RetryDue(RetryKind::Reload), 5_700),
            // So do later ambient signals.
            (PlayerEvent::NetworkRestored, 6_000),
            (PlayerEvent::ForegroundRegained, 7_000),
        ],
        base,
    );

    // Exactly one start: the initial play.  Nothing after the pause.
    let starts = effects
        .iter()
        .filter(|e| matches!(e, Effect::StartPlayback { .. }))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(c.phase(), Phase::Paused);
}

#[test]
fn stream_error_reloads_after_backoff() {
    let settings = RecoverySettings::default();
    let mut c = RecoveryController::new(settings);
    let base = Instant::now();

    c.handle(
        PlayerEvent::PlayRequested { force_reload: false },
        base,
    );
    c.handle(PlayerEvent::StartSucceeded, base + Duration::from_millis(50));

    let fx = c.handle(PlayerEvent::NativeError, base + Duration::from_secs(60));
    assert_eq!(
        fx,
        vec![Effect::ScheduleRetry {
            kind: RetryKind::Reload,
            delay: settings.error_reload_delay,
        }]
    );

    let fx = c.handle(
        PlayerEvent::RetryDue(RetryKind::Reload),
        base + Duration::from_secs(60) + settings.error_reload_delay,
    );
    assert_eq!(fx, vec![Effect::StartPlayback { reload: true }]);
    assert_eq!(c.phase(), Phase::Starting);
}

#[test]
fn refused_start_stays_idle_until_the_user_retries() {
    let mut c = RecoveryController::new(RecoverySettings::default());
    let base = Instant::now();

    let effects = drive(
        &mut c,
        &[
            (PlayerEvent::PlayRequested { force_reload: false }, 0),
            (PlayerEvent::StartFailed, 200),
            // Ambient signals must not turn a refused start into a loop.
            (PlayerEvent::NetworkRestored, 1_000),
            (PlayerEvent::ForegroundRegained, 2_000),
        ],
        base,
    );

    let starts = effects
        .iter()
        .filter(|e| matches!(e, Effect::StartPlayback { .. }))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(c.phase(), Phase::Idle);

    // The manual retry affordance still works.
    let fx = c.handle(
        PlayerEvent::PlayRequested { force_reload: true },
        base + Duration::from_secs(3),
    );
    assert_eq!(fx, vec![Effect::StartPlayback { reload: true }]);
}

#[test]
fn connectivity_loss_while_backgrounded_recovers_with_reload() {
    let mut c = RecoveryController::new(RecoverySettings::default());
    let base = Instant::now();

    drive(
        &mut c,
        &[
            (PlayerEvent::PlayRequested { force_reload: false }, 0),
            (PlayerEvent::StartSucceeded, 50),
            // Backgrounded, then the network drops: the backend pauses.
            (PlayerEvent::NativePause, 30_000),
        ],
        base,
    );
    assert_eq!(c.phase(), Phase::Interrupted);

    let fx = c.handle(
        PlayerEvent::NetworkRestored,
        base + Duration::from_secs(90),
    );
    assert_eq!(fx, vec![Effect::StartPlayback { reload: true }]);
}
