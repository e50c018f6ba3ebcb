//! DaemonCore — single-owner event loop for all playback state.
//!
//! All tasks that need to influence playback send `DaemonEvent` messages to
//! this loop.  DaemonCore owns the recovery controller, the media driver and
//! the `StateManager` exclusively; no other task touches them.
//!
//! The recovery controller is pure: it returns effects, and this loop is
//! where they become real — mpv commands, fire-and-forget retry timers
//! (which re-enter as `RetryDue`), and state broadcasts.  After each event
//! that changes the playback phase, DaemonCore broadcasts
//! `BroadcastMessage::StateUpdated` to all listeners.

use std::sync::Arc;
use std::time::Instant;

use onda_proto::config::Config;
use onda_proto::protocol::{Command, MediaHealth};
use onda_proto::resilience::{
    cache_busted, Effect, PlayerEvent, Phase, RecoveryController, RetryKind,
};
use onda_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::media::{IpcEvent, MediaDriver, MediaError, MediaEvent, MediaEventMapper, MediaHandle};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from the TUI or HTTP API.
    ClientCommand(Command),
    /// Raw mpv unsolicited event (forwarded from the reader task).
    Media(IpcEvent),
    /// A retry timer armed earlier has elapsed.
    RetryDue(RetryKind),
    /// The network watcher saw the stream origin come back.
    NetworkUp,
    /// The network watcher lost the stream origin.
    NetworkDown,
    /// Heartbeat — check process liveness.
    HeartbeatTick,
    /// Shutdown requested.
    #[allow(dead_code)]
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    config: Config,
    state_manager: Arc<StateManager>,
    controller: RecoveryController,
    driver: MediaDriver,
    /// Live handle to the mpv IO tasks.  `None` when mpv is not connected.
    handle: Option<MediaHandle>,
    mapper: MediaEventMapper,
    /// Channel to forward media events and timer firings into our own loop.
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    media_health: MediaHealth,
    /// Last phase pushed to the state manager (to avoid redundant broadcasts).
    last_phase: Phase,
}

impl DaemonCore {
    pub async fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        let state_manager = Arc::new(StateManager::new(
            config.daemon.state_file.clone(),
            config.station.name.clone(),
            config.station.url.clone(),
        ));

        let initial_volume = state_manager.get_state().await.volume;
        let mut driver = MediaDriver::new();
        driver.last_volume = initial_volume;

        let controller = RecoveryController::new(config.recovery.settings());

        Ok(Self {
            config,
            state_manager,
            controller,
            driver,
            handle: None,
            mapper: MediaEventMapper::default(),
            event_tx,
            broadcast_tx,
            media_health: MediaHealth::Absent,
            last_phase: Phase::Idle,
        })
    }

    /// Borrow the state manager (for the socket and HTTP servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or the event channel is closed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        // Heartbeat ticker — process liveness checks.
        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
                if heartbeat_tx.send(DaemonEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let evt = event_rx.recv().await;
            match evt {
                None => {
                    info!("DaemonCore: event channel closed, shutting down");
                    break;
                }

                Some(DaemonEvent::Shutdown) => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }

                Some(DaemonEvent::ClientCommand(cmd)) => {
                    info!("DaemonCore: command {:?}", cmd);
                    if let Err(e) = self.handle_command(cmd).await {
                        error!("DaemonCore: command error: {}", e);
                    }
                }

                Some(DaemonEvent::Media(evt)) => {
                    debug!("mpv event: {:?}", evt.raw);
                    let mapped = self.mapper.map(&evt);
                    for media_event in mapped {
                        let player_event = match media_event {
                            MediaEvent::Playing => PlayerEvent::NativePlaying,
                            MediaEvent::Paused => PlayerEvent::NativePause,
                            MediaEvent::Stalled => PlayerEvent::NativeStalled,
                            MediaEvent::Ended => PlayerEvent::NativeEnded,
                            MediaEvent::Errored => PlayerEvent::NativeError,
                        };
                        self.apply(player_event).await;
                    }
                }

                Some(DaemonEvent::RetryDue(kind)) => {
                    debug!("DaemonCore: retry timer fired: {:?}", kind);
                    self.apply(PlayerEvent::RetryDue(kind)).await;
                }

                Some(DaemonEvent::NetworkUp) => {
                    self.state_manager.set_online(true).await;
                    let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
                    self.apply(PlayerEvent::NetworkRestored).await;
                }

                Some(DaemonEvent::NetworkDown) => {
                    warn!("DaemonCore: stream origin unreachable");
                    self.state_manager.set_online(false).await;
                    let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
                }

                Some(DaemonEvent::HeartbeatTick) => {
                    self.check_process_liveness().await;
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    // ── recovery controller plumbing ──────────────────────────────────────────

    /// Feed one event through the controller and execute the resulting
    /// effects.  Start attempts complete with a follow-up event
    /// (`StartSucceeded`/`StartFailed`) which is fed back in the same pass.
    async fn apply(&mut self, event: PlayerEvent) {
        let mut queue = vec![event];
        while let Some(ev) = queue.pop() {
            let effects = self.controller.handle(ev, Instant::now());
            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push(follow_up);
                }
            }
        }
        self.sync_phase().await;
    }

    async fn execute(&mut self, effect: Effect) -> Option<PlayerEvent> {
        match effect {
            Effect::StartPlayback { reload } => match self.start_playback(reload).await {
                Ok(()) => Some(PlayerEvent::StartSucceeded),
                Err(e) => {
                    warn!("DaemonCore: start attempt failed: {}", e);
                    Some(PlayerEvent::StartFailed)
                }
            },

            Effect::StopPlayback => {
                if let Some(handle) = self.handle.as_ref() {
                    if let Err(e) = handle.set_pause(true).await {
                        warn!("DaemonCore: pause failed: {}", e);
                    }
                }
                None
            }

            Effect::ScheduleRetry { kind, delay } => {
                // Fire-and-forget: never cancelled.  The controller
                // re-validates intent when the timer re-enters as RetryDue.
                debug!("DaemonCore: arming {:?} retry in {:?}", kind, delay);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(DaemonEvent::RetryDue(kind)).await;
                });
                None
            }
        }
    }

    /// Push the controller's phase into the shared state when it changed.
    async fn sync_phase(&mut self) {
        let phase = self.controller.phase();
        if phase != self.last_phase {
            info!("DaemonCore: phase {:?} → {:?}", self.last_phase, phase);
            self.last_phase = phase;
            self.state_manager.set_phase(phase).await;
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    // ── playback start ────────────────────────────────────────────────────────

    /// One start attempt, optionally preceded by a muted fallback retry.
    /// With `reload`, the source is re-fetched under a fresh `ts` stamp so
    /// upstream caches cannot serve the dead connection again.
    async fn start_playback(&mut self, reload: bool) -> Result<(), MediaError> {
        let volume = self.state_manager.get_state().await.volume;
        let handle = self.ensure_media_handle().await?;

        match self.issue_start(&handle, reload, volume).await {
            Ok(()) => Ok(()),
            Err(e) if self.config.media.muted_start_fallback => {
                warn!("DaemonCore: start refused ({}), retrying muted", e);
                let _ = handle.set_mute(true).await;
                let result = self.issue_start(&handle, reload, volume).await;
                tokio::time::sleep(self.config.recovery.unmute_delay()).await;
                let _ = handle.set_mute(false).await;
                result
            }
            Err(e) => Err(e),
        }
    }

    async fn issue_start(
        &mut self,
        handle: &MediaHandle,
        reload: bool,
        volume: f32,
    ) -> Result<(), MediaError> {
        let base_url = &self.config.station.url;
        if reload || !self.mapper.loaded() {
            let target = if reload {
                cache_busted(base_url, chrono::Utc::now().timestamp_millis())
            } else {
                base_url.clone()
            };
            info!("DaemonCore: loading stream {}", target);
            handle.load(&target, volume).await
        } else {
            handle.set_pause(false).await
        }
    }

    // ── media handle management ───────────────────────────────────────────────

    async fn set_media_health(&mut self, health: MediaHealth) {
        if self.media_health != health {
            info!(
                "DaemonCore: media health {:?} → {:?}",
                self.media_health, health
            );
            self.media_health = health.clone();
            self.state_manager.set_media_health(health).await;
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    async fn ensure_media_handle(&mut self) -> Result<MediaHandle, MediaError> {
        // Drop a handle whose process died underneath it.
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("DaemonCore: mpv process died, dropping handle");
            self.handle = None;
            self.mapper.reset();
            self.set_media_health(MediaHealth::Dead).await;
        }

        if let Some(handle) = self.handle.as_ref() {
            return Ok(handle.clone());
        }

        {
            let starting = if self.media_health == MediaHealth::Dead {
                MediaHealth::Restarting
            } else {
                MediaHealth::Starting
            };
            self.set_media_health(starting).await;

            // Single forwarder task per connection: raw IPC events flow into
            // the core loop as DaemonEvent::Media.
            let (ipc_tx, mut ipc_rx) = mpsc::channel::<IpcEvent>(64);
            let core_tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some(evt) = ipc_rx.recv().await {
                    if core_tx.send(DaemonEvent::Media(evt)).await.is_err() {
                        break;
                    }
                }
            });

            let handle = match self.driver.spawn_and_connect(ipc_tx).await {
                Ok(h) => h,
                Err(e) => {
                    warn!("DaemonCore: failed to start mpv: {}", e);
                    self.set_media_health(MediaHealth::Dead).await;
                    return Err(e);
                }
            };

            self.mapper.reset();
            self.set_media_health(MediaHealth::Running).await;

            // Register property observations on the fresh connection.
            let h = handle.clone();
            tokio::spawn(async move {
                h.observe_playback_properties().await;
            });

            self.handle = Some(handle.clone());
            Ok(handle)
        }
    }

    async fn check_process_liveness(&mut self) {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("DaemonCore: heartbeat: mpv process died");
            self.handle = None;
            self.mapper.reset();
            self.set_media_health(MediaHealth::Dead).await;
            // A dead backend mid-play is indistinguishable from a dead
            // stream: let the error path respawn and reload.
            if self.controller.intent().desired_playing
                && !self.controller.intent().manual_pause
            {
                self.apply(PlayerEvent::NativeError).await;
            }
            return;
        }

        // Process alive: make sure IPC still answers.
        if let Some(handle) = self.handle.clone() {
            match handle.ping().await {
                Ok(()) => {
                    if matches!(self.media_health, MediaHealth::Degraded(_)) {
                        self.set_media_health(MediaHealth::Running).await;
                    }
                }
                Err(e) => {
                    warn!("DaemonCore: heartbeat: mpv IPC unresponsive: {}", e);
                    self.set_media_health(MediaHealth::Degraded(e.to_string())).await;
                }
            }
        }
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play { force_reload } => {
                self.apply(PlayerEvent::PlayRequested { force_reload }).await;
            }
            Command::Pause => {
                self.apply(PlayerEvent::PauseRequested).await;
            }
            Command::TogglePause => {
                let event = match self.controller.phase() {
                    Phase::Playing | Phase::Starting | Phase::Retrying => {
                        PlayerEvent::PauseRequested
                    }
                    Phase::Idle | Phase::Paused | Phase::Interrupted => {
                        PlayerEvent::PlayRequested { force_reload: false }
                    }
                };
                self.apply(event).await;
            }
            Command::Volume { value } => {
                self.state_manager.set_volume(value).await?;
                self.driver.last_volume = value;
                if let Some(handle) = self.handle.as_ref() {
                    if let Err(e) = handle.set_volume(value).await {
                        warn!("DaemonCore: set_volume failed: {}", e);
                    }
                }
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::ForegroundRegained => {
                self.apply(PlayerEvent::ForegroundRegained).await;
            }
            Command::GetState => {
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
        }
        Ok(())
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    async fn cleanup(&mut self) {
        info!("DaemonCore: cleanup — killing mpv");
        if let Some(handle) = self.handle.take() {
            let _ = handle.stop().await;
        }
        self.driver.kill().await;
    }
}
