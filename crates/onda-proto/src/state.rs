use crate::protocol::{DaemonState, MediaHealth};
use crate::resilience::Phase;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The one record that survives restarts.  Playback intent never does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub volume: f32,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self { volume: 0.5 }
    }
}

/// Guards the shared [`DaemonState`] snapshot.  Every mutation bumps `rev`
/// so clients can detect missed updates.
pub struct StateManager {
    state: Arc<RwLock<DaemonState>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf, station_name: String, station_url: String) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let state = DaemonState {
            rev: 1,
            station_name,
            station_url,
            volume: persistent.volume,
            phase: Phase::Idle,
            online: true,
            media_health: MediaHealth::Absent,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<DaemonState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    pub async fn set_phase(&self, phase: Phase) {
        let mut state = self.state.write().await;
        state.phase = phase;
        state.rev += 1;
    }

    pub async fn set_online(&self, online: bool) {
        let mut state = self.state.write().await;
        state.online = online;
        state.rev += 1;
    }

    pub async fn set_media_health(&self, health: MediaHealth) {
        let mut state = self.state.write().await;
        state.media_health = health;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
            state.rev += 1;
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                volume: state.volume,
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &PathBuf) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rev_increases_on_every_mutation() {
        let dir = std::env::temp_dir().join("onda-state-test");
        let manager = StateManager::new(
            dir.join("state.json"),
            "Test FM".into(),
            "https://radio.example/live".into(),
        );

        let rev0 = manager.get_state().await.rev;
        manager.set_phase(Phase::Starting).await;
        manager.set_online(false).await;
        let state = manager.get_state().await;
        assert_eq!(state.rev, rev0 + 2);
        assert_eq!(state.phase, Phase::Starting);
        assert!(!state.online);
    }

    #[tokio::test]
    async fn volume_is_clamped() {
        let dir = std::env::temp_dir().join("onda-state-test-vol");
        let manager = StateManager::new(
            dir.join("state.json"),
            "Test FM".into(),
            "https://radio.example/live".into(),
        );
        manager.set_volume(1.7).await.unwrap();
        assert_eq!(manager.get_state().await.volume, 1.0);
    }
}
