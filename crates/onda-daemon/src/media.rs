//! mpv IPC driver — the media backend behind the recovery controller.
//!
//! Architecture:
//!
//! ```text
//!   MediaDriver::spawn_and_connect()
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event / property-change   → event_tx channel
//! ```
//!
//! Raw IPC traffic is translated into the small media-element vocabulary the
//! recovery controller understands ([`MediaEvent`]) by [`MediaEventMapper`],
//! which is pure and unit-tested.
//!
//! Platform notes:
//! - Unix:    Unix domain sockets
//! - Windows: named pipes  \\.\pipe\<name>

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("mpv binary not found")]
    BinaryNotFound,
    #[error("mpv IPC socket did not appear")]
    SocketMissing,
    #[error("mpv IPC transport error: {0}")]
    Transport(String),
    #[error("mpv IPC timeout for request {0}")]
    Timeout(u64),
    #[error("mpv rejected command: {0}")]
    Command(String),
}

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<Result<Value, MediaError>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct IpcEvent {
    pub raw: Value,
}

impl IpcEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    fn end_file_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }
}

/// What the backend just did, in media-element terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    /// Audio started (or resumed) flowing.
    Playing,
    /// The backend paused without a stop having been issued here.
    Paused,
    /// Audio stopped flowing mid-stream but the file is still loaded.
    Stalled,
    /// The stream ended normally.
    Ended,
    /// The stream died (decode/network error, backend quit).
    Errored,
}

/// Folds raw IPC traffic into [`MediaEvent`]s.  Keeps the little bit of
/// observed state needed to tell a startup buffer from a mid-stream stall.
#[derive(Debug, Default)]
pub struct MediaEventMapper {
    obs_pause: Option<bool>,
    obs_core_idle: Option<bool>,
    loaded: bool,
}

impl MediaEventMapper {
    /// True while a file/stream is loaded in the backend.
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    /// Must be called after every fresh connection: observed values from the
    /// previous process no longer apply.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn map(&mut self, event: &IpcEvent) -> Vec<MediaEvent> {
        if let Some((obs_id, data)) = event.as_property_change() {
            return match obs_id {
                OBS_PAUSE => {
                    let val = data.as_bool().unwrap_or(false);
                    let prev = self.obs_pause.replace(val);
                    match (prev, val) {
                        (Some(false), true) | (None, true) => vec![MediaEvent::Paused],
                        (Some(true), false) => {
                            if self.obs_core_idle == Some(false) {
                                vec![MediaEvent::Playing]
                            } else {
                                Vec::new()
                            }
                        }
                        _ => Vec::new(),
                    }
                }
                OBS_CORE_IDLE => {
                    let val = match data.as_bool() {
                        Some(v) => v,
                        None => return Vec::new(),
                    };
                    let prev = self.obs_core_idle.replace(val);
                    if !val {
                        vec![MediaEvent::Playing]
                    } else if prev == Some(false)
                        && self.loaded
                        && self.obs_pause != Some(true)
                    {
                        // Audio had been flowing and dried up without a pause:
                        // a stall, not initial buffering.
                        vec![MediaEvent::Stalled]
                    } else {
                        Vec::new()
                    }
                }
                _ => Vec::new(),
            };
        }

        match event.event_name() {
            Some("start-file") => {
                self.loaded = true;
                Vec::new()
            }
            Some("end-file") => {
                self.loaded = false;
                self.obs_core_idle = None;
                match event.end_file_reason() {
                    Some("eof") => vec![MediaEvent::Ended],
                    Some("error") | Some("network") | Some("quit") => vec![MediaEvent::Errored],
                    // "stop" / "redirect": a stop we issued ourselves, or an
                    // internal playlist redirect — nothing to recover from.
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MediaHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MediaHandle {
    pub async fn send(&self, command: Value) -> Result<Value, MediaError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MediaError::Transport("writer task gone".into()))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| MediaError::Timeout(req_id))?
            .map_err(|_| MediaError::Transport(format!("reply channel dropped req={}", req_id)))?
    }

    /// Load the stream URL and apply the current volume.
    pub async fn load(&self, url: &str, volume: f32) -> Result<(), MediaError> {
        self.send(json!(["loadfile", url])).await?;
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        let _ = self.send(json!(["set_property", "volume", vol_pct])).await;
        let _ = self.send(json!(["set_property", "pause", false])).await;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> Result<(), MediaError> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn set_mute(&self, muted: bool) -> Result<(), MediaError> {
        self.send(json!(["set_property", "mute", muted])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), MediaError> {
        let _ = self.send(json!(["stop"])).await;
        Ok(())
    }

    pub async fn set_volume(&self, vol: f32) -> Result<(), MediaError> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    /// Register observe_property for the properties we react to.  Must be
    /// called after every fresh connection; mpv then pushes property-change
    /// events whenever a value changes.
    pub async fn observe_playback_properties(&self) {
        let props = [(OBS_CORE_IDLE, "core-idle"), (OBS_PAUSE, "pause")];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }

    /// Health-check: returns Ok(()) if mpv is responsive.
    pub async fn ping(&self) -> Result<(), MediaError> {
        self.send(json!(["get_property", "volume"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and manages (re)connection.
///
/// After `spawn_and_connect()`, a `MediaHandle` + event channel are live.
/// If the process dies, the next `spawn_and_connect()` starts fresh.
pub struct MediaDriver {
    pub socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MediaDriver {
    pub fn new() -> Self {
        Self {
            socket_name: onda_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: 0.5,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> Result<(), MediaError> {
        let mpv_binary =
            onda_proto::platform::find_mpv_binary().ok_or(MediaError::BinaryNotFound)?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let ipc_arg = onda_proto::platform::mpv_socket_arg();

        info!("mpv: spawning new process");
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<IpcEvent>,
    ) -> Result<MediaHandle, MediaError> {
        // Kill stale process and clear its socket
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process()?;

        // Wait for the socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            return Err(MediaError::SocketMissing);
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        info!("mpv: connected to IPC socket");
        Ok(Self::start_io_tasks(stream, event_tx))
    }

    #[cfg(unix)]
    fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<IpcEvent>) -> MediaHandle {
        let (read_half, write_half) = stream.into_split();
        Self::start_io_tasks_inner(BufReader::new(read_half), write_half, event_tx)
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<IpcEvent>,
    ) -> Result<MediaHandle, MediaError> {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }

        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(Self::start_io_tasks_inner(
                    BufReader::new(read_half),
                    write_half,
                    event_tx,
                ));
            }
        }
        Err(MediaError::SocketMissing)
    }

    fn start_io_tasks_inner<R, W>(
        reader: BufReader<R>,
        writer: W,
        event_tx: mpsc::Sender<IpcEvent>,
    ) -> MediaHandle
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        // pending map: req_id → reply channel.  Shared between writer
        // (inserts) and reader (resolves).
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, MediaError>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(reader, pending, event_tx));

        MediaHandle { tx: cmd_tx }
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, MediaError>>>>>,
    event_tx: mpsc::Sender<IpcEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all_pending(&pending, "IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    // Command response — route to the pending request
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(MediaError::Command(err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    // Unsolicited event / property-change
                    if event_tx.send(IpcEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all_pending(&pending, &format!("IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn fail_all_pending(
    pending: &Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, MediaError>>>>>,
    reason: &str,
) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(MediaError::Transport(reason.to_string())));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, MediaError>>>>>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(MediaError::Transport(e.to_string())));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop_change(id: u64, data: Value) -> IpcEvent {
        IpcEvent {
            raw: json!({ "event": "property-change", "id": id, "data": data }),
        }
    }

    fn named(name: &str, reason: Option<&str>) -> IpcEvent {
        let raw = match reason {
            Some(r) => json!({ "event": name, "reason": r }),
            None => json!({ "event": name }),
        };
        IpcEvent { raw }
    }

    #[test]
    fn core_idle_false_means_playing() {
        let mut m = MediaEventMapper::default();
        m.map(&named("start-file", None));
        let ev = m.map(&prop_change(OBS_CORE_IDLE, json!(false)));
        assert_eq!(ev, vec![MediaEvent::Playing]);
    }

    #[test]
    fn startup_buffering_is_not_a_stall() {
        let mut m = MediaEventMapper::default();
        m.map(&named("start-file", None));
        // core-idle true before audio ever flowed: just buffering.
        let ev = m.map(&prop_change(OBS_CORE_IDLE, json!(true)));
        assert!(ev.is_empty());
    }

    #[test]
    fn drying_up_mid_stream_is_a_stall() {
        let mut m = MediaEventMapper::default();
        m.map(&named("start-file", None));
        m.map(&prop_change(OBS_CORE_IDLE, json!(false)));
        let ev = m.map(&prop_change(OBS_CORE_IDLE, json!(true)));
        assert_eq!(ev, vec![MediaEvent::Stalled]);
    }

    #[test]
    fn idle_after_our_own_pause_is_not_a_stall() {
        let mut m = MediaEventMapper::default();
        m.map(&named("start-file", None));
        m.map(&prop_change(OBS_CORE_IDLE, json!(false)));
        m.map(&prop_change(OBS_PAUSE, json!(true)));
        let ev = m.map(&prop_change(OBS_CORE_IDLE, json!(true)));
        assert!(ev.is_empty());
    }

    #[test]
    fn pause_flip_reports_paused_once() {
        let mut m = MediaEventMapper::default();
        m.map(&named("start-file", None));
        m.map(&prop_change(OBS_CORE_IDLE, json!(false)));
        assert_eq!(
            m.map(&prop_change(OBS_PAUSE, json!(true))),
            vec![MediaEvent::Paused]
        );
        // Repeated value: no new event.
        assert!(m.map(&prop_change(OBS_PAUSE, json!(true))).is_empty());
    }

    #[test]
    fn end_file_reasons_split_ended_from_errored() {
        let mut m = MediaEventMapper::default();
        m.map(&named("start-file", None));
        assert_eq!(
            m.map(&named("end-file", Some("eof"))),
            vec![MediaEvent::Ended]
        );

        m.map(&named("start-file", None));
        assert_eq!(
            m.map(&named("end-file", Some("network"))),
            vec![MediaEvent::Errored]
        );

        m.map(&named("start-file", None));
        assert!(m.map(&named("end-file", Some("stop"))).is_empty());
        assert!(!m.loaded());
    }
}
