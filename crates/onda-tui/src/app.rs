//! App — event loop and rendering.
//!
//! - A `tokio::mpsc` channel carries `AppMessage` events in from background
//!   tasks (terminal events, daemon broadcasts, connection status).
//! - Commands to the daemon flow out through a separate `cmd_tx` channel.
//! - An animation interval drives the spectrum while the daemon says audio
//!   is flowing.
//! - Terminal focus-regained is forwarded to the daemon, which uses it to
//!   resume playback that an interruption took away.

use std::io;
use std::time::Duration;

use ratatui::crossterm::{
    event::{
        self, DisableFocusChange, EnableFocusChange, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame, Terminal,
};
use tokio::sync::mpsc;
use tracing::{debug, info};
use unicode_width::UnicodeWidthStr;

use onda_proto::protocol::{Command, DaemonState};
use onda_proto::resilience::Phase;

use crate::theme::{
    self, C_ACCENT, C_CONNECTING, C_ERROR, C_MUTED, C_PLAYING, C_SECONDARY,
};
use crate::widgets::{spectrum, status_bar};

const ANIM_FRAME: Duration = Duration::from_millis(100);
const VOLUME_STEP: f32 = 0.05;

#[derive(Debug)]
pub enum AppMessage {
    /// A raw terminal event (key, focus, resize).
    Event(Event),
    /// Fresh daemon state snapshot.
    StateUpdated(DaemonState),
    /// Daemon connection came up / went down.
    Connected(bool),
    /// A log line broadcast by the daemon.
    LogLine(String),
}

pub struct App {
    state: DaemonState,
    connected: bool,
    last_log: Option<String>,
    spectrum: spectrum::SpectrumState,
    cmd_tx: mpsc::Sender<Command>,
    should_quit: bool,
}

impl App {
    pub fn new(initial_state: DaemonState, cmd_tx: mpsc::Sender<Command>) -> Self {
        Self {
            state: initial_state,
            connected: false,
            last_log: None,
            spectrum: spectrum::SpectrumState::default(),
            cmd_tx,
            should_quit: false,
        }
    }

    pub async fn run(
        mut self,
        msg_tx: mpsc::Sender<AppMessage>,
        mut msg_rx: mpsc::Receiver<AppMessage>,
    ) -> anyhow::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        // Background task: terminal events
        let event_tx = msg_tx.clone();
        tokio::task::spawn_blocking(move || loop {
            match event::read() {
                Ok(ev) => {
                    if event_tx.blocking_send(AppMessage::Event(ev)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        });

        let mut anim = tokio::time::interval(ANIM_FRAME);
        anim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            terminal.draw(|frame| self.draw(frame))?;

            tokio::select! {
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_message(msg).await;
                }
                _ = anim.tick() => {
                    let playing = self.state.phase == Phase::Playing;
                    if playing || !self.spectrum.is_settled() {
                        let mut rng = rand::thread_rng();
                        self.spectrum.tick(playing, &mut rng);
                    }
                }
            }

            if self.should_quit {
                break;
            }
        }

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableFocusChange
        )?;
        terminal.show_cursor()?;
        Ok(())
    }

    // ── message handling ──────────────────────────────────────────────────────

    async fn handle_message(&mut self, msg: AppMessage) {
        match msg {
            AppMessage::Event(ev) => match ev {
                Event::Key(key) => self.handle_key(key).await,
                Event::FocusGained => {
                    debug!("terminal focus regained");
                    self.send(Command::ForegroundRegained).await;
                }
                _ => {}
            },
            AppMessage::StateUpdated(state) => {
                self.state = state;
            }
            AppMessage::Connected(connected) => {
                self.connected = connected;
                if connected {
                    info!("daemon connection established");
                    self.send(Command::GetState).await;
                }
            }
            AppMessage::LogLine(line) => {
                self.last_log = Some(line);
            }
        }
    }

    async fn handle_key(&mut self, key: KeyEvent) {
        if key.kind == KeyEventKind::Release {
            return;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
            }
            KeyCode::Char(' ') | KeyCode::Enter => {
                self.send(Command::TogglePause).await;
            }
            // Manual retry: re-fetch the stream under a fresh stamp.  This is
            // the affordance that covers a start the backend refused.
            KeyCode::Char('r') => {
                self.send(Command::Play { force_reload: true }).await;
            }
            KeyCode::Left => {
                let value = (self.state.volume - VOLUME_STEP).max(0.0);
                self.send(Command::Volume { value }).await;
            }
            KeyCode::Right => {
                let value = (self.state.volume + VOLUME_STEP).min(1.0);
                self.send(Command::Volume { value }).await;
            }
            _ => {}
        }
    }

    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            debug!("command channel closed");
        }
    }

    // ── rendering ─────────────────────────────────────────────────────────────

    fn draw(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1), // header
                Constraint::Min(3),    // spectrum
                Constraint::Length(1), // separator
                Constraint::Length(1), // keys
                Constraint::Length(1), // log
            ])
            .split(frame.area());

        self.draw_header(frame, chunks[0]);
        spectrum::draw(frame, chunks[1], &self.spectrum);
        status_bar::draw_separator(frame, chunks[2]);
        status_bar::draw_keys_bar(frame, chunks[3]);
        status_bar::draw_log_bar(frame, chunks[4], self.last_log.as_deref(), self.connected);
    }

    fn draw_header(&self, frame: &mut Frame, area: Rect) {
        let (glyph, glyph_style) = if self.state.is_playing() {
            ("⏸", theme::style_playing())
        } else {
            ("▶", theme::style_secondary())
        };

        let (phase_label, phase_color) = phase_badge(self.state.phase);

        let name_max = (area.width as usize).saturating_sub(28);
        let name = fit_width(&self.state.station_name, name_max);

        let mut spans = vec![
            Span::raw(" "),
            Span::styled(glyph, glyph_style.add_modifier(Modifier::BOLD)),
            Span::raw("  "),
            Span::styled(name, theme::style_default().add_modifier(Modifier::BOLD)),
            Span::raw("  "),
            Span::styled(
                format!("[{}]", phase_label),
                Style::default().fg(phase_color),
            ),
            Span::raw("  "),
            Span::styled(
                format!("vol {:>3.0}%", self.state.volume * 100.0),
                Style::default().fg(C_SECONDARY),
            ),
        ];

        if !self.state.online {
            spans.push(Span::raw("  "));
            spans.push(Span::styled("OFFLINE", Style::default().fg(C_ERROR)));
        }
        if let Some(badge) = self.state.media_health.badge_label() {
            spans.push(Span::raw("  "));
            spans.push(Span::styled(badge, Style::default().fg(C_ACCENT)));
        }

        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }
}

fn phase_badge(phase: Phase) -> (&'static str, ratatui::style::Color) {
    match phase {
        Phase::Idle => ("IDLE", C_MUTED),
        Phase::Starting => ("TUNING", C_CONNECTING),
        Phase::Playing => ("ON AIR", C_PLAYING),
        Phase::Paused => ("PAUSED", C_SECONDARY),
        Phase::Interrupted => ("INTERRUPTED", C_ERROR),
        Phase::Retrying => ("RETRYING", C_CONNECTING),
    }
}

/// Truncate `s` to at most `max` display columns, appending "…" when cut.
fn fit_width(s: &str, max: usize) -> String {
    if s.width() <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in s.chars() {
        let w = ch.to_string().width();
        if used + w > max.saturating_sub(1) {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_width_leaves_short_names_alone() {
        assert_eq!(fit_width("Radio", 20), "Radio");
    }

    #[test]
    fn fit_width_truncates_with_ellipsis() {
        let out = fit_width("A very long station name indeed", 12);
        assert!(out.ends_with('…'));
        assert!(out.width() <= 12);
    }

    #[test]
    fn phase_badges_are_distinct() {
        let labels: Vec<&str> = [
            Phase::Idle,
            Phase::Starting,
            Phase::Playing,
            Phase::Paused,
            Phase::Interrupted,
            Phase::Retrying,
        ]
        .into_iter()
        .map(|p| phase_badge(p).0)
        .collect();
        let mut dedup = labels.clone();
        dedup.dedup();
        assert_eq!(labels.len(), dedup.len());
    }
}
