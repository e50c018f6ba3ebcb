//! Spectrum — the bar animation that runs while the stream is audible.
//!
//! Purely decorative: bars jump to random heights on every tick during
//! playback and decay to the floor when playback stops, so the user can see
//! at a glance whether the player believes audio is flowing.

use rand::Rng;
use ratatui::{
    layout::Rect,
    style::{Color, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

use crate::theme::{C_BAR_HIGH, C_BAR_LOW};

pub const BAR_COUNT: usize = 16;

/// Decay multiplier applied per tick once playback stops.
const DECAY: f32 = 0.78;

/// Partial blocks for the top cell of a bar, 1/8th steps.
const PARTIALS: [char; 7] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇'];

#[derive(Debug)]
pub struct SpectrumState {
    heights: [f32; BAR_COUNT],
}

impl Default for SpectrumState {
    fn default() -> Self {
        Self {
            heights: [0.0; BAR_COUNT],
        }
    }
}

impl SpectrumState {
    /// Advance one animation frame.  While playing every bar gets a fresh
    /// random height; otherwise the bars fall towards the floor.
    pub fn tick(&mut self, playing: bool, rng: &mut impl Rng) {
        for h in &mut self.heights {
            if playing {
                *h = rng.gen_range(0.05..=1.0);
            } else {
                *h *= DECAY;
                if *h < 0.01 {
                    *h = 0.0;
                }
            }
        }
    }

    pub fn heights(&self) -> &[f32; BAR_COUNT] {
        &self.heights
    }

    pub fn is_settled(&self) -> bool {
        self.heights.iter().all(|h| *h == 0.0)
    }
}

fn bar_color(height: f32) -> Color {
    let t = height.clamp(0.0, 1.0);
    let lerp = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
    match (C_BAR_LOW, C_BAR_HIGH) {
        (Color::Rgb(r1, g1, b1), Color::Rgb(r2, g2, b2)) => {
            Color::Rgb(lerp(r1, r2), lerp(g1, g2), lerp(b1, b2))
        }
        _ => C_BAR_LOW,
    }
}

/// Build the frame as lines, top row first.  Each bar is two cells wide with
/// a one-cell gap; the top cell of a bar uses a partial block.
pub fn build_lines(state: &SpectrumState, width: usize, height: usize) -> Vec<Line<'static>> {
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let bar_cells = 3; // 2 filled + 1 gap
    let drawable = (width / bar_cells).min(BAR_COUNT);
    let left_pad = width.saturating_sub(drawable * bar_cells) / 2;

    let mut lines = Vec::with_capacity(height);
    for row in 0..height {
        // Rows are emitted top-down; row 0 is the tallest position.
        let row_from_bottom = height - 1 - row;
        let mut spans: Vec<Span<'static>> = Vec::new();
        spans.push(Span::raw(" ".repeat(left_pad)));

        for bar in 0..drawable {
            let h = state.heights()[bar].clamp(0.0, 1.0);
            let total_eighths = (h * height as f32 * 8.0).round() as usize;
            let full_cells = total_eighths / 8;
            let partial = total_eighths % 8;

            let ch = if row_from_bottom < full_cells {
                '█'
            } else if row_from_bottom == full_cells && partial > 0 {
                PARTIALS[partial - 1]
            } else {
                ' '
            };

            let cell: String = [ch, ch, ' '].iter().collect();
            spans.push(Span::styled(cell, Style::default().fg(bar_color(h))));
        }

        lines.push(Line::from(spans));
    }
    lines
}

pub fn draw(frame: &mut Frame, area: Rect, state: &SpectrumState) {
    if area.width == 0 || area.height == 0 {
        return;
    }
    let lines = build_lines(state, area.width as usize, area.height as usize);
    frame.render_widget(Paragraph::new(lines), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn playing_ticks_randomize_all_bars() {
        let mut state = SpectrumState::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        state.tick(true, &mut rng);
        assert!(state.heights().iter().all(|h| *h > 0.0 && *h <= 1.0));
    }

    #[test]
    fn stopped_bars_decay_to_the_floor() {
        let mut state = SpectrumState::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        state.tick(true, &mut rng);
        for _ in 0..40 {
            state.tick(false, &mut rng);
        }
        assert!(state.is_settled());
    }

    #[test]
    fn build_lines_fills_requested_height() {
        let mut state = SpectrumState::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        state.tick(true, &mut rng);
        let lines = build_lines(&state, 60, 8);
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn zero_area_renders_nothing() {
        let state = SpectrumState::default();
        assert!(build_lines(&state, 0, 8).is_empty());
        assert!(build_lines(&state, 60, 0).is_empty());
    }
}
