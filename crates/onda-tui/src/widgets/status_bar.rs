//! Status bar — connection state, last log line, and keybindings.

use ratatui::{
    layout::Rect,
    style::Style,
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

use crate::theme::{C_ACCENT, C_MUTED, C_PLAYING, C_SECONDARY, C_SEPARATOR};

/// Draw the log bar: connection dot + last log line.
pub fn draw_log_bar(frame: &mut Frame, area: Rect, last_log: Option<&str>, connected: bool) {
    let conn_span = if connected {
        Span::styled("●", Style::default().fg(C_PLAYING))
    } else {
        Span::styled("○", Style::default().fg(C_ACCENT))
    };

    let log_span = Span::styled(last_log.unwrap_or(""), Style::default().fg(C_SECONDARY));

    let line = Line::from(vec![conn_span, Span::raw(" "), log_span]);
    frame.render_widget(Paragraph::new(line), area);
}

/// Draw a horizontal separator line.
pub fn draw_separator(frame: &mut Frame, area: Rect) {
    let line = Line::from(Span::styled(
        "─".repeat(area.width as usize),
        Style::default().fg(C_SEPARATOR),
    ));
    frame.render_widget(Paragraph::new(line), area);
}

/// Draw the keybindings footer bar (one row).
pub fn draw_keys_bar(frame: &mut Frame, area: Rect) {
    let keys = " Space play/pause  r reconnect  ←→ volume  q quit";
    let line = Line::from(Span::styled(keys, Style::default().fg(C_MUTED)));
    frame.render_widget(Paragraph::new(line), area);
}
