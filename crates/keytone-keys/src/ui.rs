//! TUI rendering for the keyboard instrument
//!
//! Draws the key map with held notes highlighted, the instrument status and
//! a short log of recent events.

use crate::config::Theme;
use crate::keyboard::VirtualKeyboard;
use keytone_core::Handle;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph};
use std::collections::VecDeque;

const KEY_WIDTH: usize = 4;

/// Most recent events, oldest first
#[derive(Debug, Clone)]
pub struct EventLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(8)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Everything the status screen shows
pub struct StatusView<'a> {
    pub keyboard: &'a VirtualKeyboard,
    pub instrument_id: Handle,
    pub backend: &'a str,
    /// Whether the terminal reports key releases
    pub release_events: bool,
    pub events: &'a EventLog,
}

/// Render the full status screen
pub fn render_status(frame: &mut Frame, area: Rect, view: &StatusView, theme: &Theme) {
    let keyboard = view.keyboard;
    let title = format!(
        " keytone [{}] instrument {} -> {} ",
        keyboard.octave_name(),
        view.instrument_id,
        view.backend
    );

    let mut block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border()));
    if theme.show_help {
        block = block.title_bottom(" <> / arrows octave | shift chord | Esc quit ");
    }

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let mut lines = key_rows(keyboard, theme);
    lines.push(Line::default());
    lines.push(mode_line(keyboard, view.release_events));
    lines.push(held_line(keyboard, theme));
    lines.push(Line::default());
    lines.extend(
        view.events
            .iter()
            .map(|event| Line::styled(event.to_string(), Style::default().fg(Color::Gray))),
    );

    frame.render_widget(Paragraph::new(lines), inner);
}

/// Two rows per key: the key to press, then the note it plays
fn key_rows(keyboard: &VirtualKeyboard, theme: &Theme) -> Vec<Line<'static>> {
    let mut labels = Vec::new();
    let mut names = Vec::new();

    for mapping in keyboard.config.sorted_mappings() {
        let note = keyboard.note_for_mapping(mapping);
        let style = if keyboard.is_key_pressed(mapping) {
            Style::default()
                .fg(Color::Black)
                .bg(theme.pressed_key())
                .add_modifier(Modifier::BOLD)
        } else if note.pitch.is_sharp() {
            Style::default().fg(Color::White).bg(Color::DarkGray)
        } else {
            Style::default().fg(Color::Black).bg(Color::White)
        };
        labels.push(Span::styled(
            format!("{:^width$}", mapping.display_char, width = KEY_WIDTH),
            style,
        ));
        names.push(Span::styled(
            format!("{:^width$}", note.to_string(), width = KEY_WIDTH),
            style.remove_modifier(Modifier::BOLD),
        ));
    }

    vec![Line::from(labels), Line::from(names)]
}

fn mode_line(keyboard: &VirtualKeyboard, release_events: bool) -> Line<'static> {
    let length = match keyboard.config.note_ms {
        ms if ms < 0 => "held until key-up".to_string(),
        ms => format!("{}ms notes", ms),
    };
    let release = if release_events {
        "key-up reported"
    } else {
        "no key-up events"
    };
    Line::from(vec![
        Span::styled("Mode: ", Style::default().fg(Color::DarkGray)),
        Span::raw(format!("{} ({}), chord {:?}", length, release, keyboard.config.chord)),
    ])
}

fn held_line(keyboard: &VirtualKeyboard, theme: &Theme) -> Line<'static> {
    let held = keyboard.held_notes();
    let held = if held.is_empty() {
        "-".to_string()
    } else {
        held.join(" ")
    };
    Line::from(vec![
        Span::styled("Playing: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            held,
            Style::default()
                .fg(theme.pressed_key())
                .add_modifier(Modifier::BOLD),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;

    fn draw(view: &StatusView) -> String {
        let mut terminal = Terminal::new(TestBackend::new(90, 20)).unwrap();
        terminal
            .draw(|frame| {
                let area = frame.area();
                render_status(frame, area, view, &Theme::default())
            })
            .unwrap();
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn test_event_log_capacity() {
        let mut log = EventLog::new(2);
        log.push("one");
        log.push("two");
        log.push("three");
        assert_eq!(log.iter().collect::<Vec<_>>(), vec!["two", "three"]);
    }

    #[test]
    fn test_render_status() {
        let mut keyboard = VirtualKeyboard::default();
        keyboard.key_down('Z').unwrap();
        let mut events = EventLog::default();
        events.push("play [C5 E5 G5]");

        let screen = draw(&StatusView {
            keyboard: &keyboard,
            instrument_id: 3,
            backend: "dummy",
            release_events: true,
            events: &events,
        });

        assert!(screen.contains("instrument 3 -> dummy"));
        assert!(screen.contains("Playing: C5 E5 G5"));
        assert!(screen.contains("held until key-up"));
        assert!(screen.contains("play [C5 E5 G5]"));
        assert!(screen.contains("C#5"));
    }
}
