//! Main rendering module
//!
//! Layout: header with system info, the actions/status/output panels (or
//! the log view), a status bar, then popups on top.

use crate::app::{App, Entry, PopupState, Question, View, LOG_VIEW_LINES};
use crate::types::{Intent, Outcome, OutputStream};
use crate::ui::{theme::Theme, widgets};
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};

/// Main render function - entry point for all UI rendering
pub fn render(frame: &mut Frame, app: &App) {
    let area = frame.area();

    let layout = Layout::vertical([
        Constraint::Length(3), // Header
        Constraint::Min(10),   // Content
        Constraint::Length(1), // Status bar
    ])
    .split(area);

    render_header(frame, app, layout[0]);

    match app.view {
        View::Actions => render_actions_view(frame, app, layout[1]),
        View::Logs => render_logs_view(frame, app, layout[1]),
    }

    render_status_bar(frame, app, layout[2]);
    render_popups(frame, app, area);
}

fn render_header(frame: &mut Frame, app: &App, area: Rect) {
    let theme = &app.theme;

    let header_block = Block::default()
        .style(theme.block_style())
        .title(format!(" upkeep · {} ", app.distro_label))
        .title_style(theme.title())
        .borders(Borders::BOTTOM)
        .border_style(theme.border());
    frame.render_widget(header_block, area);

    let on_off = |b: bool| if b { "on" } else { "off" };
    let mut spans = vec![
        Span::styled("Kernel ", theme.text_dim()),
        Span::styled(app.identity.kernel.as_deref().unwrap_or("-"), theme.text()),
        Span::styled("  │  Last action ", theme.text_dim()),
        Span::styled(app.last_action.as_deref().unwrap_or("-"), theme.text()),
        Span::styled("  │  Auto-restart ", theme.text_dim()),
        Span::styled(on_off(app.config.auto_restart), theme.text()),
    ];
    if app.dry_run {
        spans.push(Span::styled("  │  DRY RUN", theme.warning()));
    }

    let info_area = Rect {
        x: area.x + 2,
        y: area.y + 1,
        width: area.width.saturating_sub(4),
        height: 1,
    };
    frame.render_widget(Paragraph::new(Line::from(spans)), info_area);
}

fn render_actions_view(frame: &mut Frame, app: &App, area: Rect) {
    let columns = Layout::horizontal([Constraint::Percentage(32), Constraint::Percentage(68)]).split(area);
    let left = Layout::vertical([
        Constraint::Length(Intent::all().len() as u16 + 4),
        Constraint::Min(6),
    ])
    .split(columns[0]);

    render_action_list(frame, app, left[0]);
    render_run_status(frame, app, left[1]);
    render_output(frame, app, columns[1]);
}

fn render_action_list(frame: &mut Frame, app: &App, area: Rect) {
    let theme = &app.theme;

    let block = Block::default()
        .style(theme.block_style())
        .title(" Actions ")
        .title_style(theme.title())
        .borders(Borders::ALL)
        .border_style(theme.border_focused());
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let mut items: Vec<ListItem> = Intent::all()
        .iter()
        .enumerate()
        .map(|(i, intent)| {
            let style = if i == app.selected {
                theme.selected()
            } else {
                theme.text()
            };
            ListItem::new(Line::styled(format!(" {}  {}", i + 1, intent), style))
        })
        .collect();

    if let Some(intent) = Intent::from_index(app.selected) {
        items.push(ListItem::new(Line::raw("")));
        items.push(ListItem::new(Line::styled(intent.description(), theme.text_dim())));
    }

    frame.render_widget(List::new(items), inner);
}

fn render_run_status(frame: &mut Frame, app: &App, area: Rect) {
    let theme = &app.theme;
    let session = app.session.lock();

    let block = Block::default()
        .style(theme.block_style())
        .title(" Status ")
        .title_style(theme.text_dim())
        .borders(Borders::ALL)
        .border_style(theme.border());
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let running = app.is_running();
    let mut state_spans = Vec::new();
    if running {
        state_spans.push(Span::styled(format!("{} ", widgets::spinner()), theme.title()));
    }
    state_spans.push(Span::styled(session.state.as_str(), theme.state(session.state)));

    let label = |text: &'static str| Span::styled(text, theme.text_dim());
    let mut lines = vec![Line::from(state_spans)];

    if let Some(intent) = session.intent {
        lines.push(Line::from(vec![label("Action  "), Span::styled(intent.as_str(), theme.text())]));
    }
    if let Some(step) = &session.step {
        lines.push(Line::from(vec![label("Step    "), Span::styled(step.as_str(), theme.text())]));
    }
    if let Some(status) = &session.status {
        lines.push(Line::from(vec![label("Status  "), Span::styled(status.as_str(), theme.text())]));
    }
    if let Some((intent, outcome)) = &session.last_outcome {
        let style = match outcome {
            Outcome::Success => theme.success(),
            Outcome::Failure(_) => theme.error(),
            _ => theme.warning(),
        };
        lines.push(Line::raw(""));
        lines.push(Line::from(vec![
            label("Result  "),
            Span::styled(format!("{} · {}", intent, outcome.label()), style),
        ]));
    }

    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: true });
    frame.render_widget(paragraph, inner);
}

fn render_output(frame: &mut Frame, app: &App, area: Rect) {
    let theme = &app.theme;
    let session = app.session.lock();

    let title = if app.dry_run { " Output (dry run) " } else { " Output " };
    let block = Block::default()
        .style(theme.block_style())
        .title(title)
        .title_style(theme.text_dim())
        .borders(Borders::ALL)
        .border_style(theme.border());
    let inner = block.inner(area);
    frame.render_widget(block, area);

    if session.output.is_empty() {
        let hint = Paragraph::new("No output yet. Select an action and press Enter.")
            .style(theme.text_dim())
            .alignment(Alignment::Center);
        frame.render_widget(hint, inner);
        return;
    }

    // Follow the tail
    let visible = inner.height as usize;
    let skip = session.output.len().saturating_sub(visible);
    let lines: Vec<Line> = session
        .output
        .iter()
        .skip(skip)
        .map(|entry| entry_line(entry, app.config.verbose, theme))
        .collect();

    frame.render_widget(Paragraph::new(lines), inner);
}

fn entry_line(entry: &Entry, verbose: bool, theme: &Theme) -> Line<'static> {
    match entry {
        Entry::Output(line) => {
            let style = match line.stream {
                OutputStream::Stdout => theme.text(),
                OutputStream::Stderr => theme.stderr(),
            };
            let text = if verbose {
                format!("[{}:{}] {}", line.step + 1, line.stream.tag(), line.text)
            } else {
                line.text.clone()
            };
            Line::styled(text, style)
        }
        Entry::Status(message) => Line::styled(format!("==> {}", message), theme.title()),
        Entry::Step(index, command) => Line::styled(format!("[{}] $ {}", index + 1, command), theme.warning()),
    }
}

fn render_logs_view(frame: &mut Frame, app: &App, area: Rect) {
    let theme = &app.theme;

    let block = Block::default()
        .style(theme.block_style())
        .title(format!(" Maintenance log (last {}) ", LOG_VIEW_LINES))
        .title_style(theme.title())
        .borders(Borders::ALL)
        .border_style(theme.border_focused());
    let inner = block.inner(area);
    frame.render_widget(block, area);

    if app.log_lines.is_empty() {
        let empty = Paragraph::new("No actions recorded yet")
            .style(theme.text_dim())
            .alignment(Alignment::Center);
        frame.render_widget(empty, inner);
        return;
    }

    let offset = app
        .log_scroll
        .min(app.log_lines.len().saturating_sub(inner.height as usize));
    let lines: Vec<Line> = app
        .log_lines
        .iter()
        .map(|l| {
            let style = if l.contains("[ERROR]") {
                theme.error()
            } else {
                theme.text()
            };
            Line::styled(l.as_str(), style)
        })
        .collect();

    let paragraph = Paragraph::new(lines).scroll((offset as u16, 0));
    frame.render_widget(paragraph, inner);
}

fn render_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let theme = &app.theme;

    let hints = match app.view {
        View::Actions if app.is_running() => "[c] Cancel  [l] Logs  [v] Verbose",
        View::Actions => {
            "[j/k] Navigate  [Enter/1-4] Run  [a] Auto-restart  [v] Verbose  [t] Theme  [r] Refresh  [l] Logs  [q] Quit"
        }
        View::Logs => "[j/k] Scroll  [g/G] Top/Bottom  [l/Esc] Back",
    };
    let right = if app.dry_run { "DRY RUN" } else { "" };

    widgets::render_status_bar(frame, hints, right, theme, area);
}

fn render_popups(frame: &mut Frame, app: &App, area: Rect) {
    let theme = &app.theme;

    if let PopupState::Error { title, message } = &app.popup {
        widgets::render_error_popup(frame, title, message, theme, area);
    }

    // Questions from a run sit above everything else
    match &app.session.lock().question {
        Some(Question::YesNo { question, .. }) => {
            widgets::render_confirm_popup(frame, "Confirm", question, theme, area);
        }
        Some(Question::Target { prompt, input, .. }) => {
            widgets::render_input_popup(
                frame,
                "Target",
                &prompt.message,
                &prompt.example,
                input,
                theme,
                area,
            );
        }
        None => {}
    }

    if let Some((msg, is_error, _)) = &app.flash_message {
        widgets::render_flash_message(frame, msg, *is_error, theme, area);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputLine;

    #[test]
    fn test_entry_line_tags_in_verbose_mode() {
        let theme = Theme::gruvbox();
        let entry = Entry::Output(OutputLine {
            step: 0,
            stream: OutputStream::Stderr,
            text: "warning: foo".into(),
        });

        let plain = entry_line(&entry, false, &theme);
        assert_eq!(plain.to_string(), "warning: foo");

        let tagged = entry_line(&entry, true, &theme);
        assert_eq!(tagged.to_string(), "[1:err] warning: foo");
        assert_eq!(tagged.style.fg, Some(theme.stderr));
    }

    #[test]
    fn test_step_entry() {
        let theme = Theme::nord();
        let line = entry_line(&Entry::Step(1, "apt update".into()), false, &theme);
        assert_eq!(line.to_string(), "[2] $ apt update");
    }
}
