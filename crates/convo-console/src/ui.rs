use crate::app::App;
use chrono::{DateTime, Utc};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

const SIDEBAR_WIDTH: u16 = 42;

#[derive(Clone, Copy)]
struct ConsoleTheme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

fn console_theme() -> ConsoleTheme {
    ConsoleTheme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(52, 211, 153),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

pub fn render(frame: &mut Frame, app: &App) {
    let size = frame.size();
    let theme = console_theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(0)])
        .split(size);

    frame.render_widget(render_header(app, theme, size.width), layout[0]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(0)])
        .split(layout[1]);

    render_sidebar(frame, app, theme, body[0]);
    render_thread(frame, app, theme, body[1]);

    if app.export_alert.is_some() {
        render_alert(frame, app, theme);
    }
}

fn render_header(app: &App, theme: ConsoleTheme, width: u16) -> Paragraph<'static> {
    let inner_width = width.saturating_sub(4) as usize;
    let push = app.push_status_label();
    let push_color = match push {
        "live" => theme.ok,
        "fallback" => theme.warn,
        _ => theme.muted,
    };

    let status_line = Line::from(vec![
        Span::styled(
            "Conversation Review Console",
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled("  |  ", Style::default().fg(theme.muted)),
        Span::styled(
            format!("Tenant: {}", app.tenant().label()),
            Style::default().fg(theme.accent),
        ),
        Span::styled("  |  ", Style::default().fg(theme.muted)),
        Span::styled(format!("Push: {push}"), Style::default().fg(push_color)),
    ]);

    let action_text = app.status_note.clone().unwrap_or_else(|| {
        "Tab tenant | j/k select | / filter | r refresh | e export | E export all | q quit"
            .to_string()
    });

    Paragraph::new(Text::from(vec![
        status_line,
        Line::from(Span::styled(
            ellipsize(&action_text, inner_width.max(12)),
            Style::default().fg(theme.muted),
        )),
    ]))
    .style(Style::default().fg(theme.text).bg(theme.bg))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .style(Style::default().bg(theme.bg))
            .title(Span::styled(
                "Status",
                Style::default()
                    .fg(theme.title)
                    .add_modifier(Modifier::BOLD),
            )),
    )
}

fn render_sidebar(frame: &mut Frame, app: &App, theme: ConsoleTheme, area: Rect) {
    let title = if app.filter_input {
        format!("Inbox /{}", app.filter)
    } else if app.filter.trim().is_empty() {
        "Inbox".to_string()
    } else {
        format!("Inbox ({})", app.filter)
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(theme.surface))
        .title(Span::styled(
            title,
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ));

    if let Some(error) = app.sessions_error.as_deref() {
        let text = Text::from(vec![
            Line::from(Span::styled(
                ellipsize(error, area.width.saturating_sub(4) as usize),
                Style::default().fg(theme.critical),
            )),
            Line::from(Span::styled(
                "press r to retry",
                Style::default().fg(theme.muted),
            )),
        ]);
        frame.render_widget(Paragraph::new(text).wrap(Wrap { trim: true }).block(block), area);
        return;
    }

    let sessions = app.filtered_sessions();
    if sessions.is_empty() {
        let label = if app.sessions().is_none() {
            "loading sessions..."
        } else {
            "no sessions"
        };
        frame.render_widget(
            Paragraph::new(Span::styled(label, Style::default().fg(theme.muted))).block(block),
            area,
        );
        return;
    }

    let active = app.active_session_id();
    let now = Utc::now();
    let width = area.width.saturating_sub(4) as usize;
    let items: Vec<ListItem> = sessions
        .iter()
        .map(|session| {
            let age = format_relative(now, session.last_message_at);
            let head = format!(
                "{:<width$}",
                ellipsize(&session.session_id, width.saturating_sub(age.len() + 1)),
                width = width.saturating_sub(age.len()),
            );
            ListItem::new(Text::from(vec![
                Line::from(vec![
                    Span::styled(head, Style::default().fg(theme.text)),
                    Span::styled(age, Style::default().fg(theme.muted)),
                ]),
                Line::from(Span::styled(
                    ellipsize(&session.last_message, width),
                    Style::default().fg(theme.muted),
                )),
            ]))
        })
        .collect();

    let mut state = ListState::default();
    state.select(
        active
            .as_deref()
            .and_then(|id| sessions.iter().position(|s| s.session_id == id)),
    );

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .fg(theme.accent)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_thread(frame: &mut Frame, app: &App, theme: ConsoleTheme, area: Rect) {
    let active = app.active_session_id();
    let title = match active.as_deref() {
        Some(id) => format!("Thread {}", ellipsize(id, area.width.saturating_sub(12) as usize)),
        None => "Thread".to_string(),
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(theme.surface))
        .title(Span::styled(
            title,
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ));

    if let Some(error) = app.thread_error.as_deref() {
        let text = Text::from(vec![
            Line::from(Span::styled(
                ellipsize(error, area.width.saturating_sub(4) as usize),
                Style::default().fg(theme.critical),
            )),
            Line::from(Span::styled(
                "press r to retry",
                Style::default().fg(theme.muted),
            )),
        ]);
        frame.render_widget(Paragraph::new(text).wrap(Wrap { trim: true }).block(block), area);
        return;
    }

    if active.is_none() {
        frame.render_widget(
            Paragraph::new(Span::styled(
                "no session selected",
                Style::default().fg(theme.muted),
            ))
            .block(block),
            area,
        );
        return;
    }

    let Some(thread) = app.active_thread() else {
        frame.render_widget(
            Paragraph::new(Span::styled(
                "loading messages...",
                Style::default().fg(theme.muted),
            ))
            .block(block),
            area,
        );
        return;
    };

    let mut lines: Vec<Line> = Vec::new();
    for message in thread.iter() {
        let (label, color) = match message.role {
            convo_core::Role::Ai => ("ai", theme.accent),
            convo_core::Role::Human => ("human", theme.title),
        };
        lines.push(Line::from(vec![
            Span::styled(
                format!("{label} "),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                message.created_at.format("%H:%M:%S").to_string(),
                Style::default().fg(theme.muted),
            ),
        ]));
        lines.push(Line::from(Span::styled(
            message.content.clone(),
            Style::default().fg(theme.text),
        )));
        lines.push(Line::default());
    }

    // Pin the view to the newest messages.
    let visible = area.height.saturating_sub(2) as usize;
    let scroll = lines.len().saturating_sub(visible) as u16;
    frame.render_widget(
        Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .scroll((scroll, 0))
            .block(block),
        area,
    );
}

fn render_alert(frame: &mut Frame, app: &App, theme: ConsoleTheme) {
    let Some(alert) = app.export_alert.as_deref() else {
        return;
    };
    let size = frame.size();
    let width = size.width.saturating_sub(8).min(64).max(20);
    let height = 5;
    let area = Rect::new(
        size.width.saturating_sub(width) / 2,
        size.height.saturating_sub(height) / 2,
        width,
        height,
    );
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(Text::from(vec![
            Line::from(Span::styled(
                ellipsize(alert, width.saturating_sub(4) as usize),
                Style::default().fg(theme.critical),
            )),
            Line::default(),
            Line::from(Span::styled(
                "press Esc to dismiss",
                Style::default().fg(theme.muted),
            )),
        ]))
        .wrap(Wrap { trim: true })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.critical))
                .style(Style::default().bg(theme.bg))
                .title(Span::styled(
                    "Export failed",
                    Style::default()
                        .fg(theme.critical)
                        .add_modifier(Modifier::BOLD),
                )),
        ),
        area,
    );
}

fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    if max <= 3 {
        return "...".chars().take(max).collect();
    }
    let prefix: String = input.chars().take(max - 3).collect();
    format!("{prefix}...")
}

fn format_relative(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(then).num_seconds();
    if secs < 0 {
        return "now".to_string();
    }
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3_599 => format!("{}m", secs / 60),
        3_600..=86_399 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}
