//! Interactive dashboard.
//!
//! The alternative consumer of the event bus: a two-pane terminal view with
//! the task list and its statuses on the left and the selected task's recent
//! output on the right. Per-task status is driven by first-output-seen and by
//! the explicit status events the supervisor publishes on executor return.

use std::collections::HashMap;
use std::io::{self, Stdout};
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, List, ListItem, Paragraph};
use ratatui::Terminal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, StreamKind, TaskStatus};
use crate::output::EventRing;

/// Capacity of the recent-event ring shared by all tasks.
const RING_CAPACITY: usize = 512;

type DashTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Dashboard state: statuses, the shared event ring and view bookkeeping.
pub struct Dashboard {
    tasks: Vec<String>,
    statuses: HashMap<String, TaskStatus>,
    ring: EventRing,
    selected: usize,
    scroll: usize,
    follow: bool,
    log_height: usize,
    should_quit: bool,
    interrupted: bool,
}

impl Dashboard {
    pub fn new(tasks: Vec<String>) -> Self {
        let statuses = tasks
            .iter()
            .map(|task| (task.clone(), TaskStatus::Idle))
            .collect();
        Self {
            tasks,
            statuses,
            ring: EventRing::new(RING_CAPACITY),
            selected: 0,
            scroll: 0,
            follow: true,
            log_height: 0,
            should_quit: false,
            interrupted: false,
        }
    }

    /// Consumes the bus until the user quits.
    ///
    /// Quitting cancels the root scope and keeps draining the bus until every
    /// producer is gone, so children finish their shutdown path before the
    /// terminal is restored. Returns `true` when the quit was an interrupt
    /// (Ctrl-C) rather than a plain `q`.
    pub async fn run(
        mut self,
        mut bus_rx: mpsc::Receiver<Event>,
        root: CancellationToken,
    ) -> Result<bool> {
        let mut terminal = init_terminal()?;
        let (input_tx, mut input_rx) = mpsc::channel(64);
        spawn_input_listener(input_tx);
        let mut ticker = tokio::time::interval(Duration::from_millis(150));
        let mut bus_open = true;

        let interrupted = loop {
            tokio::select! {
                event = bus_rx.recv(), if bus_open => match event {
                    Some(event) => self.on_event(event),
                    None => bus_open = false,
                },
                key = input_rx.recv() => {
                    if let Some(key) = key {
                        self.on_key(key);
                    }
                }
                _ = ticker.tick() => {}
            }

            if self.should_quit {
                root.cancel();
                if bus_open {
                    let drain = async {
                        while let Some(event) = bus_rx.recv().await {
                            self.on_event(event);
                        }
                    };
                    let _ = tokio::time::timeout(Duration::from_secs(7), drain).await;
                }
                break self.interrupted;
            }

            if let Err(err) = draw(&mut self, &mut terminal) {
                restore_terminal(terminal)?;
                return Err(err.into());
            }
        };

        restore_terminal(terminal)?;
        Ok(interrupted)
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Log(log) => {
                if let Some(status) = self.statuses.get_mut(&log.task) {
                    if *status == TaskStatus::Idle {
                        *status = TaskStatus::Running;
                    }
                }
                self.ring.push(log);
            }
            Event::Status { task, status } => {
                self.statuses.insert(task, status);
            }
        }
    }

    fn on_key(&mut self, key: KeyEvent) {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.should_quit = true;
            self.interrupted = true;
            return;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Up | KeyCode::Char('k') => {
                if self.selected > 0 {
                    self.selected -= 1;
                    self.follow = true;
                }
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < self.tasks.len() {
                    self.selected += 1;
                    self.follow = true;
                }
            }
            KeyCode::PageUp => {
                self.follow = false;
                self.scroll = self.current_scroll().saturating_sub(10);
            }
            KeyCode::PageDown => {
                self.follow = false;
                self.scroll = self.current_scroll() + 10;
            }
            KeyCode::Home => {
                self.follow = false;
                self.scroll = 0;
            }
            KeyCode::End => {
                self.follow = true;
            }
            _ => {}
        }
    }

    fn selected_task(&self) -> Option<&str> {
        self.tasks.get(self.selected).map(String::as_str)
    }

    fn selected_lines(&self) -> Vec<(String, StreamKind)> {
        let Some(task) = self.selected_task() else {
            return Vec::new();
        };
        self.ring
            .iter()
            .filter(|event| event.task == task)
            .map(|event| (sanitize(&event.line), event.stream))
            .collect()
    }

    fn current_scroll(&self) -> usize {
        if self.follow {
            self.selected_lines()
                .len()
                .saturating_sub(self.log_height.max(1))
        } else {
            self.scroll
        }
    }
}

fn sanitize(text: &str) -> String {
    String::from_utf8_lossy(&strip_ansi_escapes::strip(text.as_bytes())).into_owned()
}

fn init_terminal() -> io::Result<DashTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Terminal::new(CrosstermBackend::new(stdout))
}

fn restore_terminal(mut terminal: DashTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()
}

fn spawn_input_listener(tx: mpsc::Sender<KeyEvent>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            if let Ok(crossterm::event::Event::Key(key)) = crossterm::event::read() {
                if tx.blocking_send(key).is_err() {
                    break;
                }
            }
        }
    });
}

fn draw(dash: &mut Dashboard, terminal: &mut DashTerminal) -> io::Result<()> {
    terminal.draw(|frame| {
        let area = frame.area();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(1)])
            .split(area);
        let panes = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
            .split(vertical[0]);

        let items: Vec<ListItem> = dash
            .tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| {
                let status = dash
                    .statuses
                    .get(task)
                    .copied()
                    .unwrap_or(TaskStatus::Idle);
                let marker = if idx == dash.selected { "▶ " } else { "  " };
                let name_style = if idx == dash.selected {
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD)
                } else {
                    Style::default().fg(Color::Gray)
                };
                ListItem::new(Line::from(vec![
                    Span::styled(marker, Style::default().fg(Color::Cyan)),
                    Span::styled(
                        format!("{} ", status_glyph(status)),
                        Style::default().fg(status_color(status)),
                    ),
                    Span::styled(task.clone(), name_style),
                ]))
            })
            .collect();
        let task_list = List::new(items).block(
            Block::default()
                .title("Tasks")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
        frame.render_widget(task_list, panes[0]);

        let log_area = panes[1];
        dash.log_height = log_area.height.saturating_sub(2) as usize;
        let lines = dash.selected_lines();
        let start = dash.current_scroll().min(lines.len());
        let placeholder = Style::default().fg(Color::DarkGray);
        let visible: Vec<Line> = if dash.ring.is_empty() {
            vec![Line::from(Span::styled("(no logs yet)", placeholder))]
        } else if lines.is_empty() {
            vec![Line::from(Span::styled(
                "(no logs for this task yet)",
                placeholder,
            ))]
        } else {
            lines[start..]
                .iter()
                .take(dash.log_height.max(1))
                .map(|(text, stream)| {
                    let style = match stream {
                        StreamKind::Stdout => Style::default(),
                        StreamKind::Stderr => Style::default().fg(Color::Red),
                    };
                    Line::from(Span::styled(text.clone(), style))
                })
                .collect()
        };
        let title = dash
            .selected_task()
            .map(|task| format!("Logs for {}", task))
            .unwrap_or_else(|| "Logs".to_string());
        let logs = Paragraph::new(visible).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
        frame.render_widget(logs, log_area);

        let help = Paragraph::new("q/esc: quit | ↑/↓: tasks | PgUp/PgDn: scroll | Home/End: jump")
            .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(help, vertical[1]);
    })?;
    Ok(())
}

fn status_glyph(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Idle => " ",
        TaskStatus::Running => "▲",
        TaskStatus::Done => "✓",
        TaskStatus::Failed => "✗",
    }
}

fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Idle => Color::DarkGray,
        TaskStatus::Running => Color::Yellow,
        TaskStatus::Done => Color::Green,
        TaskStatus::Failed => Color::Red,
    }
}
