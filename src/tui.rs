//! Terminal chat screen.
//!
//! Renders the published transcript and feeds user input to the controller.
//! Controller calls run as tokio tasks; the draw loop only reads snapshots.

use crate::chat::{ChatController, ChatMessage, ChatState};
use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame, Terminal,
};
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;
use tui_input::backend::crossterm::EventHandler;
use tui_input::Input;

/// How often the screen redraws while waiting for keys.
const TICK: Duration = Duration::from_millis(50);

/// What a key press asks the screen to do.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Send(String),
    Retry,
    Quit,
    Edit,
    Ignore,
}

/// Run the chat screen until the user quits.
///
/// Must be called from a blocking context; controller work is spawned on
/// `runtime`.
pub fn run_chat(controller: Arc<ChatController>, model: String, runtime: Handle) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut screen = ChatScreen::new(controller, runtime);
    screen.initialize(model);
    let result = screen.run(&mut terminal);
    screen.shutdown();

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;

    result
}

struct ChatScreen {
    controller: Arc<ChatController>,
    runtime: Handle,
    input: Input,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatScreen {
    fn new(controller: Arc<ChatController>, runtime: Handle) -> Self {
        Self {
            controller,
            runtime,
            input: Input::default(),
            tasks: Vec::new(),
        }
    }

    fn initialize(&mut self, model: String) {
        let chat = Arc::clone(&self.controller);
        self.spawn(async move {
            if let Err(e) = chat.initialize(&model).await {
                debug!("Initialization ended with {}: {}", e.kind.as_str(), e);
            }
        });
    }

    fn send(&mut self, text: String) {
        let chat = Arc::clone(&self.controller);
        self.spawn(async move {
            if let Err(e) = chat.send_message(&text).await {
                debug!("Send ended with {}: {}", e.kind.as_str(), e);
            }
        });
    }

    fn retry(&mut self) {
        let chat = Arc::clone(&self.controller);
        self.spawn(async move {
            if let Err(e) = chat.retry().await {
                debug!("Retry ended with {}: {}", e.kind.as_str(), e);
            }
        });
    }

    fn spawn(&mut self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(self.runtime.spawn(task));
    }

    /// Abort whatever is still running; the controller releases its busy
    /// flag when the task is dropped.
    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// The main input loop.
    fn run(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut updates = self.controller.subscribe();

        loop {
            let state = updates.borrow_and_update().clone();
            terminal.draw(|frame| draw_ui(frame, &state, &self.input))?;

            if !event::poll(TICK)? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };

            match classify_key(&key, &self.input, &state) {
                Action::Send(text) => {
                    self.input.reset();
                    self.send(text);
                }
                Action::Retry => self.retry(),
                Action::Quit => return Ok(()),
                Action::Edit => {
                    self.input.handle_event(&Event::Key(key));
                }
                Action::Ignore => {}
            }
        }
    }
}

/// Decide what a key press means given the current input and state.
fn classify_key(key: &KeyEvent, input: &Input, state: &ChatState) -> Action {
    // Only handle key press events (not release)
    if key.kind != KeyEventKind::Press {
        return Action::Ignore;
    }

    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Esc => Action::Quit,
        KeyCode::Char('c') if ctrl => Action::Quit,
        KeyCode::Char('r') if ctrl => {
            if state.can_retry() {
                Action::Retry
            } else {
                Action::Ignore
            }
        }
        KeyCode::Enter => {
            let text = input.value().trim();
            if text.is_empty() || state.is_busy() {
                Action::Ignore
            } else {
                Action::Send(text.to_string())
            }
        }
        // Input is disabled while busy, like the send button.
        _ if state.is_busy() => Action::Ignore,
        _ => Action::Edit,
    }
}

/// Draw the TUI.
fn draw_ui(frame: &mut Frame, state: &ChatState, input: &Input) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),
            Constraint::Length(1),
            Constraint::Length(3),
        ])
        .split(frame.area());

    draw_transcript(frame, chunks[0], state);
    draw_status(frame, chunks[1], state);
    draw_input(frame, chunks[2], state, input);
}

fn draw_transcript(frame: &mut Frame, area: Rect, state: &ChatState) {
    let block = Block::default()
        .title(" roamr ")
        .title_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let width = inner.width.saturating_sub(2) as usize;
    let mut lines = Vec::new();
    for message in state.transcript.messages() {
        lines.extend(message_lines(message, width));
        lines.push(Line::default());
    }
    lines.pop();

    // Keep the newest message in view.
    let scroll = lines.len().saturating_sub(inner.height as usize);
    let paragraph = Paragraph::new(lines).scroll((scroll.min(u16::MAX as usize) as u16, 0));
    frame.render_widget(paragraph, inner);
}

/// Render one message as wrapped lines, user messages right-aligned.
fn message_lines(message: &ChatMessage, width: usize) -> Vec<Line<'static>> {
    let (style, alignment) = if message.is_user {
        (Style::default().fg(Color::Cyan), Alignment::Right)
    } else {
        (Style::default().fg(Color::White), Alignment::Left)
    };

    wrap_text(&message.text, width.max(1))
        .into_iter()
        .map(|line| Line::from(Span::styled(line, style)).alignment(alignment))
        .collect()
}

fn draw_status(frame: &mut Frame, area: Rect, state: &ChatState) {
    let mut spans = vec![Span::styled(
        format!(" {} ", state.phase()),
        Style::default().fg(Color::Yellow),
    )];
    if state.can_retry() {
        spans.push(Span::styled(
            "ctrl+r to retry  ",
            Style::default().fg(Color::DarkGray),
        ));
    }
    spans.push(Span::styled("esc to quit", Style::default().fg(Color::DarkGray)));
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn draw_input(frame: &mut Frame, area: Rect, state: &ChatState, input: &Input) {
    let border = if state.is_busy() {
        Color::DarkGray
    } else {
        Color::Cyan
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border));
    let inner_area = block.inner(area);
    frame.render_widget(block, area);

    // Calculate visible portion of input
    let input_width = inner_area.width as usize;
    let value = input.value();
    let cursor_pos = input.visual_cursor();

    // Scroll the input if cursor is beyond visible area
    let scroll = if cursor_pos >= input_width {
        cursor_pos - input_width + 1
    } else {
        0
    };

    let paragraph = if value.is_empty() {
        Paragraph::new(Span::styled(
            "Type a message...",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        let visible: String = value.chars().skip(scroll).take(input_width).collect();
        Paragraph::new(Span::styled(visible, Style::default().fg(Color::White)))
    };
    frame.render_widget(paragraph, inner_area);

    if !state.is_busy() {
        let cursor_x = inner_area.x + (cursor_pos - scroll) as u16;
        frame.set_cursor_position((cursor_x, inner_area.y));
    }
}

/// Hard-wrap text to `width` characters, honouring embedded newlines.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for raw in text.split('\n') {
        let chars: Vec<char> = raw.chars().collect();
        if chars.is_empty() {
            lines.push(String::new());
            continue;
        }
        for chunk in chars.chunks(width) {
            lines.push(chunk.iter().collect());
        }
    }
    lines
}
