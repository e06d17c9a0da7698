//! Terminal chat client built on `ChatClient`.
//!
//! Run with: cargo run -p chat-cli-example -- --url ws://127.0.0.1:3000/ws
//!
//! Type a message and press Enter to send it. `/retry` resends the last
//! failed message, `/thread <id>` switches threads, Ctrl+C quits.

use std::{
    fs::File,
    io,
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};

use anyhow::Context;
use chat_sync_core::{Message, MessageStatus, Role};
use chat_sync_session::ChatState;
use chat_sync_transport::{ChatClient, ClientConfig, ConnectionState};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(about = "Interactive chat client with live agent layers")]
struct Args {
    /// WebSocket endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// JSON client config. Overrides `--url`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Thread to open after connecting.
    #[arg(long)]
    thread: Option<String>,

    /// Write logs to this file. The terminal is owned by the UI.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::new(args.url.clone()),
    };
    let client = ChatClient::new(config)?;
    tracing::info!(url = %client.config().url, "Starting chat client");

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, client, args.thread).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

struct App {
    input: String,
    scroll: u16,
    notice: Option<String>,
    gave_up: bool,
    pending_thread: Option<String>,
}

impl App {
    fn new(pending_thread: Option<String>) -> Self {
        Self {
            input: String::new(),
            scroll: 0,
            notice: None,
            gave_up: false,
            pending_thread,
        }
    }
}

/// Outcome of one key press.
enum Action {
    None,
    Quit,
}

/// Read terminal keys on a plain thread; crossterm's reader is blocking.
fn spawn_key_reader(tx: mpsc::UnboundedSender<KeyEvent>) {
    std::thread::spawn(move || {
        while !tx.is_closed() {
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => match event::read() {
                    Ok(Event::Key(key)) => {
                        if tx.send(key).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
                Ok(false) => {}
                Err(_) => break,
            }
        }
    });
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    mut client: ChatClient,
    thread: Option<String>,
) -> anyhow::Result<()> {
    let mut app = App::new(thread);
    let (key_tx, mut keys) = mpsc::unbounded_channel();
    spawn_key_reader(key_tx);

    let mut redraw = tokio::time::interval(Duration::from_millis(100));
    client.connect();

    loop {
        if client.status() == ConnectionState::Open {
            if let Some(thread_id) = app.pending_thread.take() {
                if let Err(e) = client.switch_thread(thread_id) {
                    app.notice = Some(format!("Thread switch failed: {e}"));
                }
            }
        }

        terminal.draw(|f| ui(f, &app, &client))?;

        tokio::select! {
            result = client.step(), if !app.gave_up => {
                if let Err(e) = result {
                    app.notice = Some(format!("{e}. Ctrl+R to reconnect."));
                    app.gave_up = true;
                }
            }
            Some(key) = keys.recv() => {
                if matches!(handle_key(&mut app, &mut client, key), Action::Quit) {
                    client.disconnect();
                    return Ok(());
                }
            }
            _ = redraw.tick() => {}
        }
    }
}

fn handle_key(app: &mut App, client: &mut ChatClient, key: KeyEvent) -> Action {
    match key {
        KeyEvent {
            code: KeyCode::Char('c'),
            modifiers: KeyModifiers::CONTROL,
            ..
        } => return Action::Quit,
        KeyEvent {
            code: KeyCode::Char('r'),
            modifiers: KeyModifiers::CONTROL,
            ..
        } => {
            app.gave_up = false;
            app.notice = None;
            client.connect();
        }
        KeyEvent {
            code: KeyCode::Char(c),
            modifiers: KeyModifiers::NONE | KeyModifiers::SHIFT,
            ..
        } => app.input.push(c),
        KeyEvent {
            code: KeyCode::Backspace,
            ..
        } => {
            app.input.pop();
        }
        KeyEvent {
            code: KeyCode::Enter,
            ..
        } => {
            let input = std::mem::take(&mut app.input);
            submit(app, client, input.trim());
        }
        KeyEvent {
            code: KeyCode::Up, ..
        } => app.scroll = app.scroll.saturating_sub(1),
        KeyEvent {
            code: KeyCode::Down,
            ..
        } => app.scroll = app.scroll.saturating_add(1),
        _ => {}
    }
    Action::None
}

fn submit(app: &mut App, client: &mut ChatClient, input: &str) {
    if input.is_empty() {
        return;
    }
    app.notice = None;

    if input == "/retry" {
        let Some(local_id) = last_failed(client.state()) else {
            app.notice = Some("Nothing to retry".into());
            return;
        };
        if let Err(e) = client.retry(&local_id) {
            app.notice = Some(e.to_string());
        }
    } else if let Some(thread_id) = input.strip_prefix("/thread ") {
        if let Err(e) = client.switch_thread(thread_id.trim()) {
            app.notice = Some(e.to_string());
        }
    } else if let Err(e) = client.send_chat(input) {
        app.notice = Some(format!("{e}. /retry once connected."));
    }
}

fn last_failed(state: &ChatState) -> Option<String> {
    state
        .messages()
        .iter()
        .rev()
        .filter(|m| m.status == MessageStatus::Failed)
        .find_map(|m| m.local_id.clone())
}

fn ui(f: &mut Frame, app: &App, client: &ChatClient) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),    // Body
            Constraint::Length(3), // Input
            Constraint::Length(1), // Status
        ])
        .split(f.area());
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(rows[0]);

    let state = client.state();
    let messages: Vec<Line> = state.messages().iter().map(message_line).collect();
    let messages = Paragraph::new(messages)
        .block(Block::default().borders(Borders::ALL).title("Messages"))
        .wrap(Wrap { trim: false })
        .scroll((app.scroll, 0));
    f.render_widget(messages, columns[0]);

    let layers = Paragraph::new(layer_lines(state))
        .block(Block::default().borders(Borders::ALL).title("Agent"))
        .wrap(Wrap { trim: false });
    f.render_widget(layers, columns[1]);

    let input = Paragraph::new(app.input.as_str())
        .style(Style::default().fg(Color::Yellow))
        .block(Block::default().borders(Borders::ALL).title("Input"));
    f.render_widget(input, rows[1]);

    let cursor_x = u16::try_from(app.input.chars().count()).unwrap_or(u16::MAX);
    f.set_cursor_position((
        rows[1].x.saturating_add(cursor_x).saturating_add(1),
        rows[1].y + 1,
    ));

    let (label, color) = match client.status() {
        ConnectionState::Open => ("Connected", Color::Green),
        ConnectionState::Connecting => ("Connecting", Color::Yellow),
        ConnectionState::Closed => ("Disconnected", Color::Red),
    };
    let mut spans = vec![
        Span::raw(" "),
        Span::styled(label, Style::default().fg(color)),
        Span::raw(" | "),
        Span::styled("Ctrl+C", Style::default().fg(Color::Yellow)),
        Span::raw(" quit "),
    ];
    if let Some(notice) = &app.notice {
        spans.push(Span::raw("| "));
        spans.push(Span::styled(notice.as_str(), Style::default().fg(Color::Red)));
    }
    f.render_widget(Paragraph::new(Line::from(spans)), rows[2]);
}

fn message_line(msg: &Message) -> Line<'_> {
    let (who, color) = match msg.role {
        Role::User => ("you", Color::Cyan),
        Role::Assistant => ("agent", Color::Green),
        Role::System => ("system", Color::Gray),
        Role::Error => ("error", Color::Red),
        Role::Other => ("?", Color::Gray),
    };
    let marker = match msg.status {
        MessageStatus::Pending => " …",
        MessageStatus::Failed => " ✗",
        MessageStatus::Confirmed => "",
    };
    let mut spans = vec![
        Span::styled(format!("{who}: "), Style::default().fg(color)),
        Span::raw(msg.content.as_str()),
        Span::styled(marker, Style::default().fg(Color::DarkGray)),
    ];
    if let Some(reason) = &msg.error {
        spans.push(Span::styled(
            format!(" ({reason})"),
            Style::default().fg(Color::Red),
        ));
    }
    Line::from(spans)
}

fn layer_lines(state: &ChatState) -> Vec<Line<'_>> {
    let layers = state.layers();
    let heading = Style::default().add_modifier(Modifier::BOLD);
    let mut lines = Vec::new();

    if let Some(thread) = layers.thread_id() {
        lines.push(Line::from(format!("thread {thread}")));
    }
    if let Some(fast) = layers.fast_layer() {
        lines.push(Line::styled(format!("▶ {}", fast.agent_name), heading));
        if !fast.active_tools.is_empty() {
            lines.push(Line::from(format!("tools: {}", fast.active_tools.join(", "))));
        }
    }
    let activity = layers.activity();
    if activity.typing {
        lines.push(Line::from("typing…"));
    }
    if let Some(progress) = &activity.progress {
        lines.push(Line::from(format!(
            "progress {:.0}% {}",
            progress.progress * 100.0,
            progress.message.as_deref().unwrap_or_default()
        )));
    }
    if let Some(medium) = layers.medium_layer() {
        if !medium.thought.is_empty() {
            lines.push(Line::from(format!(
                "[{}/{}] {}",
                medium.step_number, medium.total_steps, medium.thought
            )));
        }
        if !medium.partial_content.is_empty() {
            lines.push(Line::from(""));
            lines.push(Line::from(medium.partial_content.as_str()));
        }
    }
    if let Some(slow) = layers.slow_layer() {
        for agent in &slow.completed_agents {
            lines.push(Line::from(format!(
                "✓ {} ({:.1}s)",
                agent.agent_name, agent.duration
            )));
        }
        if let Some(total) = slow.total_duration {
            lines.push(Line::styled(format!("done in {total:.1}s"), heading));
        }
    }
    if layers.processing() {
        lines.push(Line::styled("working…", Style::default().fg(Color::Yellow)));
    }
    lines
}
