mod app;
mod cache;
mod gateway;
mod poller;
mod reconcile;
mod selection;
mod subscription;
mod ui;

use app::App;
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use gateway::Gateway;
use poller::{run_poller, PollCommand, PollTarget};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{error::Error, io, path::PathBuf, str::FromStr, sync::Arc};
use subscription::{RelayHandle, WebSocketConnector};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

const COMMAND_QUEUE_CAPACITY: usize = 16;
const UPDATE_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "convo-console")]
struct Args {
    #[arg(long, default_value = "")]
    server_url: String,
    #[arg(long, default_value = "")]
    relay_url: String,
    #[arg(long, default_value = "")]
    tenant: String,
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value = "")]
    export_dir: String,
}

#[derive(Clone, Debug)]
struct Config {
    server_url: Url,
    relay_url: Url,
    tenant: convo_core::Tenant,
    username: String,
    password: String,
    export_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    init_logging();

    let gateway = Arc::new(Gateway::new(config.server_url.clone())?);
    if let Err(err) = gateway.login(&config.username, &config.password).await {
        eprintln!("login failed: {err}");
        std::process::exit(1);
    }
    info!(event = "login_ok", server = %config.server_url);

    let relay = RelayHandle::new(Arc::new(WebSocketConnector::new(config.relay_url.clone())));
    let mut relay_rx = relay.subscribe();

    let mut app = App::new(config.tenant);
    let (target_tx, target_rx) = watch::channel(app.poll_target());
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (update_tx, mut update_rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
    tokio::spawn(run_poller(
        gateway.clone(),
        target_rx,
        command_rx,
        update_tx,
        config.export_dir.clone(),
    ));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();

    loop {
        terminal.draw(|frame| ui::render(frame, &app))?;

        tokio::select! {
            Some(update) = update_rx.recv() => {
                app.apply_poll(update);
            }
            event = relay_rx.recv() => {
                match event {
                    Ok(event) => app.apply_relay(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(event = "relay_events_lagged", skipped = skipped);
                    }
                    // The connection task gave up; polling carries on.
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    handle_input(event, &mut app, &command_tx);
                }
            }
        }

        if app.should_quit {
            break;
        }
        // The selection or tenant may have moved; let the poller know.
        target_tx.send_if_modified(|current: &mut PollTarget| {
            let next = app.poll_target();
            if *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    relay.disconnect();
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn handle_input(event: Event, app: &mut App, commands: &mpsc::Sender<PollCommand>) {
    let Event::Key(KeyEvent {
        code,
        modifiers,
        kind: KeyEventKind::Press,
        ..
    }) = event
    else {
        return;
    };

    if app.export_alert.is_some() {
        if matches!(code, KeyCode::Esc | KeyCode::Enter) {
            app.dismiss_alert();
        }
        return;
    }

    if app.filter_input {
        match code {
            KeyCode::Esc => {
                app.filter.clear();
                app.filter_input = false;
            }
            KeyCode::Enter => app.filter_input = false,
            KeyCode::Backspace => {
                app.filter.pop();
            }
            KeyCode::Char(c) => app.filter.push(c),
            _ => {}
        }
        return;
    }

    match code {
        KeyCode::Char('q') => app.should_quit = true,
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
            app.should_quit = true;
        }
        KeyCode::Tab => app.toggle_tenant(),
        KeyCode::Char('/') => app.filter_input = true,
        KeyCode::Esc => app.filter.clear(),
        KeyCode::Down | KeyCode::Char('j') => app.move_selection(1),
        KeyCode::Up | KeyCode::Char('k') => app.move_selection(-1),
        KeyCode::Char('r') => {
            app.status_note = Some("refreshing...".to_string());
            queue_command(app, commands, PollCommand::Refresh);
        }
        KeyCode::Char('e') => {
            if let Some(session) = app.active_session_id() {
                app.status_note = Some(format!("exporting {session}..."));
                let command = PollCommand::Export {
                    tenant: app.tenant(),
                    session: Some(session),
                };
                queue_command(app, commands, command);
            } else {
                app.status_note = Some("no session to export".to_string());
            }
        }
        KeyCode::Char('E') => {
            app.status_note = Some(format!("exporting all {} chats...", app.tenant().label()));
            let command = PollCommand::Export {
                tenant: app.tenant(),
                session: None,
            };
            queue_command(app, commands, command);
        }
        _ => {}
    }
}

fn queue_command(app: &mut App, commands: &mpsc::Sender<PollCommand>, command: PollCommand) {
    if commands.try_send(command).is_err() {
        app.status_note = Some("busy, try again".to_string());
    }
}

fn load_config() -> Result<Config, Box<dyn Error>> {
    let args = Args::parse();
    let server_url = Url::parse(&resolve_value(&args.server_url, "DASHBOARD_URL")
        .unwrap_or_else(|| "http://127.0.0.1:8080/".to_string()))?;
    let relay_url = Url::parse(&resolve_value(&args.relay_url, "RELAY_URL")
        .unwrap_or_else(|| "ws://127.0.0.1:4000/ws".to_string()))?;
    let tenant = match resolve_value(&args.tenant, "DASHBOARD_TENANT") {
        Some(value) => convo_core::Tenant::from_str(&value)?,
        None => convo_core::Tenant::AlAzhar,
    };
    let username = resolve_value(&args.username, "DASHBOARD_USERNAME")
        .ok_or("missing username (--username or DASHBOARD_USERNAME)")?;
    let password = resolve_value(&args.password, "DASHBOARD_PASSWORD")
        .ok_or("missing password (--password or DASHBOARD_PASSWORD)")?;
    let export_dir = resolve_value(&args.export_dir, "DASHBOARD_EXPORT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(Config {
        server_url,
        relay_url,
        tenant,
        username,
        password,
        export_dir,
    })
}

fn resolve_value(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Tracing must never write to the terminal the TUI owns; logs go to
/// stderr only when explicitly redirected.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = matches!(
        std::env::var("DASHBOARD_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
