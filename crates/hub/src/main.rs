mod config;
mod events;
mod server;
mod tui;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use config::HubConfig;
use events::HubEvent;
use server::HubServer;
use tui::TuiState;

#[derive(Parser)]
#[command(name = "backbone-hub")]
#[command(about = "Cross-cluster hub and component registry")]
struct Args {
    #[arg(short, long, help = "JSON config file; flags override its values")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    cluster_id: Option<i32>,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(long, help = "Seconds between heartbeats")]
    heartbeat: Option<u64>,

    #[arg(long, help = "Seconds of silence before a component is dropped")]
    liveness_timeout: Option<u64>,

    #[arg(long, help = "Persist global data to this JSON file")]
    snapshot: Option<PathBuf>,

    #[arg(long)]
    headless: bool,
}

impl Args {
    fn into_config(self) -> Result<HubConfig> {
        let mut config = match &self.config {
            Some(path) => HubConfig::load(path)?,
            None => HubConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(cluster_id) = self.cluster_id {
            config.cluster_id = cluster_id;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat_secs = heartbeat;
        }
        if let Some(timeout) = self.liveness_timeout {
            config.liveness_timeout_secs = timeout;
        }
        if self.snapshot.is_some() {
            config.snapshot_path = self.snapshot;
        }
        config.headless |= self.headless;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    let headless = config.headless;

    if headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut server = HubServer::new(config)?;

    if headless {
        server.run();
        log::info!("Hub shutting down");
    } else {
        run_with_tui(&mut server)?;
    }

    Ok(())
}

fn log_to_tui(tui_state: &mut TuiState, event: HubEvent) {
    match event {
        HubEvent::Listening { addr } => {
            tui_state.log_info(format!("Hub listening on {}", addr));
        }
        HubEvent::ComponentRegistered {
            component_type,
            component_id,
            addr,
            global_order,
        } => {
            tui_state.log_info(format!(
                "{} {} registered from {} as cluster {}",
                component_type, component_id, addr, global_order
            ));
        }
        HubEvent::RegistrationRejected { addr, reason } => {
            tui_state.log_warn(format!("Registration from {} rejected: {}", addr, reason));
        }
        HubEvent::ComponentLost {
            component_type,
            component_id,
            reason,
        } => {
            tui_state.log_warn(format!(
                "{} {} {}",
                component_type,
                component_id,
                reason.as_str()
            ));
        }
        HubEvent::CallForwarded { .. } => {}
        HubEvent::CallDropped { reason } => {
            tui_state.log_warn(format!("Dropped cross-server call: {}", reason));
        }
        HubEvent::DataChanged {
            key,
            is_delete,
            peers,
        } => {
            let verb = if is_delete { "deleted" } else { "set" };
            tui_state.log_info(format!("Global data {} {} ({} peers)", verb, key, peers));
        }
        HubEvent::ChannelCondemned { addr, reason } => {
            tui_state.log_warn(format!("Channel to {} condemned: {}", addr, reason));
        }
        HubEvent::SnapshotWritten { .. } => {}
        HubEvent::Error { message } => {
            tui_state.log_error(message);
        }
    }
}

fn run_with_tui(server: &mut HubServer) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = server.running();
    let mut tui_state = TuiState::new();

    while running.load(Ordering::SeqCst) {
        server.tick_once();

        for event in server.drain_events() {
            log_to_tui(&mut tui_state, event);
        }

        if event::poll(Duration::from_millis(1))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            running.store(false, Ordering::SeqCst);
                        }
                        KeyCode::Char('c') => tui_state.clear_log(),
                        _ => {}
                    }
                }
            }
        }

        let stats = server.stats();
        let components = server.component_rows();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &stats, &components);
        })?;
    }

    tui_state.log_info("Shutting down...");
    server.shutdown_connections();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
