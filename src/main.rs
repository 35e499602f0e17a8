//! upkeep - Cross-distribution maintenance launcher
//!
//! Detects the running Linux distribution and runs the right commands to
//! update, upgrade, set up or restart it.
//!
//! Features:
//! - Full-screen interface with live command output
//! - Numbered text menu for plain terminals and SSH sessions
//! - rpm-ostree rebase and NixOS channel upgrades
//! - Cancellation of running commands
//! - Audit log of every action
//!
//! Usage: upkeep [--cli] [--dry-run]

mod action_log;
mod app;
mod config;
mod menu;
mod observer;
mod orchestrator;
mod system;
mod types;
mod ui;

use anyhow::{Context, Result};
use app::App;
use config::Config;
use crossterm::{
    event::{self, Event, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use orchestrator::Orchestrator;
use ratatui::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::stdout;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use system::StdinMode;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

/// Diagnostics log inside the state directory
const DIAGNOSTICS_LOG: &str = "upkeep.log";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let dry_run = args.iter().any(|a| a == "--dry-run" || a == "-n");
    let cli = args.iter().any(|a| a == "--cli" || a == "-c");

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("upkeep {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let result = run(cli, dry_run);

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"upkeep - Cross-distribution maintenance launcher

USAGE:
    upkeep [OPTIONS]

OPTIONS:
    -c, --cli        Numbered text menu instead of the full-screen interface
    -n, --dry-run    Show what would be executed without running anything
    -h, --help       Print help information
    -v, --version    Print version information

KEYBINDINGS:
    j/k              Navigate up/down
    Enter, 1-4       Run Update / Upgrade / Setup / Restart
    a                Toggle restart after update/upgrade
    v                Toggle verbose output
    t                Cycle theme
    r                Refresh system information
    l                Show maintenance log
    c, Esc           Cancel the running action
    q                Quit

SUPPORTED:
    Fedora/RHEL/CentOS, Fedora Atomic (rpm-ostree), Ubuntu/Debian,
    Arch/Manjaro, openSUSE, Bazzite, Nobara, NixOS

CONFIG:
    ~/.config/upkeep/config.toml
"#
    );
}

fn run(cli: bool, dry_run: bool) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    init_tracing(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = if cli {
        run_cli(&runtime, &config, dry_run)
    } else {
        run_tui(&runtime, config, dry_run)
    };

    // Do not wait on a menu prompt still blocked on stdin
    runtime.shutdown_background();
    result
}

/// Route diagnostics to a file so they never draw over the interface
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = config.state_dir().ok().and_then(|dir| {
        fs::create_dir_all(&dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(DIAGNOSTICS_LOG))
            .ok()
    });

    match file {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::sink)
                .try_init();
        }
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "upkeep starting");
}

fn run_cli(runtime: &Runtime, config: &Config, dry_run: bool) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config, StdinMode::Inherit, dry_run)
        .context("Failed to initialize")?;

    if dry_run {
        println!("Running in dry-run mode (no changes will be made)");
    }

    runtime.block_on(menu::run_menu(&orchestrator, config))
}

fn run_tui(runtime: &Runtime, config: Config, dry_run: bool) -> Result<()> {
    let orchestrator = Orchestrator::from_config(&config, StdinMode::Null, dry_run)
        .context("Failed to initialize")?;

    // Children cannot prompt for a password once the screen is taken over
    if !dry_run {
        prime_elevation(&config.execution.elevation);
    }

    let mut app = App::new(Arc::new(orchestrator), config, dry_run, runtime.handle().clone());

    enable_raw_mode().context("Failed to enable raw mode")?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen).context("Failed to setup terminal")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("Failed to create terminal")?;

    let result = main_loop(&mut terminal, &mut app);

    disable_raw_mode().context("Failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen).context("Failed to restore terminal")?;
    terminal.show_cursor().context("Failed to show cursor")?;

    result
}

/// Refresh sudo credentials before entering the full-screen interface
fn prime_elevation(elevation: &[String]) {
    if elevation.first().map(String::as_str) != Some("sudo") {
        return;
    }

    eprintln!("Privileged steps run through sudo; authenticating...");
    match Command::new("sudo").arg("-v").status() {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(%status, "sudo -v failed, privileged steps may fail"),
        Err(e) => tracing::warn!(error = %e, "could not run sudo"),
    }
}

fn main_loop<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        terminal.draw(|frame| {
            ui::render(frame, app);
        })?;

        // Pick up finished runs
        app.tick();

        // Poll with a timeout so output keeps streaming in
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key)?;
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}
