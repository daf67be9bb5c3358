use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use schmux::config::Config;
use schmux::hub::Hub;
use schmux::llm::CommandLlm;
use schmux::logging;
use schmux::mux::tmux::TmuxMux;
use schmux::notifications::NotificationService;
use schmux::ops::connect::ConnectionManager;
use schmux::ops::resolve::{self, ResolveDeps};
use schmux::ops::OperationRegistry;
use schmux::secrets::Secrets;
use schmux::server::{self, ServerState};
use schmux::session::SessionManager;
use schmux::state::Store;
use schmux::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "schmux")]
#[command(about = "Multiplexes AI-coding agent sessions over git worktrees")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (the default)
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => run_daemon(config, cli.debug).await,
    }
}

async fn run_daemon(config: Config, debug: bool) -> Result<()> {
    let _logging = logging::init_logging(&config, true, debug)?;
    info!("schmux daemon starting");

    if let Err(e) = TmuxMux::check_available() {
        warn!("local multiplexer unavailable: {e} — only remote sessions will work");
    }

    let _secrets = Secrets::load(&Config::secrets_path()).context("loading secrets")?;
    let config = Arc::new(config);
    let store = Store::load(config.state_path()).context("loading state")?;

    let hub = Hub::new(store.clone());
    let notifier = NotificationService::new(&config.notifications);
    let local_mux = Arc::new(TmuxMux::new(Some("schmux".to_string())));
    let sessions = SessionManager::new(
        config.clone(),
        store.clone(),
        local_mux,
        hub.clone(),
        notifier,
    );

    let hub_for_workspaces = hub.clone();
    let workspaces = WorkspaceManager::new(
        &config,
        store.clone(),
        Arc::new(move || hub_for_workspaces.trigger()),
    );

    let registry = OperationRegistry::new(hub.clone());
    let connections =
        ConnectionManager::new(config.clone(), store.clone(), sessions.clone(), hub.clone());
    let resolve_deps = config.conflict_resolve.target.as_ref().map(|target| {
        Arc::new(ResolveDeps {
            manager: workspaces.clone(),
            registry: registry.clone(),
            llm: Arc::new(CommandLlm::new(config.clone())),
            llm_target: target.clone(),
            llm_timeout: Duration::from_millis(config.conflict_resolve.timeout_ms),
        })
    });

    // Startup passes: query repos + default branches, orphaned rebases,
    // session reconciliation, tails for surviving sessions
    workspaces.ensure_origin_queries().await;
    resolve::abort_orphaned_rebases(&workspaces, &registry).await;
    sessions.resume_tails().await;
    workspaces.refresh_all_statuses().await;

    spawn_tickers(&config, workspaces.clone(), sessions.clone(), connections.clone());

    let state = Arc::new(ServerState {
        hub,
        sessions: sessions.clone(),
        access: config.access_control.clone(),
        public_base_url: config.network.public_base_url.clone(),
        connections,
        resolve: resolve_deps,
    });

    tokio::select! {
        result = server::serve(state, &config.network.bind_address, config.network.port) => {
            result.context("websocket server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    sessions.shutdown();
    if let Err(e) = store.save() {
        warn!("final state save failed: {e}");
    }
    Ok(())
}

fn spawn_tickers(
    config: &Config,
    workspaces: Arc<WorkspaceManager>,
    sessions: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
) {
    // Slow status poll: complete fallback coverage for the watcher
    let poll = Duration::from_millis(config.sessions.status_poll_interval_ms);
    let workspaces_poll = workspaces.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            workspaces_poll.refresh_all_statuses().await;
        }
    });

    // Query-repo fetch re-detects default branches
    let fetch = Duration::from_millis(config.sessions.fetch_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(fetch);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            workspaces.fetch_queries().await;
        }
    });

    // Session reconciliation against the multiplexer's view
    let reconcile = Duration::from_millis(config.sessions.reconcile_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reconcile);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sessions.reconcile().await;
        }
    });

    // Remote-host TTL sweep
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            connections.gc_expired().await;
        }
    });
}
