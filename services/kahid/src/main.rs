use clap::{Parser, Subcommand};
use kahi_events::{Event, EventBus, EventType, Ticker};
use kahi_listener::ListenerPool;
use kahid::api::{AppState, Credentials, Server};
use kahid::config::{EventListenerConfig, KahiConfig};
use kahid::control::DaemonInfo;
use kahid::supervise::{ConfigStore, Daemon, Supervisor};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVER_STOP_DEADLINE: Duration = Duration::from_secs(5);
const CHILD_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "kahid", version, about = "Kahi process supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor daemon.
    Daemon {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = kahid::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Daemon { config } => run_daemon(config).await,
    }
}

async fn run_daemon(config_path: PathBuf) {
    let config = match kahid::config::load_config_from_path(&config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("kahid: {error}");
            std::process::exit(2);
        }
    };
    let log_level = std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| config.supervisor.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let bus = Arc::new(EventBus::new());
    let supervisor = Arc::new(Supervisor::new(bus.clone()));
    supervisor.load_programs(&config.programs);
    let (daemon, mut shutdown_rx) = Daemon::new(supervisor.clone());
    let daemon = Arc::new(daemon);
    let config_store = Arc::new(ConfigStore::new(
        config_path,
        config.clone(),
        supervisor.clone(),
    ));
    let ticker = Ticker::spawn(bus.clone());

    let mut pools = Vec::new();
    for (name, listener_config) in &config.event_listeners {
        pools.push(spawn_listener_pool(name, listener_config, &bus).await);
    }

    let state = AppState {
        bus: bus.clone(),
        processes: supervisor.clone(),
        groups: supervisor.clone(),
        config: config_store,
        daemon: daemon.clone(),
        auth: credentials(&config),
    };
    let mut server = Server::new(state);
    if let Some(unix) = &config.server.unix {
        if let Err(error) = server.start_unix(&unix.path, unix.mode) {
            eprintln!("kahid: {error}");
            std::process::exit(2);
        }
    }
    if let Some(tcp) = &config.server.tcp {
        if let Err(error) = server.start_tcp(&tcp.bind).await {
            eprintln!("kahid: {error}");
            std::process::exit(2);
        }
    }

    supervisor.start_autostart();
    bus.publish(Event::new(EventType::SupervisorStateRunning));
    info!(pid = std::process::id(), "kahi supervisor running");

    tokio::select! {
        _ = shutdown_signal() => info!("received shutdown signal"),
        _ = shutdown_rx.changed() => info!("shutdown requested over control api"),
    }

    daemon.shutdown();
    bus.publish(Event::new(EventType::SupervisorStateStopping));
    supervisor.stop_all(CHILD_STOP_TIMEOUT).await;
    for pool in pools {
        pool.stop().await;
    }
    ticker.stop().await;
    if let Err(error) = server.stop(SERVER_STOP_DEADLINE).await {
        warn!(error = %error, "server shutdown reported errors");
    }
    info!("kahi supervisor stopped");
}

fn credentials(config: &KahiConfig) -> Option<Credentials> {
    let tcp = config.server.tcp.as_ref()?;
    let username = tcp.username.clone()?;
    Some(Credentials {
        username,
        password: tcp.password.clone().unwrap_or_default(),
    })
}

/// Spawn the configured worker processes for one `[eventlistener.NAME]`
/// block and attach their pipes to a pool.
async fn spawn_listener_pool(
    name: &str,
    config: &EventListenerConfig,
    bus: &Arc<EventBus>,
) -> ListenerPool {
    let pool = ListenerPool::new(name.to_owned(), bus.clone(), &config.events);
    for index in 0..config.pool_size {
        let worker_name = format!("{name}-{index}");
        let spawned = tokio::process::Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(error) => {
                warn!(listener = %worker_name, error = %error, "spawning event listener failed");
                continue;
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            warn!(listener = %worker_name, "event listener spawned without pipes");
            continue;
        };
        pool.add_listener(worker_name.clone(), stdin, stdout).await;
        info!(listener = %worker_name, "event listener attached");
        // Reap the child in the background; the pool drops it from
        // dispatch when its pipes close.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }
    pool
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
