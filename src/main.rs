use axum::serve;
use clap::{Parser, Subcommand};
use hostpulse::alerts::LogNotifier;
use hostpulse::collectors::processes::{
    filter_by_name, PriorityClass, ProcessIdentity, ProcessInventory, ProcessRecord, SortKey,
};
use hostpulse::collectors::system::SystemSampler;
use hostpulse::config::Config;
use hostpulse::control::policy::ProtectionPolicy;
use hostpulse::control::process::ProcessController;
use hostpulse::control::services::{filter_by_state, RestartError, ServiceController, ServiceState};
use hostpulse::control::sessions::SessionController;
use hostpulse::control::startup::{filter_by_location, StartupInventory, StartupLocation};
use hostpulse::control::ControlError;
use hostpulse::engine::{EngineError, MonitorEngine};
use hostpulse::export::{ExportError, ExportSink, JsonSink};
use hostpulse::http;
use hostpulse::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostpulse")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml", global = true)]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample the host and serve /metrics and /api/* until Ctrl+C (default)
    Run {
        /// Sampling interval override, e.g. "1s"
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// List processes
    Ps {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value = "memory")]
        sort: SortKey,
        #[arg(long)]
        ascending: bool,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Terminate a process
    Kill {
        pid: u32,
        /// Also terminate every descendant
        #[arg(long)]
        tree: bool,
        /// Refuse if the PID now belongs to a process with another start time
        #[arg(long)]
        start_time: Option<u64>,
    },
    /// Suspend every thread of a process
    Suspend { pid: u32 },
    /// Resume a suspended process
    Resume { pid: u32 },
    /// Change the priority class of a process
    Priority { pid: u32, class: PriorityClass },
    /// Query and control OS services
    Services {
        #[command(subcommand)]
        action: ServiceAction,
    },
    /// Query and log off user sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// List programs launched at logon
    Startup {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        location: Option<StartupLocation>,
        /// Only entries that are currently enabled
        #[arg(long)]
        enabled: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceAction {
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        state: Option<ServiceState>,
    },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    List,
    Logoff { user: String },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Restart(#[from] RestartError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("failed to initialize metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = load_config(&cli.config);
    let policy = Arc::new(ProtectionPolicy::new(&cfg.protected_processes));

    let result = match cli.command.unwrap_or(Command::Run { interval: None }) {
        Command::Run { interval } => run(cfg, policy, interval).await,
        Command::Ps {
            search,
            sort,
            ascending,
            json,
            limit,
        } => ps(policy, search, sort, ascending, json, limit).await,
        Command::Kill {
            pid,
            tree,
            start_time,
        } => kill(policy, pid, tree, start_time).await,
        Command::Suspend { pid } => ProcessController::host(policy)
            .suspend(pid)
            .await
            .map(|()| println!("suspended {pid}"))
            .map_err(CliError::from),
        Command::Resume { pid } => ProcessController::host(policy)
            .resume(pid)
            .await
            .map(|()| println!("resumed {pid}"))
            .map_err(CliError::from),
        Command::Priority { pid, class } => ProcessController::host(policy)
            .set_priority(pid, class)
            .await
            .map(|()| println!("priority of {pid} set to {class}"))
            .map_err(CliError::from),
        Command::Services { action } => services(&cfg, action).await,
        Command::Sessions { action } => sessions(action).await,
        Command::Startup {
            search,
            location,
            enabled,
        } => startup(search, location, enabled),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn load_config(path: &str) -> Config {
    match Config::load_from_file(path) {
        Ok(cfg) => cfg,
        Err(err) if err.is_missing_file() => {
            warn!(path, "config file not found, using defaults");
            Config::default()
        }
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    }
}

async fn run(
    cfg: Config,
    policy: Arc<ProtectionPolicy>,
    interval: Option<Duration>,
) -> Result<(), CliError> {
    let metrics = Metrics::new()?;
    let interval_secs = interval
        .map(|d| d.as_secs().max(1))
        .unwrap_or(cfg.interval_secs);

    info!(
        listen = %cfg.listen,
        interval_secs,
        history_capacity = cfg.history_capacity,
        "starting hostpulse"
    );

    let sampler = SystemSampler::new().with_metrics(metrics.clone());
    let engine = MonitorEngine::builder(Box::new(sampler))
        .settings(&cfg)
        .interval_secs(interval_secs)
        .alerts(cfg.alerts.clone(), Arc::new(LogNotifier))
        .metrics(metrics.clone())
        .process_inventory(Arc::new(ProcessInventory::new(policy)))
        .service_controller(
            ServiceController::host()
                .with_settle_delay(cfg.service_settle_delay())
                .with_metrics(metrics.clone()),
        )
        .build()?;
    let engine = Arc::new(engine);
    engine.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = http::build_router(metrics.clone(), engine.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };
            info!(%addr, "HTTP server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);
    engine.stop_and_wait().await;
    let _ = http_task.await;
    Ok(())
}

async fn ps(
    policy: Arc<ProtectionPolicy>,
    search: Option<String>,
    sort: SortKey,
    ascending: bool,
    json: bool,
    limit: Option<usize>,
) -> Result<(), CliError> {
    let inventory = ProcessInventory::new(policy);
    // CPU usage needs two refreshes some time apart
    tokio::time::sleep(System::MINIMUM_CPU_UPDATE_INTERVAL).await;

    let mut records = inventory.list_sorted(sort, !ascending);
    if let Some(term) = search {
        records = filter_by_name(records, &term);
    }
    if let Some(limit) = limit {
        records.truncate(limit);
    }

    if json {
        JsonSink::new(std::io::stdout()).export_processes(&records)?;
    } else {
        print_processes(&records);
    }
    Ok(())
}

fn print_processes(records: &[ProcessRecord]) {
    println!(
        "{:>7} {:>7} {:>6} {:>10} {:>4} {:<13} {:<10} NAME",
        "PID", "PPID", "CPU%", "MEM MB", "THR", "PRIORITY", "STATE"
    );
    for r in records {
        println!(
            "{:>7} {:>7} {:>6.1} {:>10.1} {:>4} {:<13} {:<10} {}{}",
            r.pid,
            r.parent_pid.map(|p| p.to_string()).unwrap_or_default(),
            r.cpu_percent,
            r.memory_bytes as f64 / (1024.0 * 1024.0),
            r.thread_count,
            r.priority.map(|p| p.to_string()).unwrap_or_default(),
            format!("{:?}", r.state).to_lowercase(),
            r.name,
            if r.is_system_process { " [protected]" } else { "" },
        );
    }
}

async fn kill(
    policy: Arc<ProtectionPolicy>,
    pid: u32,
    tree: bool,
    start_time: Option<u64>,
) -> Result<(), CliError> {
    let controller = ProcessController::host(policy);
    match start_time {
        Some(start_time) => {
            controller
                .kill_verified(ProcessIdentity { pid, start_time }, tree)
                .await?
        }
        None => controller.kill(pid, tree).await?,
    }
    if tree {
        println!("terminated {pid} and its descendants");
    } else {
        println!("terminated {pid}");
    }
    Ok(())
}

async fn services(cfg: &Config, action: ServiceAction) -> Result<(), CliError> {
    let controller = ServiceController::host().with_settle_delay(cfg.service_settle_delay());
    let name = match action {
        ServiceAction::List { search, state } => {
            let mut records = match search {
                Some(term) => controller.search(&term)?,
                None => controller.list()?,
            };
            if let Some(state) = state {
                records = filter_by_state(&records, state);
            }
            println!("{:<40} {:<14} {:<10} DISPLAY NAME", "NAME", "STATE", "START");
            for r in &records {
                println!(
                    "{:<40} {:<14} {:<10} {}",
                    r.name,
                    r.state.to_string(),
                    format!("{:?}", r.start_mode).to_lowercase(),
                    r.display_name
                );
            }
            return Ok(());
        }
        ServiceAction::Start { name } => {
            controller.start(&name).await?;
            name
        }
        ServiceAction::Stop { name } => {
            controller.stop(&name).await?;
            name
        }
        ServiceAction::Restart { name } => {
            controller.restart(&name).await?;
            name
        }
    };

    // re-read: the manager may report the request accepted before it lands
    let record = controller.query(&name)?;
    println!("{}: {}", record.name, record.state);
    Ok(())
}

async fn sessions(action: SessionAction) -> Result<(), CliError> {
    let controller = SessionController::host();
    match action {
        SessionAction::List => {
            println!("{:<20} {:<10} {:<10} {:>8} LOGON", "USER", "ID", "TYPE", "IDLE");
            for s in controller.list()? {
                println!(
                    "{:<20} {:<10} {:<10} {:>8} {}",
                    s.username,
                    s.session_id,
                    s.session_type,
                    humantime::format_duration(Duration::from_secs(s.idle_seconds)).to_string(),
                    s.logon_time
                        .map(|t| {
                            humantime::format_rfc3339_seconds(
                                std::time::UNIX_EPOCH + Duration::from_secs(t),
                            )
                            .to_string()
                        })
                        .unwrap_or_default(),
                );
            }
        }
        SessionAction::Logoff { user } => {
            controller.log_off(&user).await?;
            println!("logged off {user}");
        }
    }
    Ok(())
}

fn startup(
    search: Option<String>,
    location: Option<StartupLocation>,
    only_enabled: bool,
) -> Result<(), CliError> {
    let inventory = StartupInventory::host();
    let mut entries = match search {
        Some(term) => inventory.search(&term)?,
        None => inventory.list()?,
    };
    if let Some(location) = location {
        entries = filter_by_location(entries, location);
    }
    if only_enabled {
        entries.retain(|e| e.enabled);
    }

    println!("{:<32} {:<8} {:<9} COMMAND", "NAME", "SCOPE", "ENABLED");
    for e in &entries {
        println!(
            "{:<32} {:<8} {:<9} {}",
            e.name,
            e.location.to_string(),
            if e.enabled { "yes" } else { "no" },
            e.command
        );
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
