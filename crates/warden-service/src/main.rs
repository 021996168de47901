use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use warden_core::clock::ManualClock;
use warden_core::config_store::{BlobBackend, FileBackend, MemoryBackend};
use warden_core::control::LogLevelHook;
use warden_core::ipc::IpcServer;
use warden_core::protocol::ControlCode;
use warden_core::{Engine, EngineOptions};
use warden_service::event_socket::EventServer;
use warden_service::handler::ControlHandler;
use warden_service::replay::{replay, JsonLinesChannel};
use warden_service::secret::load_or_create_secret;
use warden_service::{init_logging, ServiceSettings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Warden endpoint sensor service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the service
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        control_socket: Option<PathBuf>,
        #[arg(long)]
        event_socket: Option<PathBuf>,
    },
    /// Replay a JSON-lines operation script and print the events it produces
    Replay {
        script: PathBuf,
        /// Load and save configuration blobs here instead of in memory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_hook = init_logging()?;
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            data_dir,
            control_socket,
            event_socket,
        } => {
            let settings = ServiceSettings::resolve(data_dir, control_socket, event_socket)?;
            run_command(settings, log_hook).await
        }
        Commands::Replay { script, data_dir } => replay_command(&script, data_dir, log_hook),
    }
}

fn restrict(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

async fn run_command(settings: ServiceSettings, log_hook: LogLevelHook) -> Result<()> {
    std::fs::create_dir_all(&settings.data_dir)?;
    let secret = load_or_create_secret(&settings.secret_path)?;

    let engine = Arc::new(Engine::new(EngineOptions::new(Box::new(FileBackend::new(
        &settings.store_path,
    )))));
    engine.set_log_level_hook(log_hook);
    engine.initialize()?;
    engine.spawn_delivery()?;

    let control = Arc::new(IpcServer::new(secret.clone(), settings.control_socket.clone()));
    let control_listener = control.bind()?;
    restrict(&settings.control_socket)?;
    let events = Arc::new(EventServer::new(secret, settings.event_socket.clone(), engine.clone()));
    let event_listener = events.bind()?;
    restrict(&settings.event_socket)?;

    let control_task = {
        let handler = Arc::new(ControlHandler::new(engine.clone()));
        tokio::spawn(async move { control.serve(control_listener, handler).await })
    };
    let event_task = tokio::spawn(async move { events.serve(event_listener).await });

    info!(
        control = %settings.control_socket.display(),
        events = %settings.event_socket.display(),
        "service started"
    );
    signal::ctrl_c().await?;
    info!("service stopping");
    control_task.abort();
    event_task.abort();
    engine.shutdown();
    let _ = std::fs::remove_file(&settings.control_socket);
    let _ = std::fs::remove_file(&settings.event_socket);
    Ok(())
}

fn replay_command(
    script: &Path,
    data_dir: Option<PathBuf>,
    log_hook: LogLevelHook,
) -> Result<()> {
    let backend: Box<dyn BlobBackend> = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            Box::new(FileBackend::new(dir.join("config.blobs")))
        }
        None => Box::new(MemoryBackend::new()),
    };
    let clock = Arc::new(ManualClock::new(0));
    let host_pid = std::process::id();
    let mut options = EngineOptions::new(backend);
    options.clock = clock.clone();
    let engine = Arc::new(Engine::new(options));
    engine.set_log_level_hook(log_hook);
    engine.initialize()?;
    engine.connect_consumer(host_pid, Arc::new(JsonLinesChannel::new(Box::new(std::io::stdout()))))?;
    engine.handle_control(host_pid, ControlCode::Start.raw(), &[])?;

    let file = std::fs::File::open(script)
        .map_err(|e| anyhow!("open script {}: {e}", script.display()))?;
    let report = replay(engine, clock, host_pid, BufReader::new(file))?;
    eprintln!("{}", serde_json::to_string(&report)?);
    Ok(())
}
