mod payload;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use clap::{Parser, Subcommand};
use payload::{ConfigArgs, OptionArg, PathRuleArg, ProcessInfoArgs, ProcessRuleArg, RuleHeader};
use std::path::{Path, PathBuf};
use warden_core::events::to_json;
use warden_core::ipc::{IpcRequest, IpcResponse};
use warden_core::ipc_client::{send_request, EventStream};
use warden_core::paths::{control_socket_path, event_socket_path, secret_path};
use warden_core::protocol::ControlCode;

#[derive(Parser)]
#[command(name = "warden-cli")]
#[command(about = "CLI for the Warden sensor control and event sockets", long_about = None)]
struct Cli {
    /// Control socket (defaults to the service's data directory)
    #[arg(long, global = true)]
    control_socket: Option<PathBuf>,

    /// Event socket (defaults to the service's data directory)
    #[arg(long, global = true)]
    event_socket: Option<PathBuf>,

    /// File holding the base64 IPC secret
    #[arg(long, global = true)]
    secret: Option<PathBuf>,

    /// Print the hex-encoded control payload instead of sending it
    #[arg(long, global = true)]
    print_payload: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get service status
    Status,

    /// Start monitoring
    Start,

    /// Stop monitoring and drop queued events
    Stop,

    /// Change configuration fields
    SetConfig(ConfigArgs),

    /// Update the protected file rules
    FileRules {
        #[command(flatten)]
        header: RuleHeader,
        /// ACCESS[,recursive][,tag=T]:PATH
        #[arg(long = "rule")]
        rules: Vec<PathRuleArg>,
    },

    /// Update the protected registry rules
    RegRules {
        #[command(flatten)]
        header: RuleHeader,
        /// ACCESS[,recursive][,tag=T]:KEY
        #[arg(long = "rule")]
        rules: Vec<PathRuleArg>,
    },

    /// Update the rules of one process option
    ProcessRules {
        #[arg(long, value_enum)]
        option: OptionArg,
        #[command(flatten)]
        header: RuleHeader,
        /// VALUE[,inherit][,tag=T]:IMAGE
        #[arg(long = "rule")]
        rules: Vec<ProcessRuleArg>,
    },

    /// Force options on a running process
    ProcessInfo(ProcessInfoArgs),

    /// Attach as the event consumer and print records as JSON lines
    Listen {
        /// Stop after this many records
        #[arg(short, long)]
        count: Option<usize>,
    },
}

fn load_secret(path: Option<PathBuf>) -> Result<Vec<u8>> {
    let path = match path {
        Some(p) => p,
        None => secret_path()?,
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("read secret {}", path.display()))?;
    let secret = B64
        .decode(text.trim())
        .map_err(|e| anyhow!("secret {} is not base64: {e}", path.display()))?;
    if secret.is_empty() {
        return Err(anyhow!("secret {} is empty", path.display()));
    }
    Ok(secret)
}

fn control_payload(command: &Commands) -> Result<Option<(ControlCode, Vec<u8>)>> {
    Ok(Some(match command {
        Commands::Start => (ControlCode::Start, Vec::new()),
        Commands::Stop => (ControlCode::Stop, Vec::new()),
        Commands::SetConfig(args) => (ControlCode::SetConfig, payload::config(args)?),
        Commands::FileRules { header, rules } => {
            (ControlCode::UpdateFileRules, payload::path_rules(header, rules)?)
        }
        Commands::RegRules { header, rules } => {
            (ControlCode::UpdateRegistryRules, payload::path_rules(header, rules)?)
        }
        Commands::ProcessRules {
            option,
            header,
            rules,
        } => (
            ControlCode::UpdateProcessRules,
            payload::process_rules(*option, header, rules)?,
        ),
        Commands::ProcessInfo(args) => (ControlCode::SetProcessInfo, payload::process_info(args)?),
        Commands::Status | Commands::Listen { .. } => return Ok(None),
    }))
}

async fn listen(socket: &Path, secret: &[u8], count: Option<usize>) -> Result<()> {
    let mut stream = EventStream::connect(socket, secret).await?;
    let mut seen = 0usize;
    while let Some(record) = stream.next_record().await? {
        match to_json(&record) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("undecodable record ({e}): {}", hex::encode(&record)),
        }
        seen += 1;
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let control = control_payload(&cli.command)?;
    if cli.print_payload {
        let (code, bytes) =
            control.ok_or_else(|| anyhow!("this command does not send a control payload"))?;
        println!("{} {}", code.raw(), hex::encode(bytes));
        return Ok(());
    }

    let secret = load_secret(cli.secret)?;
    if let Commands::Listen { count } = cli.command {
        let socket = match cli.event_socket {
            Some(p) => p,
            None => event_socket_path()?,
        };
        return listen(&socket, &secret, count).await;
    }

    let socket = match cli.control_socket {
        Some(p) => p,
        None => control_socket_path()?,
    };
    let request = match control {
        Some((code, bytes)) => IpcRequest::control(code.raw(), &bytes),
        None => IpcRequest::Status,
    };
    let response = send_request(&socket, &secret, request)
        .await
        .with_context(|| format!("control socket {}", socket.display()))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if let IpcResponse::Rejected { error } = response {
        return Err(anyhow!("rejected: {error}"));
    }
    Ok(())
}
