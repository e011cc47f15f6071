//! iotide - command-line front end for the IoT IDE device link.
//!
//! Usage:
//!   iotide ports
//!   iotide run main.py
//!   iotide upload boot.py --name boot.py
//!   iotide monitor --export ./logs --format timestamped

use clap::{Parser, Subcommand};
use iotide_assistant::{Assistant, AssistantRequest};
use iotide_lib::logging::{init_logging, DEFAULT_FILTER};
use iotide_lib::{IdeContext, IdeError, IdeSettings};
use iotide_serial::serial::{
    repl::has_traceback, BackendPreference, EventKind, ExportFormat, SerialEvent, SessionState,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "iotide")]
#[command(about = "Talk to a MicroPython board over serial")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to $IOTIDE_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial backend: auto, host-process, in-process or simulated
    #[arg(long, global = true)]
    backend: Option<BackendPreference>,

    /// Serial bridge executable for the host-process backend
    #[arg(long, global = true)]
    bridge: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports, known boards first
    Ports,
    /// Connect, print the connection, then disconnect
    Connect {
        #[command(flatten)]
        target: Target,
    },
    /// Stream device output; stdin lines are sent to the device
    Monitor {
        #[command(flatten)]
        target: Target,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Write the captured log into this directory on exit
        #[arg(long)]
        export: Option<PathBuf>,
        /// Export format: plain, timestamped, hex or csv
        #[arg(long, default_value = "plain")]
        format: ExportFormat,
        /// Prefix exported entries with TX/RX markers
        #[arg(long)]
        markers: bool,
    },
    /// Execute a program line by line through the REPL
    Run {
        file: PathBuf,
        #[command(flatten)]
        target: Target,
    },
    /// Write a file onto the device filesystem
    Upload {
        file: PathBuf,
        /// Name on the device (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        target: Target,
    },
    /// Send one REPL command and print the response
    Exec {
        command: String,
        /// Response timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
        #[command(flatten)]
        target: Target,
    },
    /// Ask the coding assistant
    Ask {
        message: String,
        /// File to send as context
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Port path; auto-connect when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (defaults to the configured rate)
    #[arg(short, long)]
    baud: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(DEFAULT_FILTER, cli.json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), IdeError> {
    let mut settings = IdeSettings::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }
    if cli.bridge.is_some() {
        settings.bridge_path = cli.bridge;
    }

    if let Command::Ask { message, file } = cli.command {
        return ask(&settings, message, file.as_deref()).await;
    }

    let ctx = IdeContext::build(settings)?;
    let result = dispatch(&ctx, cli.command).await;
    ctx.shutdown().await;
    result
}

async fn dispatch(ctx: &IdeContext, command: Command) -> Result<(), IdeError> {
    match command {
        Command::Ports => {
            let ports = ctx.session().discovery().ranked_ports().await;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            let last = ctx.session().discovery().load_last_device();
            for port in ports {
                let marker = match last {
                    Some(ref record) if record.path == port.path => " (last used)",
                    _ => "",
                };
                println!("{}\t{}{}", port.path, port.display_name, marker);
            }
            Ok(())
        }
        Command::Connect { target } => {
            let info = connect(ctx, &target).await?;
            println!(
                "Connected to {} at {} baud via {} backend",
                info.port.display_name,
                info.baud_rate,
                info.backend.label()
            );
            Ok(())
        }
        Command::Monitor { target, duration, export, format, markers } => {
            connect(ctx, &target).await?;
            monitor(ctx, duration.map(Duration::from_secs)).await?;
            if let Some(dir) = export {
                let path = ctx.monitor().write_export(&dir, format, markers)?;
                eprintln!("Log written to {}", path.display());
            }
            Ok(())
        }
        Command::Run { file, target } => {
            let source = read_file(&file)?;
            connect(ctx, &target).await?;
            let lines = ctx.repl().execute_program(&source).await?;
            for line in &lines {
                println!("{}", line);
            }
            if has_traceback(&lines) {
                return Err(IdeError::Usage("Program raised an exception".into()));
            }
            Ok(())
        }
        Command::Upload { file, name, target } => {
            let content = read_file(&file)?;
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| IdeError::Usage(format!("No file name in {}", file.display())))?,
            };
            connect(ctx, &target).await?;
            ctx.repl().upload_file(&name, &content).await?;
            println!("Uploaded {} ({} bytes)", name, content.len());
            Ok(())
        }
        Command::Exec { command, timeout, target } => {
            connect(ctx, &target).await?;
            let response = match timeout {
                Some(ms) => {
                    ctx.repl()
                        .send_command_and_wait(&command, Duration::from_millis(ms))
                        .await?
                }
                None => ctx.repl().send_command(&command).await?,
            };
            println!("{}", response);
            Ok(())
        }
        Command::Ask { .. } => Err(IdeError::Usage("ask does not use a device".into())),
    }
}

async fn connect(
    ctx: &IdeContext,
    target: &Target,
) -> Result<iotide_serial::serial::ConnectionInfo, IdeError> {
    let info = match target.port {
        Some(ref path) => ctx.connect_path(path, target.baud).await?,
        None => ctx.auto_connect().await?,
    };
    log::info!("Connected to {} at {} baud", info.port.path, info.baud_rate);
    Ok(info)
}

async fn monitor(ctx: &IdeContext, duration: Option<Duration>) -> Result<(), IdeError> {
    let session = ctx.session();
    let data = session.on(EventKind::Data, |event| {
        if let SerialEvent::Data(text) = event {
            let mut out = std::io::stdout();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    });
    let errors = session.on(EventKind::Error, |event| {
        if let SerialEvent::Error(message) = event {
            eprintln!("serial error: {}", message);
        }
    });

    let mut state = session.subscribe_state();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let deadline = tokio::time::sleep(duration.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            _ = &mut deadline, if duration.is_some() => break Ok(()),
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == SessionState::Disconnected {
                    eprintln!("Device disconnected");
                    break Ok(());
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = ctx.send_line(&line).await {
                        break Err(IdeError::from(e));
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => break Err(IdeError::io("Failed to read stdin", e)),
            },
        }
    };

    session.off(EventKind::Data, data);
    session.off(EventKind::Error, errors);
    result
}

async fn ask(settings: &IdeSettings, message: String, file: Option<&Path>) -> Result<(), IdeError> {
    let endpoint = settings
        .assistant_endpoint
        .clone()
        .ok_or_else(|| IdeError::Usage("No assistantEndpoint configured".into()))?;
    let assistant = iotide_assistant::HttpAssistant::new(endpoint, settings.assistant_api_key.clone());

    let mut request = AssistantRequest::new(message);
    if let Some(path) = file {
        let content = read_file(path)?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        request = request.with_file_context(&name, &content);
    }
    println!("{}", assistant.ask(&request).await?);
    Ok(())
}

fn read_file(path: &Path) -> Result<String, IdeError> {
    std::fs::read_to_string(path).map_err(|e| IdeError::io(format!("Failed to read {}", path.display()), e))
}
