use clap::{Parser, Subcommand};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use modemport_lib::api::{PinCode, PinCodeModule};
use modemport_lib::io::{list_serial_ports, IoError, SerialTransport};
use modemport_lib::logging;
use modemport_lib::modem::{MatchOptions, ModemPortBuilder};
use modemport_lib::settings::{default_settings_path, load_settings};

/// Talk to an AT command modem over a serial port
#[derive(Parser)]
#[command(name = "modemport")]
#[command(version)]
#[command(about = "Talk to an AT command modem over a serial port")]
struct Cli {
    /// Serial device (overrides the settings file)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Settings file (default: <config dir>/modemport/settings.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Per-command timeout in milliseconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Terminate commands with NUL instead of CRLF
    #[arg(long, global = true)]
    null_terminated: bool,

    /// Also write logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,
    /// Send one command and print its result
    Send {
        /// Full command text, e.g. "AT+CSQ"
        command: String,

        /// Collect response lines matching this regular expression
        #[arg(long)]
        expect: Option<String>,
    },
    /// SIM PIN commands
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },
    /// Print received lines and events
    Monitor {
        /// Stop after this many seconds (default: run until killed)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Subcommand)]
enum PinAction {
    /// Query the SIM PIN state
    Check,
    /// Query the remaining PIN attempts
    Retries,
    /// Enter the PIN, or the PUK and a new PIN
    Enter {
        pin: String,
        new_pin: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_device_error() {
                2
            } else {
                1
            }
        }
    };

    logging::stop_file_logging();
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), IoError> {
    if let Commands::Ports = cli.command {
        for port in list_serial_ports()? {
            print_json(&port);
        }
        return Ok(());
    }

    let settings_path = match cli.config {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let settings = load_settings(&settings_path)?;

    let mut options = settings.options;
    if let Some(baud) = cli.baud {
        options.baud_rate = baud;
    }
    if let Some(timeout) = cli.timeout {
        options.timeout = timeout;
    }
    if cli.null_terminated {
        options.null_terminated = true;
    }

    if let Some(log_dir) = cli.log_dir.or(settings.log_dir) {
        logging::init_file_logging(&log_dir)?;
    }

    let port = cli
        .port
        .or(settings.port)
        .ok_or_else(|| IoError::configuration("No port given; use --port or set `port` in settings"))?;

    let expect = match &cli.command {
        Commands::Send {
            expect: Some(expect),
            ..
        } => Some(
            Regex::new(expect)
                .map_err(|e| IoError::configuration(format!("Invalid --expect: {}", e)))?,
        ),
        _ => None,
    };

    let builder = ModemPortBuilder::new(SerialTransport::new(options.serial_config(&port)))
        .options(options)
        .with_module(&PinCodeModule)?;
    let mut events = builder.subscribe();
    let modem = builder.open().await?;

    let result = match cli.command {
        Commands::Ports => Ok(()),
        Commands::Send { command, .. } => {
            let mut match_options = MatchOptions::new();
            if let Some(expect) = expect {
                match_options = match_options.expect(expect);
            }
            modem
                .write_command(command, match_options)
                .await
                .map(|output| print_json(&output))
        }
        Commands::Pin { action } => {
            let pin = PinCode::new(modem.clone());
            match action {
                PinAction::Check => pin.check_pin().await.map(|event| print_json(&event)),
                PinAction::Retries => pin.pin_retries().await.map(|event| print_json(&event)),
                PinAction::Enter { pin: code, new_pin } => {
                    pin.enter_pin(&code, new_pin.as_deref()).await
                }
            }
        }
        Commands::Monitor { seconds } => {
            let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
            loop {
                let next = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                        Ok(next) => next,
                        Err(_) => break,
                    },
                    None => events.recv().await,
                };
                match next {
                    Ok(event) => print_json(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        eprintln!("Monitor fell behind, {} events skipped", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            Ok(())
        }
    };

    modem.close().await?;
    result
}
