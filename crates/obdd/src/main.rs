//! obdd - OBD-II diagnostics from the command line
//!
//! Each command that talks to a vehicle opens one session, runs its
//! operation and always closes the session again, even on failure.

mod output;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use obd_core::{
    EndpointChoice, EndpointDescriptor, ProgressEvent, SessionHandle, TransportKind,
    VehicleContext,
};
use obd_link::transport::is_socket_address;
use obdd::{AppConfig, SessionOrchestrator};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::output::{LogFormat, OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "obdd")]
#[command(author, version, about = "OBD-II vehicle diagnostics")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "OBDD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Use the built-in simulated vehicle instead of an adapter
    #[arg(long, global = true)]
    simulate: bool,

    /// Adapter address (serial device or host:port); discovered when omitted
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    vehicle: VehicleArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct VehicleArgs {
    /// Vehicle identifier used for session locking and history
    #[arg(long = "vehicle", default_value = "default", global = true)]
    vehicle_id: String,

    #[arg(long, global = true)]
    make: Option<String>,

    #[arg(long, global = true)]
    model: Option<String>,

    #[arg(long, global = true)]
    year: Option<u16>,

    #[arg(long, global = true)]
    mileage: Option<u32>,
}

impl VehicleArgs {
    fn context(&self) -> VehicleContext {
        VehicleContext {
            vehicle_id: self.vehicle_id.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            year: self.year,
            mileage: self.mileage,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate diagnostic adapters, wired first
    Ports,

    /// Read codes, freeze frame, vehicle info and sensors, then analyze
    Scan,

    /// Read live sensor data
    Live {
        /// Extra PID(s) to poll besides the defaults (hex, e.g. 0x11)
        #[arg(long = "pid", value_parser = parse_pid)]
        pids: Vec<u8>,

        /// Keep polling until Ctrl+C
        #[arg(short, long)]
        watch: bool,

        /// Polling interval in milliseconds when watching
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many polls when watching
        #[arg(long)]
        count: Option<u32>,
    },

    /// Clear trouble codes and verify they are gone
    Clear,

    /// Show saved sessions for the vehicle
    History {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

fn parse_pid(value: &str) -> Result<u8, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u8::from_str_radix(digits, 16).map_err(|_| format!("invalid PID '{}'", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if cli.simulate {
        config.link.simulation = true;
    }

    let ctx = OutputContext::new(cli.format, cli.no_color, cli.quiet);
    let orchestrator = SessionOrchestrator::from_config(&config)?;

    let result = execute(&cli, &orchestrator, &ctx).await;
    orchestrator.shutdown().await;
    result
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .init();
}

async fn execute(cli: &Cli, orchestrator: &SessionOrchestrator, ctx: &OutputContext) -> Result<()> {
    let vehicle = cli.vehicle.context();
    let choice = endpoint_choice(cli.port.as_deref());

    match &cli.command {
        Commands::Ports => {
            let ports = orchestrator.scan_ports().await;
            output::print_ports(ctx, &ports);
        }

        Commands::Scan => {
            let progress = ctx.is_text() && !ctx.quiet;
            let spinner = progress.then(|| spawn_spinner(orchestrator));

            let result = with_session(orchestrator, vehicle, choice, |handle| async move {
                Ok::<_, anyhow::Error>(orchestrator.run_full_scan(handle).await?)
            })
            .await;

            if let Some((bar, task)) = spinner {
                task.abort();
                bar.finish_and_clear();
            }

            let session = result?;
            output::print_session(ctx, &session);
            if !session.success {
                bail!(
                    "Scan failed: {}",
                    session.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        Commands::Live {
            pids,
            watch,
            interval_ms,
            count,
        } => {
            with_session(orchestrator, vehicle, choice, |handle| async move {
                if *watch {
                    watch_live(orchestrator, handle, pids, *interval_ms, *count, ctx).await
                } else {
                    let readings = orchestrator.get_live_data(handle, pids).await?;
                    output::print_sensors(ctx, &readings);
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await?;
        }

        Commands::Clear => {
            let outcome = with_session(orchestrator, vehicle, choice, |handle| async move {
                Ok::<_, anyhow::Error>(orchestrator.clear_codes(handle).await?)
            })
            .await?;
            output::print_clear(ctx, &outcome);
        }

        Commands::History { limit } => {
            let sessions = orchestrator
                .load_history(&vehicle.vehicle_id, *limit)
                .await
                .context("Failed to load session history")?;
            output::print_history(ctx, &sessions);
        }
    }

    Ok(())
}

/// Explicit endpoint from `--port`, else discovery
fn endpoint_choice(port: Option<&str>) -> EndpointChoice {
    match port {
        Some(address) => {
            let kind = if is_socket_address(address) {
                TransportKind::Wireless
            } else {
                TransportKind::Wired
            };
            EndpointChoice::Explicit(EndpointDescriptor::new(kind, address, "User selected"))
        }
        None => EndpointChoice::Auto,
    }
}

/// Run `operation` inside a session that is always ended afterwards
async fn with_session<T, F, Fut>(
    orchestrator: &SessionOrchestrator,
    vehicle: VehicleContext,
    choice: EndpointChoice,
    operation: F,
) -> Result<T>
where
    F: FnOnce(SessionHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let handle = orchestrator
        .begin_session(vehicle, choice)
        .await
        .context("Failed to connect to vehicle")?;

    let result = operation(handle).await;
    orchestrator
        .end_session(handle)
        .await
        .context("Failed to close session")?;
    result
}

async fn watch_live(
    orchestrator: &SessionOrchestrator,
    handle: SessionHandle,
    pids: &[u8],
    interval_ms: u64,
    count: Option<u32>,
    ctx: &OutputContext,
) -> Result<()> {
    ctx.info("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
    let mut polls = 0u32;
    while running.load(Ordering::SeqCst) {
        if count.is_some_and(|limit| polls >= limit) {
            break;
        }
        interval.tick().await;
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let readings = orchestrator.get_live_data(handle, pids).await?;
        polls += 1;
        if ctx.is_text() && !ctx.quiet {
            println!("\n{}", chrono::Local::now().format("%H:%M:%S"));
        }
        output::print_sensors(ctx, &readings);
    }

    ctx.info("Stopped");
    Ok(())
}

/// Spinner on stderr fed by progress events
fn spawn_spinner(orchestrator: &SessionOrchestrator) -> (ProgressBar, JoinHandle<()>) {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message("Connecting...");

    let mut events = BroadcastStream::new(orchestrator.subscribe());
    let task_bar = bar.clone();
    let task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            // Lagged receivers just skip ahead
            if let Ok(event) = event {
                task_bar.set_message(describe(&event));
            }
        }
    });
    (bar, task)
}

fn describe(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Connecting { endpoint, .. } => format!("Connecting to {}...", endpoint),
        ProgressEvent::ConnectionEstablished { protocol, .. } => {
            format!("Connected ({}), reading trouble codes...", protocol)
        }
        ProgressEvent::ConnectionFailed { error, .. } => format!("Connection failed: {}", error),
        ProgressEvent::CodesFound { count, .. } => {
            format!("Found {} trouble code(s), reading sensors...", count)
        }
        ProgressEvent::SensorsRead { count, .. } => format!("Read {} sensor(s)", count),
        ProgressEvent::AnalysisStarted { .. } => "Analyzing...".to_string(),
        ProgressEvent::AnalysisComplete { severity, .. } => {
            format!("Analysis complete ({})", severity.as_str())
        }
        ProgressEvent::SessionSaved { .. } => "Session saved".to_string(),
        ProgressEvent::SessionClosed { .. } => "Session closed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("0x0C"), Ok(0x0C));
        assert_eq!(parse_pid("11"), Ok(0x11));
        assert!(parse_pid("0x1FF").is_err());
        assert!(parse_pid("rpm").is_err());
    }

    #[test]
    fn test_endpoint_choice() {
        assert_eq!(endpoint_choice(None), EndpointChoice::Auto);
        match endpoint_choice(Some("192.168.0.10:35000")) {
            EndpointChoice::Explicit(endpoint) => assert_eq!(endpoint.kind, TransportKind::Wireless),
            other => panic!("unexpected choice: {:?}", other),
        }
        match endpoint_choice(Some("obdlink.local:23")) {
            EndpointChoice::Explicit(endpoint) => assert_eq!(endpoint.kind, TransportKind::Wireless),
            other => panic!("unexpected choice: {:?}", other),
        }
        match endpoint_choice(Some("/dev/ttyUSB0")) {
            EndpointChoice::Explicit(endpoint) => assert_eq!(endpoint.kind, TransportKind::Wired),
            other => panic!("unexpected choice: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "obdd",
            "--simulate",
            "--vehicle",
            "civic",
            "live",
            "--pid",
            "0x11",
            "--watch",
            "--count",
            "3",
        ])
        .unwrap();
        assert!(cli.simulate);
        assert_eq!(cli.vehicle.vehicle_id, "civic");
        match cli.command {
            Commands::Live {
                pids, watch, count, ..
            } => {
                assert_eq!(pids, vec![0x11]);
                assert!(watch);
                assert_eq!(count, Some(3));
            }
            _ => panic!("expected live command"),
        }
    }
}
