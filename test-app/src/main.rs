// ntcontrol command-line tool -- sends NTCONTROL commands to a device,
// polls status queries, and computes protected-mode tokens offline.
//
// Usage:
//   ntcontrol-cli --host 192.168.0.8 send QPW
//   ntcontrol-cli --host 192.168.0.8 --user admin1 --pass panasonic send PON QIN
//   ntcontrol-cli --host 192.168.0.8 monitor --interval 2 QPW QIN
//   ntcontrol-cli digest --user admin1 --pass panasonic --nonce ABCDEFGH
//
// Connection settings may also come from NTCONTROL_HOST, NTCONTROL_PORT,
// NTCONTROL_USER, and NTCONTROL_PASS. Set RUST_LOG to adjust logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ntcontrol::{Connection, ConnectionBuilder, DEFAULT_PORT, Error, Monitor, MonitorEvent};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// ntcontrol-cli -- talk to NTCONTROL devices from the command line.
#[derive(Parser)]
#[command(name = "ntcontrol-cli", version, about)]
struct Cli {
    /// Device host name or IP address. Required except for `digest`.
    #[arg(long, env = "NTCONTROL_HOST")]
    host: Option<String>,

    /// Device TCP port.
    #[arg(long, env = "NTCONTROL_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Username for protected mode.
    #[arg(long, env = "NTCONTROL_USER")]
    user: Option<String>,

    /// Password for protected mode.
    #[arg(long, env = "NTCONTROL_PASS", hide_env_values = true)]
    pass: Option<String>,

    /// Per-command reply timeout in milliseconds (0 disables it).
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send each command in order and print its reply.
    Send {
        /// Command bodies, e.g. PON or QPW.
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Poll commands on an interval and print values as they change.
    Monitor {
        /// Seconds between polls.
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Stop after this many seconds (default: run until Ctrl-C).
        #[arg(long)]
        duration: Option<f64>,

        /// Query commands to poll, e.g. QPW QIN.
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Compute the protected-mode token for a nonce without connecting.
    Digest {
        #[arg(long)]
        user: String,
        #[arg(long)]
        pass: String,
        /// The 8-character nonce from a `NTCONTROL 1` greeting.
        #[arg(long)]
        nonce: String,
    },
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

async fn connect(cli: &Cli) -> Result<Connection> {
    let Some(host) = cli.host.as_deref() else {
        bail!("--host (or NTCONTROL_HOST) is required");
    };

    let timeout = (cli.timeout_ms > 0).then(|| Duration::from_millis(cli.timeout_ms));
    let mut builder = ConnectionBuilder::new()
        .host(host)
        .port(cli.port)
        .command_timeout(timeout);

    match (&cli.user, &cli.pass) {
        (Some(user), Some(pass)) => builder = builder.credentials(user, pass),
        (None, None) => {}
        _ => bail!("--user and --pass must be given together"),
    }

    let conn = builder.build().context("invalid connection settings")?;
    let start = Instant::now();
    conn.connect()
        .await
        .with_context(|| format!("failed to connect to {}:{}", host, cli.port))?;

    println!(
        "Connected to {}:{} ({} mode) in {:.0?}",
        host,
        cli.port,
        if conn.is_protected() { "protected" } else { "open" },
        start.elapsed()
    );
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_send(conn: &Connection, commands: &[String]) -> Result<()> {
    let mut failures = 0;
    for command in commands {
        let start = Instant::now();
        match conn.send_command(command).await {
            Ok(reply) => println!("{:<8} -> {:<16} ({:.0?})", command, reply, start.elapsed()),
            Err(Error::Device(literal)) => {
                failures += 1;
                println!("{:<8} -> rejected by device ({})", command, literal);
            }
            Err(e) if e.is_fatal() => return Err(e).context("connection failed"),
            Err(e) => {
                failures += 1;
                println!("{:<8} -> {}", command, e);
            }
        }
    }
    if failures > 0 {
        bail!("{} of {} commands failed", failures, commands.len());
    }
    Ok(())
}

async fn cmd_monitor(
    conn: Arc<Connection>,
    interval: f64,
    duration: Option<f64>,
    commands: &[String],
) -> Result<()> {
    if !(interval.is_finite() && interval > 0.0) {
        bail!("--interval must be a positive number of seconds");
    }

    let monitor = Monitor::spawn(Arc::clone(&conn), Duration::from_secs_f64(interval));
    let mut events = monitor.subscribe();
    let mut state = conn.watch_state();
    for command in commands {
        monitor.add_command(command.as_str()).await;
    }

    let stop = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(stop);

    let result = loop {
        tokio::select! {
            _ = &mut stop => break Ok(()),
            _ = state.wait_for(|s| !s.is_ready()) => {
                break Err(anyhow::anyhow!("connection lost"));
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::ValueChanged { command, value }) => {
                    println!("{:<8} = {}", command, value);
                }
                Ok(MonitorEvent::CommandRejected { command }) => {
                    println!("{:<8} rejected by device", command);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "monitor output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    monitor.shutdown().await;
    result
}

fn cmd_digest(user: &str, pass: &str, nonce: &str) -> Result<()> {
    if nonce.len() != 8 {
        bail!("nonce must be 8 characters, got {}", nonce.len());
    }
    println!("{}", ntcontrol::digest(user, pass, nonce));
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,ntcontrol=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Digest { user, pass, nonce } => cmd_digest(user, pass, nonce),
        Command::Send { commands } => {
            let conn = connect(&cli).await?;
            let result = cmd_send(&conn, commands).await;
            conn.disconnect().await.ok();
            result
        }
        Command::Monitor {
            interval,
            duration,
            commands,
        } => {
            let conn = Arc::new(connect(&cli).await?);
            let result = cmd_monitor(Arc::clone(&conn), *interval, *duration, commands).await;
            conn.disconnect().await.ok();
            result
        }
    }
}
