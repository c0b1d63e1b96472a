#![forbid(unsafe_code)]

//! latency_test - end-to-end chat round-trip latency harness
//!
//! Usage:
//!   latency_test run --config rooms_users.json --messages 10 --interval-ms 500
//!   latency_test run --server wss://chat.example.com --output results/ --strict
//!   latency_test token --secret "$JWT_SECRET" --user 1:user1 --user 2:user2

use anyhow::{Context, Result};
use chat_latency::config::{FleetConfig, RunSettings};
use chat_latency::orchestrator::Fleet;
use chat_latency::token::{inspect_token, mint_user_token, TokenStatus, DEFAULT_TOKEN_LIFETIME};
use chat_latency::transport::WsTransport;
use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "latency_test")]
#[command(version, about = "Measure chat message round-trip latency across many simultaneous clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the latency test against a chat server
    Run(RunArgs),
    /// Mint bearer tokens for test users
    Token(TokenArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// WebSocket endpoint of the chat service
    #[arg(short, long, env = "WS_URL", default_value = "ws://localhost:4000")]
    server: String,

    /// Fleet definition (users with tokens, rooms with members)
    #[arg(short, long, env = "ROOMS_FILE", default_value = "rooms_users.json")]
    config: PathBuf,

    /// Chat messages sent by each session
    #[arg(short, long, env = "NUM_MESSAGES", default_value_t = 5)]
    messages: usize,

    /// Pause between round trips, in milliseconds
    #[arg(long, env = "MSG_INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Longest wait for every session to join before the start barrier opens
    #[arg(long, env = "SETTLE_MS", default_value_t = 1000)]
    settle_ms: u64,

    /// Longest wait for a single echo; 0 waits until the connection closes
    #[arg(long, env = "ECHO_TIMEOUT_MS", default_value_t = 10_000)]
    echo_timeout_ms: u64,

    /// Abort sessions still running after this many seconds and report what was collected
    #[arg(long, env = "DEADLINE_SECS")]
    deadline_secs: Option<u64>,

    /// Directory for latency_results.json and latency_summary.json
    #[arg(short, long, env = "RESULTS_DIR")]
    output: Option<PathBuf>,

    /// Exit non-zero unless every session completed cleanly with samples
    #[arg(long)]
    strict: bool,
}

impl RunArgs {
    fn settings(&self) -> RunSettings {
        RunSettings {
            server_url: self.server.clone(),
            messages: self.messages,
            interval: Duration::from_millis(self.interval_ms),
            settle: Duration::from_millis(self.settle_ms),
            echo_timeout: (self.echo_timeout_ms > 0).then(|| Duration::from_millis(self.echo_timeout_ms)),
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug)]
struct TokenArgs {
    /// Signing secret shared with the chat service
    #[arg(short, long, env = "JWT_SECRET", hide_env_values = true)]
    secret: String,

    /// User as <id>:<username>; repeat for several users
    #[arg(short, long = "user", required = true)]
    users: Vec<String>,

    /// Token lifetime in hours
    #[arg(long, default_value_t = DEFAULT_TOKEN_LIFETIME.as_secs() / 3600)]
    ttl_hours: u64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Token(args) => {
            mint_tokens(&args)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let settings = args.settings();
    settings.validate()?;

    let fleet = FleetConfig::load(&args.config)
        .with_context(|| format!("loading fleet from {}", args.config.display()))?;
    check_tokens(&fleet);

    let transport = WsTransport::new(&settings.server_url)?;

    println!("\n=== Starting Latency Test ===");
    println!("Server: {}", settings.server_url);
    println!("Sessions: {} across {} rooms", fleet.len(), fleet.room_count());
    println!("Messages per session: {}", settings.messages);
    println!("Interval: {} ms", settings.interval.as_millis());
    match settings.echo_timeout {
        Some(t) => println!("Echo timeout: {} ms", t.as_millis()),
        None => println!("Echo timeout: none"),
    }
    if let Some(d) = settings.deadline {
        println!("Deadline: {}s", d.as_secs());
    }
    println!("=============================\n");

    let fleet = Fleet::new(transport, fleet, settings);
    info!("Run id {}", fleet.run_id());
    let report = fleet.run().await;

    report.print_summary();

    if let Some(dir) = &args.output {
        match report.write_json(dir) {
            Ok(paths) => {
                for path in paths {
                    println!("Results saved to: {}", path.display());
                }
            }
            Err(e) => eprintln!("Failed to write results to {}: {}", dir.display(), e),
        }
    }

    if args.strict && !report.all_clean() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Warn about tokens the service is going to reject anyway
fn check_tokens(fleet: &FleetConfig) {
    let mut seen = HashSet::new();
    for identity in fleet.identities() {
        if !seen.insert(identity.token.as_str()) {
            continue;
        }
        match inspect_token(&identity.token) {
            Ok(TokenStatus::Valid { .. }) => {}
            Ok(TokenStatus::Expired { expired_for, .. }) => warn!(
                "{}: token expired {}s ago; the server will reject it",
                identity.username,
                expired_for.as_secs()
            ),
            Err(e) => warn!("{}: {}", identity.username, e),
        }
    }
}

fn mint_tokens(args: &TokenArgs) -> Result<()> {
    let lifetime = Duration::from_secs(args.ttl_hours * 3600);
    for user in &args.users {
        let (claims, token) = mint_user_token(user, &args.secret, lifetime)?;
        println!("{} token: {}", claims.username, token);
    }
    Ok(())
}
