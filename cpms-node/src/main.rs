//! CPMS Node - CLI for the OCPP-J 1.6 charge point management engine
//!
//! Runs the WebSocket gateway and command intake on an in-process event bus
//! and logs every domain event and command response.
//!
//! # Usage
//!
//! ```bash
//! # Accept CP001 and CP002 on the default port
//! cpms-node --charger CP001 --charger CP002
//!
//! # Map wire identities to platform ids, accept commands on stdin
//! cpms-node --charger CP001=charger-17 --stdin-commands
//!
//! # Development: accept any identity
//! cpms-node --allow-any --bind 127.0.0.1:9000 --log-level debug
//! ```
//!
//! With `--stdin-commands`, each line is a command request:
//!
//! ```text
//! {"chargerId":"CP001","action":"Reset","params":{"type":"Soft"},"responseKey":"r1"}
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cpms_core::{topics, CommandRequest, EventBus, MemoryBus, Subscription};
use cpms_gateway::{AcceptAll, Engine, EngineConfig, IdentityValidator, StaticDirectory};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// OCPP-J 1.6 charge point management node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket listen address
    #[arg(long, env = "CPMS_BIND", default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// URL path prefix; chargers connect to <prefix>/<identity>
    #[arg(long, env = "CPMS_PATH_PREFIX", default_value = "/ocpp")]
    path_prefix: String,

    /// Heartbeat interval handed out on boot (seconds)
    #[arg(long, env = "CPMS_HEARTBEAT_INTERVAL", default_value = "300")]
    heartbeat_interval: u32,

    /// Command timeout (seconds)
    #[arg(long, env = "CPMS_COMMAND_TIMEOUT", default_value = "30")]
    command_timeout: u64,

    /// Topic carrying command requests
    #[arg(long, env = "CPMS_COMMAND_TOPIC", default_value = topics::COMMAND_REQUEST)]
    command_topic: String,

    /// Topic receiving command responses
    #[arg(long, env = "CPMS_RESPONSE_TOPIC", default_value = topics::COMMAND_RESPONSE)]
    response_topic: String,

    /// Allowed charger, as IDENTITY or IDENTITY=PLATFORM_ID (can be repeated)
    #[arg(long, env = "CPMS_CHARGERS", value_delimiter = ',')]
    charger: Vec<String>,

    /// Accept any charger identity
    #[arg(long, env = "CPMS_ALLOW_ANY")]
    allow_any: bool,

    /// Publish charger.disconnected events
    #[arg(long, env = "CPMS_DISCONNECT_EVENTS")]
    publish_disconnect_events: bool,

    /// Keep the older socket open when a charger reconnects
    #[arg(long)]
    keep_superseded: bool,

    /// Read command requests as JSON lines from stdin
    #[arg(long)]
    stdin_commands: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            CPMS Node - OCPP-J 1.6 Central System             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", args.bind);
    println!("║  Path:     {:<50} ║", format!("{}/<identity>", args.path_prefix));
    println!("║  Commands: {:<50} ║", args.command_topic);
    println!("║  Chargers: {:<50} ║", charger_summary(&args));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = EngineConfig::new(args.bind)
        .with_path_prefix(&args.path_prefix)
        .with_heartbeat_interval(args.heartbeat_interval)
        .with_command_timeout(Duration::from_secs(args.command_timeout))
        .with_topics(&args.command_topic, &args.response_topic);

    if args.keep_superseded {
        config = config.keep_superseded();
    }
    if args.publish_disconnect_events {
        config = config.with_disconnect_events();
    }

    let validator = build_validator(&args);
    let bus = Arc::new(MemoryBus::new());

    // Log everything the engine publishes
    let mut watched = vec![
        topics::CHARGER_CONNECTED,
        topics::CHARGER_DISCONNECTED,
        topics::CHARGER_BOOT,
        topics::STATUS_UPDATE,
        topics::SESSION_START_REQUESTED,
        topics::SESSION_STOP_REQUESTED,
        topics::SESSION_METER_VALUES,
    ];
    watched.push(args.response_topic.as_str());
    for topic in watched {
        let subscription = bus.subscribe(topic).await?;
        tokio::spawn(log_topic(subscription));
    }

    info!("Starting CPMS engine...");

    let engine = Engine::new(config, bus.clone(), validator);
    let running = engine.start().await?;

    if args.stdin_commands {
        tokio::spawn(read_commands(bus.clone(), args.command_topic.clone()));
        info!("Reading command requests from stdin");
    }

    tokio::select! {
        result = running.wait() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}

/// Identity validator from `--allow-any` / `--charger`
fn build_validator(args: &Args) -> Arc<dyn IdentityValidator> {
    if args.allow_any {
        warn!("Accepting any charger identity");
        return Arc::new(AcceptAll);
    }

    let directory = args
        .charger
        .iter()
        .fold(StaticDirectory::new(), |dir, entry| match entry.split_once('=') {
            Some((code, id)) => dir.with_charger(code.trim(), id.trim()),
            None => dir.with_charger(entry.trim(), entry.trim()),
        });

    if directory.is_empty() {
        warn!("No chargers allowed; every connection will be rejected (use --charger or --allow-any)");
    } else {
        info!("Allowing {} charger(s)", directory.len());
    }

    Arc::new(directory)
}

fn charger_summary(args: &Args) -> String {
    if args.allow_any {
        "any".to_string()
    } else if args.charger.is_empty() {
        "none".to_string()
    } else {
        args.charger.join(", ")
    }
}

async fn log_topic(mut subscription: Subscription) {
    while let Some(message) = subscription.recv().await {
        info!(
            "[{}] {} {}",
            message.topic,
            message.key.as_deref().unwrap_or("-"),
            message.payload
        );
    }
}

/// Publish JSON-line command requests from stdin
async fn read_commands(bus: Arc<MemoryBus>, topic: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: CommandRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring invalid command request: {}", e);
                continue;
            }
        };

        match request.to_message(&topic) {
            Ok(message) => {
                debug!("Publishing {} for {}", request.action, request.charger_id);
                if let Err(e) = bus.publish(message).await {
                    error!("Failed to publish command: {}", e);
                }
            }
            Err(e) => error!("Failed to encode command: {}", e),
        }
    }

    debug!("stdin closed, no more commands");
}
