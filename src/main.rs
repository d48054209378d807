use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

use turnstile::config::TurnstileConfig;
use turnstile::logging::init_tracing;
use turnstile::ratelimit::{Category, PolicyRegistry, RateLimitHeaders, RequestContext};

/// Replay request records through the admission policies.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON); TURNSTILE__* env vars override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON-lines request records, or `-` for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// System load to report before replaying, between 0.0 and 1.0
    #[arg(short, long)]
    load: Option<f64>,
}

/// One inbound request to evaluate.
#[derive(Debug, Deserialize)]
struct RequestRecord {
    category: String,
    #[serde(default)]
    remote_addr: Option<IpAddr>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// The verdict printed for each record.
#[derive(Debug, Serialize)]
struct Verdict {
    category: String,
    key: String,
    allowed: bool,
    headers: RateLimitHeaders,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = TurnstileConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging)?;

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match args.config.as_deref() {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from environment and defaults"),
    }

    let registry = PolicyRegistry::from_config(&config)?;
    if let Some(load) = args.load {
        registry.update_system_load(load);
        info!(load = registry.system_load(), "System load reported");
    }

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if args.input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        Box::new(BufReader::new(tokio::fs::File::open(&args.input).await?))
    };

    let result = tokio::select! {
        result = replay(&registry, reader) => result,
        _ = shutdown_signal() => Ok(()),
    };

    registry.destroy();
    info!("Turnstile stopped");
    result
}

/// Evaluate every record in `reader`, writing one JSON verdict per line.
async fn replay(
    registry: &PolicyRegistry,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
) -> anyhow::Result<()> {
    let mut lines = reader.lines();
    let mut stdout = tokio::io::stdout();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: RequestRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed record");
                continue;
            }
        };
        let category: Category = match record.category.parse() {
            Ok(category) => category,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping record");
                continue;
            }
        };

        let request = to_request(&record);
        let policy = registry.get(category);
        let key = policy.key_for(&request);
        let decision = policy.check_key(&key);

        let verdict = Verdict {
            category: category.to_string(),
            key,
            allowed: decision.allowed,
            headers: decision.headers(),
            message: policy.rejection(&decision).map(|r| r.message),
        };

        let mut out = serde_json::to_vec(&verdict)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
    }

    stdout.flush().await?;
    Ok(())
}

fn to_request(record: &RequestRecord) -> RequestContext {
    let mut request = record
        .headers
        .iter()
        .fold(RequestContext::new(), |req, (name, value)| {
            req.with_header(name, value.clone())
        });
    if let Some(addr) = record.remote_addr {
        request = request.with_remote_addr(addr);
    }
    request
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
