//! Tally CLI - drive the offline data layer from a terminal.
//!
//! Useful for smoke-testing a backend and inspecting the durable cache. All
//! command output is JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tally_core::config::RateLimitDefaults;
use tally_core::{
    ClientConfig, ConnectivityProbe, FetchState, RefreshOutcome, Resource, TallyClient, TallyError,
};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Offline-first data access for the Tally budgeting backend")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Treat the network as unavailable
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Revalidate a resource (or `all`) and print the resulting state
    Fetch {
        resource: String,
        /// Ignore freshness and connectivity
        #[arg(short, long)]
        force: bool,
    },
    /// Print the cached state without touching the network
    Show { resource: String },
    /// Remove a resource from the durable cache
    Clear { resource: String },
    /// Verify the stored credential (subject to the login rate limit)
    Login,
    /// Connectivity, credential and cache overview
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.as_str())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = ClientConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!(
        "Using backend {} ({:?})",
        config.api_base_url, config.environment
    );

    let client = TallyClient::from_config(config).context("Failed to initialize client")?;

    if args.offline {
        client.connectivity().set_online(false);
    } else if let Some(probe) =
        ConnectivityProbe::from_config(client.config(), client.connectivity().clone())?
    {
        probe.check().await;
    }

    let output = match args.command {
        Command::Fetch { resource, force } => {
            if resource.eq_ignore_ascii_case("all") {
                let mut results = serde_json::Map::new();
                for (resource, outcome) in client.refresh_all(force).await {
                    results.insert(
                        resource.key().to_string(),
                        fetch_report(&client, resource, &outcome),
                    );
                }
                Value::Object(results)
            } else {
                let resource: Resource = resource.parse()?;
                let outcome = client.refresh(resource, force).await;
                fetch_report(&client, resource, &outcome)
            }
        }
        Command::Show { resource } => {
            let resource: Resource = resource.parse()?;
            state_json(&client.read(resource))
        }
        Command::Clear { resource } => {
            let resource: Resource = resource.parse()?;
            client.clear(resource);
            json!({ "cleared": resource.key() })
        }
        Command::Login => match client.login_attempt().await {
            Ok(user) => json!({ "ok": true, "user": user }),
            Err(TallyError::Throttled { retry_in_secs, .. }) => {
                json!({ "ok": false, "throttled": true, "retry_in_secs": retry_in_secs })
            }
            Err(e) => {
                let remaining = client
                    .rate_limiter()
                    .remaining_attempts(RateLimitDefaults::AUTH_ACTION);
                json!({
                    "ok": false,
                    "error": e.to_string(),
                    "kind": e.as_request().map(|r| r.kind.to_string()),
                    "remaining_attempts": remaining,
                })
            }
        },
        Command::Status => {
            let quota = client.executor().last_rate_limit();
            json!({
                "connectivity": client.connectivity().state().to_string(),
                "signed_in": client.auth().is_signed_in(),
                "base_url": client.config().api_base_url,
                "cached": client.cached_keys()?,
                "timeout_ms": client.executor().timeout().as_millis() as u64,
                "server_quota_remaining": quota.remaining,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn fetch_report(client: &TallyClient, resource: Resource, outcome: &RefreshOutcome) -> Value {
    let outcome = match outcome {
        RefreshOutcome::Applied => "applied".to_string(),
        RefreshOutcome::Failed(e) => format!("failed ({}, request {})", e.kind, e.request_id),
        RefreshOutcome::Coalesced => "coalesced".to_string(),
        RefreshOutcome::Discarded => "discarded".to_string(),
        RefreshOutcome::Skipped(reason) => format!("skipped ({:?})", reason).to_lowercase(),
    };

    json!({
        "outcome": outcome,
        "state": state_json(&client.read(resource)),
    })
}

fn state_json(state: &FetchState<Value>) -> Value {
    json!({
        "data": state.data,
        "is_loading": state.is_loading,
        "is_online": state.is_online,
        "last_updated": state.last_updated.map(|t| t.to_rfc3339()),
        "error": state.error,
        "stale": state.is_stale_with_error(),
    })
}
