use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::clock;
use gatekeeper::config::{GatekeeperConfig, LogFormat, LoggingConfig};
use gatekeeper::entitlement::{EntitlementGate, PolicyCache, UserGateState};
use gatekeeper::ratelimit::{spawn_cleanup, CounterStore, RateLimiter, DEFAULT_KEY};

/// Admission control for request quotas and subscription entitlements.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// YAML configuration file; `GATEKEEPER__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective entitlement policy
    Policy {
        /// Skip both cache tiers and fetch a new policy
        #[arg(long)]
        refresh: bool,

        /// Drop the cached policy before resolving
        #[arg(long)]
        clear: bool,
    },

    /// Decide whether a user should see the paywall
    Gate {
        /// Install time, RFC 3339
        #[arg(long)]
        install_date: DateTime<Utc>,

        /// Trial end time, RFC 3339
        #[arg(long)]
        trial_end_date: Option<DateTime<Utc>>,

        #[arg(long)]
        premium: bool,

        /// Authoritative trial expiry flag
        #[arg(long)]
        trial_expired: Option<bool>,

        #[arg(long)]
        usage_hours: Option<f64>,

        #[arg(long)]
        sessions: Option<u64>,
    },

    /// Decide whether a feature area is accessible
    Feature {
        /// Feature area, e.g. `voice_notes`
        area: String,

        #[arg(long)]
        premium: bool,
    },

    /// Print the effective rate limit table, or one rule
    Limits {
        name: Option<String>,
    },

    /// Run a burst of requests through a named rate limit rule
    Simulate {
        /// Rule name, e.g. `auth` or `POST:/v1/contacts`
        rule: String,

        #[arg(long, default_value_t = 1)]
        requests: u32,

        #[arg(long, default_value = DEFAULT_KEY)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatekeeperConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Policy { refresh, clear } => {
            let cache = policy_cache(&config)?;
            if clear {
                cache.clear_cache().await?;
            }

            let (document, origin) = if refresh {
                (cache.refresh_config().await, None)
            } else {
                let resolved = cache.resolve().await;
                (resolved.document, Some(resolved.origin))
            };

            if let Some(origin) = origin {
                info!(origin = %origin, "Resolved policy");
            }
            println!("{}", serde_json::to_string_pretty(&*document)?);
        }

        Command::Gate {
            install_date,
            trial_end_date,
            premium,
            trial_expired,
            usage_hours,
            sessions,
        } => {
            let document = policy_cache(&config)?.get_config().await;
            let state = UserGateState {
                install_date,
                trial_end_date,
                is_premium: premium,
                is_trial_expired: trial_expired,
                usage_hours,
                session_count: sessions,
            };

            let (blocked, rule) = EntitlementGate::new().decide_block(&document, &state);
            println!(
                "{}",
                serde_json::json!({ "blocked": blocked, "rule": rule.as_str() })
            );
        }

        Command::Feature { area, premium } => {
            let document = policy_cache(&config)?.get_config().await;

            let (accessible, rule) = EntitlementGate::new().decide_feature(&document, &area, premium);
            println!(
                "{}",
                serde_json::json!({ "feature_area": area, "accessible": accessible, "rule": rule.as_str() })
            );
        }

        Command::Limits { name } => {
            let table = config.rate_limiting.limit_table()?;
            match name {
                Some(name) => {
                    let rule = table
                        .find(&name)
                        .with_context(|| format!("No rate limit rule named '{}'", name))?;
                    print!("{}", serde_yaml::to_string(rule)?);
                }
                None => print!("{}", serde_yaml::to_string(&table)?),
            }
        }

        Command::Simulate { rule, requests, key } => {
            let table = config.rate_limiting.limit_table()?;
            let policy = table
                .policy(&rule)
                .with_context(|| format!("No rate limit rule named '{}'", rule))?;

            let store: Arc<dyn CounterStore> = config.rate_limiting.store.build(clock::system());
            let sweeper = spawn_cleanup(store.clone(), config.rate_limiting.cleanup_interval());
            let limiter = RateLimiter::new(store).with_failure_mode(config.rate_limiting.failure_mode);

            let key = format!("{}:{}", rule, key);
            for n in 1..=requests {
                let decision = limiter.check(&key, &policy).await;
                println!(
                    "{}",
                    serde_json::json!({
                        "request": n,
                        "allowed": decision.allowed,
                        "limit": decision.limit,
                        "remaining": decision.remaining,
                        "reset": decision.reset_unix_secs(),
                        "retry_after": decision.retry_after_secs,
                    })
                );
            }

            sweeper.abort();
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn policy_cache(config: &GatekeeperConfig) -> anyhow::Result<PolicyCache> {
    config.entitlement.policy_cache().context("Failed to build policy cache")
}
