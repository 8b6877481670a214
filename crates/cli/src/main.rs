use castline_core::audit::AUDIT_TARGET;
use castline_core::config::AppConfig;
use castline_core::metrics::MetricsStore;
use castline_core::secrets::{mask_secret, SecretsStore};
use castline_line::{sign, LineClient, ReplySender};
use castline_persistence::SqliteCastStore;
use castline_ratelimit::{RateLimitPolicy, RateLimiter};
use castline_server::{AppState, Gateway, PhoneVerificationService, RegistrationService};
use castline_sms::{HttpSmsGateway, LogOnlySms, SmsSender};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod cast;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "castline")]
#[command(version = VERSION)]
#[command(about = "LINE registration and phone verification gateway for cast management")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Config file (defaults to ~/.castline/config.json)
        #[arg(short, long, env = "CASTLINE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the x-line-signature value for a request body
    Sign {
        /// File holding the exact body bytes
        #[arg(short, long)]
        body: PathBuf,
        /// Channel secret (defaults to the configured one)
        #[arg(short, long)]
        secret: Option<String>,
    },
    /// Show castline status
    Status,
    /// Manage casts
    Cast {
        #[command(subcommand)]
        action: cast::CastActions,
    },
    /// Manage stored secrets
    Secrets {
        #[command(subcommand)]
        action: SecretsActions,
    },
}

#[derive(Subcommand)]
enum SecretsActions {
    /// Store a secret (line_channel_secret, line_channel_access_token, gateway_auth_token)
    Set { key: String, value: String },
}

fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".castline")
}

/// Config file merged with the secrets store.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    let secrets = SecretsStore::load(&SecretsStore::default_path())?;
    secrets.apply_to(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let (non_blocking, _guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        get_config_dir().join("logs"),
        "audit.jsonl",
    ));

    let audit_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_level(false)
        .with_file(false)
        .with_line_number(false)
        .without_time() // Timestamp is in JSON
        .with_filter(tracing_subscriber::filter::Targets::new().with_target(AUDIT_TARGET, Level::INFO));

    let stdout_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(Level::INFO.into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != AUDIT_TARGET
        }));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(audit_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => run_serve(config).await,
        Commands::Sign { body, secret } => run_sign(body, secret),
        Commands::Status => {
            run_status();
            Ok(())
        }
        Commands::Cast { action } => {
            let config = load_config(None)?;
            let store = SqliteCastStore::new(&config.database.url).await?;
            cast::run(action, &store).await
        }
        Commands::Secrets {
            action: SecretsActions::Set { key, value },
        } => {
            let path = SecretsStore::default_path();
            let mut secrets = SecretsStore::load(&path)?;
            secrets.set(key.clone(), value);
            secrets.save(&path)?;
            println!("Stored {} in {}", key, path.display());
            Ok(())
        }
    }
}

async fn run_serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let metrics = MetricsStore::new();

    let store = SqliteCastStore::new(&config.database.url).await?;

    let policy = RateLimitPolicy::new(
        config.rate_limit.max_attempts,
        Duration::from_secs(config.rate_limit.window_secs),
    );
    let limiter = Arc::new(RateLimiter::in_memory(policy));

    let sms: Arc<dyn SmsSender> = match &config.sms {
        Some(sms) => {
            info!(endpoint = %sms.endpoint, "SMS gateway configured");
            Arc::new(HttpSmsGateway::new(
                sms.endpoint.clone(),
                sms.api_key.clone(),
                sms.sender.clone(),
            ))
        }
        None => {
            warn!("No SMS gateway configured; codes are not delivered and only appear in the log with RUST_LOG=castline_sms=debug");
            Arc::new(LogOnlySms)
        }
    };

    let replier: Option<Arc<dyn ReplySender>> = config
        .line
        .as_ref()
        .and_then(|line| {
            line.channel_access_token
                .clone()
                .filter(|t| !t.is_empty())
                .map(|token| (token, line.api_base.clone()))
        })
        .map(|(token, api_base)| {
            info!(token = %mask_secret(&token), "LINE reply client enabled");
            Arc::new(LineClient::new(token, api_base)) as Arc<dyn ReplySender>
        });
    if replier.is_none() {
        warn!("No LINE channel access token configured, webhook replies disabled");
    }

    let dispatcher = RegistrationService::new(store.clone(), replier).into_dispatcher();
    let verification = PhoneVerificationService::new(store.clone(), limiter, sms);

    let state = AppState {
        auth_token: config.server.auth_token.clone().filter(|t| !t.is_empty()),
        line_channel_secret: config.channel_secret().map(str::to_string),
        dispatcher: Arc::new(dispatcher),
        verification,
        store,
        metrics,
    };

    let gateway = Gateway::new(state, config.server.port)
        .with_body_limit(config.server.max_body_bytes)
        .with_sweep_interval(Duration::from_secs(
            config.rate_limit.sweep_interval_secs.max(1),
        ));

    gateway
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
}

fn run_sign(body_path: PathBuf, secret: Option<String>) -> anyhow::Result<()> {
    let secret = match secret {
        Some(secret) => secret,
        None => load_config(None)?
            .channel_secret()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("No channel secret given and none configured"))?,
    };
    let body = std::fs::read(&body_path)?;
    println!("{}", sign(&secret, &body));
    Ok(())
}

fn run_status() {
    let config_path = AppConfig::default_path();
    let secrets_path = SecretsStore::default_path();

    println!("castline status\n");

    if config_path.exists() {
        println!("Config: {} ✓", config_path.display());
    } else {
        println!("Config: {} (not found, using defaults)", config_path.display());
    }
    if secrets_path.exists() {
        println!("Secrets: {} ✓", secrets_path.display());
    }

    match load_config(None) {
        Ok(config) => {
            println!("Port: {}", config.server.port);
            println!("Database: {}", config.database.url);
            println!(
                "Rate limit: {} sends per {}s",
                config.rate_limit.max_attempts, config.rate_limit.window_secs
            );

            let check = |name: &str, value: Option<&str>| match value {
                Some(v) if !v.is_empty() => println!("{}: {}", name, mask_secret(v)),
                _ => println!("{}: not set", name),
            };

            check("LINE channel secret", config.channel_secret());
            check(
                "LINE access token",
                config
                    .line
                    .as_ref()
                    .and_then(|l| l.channel_access_token.as_deref()),
            );
            check("Gateway auth token", config.server.auth_token.as_deref());
            match &config.sms {
                Some(sms) => println!("SMS gateway: {}", sms.endpoint),
                None => println!("SMS gateway: not set (log only)"),
            }
        }
        Err(e) => {
            println!("Error loading config: {}", e);
        }
    }
}
