use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use webnode_core::config::{
    DEFAULT_API_BASE, DEFAULT_EXT_VERSION, DEFAULT_LANGUAGE, DEFAULT_MAX_REFRESH_FAILURES,
};
use webnode_core::telemetry::{self, LogConfig, LogLevel};
use webnode_core::{Identity, LogObserver, NodeConfig, RetryPolicy, Supervisor};

#[derive(Debug, Parser)]
#[command(
    name = "webnode",
    author,
    version,
    about = "Keeps a webnode logged in, registered and heartbeating"
)]
struct Cli {
    /// Account login.
    #[arg(long, env = "EMAIL")]
    email: String,

    /// Account password.
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    password: String,

    /// Base URL of the task service API.
    #[arg(long, env = "WEBNODE_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Base URL for the node socket; derived from --api-base when omitted.
    #[arg(long, env = "WEBNODE_WS_BASE")]
    ws_base: Option<String>,

    /// Seconds between heartbeats on the node socket.
    #[arg(long, env = "WEBNODE_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Timeout for the login request.
    #[arg(long, env = "WEBNODE_LOGIN_TIMEOUT_SECS", default_value_t = 10)]
    login_timeout_secs: u64,

    /// Timeout for token refresh and registration requests.
    #[arg(long, env = "WEBNODE_API_TIMEOUT_SECS", default_value_t = 5)]
    api_timeout_secs: u64,

    /// Timeout for the WebSocket handshake.
    #[arg(long, env = "WEBNODE_CONNECT_TIMEOUT_SECS", default_value_t = 15)]
    connect_timeout_secs: u64,

    /// Give up after this many consecutive failed reconnects (unbounded when omitted).
    #[arg(long, env = "WEBNODE_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Give up after this many consecutive failed token refreshes.
    #[arg(
        long,
        env = "WEBNODE_MAX_REFRESH_FAILURES",
        default_value_t = DEFAULT_MAX_REFRESH_FAILURES
    )]
    max_refresh_failures: u32,

    /// First reconnect delay; doubles per failed attempt.
    #[arg(long, env = "WEBNODE_BACKOFF_BASE_MS", default_value_t = 1_000)]
    backoff_base_ms: u64,

    /// Upper bound for the reconnect delay.
    #[arg(long, env = "WEBNODE_BACKOFF_MAX_MS", default_value_t = 60_000)]
    backoff_max_ms: u64,

    /// Retry instead of proceeding when registration fails.
    #[arg(long, env = "WEBNODE_REQUIRE_REGISTRATION", default_value_t = false)]
    require_registration: bool,

    /// Log in again when the service rejects the refresh token mid-run.
    #[arg(long, env = "WEBNODE_RELOGIN_ON_REJECTED_REFRESH", default_value_t = false)]
    relogin_on_rejected_refresh: bool,

    /// Extension version reported at registration.
    #[arg(long, env = "WEBNODE_EXT_VERSION", default_value = DEFAULT_EXT_VERSION)]
    ext_version: String,

    /// Language reported at registration.
    #[arg(long, env = "WEBNODE_LANGUAGE", default_value = DEFAULT_LANGUAGE)]
    language: String,

    #[arg(long, env = "WEBNODE_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "WEBNODE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }

    fn into_parts(self) -> Result<(NodeConfig, Identity)> {
        let mut config = NodeConfig::new(&self.api_base)
            .with_context(|| format!("invalid api base: {}", self.api_base))?;
        if let Some(ws_base) = self.ws_base.as_deref() {
            config = config
                .with_ws_base(ws_base)
                .with_context(|| format!("invalid socket base: {ws_base}"))?;
        }
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_secs);
        config.login_timeout = Duration::from_secs(self.login_timeout_secs);
        config.api_timeout = Duration::from_secs(self.api_timeout_secs);
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.retry = RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: true,
        };
        config.max_refresh_failures = self.max_refresh_failures;
        config.require_registration = self.require_registration;
        config.relogin_on_rejected_refresh = self.relogin_on_rejected_refresh;
        config.ext_version = self.ext_version;
        config.language = self.language;
        config.validate().context("invalid configuration")?;

        Ok((config, Identity::generate(self.email, self.password)))
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Err(err) = telemetry::init(&cli.log_config()) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(cli).await {
        error!(error = ?err, "webnode exited with an error");
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, identity) = cli.into_parts()?;
    info!(
        api = %config.api_base,
        socket = %config.ws_base,
        device_id = %identity.device_id(),
        "starting webnode"
    );

    let supervisor = Supervisor::new(config, identity, Arc::new(LogObserver))
        .context("failed to build node supervisor")?;
    let handle = supervisor.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            handle.shutdown();
        }
    });

    supervisor.run().await.context("node session terminated")
}
