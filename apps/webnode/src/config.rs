use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use url::Url;
use webnode_proto::JobReport;

pub const DEFAULT_API_BASE: &str = "https://task.titannet.io";
pub const DEFAULT_EXT_VERSION: &str = "0.0.4";
pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_MAX_REFRESH_FAILURES: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported scheme '{0}' (expected http, https, ws or wss)")]
    UnsupportedScheme(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
    #[error("backoff base delay {base:?} exceeds max delay {max:?}")]
    BackoffRange { base: Duration, max: Duration },
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to a fifth of the computed delay, capped at `max_delay`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may start after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }

    /// Delay before the `attempt`-th reconnect (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        let capped = scaled.min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let spread = capped.as_millis() as u64 / 5;
        let extra = rand::thread_rng().gen_range(0..=spread);
        (capped + Duration::from_millis(extra)).min(self.max_delay)
    }
}

/// Resolved runtime settings for one node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub api_base: Url,
    pub ws_base: Url,
    pub login_timeout: Duration,
    pub api_timeout: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub job_report: JobReport,
    pub retry: RetryPolicy,
    /// Consecutive failed refreshes after a disconnect before the run is fatal.
    /// Counted separately from the reconnect budget, which may be unbounded.
    pub max_refresh_failures: u32,
    /// Treat a failed registration as a failed attempt instead of proceeding.
    pub require_registration: bool,
    /// Log in again when the service rejects the refresh token mid-run.
    pub relogin_on_rejected_refresh: bool,
    pub ext_version: String,
    pub language: String,
}

impl NodeConfig {
    /// Builds defaults around `api_base`; the socket base is derived from it.
    pub fn new(api_base: &str) -> Result<Self, ConfigError> {
        let api_base = parse_base(api_base)?;
        let ws_base = websocket_base(&api_base)?;
        Ok(Self {
            api_base,
            ws_base,
            login_timeout: Duration::from_secs(10),
            api_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            job_report: JobReport::default(),
            retry: RetryPolicy::default(),
            max_refresh_failures: DEFAULT_MAX_REFRESH_FAILURES,
            require_registration: false,
            relogin_on_rejected_refresh: false,
            ext_version: DEFAULT_EXT_VERSION.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        })
    }

    pub fn with_ws_base(mut self, ws_base: &str) -> Result<Self, ConfigError> {
        self.ws_base = websocket_base(&parse_base(ws_base)?)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("login timeout", self.login_timeout),
            ("api timeout", self.api_timeout),
            ("connect timeout", self.connect_timeout),
            ("write timeout", self.write_timeout),
            ("heartbeat interval", self.heartbeat_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ZeroDuration(name));
        }
        if self.max_refresh_failures == 0 {
            return Err(ConfigError::ZeroLimit("max refresh failures"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::BackoffRange {
                base: self.retry.base_delay,
                max: self.retry.max_delay,
            });
        }
        Ok(())
    }
}

fn parse_base(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    // Relative joins replace the last segment unless the path ends with '/'.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn websocket_base(base: &Url) -> Result<Url, ConfigError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(base.scheme().to_string()))?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_socket_base_from_api_base() {
        let config = NodeConfig::new("https://task.example.com").expect("config");
        assert_eq!(config.api_base.as_str(), "https://task.example.com/");
        assert_eq!(config.ws_base.as_str(), "wss://task.example.com/");

        let local = NodeConfig::new("http://127.0.0.1:8080/prefix").expect("config");
        assert_eq!(local.ws_base.as_str(), "ws://127.0.0.1:8080/prefix/");
        assert_eq!(
            local.api_base.join("api/auth/login").expect("join").as_str(),
            "http://127.0.0.1:8080/prefix/api/auth/login"
        );
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            NodeConfig::new("ftp://task.example.com"),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            NodeConfig::new("not a url"),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn explicit_socket_base_overrides_derived_one() {
        let config = NodeConfig::new("https://task.example.com")
            .and_then(|config| config.with_ws_base("ws://10.0.0.2:9000"))
            .expect("config");
        assert_eq!(config.ws_base.as_str(), "ws://10.0.0.2:9000/");
    }

    #[test]
    fn validation_catches_zero_heartbeat() {
        let mut config = NodeConfig::new(DEFAULT_API_BASE).expect("config");
        config.validate().expect("defaults are valid");
        config.heartbeat_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("heartbeat interval"))
        ));
    }

    #[test]
    fn refresh_failure_limit_is_finite_and_nonzero() {
        let mut config = NodeConfig::new(DEFAULT_API_BASE).expect("config");
        assert_eq!(config.max_refresh_failures, DEFAULT_MAX_REFRESH_FAILURES);
        assert!(config.retry.max_attempts.is_none());
        config.max_refresh_failures = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit("max refresh failures"))
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));

        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(RetryPolicy::default().allows(u32::MAX));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..64 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(240));
        }
    }
}
