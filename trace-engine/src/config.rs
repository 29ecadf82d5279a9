use std::time::Duration;

/// Default completion length threshold, in characters of final-response text.
pub const DEFAULT_COMPLETION_LENGTH_THRESHOLD: usize = 500;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Durable tier location; `:memory:` keeps it in-process
    pub durable_path: String,
    /// Base websocket URL, e.g. `ws://localhost:3000`
    pub ws_base_url: String,
    pub session_id: Option<String>,
    pub model_id: Option<String>,
    pub polling: PollingConfig,
    pub connection: ConnectionConfig,
    /// How long a suppression key stays live if nothing consumes it
    pub suppression_timeout: Duration,
    pub completion_length_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub active_interval: Duration,
    pub complete_interval: Duration,
    /// Stop polling entirely once the conversation completes
    pub stop_when_complete: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_millis(500),
            complete_interval: Duration::from_millis(1000),
            stop_when_complete: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            connect_timeout: Duration::from_millis(5000),
            retry_delay: Duration::from_millis(1000),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durable_path: ":memory:".to_string(),
            ws_base_url: "ws://localhost:3000".to_string(),
            session_id: None,
            model_id: None,
            polling: PollingConfig::default(),
            connection: ConnectionConfig::default(),
            suppression_timeout: Duration::from_millis(500),
            completion_length_threshold: DEFAULT_COMPLETION_LENGTH_THRESHOLD,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Ok(Self {
            durable_path: env_str("TRACE_ENGINE_DURABLE_PATH", &defaults.durable_path),
            ws_base_url: env_str("TRACE_ENGINE_WS_BASE_URL", &defaults.ws_base_url),
            session_id: std::env::var("TRACE_ENGINE_SESSION_ID").ok(),
            model_id: std::env::var("TRACE_ENGINE_MODEL_ID").ok(),
            polling: PollingConfig {
                active_interval: Duration::from_millis(env_parse(
                    "TRACE_ENGINE_POLL_ACTIVE_MS",
                    500,
                )?),
                complete_interval: Duration::from_millis(env_parse(
                    "TRACE_ENGINE_POLL_COMPLETE_MS",
                    1000,
                )?),
                stop_when_complete: env_bool("TRACE_ENGINE_POLL_STOP_WHEN_COMPLETE", false),
            },
            connection: ConnectionConfig {
                max_attempts: env_parse("TRACE_ENGINE_CONNECT_ATTEMPTS", 3)?,
                connect_timeout: Duration::from_millis(env_parse(
                    "TRACE_ENGINE_CONNECT_TIMEOUT_MS",
                    5000,
                )?),
                retry_delay: Duration::from_millis(env_parse(
                    "TRACE_ENGINE_RETRY_DELAY_MS",
                    1000,
                )?),
            },
            suppression_timeout: Duration::from_millis(env_parse(
                "TRACE_ENGINE_SUPPRESSION_TIMEOUT_MS",
                500,
            )?),
            completion_length_threshold: env_parse(
                "TRACE_ENGINE_COMPLETION_LENGTH",
                DEFAULT_COMPLETION_LENGTH_THRESHOLD,
            )?,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(default)
}
