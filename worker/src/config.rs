use std::{collections::HashMap, env, error::Error, fmt, str::FromStr, time::Duration};

const DEFAULT_SERVER_IP: &str = "0.0.0.0";
const DEFAULT_SERVER_PORT: u16 = 55555;
const DEFAULT_CLIENT_PORT: u16 = 65430;
const DEFAULT_EPOCHS: usize = 30;
const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_THRESHOLD: f32 = 0.1;
const DEFAULT_SPLIT: usize = 10;
const DEFAULT_LEARNING_RATE: f32 = 0.0005;
const DEFAULT_LR_DECAY: f32 = 0.98;
const DEFAULT_LAYERS_EXPONENT: u32 = 4;
const DEFAULT_DATASET: u32 = 2;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BACKOFF_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

const MAX_LAYERS_EXPONENT: u32 = 16;

/// A configuration value that could not be accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigErr {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { key, value, reason } = self;
        write!(f, "{key}={value:?}: {reason}")
    }
}

impl Error for ConfigErr {}

/// Retry and timeout policy of the worker's session.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed per failure episode, a success resets the count.
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
    /// How long the session may stay silent before it's considered lost.
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            heartbeat_timeout: None,
        }
    }
}

/// Immutable run configuration of a worker process.
///
/// Built once at startup and shared by reference, nothing re-reads the environment afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub worker_id: String,
    pub server_ip: String,
    pub server_port: u16,
    pub client_port: u16,
    pub epochs: usize,
    pub batch_size: usize,
    pub threshold: f32,
    pub split: usize,
    pub learning_rate: f32,
    pub lr_decay: f32,
    pub layers_exponent: u32,
    pub dataset: u32,
    pub retry: RetryConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            server_ip: DEFAULT_SERVER_IP.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            threshold: DEFAULT_THRESHOLD,
            split: DEFAULT_SPLIT,
            learning_rate: DEFAULT_LEARNING_RATE,
            lr_decay: DEFAULT_LR_DECAY,
            layers_exponent: DEFAULT_LAYERS_EXPONENT,
            dataset: DEFAULT_DATASET,
            retry: RetryConfig::default(),
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

/// Reads typed values out of a flat key/value source, falling back to defaults.
struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get<T>(&self, key: &'static str, default: T) -> Result<T, ConfigErr>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(value) = (self.lookup)(key) else {
            return Ok(default);
        };

        value.trim().parse().map_err(|e: T::Err| ConfigErr {
            key,
            reason: e.to_string(),
            value,
        })
    }

    fn string(&self, key: &'static str, default: String) -> String {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .unwrap_or(default)
    }
}

fn check<T: fmt::Display>(
    key: &'static str,
    value: T,
    ok: bool,
    reason: &str,
) -> Result<T, ConfigErr> {
    if ok {
        return Ok(value);
    }

    Err(ConfigErr {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn positive<T>(key: &'static str, value: T) -> Result<T, ConfigErr>
where
    T: fmt::Display + PartialOrd + Default,
{
    let ok = value > T::default();
    check(key, value, ok, "must be positive")
}

impl RunConfig {
    /// Resolves the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigErr> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves the configuration from any iterator of key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigErr>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self::from_lookup(|key| map.get(key).cloned())
    }

    /// Resolves the configuration from a flat key/value source.
    ///
    /// # Args
    /// * `lookup` - Returns the raw value of a key, if present.
    ///
    /// # Errors
    /// Returns `ConfigErr` if a present value doesn't parse or breaks a range invariant.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigErr>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Source { lookup };
        let defaults = Self::default();

        let server_ip = src.string("SERVER_IP", defaults.server_ip);
        let server_ip = check(
            "SERVER_IP",
            server_ip.clone(),
            !server_ip.is_empty(),
            "must not be empty",
        )?;

        let worker_id = src.string("WORKER_ID", defaults.worker_id);
        let worker_id = check(
            "WORKER_ID",
            worker_id.clone(),
            !worker_id.is_empty(),
            "must not be empty",
        )?;

        let threshold = src.get("T_THRESHOLD", defaults.threshold)?;
        let threshold = check(
            "T_THRESHOLD",
            threshold,
            threshold.is_finite() && threshold >= 0.0,
            "must be a finite value >= 0",
        )?;

        let learning_rate = positive(
            "T_LEARNING_RATE",
            src.get("T_LEARNING_RATE", defaults.learning_rate)?,
        )?;
        let learning_rate = check(
            "T_LEARNING_RATE",
            learning_rate,
            learning_rate.is_finite(),
            "must be finite",
        )?;

        let lr_decay = src.get("T_LR_DECAY", defaults.lr_decay)?;
        let lr_decay = check(
            "T_LR_DECAY",
            lr_decay,
            lr_decay > 0.0 && lr_decay <= 1.0,
            "must be in (0, 1]",
        )?;

        let layers_exponent = positive(
            "T_LAYERS_EXPONENT",
            src.get("T_LAYERS_EXPONENT", defaults.layers_exponent)?,
        )?;
        let layers_exponent = check(
            "T_LAYERS_EXPONENT",
            layers_exponent,
            layers_exponent <= MAX_LAYERS_EXPONENT,
            "must be at most 16",
        )?;

        let backoff = src.get("WORKER_BACKOFF_MS", DEFAULT_BACKOFF_MS)?;
        let backoff_max = src.get("WORKER_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)?;
        let backoff_max = check(
            "WORKER_BACKOFF_MAX_MS",
            backoff_max,
            backoff <= backoff_max,
            "must not be below WORKER_BACKOFF_MS",
        )?;

        let connect_timeout = positive(
            "CONNECT_TIMEOUT_MS",
            src.get("CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)?,
        )?;
        let heartbeat_timeout = src.get("HEARTBEAT_TIMEOUT_MS", 0u64)?;

        let retry = RetryConfig {
            max_retries: src.get("WORKER_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            backoff: Duration::from_millis(backoff),
            backoff_max: Duration::from_millis(backoff_max),
            connect_timeout: Duration::from_millis(connect_timeout),
            heartbeat_timeout: (heartbeat_timeout > 0)
                .then(|| Duration::from_millis(heartbeat_timeout)),
        };

        Ok(Self {
            worker_id,
            server_ip,
            server_port: positive("SERVER_PORT", src.get("SERVER_PORT", defaults.server_port)?)?,
            client_port: positive("CLIENT_PORT", src.get("CLIENT_PORT", defaults.client_port)?)?,
            epochs: positive("T_EPOCHS", src.get("T_EPOCHS", defaults.epochs)?)?,
            batch_size: positive("T_BATCH_SIZE", src.get("T_BATCH_SIZE", defaults.batch_size)?)?,
            threshold,
            split: positive("T_SPLIT", src.get("T_SPLIT", defaults.split)?)?,
            learning_rate,
            lr_decay,
            layers_exponent,
            dataset: positive("T_DATASET", src.get("T_DATASET", defaults.dataset)?)?,
            retry,
        })
    }

    /// The `host:port` of the coordination server.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }
}
