use std::time::Duration;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the REST API listens on
    pub port: u16,
    /// Customer account the cluster belongs to
    pub account_id: String,
    /// Name of this cluster as known to the control plane
    pub cluster_name: String,
    /// Notification server host, with optional ws:// or wss:// prefix.
    /// Empty disables the control-plane connection.
    pub gateway_websocket_url: String,
    /// Open a second connection that carries safe-mode reports.
    pub safe_mode_websocket_enabled: bool,
    /// Base URL of the status event receiver. Empty disables reporting.
    pub event_receiver_url: String,
    /// Namespace holding config maps and administrative commands
    pub namespace: String,
    /// Number of workers draining the dispatch queue
    pub worker_concurrency: usize,
    /// Capacity of the bounded dispatch queue
    pub dispatch_queue_capacity: usize,
    /// Period of the safe-mode sweep
    pub safe_mode_sweep_interval: Duration,
    /// How long a started pod may wait for its agent before the sweep decides
    pub safe_mode_grace_period: Duration,
    pub rules_update: RulesUpdateConfig,
}

#[derive(Debug, Clone)]
pub struct RulesUpdateConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub namespace: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let namespace = env_str("NAMESPACE", "kubescape");
        let worker_concurrency: usize = env_parse("WORKER_CONCURRENCY", 3)?;
        let dispatch_queue_capacity: usize = env_parse("DISPATCH_QUEUE_CAPACITY", 64)?;
        if worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if dispatch_queue_capacity == 0 {
            anyhow::bail!("DISPATCH_QUEUE_CAPACITY must be at least 1");
        }

        Ok(Self {
            port: env_parse("OPERATOR_PORT", 4002)?,
            account_id: env_str("ACCOUNT_ID", ""),
            cluster_name: env_str("CLUSTER_NAME", ""),
            gateway_websocket_url: env_str("GATEWAY_WEBSOCKET_URL", ""),
            safe_mode_websocket_enabled: env_bool("SAFE_MODE_WEBSOCKET_ENABLED", false)?,
            event_receiver_url: env_str("EVENT_RECEIVER_URL", ""),
            worker_concurrency,
            dispatch_queue_capacity,
            safe_mode_sweep_interval: env_secs("SAFE_MODE_SWEEP_INTERVAL_SECS", 120)?,
            safe_mode_grace_period: env_secs("SAFE_MODE_GRACE_PERIOD_SECS", 300)?,
            rules_update: RulesUpdateConfig {
                enabled: env_bool("RULES_UPDATE_ENABLED", false)?,
                interval: env_secs("RULES_UPDATE_INTERVAL_SECS", 300)?,
                namespace: env_str("RULES_UPDATE_NAMESPACE", &namespace),
            },
            namespace,
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

/// Whole seconds, at least one.
fn env_secs(key: &str, default: u64) -> anyhow::Result<Duration> {
    let secs: u64 = env_parse(key, default)?;
    if secs == 0 {
        anyhow::bail!("{key} must be at least 1");
    }
    Ok(Duration::from_secs(secs))
}

fn env_bool(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Ok(val) => parse_bool(&val)
            .ok_or_else(|| anyhow::anyhow!("Failed to parse env var {key}={val}: expected a boolean")),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
