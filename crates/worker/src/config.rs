use std::time::Duration;

use kiln_core::vram::BudgetConfig;

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Orchestrator configuration loaded from environment variables.
///
/// Every field has a default suitable for a single workstation with the
/// local services on their usual ports.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub comfyui_url: String,
    pub ollama_url: String,
    pub diffusion_url: String,
    /// Default model for local chat requests that name none.
    pub ollama_chat_model: String,
    /// Cloud fallback; disabled when unset.
    pub cloud_api_url: Option<String>,
    pub cloud_api_key: Option<String>,
    pub cloud_provider_name: String,
    pub local_only: bool,
    pub total_vram_gb: f64,
    /// Reserved headroom; 8% of the total when unset.
    pub safety_margin_gb: Option<f64>,
    pub state_refresh_interval: Duration,
    pub job_poll_interval: Duration,
    pub job_timeout: Duration,
    pub job_retention: Duration,
    pub job_cleanup_interval: Duration,
    pub notify_webhook_url: Option<String>,
    pub log_format: LogFormat,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            comfyui_url: "http://127.0.0.1:8188".into(),
            ollama_url: "http://127.0.0.1:11434".into(),
            diffusion_url: "http://127.0.0.1:7860".into(),
            ollama_chat_model: "llama3.1:8b".into(),
            cloud_api_url: None,
            cloud_api_key: None,
            cloud_provider_name: "cloud".into(),
            local_only: false,
            total_vram_gb: 24.0,
            safety_margin_gb: None,
            state_refresh_interval: Duration::from_secs(30),
            job_poll_interval: Duration::from_millis(2000),
            job_timeout: Duration::from_secs(600),
            job_retention: Duration::from_secs(3600),
            job_cleanup_interval: Duration::from_secs(300),
            notify_webhook_url: None,
            log_format: LogFormat::Pretty,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                       | Default                    |
    /// |-------------------------------|----------------------------|
    /// | `COMFYUI_URL`                 | `http://127.0.0.1:8188`    |
    /// | `OLLAMA_URL`                  | `http://127.0.0.1:11434`   |
    /// | `DIFFUSION_URL`               | `http://127.0.0.1:7860`    |
    /// | `OLLAMA_CHAT_MODEL`           | `llama3.1:8b`              |
    /// | `CLOUD_API_URL`               | unset (no cloud fallback)  |
    /// | `CLOUD_API_KEY`               | unset                      |
    /// | `CLOUD_PROVIDER_NAME`         | `cloud`                    |
    /// | `LOCAL_ONLY`                  | `false`                    |
    /// | `GPU_TOTAL_VRAM_GB`           | `24`                       |
    /// | `GPU_SAFETY_MARGIN_GB`        | 8% of the total            |
    /// | `STATE_REFRESH_INTERVAL_SECS` | `30`                       |
    /// | `JOB_POLL_INTERVAL_MS`        | `2000`                     |
    /// | `JOB_TIMEOUT_SECS`            | `600`                      |
    /// | `JOB_RETENTION_SECS`          | `3600`                     |
    /// | `JOB_CLEANUP_INTERVAL_SECS`   | `300`                      |
    /// | `NOTIFY_WEBHOOK_URL`          | unset                      |
    /// | `LOG_FORMAT`                  | `pretty` (or `json`)       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            comfyui_url: get("COMFYUI_URL").unwrap_or(defaults.comfyui_url),
            ollama_url: get("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            diffusion_url: get("DIFFUSION_URL").unwrap_or(defaults.diffusion_url),
            ollama_chat_model: get("OLLAMA_CHAT_MODEL").unwrap_or(defaults.ollama_chat_model),
            cloud_api_url: get("CLOUD_API_URL"),
            cloud_api_key: get("CLOUD_API_KEY"),
            cloud_provider_name: get("CLOUD_PROVIDER_NAME")
                .unwrap_or(defaults.cloud_provider_name),
            local_only: match get("LOCAL_ONLY") {
                Some(v) => parse_bool("LOCAL_ONLY", &v)?,
                None => defaults.local_only,
            },
            total_vram_gb: match get("GPU_TOTAL_VRAM_GB") {
                Some(v) => parse_gb("GPU_TOTAL_VRAM_GB", &v)?,
                None => defaults.total_vram_gb,
            },
            safety_margin_gb: get("GPU_SAFETY_MARGIN_GB")
                .map(|v| parse_gb("GPU_SAFETY_MARGIN_GB", &v))
                .transpose()?,
            state_refresh_interval: secs(&get, "STATE_REFRESH_INTERVAL_SECS", defaults.state_refresh_interval)?,
            job_poll_interval: match get("JOB_POLL_INTERVAL_MS") {
                Some(v) => Duration::from_millis(parse_positive("JOB_POLL_INTERVAL_MS", &v)?),
                None => defaults.job_poll_interval,
            },
            job_timeout: secs(&get, "JOB_TIMEOUT_SECS", defaults.job_timeout)?,
            job_retention: secs(&get, "JOB_RETENTION_SECS", defaults.job_retention)?,
            job_cleanup_interval: secs(&get, "JOB_CLEANUP_INTERVAL_SECS", defaults.job_cleanup_interval)?,
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),
            log_format: match get("LOG_FORMAT").as_deref() {
                None | Some("pretty") | Some("text") => LogFormat::Pretty,
                Some("json") => LogFormat::Json,
                Some(other) => {
                    return Err(invalid("LOG_FORMAT", other, "expected `pretty` or `json`"))
                }
            },
        };

        let margin = config.budget().safety_margin_gb;
        if margin >= config.total_vram_gb {
            return Err(invalid(
                "GPU_SAFETY_MARGIN_GB",
                &margin.to_string(),
                "must be smaller than GPU_TOTAL_VRAM_GB",
            ));
        }
        Ok(config)
    }

    /// VRAM budget with the built-in tables and the configured capacity.
    pub fn budget(&self) -> BudgetConfig {
        let budget = BudgetConfig::new(self.total_vram_gb);
        match self.safety_margin_gb {
            Some(margin) => budget.with_safety_margin(margin),
            None => budget,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}

fn parse_gb(var: &'static str, value: &str) -> Result<f64, ConfigError> {
    match value.parse::<f64>() {
        Ok(gb) if gb.is_finite() && gb >= 0.0 => Ok(gb),
        _ => Err(invalid(var, value, "expected a non-negative number of GB")),
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(var, value, "expected a positive integer")),
    }
}

fn secs<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(v) => Ok(Duration::from_secs(parse_positive(var, &v)?)),
        None => Ok(default),
    }
}
