//! Service configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with no configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Strategy name: `rule-based`, `openai` or `ollama`.
    /// Env: `AI_PROVIDER`
    pub provider: String,
    /// Env: `AI_MODEL`
    pub model: String,
    /// Env: `AI_BASE_URL`. Unset means the provider's default.
    pub base_url: Option<String>,
    /// Env: `AI_API_KEY`
    pub api_key: Option<String>,
    /// Env: `AI_TEMPERATURE`
    pub temperature: f32,
    /// Env: `AI_MAX_TOKENS`
    pub max_tokens: u32,
    /// System prompt sent to provider adapters.
    /// Env: `AI_PERSONA`
    pub persona: String,
    /// Messages kept in a room's conversation context.
    /// Env: `AI_CONTEXT_WINDOW`
    pub context_window: usize,
    /// Env: `AI_CONTEXT_TTL_SECS`
    pub context_ttl: Duration,
    /// Env: `AI_TIMEOUT_SECS`
    pub timeout: Duration,
    /// Env: `AI_RATE_MAX_REQUESTS`
    pub max_requests: u32,
    /// Env: `AI_RATE_WINDOW_SECS`
    pub time_window: Duration,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "rule-based".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.7,
            max_tokens: 500,
            persona: "You are a helpful project management assistant. Keep answers short and practical."
                .to_string(),
            context_window: 10,
            context_ttl: Duration::from_secs(60 * 60),
            timeout: Duration::from_secs(30),
            max_requests: 50,
            time_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Env: `BIND_ADDR`
    pub bind_addr: SocketAddr,
    /// Env: `TLS_CERT_PATH`
    pub tls_cert_path: Option<PathBuf>,
    /// Env: `TLS_KEY_PATH`
    pub tls_key_path: Option<PathBuf>,
    pub ai: AiConfig,
    /// Env: `SWEEP_INTERVAL_SECS`
    pub sweep_interval: Duration,
    /// Look-ahead of the deadline warning sweep.
    /// Env: `SWEEP_WINDOW_MINUTES`
    pub sweep_window: chrono::Duration,
    /// Env: `DUE_CHECK_INTERVAL_SECS`
    pub due_check_interval: Duration,
    /// Delay before a failed change stream is reopened.
    /// Env: `WATCH_RETRY_SECS`
    pub watch_retry_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 2052).into(),
            tls_cert_path: None,
            tls_key_path: None,
            ai: AiConfig::default(),
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_window: chrono::Duration::minutes(60),
            due_check_interval: Duration::from_secs(60 * 60),
            watch_retry_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, falling back to defaults on
    /// missing or malformed values.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        parse_into(&lookup, "BIND_ADDR", &mut config.bind_addr);
        config.tls_cert_path = lookup("TLS_CERT_PATH").filter(|v| !v.is_empty()).map(PathBuf::from);
        config.tls_key_path = lookup("TLS_KEY_PATH").filter(|v| !v.is_empty()).map(PathBuf::from);

        let ai = &mut config.ai;
        if let Some(provider) = lookup("AI_PROVIDER") {
            ai.provider = provider.trim().to_lowercase();
        }
        if let Some(model) = lookup("AI_MODEL") {
            ai.model = model;
        }
        ai.base_url = lookup("AI_BASE_URL").filter(|v| !v.is_empty());
        ai.api_key = lookup("AI_API_KEY").filter(|v| !v.is_empty());
        parse_into(&lookup, "AI_TEMPERATURE", &mut ai.temperature);
        parse_into(&lookup, "AI_MAX_TOKENS", &mut ai.max_tokens);
        if let Some(persona) = lookup("AI_PERSONA") {
            ai.persona = persona;
        }
        parse_into(&lookup, "AI_CONTEXT_WINDOW", &mut ai.context_window);
        if ai.context_window == 0 {
            warn!("AI_CONTEXT_WINDOW must be positive, using 10");
            ai.context_window = 10;
        }
        parse_secs(&lookup, "AI_CONTEXT_TTL_SECS", &mut ai.context_ttl);
        parse_secs(&lookup, "AI_TIMEOUT_SECS", &mut ai.timeout);
        parse_into(&lookup, "AI_RATE_MAX_REQUESTS", &mut ai.max_requests);
        parse_secs(&lookup, "AI_RATE_WINDOW_SECS", &mut ai.time_window);

        parse_secs(&lookup, "SWEEP_INTERVAL_SECS", &mut config.sweep_interval);
        let mut window_minutes = config.sweep_window.num_minutes();
        parse_into(&lookup, "SWEEP_WINDOW_MINUTES", &mut window_minutes);
        config.sweep_window = chrono::Duration::minutes(window_minutes);
        parse_secs(&lookup, "DUE_CHECK_INTERVAL_SECS", &mut config.due_check_interval);
        parse_secs(&lookup, "WATCH_RETRY_SECS", &mut config.watch_retry_delay);

        config
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!("Invalid {}={:?}, using default", key, raw),
    }
}

fn parse_secs<F>(lookup: &F, key: &str, slot: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = slot.as_secs();
    parse_into(lookup, key, &mut secs);
    *slot = Duration::from_secs(secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr, ([0, 0, 0, 0], 2052).into());
        assert_eq!(config.ai.context_window, 10);
        assert_eq!(config.ai.context_ttl, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.sweep_window, chrono::Duration::minutes(60));
        assert_eq!(config.watch_retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn overrides_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("AI_PROVIDER", " OpenAI "),
            ("AI_CONTEXT_WINDOW", "4"),
            ("SWEEP_WINDOW_MINUTES", "120"),
            ("WATCH_RETRY_SECS", "1"),
        ]));
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.ai.provider, "openai");
        assert_eq!(config.ai.context_window, 4);
        assert_eq!(config.sweep_window, chrono::Duration::minutes(120));
        assert_eq!(config.watch_retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("BIND_ADDR", "not-an-addr"),
            ("AI_MAX_TOKENS", "lots"),
            ("AI_CONTEXT_WINDOW", "0"),
        ]));
        assert_eq!(config.bind_addr, ([0, 0, 0, 0], 2052).into());
        assert_eq!(config.ai.max_tokens, 500);
        assert_eq!(config.ai.context_window, 10);
    }
}
