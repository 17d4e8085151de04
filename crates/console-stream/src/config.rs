use std::time::Duration;

use crate::errors::ConsoleError;
use crate::policy::ReconnectPolicy;
use crate::transcript::DEFAULT_LOG_RETENTION;

const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Which container group of a deployment to tail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodType {
    Vllm,
    Router,
}

impl PodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vllm => "vllm",
            Self::Router => "router",
        }
    }
}

impl std::str::FromStr for PodType {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vllm" => Ok(Self::Vllm),
            "router" => Ok(Self::Router),
            other => Err(ConsoleError::config(format!(
                "unknown pod type `{other}` (expected vllm or router)"
            ))),
        }
    }
}

/// Console backend endpoints and client defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsoleConfig {
    /// Base URL of the console HTTP API.
    pub api_url: String,
    /// Base URL for WebSocket subscriptions.
    pub ws_url: String,
    /// Timeout for status requests and connection attempts.
    pub request_timeout: Duration,
    /// Log entries kept by log transcripts.
    pub log_retention: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

impl ConsoleConfig {
    /// Creates a config for `api_url`; the WebSocket base is derived from it.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            request_timeout: Duration::from_secs(30),
            log_retention: DEFAULT_LOG_RETENTION,
            reconnect: ReconnectPolicy::Manual,
        }
    }

    /// Builds a config from `CONSOLE_*` environment variables.
    ///
    /// - `CONSOLE_API_URL` (default `http://localhost:8000`)
    /// - `CONSOLE_WS_URL` (default derived from the API URL)
    /// - `CONSOLE_REQUEST_TIMEOUT_SECS`
    /// - `CONSOLE_LOG_RETENTION`
    /// - `CONSOLE_RECONNECT`: `manual`, `fixed:<ms>` or `exp:<ms>`
    pub fn from_env() -> Result<Self, ConsoleError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConsoleError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::new(get("CONSOLE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into()));
        if let Some(ws_url) = get("CONSOLE_WS_URL") {
            config = config.ws_url(ws_url);
        }
        if let Some(raw) = get("CONSOLE_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                ConsoleError::config(format!("CONSOLE_REQUEST_TIMEOUT_SECS is not a number: {raw}"))
            })?;
            config = config.request_timeout(Duration::from_secs(secs.max(1)));
        }
        if let Some(raw) = get("CONSOLE_LOG_RETENTION") {
            let retention: usize = raw.trim().parse().map_err(|_| {
                ConsoleError::config(format!("CONSOLE_LOG_RETENTION is not a number: {raw}"))
            })?;
            config = config.log_retention(retention);
        }
        if let Some(raw) = get("CONSOLE_RECONNECT") {
            let policy = ReconnectPolicy::parse(&raw).ok_or_else(|| {
                ConsoleError::config(format!(
                    "CONSOLE_RECONNECT must be manual, fixed:<ms> or exp:<ms>, got {raw}"
                ))
            })?;
            config = config.reconnect(policy);
        }
        Ok(config)
    }

    /// Overrides the WebSocket base URL.
    pub fn ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides log retention (minimum 1).
    pub fn log_retention(mut self, retention: usize) -> Self {
        self.log_retention = retention.max(1);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// `ws://{host}/ws/logs/{deployment}[?pod_type=...]`
    pub fn logs_url(&self, deployment_id: &str, pod_type: Option<PodType>) -> String {
        let base = format!("{}/ws/logs/{deployment_id}", self.ws_url);
        match pod_type {
            Some(pod_type) => format!("{base}?pod_type={}", pod_type.as_str()),
            None => base,
        }
    }

    /// OpenAI-compatible streaming chat endpoint.
    pub fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.api_url)
    }

    /// Chat endpoint proxied through the backend to one deployment's router.
    pub fn deployment_chat_url(&self, deployment_id: &str) -> String {
        format!("{}/deployments/{deployment_id}/chat", self.api_url)
    }
}

fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if api_url.starts_with("ws://") || api_url.starts_with("wss://") {
        api_url.to_string()
    } else {
        format!("ws://{api_url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_point_at_local_backend() {
        let config = ConsoleConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.ws_url, "ws://localhost:8000");
        assert_eq!(config.log_retention, DEFAULT_LOG_RETENTION);
        assert_eq!(config.reconnect, ReconnectPolicy::Manual);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = ConsoleConfig::from_lookup(lookup(&[
            ("CONSOLE_API_URL", "https://console.example.com/"),
            ("CONSOLE_REQUEST_TIMEOUT_SECS", "5"),
            ("CONSOLE_LOG_RETENTION", "200"),
            ("CONSOLE_RECONNECT", "fixed:750"),
        ]))
        .expect("config");
        assert_eq!(config.api_url, "https://console.example.com");
        assert_eq!(config.ws_url, "wss://console.example.com");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.log_retention, 200);
        assert_eq!(
            config.reconnect,
            ReconnectPolicy::fixed(Duration::from_millis(750))
        );
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = ConsoleConfig::from_lookup(lookup(&[("CONSOLE_LOG_RETENTION", "lots")]))
            .expect_err("bad retention");
        assert!(matches!(err, ConsoleError::Config(_)));
        let err = ConsoleConfig::from_lookup(lookup(&[("CONSOLE_RECONNECT", "often")]))
            .expect_err("bad policy");
        assert!(err.to_string().contains("CONSOLE_RECONNECT"));
    }

    #[test]
    fn endpoint_urls() {
        let config = ConsoleConfig::new("http://10.0.0.5:8000").ws_url("ws://gateway:9000/");
        assert_eq!(
            config.logs_url("llama-8b", Some(PodType::Router)),
            "ws://gateway:9000/ws/logs/llama-8b?pod_type=router"
        );
        assert_eq!(config.logs_url("llama-8b", None), "ws://gateway:9000/ws/logs/llama-8b");
        assert_eq!(config.chat_url(), "http://10.0.0.5:8000/v1/chat/completions");
        assert_eq!(
            config.deployment_chat_url("llama-8b"),
            "http://10.0.0.5:8000/deployments/llama-8b/chat"
        );
    }

    #[test]
    fn pod_type_parses_case_insensitively() {
        assert_eq!("VLLM".parse::<PodType>().expect("pod type"), PodType::Vllm);
        assert!("gpu".parse::<PodType>().is_err());
    }
}
