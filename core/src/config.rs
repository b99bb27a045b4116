//! Session configuration
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/chat/api";

/// How outgoing messages reach the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendRoute {
    /// `POST /messages/`; the response confirms the send
    Rest,
    /// `{content, receiver}` over the push channel; the echo confirms the send
    Push,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Username the session acts as
    pub identity: String,

    /// Base URL of the history/summary service
    pub api_base_url: String,

    /// Base URL of the push channel; the session connects to `{ws_base_url}/ws/{identity}`
    pub ws_base_url: String,

    /// Keepalive interval while the push channel is open
    pub keepalive_interval: Duration,

    /// Drop the link after this many keepalive intervals without inbound traffic.
    /// `None` relies on transport-level close detection only.
    pub max_missed_keepalives: Option<u32>,

    /// First reconnect delay
    pub reconnect_base: Duration,

    /// Upper bound for the reconnect delay
    pub reconnect_max: Duration,

    /// Timeout for dialing the push channel
    pub connect_timeout: Duration,

    /// Timeout for each pull request
    pub request_timeout: Duration,

    /// Max clock distance between an optimistic entry and its confirmation
    pub reconcile_window: Duration,

    /// Route used by `send_message`
    pub send_route: SendRoute,

    /// Capacity of the change-notification channel
    pub change_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: String::new(),
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_base_url: DEFAULT_WS_URL.to_string(),
            keepalive_interval: Duration::from_secs(30),
            max_missed_keepalives: None,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconcile_window: Duration::from_secs(30),
            send_route: SendRoute::Rest,
            change_buffer: 256,
        }
    }
}

impl Config {
    /// Config for `identity` with every other field defaulted
    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <username> [--api-url <url>] [--ws-url <url>] [--send-via-push] [--keepalive-secs <n>] [--max-missed-keepalives <n>]",
                args.first().map(String::as_str).unwrap_or("chatline")
            )));
        }

        let mut config = Config::for_identity(args[1].clone());

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    config.api_base_url = flag_value(args, i, "--api-url")?.to_string();
                    i += 2;
                }
                "--ws-url" => {
                    config.ws_base_url = flag_value(args, i, "--ws-url")?.to_string();
                    i += 2;
                }
                "--send-via-push" => {
                    config.send_route = SendRoute::Push;
                    i += 1;
                }
                "--keepalive-secs" => {
                    let secs = flag_value(args, i, "--keepalive-secs")?
                        .parse::<u64>()
                        .map_err(|_| {
                            ChatError::Config("--keepalive-secs must be a number".to_string())
                        })?;
                    config.keepalive_interval = Duration::from_secs(secs);
                    i += 2;
                }
                "--max-missed-keepalives" => {
                    let n = flag_value(args, i, "--max-missed-keepalives")?
                        .parse::<u32>()
                        .map_err(|_| {
                            ChatError::Config("--max-missed-keepalives must be a number".to_string())
                        })?;
                    config.max_missed_keepalives = Some(n);
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATLINE_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = std::env::var("CHATLINE_WS_URL") {
            config.ws_base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(ChatError::Config("username must not be empty".to_string()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ChatError::Config("keepalive interval must be positive".to_string()));
        }
        if self.reconnect_base.is_zero() || self.reconnect_max < self.reconnect_base {
            return Err(ChatError::Config(
                "reconnect backoff must satisfy 0 < base <= max".to_string(),
            ));
        }
        if self.max_missed_keepalives == Some(0) {
            return Err(ChatError::Config(
                "max missed keepalives must be at least 1".to_string(),
            ));
        }
        if self.change_buffer == 0 {
            return Err(ChatError::Config("change buffer must be positive".to_string()));
        }
        self.api_base_url
            .parse::<http::Uri>()
            .map_err(|e| ChatError::Config(format!("Invalid api url: {}", e)))?;
        self.ws_base_url
            .parse::<http::Uri>()
            .map_err(|e| ChatError::Config(format!("Invalid ws url: {}", e)))?;
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}
