/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 17100;
const USER_PLACEHOLDER: &str = "{userId}";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Id of the signed-in participant
    pub user_id: String,

    /// Bearer token for the push channel and the store (issued by the host app)
    pub auth_token: Option<String>,

    /// Push channel WebSocket endpoint
    pub push_url: String,

    /// Message store base URL (plain http)
    pub store_url: String,

    /// Private inbound topic; `{userId}` is replaced with `user_id`
    pub subscribe_destination: String,

    /// Outbound send destination
    pub publish_destination: String,

    /// First reconnect delay
    pub reconnect_base_delay: Duration,

    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,

    /// Fraction of each delay that may be shaved off at random (0.0 - 1.0)
    pub reconnect_jitter: f64,

    /// Heart-beat interval negotiated on the push channel
    pub heartbeat_interval: Duration,

    /// Upper bound for every store request
    pub http_timeout: Duration,

    /// How far apart an echo and its confirmation may be and still merge
    pub echo_match_window: Duration,

    /// Interval between retries of unconfirmed read marks
    pub read_flush_interval: Duration,

    /// Failed attempts after which a read mark is left local-only
    pub read_retry_limit: u32,

    /// Depth of the engine command queue
    pub command_queue_depth: usize,

    /// Capacity of the engine event broadcast
    pub event_buffer: usize,

    /// Local messenger API address (loopback)
    pub api_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            auth_token: None,
            push_url: "ws://127.0.0.1:8080/ws".to_string(),
            store_url: "http://127.0.0.1:8080".to_string(),
            subscribe_destination: format!("/user/{}/queue/messages", USER_PLACEHOLDER),
            publish_destination: "/app/chat".to_string(),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_jitter: 0.2,
            heartbeat_interval: Duration::from_secs(10),
            http_timeout: Duration::from_secs(10),
            echo_match_window: Duration::from_secs(30),
            read_flush_interval: Duration::from_secs(15),
            read_retry_limit: 5,
            command_queue_depth: 256,
            event_buffer: 256,
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <user_id> [--token <token>] [--push-url <ws-url>] [--store-url <http-url>] [--api-port <port>] [--subscribe <destination>] [--publish <destination>]",
                args.first().map(String::as_str).unwrap_or("convsync")
            )));
        }

        let mut config = Config {
            user_id: args[1].clone(),
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args
                .get(i + 1)
                .ok_or_else(|| SyncError::Config(format!("{} requires an argument", flag)))?;
            match flag {
                "--token" => config.auth_token = Some(value.clone()),
                "--push-url" => config.push_url = value.clone(),
                "--store-url" => config.store_url = value.clone(),
                "--api-port" => config.api_addr.set_port(parse_port(flag, value)?),
                "--subscribe" => config.subscribe_destination = value.clone(),
                "--publish" => config.publish_destination = value.clone(),
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (tokens should not live in shell history)
        if let Ok(token) = std::env::var("CONVSYNC_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Ok(url) = std::env::var("CONVSYNC_PUSH_URL") {
            config.push_url = url;
        }
        if let Ok(url) = std::env::var("CONVSYNC_STORE_URL") {
            config.store_url = url;
        }
        if let Some(p) = std::env::var("CONVSYNC_API_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            config.api_addr.set_port(p);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(SyncError::Config("user_id must not be empty".to_string()));
        }
        if !self.push_url.starts_with("ws://") {
            return Err(SyncError::Config(format!(
                "push_url must be a ws:// URL, got {}",
                self.push_url
            )));
        }
        if !self.store_url.starts_with("http://") {
            return Err(SyncError::Config(format!(
                "store_url must be an http:// URL, got {}",
                self.store_url
            )));
        }
        if self.reconnect_base_delay.is_zero() || self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(SyncError::Config(
                "reconnect_base_delay must be non-zero and not exceed reconnect_max_delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(SyncError::Config("reconnect_jitter must be within 0.0..=1.0".to_string()));
        }
        if self.read_flush_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(SyncError::Config("read_flush_interval and heartbeat_interval must be non-zero".to_string()));
        }
        if self.command_queue_depth == 0 || self.event_buffer == 0 {
            return Err(SyncError::Config("queue sizes must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Subscribe destination with the local user id filled in
    pub fn inbound_destination(&self) -> String {
        self.subscribe_destination.replace(USER_PLACEHOLDER, &self.user_id)
    }

    /// Store base URL without a trailing slash
    pub fn store_base(&self) -> &str {
        self.store_url.trim_end_matches('/')
    }
}

fn parse_port(flag: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| SyncError::Config(format!("{} must be a valid number (0-65535)", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_user_is_usage_error() {
        let err = Config::from_args(&args(&["convsync"])).unwrap_err();
        assert!(err.to_string().contains("Usage"));
    }

    #[test]
    fn test_flags_are_applied() {
        let config = Config::from_args(&args(&[
            "convsync",
            "alice",
            "--push-url",
            "ws://chat.example.com/ws",
            "--store-url",
            "http://chat.example.com/",
            "--api-port",
            "18000",
            "--publish",
            "/app/send",
        ]))
        .unwrap();

        assert_eq!(config.user_id, "alice");
        assert_eq!(config.push_url, "ws://chat.example.com/ws");
        assert_eq!(config.store_base(), "http://chat.example.com");
        assert_eq!(config.api_addr.port(), 18000);
        assert_eq!(config.publish_destination, "/app/send");
    }

    #[test]
    fn test_flag_without_value() {
        let err = Config::from_args(&args(&["convsync", "alice", "--token"])).unwrap_err();
        assert!(err.to_string().contains("--token requires an argument"));
    }

    #[test]
    fn test_inbound_destination_uses_user() {
        let config = Config {
            user_id: "42".to_string(),
            ..Default::default()
        };
        assert_eq!(config.inbound_destination(), "/user/42/queue/messages");
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = Config {
            user_id: "a".to_string(),
            reconnect_base_delay: Duration::from_secs(60),
            reconnect_max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_https_store() {
        let config = Config {
            user_id: "a".to_string(),
            store_url: "https://store.example.com".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
