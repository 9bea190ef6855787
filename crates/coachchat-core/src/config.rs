//! Client configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, types::UserId};

/// Default number of messages loaded when a channel is selected.
pub const DEFAULT_HISTORY_LIMIT: usize = 25;

/// Default HTTP request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default identity of the AI responder.
pub const DEFAULT_AI_BOT_ID: &str = "ai-bot";

/// Injected configuration for the chat client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the auth and inference API, e.g. `http://localhost:8000/api`.
    pub api_base_url: String,

    /// Public key of the hosted messaging service.
    pub messaging_api_key: String,

    /// User id the AI responder posts as.
    pub ai_bot_id: UserId,

    /// Messages loaded per channel selection.
    pub history_limit: usize,

    /// Timeout applied to every HTTP request.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Where the session credentials are persisted.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the endpoints.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>, messaging_api_key: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_owned(),
            messaging_api_key: messaging_api_key.into(),
            ai_bot_id: UserId::new(DEFAULT_AI_BOT_ID),
            history_limit: DEFAULT_HISTORY_LIMIT,
            request_timeout: DEFAULT_TIMEOUT,
            credentials_path: None,
        }
    }

    /// Set the AI responder identity.
    #[must_use]
    pub fn with_ai_bot_id(mut self, id: impl Into<UserId>) -> Self {
        self.ai_bot_id = id.into();
        self
    }

    /// Set the per-selection history size.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Set the HTTP timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the credentials file.
    #[must_use]
    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    /// Credentials file, defaulting to `<config dir>/coachchat/session.json`.
    #[must_use]
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("coachchat")
                .join("session.json")
        })
    }

    /// Whether `user_id` is the AI responder.
    ///
    /// Ids sharing the `ai-bot` prefix are also treated as bots.
    #[must_use]
    pub fn is_bot(&self, user_id: &UserId) -> bool {
        user_id == &self.ai_bot_id || user_id.as_str().starts_with(DEFAULT_AI_BOT_ID)
    }

    /// Load from process environment.
    ///
    /// # Errors
    /// Returns error if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// Reads `BACKEND_API_URL` and `STREAM_API_KEY` (required), and
    /// `AI_BOT_USER_ID`, `COACHCHAT_HISTORY_LIMIT`, `COACHCHAT_TIMEOUT_SECS`,
    /// `COACHCHAT_CREDENTIALS` (optional).
    ///
    /// # Errors
    /// Returns error if a required variable is missing or a value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };
        let number = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(var)
                .map(|raw| {
                    raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                        var,
                        reason: e.to_string(),
                    })
                })
                .transpose()
        };

        let mut config = Self::new(required("BACKEND_API_URL")?, required("STREAM_API_KEY")?);

        if let Some(bot) = lookup("AI_BOT_USER_ID").filter(|v| !v.trim().is_empty()) {
            config.ai_bot_id = UserId::new(bot);
        }
        if let Some(limit) = number("COACHCHAT_HISTORY_LIMIT")? {
            config.history_limit = usize::try_from(limit).map_err(|e| ConfigError::Invalid {
                var: "COACHCHAT_HISTORY_LIMIT",
                reason: e.to_string(),
            })?;
        }
        if let Some(secs) = number("COACHCHAT_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = lookup("COACHCHAT_CREDENTIALS") {
            config.credentials_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("BACKEND_API_URL", "http://localhost:8000/api/"),
            ("STREAM_API_KEY", "key"),
        ]))
        .unwrap();
        assert_eq!(config.api_base_url, "http://localhost:8000/api");
        assert_eq!(config.ai_bot_id.as_str(), DEFAULT_AI_BOT_ID);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.request_timeout, DEFAULT_TIMEOUT);
        assert!(config.credentials_path().ends_with("coachchat/session.json"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("BACKEND_API_URL", "http://api"),
            ("STREAM_API_KEY", "key"),
            ("AI_BOT_USER_ID", "coach"),
            ("COACHCHAT_HISTORY_LIMIT", "50"),
            ("COACHCHAT_TIMEOUT_SECS", "3"),
            ("COACHCHAT_CREDENTIALS", "/tmp/creds.json"),
        ]))
        .unwrap();
        assert_eq!(config.ai_bot_id.as_str(), "coach");
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.credentials_path(), PathBuf::from("/tmp/creds.json"));
    }

    #[test]
    fn test_from_lookup_errors() {
        assert_eq!(
            ClientConfig::from_lookup(lookup(&[("STREAM_API_KEY", "key")])),
            Err(ConfigError::Missing("BACKEND_API_URL"))
        );
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[
                ("BACKEND_API_URL", "http://api"),
                ("STREAM_API_KEY", "key"),
                ("COACHCHAT_HISTORY_LIMIT", "lots"),
            ])),
            Err(ConfigError::Invalid { var: "COACHCHAT_HISTORY_LIMIT", .. })
        ));
    }

    #[test]
    fn test_bot_detection() {
        let config = ClientConfig::new("http://api", "key").with_ai_bot_id("coach");
        assert!(config.is_bot(&UserId::new("coach")));
        assert!(config.is_bot(&UserId::new("ai-bot-2")));
        assert!(!config.is_bot(&UserId::new("alice")));
    }
}
