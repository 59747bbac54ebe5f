//! Environment-backed runtime configuration for `chat-cli`.

use std::{env, error::Error, fmt, time::Duration};

use chat_core::{LocalUser, RetryPolicy, RoomId, RoomPermission, UserId};
use chat_runtime::{SessionConfig, SessionTuning};
use url::Url;

/// Runtime configuration used by the terminal client.
#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    /// Base URL of the chat server's REST API.
    pub base_url: Url,
    /// Websocket endpoint. Without one the client polls.
    pub ws_url: Option<Url>,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub color: Option<String>,
    pub badge: Option<String>,
    pub permission: RoomPermission,
    /// Value of the `Cookie` header sent with every request.
    pub session_cookie: Option<String>,
    /// Users whose join/leave notices are shown.
    pub followed_user_ids: Vec<UserId>,
    pub tuning: SessionTuning,
}

impl CliConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base_url = parse_url("ROOMCHAT_BASE_URL", &mut lookup)?
            .ok_or(ConfigError::Missing("ROOMCHAT_BASE_URL"))?;
        let ws_url = parse_url("ROOMCHAT_WS_URL", &mut lookup)?;
        let room_id = parse_optional_u64("ROOMCHAT_ROOM_ID", &mut lookup)?
            .ok_or(ConfigError::Missing("ROOMCHAT_ROOM_ID"))?;
        let user_id = parse_optional_u64("ROOMCHAT_USER_ID", &mut lookup)?
            .ok_or(ConfigError::Missing("ROOMCHAT_USER_ID"))?;
        let username = optional_trimmed_env("ROOMCHAT_USERNAME", &mut lookup)
            .unwrap_or_else(|| format!("user{user_id}"));
        let color = optional_trimmed_env("ROOMCHAT_COLOR", &mut lookup);
        let badge = optional_trimmed_env("ROOMCHAT_BADGE", &mut lookup);
        let permission = optional_trimmed_env("ROOMCHAT_PERMISSION", &mut lookup)
            .map(|code| RoomPermission::from_code(&code))
            .unwrap_or(RoomPermission::Member);
        let session_cookie = optional_trimmed_env("ROOMCHAT_SESSION_COOKIE", &mut lookup);
        let followed_user_ids = parse_id_list("ROOMCHAT_FOLLOWED_USERS", &mut lookup)?;

        let defaults = SessionTuning::default();
        let heartbeat_interval =
            parse_duration_ms("ROOMCHAT_HEARTBEAT_MS", defaults.heartbeat_interval, &mut lookup)?;
        let poll_interval =
            parse_duration_ms("ROOMCHAT_POLL_MS", defaults.poll_interval, &mut lookup)?;
        let roster_poll_interval = parse_duration_ms(
            "ROOMCHAT_ROSTER_POLL_MS",
            defaults.roster_poll_interval,
            &mut lookup,
        )?;
        let reconnect = match parse_optional_u64("ROOMCHAT_RECONNECT_DELAY_MS", &mut lookup)? {
            Some(delay_ms) => RetryPolicy::fixed(delay_ms),
            None => defaults.reconnect,
        };
        let max_reconnect_attempts =
            match parse_optional_u64("ROOMCHAT_MAX_RECONNECT_ATTEMPTS", &mut lookup)? {
                Some(value) => u32::try_from(value).map_err(|err| ConfigError::InvalidValue {
                    key: "ROOMCHAT_MAX_RECONNECT_ATTEMPTS",
                    value: value.to_string(),
                    reason: err.to_string(),
                })?,
                None => defaults.max_reconnect_attempts,
            };
        let page_size = parse_optional_u16("ROOMCHAT_PAGE_SIZE", &mut lookup)?
            .unwrap_or(defaults.page_size);
        let timeline_max_items = parse_optional_usize(
            "ROOMCHAT_TIMELINE_MAX_ITEMS",
            defaults.timeline_max_items,
            &mut lookup,
        )?;
        let pending_ttl =
            parse_optional_u64("ROOMCHAT_PENDING_TTL_MS", &mut lookup)?.map(Duration::from_millis);

        if page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROOMCHAT_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if timeline_max_items == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROOMCHAT_TIMELINE_MAX_ITEMS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            base_url,
            ws_url,
            room_id,
            user_id,
            username,
            color,
            badge,
            permission,
            session_cookie,
            followed_user_ids,
            tuning: SessionTuning {
                heartbeat_interval,
                poll_interval,
                roster_poll_interval,
                reconnect,
                max_reconnect_attempts,
                page_size,
                timeline_max_items,
                pending_ttl,
                ..defaults
            },
        })
    }

    /// Session parameters for the configured room.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            room_id: self.room_id,
            local_user: LocalUser {
                id: self.user_id,
                name: self.username.clone(),
                color: self.color.clone(),
                badge: self.badge.clone(),
            },
            permission: self.permission,
            followed_user_ids: self.followed_user_ids.clone(),
            tuning: self.tuning.clone(),
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing(&'static str),
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "missing required {key}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_url<F>(key: &'static str, lookup: &mut F) -> Result<Option<Url>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    Url::parse(&value)
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_duration_ms<F>(
    key: &'static str,
    default: Duration,
    lookup: &mut F,
) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match parse_optional_u64(key, lookup)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be greater than 0".to_owned(),
        }),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

fn parse_id_list<F>(key: &'static str, lookup: &mut F) -> Result<Vec<UserId>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<UserId>()
                .map_err(|err| ConfigError::InvalidValue {
                    key,
                    value: part.to_owned(),
                    reason: err.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REQUIRED: [(&str, &str); 3] = [
        ("ROOMCHAT_BASE_URL", "https://chat.example.org/"),
        ("ROOMCHAT_ROOM_ID", "12"),
        ("ROOMCHAT_USER_ID", "3"),
    ];

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<CliConfig, ConfigError> {
        let map = REQUIRED
            .iter()
            .chain(pairs.iter())
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        CliConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_required_fields_and_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.base_url.as_str(), "https://chat.example.org/");
        assert_eq!(cfg.room_id, 12);
        assert_eq!(cfg.user_id, 3);
        assert_eq!(cfg.username, "user3");
        assert_eq!(cfg.permission, RoomPermission::Member);
        assert_eq!(cfg.ws_url, None);
        assert!(cfg.followed_user_ids.is_empty());
        assert_eq!(cfg.tuning.page_size, 50);
        assert_eq!(cfg.tuning.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.tuning.pending_ttl, None);
    }

    #[test]
    fn missing_room_is_reported_by_key() {
        let map: HashMap<String, String> =
            HashMap::from([("ROOMCHAT_BASE_URL".into(), "https://chat.example.org".into())]);
        let err = CliConfig::from_lookup(|key| map.get(key).cloned())
            .expect_err("room id is required");
        assert_eq!(err, ConfigError::Missing("ROOMCHAT_ROOM_ID"));
    }

    #[test]
    fn parses_identity_and_tuning_overrides() {
        let cfg = config_from_pairs(&[
            ("ROOMCHAT_WS_URL", "wss://chat.example.org/ws"),
            ("ROOMCHAT_USERNAME", " alice "),
            ("ROOMCHAT_PERMISSION", "su"),
            ("ROOMCHAT_FOLLOWED_USERS", "4, 9,,11"),
            ("ROOMCHAT_RECONNECT_DELAY_MS", "2000"),
            ("ROOMCHAT_MAX_RECONNECT_ATTEMPTS", "2"),
            ("ROOMCHAT_PENDING_TTL_MS", "60000"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.username, "alice");
        assert_eq!(cfg.permission, RoomPermission::Owner);
        assert_eq!(cfg.followed_user_ids, vec![4, 9, 11]);
        assert_eq!(cfg.tuning.reconnect, RetryPolicy::fixed(2_000));
        assert_eq!(cfg.tuning.max_reconnect_attempts, 2);
        assert_eq!(cfg.tuning.pending_ttl, Some(Duration::from_secs(60)));

        let session = cfg.session_config();
        assert_eq!(session.local_user.name, "alice");
        assert_eq!(session.room_id, 12);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("ROOMCHAT_PAGE_SIZE", "abc")])
            .expect_err("invalid page size should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ROOMCHAT_PAGE_SIZE",
                ..
            }
        ));

        let err = config_from_pairs(&[("ROOMCHAT_POLL_MS", "0")])
            .expect_err("zero interval should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ROOMCHAT_POLL_MS",
                ..
            }
        ));
    }
}
