//! Server configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::state::game::{GameSettings, Seating};
use crate::state::location::LocationOptions;
use crate::state::session::{SessionOptions, DEFAULT_CHAT_HISTORY};

/// Default inactivity timeout (10 minutes).
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Sessions idle for longer are force-quit by the sweep
    pub inactivity_timeout_secs: u64,

    /// Chat lines replayed to a (re)connecting session
    pub chat_history_len: usize,

    /// Route `cheat: ` chat lines to the location
    pub cheats_enabled: bool,

    /// Development mode, reported to the client
    pub devtest: bool,

    /// Shuffle seats when a game is created
    pub shuffle_seats: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            chat_history_len: DEFAULT_CHAT_HISTORY,
            cheats_enabled: false,
            devtest: false,
            shuffle_seats: true,
        }
    }
}

impl ServerConfig {
    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inactivity_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "inactivity_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn inactivity_timeout(&self) -> Duration {
        let secs = i64::try_from(self.inactivity_timeout_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        Duration::seconds(secs)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            chat_history_len: self.chat_history_len,
            devtest: self.devtest,
        }
    }

    /// Options for games and other transient locations.
    pub fn location_options(&self) -> LocationOptions {
        LocationOptions {
            has_chat: true,
            persistent: false,
            cheats_enabled: self.cheats_enabled,
        }
    }

    pub fn seating(&self) -> Seating {
        if self.shuffle_seats {
            Seating::Shuffled
        } else {
            Seating::AsGiven
        }
    }

    /// Settings lobbies hand to the games they start.
    pub fn game_settings(&self) -> GameSettings {
        GameSettings {
            options: self.location_options(),
            seating: self.seating(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.inactivity_timeout(), Duration::minutes(10));
        assert_eq!(config.chat_history_len, 10);
        assert_eq!(config.seating(), Seating::Shuffled);
        assert!(!config.location_options().cheats_enabled);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json(r#"{"cheats_enabled": true, "shuffle_seats": false}"#).unwrap();
        assert_eq!(
            config,
            ServerConfig {
                cheats_enabled: true,
                shuffle_seats: false,
                ..ServerConfig::default()
            }
        );
        assert!(config.location_options().cheats_enabled);
        assert_eq!(config.seating(), Seating::AsGiven);
        assert_eq!(
            config.game_settings(),
            GameSettings {
                options: LocationOptions {
                    has_chat: true,
                    persistent: false,
                    cheats_enabled: true,
                },
                seating: Seating::AsGiven,
            }
        );
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(ServerConfig::from_json("{"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            ServerConfig::from_json(r#"{"inactivity_timeout_secs": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_session_options() {
        let config = ServerConfig {
            chat_history_len: 3,
            devtest: true,
            ..ServerConfig::default()
        };
        let options = config.session_options();
        assert_eq!(options.chat_history_len, 3);
        assert!(options.devtest);
    }
}
