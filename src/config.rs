//! Engine configuration.
//!
//! Every key has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! turn_time_limit_secs = 90
//! base_grace_period_secs = 45
//! max_players = 3
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::connection::GracePolicy;
use crate::state::tile::FULL_SET_SIZE;
use crate::state::session::{
    SessionOptions, DEFAULT_HAND_SIZE, DEFAULT_MAX_PLAYERS, DEFAULT_MIN_PLAYERS,
};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `None` disables the turn timer
    pub turn_time_limit_secs: Option<u64>,
    pub base_grace_period_secs: u64,
    pub mobile_grace_multiplier: f64,
    pub poor_quality_grace_multiplier: f64,
    pub max_grace_period_secs: u64,
    /// Interval of turn-timer ticks; `None` disables them
    pub timer_tick_secs: Option<u64>,
    pub min_players: usize,
    pub max_players: usize,
    pub hand_size: usize,
    pub max_bot_actions_per_turn: usize,
    pub save_max_attempts: u32,
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            turn_time_limit_secs: Some(120),
            base_grace_period_secs: 30,
            mobile_grace_multiplier: 2.0,
            poor_quality_grace_multiplier: 1.5,
            max_grace_period_secs: 120,
            timer_tick_secs: Some(1),
            min_players: DEFAULT_MIN_PLAYERS,
            max_players: DEFAULT_MAX_PLAYERS,
            hand_size: DEFAULT_HAND_SIZE,
            max_bot_actions_per_turn: 16,
            save_max_attempts: 5,
            seed: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_players < 2 {
            return Err(ConfigError::Invalid("min_players must be >= 2".into()));
        }
        if self.max_players < self.min_players {
            return Err(ConfigError::Invalid(
                "max_players must be >= min_players".into(),
            ));
        }
        if self.base_grace_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "base_grace_period_secs must be > 0".into(),
            ));
        }
        if self.max_grace_period_secs < self.base_grace_period_secs {
            return Err(ConfigError::Invalid(
                "max_grace_period_secs must be >= base_grace_period_secs".into(),
            ));
        }
        let multipliers = [self.mobile_grace_multiplier, self.poor_quality_grace_multiplier];
        if multipliers.iter().any(|m| !m.is_finite() || *m < 1.0) {
            return Err(ConfigError::Invalid(
                "grace multipliers must be finite and >= 1.0".into(),
            ));
        }
        if self.turn_time_limit_secs == Some(0) || self.timer_tick_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "timer durations must be > 0 when set".into(),
            ));
        }
        if self.hand_size == 0 {
            return Err(ConfigError::Invalid("hand_size must be > 0".into()));
        }
        let dealt = self.hand_size.checked_mul(self.max_players);
        if dealt.map_or(true, |n| n > FULL_SET_SIZE) {
            return Err(ConfigError::Invalid(format!(
                "hand_size * max_players must be <= {}",
                FULL_SET_SIZE
            )));
        }
        if self.save_max_attempts == 0 {
            return Err(ConfigError::Invalid("save_max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn grace_policy(&self) -> GracePolicy {
        GracePolicy {
            base: Duration::from_secs(self.base_grace_period_secs),
            mobile_multiplier: self.mobile_grace_multiplier,
            poor_quality_multiplier: self.poor_quality_grace_multiplier,
            max: Duration::from_secs(self.max_grace_period_secs),
        }
    }

    /// Options for a new session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            turn_time_limit: self.turn_time_limit_secs.map(Duration::from_secs),
            grace: self.grace_policy(),
            min_players: self.min_players,
            max_players: self.max_players,
            hand_size: self.hand_size,
            seed: self.seed,
        }
    }

    pub fn timer_tick(&self) -> Option<Duration> {
        self.timer_tick_secs.map(Duration::from_secs)
    }
}
