//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// What the zombie detector does once a run crosses the hard threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombieMode {
    /// Kill escalated runs automatically.
    Auto,
    /// Flag escalated runs and wait for an operator kill or pardon.
    Supervised,
}

impl FromStr for ZombieMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "supervised" => Ok(Self::Supervised),
            other => Err(format!("expected auto or supervised, got '{other}'")),
        }
    }
}

/// Zombie detector thresholds.
#[derive(Debug, Clone)]
pub struct ZombieConfig {
    /// How often the detector scans active runs.
    pub scan_interval: Duration,
    /// No events for this long marks a run as silent.
    pub silence_threshold: Duration,
    /// No step advance for this long marks a run as stagnant.
    pub stagnation_threshold: Duration,
    /// A suspected run silent or stagnant for this long is escalated.
    pub kill_threshold: Duration,
    /// Lookback window for burn-rate checks.
    pub burn_window: Duration,
    /// Tokens consumed within `burn_window` that count as non-trivial burn.
    pub burn_min_tokens: u64,
    /// Number of recent outputs compared by the repetition check (0 disables it).
    pub repetition_window: usize,
    /// Similarity ratio above which two outputs count as repeats.
    pub repetition_similarity: f64,
    /// Identical consecutive tool calls that count as a stuck loop (0 disables it).
    pub stuck_loop_calls: usize,
    pub mode: ZombieMode,
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            silence_threshold: Duration::from_secs(10 * 60),
            stagnation_threshold: Duration::from_secs(20 * 60),
            kill_threshold: Duration::from_secs(30 * 60),
            burn_window: Duration::from_secs(10 * 60),
            burn_min_tokens: 10_000,
            repetition_window: 10,
            repetition_similarity: 0.8,
            stuck_loop_calls: 3,
            mode: ZombieMode::Auto,
        }
    }
}

impl ZombieConfig {
    /// Load from `FOREMAN_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            scan_interval: env_secs("FOREMAN_SCAN_INTERVAL_SECS", defaults.scan_interval)?,
            silence_threshold: env_minutes("FOREMAN_SILENCE_MINUTES", defaults.silence_threshold)?,
            stagnation_threshold: env_minutes(
                "FOREMAN_STAGNATION_MINUTES",
                defaults.stagnation_threshold,
            )?,
            kill_threshold: env_minutes("FOREMAN_KILL_MINUTES", defaults.kill_threshold)?,
            burn_window: env_minutes("FOREMAN_BURN_WINDOW_MINUTES", defaults.burn_window)?,
            burn_min_tokens: env_parse("FOREMAN_BURN_MIN_TOKENS", defaults.burn_min_tokens)?,
            repetition_window: env_parse(
                "FOREMAN_REPETITION_WINDOW",
                defaults.repetition_window,
            )?,
            repetition_similarity: defaults.repetition_similarity,
            stuck_loop_calls: env_parse("FOREMAN_STUCK_LOOP_CALLS", defaults.stuck_loop_calls)?,
            mode: env_parse("FOREMAN_ZOMBIE_MODE", defaults.mode)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval.is_zero() {
            return Err(invalid("FOREMAN_SCAN_INTERVAL_SECS", "must be greater than zero"));
        }
        if self.kill_threshold <= self.silence_threshold {
            return Err(invalid(
                "FOREMAN_KILL_MINUTES",
                "kill threshold must be longer than the silence threshold",
            ));
        }
        if !(0.0..=1.0).contains(&self.repetition_similarity) {
            return Err(invalid("repetition_similarity", "must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Operator API port.
    pub http_port: u16,
    /// Root under which assignment worktrees are laid out.
    pub worktree_root: PathBuf,
    /// Pushed events stamped further than this into the future are clamped.
    pub clock_skew_tolerance: Duration,
    /// Bearer token required by mutating operator routes, if set.
    pub operator_token: Option<SecretString>,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub zombie: ZombieConfig,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/foreman.db"),
            http_port: 8080,
            worktree_root: PathBuf::from("./worktrees"),
            clock_skew_tolerance: Duration::from_secs(120),
            operator_token: None,
            log_dir: None,
            zombie: ZombieConfig::default(),
        }
    }
}

impl ForemanConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: std::env::var("FOREMAN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: env_parse("FOREMAN_HTTP_PORT", defaults.http_port)?,
            worktree_root: std::env::var("FOREMAN_WORKTREE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.worktree_root),
            clock_skew_tolerance: env_secs(
                "FOREMAN_CLOCK_SKEW_SECS",
                defaults.clock_skew_tolerance,
            )?,
            operator_token: std::env::var("FOREMAN_OPERATOR_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            log_dir: std::env::var("FOREMAN_LOG_DIR").ok().map(PathBuf::from),
            zombie: ZombieConfig::from_env()?,
        })
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_minutes(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs() / 60).map(|m| Duration::from_secs(m * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ZombieConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.silence_threshold, Duration::from_secs(600));
        assert_eq!(config.kill_threshold, Duration::from_secs(1800));
    }

    #[test]
    fn kill_threshold_must_exceed_silence() {
        let config = ZombieConfig {
            kill_threshold: Duration::from_secs(300),
            ..ZombieConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("FOREMAN_KILL_MINUTES"));
    }

    #[test]
    fn zombie_mode_parses() {
        assert_eq!("auto".parse::<ZombieMode>().unwrap(), ZombieMode::Auto);
        assert_eq!(
            " Supervised ".parse::<ZombieMode>().unwrap(),
            ZombieMode::Supervised
        );
        assert!("sometimes".parse::<ZombieMode>().is_err());
    }
}
