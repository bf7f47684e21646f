use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{Severity, DEFAULT_WINDOW_LEN};

/// Tunables of the local heuristic. The defaults are demo values, not
/// clinically derived thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicParams {
    /// Multiplier applied to the window mean to project the next 24 hours.
    pub growth: f64,
    /// Ratios strictly above this are at least `Warning`.
    pub warning_ratio: f64,
    /// Ratios strictly above this are `Critical`.
    pub critical_ratio: f64,
}

impl Default for HeuristicParams {
    fn default() -> Self {
        Self {
            growth: 1.05,
            warning_ratio: 0.80,
            critical_ratio: 0.90,
        }
    }
}

impl HeuristicParams {
    pub fn classify(&self, ratio: f64) -> Severity {
        if ratio > self.critical_ratio {
            Severity::Critical
        } else if ratio > self.warning_ratio {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.growth.is_finite() || self.growth < 0.0 {
            return Err(ConfigError::Invalid {
                field: "growth",
                reason: format!("must be a non-negative number, got {}", self.growth),
            });
        }
        if !(0.0..=self.critical_ratio).contains(&self.warning_ratio) {
            return Err(ConfigError::Invalid {
                field: "warning_ratio",
                reason: format!(
                    "must lie in [0, critical_ratio={}], got {}",
                    self.critical_ratio, self.warning_ratio
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Historical samples per window.
    pub window_len: usize,
    /// How often the source is checked for new telemetry.
    pub poll_interval: Duration,
    /// Run a cycle even without new telemetry once this much time has passed.
    pub heartbeat: Duration,
    /// Upper bound on one remote analysis.
    pub remote_timeout: Duration,
    /// Minimum spacing between two remote requests.
    pub request_spacing: Duration,
    /// How far ahead the forecast is dated.
    pub horizon: Duration,
    pub cache_path: PathBuf,
    pub model: String,
    /// Capacity assumed when a unit has no snapshot yet.
    pub default_capacity: u32,
    pub heuristic: HeuristicParams,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            window_len: DEFAULT_WINDOW_LEN,
            poll_interval: Duration::from_secs(60),
            heartbeat: Duration::from_secs(4 * 60 * 60),
            remote_timeout: Duration::from_secs(30),
            request_spacing: Duration::from_secs(1),
            horizon: Duration::from_secs(24 * 60 * 60),
            cache_path: PathBuf::from("agent_cache.json"),
            model: "gemini-2.0-flash".to_string(),
            default_capacity: 200,
            heuristic: HeuristicParams::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_len == 0 {
            return Err(ConfigError::Invalid {
                field: "window_len",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Missing("model"));
        }
        self.heuristic.validate()
    }
}

/// Rejects unset or template credentials such as `<your-key>` or
/// `https://placeholder.supabase.co`.
pub fn require_credential(
    field: &'static str,
    value: Option<&str>,
) -> Result<String, ConfigError> {
    let value = value.map(str::trim).filter(|v| !v.is_empty());
    match value {
        None => Err(ConfigError::Missing(field)),
        Some(v) if v.contains('<') || v.contains("placeholder") => Err(ConfigError::Invalid {
            field,
            reason: "looks like a template value".to_string(),
        }),
        Some(v) => Ok(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands_are_exclusive_below() {
        let params = HeuristicParams::default();

        assert_eq!(params.classify(0.80), Severity::Normal);
        assert_eq!(params.classify(0.800_000_1), Severity::Warning);
        assert_eq!(params.classify(0.90), Severity::Warning);
        assert_eq!(params.classify(0.900_000_1), Severity::Critical);
        assert_eq!(params.classify(0.0), Severity::Normal);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let params = HeuristicParams {
            warning_ratio: 0.95,
            critical_ratio: 0.90,
            ..HeuristicParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_negative_growth() {
        let params = HeuristicParams {
            growth: -0.5,
            ..HeuristicParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn credential_checks() {
        assert!(matches!(
            require_credential("SUPABASE_URL", None),
            Err(ConfigError::Missing("SUPABASE_URL"))
        ));
        assert!(require_credential("SUPABASE_URL", Some("https://placeholder.supabase.co")).is_err());
        assert!(require_credential("SUPABASE_KEY", Some("<anon-key>")).is_err());
        assert_eq!(
            require_credential("SUPABASE_KEY", Some(" abc ")).unwrap(),
            "abc"
        );
    }
}
