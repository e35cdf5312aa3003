use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("risk weight {name} must be finite and non-negative, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },

    #[error("risk weights sum to zero")]
    ZeroWeights,

    #[error("thresholds must satisfy 0 <= auto_approve_below <= escalate_above <= 1")]
    InvalidThresholds,

    #[error("days_unused_saturation must be positive")]
    InvalidSaturation,
}

/// Relative weight of each normalized signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub privilege_level: f64,
    pub days_unused: f64,
    pub sod_conflict: f64,
    pub peer_deviation: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            privilege_level: 0.35,
            days_unused: 0.25,
            sod_conflict: 0.25,
            peer_deviation: 0.15,
        }
    }
}

impl RiskWeights {
    pub fn total(&self) -> f64 {
        self.privilege_level + self.days_unused + self.sod_conflict + self.peer_deviation
    }
}

/// Opt-in rule that sends stale, high-scoring items to automatic revocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoRevokeRule {
    /// Minimum score, inclusive
    pub min_score: f64,
    /// Minimum days unused, inclusive
    pub min_days_unused: u32,
    /// Only when upstream also recommends revocation
    #[serde(default = "default_true")]
    pub require_revoke_recommendation: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Scores strictly below this may be auto-approved
    pub auto_approve_below: f64,
    /// Scores strictly above this always escalate
    pub escalate_above: f64,
    /// Disabled unless configured
    pub auto_revoke: Option<AutoRevokeRule>,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            auto_approve_below: 0.3,
            escalate_above: 0.7,
            auto_revoke: None,
        }
    }
}

/// Risk configuration for certification review.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub thresholds: RiskThresholds,
    /// Days unused at which that signal reaches its maximum
    pub days_unused_saturation: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
            days_unused_saturation: 180,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), RiskError> {
        let w = &self.weights;
        for (name, value) in [
            ("privilege_level", w.privilege_level),
            ("days_unused", w.days_unused),
            ("sod_conflict", w.sod_conflict),
            ("peer_deviation", w.peer_deviation),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(RiskError::InvalidWeight { name, value });
            }
        }
        if w.total() <= 0.0 {
            return Err(RiskError::ZeroWeights);
        }

        let t = &self.thresholds;
        let ordered = (0.0..=1.0).contains(&t.auto_approve_below)
            && (0.0..=1.0).contains(&t.escalate_above)
            && t.auto_approve_below <= t.escalate_above;
        if !ordered {
            return Err(RiskError::InvalidThresholds);
        }
        if self.days_unused_saturation == 0 {
            return Err(RiskError::InvalidSaturation);
        }
        Ok(())
    }

    pub fn with_auto_revoke(mut self, rule: AutoRevokeRule) -> Self {
        self.thresholds.auto_revoke = Some(rule);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = RiskConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.weights.total() - 1.0).abs() < 1e-9);
        assert!(config.thresholds.auto_revoke.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = RiskConfig::default();
        config.weights.sod_conflict = -1.0;
        assert!(matches!(
            config.validate(),
            Err(RiskError::InvalidWeight { name: "sod_conflict", .. })
        ));

        let mut config = RiskConfig::default();
        config.thresholds.auto_approve_below = 0.8;
        assert_eq!(config.validate(), Err(RiskError::InvalidThresholds));

        let config = RiskConfig {
            weights: RiskWeights {
                privilege_level: 0.0,
                days_unused: 0.0,
                sod_conflict: 0.0,
                peer_deviation: 0.0,
            },
            ..RiskConfig::default()
        };
        assert_eq!(config.validate(), Err(RiskError::ZeroWeights));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RiskConfig =
            serde_json::from_str(r#"{"thresholds": {"escalate_above": 0.8}}"#).unwrap();
        assert_eq!(config.thresholds.escalate_above, 0.8);
        assert_eq!(config.thresholds.auto_approve_below, 0.3);
        assert_eq!(config.days_unused_saturation, 180);
    }
}
