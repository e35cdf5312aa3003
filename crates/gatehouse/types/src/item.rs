//! Governance items: the entitlement assignments a certification reviews.

use crate::{ActorId, ItemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk bucket assigned by the classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBucket {
    AutoApprove,
    Escalate,
    AutoRevoke,
}

impl RiskBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBucket::AutoApprove => "auto_approve",
            RiskBucket::Escalate => "escalate",
            RiskBucket::AutoRevoke => "auto_revoke",
        }
    }
}

impl std::fmt::Display for RiskBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream (AI) recommendation attached to an item. Advisory only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    Revoke,
    #[default]
    None,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Pending,
    Approved,
    Revoked,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pending => "pending",
            Decision::Approved => "approved",
            Decision::Revoked => "revoked",
        }
    }
}

/// Raw risk inputs produced upstream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSignals {
    /// Privilege level normalized to `[0, 1]`
    #[serde(default)]
    pub privilege_level: f64,
    /// Days since the entitlement was last used
    #[serde(default)]
    pub days_unused: u32,
    /// Separation-of-duties conflict
    #[serde(default)]
    pub sod_conflict: bool,
    /// Deviation from the peer group, normalized to `[0, 1]`
    #[serde(default)]
    pub peer_deviation: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub bucket: RiskBucket,
}

/// Who decided an item, and with which confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionAttribution {
    pub actor: ActorId,
    pub token_nonce: String,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernanceItem {
    pub id: ItemId,
    pub name: String,
    #[serde(default)]
    pub signals: RiskSignals,
    #[serde(default)]
    pub recommendation: Recommendation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<RiskAssessment>,
    #[serde(default)]
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<DecisionAttribution>,
}

impl GovernanceItem {
    pub fn new(id: impl Into<ItemId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            signals: RiskSignals::default(),
            recommendation: Recommendation::None,
            assessment: None,
            decision: Decision::Pending,
            attribution: None,
        }
    }

    pub fn with_signals(mut self, signals: RiskSignals) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_recommendation(mut self, recommendation: Recommendation) -> Self {
        self.recommendation = recommendation;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }

    pub fn bucket(&self) -> Option<RiskBucket> {
        self.assessment.map(|a| a.bucket)
    }

    /// Record a decision. Already-decided items are left untouched and
    /// `false` is returned.
    pub fn decide(&mut self, decision: Decision, attribution: DecisionAttribution) -> bool {
        if !self.is_pending() || decision == Decision::Pending {
            return false;
        }
        self.decision = decision;
        self.attribution = Some(attribution);
        true
    }
}
