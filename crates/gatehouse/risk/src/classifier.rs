use crate::{RiskConfig, RiskError};
use gatehouse_types::{
    GovernanceItem, ItemId, Recommendation, RiskAssessment, RiskBucket, RiskSignals,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub score: f64,
    pub bucket: RiskBucket,
    /// Human-readable reasons, in evaluation order
    pub factors: Vec<String>,
}

impl Classification {
    pub fn assessment(&self) -> RiskAssessment {
        RiskAssessment {
            score: self.score,
            bucket: self.bucket,
        }
    }
}

/// Item ids grouped by bucket, in input order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub auto_approve: Vec<ItemId>,
    pub escalate: Vec<ItemId>,
    pub auto_revoke: Vec<ItemId>,
}

impl Partition {
    pub fn bucket(&self, bucket: RiskBucket) -> &[ItemId] {
        match bucket {
            RiskBucket::AutoApprove => &self.auto_approve,
            RiskBucket::Escalate => &self.escalate,
            RiskBucket::AutoRevoke => &self.auto_revoke,
        }
    }

    pub fn len(&self) -> usize {
        self.auto_approve.len() + self.escalate.len() + self.auto_revoke.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
pub struct RiskClassifier {
    config: RiskConfig,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self {
            config: RiskConfig::default(),
        }
    }
}

impl RiskClassifier {
    pub fn new(config: RiskConfig) -> Result<Self, RiskError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Weighted mean of the normalized signals, in `[0, 1]`.
    pub fn score(&self, signals: &RiskSignals) -> f64 {
        let w = &self.config.weights;
        let days = f64::from(signals.days_unused) / f64::from(self.config.days_unused_saturation);
        let weighted = w.privilege_level * normalize(signals.privilege_level)
            + w.days_unused * normalize(days)
            + w.sod_conflict * if signals.sod_conflict { 1.0 } else { 0.0 }
            + w.peer_deviation * normalize(signals.peer_deviation);
        (weighted / w.total()).clamp(0.0, 1.0)
    }

    pub fn classify(&self, item: &GovernanceItem) -> Classification {
        let thresholds = &self.config.thresholds;
        let score = self.score(&item.signals);
        let mut factors = Vec::new();

        if item.signals.sod_conflict {
            factors.push("Separation-of-duties conflict".to_string());
            return Classification {
                score,
                bucket: RiskBucket::Escalate,
                factors,
            };
        }

        if score < thresholds.auto_approve_below && item.recommendation == Recommendation::Approve {
            factors.push(format!(
                "Low risk ({score:.2}) with approve recommendation"
            ));
            return Classification {
                score,
                bucket: RiskBucket::AutoApprove,
                factors,
            };
        }

        if score > thresholds.escalate_above {
            factors.push(format!("High risk score: {score:.2}"));
            return Classification {
                score,
                bucket: RiskBucket::Escalate,
                factors,
            };
        }

        if let Some(rule) = &thresholds.auto_revoke {
            let recommended = !rule.require_revoke_recommendation
                || item.recommendation == Recommendation::Revoke;
            if score >= rule.min_score && item.signals.days_unused >= rule.min_days_unused && recommended
            {
                factors.push(format!(
                    "Unused for {} days with risk {score:.2}",
                    item.signals.days_unused
                ));
                return Classification {
                    score,
                    bucket: RiskBucket::AutoRevoke,
                    factors,
                };
            }
        }

        factors.push(format!("Needs human review (risk {score:.2})"));
        Classification {
            score,
            bucket: RiskBucket::Escalate,
            factors,
        }
    }

    /// Classify every item, recording the assessment on it, and group by bucket.
    pub fn partition(&self, items: &mut [GovernanceItem]) -> Partition {
        let mut partition = Partition::default();
        for item in items.iter_mut() {
            let classification = self.classify(item);
            item.assessment = Some(classification.assessment());
            match classification.bucket {
                RiskBucket::AutoApprove => partition.auto_approve.push(item.id.clone()),
                RiskBucket::Escalate => partition.escalate.push(item.id.clone()),
                RiskBucket::AutoRevoke => partition.auto_revoke.push(item.id.clone()),
            }
        }
        partition
    }
}

fn normalize(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AutoRevokeRule;
    use proptest::prelude::*;

    fn item(signals: RiskSignals, recommendation: Recommendation) -> GovernanceItem {
        GovernanceItem::new("ent-1", "Entitlement")
            .with_signals(signals)
            .with_recommendation(recommendation)
    }

    #[test]
    fn test_low_risk_with_approve_recommendation_auto_approves() {
        let classifier = RiskClassifier::default();
        let c = classifier.classify(&item(
            RiskSignals {
                privilege_level: 0.2,
                peer_deviation: 0.1,
                ..Default::default()
            },
            Recommendation::Approve,
        ));
        assert_eq!(c.bucket, RiskBucket::AutoApprove);
        assert!((c.score - 0.085).abs() < 1e-9);
    }

    #[test]
    fn test_low_risk_without_recommendation_escalates() {
        let classifier = RiskClassifier::default();
        let c = classifier.classify(&item(RiskSignals::default(), Recommendation::None));
        assert_eq!(c.bucket, RiskBucket::Escalate);
        assert_eq!(c.score, 0.0);
    }

    #[test]
    fn test_sod_always_escalates() {
        let config = RiskConfig {
            weights: crate::RiskWeights {
                sod_conflict: 0.1,
                privilege_level: 0.3,
                days_unused: 0.3,
                peer_deviation: 0.3,
            },
            ..RiskConfig::default()
        };
        let classifier = RiskClassifier::new(config).unwrap();
        let c = classifier.classify(&item(
            RiskSignals {
                sod_conflict: true,
                ..Default::default()
            },
            Recommendation::Approve,
        ));
        assert!((c.score - 0.1).abs() < 1e-9);
        assert_eq!(c.bucket, RiskBucket::Escalate);
    }

    #[test]
    fn test_mid_and_high_scores_escalate() {
        let classifier = RiskClassifier::default();
        let mid = classifier.classify(&item(
            RiskSignals {
                privilege_level: 1.0,
                days_unused: 90,
                ..Default::default()
            },
            Recommendation::Approve,
        ));
        assert!((mid.score - 0.475).abs() < 1e-9);
        assert_eq!(mid.bucket, RiskBucket::Escalate);

        let high = classifier.classify(&item(
            RiskSignals {
                privilege_level: 1.0,
                days_unused: 400,
                peer_deviation: 1.0,
                ..Default::default()
            },
            Recommendation::Revoke,
        ));
        assert!((high.score - 0.75).abs() < 1e-9);
        assert_eq!(high.bucket, RiskBucket::Escalate);
    }

    #[test]
    fn test_auto_revoke_is_opt_in() {
        let signals = RiskSignals {
            privilege_level: 1.0,
            days_unused: 120,
            ..Default::default()
        };
        let stale = item(signals, Recommendation::Revoke);
        assert_eq!(
            RiskClassifier::default().classify(&stale).bucket,
            RiskBucket::Escalate
        );

        let classifier = RiskClassifier::new(RiskConfig::default().with_auto_revoke(
            AutoRevokeRule {
                min_score: 0.4,
                min_days_unused: 90,
                require_revoke_recommendation: true,
            },
        ))
        .unwrap();
        assert_eq!(classifier.classify(&stale).bucket, RiskBucket::AutoRevoke);

        let mut no_rec = stale.clone();
        no_rec.recommendation = Recommendation::None;
        assert_eq!(classifier.classify(&no_rec).bucket, RiskBucket::Escalate);
    }

    #[test]
    fn test_partition_records_assessments() {
        let classifier = RiskClassifier::default();
        let mut items = vec![
            GovernanceItem::new("a", "A").with_recommendation(Recommendation::Approve),
            GovernanceItem::new("b", "B").with_signals(RiskSignals {
                sod_conflict: true,
                ..Default::default()
            }),
        ];
        let partition = classifier.partition(&mut items);
        assert_eq!(partition.auto_approve, vec![ItemId::new("a")]);
        assert_eq!(partition.escalate, vec![ItemId::new("b")]);
        assert_eq!(partition.len(), 2);
        assert_eq!(items[0].bucket(), Some(RiskBucket::AutoApprove));
        assert_eq!(items[1].bucket(), Some(RiskBucket::Escalate));
    }

    #[test]
    fn test_non_finite_signals_score_as_maximum() {
        let classifier = RiskClassifier::default();
        let score = classifier.score(&RiskSignals {
            privilege_level: f64::NAN,
            ..Default::default()
        });
        assert!((score - 0.35).abs() < 1e-9);
    }

    fn signals_strategy() -> impl Strategy<Value = RiskSignals> {
        (0.0f64..=1.0, 0u32..1000, any::<bool>(), 0.0f64..=1.0).prop_map(
            |(privilege_level, days_unused, sod_conflict, peer_deviation)| RiskSignals {
                privilege_level,
                days_unused,
                sod_conflict,
                peer_deviation,
            },
        )
    }

    fn recommendation_strategy() -> impl Strategy<Value = Recommendation> {
        prop_oneof![
            Just(Recommendation::Approve),
            Just(Recommendation::Revoke),
            Just(Recommendation::None),
        ]
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(
            signals in signals_strategy(),
            rec in recommendation_strategy(),
        ) {
            let classifier = RiskClassifier::default();
            let it = item(signals, rec);
            let first = classifier.classify(&it);
            let second = classifier.classify(&it);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn score_is_bounded(signals in signals_strategy()) {
            let score = RiskClassifier::default().score(&signals);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn sod_flag_always_escalates(
            signals in signals_strategy(),
            rec in recommendation_strategy(),
        ) {
            let classifier = RiskClassifier::new(RiskConfig::default().with_auto_revoke(AutoRevokeRule {
                min_score: 0.0,
                min_days_unused: 0,
                require_revoke_recommendation: false,
            })).unwrap();
            let flagged = item(RiskSignals { sod_conflict: true, ..signals }, rec);
            prop_assert_eq!(classifier.classify(&flagged).bucket, RiskBucket::Escalate);
        }

        #[test]
        fn auto_approve_requires_low_score_and_recommendation(
            signals in signals_strategy(),
            rec in recommendation_strategy(),
        ) {
            let classifier = RiskClassifier::default();
            let c = classifier.classify(&item(signals, rec));
            if c.bucket == RiskBucket::AutoApprove {
                prop_assert!(c.score < 0.3);
                prop_assert_eq!(rec, Recommendation::Approve);
            }
        }
    }
}
