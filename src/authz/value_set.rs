use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::evaluator::{Evaluation, EvaluationPolicy, VetoBeatsAllow};
use crate::models::{FeatureId, PermissionMode, PermissionRule, PermissionValue};

/// The deduplicated grants of one user, and the algorithm that resolves them.
///
/// Built once per evaluation context and never mutated; share it behind an
/// `Arc` across threads.
///
/// For a target feature, the engine visits the target's path ids from most to
/// least specific (member, class, then each enclosing package, innermost
/// first). At each step only grants placed exactly on that id are considered,
/// and of those only the ones relevant to the queried mode:
///
/// * querying VIEWING: VIEWING grants, plus CHANGING + ALLOW
/// * querying CHANGING: CHANGING grants, plus VIEWING + VETO
///
/// The first step with a relevant grant decides, conflicts within the step
/// going to the configured [`EvaluationPolicy`]. No relevant grant anywhere
/// means VETO.
#[derive(Clone)]
pub struct PermissionValueSet {
    values: BTreeSet<PermissionValue>,
    by_feature: BTreeMap<FeatureId, Vec<PermissionValue>>,
    policy: Arc<dyn EvaluationPolicy>,
}

impl PermissionValueSet {
    /// Veto-beats-allow set.
    pub fn new(grants: impl IntoIterator<Item = PermissionValue>) -> Self {
        Self::with_policy(grants, Arc::new(VetoBeatsAllow))
    }

    pub fn with_policy(grants: impl IntoIterator<Item = PermissionValue>, policy: Arc<dyn EvaluationPolicy>) -> Self {
        let values: BTreeSet<PermissionValue> = grants.into_iter().collect();
        let mut by_feature: BTreeMap<FeatureId, Vec<PermissionValue>> = BTreeMap::new();
        // BTreeSet iteration is ordered, so each bucket is too.
        for value in &values {
            by_feature.entry(value.feature_id.clone()).or_default().push(value.clone());
        }
        Self { values, by_feature, policy }
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// ALLOW or VETO for `mode` access to `feature`. Total and side-effect free.
    pub fn evaluate(&self, feature: &FeatureId, mode: PermissionMode) -> PermissionRule {
        self.evaluation(feature, mode)
            .map(|evaluation| evaluation.rule())
            .unwrap_or(PermissionRule::Veto)
    }

    /// The deciding grant, or `None` when nothing applies (which is a VETO).
    pub fn evaluation(&self, feature: &FeatureId, mode: PermissionMode) -> Option<Evaluation> {
        feature.path_ids().iter().find_map(|step| {
            self.by_feature
                .get(step)
                .and_then(|grants| self.policy.evaluate(feature, mode, grants))
        })
    }

    pub fn grants(&self, feature: &FeatureId, mode: PermissionMode) -> bool {
        self.evaluate(feature, mode) == PermissionRule::Allow
    }

    pub fn values(&self) -> impl Iterator<Item = &PermissionValue> {
        self.values.iter()
    }

    pub fn contains(&self, value: &PermissionValue) -> bool {
        self.values.contains(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<PermissionValue> for PermissionValueSet {
    fn from_iter<I: IntoIterator<Item = PermissionValue>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Debug for PermissionValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionValueSet")
            .field("policy", &self.policy.kind())
            .field("values", &self.values)
            .finish()
    }
}
