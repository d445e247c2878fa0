use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::errors::AppError;
use crate::models::{FeatureId, PermissionMode, PermissionRule, PermissionValue};

/// Outcome of evaluating one feature: the grant that decided it and whether access is granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub cause: PermissionValue,
    pub granted: bool,
}

impl Evaluation {
    pub fn granted(cause: &PermissionValue) -> Self {
        Self { cause: cause.clone(), granted: true }
    }

    pub fn refused(cause: &PermissionValue) -> Self {
        Self { cause: cause.clone(), granted: false }
    }

    pub fn rule(&self) -> PermissionRule {
        if self.granted {
            PermissionRule::Allow
        } else {
            PermissionRule::Veto
        }
    }
}

/// Resolves the grants attached to a single specificity step.
///
/// `grants` all sit on the same feature id, one of the target's path ids, and
/// are in their natural order. Returning `None` means "nothing here is
/// relevant", and evaluation moves on to the next, less specific step.
pub trait EvaluationPolicy: Send + Sync {
    fn kind(&self) -> PolicyKind;

    fn evaluate(&self, target: &FeatureId, mode: PermissionMode, grants: &[PermissionValue]) -> Option<Evaluation>;
}

/// Conflicts at the same step are won by VETO. This is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct VetoBeatsAllow;

impl EvaluationPolicy for VetoBeatsAllow {
    fn kind(&self) -> PolicyKind {
        PolicyKind::VetoBeatsAllow
    }

    fn evaluate(&self, target: &FeatureId, mode: PermissionMode, grants: &[PermissionValue]) -> Option<Evaluation> {
        if let Some(veto) = grants.iter().find(|g| g.refutes(target, mode)) {
            return Some(Evaluation::refused(veto));
        }
        grants
            .iter()
            .find(|g| g.implies(target, mode))
            .map(Evaluation::granted)
    }
}

/// Conflicts at the same step are won by ALLOW.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowBeatsVeto;

impl EvaluationPolicy for AllowBeatsVeto {
    fn kind(&self) -> PolicyKind {
        PolicyKind::AllowBeatsVeto
    }

    fn evaluate(&self, target: &FeatureId, mode: PermissionMode, grants: &[PermissionValue]) -> Option<Evaluation> {
        if let Some(allow) = grants.iter().find(|g| g.implies(target, mode)) {
            return Some(Evaluation::granted(allow));
        }
        grants
            .iter()
            .find(|g| g.refutes(target, mode))
            .map(Evaluation::refused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    VetoBeatsAllow,
    AllowBeatsVeto,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::VetoBeatsAllow => "veto_beats_allow",
            PolicyKind::AllowBeatsVeto => "allow_beats_veto",
        }
    }

    pub fn policy(&self) -> Arc<dyn EvaluationPolicy> {
        match self {
            PolicyKind::VetoBeatsAllow => Arc::new(VetoBeatsAllow),
            PolicyKind::AllowBeatsVeto => Arc::new(AllowBeatsVeto),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "veto_beats_allow" => Ok(PolicyKind::VetoBeatsAllow),
            "allow_beats_veto" => Ok(PolicyKind::AllowBeatsVeto),
            other => Err(AppError::configuration(format!("unknown PERMISSIONS_POLICY '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> FeatureId {
        FeatureId::new_class("com.foo.Bar").unwrap()
    }

    fn conflicting() -> Vec<PermissionValue> {
        let mut grants = vec![
            PermissionValue::veto(class(), PermissionMode::Viewing),
            PermissionValue::allow(class(), PermissionMode::Viewing),
        ];
        grants.sort();
        grants
    }

    #[test]
    fn veto_beats_allow_on_conflict() {
        let evaluation = VetoBeatsAllow.evaluate(&class(), PermissionMode::Viewing, &conflicting()).unwrap();
        assert!(!evaluation.granted);
        assert_eq!(evaluation.rule(), PermissionRule::Veto);
        assert_eq!(evaluation.cause.rule, PermissionRule::Veto);
    }

    #[test]
    fn allow_beats_veto_on_conflict() {
        let evaluation = AllowBeatsVeto.evaluate(&class(), PermissionMode::Viewing, &conflicting()).unwrap();
        assert!(evaluation.granted);
        assert_eq!(evaluation.rule(), PermissionRule::Allow);
    }

    #[test]
    fn irrelevant_grants_yield_nothing() {
        // a changing veto says nothing about viewing
        let grants = vec![PermissionValue::veto(class(), PermissionMode::Changing)];
        assert_eq!(VetoBeatsAllow.evaluate(&class(), PermissionMode::Viewing, &grants), None);
        assert_eq!(AllowBeatsVeto.evaluate(&class(), PermissionMode::Viewing, &grants), None);
        assert_eq!(VetoBeatsAllow.evaluate(&class(), PermissionMode::Viewing, &[]), None);
    }

    #[test]
    fn policy_kind_round_trips_through_config_strings() {
        assert_eq!("allow-beats-veto".parse::<PolicyKind>().unwrap(), PolicyKind::AllowBeatsVeto);
        assert_eq!("VETO_BEATS_ALLOW".parse::<PolicyKind>().unwrap(), PolicyKind::VetoBeatsAllow);
        assert!("first_match".parse::<PolicyKind>().is_err());
        assert_eq!(PolicyKind::AllowBeatsVeto.policy().kind(), PolicyKind::AllowBeatsVeto);
    }
}
