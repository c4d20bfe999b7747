//! Class-transition rules.
//!
//! A rule names an origin class set `O` and a destination exclusion set `X`.
//! A valid pixel matches iff `before ∈ O` and `after ∉ X`.
use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::classes::LandCoverClass;
use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    /// Column-safe identifier, used as the prefix of output columns.
    pub name: String,
    pub origin: BTreeSet<i32>,
    pub exclude: BTreeSet<i32>,
}

impl TransitionRule {
    pub fn new(
        name: impl Into<String>,
        origin: impl IntoIterator<Item = i32>,
        exclude: impl IntoIterator<Item = i32>,
    ) -> Self {
        Self {
            name: name.into(),
            origin: origin.into_iter().collect(),
            exclude: exclude.into_iter().collect(),
        }
    }

    /// Trees to anything other than trees.
    pub fn forest_loss() -> Self {
        let trees = LandCoverClass::Trees.code();
        Self::new("forest_loss", [trees], [trees])
    }

    /// Shrub and scrub to anything other than trees or shrub.
    pub fn shrub_degradation() -> Self {
        let trees = LandCoverClass::Trees.code();
        let shrub = LandCoverClass::ShrubAndScrub.code();
        Self::new("shrub_degradation", [shrub], [trees, shrub])
    }

    pub fn builtin() -> Vec<Self> {
        vec![Self::forest_loss(), Self::shrub_degradation()]
    }

    #[inline]
    pub fn is_origin(&self, before: i32) -> bool {
        self.origin.contains(&before)
    }

    #[inline]
    pub fn matches(&self, before: i32, after: i32) -> bool {
        self.origin.contains(&before) && !self.exclude.contains(&after)
    }

    pub fn validate(&self) -> Result<()> {
        let field = || format!("rules.{}", self.name);
        if self.name.is_empty() {
            return Err(AnalysisError::parameter("rules", "rule name is empty"));
        }
        if !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(AnalysisError::parameter(
                field(),
                "name may only contain ASCII letters, digits, `_` and `-`",
            ));
        }
        if self.origin.is_empty() {
            return Err(AnalysisError::parameter(field(), "origin class set is empty"));
        }
        if let Some(c) = self.origin.iter().chain(self.exclude.iter()).find(|&&c| c < 0) {
            return Err(AnalysisError::parameter(field(), format!("class code {c} is negative")));
        }
        Ok(())
    }
}

/// Validate a whole rule list: each rule, plus unique names.
pub fn validate_rules(rules: &[TransitionRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        rule.validate()?;
        if !seen.insert(rule.name.as_str()) {
            return Err(AnalysisError::parameter(
                "rules",
                format!("rule name `{}` appears more than once", rule.name),
            ));
        }
    }
    Ok(())
}
