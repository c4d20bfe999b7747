//! AOI-level reduction of per-cell transition records.
use serde::{Deserialize, Serialize};

use crate::rules::TransitionRule;
use crate::transitions::TransitionRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub rule: String,
    /// Σ n_match over every record.
    pub total_match: u64,
    /// Σ n_origin over every record.
    pub total_origin: u64,
    /// Cell with the largest n_match; ties go to the smallest grid_id.
    /// None when `total_match` is 0.
    pub max_cell: Option<u32>,
    /// n_match of `max_cell`, 0 when there is none.
    pub max_cell_match: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub n_cells: usize,
    pub n_valid: u64,
    pub rules: Vec<RuleSummary>,
}

impl SummaryStatistics {
    pub fn rule(&self, name: &str) -> Option<&RuleSummary> {
        self.rules.iter().find(|r| r.rule == name)
    }
}

/// Reduce `records` for each rule in `rules`.
///
/// Rule counts are looked up by name, so records produced with a
/// superset of `rules` summarise correctly. The result does not depend on
/// the order of `records`.
pub fn summarize(records: &[TransitionRecord], rules: &[TransitionRule]) -> SummaryStatistics {
    let summaries = rules
        .iter()
        .map(|rule| {
            let mut total_match = 0u64;
            let mut total_origin = 0u64;
            let mut best: Option<(u64, u32)> = None;

            for record in records {
                let Some(counts) = record.rule(&rule.name) else { continue };
                total_match += counts.n_match;
                total_origin += counts.n_origin;
                let better = match best {
                    None => true,
                    Some((n, id)) => counts.n_match > n || (counts.n_match == n && record.grid_id < id),
                };
                if better {
                    best = Some((counts.n_match, record.grid_id));
                }
            }

            let (max_cell, max_cell_match) = match best {
                Some((n, id)) if total_match > 0 => (Some(id), n),
                _ => (None, 0),
            };
            RuleSummary { rule: rule.name.clone(), total_match, total_origin, max_cell, max_cell_match }
        })
        .collect();

    SummaryStatistics {
        n_cells: records.len(),
        n_valid: records.iter().map(|r| r.n_valid).sum(),
        rules: summaries,
    }
}
