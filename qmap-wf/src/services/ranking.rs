//! Candidate ranking
//!
//! A [`QualityRanking`] compares two quality scores. [`select_best`] and
//! [`rank_candidates`] turn it into a total order by breaking ties on the
//! archive identifier, then the series instance uid, so the same candidate
//! set yields the same choice in any input order.

use crate::models::{QcRecord, QualityScore};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Injectable quality comparator
pub trait QualityRanking: Send + Sync {
    /// `Greater` when `a` is the better scan
    fn compare(&self, a: &QualityScore, b: &QualityScore) -> Ordering;

    /// Fields a candidate must carry to be ranked at all
    fn required_fields(&self) -> Vec<String>;

    /// Stable identity of the ordering; changes whenever the best of some
    /// candidate set could change
    fn fingerprint(&self) -> String;
}

/// Direction of a ranking field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    Lower,
    Higher,
}

/// One `{ field, prefer }` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    pub prefer: Preference,
}

impl FieldRule {
    pub fn new(field: impl Into<String>, prefer: Preference) -> Self {
        Self {
            field: field.into(),
            prefer,
        }
    }
}

/// Lexicographic ranking over an ordered list of field rules
#[derive(Debug, Clone)]
pub struct FieldRanking {
    rules: Vec<FieldRule>,
}

impl FieldRanking {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }
}

impl QualityRanking for FieldRanking {
    fn compare(&self, a: &QualityScore, b: &QualityScore) -> Ordering {
        for rule in &self.rules {
            // Missing values rank below present ones
            let ord = match (a.get(&rule.field), b.get(&rule.field)) {
                (Some(x), Some(y)) => match rule.prefer {
                    Preference::Lower => y.total_cmp(&x),
                    Preference::Higher => x.total_cmp(&y),
                },
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn required_fields(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.field.clone()).collect()
    }

    fn fingerprint(&self) -> String {
        let canonical: Vec<String> = self
            .rules
            .iter()
            .map(|r| {
                let prefer = match r.prefer {
                    Preference::Lower => "lower",
                    Preference::Higher => "higher",
                };
                format!("{}={}", r.field, prefer)
            })
            .collect();
        qmap_common::fsutil::sha256_hex(canonical.join("\n").as_bytes())
    }
}

/// Total order over candidates, best first
fn best_first(ranking: &dyn QualityRanking, a: &QcRecord, b: &QcRecord) -> Ordering {
    ranking
        .compare(&b.score, &a.score)
        .then_with(|| a.archive.cmp(&b.archive))
        .then_with(|| a.series_instance_uid.cmp(&b.series_instance_uid))
        .then_with(|| a.metadata_key.cmp(&b.metadata_key))
}

/// Candidates sorted best first
pub fn rank_candidates<'a>(ranking: &dyn QualityRanking, candidates: &'a [QcRecord]) -> Vec<&'a QcRecord> {
    let mut ranked: Vec<&QcRecord> = candidates.iter().collect();
    ranked.sort_by(|a, b| best_first(ranking, a, b));
    ranked
}

/// Best candidate, or `None` for an empty set
pub fn select_best<'a>(ranking: &dyn QualityRanking, candidates: &'a [QcRecord]) -> Option<&'a QcRecord> {
    candidates
        .iter()
        .min_by(|a, b| best_first(ranking, a, b))
}
