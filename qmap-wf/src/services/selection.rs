//! Selection Engine
//!
//! Combines per-session candidate sets with the ledger into an ordered list
//! of work items. Decisions are pure functions over (candidate set, ledger
//! entry) so they can be tested without storage.
//!
//! Disposition, first match wins:
//!
//! | status                | best vs last committed | action          |
//! |-----------------------|------------------------|-----------------|
//! | to_reprocess          | any                    | forced          |
//! | consider_reprocessing | any                    | skip            |
//! | untouched             | same archive           | skip (done)     |
//! | untouched             | otherwise              | process         |

use crate::models::{ArchiveId, Disposition, QcRecord, SelectionPlan, SessionKey, SkipReason, WorkItem};
use crate::services::ledger::{LedgerDocument, LedgerEntry, LedgerStatus};
use crate::services::ranking::{self, QualityRanking};
use std::collections::BTreeMap;

/// Candidate input for one session
#[derive(Debug, Clone, Default)]
pub struct SessionCandidates {
    /// Archives listed for the session, sorted
    pub listed_archives: Vec<ArchiveId>,
    /// `None` when the metadata was not fetched (decided from the listing)
    pub candidates: Option<Vec<QcRecord>>,
}

/// True when the best candidate is the archive of the last commit
pub fn is_same_archive(entry: Option<&LedgerEntry>, best: &QcRecord) -> bool {
    entry
        .and_then(|e| e.last_archive.as_ref())
        .map(|last| last == &best.archive)
        .unwrap_or(false)
}

/// Disposition of a session with a non-empty candidate set
pub fn disposition(status: LedgerStatus, entry: Option<&LedgerEntry>, best: &QcRecord) -> Disposition {
    match status {
        LedgerStatus::ToReprocess => Disposition::ForceReprocess,
        LedgerStatus::ConsiderReprocessing => Disposition::Skip(SkipReason::UnderConsideration),
        LedgerStatus::Untouched if is_same_archive(entry, best) => {
            Disposition::Skip(SkipReason::AlreadyProcessed)
        }
        LedgerStatus::Untouched => Disposition::Process,
    }
}

/// Decide from the listing alone, before fetching any metadata.
///
/// Sessions under consideration never need their metadata. An untouched,
/// already processed session whose listed archives are exactly those known
/// at its last commit, ranked by the same rules, cannot have a different
/// best candidate.
pub fn prefetch_skip(
    status: LedgerStatus,
    entry: Option<&LedgerEntry>,
    listed_archives: &[ArchiveId],
    ranking_fingerprint: &str,
) -> Option<SkipReason> {
    match status {
        LedgerStatus::ToReprocess => None,
        LedgerStatus::ConsiderReprocessing => Some(SkipReason::UnderConsideration),
        LedgerStatus::Untouched => {
            let entry = entry?;
            entry.last_archive.as_ref()?;
            if entry.ranking_fingerprint.as_deref() != Some(ranking_fingerprint) {
                return None;
            }
            let mut known = entry.known_archives.clone();
            known.sort();
            known.dedup();
            (known == listed_archives).then_some(SkipReason::AlreadyProcessed)
        }
    }
}

/// Listed archives not known at the last commit
pub fn new_archives(entry: Option<&LedgerEntry>, listed_archives: &[ArchiveId]) -> Vec<ArchiveId> {
    match entry {
        Some(e) => listed_archives
            .iter()
            .filter(|a| !e.known_archives.contains(a))
            .cloned()
            .collect(),
        None => listed_archives.to_vec(),
    }
}

/// Build the selection plan.
///
/// Work items are ordered forced first, then fresh, each by session key.
pub fn plan(
    sessions: &BTreeMap<SessionKey, SessionCandidates>,
    ledger: &LedgerDocument,
    ranking: &dyn QualityRanking,
) -> SelectionPlan {
    let mut plan = SelectionPlan::default();
    let fingerprint = ranking.fingerprint();
    let mut forced = Vec::new();
    let mut fresh = Vec::new();

    for (key, input) in sessions {
        let status = ledger.status(key);
        let entry = ledger.sessions.get(key);

        if status == LedgerStatus::ConsiderReprocessing {
            let new = new_archives(entry, &input.listed_archives);
            if !new.is_empty() {
                plan.new_data_under_consideration.push((key.clone(), new));
            }
            plan.skipped.push((key.clone(), SkipReason::UnderConsideration));
            continue;
        }

        let Some(candidates) = &input.candidates else {
            let reason = prefetch_skip(status, entry, &input.listed_archives, &fingerprint)
                .unwrap_or(SkipReason::AlreadyProcessed);
            plan.skipped.push((key.clone(), reason));
            continue;
        };

        let Some(best) = ranking::select_best(ranking, candidates) else {
            tracing::debug!(session = %key, "No usable candidate");
            plan.without_candidates.push(key.clone());
            continue;
        };

        match disposition(status, entry, best) {
            Disposition::Skip(reason) => plan.skipped.push((key.clone(), reason)),
            d => {
                let is_forced = d == Disposition::ForceReprocess;
                tracing::debug!(
                    session = %key,
                    archive = %best.archive,
                    forced = is_forced,
                    "Session selected"
                );
                let item = WorkItem {
                    key: key.clone(),
                    selected: best.clone(),
                    forced: is_forced,
                    previous_archive: entry.and_then(|e| e.last_archive.clone()),
                    listed_archives: input.listed_archives.clone(),
                };
                if is_forced {
                    forced.push(item);
                } else {
                    fresh.push(item);
                }
            }
        }
    }

    plan.work_items = forced;
    plan.work_items.extend(fresh);
    plan
}

/// Keep the first `batch_size` work items; returns the deferred sessions
pub fn apply_batch_limit(plan: &mut SelectionPlan, batch_size: usize) -> Vec<SessionKey> {
    if plan.work_items.len() <= batch_size {
        return Vec::new();
    }
    plan.work_items
        .split_off(batch_size)
        .into_iter()
        .map(|item| item.key)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QualityScore;
    use crate::services::ranking::{FieldRanking, FieldRule, Preference};
    use chrono::Utc;

    fn ranking() -> FieldRanking {
        FieldRanking::new(vec![FieldRule::new("quality", Preference::Higher)])
    }

    fn record(key: &SessionKey, archive: &str, quality: f64) -> QcRecord {
        QcRecord {
            key: key.clone(),
            scan_type: "qMRI".to_string(),
            archive: ArchiveId::new(archive),
            series_instance_uid: None,
            study_instance_uid: None,
            completed: true,
            score: QualityScore::from([("quality", quality)]),
            metadata_key: format!("{}.json", archive),
        }
    }

    fn processed_entry(archive: &str, known: &[&str]) -> LedgerEntry {
        let mut entry = LedgerEntry::new(Utc::now());
        entry.last_archive = Some(ArchiveId::new(archive));
        entry.known_archives = known.iter().map(|a| ArchiveId::new(*a)).collect();
        entry.ranking_fingerprint = Some("rules".to_string());
        entry
    }

    #[test]
    fn test_disposition_table() {
        let key = SessionKey::new("S", "V01");
        let best = record(&key, "B", 0.9);
        let same = processed_entry("B", &["A", "B"]);
        let other = processed_entry("A", &["A"]);

        assert_eq!(
            disposition(LedgerStatus::ToReprocess, Some(&same), &best),
            Disposition::ForceReprocess
        );
        assert_eq!(
            disposition(LedgerStatus::ConsiderReprocessing, Some(&other), &best),
            Disposition::Skip(SkipReason::UnderConsideration)
        );
        assert_eq!(
            disposition(LedgerStatus::Untouched, Some(&same), &best),
            Disposition::Skip(SkipReason::AlreadyProcessed)
        );
        assert_eq!(disposition(LedgerStatus::Untouched, Some(&other), &best), Disposition::Process);
        assert_eq!(disposition(LedgerStatus::Untouched, None, &best), Disposition::Process);
    }

    #[test]
    fn test_prefetch_skip() {
        let listed = vec![ArchiveId::new("A"), ArchiveId::new("B")];
        let entry = processed_entry("B", &["B", "A"]);
        fn skip(status: LedgerStatus, entry: Option<&LedgerEntry>, listed: &[ArchiveId]) -> Option<SkipReason> {
            prefetch_skip(status, entry, listed, "rules")
        }

        assert_eq!(
            skip(LedgerStatus::Untouched, Some(&entry), &listed),
            Some(SkipReason::AlreadyProcessed)
        );
        assert_eq!(skip(LedgerStatus::ToReprocess, Some(&entry), &listed), None);
        assert_eq!(
            skip(LedgerStatus::ConsiderReprocessing, None, &listed),
            Some(SkipReason::UnderConsideration)
        );

        // A new archive appeared
        let more = vec![ArchiveId::new("A"), ArchiveId::new("B"), ArchiveId::new("C")];
        assert_eq!(skip(LedgerStatus::Untouched, Some(&entry), &more), None);

        // Seen but never processed
        let seen = LedgerEntry::new(Utc::now());
        assert_eq!(skip(LedgerStatus::Untouched, Some(&seen), &[]), None);

        // Ranking rules changed, or were never recorded
        assert_eq!(
            prefetch_skip(LedgerStatus::Untouched, Some(&entry), &listed, "other"),
            None
        );
        let mut unrecorded = entry.clone();
        unrecorded.ranking_fingerprint = None;
        assert_eq!(skip(LedgerStatus::Untouched, Some(&unrecorded), &listed), None);
    }

    #[test]
    fn test_plan_orders_forced_first_and_reports_new_data() {
        let s1 = SessionKey::new("1", "V01");
        let s2 = SessionKey::new("2", "V01");
        let s3 = SessionKey::new("3", "V01");
        let s4 = SessionKey::new("4", "V01");

        let mut ledger = LedgerDocument::default();
        ledger.to_reprocess.push(s3.clone());
        ledger.consider_reprocessing.push(s2.clone());
        ledger.sessions.insert(s2.clone(), processed_entry("2A", &["2A"]));
        ledger.sessions.insert(s3.clone(), processed_entry("3A", &["3A"]));

        let mut sessions = BTreeMap::new();
        sessions.insert(
            s1.clone(),
            SessionCandidates {
                listed_archives: vec![ArchiveId::new("1A")],
                candidates: Some(vec![record(&s1, "1A", 0.5)]),
            },
        );
        sessions.insert(
            s2.clone(),
            SessionCandidates {
                listed_archives: vec![ArchiveId::new("2A"), ArchiveId::new("2B")],
                candidates: None,
            },
        );
        sessions.insert(
            s3.clone(),
            SessionCandidates {
                listed_archives: vec![ArchiveId::new("3A")],
                candidates: Some(vec![record(&s3, "3A", 0.5)]),
            },
        );
        sessions.insert(
            s4.clone(),
            SessionCandidates {
                listed_archives: vec![ArchiveId::new("4A")],
                candidates: Some(Vec::new()),
            },
        );

        let result = plan(&sessions, &ledger, &ranking());
        let order: Vec<(&SessionKey, bool)> =
            result.work_items.iter().map(|w| (&w.key, w.forced)).collect();
        assert_eq!(order, vec![(&s3, true), (&s1, false)]);
        assert_eq!(result.skipped, vec![(s2.clone(), SkipReason::UnderConsideration)]);
        assert_eq!(result.without_candidates, vec![s4]);
        assert_eq!(result.new_data_under_consideration, vec![(s2, vec![ArchiveId::new("2B")])]);
    }

    #[test]
    fn test_batch_limit_defers_tail() {
        let mut plan = SelectionPlan::default();
        for n in 1..=3 {
            let key = SessionKey::new(n.to_string(), "V01");
            plan.work_items.push(WorkItem {
                selected: record(&key, "A", 0.5),
                key,
                forced: false,
                previous_archive: None,
                listed_archives: Vec::new(),
            });
        }
        let deferred = apply_batch_limit(&mut plan, 2);
        assert_eq!(plan.work_items.len(), 2);
        assert_eq!(deferred, vec![SessionKey::new("3", "V01")]);
        assert!(apply_batch_limit(&mut plan, 5).is_empty());
    }
}
