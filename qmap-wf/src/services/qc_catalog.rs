//! QC Catalog Builder
//!
//! Turns listed quality-metadata objects into per-session candidate sets.
//! Everything here is a pure transform; fetching the object bodies is the
//! run coordinator's job.
//!
//! Two steps:
//! 1. [`group_listing`] groups listed objects by the session encoded in the
//!    object name and derives the archive of each object.
//! 2. [`parse_metadata`] turns one fetched body into candidate [`QcRecord`]s.

use crate::config::CatalogConfig;
use crate::error::CatalogError;
use crate::models::qc_record::is_bids_label;
use crate::models::{ArchiveId, MalformedReport, QcRecord, QualityScore, SessionKey};
use crate::services::collaborators::ObjectInfo;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A listed metadata object with the archive it describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub info: ObjectInfo,
    pub archive: ArchiveId,
}

/// Listing grouped by session, before any body is fetched
#[derive(Debug, Clone, Default)]
pub struct ListingIndex {
    pub sessions: BTreeMap<SessionKey, Vec<ListedObject>>,
    pub malformed: Vec<MalformedReport>,
    /// Objects younger than the minimum age
    pub too_recent: usize,
}

impl ListingIndex {
    /// Archives listed for `key`, sorted and deduplicated
    pub fn archives(&self, key: &SessionKey) -> Vec<ArchiveId> {
        let mut archives: Vec<ArchiveId> = self
            .sessions
            .get(key)
            .map(|objs| objs.iter().map(|o| o.archive.clone()).collect())
            .unwrap_or_default();
        archives.sort();
        archives.dedup();
        archives
    }
}

/// Candidates and rejected scans from one metadata body
#[derive(Debug, Clone, Default)]
pub struct ParsedMetadata {
    pub candidates: Vec<QcRecord>,
    pub malformed: Vec<CatalogError>,
}

// ============================================================================
// Listing
// ============================================================================

/// Session encoded in a metadata object name.
///
/// `<site>_<subject>_<session>[_...]<suffix>`; the session field must start
/// with `V` and is cut at the first `.`.
pub fn parse_object_name(key: &str, metadata_suffix: &str) -> Result<SessionKey, CatalogError> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let stem = file_name
        .strip_suffix(metadata_suffix)
        .ok_or_else(|| CatalogError::UnparseableName(key.to_string()))?;

    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return Err(CatalogError::UnparseableName(key.to_string()));
    }
    let subject = parts[1];
    let session = parts[2].split('.').next().unwrap_or(parts[2]);

    if !session.starts_with('V') || !is_bids_label(subject) || !is_bids_label(session) {
        return Err(CatalogError::UnparseableName(key.to_string()));
    }
    Ok(SessionKey::new(subject, session))
}

/// Archive next to a metadata object
pub fn archive_for(key: &str, config: &CatalogConfig) -> ArchiveId {
    let base = key.strip_suffix(&config.metadata_suffix).unwrap_or(key);
    ArchiveId::new(format!("{}{}", base, config.archive_suffix))
}

/// Group listed objects by session.
///
/// Objects younger than `min_age_hours` (relative to `now`) are counted and
/// left out. Unparseable names are reported as malformed.
pub fn group_listing(
    objects: Vec<ObjectInfo>,
    config: &CatalogConfig,
    min_age_hours: u64,
    now: DateTime<Utc>,
) -> ListingIndex {
    let mut index = ListingIndex::default();

    for info in objects {
        if !info.key.ends_with(&config.metadata_suffix) {
            continue;
        }
        if !qmap_common::time::is_at_least_hours_old(info.last_modified, min_age_hours, now) {
            tracing::debug!(key = %info.key, "Metadata object too recent, deferring");
            index.too_recent += 1;
            continue;
        }

        match parse_object_name(&info.key, &config.metadata_suffix) {
            Ok(key) => {
                let archive = archive_for(&info.key, config);
                index
                    .sessions
                    .entry(key)
                    .or_default()
                    .push(ListedObject { info, archive });
            }
            Err(e) => {
                tracing::warn!(key = %info.key, error = %e, "Skipping malformed metadata object");
                index.malformed.push(MalformedReport {
                    metadata_key: info.key,
                    reason: e.to_string(),
                });
            }
        }
    }

    for objs in index.sessions.values_mut() {
        objs.sort_by(|a, b| a.info.key.cmp(&b.info.key));
    }
    index
}

// ============================================================================
// Metadata bodies
// ============================================================================

/// Scan objects of a metadata body.
///
/// Accepted shapes: `[ {scan} ]`, `[ [ {scan}, ... ] ]`, `{scan}` and
/// `[ {scan}, ... ]`. Only the first element of a top-level array that wraps
/// an array is used.
pub fn scan_objects(body: &Value) -> Result<Vec<&Map<String, Value>>, CatalogError> {
    let items: Vec<&Value> = match body {
        Value::Object(_) => vec![body],
        Value::Array(outer) => match outer.first() {
            Some(Value::Array(inner)) => inner.iter().collect(),
            Some(_) => outer.iter().collect(),
            None => Vec::new(),
        },
        _ => Vec::new(),
    };

    let scans: Vec<&Map<String, Value>> = items.iter().filter_map(|v| v.as_object()).collect();
    if scans.is_empty() {
        return Err(CatalogError::NoScans);
    }
    Ok(scans)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_opt_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn is_completed(scan: &Map<String, Value>) -> Result<bool, CatalogError> {
    match scan.get("Completed") {
        None | Some(Value::Null) => Err(CatalogError::MissingField("Completed".to_string())),
        Some(Value::Bool(b)) => Ok(*b),
        Some(v) => as_number(v)
            .map(|n| n == 1.0)
            .ok_or_else(|| CatalogError::NotNumeric {
                field: "Completed".to_string(),
            }),
    }
}

/// Candidate records from one fetched metadata body.
///
/// A scan is a candidate when its `SeriesType` is the QALAS series type and
/// it is completed. A QALAS scan missing `Completed` or a ranked field is
/// rejected; other series types are ignored.
pub fn parse_metadata(
    key: &SessionKey,
    object: &ListedObject,
    bytes: &[u8],
    config: &CatalogConfig,
    required_fields: &[String],
) -> Result<ParsedMetadata, CatalogError> {
    let body: Value =
        serde_json::from_slice(bytes).map_err(|e| CatalogError::InvalidJson(e.to_string()))?;
    let scans = scan_objects(&body)?;

    let mut parsed = ParsedMetadata::default();
    for scan in scans {
        let series_type = scan.get("SeriesType").and_then(Value::as_str);
        if series_type != Some(config.qalas_series_type.as_str()) {
            continue;
        }

        match candidate_from_scan(key, object, scan, config, required_fields) {
            Ok(Some(record)) => parsed.candidates.push(record),
            Ok(None) => {}
            Err(e) => parsed.malformed.push(e),
        }
    }
    Ok(parsed)
}

fn candidate_from_scan(
    key: &SessionKey,
    object: &ListedObject,
    scan: &Map<String, Value>,
    config: &CatalogConfig,
    required_fields: &[String],
) -> Result<Option<QcRecord>, CatalogError> {
    if !is_completed(scan)? {
        return Ok(None);
    }

    let mut score = QualityScore::default();
    for field in required_fields {
        let value = scan
            .get(field)
            .filter(|v| !v.is_null())
            .ok_or_else(|| CatalogError::MissingField(field.clone()))?;
        let n = as_number(value).ok_or_else(|| CatalogError::NotNumeric {
            field: field.clone(),
        })?;
        score.insert(field.clone(), n);
    }
    // Other numeric fields ride along for reporting and custom rankings
    for (field, value) in scan {
        if field == "Completed" || score.get(field).is_some() {
            continue;
        }
        if let Value::Number(n) = value {
            if let Some(f) = n.as_f64() {
                score.insert(field.clone(), f);
            }
        }
    }

    Ok(Some(QcRecord {
        key: key.clone(),
        scan_type: config.qalas_series_type.clone(),
        archive: object.archive.clone(),
        series_instance_uid: as_opt_string(scan.get("SeriesInstanceUID")),
        study_instance_uid: as_opt_string(scan.get("StudyInstanceUID")),
        completed: true,
        score,
        metadata_key: object.info.key.clone(),
    }))
}
