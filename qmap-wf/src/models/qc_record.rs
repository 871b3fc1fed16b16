//! Quality-control records and the identifiers they carry

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Subject/session pair, the unit of selection and ledger bookkeeping.
///
/// Serialized as its BIDS label `sub-<subject>_ses-<session>`, which is also
/// the form operators type into the ledger's user-editable lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey {
    pub subject: String,
    pub session: String,
}

impl SessionKey {
    pub fn new(subject: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: session.into(),
        }
    }

    /// BIDS label, e.g. `sub-880852_ses-V02`
    pub fn label(&self) -> String {
        format!("sub-{}_ses-{}", self.subject, self.session)
    }

    /// Parse a BIDS label back into a key
    pub fn parse_label(label: &str) -> Option<Self> {
        let rest = label.trim().strip_prefix("sub-")?;
        let (subject, session) = rest.split_once("_ses-")?;
        if !is_bids_label(subject) || !is_bids_label(session) {
            return None;
        }
        Some(Self::new(subject, session))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}_ses-{}", self.subject, self.session)
    }
}

impl TryFrom<String> for SessionKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_label(&value)
            .ok_or_else(|| format!("'{}' is not a sub-<label>_ses-<label> session key", value))
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.label()
    }
}

/// BIDS labels are non-empty and alphanumeric
pub fn is_bids_label(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Storage key of a DICOM archive
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(pub String);

impl ArchiveId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path component of the key
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named numeric quality measures of one scan.
///
/// Which fields matter and in which direction is decided by the ranking
/// rule, not here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityScore(pub BTreeMap<String, f64>);

impl QualityScore {
    pub fn get(&self, field: &str) -> Option<f64> {
        self.0.get(field).copied()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: f64) {
        self.0.insert(field.into(), value);
    }
}

impl<const N: usize> From<[(&str, f64); N]> for QualityScore {
    fn from(fields: [(&str, f64); N]) -> Self {
        Self(fields.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }
}

/// One scan described by a quality-metadata object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcRecord {
    pub key: SessionKey,
    pub scan_type: String,
    pub archive: ArchiveId,
    pub series_instance_uid: Option<String>,
    pub study_instance_uid: Option<String>,
    pub completed: bool,
    pub score: QualityScore,
    /// Storage key of the metadata object this record came from
    pub metadata_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_label_round_trip() {
        let key = SessionKey::new("880852", "V02");
        assert_eq!(key.label(), "sub-880852_ses-V02");
        assert_eq!(SessionKey::parse_label("sub-880852_ses-V02"), Some(key));
    }

    #[test]
    fn test_session_key_rejects_malformed_labels() {
        assert!(SessionKey::parse_label("880852_V02").is_none());
        assert!(SessionKey::parse_label("sub-_ses-V02").is_none());
        assert!(SessionKey::parse_label("sub-88_0852_ses-V02").is_none());
        assert!(SessionKey::parse_label("sub-880852_ses-").is_none());
    }

    #[test]
    fn test_session_key_serde_as_string() {
        let key = SessionKey::new("S", "1");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"sub-S_ses-1\"");
        let back: SessionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<SessionKey>("\"bogus\"").is_err());
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(ArchiveId::new("site/A_1_V01.tar.gz").file_name(), "A_1_V01.tar.gz");
        assert_eq!(ArchiveId::new("A_1_V01.tar.gz").file_name(), "A_1_V01.tar.gz");
    }
}
