//! Status documents and snapshots.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A status document as stored in the remote collection.
///
/// Every field is optional on the wire; missing fields read as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eda: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppg: Option<String>,
}

/// The full collection contents delivered by one push.
pub type ChangeSet = Vec<StatusDocument>;

/// Latest coarse state of the subject.
///
/// Overwritten wholesale by each push; no history is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub emotion: String,
    pub eda: String,
    pub ppg: String,
}

impl StatusSnapshot {
    /// Take the first document's fields, or empty defaults when the
    /// collection is empty.
    pub fn from_change_set(changes: &[StatusDocument]) -> Self {
        changes
            .first()
            .map(Self::from_document)
            .unwrap_or_default()
    }

    pub fn from_document(doc: &StatusDocument) -> Self {
        Self {
            emotion: doc.emotion.clone().unwrap_or_default(),
            eda: doc.eda.clone().unwrap_or_default(),
            ppg: doc.ppg.clone().unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.emotion.is_empty() && self.eda.is_empty() && self.ppg.is_empty()
    }
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn or_na(value: &str) -> &str {
            if value.is_empty() {
                "N/A"
            } else {
                value
            }
        }
        write!(
            f,
            "emotion: {}, eda: {}, ppg: {}",
            or_na(&self.emotion),
            or_na(&self.eda),
            or_na(&self.ppg)
        )
    }
}

/// Push channel errors.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// The feed could not be opened
    #[error("Status feed unavailable: {0}")]
    Open(String),
    /// The subscriber fell behind and missed change sets
    #[error("Status feed lagged, {0} change sets dropped")]
    Lagged(u64),
    /// The feed closed the stream
    #[error("Status feed closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_document_wins() {
        let changes = vec![
            StatusDocument {
                id: Some("current".to_string()),
                emotion: Some("Calm".to_string()),
                eda: Some("Normal".to_string()),
                ppg: None,
            },
            StatusDocument {
                emotion: Some("Stressed".to_string()),
                ..StatusDocument::default()
            },
        ];

        let snapshot = StatusSnapshot::from_change_set(&changes);
        assert_eq!(snapshot.emotion, "Calm");
        assert_eq!(snapshot.eda, "Normal");
        assert_eq!(snapshot.ppg, "");
    }

    #[test]
    fn test_empty_collection_gives_defaults() {
        let snapshot = StatusSnapshot::from_change_set(&[]);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.to_string(), "emotion: N/A, eda: N/A, ppg: N/A");
    }

    #[test]
    fn test_document_tolerates_missing_fields() {
        let doc: StatusDocument = serde_json::from_str(r#"{"ppg": "72 bpm"}"#).unwrap();
        assert_eq!(StatusSnapshot::from_document(&doc).ppg, "72 bpm");
    }
}
