//! Readings produced by the inference backend.
//!
//! A `Reading` is immutable once built. The reconciliation loop replaces
//! it wholesale on every successful poll and never edits it in place.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Format the backend uses for timestamps that carry no offset.
pub const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One classifier's verdict for a single sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Predicted label (absent when the backend has no model loaded)
    pub label: Option<String>,
    /// Confidence in the label as a percentage in [0, 100]
    pub confidence: Option<f64>,
    /// When the backend produced the prediction
    pub observed_at: Option<DateTime<Utc>>,
    /// Per-label percentages, when the model exposes probabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<BTreeMap<String, f64>>,
}

impl Classification {
    /// Label for display, falling back to "N/A" when the model gave none.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("N/A")
    }

    /// Check the invariants a decoded classification must hold.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(confidence) = self.confidence {
            if !(0.0..=100.0).contains(&confidence) {
                return Err(format!("confidence {confidence} is outside [0, 100]"));
            }
        }
        if let Some(ref distribution) = self.distribution {
            for (label, pct) in distribution {
                if !pct.is_finite() || *pct < 0.0 || *pct > 100.0 {
                    return Err(format!("percentage {pct} for '{label}' is outside [0, 100]"));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.confidence {
            Some(confidence) => write!(f, "{} ({confidence:.1}%)", self.display_label()),
            None => write!(f, "{}", self.display_label()),
        }
    }
}

/// The latest sensor value with its emotion and workload classifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Galvanic skin response sample
    pub sensor_value: f64,
    /// Emotion classification
    pub emotion: Classification,
    /// Mental workload classification
    pub workload: Classification,
}

impl Reading {
    pub fn validate(&self) -> Result<(), String> {
        if !self.sensor_value.is_finite() {
            return Err(format!("sensor value {} is not finite", self.sensor_value));
        }
        self.emotion
            .validate()
            .map_err(|e| format!("emotion: {e}"))?;
        self.workload
            .validate()
            .map_err(|e| format!("workload: {e}"))?;
        Ok(())
    }
}

/// Interpret a backend timestamp.
///
/// RFC 3339 strings carry their own offset. Naive strings in
/// `NAIVE_TIMESTAMP_FORMAT` are read as local time in `tz`; during a DST
/// fold the earlier instant wins.
pub fn parse_observed_at(raw: &str, tz: Tz) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(raw, NAIVE_TIMESTAMP_FORMAT)
        .map_err(|e| format!("unrecognised timestamp '{raw}': {e}"))?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| format!("timestamp '{raw}' does not exist in {tz}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(confidence: Option<f64>) -> Classification {
        Classification {
            label: Some("Calm".to_string()),
            confidence,
            observed_at: None,
            distribution: None,
        }
    }

    #[test]
    fn test_parse_rfc3339() {
        let parsed = parse_observed_at("2025-03-01T08:30:00+08:00", Tz::UTC).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-03-01T00:30:00+00:00");
    }

    #[test]
    fn test_parse_naive_in_backend_timezone() {
        let parsed = parse_observed_at("2025-03-01 08:30:00", chrono_tz::Asia::Manila).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-03-01T00:30:00+00:00");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_observed_at("yesterday", Tz::UTC).is_err());
    }

    #[test]
    fn test_confidence_range() {
        assert!(classification(Some(87.5)).validate().is_ok());
        assert!(classification(None).validate().is_ok());
        assert!(classification(Some(101.0)).validate().is_err());
        assert!(classification(Some(-1.0)).validate().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(classification(Some(87.54)).to_string(), "Calm (87.5%)");

        let missing = Classification {
            label: None,
            confidence: None,
            observed_at: None,
            distribution: None,
        };
        assert_eq!(missing.to_string(), "N/A");
    }
}
