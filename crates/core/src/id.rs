//! Strongly-typed identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PhaseError;

/// Identifier of the subject a logical unit integrates (e.g. a seller account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Validate and wrap a subject identifier.
    ///
    /// Subject ids become part of queue keys, so they must be non-empty and
    /// free of whitespace and the `:` unit separator.
    pub fn new(value: impl Into<String>) -> Result<Self, PhaseError> {
        let value = value.into();
        if value.is_empty() {
            return Err(PhaseError::invalid_id("subject id is empty"));
        }
        if value.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(PhaseError::invalid_id(format!(
                "subject id contains whitespace or ':': {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SubjectId {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identity of a logical unit: a subject plus an optional region sub-key.
///
/// Rendered as `subject` or `subject:region`; this string is the parent id
/// from which every phase job id is derived.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub subject_id: SubjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl UnitKey {
    pub fn new(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            region: None,
        }
    }

    pub fn with_region(subject_id: SubjectId, region: impl Into<String>) -> Self {
        Self {
            subject_id,
            region: Some(region.into()),
        }
    }

    /// The parent id string (`subject` or `subject:region`).
    pub fn parent_id(&self) -> String {
        self.to_string()
    }
}

impl core::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}:{}", self.subject_id, region),
            None => write!(f, "{}", self.subject_id),
        }
    }
}

impl FromStr for UnitKey {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((subject, region)) if !region.is_empty() => {
                Ok(Self::with_region(SubjectId::new(subject)?, region))
            }
            Some(_) => Err(PhaseError::invalid_id(format!("empty region in {s:?}"))),
            None => Ok(Self::new(SubjectId::new(s)?)),
        }
    }
}

/// Identifier of one phase job, deterministically derived from its parent
/// unit and phase (see [`crate::PhaseRegistry::job_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap a raw job id (e.g. read back from a queue backend).
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of one run of a unit's phase chain (first phase to last).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new run identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RunId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RunId {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| PhaseError::invalid_id(format!("RunId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_id_rejects_separators() {
        assert!(SubjectId::new("user-42").is_ok());
        assert!(SubjectId::new("").is_err());
        assert!(SubjectId::new("user 42").is_err());
        assert!(SubjectId::new("user:42").is_err());
    }

    #[test]
    fn unit_key_round_trips_through_display() {
        let plain: UnitKey = "user-42".parse().unwrap();
        assert_eq!(plain.region, None);
        assert_eq!(plain.parent_id(), "user-42");

        let regional: UnitKey = "user-42:DE".parse().unwrap();
        assert_eq!(regional.region.as_deref(), Some("DE"));
        assert_eq!(regional.to_string(), "user-42:DE");

        assert!("user-42:".parse::<UnitKey>().is_err());
    }
}
