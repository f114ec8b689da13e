//! Stage outcomes.
//!
//! One [`Outcome`] is produced per stage attempt; the final attempt's outcome
//! is what lands in `<logs_root>/<node_id>/status.json`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::FailureClass;

/// Meta key carrying the failure class across handler boundaries.
pub const META_FAILURE_CLASS: &str = "failure_class";
/// Meta key carrying the stable failure signature.
pub const META_FAILURE_SIGNATURE: &str = "failure_signature";
/// Meta key set when a stage was killed by a timeout.
pub const META_TIMEOUT: &str = "timeout";

/// Status of one stage attempt.
///
/// `Custom` carries user-defined routing labels (e.g. `needs_dod`) that the
/// next-hop resolver matches against edge conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    PartialSuccess,
    Fail,
    Retry,
    Custom(String),
}

impl Status {
    /// Stable string form used in conditions, status.json and progress events.
    pub fn as_str(&self) -> &str {
        match self {
            Status::Success => "success",
            Status::PartialSuccess => "partial_success",
            Status::Fail => "fail",
            Status::Retry => "retry",
            Status::Custom(label) => label.as_str(),
        }
    }

    pub fn parse(s: &str) -> Status {
        match s {
            "success" => Status::Success,
            "partial_success" => Status::PartialSuccess,
            "fail" => Status::Fail,
            "retry" => Status::Retry,
            other => Status::Custom(other.to_string()),
        }
    }

    /// True for statuses the retry gate treats as failures.
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Fail | Status::Retry)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        Ok(Status::parse(&s))
    }
}

/// Result of one stage attempt.
///
/// Invariant: `failure_reason` is non-empty iff `status` is [`Status::Fail`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_updates: BTreeMap<String, Value>,
}

impl Outcome {
    pub fn success() -> Self {
        Outcome {
            status: Status::Success,
            failure_reason: None,
            notes: None,
            meta: BTreeMap::new(),
            context_updates: BTreeMap::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Outcome {
            status: Status::Fail,
            failure_reason: Some(reason.into()),
            notes: None,
            meta: BTreeMap::new(),
            context_updates: BTreeMap::new(),
        }
    }

    /// Failure outcome stamped with class and signature, both in `meta` and
    /// (class only) in `context_updates` so downstream stages can observe it.
    pub fn classified_fail(
        reason: impl Into<String>,
        class: FailureClass,
        signature: impl Into<String>,
    ) -> Self {
        let mut out = Outcome::fail(reason);
        out.meta
            .insert(META_FAILURE_CLASS.into(), Value::String(class.as_str().into()));
        out.meta.insert(
            META_FAILURE_SIGNATURE.into(),
            Value::String(signature.into()),
        );
        out.context_updates
            .insert(META_FAILURE_CLASS.into(), Value::String(class.as_str().into()));
        out
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Failure class from `meta`, if a handler stamped one.
    pub fn failure_class(&self) -> Option<FailureClass> {
        self.meta
            .get(META_FAILURE_CLASS)
            .and_then(|v| v.as_str())
            .and_then(FailureClass::parse)
    }

    pub fn failure_signature(&self) -> Option<&str> {
        self.meta.get(META_FAILURE_SIGNATURE).and_then(|v| v.as_str())
    }
}

/// Terminal verdict for the whole run, written to `<logs_root>/final.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalOutcome {
    pub status: FinalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    Partial,
    Fail,
}

impl FinalOutcome {
    pub fn success() -> Self {
        FinalOutcome {
            status: FinalStatus::Success,
            failure_reason: None,
        }
    }

    pub fn partial() -> Self {
        FinalOutcome {
            status: FinalStatus::Partial,
            failure_reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        FinalOutcome {
            status: FinalStatus::Fail,
            failure_reason: Some(reason.into()),
        }
    }
}
