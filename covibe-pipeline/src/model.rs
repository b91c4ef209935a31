//! Core records: submissions moving through the pipeline and the
//! released features they produce.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a submission.
///
/// ```text
/// RECEIVED → REVIEWING → APPROVED → GENERATING → BUILT → RELEASING → RELEASED
///                      ↘ REJECTED             ↘ FAILED            ↘ FAILED
/// any non-terminal → CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Received,
    Reviewing,
    Approved,
    Rejected,
    Generating,
    Built,
    Releasing,
    Released,
    Failed,
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Received,
        Status::Reviewing,
        Status::Approved,
        Status::Rejected,
        Status::Generating,
        Status::Built,
        Status::Releasing,
        Status::Released,
        Status::Failed,
        Status::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Received => "RECEIVED",
            Status::Reviewing => "REVIEWING",
            Status::Approved => "APPROVED",
            Status::Rejected => "REJECTED",
            Status::Generating => "GENERATING",
            Status::Built => "BUILT",
            Status::Releasing => "RELEASING",
            Status::Released => "RELEASED",
            Status::Failed => "FAILED",
            Status::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Released | Status::Rejected | Status::Failed | Status::Cancelled
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

/// Review verdict recorded once by the review stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub approved: bool,
    pub reason: String,
    pub scores: BTreeMap<String, u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_approach: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// How the build stage obtained an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactApproach {
    /// Deterministic edit of the existing site sources.
    SitePatch,
    /// Provider output accepted as-is.
    Provider,
    /// Provider output accepted after rewriting its registration.
    ProviderRepaired,
    /// Inert placeholder synthesized after the provider path failed.
    Fallback,
}

impl ArtifactApproach {
    pub fn is_fallback(self) -> bool {
        self == ArtifactApproach::Fallback
    }
}

/// Build output descriptor, written once by the build stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub module_type: String,
    pub approach: ArtifactApproach,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Provider calls made (0 for site patches).
    #[serde(default)]
    pub attempts: u32,
    /// Hex SHA-256 of the feature file contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Which publish strategy made the artifact durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    Git,
    Api,
    Local,
    /// Promoted by the reconciliation sweep after a crash.
    Reconciled,
}

impl fmt::Display for UploadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStrategy::Git => "git",
            UploadStrategy::Api => "api",
            UploadStrategy::Local => "local",
            UploadStrategy::Reconciled => "reconciled",
        };
        f.write_str(s)
    }
}

/// Publish record, written once by the release stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub strategy: UploadStrategy,
    pub branch: String,
    pub released_at: DateTime<Utc>,
}

/// One user request and its pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: i64,
    pub request: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub review: Option<Review>,
    #[serde(default)]
    pub artifact: Option<Artifact>,
    #[serde(default)]
    pub feature_file: Option<String>,
    #[serde(default, rename = "usedAI")]
    pub used_ai: Option<bool>,
    #[serde(default)]
    pub release: Option<ReleaseRecord>,
    #[serde(default)]
    pub error: Option<String>,
    /// Optimistic concurrency counter, bumped on every successful save.
    /// Kept in the store row, never in the document.
    #[serde(default, skip_serializing)]
    pub version: u64,
}

impl Submission {
    pub fn new(id: i64, request: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            status: Status::Received,
            created_at: now,
            updated_at: now,
            review: None,
            artifact: None,
            feature_file: None,
            used_ai: None,
            release: None,
            error: None,
            version: 0,
        }
    }

    /// Move to a non-failure state. Clears any previous error.
    pub fn advance(&mut self, status: Status) {
        self.status = status;
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Move to FAILED with an error code.
    pub fn fail(&mut self, code: impl Into<String>) {
        self.status = Status::Failed;
        self.error = Some(code.into());
        self.updated_at = Utc::now();
    }

    pub fn is_site_patch(&self) -> bool {
        self.artifact
            .as_ref()
            .is_some_and(|a| a.approach == ArtifactApproach::SitePatch)
    }
}

/// Publicly visible record of a shipped artifact. `id` is the owning
/// submission's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasedFeature {
    pub id: i64,
    pub module_type: String,
    pub request: String,
    pub feature_file: String,
    #[serde(default, rename = "usedAI")]
    pub used_ai: bool,
    pub released_at: DateTime<Utc>,
}
