//! Release stage: BUILT → RELEASING → RELEASED | FAILED, plus the
//! reconciliation sweep over items a crash left in RELEASING.
//!
//! The feature record is written before the upload so readers see the
//! release optimistically; any path that does not end in RELEASED rolls the
//! record back to what it was before. A crash between the two leaves the
//! item in RELEASING, which [`ReleaseStage::reconcile`] resolves.

pub mod publish;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::config::PipelineConfig;
use crate::gate::{self, Commit};
use crate::model::{ReleaseRecord, ReleasedFeature, Status, Submission, UploadStrategy};
use crate::store::{Store, StoreError};

use self::publish::{PublishError, PublishRequest, Publisher};

/// Error code for an item stuck in RELEASING past the staleness threshold
/// with no feature record to show for it.
pub const STALE_RELEASE_ERROR: &str = "RELEASE_STALE_NO_FEATURE";

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("FEATURE_FILE_NOT_FOUND:{0}")]
    FeatureFileNotFound(String),
    #[error("MISSING_BUILD_ARTIFACT")]
    MissingArtifact,
    #[error("RELEASE_IO:{0}")]
    Io(#[from] std::io::Error),
}

pub struct ReleaseStage {
    store: Arc<Store>,
    publisher: Arc<dyn Publisher>,
    config: PipelineConfig,
}

impl ReleaseStage {
    pub fn new(store: Arc<Store>, publisher: Arc<dyn Publisher>, config: PipelineConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Reconcile, then release every built item. Returns how many items
    /// were touched.
    pub async fn run(&self) -> Result<usize, StoreError> {
        let mut touched = self.reconcile()?;

        let pending = self.store.list_by_status(&[Status::Built])?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Releasing built submissions");
        }
        for submission in pending {
            let id = submission.id;
            let submission = match gate::commit(&self.store, id, &[Status::Built], |s| {
                s.advance(Status::Releasing)
            })? {
                Commit::Applied(s) => s,
                Commit::Cancelled => {
                    tracing::info!(submission_id = id, "Cancelled before release, skipping");
                    continue;
                }
                Commit::Moved(status) => {
                    tracing::debug!(submission_id = id, %status, "No longer awaiting release");
                    continue;
                }
            };
            touched += 1;

            if let Err(e) = self.release_one(&submission).await {
                let code = e.to_string();
                tracing::error!(submission_id = id, error = %code, "Release failed");
                gate::commit(&self.store, id, &[Status::Releasing], |s| {
                    s.fail(code.clone())
                })?;
            }
        }
        Ok(touched)
    }

    /// Repair state a crash left behind:
    /// - RELEASING with a feature record → RELEASED (upload finished, status
    ///   write did not);
    /// - RELEASING without one past the staleness threshold → FAILED;
    /// - feature records owned by a cancelled, failed or rejected
    ///   submission are removed.
    pub fn reconcile(&self) -> Result<usize, StoreError> {
        let mut touched = 0;
        let now = Utc::now();

        for submission in self.store.list_by_status(&[Status::Releasing])? {
            let id = submission.id;
            if self.store.get_feature(id)?.is_some() {
                let record = ReleaseRecord {
                    strategy: UploadStrategy::Reconciled,
                    branch: self.publisher.branch().to_string(),
                    released_at: now,
                };
                if let Commit::Applied(_) = gate::commit(&self.store, id, &[Status::Releasing], |s| {
                    s.release = Some(record.clone());
                    s.advance(Status::Released);
                })? {
                    tracing::warn!(submission_id = id, "Reconciled stuck release to RELEASED");
                    touched += 1;
                }
                continue;
            }

            let age = (now - submission.updated_at).to_std().unwrap_or_default();
            if age >= self.config.stale_release_after {
                if let Commit::Applied(_) = gate::commit(&self.store, id, &[Status::Releasing], |s| {
                    s.fail(STALE_RELEASE_ERROR)
                })? {
                    tracing::error!(
                        submission_id = id,
                        age_secs = age.as_secs(),
                        "Stale release without feature, marked FAILED"
                    );
                    touched += 1;
                }
            }
        }

        for feature in self.store.list_features()? {
            let owner = self.store.get_submission(feature.id)?;
            let orphaned = owner.as_ref().is_none_or(|s| {
                matches!(
                    s.status,
                    Status::Cancelled | Status::Failed | Status::Rejected
                )
            });
            if orphaned {
                self.store.remove_feature(feature.id)?;
                tracing::warn!(
                    submission_id = feature.id,
                    status = ?owner.map(|s| s.status),
                    "Removed orphaned feature record"
                );
            }
        }
        Ok(touched)
    }

    async fn release_one(&self, submission: &Submission) -> Result<(), ReleaseError> {
        let id = submission.id;
        let artifact = submission
            .artifact
            .as_ref()
            .ok_or(ReleaseError::MissingArtifact)?;

        let mut files: Vec<PathBuf> = Vec::new();
        // Some(previous) once the feature record has been upserted.
        let mut upserted: Option<Option<ReleasedFeature>> = None;

        if submission.is_site_patch() {
            files.extend(artifact.changed_files.iter().map(PathBuf::from));
        } else {
            let file = submission
                .feature_file
                .clone()
                .ok_or(ReleaseError::MissingArtifact)?;
            let local = self.config.features_dir.join(&file);
            if !tokio::fs::try_exists(&local).await? {
                return Err(ReleaseError::FeatureFileNotFound(file));
            }
            if gate::is_cancelled(&self.store, id)? {
                tracing::info!(submission_id = id, "Cancelled during release, nothing written");
                return Ok(());
            }
            let feature = ReleasedFeature {
                id,
                module_type: artifact.module_type.clone(),
                request: submission.request.clone(),
                feature_file: file,
                used_ai: submission.used_ai.unwrap_or(false),
                released_at: Utc::now(),
            };
            upserted = Some(self.store.upsert_feature(&feature)?);
            files.push(repo_relative(&self.config.site_dir, &local));
        }

        let outcome = self.publish_and_commit(submission, files).await;
        let keep = matches!(outcome, Ok(true));
        if !keep && let Some(previous) = upserted {
            self.compensate(id, previous.as_ref())?;
        }
        outcome.map(|_| ())
    }

    /// Upload and write RELEASED. `Ok(false)` when the item was cancelled
    /// along the way.
    async fn publish_and_commit(
        &self,
        submission: &Submission,
        mut files: Vec<PathBuf>,
    ) -> Result<bool, ReleaseError> {
        let id = submission.id;
        files.extend(self.store.export_snapshot(&self.config.site_dir)?);

        if gate::is_cancelled(&self.store, id)? {
            tracing::info!(submission_id = id, "Cancelled before upload");
            return Ok(false);
        }

        let strategy = self
            .publisher
            .publish(&PublishRequest::new(id, files))
            .await?;

        let record = ReleaseRecord {
            strategy,
            branch: self.publisher.branch().to_string(),
            released_at: Utc::now(),
        };
        match gate::commit(&self.store, id, &[Status::Releasing], |s| {
            s.release = Some(record.clone());
            s.advance(Status::Released);
        })? {
            Commit::Applied(_) => {
                tracing::info!(
                    submission_id = id,
                    strategy = %strategy,
                    branch = %record.branch,
                    "RELEASED"
                );
                Ok(true)
            }
            Commit::Cancelled => {
                tracing::info!(submission_id = id, "Cancelled during upload");
                Ok(false)
            }
            Commit::Moved(status) => {
                tracing::warn!(submission_id = id, %status, "Submission moved during release");
                Ok(false)
            }
        }
    }

    /// Undo the optimistic feature write.
    fn compensate(&self, id: i64, previous: Option<&ReleasedFeature>) -> Result<(), StoreError> {
        self.store.rollback_feature(id, previous)?;
        if let Err(e) = self.store.export_snapshot(&self.config.site_dir) {
            tracing::warn!(submission_id = id, error = %e, "Snapshot refresh after rollback failed");
        }
        tracing::info!(
            submission_id = id,
            restored = previous.is_some(),
            "Rolled back feature record"
        );
        Ok(())
    }
}

/// `path` relative to `root` when it lives under it; unchanged otherwise.
fn repo_relative(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
