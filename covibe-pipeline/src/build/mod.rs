//! Build stage: APPROVED → GENERATING → BUILT | FAILED.
//!
//! Site-change requests go through a structural patch; everything else asks
//! the build provider for a feature module, validates it against the
//! contract and falls back to an inert placeholder when the provider path
//! cannot produce a valid one.

pub mod contract;
pub mod patch;
pub mod provider;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;
use crate::gate::{self, Commit};
use crate::model::{Artifact, ArtifactApproach, Status, Submission};
use crate::store::{Store, StoreError};

use self::patch::PatchError;
use self::provider::BuildProvider;

/// Template family a generated module belongs to, inferred from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Todo,
    Timer,
    Counter,
    Note,
    Picker,
    Custom,
}

impl ModuleKind {
    // Timer before counter: "countdown" contains "count".
    const KEYWORDS: [(ModuleKind, &'static [&'static str]); 5] = [
        (ModuleKind::Todo, &["todo", "to-do", "task list", "checklist", "待办"]),
        (
            ModuleKind::Timer,
            &["timer", "countdown", "stopwatch", "pomodoro", "计时"],
        ),
        (ModuleKind::Counter, &["counter", "count", "tally", "计数"]),
        (ModuleKind::Note, &["note", "memo", "notepad", "笔记", "便签"]),
        (
            ModuleKind::Picker,
            &["picker", "random", "pick", "choose", "lottery", "抽签", "随机"],
        ),
    ];

    pub fn classify(request: &str) -> Self {
        let lower = request.to_lowercase();
        Self::KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map_or(ModuleKind::Custom, |(kind, _)| *kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Todo => "todo",
            ModuleKind::Timer => "timer",
            ModuleKind::Counter => "counter",
            ModuleKind::Note => "note",
            ModuleKind::Picker => "picker",
            ModuleKind::Custom => "custom",
        }
    }
}

/// Module identifier a generated feature must register under.
pub fn module_id(submission_id: i64, request: &str) -> String {
    format!("{}-{submission_id}", ModuleKind::classify(request).as_str())
}

pub fn feature_file_name(submission_id: i64) -> String {
    format!("feature-{submission_id}.js")
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("FEATURE_WRITE_FAILED:{0}")]
    Io(#[from] std::io::Error),
}

/// Source text and provenance of a generated module.
struct Module {
    source: String,
    approach: ArtifactApproach,
    attempts: u32,
    fallback_reason: Option<String>,
}

pub struct BuildStage {
    store: Arc<Store>,
    provider: Arc<dyn BuildProvider>,
    config: PipelineConfig,
}

impl BuildStage {
    pub fn new(store: Arc<Store>, provider: Arc<dyn BuildProvider>, config: PipelineConfig) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Build every approved item. Items left in GENERATING by a crash are
    /// rebuilt from scratch. Returns how many were touched.
    pub async fn run(&self) -> Result<usize, StoreError> {
        let pending = self
            .store
            .list_by_status(&[Status::Approved, Status::Generating])?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = pending.len(), "Building approved submissions");

        let mut touched = 0;
        for submission in pending {
            let id = submission.id;
            let submission = match gate::commit(
                &self.store,
                id,
                &[Status::Approved, Status::Generating],
                |s| s.advance(Status::Generating),
            )? {
                Commit::Applied(s) => s,
                Commit::Cancelled => {
                    tracing::info!(submission_id = id, "Cancelled before build, skipping");
                    continue;
                }
                Commit::Moved(status) => {
                    tracing::debug!(submission_id = id, %status, "No longer awaiting build");
                    continue;
                }
            };
            touched += 1;
            tracing::info!(submission_id = id, request = %submission.request, "Generating");

            if let Err(e) = self.build_one(&submission).await {
                let code = e.to_string();
                tracing::error!(submission_id = id, error = %code, "Build failed");
                gate::commit(&self.store, id, &[Status::Generating], |s| {
                    s.fail(code.clone())
                })?;
            }
        }
        Ok(touched)
    }

    async fn build_one(&self, submission: &Submission) -> Result<(), BuildError> {
        if patch::is_patch_request(&submission.request) {
            self.build_patch(submission).await
        } else {
            self.build_module(submission).await
        }
    }

    async fn build_patch(&self, submission: &Submission) -> Result<(), BuildError> {
        let id = submission.id;
        let plan = patch::plan(&self.config.site_dir, &submission.request).await?;
        if gate::is_cancelled(&self.store, id)? {
            tracing::info!(submission_id = id, "Cancelled during build, patch not applied");
            return Ok(());
        }
        plan.apply().await?;

        let artifact = Artifact {
            module_type: format!("site-patch-{id}"),
            approach: ArtifactApproach::SitePatch,
            changed_files: plan.changed_files(),
            fallback_reason: None,
            attempts: 0,
            sha256: None,
            generated_at: Utc::now(),
        };
        let committed = gate::commit(&self.store, id, &[Status::Generating], |s| {
            s.artifact = Some(artifact.clone());
            s.feature_file = None;
            s.used_ai = Some(false);
            s.advance(Status::Built);
        })?;
        match committed {
            Commit::Applied(_) => {
                tracing::info!(
                    submission_id = id,
                    files = ?artifact.changed_files,
                    "BUILT via site patch"
                );
            }
            Commit::Cancelled | Commit::Moved(_) => {
                plan.revert().await?;
                tracing::info!(submission_id = id, "Cancelled during build, patch reverted");
            }
        }
        Ok(())
    }

    async fn build_module(&self, submission: &Submission) -> Result<(), BuildError> {
        let id = submission.id;
        let module_type = module_id(id, &submission.request);
        let module = self.generate(submission, &module_type).await;

        if gate::is_cancelled(&self.store, id)? {
            tracing::info!(submission_id = id, "Cancelled during build, nothing written");
            return Ok(());
        }

        let file_name = feature_file_name(id);
        let path = self.write_feature(&file_name, &module.source).await?;
        let used_ai = !module.approach.is_fallback();
        let artifact = Artifact {
            module_type: module_type.clone(),
            approach: module.approach,
            changed_files: Vec::new(),
            fallback_reason: module.fallback_reason,
            attempts: module.attempts,
            sha256: Some(hex::encode(Sha256::digest(module.source.as_bytes()))),
            generated_at: Utc::now(),
        };

        let committed = gate::commit(&self.store, id, &[Status::Generating], |s| {
            s.artifact = Some(artifact.clone());
            s.feature_file = Some(file_name.clone());
            s.used_ai = Some(used_ai);
            s.advance(Status::Built);
        })?;
        match committed {
            Commit::Applied(_) => {
                tracing::info!(
                    submission_id = id,
                    module_type = %module_type,
                    approach = ?artifact.approach,
                    file = %file_name,
                    "BUILT"
                );
            }
            Commit::Cancelled | Commit::Moved(_) => {
                remove_if_exists(&path).await?;
                tracing::info!(submission_id = id, "Cancelled during build, feature file removed");
            }
        }
        Ok(())
    }

    /// Provider path with retries and repair; placeholder on any failure.
    async fn generate(&self, submission: &Submission, module_type: &str) -> Module {
        let id = submission.id;
        let fallback = |reason: String, attempts: u32| {
            tracing::warn!(submission_id = id, reason = %reason, "Using fallback placeholder");
            Module {
                source: contract::placeholder(id, &submission.request, module_type, &reason),
                approach: ArtifactApproach::Fallback,
                attempts,
                fallback_reason: Some(reason),
            }
        };

        let generated = match self
            .config
            .retry
            .generate(self.provider.as_ref(), &submission.request, module_type)
            .await
        {
            Ok(generated) => generated,
            Err(exhausted) => return fallback(exhausted.error.to_string(), exhausted.attempts),
        };

        match contract::prepare(&generated.code, module_type) {
            Ok(prepared) => {
                if prepared.repaired {
                    tracing::warn!(submission_id = id, module_type, "Repaired module registration");
                }
                Module {
                    source: format!(
                        "// Feature {id}: {}\n{}\n",
                        contract::one_line(&submission.request),
                        prepared.code
                    ),
                    approach: if prepared.repaired {
                        ArtifactApproach::ProviderRepaired
                    } else {
                        ArtifactApproach::Provider
                    },
                    attempts: generated.attempts,
                    fallback_reason: None,
                }
            }
            Err(violation) => fallback(violation.to_string(), generated.attempts),
        }
    }

    async fn write_feature(&self, file_name: &str, source: &str) -> Result<PathBuf, BuildError> {
        tokio::fs::create_dir_all(&self.config.features_dir).await?;
        let path = self.config.features_dir.join(file_name);
        tokio::fs::write(&path, source).await?;
        Ok(path)
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::build::provider::{ProviderError, RetryPolicy};
    use crate::review::{HeuristicPolicy, ReviewStage};

    struct Fixed(Result<String, ProviderError>);

    #[async_trait]
    impl BuildProvider for Fixed {
        async fn generate(&self, _: &str, _: &str) -> Result<String, ProviderError> {
            self.0.clone()
        }
    }

    fn good_module(id: &str) -> String {
        format!(
            "(function() {{\n  function createCard() {{\n    const card = document.createElement('div');\n    card.className = 'card';\n    card.textContent = 'hello';\n    return card;\n  }}\n  window.registerFeature('{id}', createCard);\n}})();"
        )
    }

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            retry: RetryPolicy {
                max_retries: 1,
                backoff: Duration::from_millis(1),
            },
            ..PipelineConfig::for_site(dir)
        }
    }

    async fn approved(store: &Arc<Store>, request: &str) -> i64 {
        let id = store.create_submission(request).unwrap().id;
        ReviewStage::new(store.clone(), Arc::new(HeuristicPolicy::default()))
            .run()
            .unwrap();
        assert_eq!(store.get_submission(id).unwrap().unwrap().status, Status::Approved);
        id
    }

    #[test]
    fn classifies_module_kind() {
        assert_eq!(ModuleKind::classify("add a todo list"), ModuleKind::Todo);
        assert_eq!(ModuleKind::classify("a pomodoro countdown"), ModuleKind::Timer);
        assert_eq!(ModuleKind::classify("click Counter"), ModuleKind::Counter);
        assert_eq!(ModuleKind::classify("show the weather"), ModuleKind::Custom);
        assert_eq!(module_id(4, "add a todo list"), "todo-4");
    }

    #[tokio::test]
    async fn provider_module_is_written_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "add a todo list").await;
        let stage = BuildStage::new(
            store.clone(),
            Arc::new(Fixed(Ok(good_module(&format!("todo-{id}"))))),
            config(dir.path()),
        );

        assert_eq!(stage.run().await.unwrap(), 1);
        let built = store.get_submission(id).unwrap().unwrap();
        assert_eq!(built.status, Status::Built);
        assert_eq!(built.used_ai, Some(true));
        let artifact = built.artifact.unwrap();
        assert_eq!(artifact.approach, ArtifactApproach::Provider);
        assert_eq!(artifact.module_type, format!("todo-{id}"));

        let source = std::fs::read_to_string(
            dir.path().join("public/features").join(built.feature_file.unwrap()),
        )
        .unwrap();
        assert!(source.starts_with(&format!("// Feature {id}: add a todo list\n")));
        assert_eq!(artifact.sha256.unwrap(), hex::encode(Sha256::digest(source.as_bytes())));
    }

    #[tokio::test]
    async fn wrong_identifier_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "add a counter").await;
        let stage = BuildStage::new(
            store.clone(),
            Arc::new(Fixed(Ok(good_module("my-counter")))),
            config(dir.path()),
        );
        stage.run().await.unwrap();

        let built = store.get_submission(id).unwrap().unwrap();
        assert_eq!(built.artifact.unwrap().approach, ArtifactApproach::ProviderRepaired);
        let source =
            std::fs::read_to_string(dir.path().join("public/features").join(feature_file_name(id)))
                .unwrap();
        assert!(source.contains(&format!("registerFeature('counter-{id}', createCard)")));
    }

    #[tokio::test]
    async fn failing_provider_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "add a note pad").await;
        let stage = BuildStage::new(
            store.clone(),
            Arc::new(Fixed(Err(ProviderError::Timeout))),
            config(dir.path()),
        );
        stage.run().await.unwrap();

        let built = store.get_submission(id).unwrap().unwrap();
        assert_eq!(built.status, Status::Built);
        assert_eq!(built.used_ai, Some(false));
        let artifact = built.artifact.unwrap();
        assert!(artifact.approach.is_fallback());
        assert_eq!(artifact.fallback_reason.as_deref(), Some("LLM_TIMEOUT"));
        assert_eq!(artifact.attempts, 2);
    }

    #[tokio::test]
    async fn blocked_output_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "add a todo list").await;
        let code = good_module(&format!("todo-{id}")).replace("return card;", "eval('x'); return card;");
        let stage = BuildStage::new(store.clone(), Arc::new(Fixed(Ok(code))), config(dir.path()));
        stage.run().await.unwrap();

        let artifact = store.get_submission(id).unwrap().unwrap().artifact.unwrap();
        assert!(artifact.approach.is_fallback());
        assert_eq!(artifact.fallback_reason.as_deref(), Some("CODE_BLOCKED_API:eval"));
    }

    #[tokio::test]
    async fn patch_without_effect_fails_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "remove the unknown module cards").await;
        let stage = BuildStage::new(
            store.clone(),
            Arc::new(Fixed(Err(ProviderError::Timeout))),
            config(dir.path()),
        );
        assert_eq!(stage.run().await.unwrap(), 1);

        let failed = store.get_submission(id).unwrap().unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert_eq!(failed.error.as_deref(), Some("UI_PATCH_NO_EFFECT"));
        assert!(failed.artifact.is_none());
    }

    #[tokio::test]
    async fn styled_feature_request_builds_module() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "add a timer with a button to change the colour").await;
        let stage = BuildStage::new(
            store.clone(),
            Arc::new(Fixed(Err(ProviderError::Timeout))),
            config(dir.path()),
        );
        stage.run().await.unwrap();

        let built = store.get_submission(id).unwrap().unwrap();
        assert_eq!(built.status, Status::Built, "{:?}", built.error);
        assert!(!built.is_site_patch());
        assert_eq!(built.feature_file, Some(feature_file_name(id)));
        assert_eq!(built.artifact.unwrap().module_type, format!("timer-{id}"));
    }

    #[tokio::test]
    async fn site_patch_records_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("public")).unwrap();
        std::fs::write(
            dir.path().join("public/styles.css"),
            ".composer button {\n  height: 2rem;\n}\n",
        )
        .unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "the send button is too small").await;
        let stage = BuildStage::new(
            store.clone(),
            Arc::new(Fixed(Err(ProviderError::Timeout))),
            config(dir.path()),
        );
        stage.run().await.unwrap();

        let built = store.get_submission(id).unwrap().unwrap();
        assert_eq!(built.status, Status::Built);
        assert!(built.is_site_patch());
        assert_eq!(built.feature_file, None);
        let artifact = built.artifact.unwrap();
        assert_eq!(artifact.module_type, format!("site-patch-{id}"));
        assert_eq!(artifact.changed_files, vec!["public/styles.css".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_item_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let id = approved(&store, "add a todo list").await;
        store.cancel(id).unwrap();
        let stage = BuildStage::new(
            store.clone(),
            Arc::new(Fixed(Err(ProviderError::Timeout))),
            config(dir.path()),
        );
        assert_eq!(stage.run().await.unwrap(), 0);
        assert!(!dir.path().join("public/features").join(feature_file_name(id)).exists());
    }
}
