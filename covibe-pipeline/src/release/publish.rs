//! Publish providers: make released files durable outside the local store.
//!
//! Two remote strategies: a git push from the site checkout, and a
//! read-then-write upload through the GitHub contents API. [`AutoPublisher`]
//! tries the first and falls back to the second.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::{PublishConfig, PublishMode};
use crate::model::UploadStrategy;

/// Path-segment escaping for the contents API: keep the unreserved set.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("GIT_FAILED:{0}")]
    Git(String),
    #[error("GIT_TIMEOUT:{0}")]
    GitTimeout(String),
    #[error("GITHUB_HTTP_{status}:{body}")]
    Api { status: u16, body: String },
    #[error("GITHUB_TRANSPORT:{0}")]
    Transport(String),
    #[error("GITHUB_NOT_CONFIGURED")]
    NotConfigured,
    #[error("PUBLISH_FILE_NOT_FOUND:{0}")]
    MissingFile(String),
    #[error("PUBLISH_IO:{0}")]
    Io(#[from] std::io::Error),
    #[error("PUBLISH_FAILED:{primary} / {fallback}")]
    Exhausted {
        primary: Box<PublishError>,
        fallback: Box<PublishError>,
    },
}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        PublishError::Transport(e.to_string())
    }
}

/// Files to publish, relative to the publisher's repository root.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub submission_id: i64,
    pub files: Vec<PathBuf>,
    pub message: String,
}

impl PublishRequest {
    pub fn new(submission_id: i64, files: Vec<PathBuf>) -> Self {
        Self {
            submission_id,
            files,
            message: format!("feat: release feature #{submission_id}"),
        }
    }

    /// Commit message for a single-file upload: feature code and each
    /// snapshot get their own.
    pub fn file_message(&self, file: &Path) -> String {
        let id = self.submission_id;
        match file.file_name().and_then(|n| n.to_str()) {
            Some("submissions.json") => format!("chore: sync submissions for feature #{id}"),
            Some("features.json") => format!("chore: sync released features for feature #{id}"),
            _ => format!("feat: release feature #{id} code"),
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Upload every file in `request`. Republishing unchanged content
    /// succeeds.
    async fn publish(&self, request: &PublishRequest) -> Result<UploadStrategy, PublishError>;

    /// Branch the release lands on.
    fn branch(&self) -> &str;

    /// Remote copy of a repository-relative file, when this publisher can
    /// read one back.
    async fn fetch(&self, _path: &str) -> Result<Option<Vec<u8>>, PublishError> {
        Ok(None)
    }
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

async fn ensure_files(root: &Path, files: &[PathBuf]) -> Result<(), PublishError> {
    for file in files {
        if !tokio::fs::try_exists(root.join(file)).await? {
            return Err(PublishError::MissingFile(to_slash_path(file)));
        }
    }
    Ok(())
}

// ── git ────────────────────────────────────────────────────────────────

pub struct GitPublisher {
    root: PathBuf,
    branch: String,
    timeout: Duration,
}

impl GitPublisher {
    pub fn new(root: impl Into<PathBuf>, branch: impl Into<String>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            branch: branch.into(),
            timeout,
        }
    }

    pub fn is_repository(root: &Path) -> bool {
        root.join(".git").exists()
    }

    async fn git(&self, args: &[String]) -> Result<std::process::Output, PublishError> {
        let label = args.first().cloned().unwrap_or_default();
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .args(args)
                .current_dir(&self.root)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| PublishError::GitTimeout(label))??;
        Ok(output)
    }

    async fn git_ok(&self, args: &[String]) -> Result<(), PublishError> {
        let output = self.git(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(git_failure(args, &output))
        }
    }
}

fn git_failure(args: &[String], output: &std::process::Output) -> PublishError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
    let detail: String = detail.trim().chars().take(300).collect();
    PublishError::Git(format!(
        "git {} exited {}: {detail}",
        args.first().map(String::as_str).unwrap_or_default(),
        output.status.code().unwrap_or(-1)
    ))
}

/// `git commit` reports an unchanged tree as a failure.
fn is_nothing_to_commit(output: &std::process::Output) -> bool {
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    text.contains("nothing to commit") || text.contains("no changes added to commit")
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<UploadStrategy, PublishError> {
        ensure_files(&self.root, &request.files).await?;

        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(request.files.iter().map(|f| to_slash_path(f)));
        self.git_ok(&add).await?;

        let commit = vec!["commit".to_string(), "-m".to_string(), request.message.clone()];
        let output = self.git(&commit).await?;
        if !output.status.success() {
            if is_nothing_to_commit(&output) {
                tracing::debug!(submission_id = request.submission_id, "Nothing new to commit");
            } else {
                return Err(git_failure(&commit, &output));
            }
        }

        self.git_ok(&[
            "push".to_string(),
            "origin".to_string(),
            format!("HEAD:{}", self.branch),
        ])
        .await?;
        Ok(UploadStrategy::Git)
    }

    fn branch(&self) -> &str {
        &self.branch
    }
}

// ── GitHub contents API ────────────────────────────────────────────────

pub struct ContentApiPublisher {
    http: reqwest::Client,
    api_base: String,
    repo: String,
    token: String,
    branch: String,
    root: PathBuf,
}

impl ContentApiPublisher {
    /// `None` unless both a repository and a token are configured.
    pub fn from_config(config: &PublishConfig) -> Option<Self> {
        let repo = config.github_repo.clone().filter(|r| !r.is_empty())?;
        let token = config.github_token.clone().filter(|t| !t.is_empty())?;
        Some(Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repo,
            token,
            branch: config.branch.clone(),
            root: config.repo_root.clone(),
        })
    }

    fn contents_url(&self, path: &str) -> String {
        let encoded = path
            .split('/')
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/repos/{}/contents/{encoded}", self.api_base, self.repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, "covibe-pipeline")
            .timeout(Duration::from_secs(30))
    }

    /// Current blob for `path` on the branch, or `None` if it does not exist.
    async fn get_contents(&self, path: &str) -> Result<Option<Value>, PublishError> {
        let resp = self
            .request(reqwest::Method::GET, &self.contents_url(path))
            .query(&[("ref", self.branch.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(api_error(resp).await);
        }
        Ok(Some(resp.json().await?))
    }

    async fn put_file(&self, path: &str, bytes: &[u8], message: &str) -> Result<(), PublishError> {
        let sha = self
            .get_contents(path)
            .await?
            .and_then(|v| v["sha"].as_str().map(str::to_string));

        let mut body = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
            "branch": &self.branch,
        });
        if let Some(sha) = sha {
            body["sha"] = Value::String(sha);
        }

        let resp = self
            .request(reqwest::Method::PUT, &self.contents_url(path))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(())
    }
}

async fn api_error(resp: reqwest::Response) -> PublishError {
    let status = resp.status().as_u16();
    let body: String = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(300)
        .collect();
    PublishError::Api { status, body }
}

#[async_trait]
impl Publisher for ContentApiPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<UploadStrategy, PublishError> {
        ensure_files(&self.root, &request.files).await?;
        for file in &request.files {
            let bytes = tokio::fs::read(self.root.join(file)).await?;
            let path = to_slash_path(file);
            self.put_file(&path, &bytes, &request.file_message(file)).await?;
            tracing::debug!(submission_id = request.submission_id, path = %path, "Uploaded");
        }
        Ok(UploadStrategy::Api)
    }

    fn branch(&self) -> &str {
        &self.branch
    }

    async fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>, PublishError> {
        let Some(value) = self.get_contents(path).await? else {
            return Ok(None);
        };
        let Some(content) = value["content"].as_str() else {
            return Ok(None);
        };
        let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
        match base64::engine::general_purpose::STANDARD.decode(compact) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => Err(PublishError::Transport(format!("bad content encoding: {e}"))),
        }
    }
}

// ── composite / local ──────────────────────────────────────────────────

/// Primary strategy first, fallback on any failure.
pub struct AutoPublisher {
    primary: Option<Arc<dyn Publisher>>,
    fallback: Option<Arc<dyn Publisher>>,
    branch: String,
}

impl AutoPublisher {
    pub fn new(
        primary: Option<Arc<dyn Publisher>>,
        fallback: Option<Arc<dyn Publisher>>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            fallback,
            branch: branch.into(),
        }
    }
}

#[async_trait]
impl Publisher for AutoPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<UploadStrategy, PublishError> {
        let primary_err = match &self.primary {
            Some(primary) => match primary.publish(request).await {
                Ok(strategy) => return Ok(strategy),
                Err(e) => {
                    tracing::warn!(
                        submission_id = request.submission_id,
                        error = %e,
                        "Primary publish failed, trying fallback"
                    );
                    Some(e)
                }
            },
            None => None,
        };
        match (&self.fallback, primary_err) {
            (Some(fallback), None) => fallback.publish(request).await,
            (Some(fallback), Some(primary)) => {
                fallback
                    .publish(request)
                    .await
                    .map_err(|fallback| PublishError::Exhausted {
                        primary: Box::new(primary),
                        fallback: Box::new(fallback),
                    })
            }
            (None, Some(primary)) => Err(primary),
            (None, None) => Err(PublishError::NotConfigured),
        }
    }

    fn branch(&self) -> &str {
        &self.branch
    }

    async fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>, PublishError> {
        for publisher in [&self.fallback, &self.primary].into_iter().flatten() {
            if let Some(bytes) = publisher.fetch(path).await? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }
}

/// Records a release without contacting any remote.
pub struct LocalPublisher {
    root: PathBuf,
    branch: String,
}

impl LocalPublisher {
    pub fn new(root: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            branch: branch.into(),
        }
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<UploadStrategy, PublishError> {
        ensure_files(&self.root, &request.files).await?;
        Ok(UploadStrategy::Local)
    }

    fn branch(&self) -> &str {
        &self.branch
    }
}

pub fn publisher_from_config(config: &PublishConfig) -> Arc<dyn Publisher> {
    let api = || {
        ContentApiPublisher::from_config(config).map(|p| Arc::new(p) as Arc<dyn Publisher>)
    };
    let git = || {
        Arc::new(GitPublisher::new(
            config.repo_root.clone(),
            config.branch.clone(),
            config.git_timeout,
        )) as Arc<dyn Publisher>
    };

    match config.mode {
        PublishMode::Local => Arc::new(LocalPublisher::new(
            config.repo_root.clone(),
            config.branch.clone(),
        )),
        PublishMode::Git => git(),
        PublishMode::Api => Arc::new(AutoPublisher::new(None, api(), config.branch.clone())),
        PublishMode::Auto => {
            let primary = GitPublisher::is_repository(&config.repo_root).then(git);
            if primary.is_none() {
                tracing::info!(root = %config.repo_root.display(), "Site is not a git checkout, publishing via contents API only");
            }
            Arc::new(AutoPublisher::new(primary, api(), config.branch.clone()))
        }
    }
}
