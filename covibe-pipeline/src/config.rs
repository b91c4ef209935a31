//! Plain configuration consumed by the pipeline. The server builds these
//! from its command line.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::build::provider::RetryPolicy;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Repository root holding `public/`; structural patches edit files here.
    pub site_dir: PathBuf,
    /// Where generated feature modules are written.
    pub features_dir: PathBuf,
    pub retry: RetryPolicy,
    /// How long a submission may sit in RELEASING without a feature record
    /// before reconciliation fails it.
    pub stale_release_after: Duration,
}

impl PipelineConfig {
    pub fn for_site(site_dir: impl Into<PathBuf>) -> Self {
        let site_dir = site_dir.into();
        Self {
            features_dir: site_dir.join("public").join("features"),
            site_dir,
            retry: RetryPolicy::default(),
            stale_release_after: Duration::from_secs(600),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::for_site(".")
    }
}

/// Chat-completions endpoint used by the build provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.moonshot.cn/v1".to_string(),
            api_key: None,
            model: "kimi-k2.5".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Git when the site is a checkout, content API as fallback.
    #[default]
    Auto,
    Git,
    Api,
    /// Nothing leaves the machine.
    Local,
}

impl FromStr for PublishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PublishMode::Auto),
            "git" => Ok(PublishMode::Git),
            "api" | "github" => Ok(PublishMode::Api),
            "local" | "none" => Ok(PublishMode::Local),
            other => Err(format!("unknown publish mode: {other} (expected auto, git, api or local)")),
        }
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublishMode::Auto => "auto",
            PublishMode::Git => "git",
            PublishMode::Api => "api",
            PublishMode::Local => "local",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub mode: PublishMode,
    /// Working tree that `git` runs in; publish paths are relative to it.
    pub repo_root: PathBuf,
    pub branch: String,
    /// `owner/name` for the content API.
    pub github_repo: Option<String>,
    pub github_token: Option<String>,
    pub api_base: String,
    /// Bound on each git invocation.
    pub git_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            mode: PublishMode::Auto,
            repo_root: PathBuf::from("."),
            branch: "main".to_string(),
            github_repo: None,
            github_token: None,
            api_base: "https://api.github.com".to_string(),
            git_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_mode_parses() {
        assert_eq!("auto".parse::<PublishMode>().unwrap(), PublishMode::Auto);
        assert_eq!(" GIT ".parse::<PublishMode>().unwrap(), PublishMode::Git);
        assert_eq!("github".parse::<PublishMode>().unwrap(), PublishMode::Api);
        assert_eq!("local".parse::<PublishMode>().unwrap(), PublishMode::Local);
        assert!("ftp".parse::<PublishMode>().is_err());
        assert_eq!(PublishMode::Api.to_string(), "api");
    }

    #[test]
    fn features_dir_defaults_under_site() {
        let config = PipelineConfig::for_site("/srv/site");
        assert_eq!(config.features_dir, PathBuf::from("/srv/site/public/features"));
        assert_eq!(config.retry.max_retries, 2);
    }
}
