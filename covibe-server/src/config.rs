use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use covibe_pipeline::{LlmConfig, PipelineConfig, PublishConfig, PublishMode, RetryPolicy};

/// Server configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "covibe-server", about = "Self-extending site: review, build and release pipeline")]
pub struct ServerConfig {
    /// Address to listen on for HTTP
    #[arg(long, env = "COVIBE_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// SQLite database path (in-memory when unset)
    #[arg(long, env = "COVIBE_DB")]
    pub db_path: Option<String>,

    /// Site checkout holding `public/`
    #[arg(long, env = "COVIBE_SITE_DIR", default_value = ".")]
    pub site_dir: PathBuf,

    /// Where generated features are written (default: <site-dir>/public/features)
    #[arg(long, env = "COVIBE_FEATURES_DIR")]
    pub features_dir: Option<PathBuf>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "LLM_BASE_URL", default_value = "https://api.moonshot.cn/v1")]
    pub llm_base_url: String,

    /// API key for the build provider
    #[arg(long, env = "LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = "kimi-k2.5")]
    pub llm_model: String,

    /// Per-call timeout for the build provider
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value_t = 120)]
    pub llm_timeout_secs: u64,

    /// Retries after the first build provider call
    #[arg(long, env = "LLM_MAX_RETRIES", default_value_t = 2)]
    pub llm_max_retries: u32,

    /// Backoff unit; the n-th retry waits n times this
    #[arg(long, env = "LLM_RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// auto, git, api or local
    #[arg(long, env = "COVIBE_PUBLISH_MODE", default_value = "auto")]
    pub publish_mode: PublishMode,

    /// Branch releases are pushed to
    #[arg(long, env = "GITHUB_BRANCH", default_value = "main")]
    pub git_remote_branch: String,

    /// owner/name for the GitHub contents API
    #[arg(long, env = "GITHUB_REPO")]
    pub github_repo: Option<String>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Seconds in RELEASING without a feature record before reconciliation fails it
    #[arg(long, env = "COVIBE_STALE_RELEASE_SECS", default_value_t = 600)]
    pub stale_release_secs: u64,

    /// Seconds between background pipeline passes (0 disables)
    #[arg(long, env = "COVIBE_RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub reconcile_interval_secs: u64,

    /// Maximum request length accepted at intake
    #[arg(long, env = "COVIBE_MAX_REQUEST_CHARS", default_value_t = 200)]
    pub max_request_chars: usize,

    /// Submissions per IP per minute
    #[arg(long, env = "COVIBE_RATE_LIMIT", default_value_t = 20)]
    pub rate_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            db_path: None,
            site_dir: PathBuf::from("."),
            features_dir: None,
            llm_base_url: "https://api.moonshot.cn/v1".to_string(),
            llm_api_key: None,
            llm_model: "kimi-k2.5".to_string(),
            llm_timeout_secs: 120,
            llm_max_retries: 2,
            retry_backoff_ms: 1000,
            publish_mode: PublishMode::Auto,
            git_remote_branch: "main".to_string(),
            github_repo: None,
            github_token: None,
            stale_release_secs: 600,
            reconcile_interval_secs: 60,
            max_request_chars: 200,
            rate_limit: 20,
        }
    }
}

impl ServerConfig {
    pub fn features_dir(&self) -> PathBuf {
        self.features_dir
            .clone()
            .unwrap_or_else(|| self.site_dir.join("public").join("features"))
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            site_dir: self.site_dir.clone(),
            features_dir: self.features_dir(),
            retry: RetryPolicy {
                max_retries: self.llm_max_retries,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            stale_release_after: Duration::from_secs(self.stale_release_secs),
        }
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            base_url: self.llm_base_url.clone(),
            api_key: self.llm_api_key.clone(),
            model: self.llm_model.clone(),
            timeout: Duration::from_secs(self.llm_timeout_secs),
        }
    }

    pub fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            mode: self.publish_mode,
            repo_root: self.site_dir.clone(),
            branch: self.git_remote_branch.clone(),
            github_repo: self.github_repo.clone(),
            github_token: self.github_token.clone(),
            ..Default::default()
        }
    }
}
