//! Server assembly: store, collaborators, scheduler and HTTP listener.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use covibe_pipeline::{
    publisher_from_config, BuildProvider, ChatCompletionsProvider, HeuristicPolicy, Pipeline,
    Publisher, ReviewPolicy, Scheduler, Store,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::limit::RateLimiter;

/// Consecutive ports tried when the configured one is taken.
const MAX_BIND_ATTEMPTS: u16 = 10;

/// State shared by every HTTP handler.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub scheduler: Scheduler,
    pub publisher: Arc<dyn Publisher>,
    pub features_dir: PathBuf,
    pub limiter: RateLimiter,
}

pub struct Server {
    config: ServerConfig,
    provider: Option<Arc<dyn BuildProvider>>,
    publisher: Option<Arc<dyn Publisher>>,
    policy: Arc<dyn ReviewPolicy>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            provider: None,
            publisher: None,
            policy: Arc::new(HeuristicPolicy::default()),
        }
    }

    /// Create a server with custom build and publish providers (for testing).
    pub fn with_collaborators(
        config: ServerConfig,
        provider: Arc<dyn BuildProvider>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            provider: Some(provider),
            publisher: Some(publisher),
            ..Self::new(config)
        }
    }

    fn build_state(&self) -> Result<Arc<AppState>> {
        let store = match &self.config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {path}");
                if let Some(parent) = std::path::Path::new(path).parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                Store::open(path).with_context(|| format!("Failed to open database {path}"))?
            }
            None => {
                tracing::warn!("No database path configured, submissions will not survive a restart");
                Store::open_memory().context("Failed to open in-memory database")?
            }
        };
        let store = Arc::new(store);

        let provider = match &self.provider {
            Some(provider) => provider.clone(),
            None => {
                let llm = ChatCompletionsProvider::new(&self.config.llm_config());
                if self.config.llm_api_key.as_deref().is_none_or(str::is_empty) {
                    tracing::warn!("LLM_API_KEY not set, every generated feature will be a placeholder");
                } else {
                    tracing::info!(model = llm.model(), "Build provider configured");
                }
                Arc::new(llm) as Arc<dyn BuildProvider>
            }
        };
        let publisher = match &self.publisher {
            Some(publisher) => publisher.clone(),
            None => publisher_from_config(&self.config.publish_config()),
        };

        let pipeline = Pipeline::new(
            store.clone(),
            self.policy.clone(),
            provider,
            publisher.clone(),
            self.config.pipeline_config(),
        );

        Ok(Arc::new(AppState {
            features_dir: self.config.features_dir(),
            limiter: RateLimiter::new(self.config.rate_limit),
            scheduler: Scheduler::new(Arc::new(pipeline)),
            config: self.config.clone(),
            store,
            publisher,
        }))
    }

    /// Bind, start serving and kick off recovery. Returns the bound address
    /// and the serving task (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("HTTP listener on {addr}");

        let state = self.build_state()?;

        // Recover anything a previous process left mid-pipeline.
        state.scheduler.enqueue();

        if self.config.reconcile_interval_secs > 0 {
            let scheduler = state.scheduler.clone();
            let period = Duration::from_secs(self.config.reconcile_interval_secs);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // skip first tick
                loop {
                    interval.tick().await;
                    scheduler.enqueue();
                }
            });
        }

        let router = crate::web::router(state);
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .context("HTTP server error")
        });
        Ok((addr, handle))
    }

    pub async fn run(self) -> Result<()> {
        let (_, handle) = self.start().await?;
        handle.await?
    }
}

/// Bind `listen_addr`, walking up to the next free port when it is in use.
/// Ephemeral (`:0`) and unparsed host names get a single attempt.
async fn bind(listen_addr: &str) -> Result<TcpListener> {
    let base = match listen_addr.parse::<SocketAddr>() {
        Ok(addr) if addr.port() != 0 => addr,
        _ => {
            return TcpListener::bind(listen_addr)
                .await
                .with_context(|| format!("Failed to bind {listen_addr}"));
        }
    };

    for offset in 0..MAX_BIND_ATTEMPTS {
        let Some(port) = base.port().checked_add(offset) else {
            break;
        };
        let candidate = SocketAddr::new(base.ip(), port);
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!("Port {port} in use, trying the next one");
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to bind {candidate}")),
        }
    }
    Err(anyhow!(
        "Unable to bind a port in range {}-{}",
        base.port(),
        base.port().saturating_add(MAX_BIND_ATTEMPTS - 1)
    ))
}
