//! Single-flight pipeline scheduler.
//!
//! [`Scheduler::enqueue`] never blocks. If a pass is already running it only
//! arms a re-run; otherwise it spawns a drain loop that keeps running passes
//! until one touches nothing and no re-run is armed.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::build::provider::BuildProvider;
use crate::build::BuildStage;
use crate::config::PipelineConfig;
use crate::release::publish::Publisher;
use crate::release::ReleaseStage;
use crate::review::{ReviewPolicy, ReviewStage};
use crate::store::Store;

/// The three stages over one store.
pub struct Pipeline {
    store: Arc<Store>,
    publisher: Arc<dyn Publisher>,
    review: ReviewStage,
    build: BuildStage,
    release: ReleaseStage,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        policy: Arc<dyn ReviewPolicy>,
        provider: Arc<dyn BuildProvider>,
        publisher: Arc<dyn Publisher>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            review: ReviewStage::new(store.clone(), policy),
            build: BuildStage::new(store.clone(), provider, config.clone()),
            release: ReleaseStage::new(store.clone(), publisher.clone(), config),
            store,
            publisher,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    /// Review, build, release, in that order. Each stage reads the store
    /// fresh, so an item can move through all three in one pass. Returns the
    /// number of items touched.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let reviewed = self.review.run().context("review stage")?;
        let built = self.build.run().await.context("build stage")?;
        let released = self.release.run().await.context("release stage")?;
        let touched = reviewed + built + released;
        if touched > 0 {
            tracing::info!(reviewed, built, released, "Pipeline pass complete");
        }
        Ok(touched)
    }
}

#[derive(Default)]
struct Flags {
    running: bool,
    armed: bool,
}

struct Inner {
    pipeline: Arc<Pipeline>,
    flags: Mutex<Flags>,
    idle: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                pipeline,
                flags: Mutex::new(Flags::default()),
                idle,
            }),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    /// Request a pass. Must be called from within a tokio runtime.
    pub fn enqueue(&self) {
        {
            let mut flags = self.inner.flags.lock();
            if flags.running {
                flags.armed = true;
                return;
            }
            flags.running = true;
            self.inner.idle.send_replace(false);
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drain().await });
    }

    pub fn is_running(&self) -> bool {
        self.inner.flags.lock().running
    }

    /// Resolves once no pass is running or armed.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        // Only fails if the sender is dropped, and `self` holds it.
        let _ = rx.wait_for(|idle| *idle).await;
    }
}

impl Inner {
    async fn drain(self: Arc<Self>) {
        loop {
            // A panicking stage must not leave `running` stuck, so each pass
            // runs in its own task.
            let pipeline = self.pipeline.clone();
            let touched = match tokio::spawn(async move { pipeline.run_once().await }).await {
                Ok(Ok(touched)) => touched,
                Ok(Err(e)) => {
                    tracing::error!(error = %format!("{e:#}"), "Pipeline pass aborted");
                    0
                }
                Err(e) => {
                    tracing::error!(error = %e, "Pipeline pass panicked");
                    0
                }
            };

            let again = {
                let mut flags = self.flags.lock();
                if touched > 0 || flags.armed {
                    flags.armed = false;
                    true
                } else {
                    flags.running = false;
                    self.idle.send_replace(true);
                    false
                }
            };
            if !again {
                break;
            }
        }
    }
}
