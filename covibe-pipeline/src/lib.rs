//! Submission lifecycle orchestrator.
//!
//! A free-text feature request enters as a RECEIVED [`Submission`] and is
//! driven through review, build and release by a single-flight
//! [`Scheduler`] over a shared SQLite [`Store`].

pub mod build;
pub mod config;
pub mod gate;
pub mod model;
pub mod release;
pub mod review;
pub mod scheduler;
pub mod store;

pub use build::provider::{BuildProvider, ChatCompletionsProvider, ProviderError, RetryPolicy};
pub use config::{LlmConfig, PipelineConfig, PublishConfig, PublishMode};
pub use model::{ReleasedFeature, Status, Submission, UploadStrategy};
pub use release::publish::{publisher_from_config, PublishError, PublishRequest, Publisher};
pub use review::{HeuristicPolicy, ReviewPolicy, Verdict};
pub use scheduler::{Pipeline, Scheduler};
pub use store::{Store, StoreError};
