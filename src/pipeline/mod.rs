//! The discovery and enrichment loop.
//!
//! - **Config**: every tunable, with defaults and environment overrides
//! - **Orchestrator**: the claim, enrich, persist, settle cycle and the
//!   long-running loop that interleaves it with background discovery
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use repo_scout::github::GraphQlClient;
//! use repo_scout::pipeline::{sources_from_config, Pipeline, PipelineConfig};
//! use repo_scout::storage::Store;
//!
//! let config = PipelineConfig::from_env()?;
//! let store = Store::open(&config.database_url).await?;
//! let api = Arc::new(GraphQlClient::new(config.github_token.clone(), config.fetch_timeout));
//! let sources = sources_from_config(&config, &store);
//!
//! let pipeline = Pipeline::new(config, store, api)?.with_sources(sources);
//! let shutdown = pipeline.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.shutdown();
//! });
//! pipeline.run().await?;
//! ```

pub mod config;
pub mod orchestrator;

pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{
    sources_from_config, CycleOutcome, CycleReport, Pipeline, PipelineError, PipelineStats,
    ShutdownHandle,
};
