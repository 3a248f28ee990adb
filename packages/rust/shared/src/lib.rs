//! Shared types, error model, and configuration for relingo.
//!
//! This crate is the foundation depended on by all other relingo crates.
//! It provides:
//! - [`RelingoError`], the unified error type
//! - Domain types ([`Job`], [`Stage`], [`ChunkRecord`], [`FinishedArticle`], [`FailureRecord`])
//! - Configuration ([`AppConfig`], runtime configs, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CircuitConfig, CircuitSection, PipelineConfig, PipelineSection, RetryConfig,
    RetrySection, StorageSection, TransformConfig, TransformSection, config_dir,
    config_file_path, init_config, load_config, load_config_from, resolve_db_path,
    validate_api_key,
};
pub use error::{RelingoError, Result};
pub use types::{
    ArticleMetadata, ChangeEvent, ChangeKind, ChunkKey, ChunkRecord, Destination,
    DispatchMessage, FailureKind, FailureRecord, FinishedArticle, Job, JobId, Stage,
};
