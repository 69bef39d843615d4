//! Core library for triton-pssh, a parallel SSH fan-out tool.
//!
//! The crate enumerates a cloud provider's compute fleet, filters instances
//! with a boolean expression evaluated against instance and image
//! metadata, and runs a remote command on every match through a bounded
//! SSH worker pool, optionally tunnelling through a bastion host. Image
//! and network lookups flow through request-coalescing caches backed by an
//! on-disk JSON cache.

pub mod cache;
pub mod cli;
pub mod config;
pub mod expr;
pub mod metadata;
pub mod pipeline;
pub mod provider;
pub mod ssh;
pub mod test_support;

pub use cache::file::CacheLayout;
pub use cache::{Cache, CacheError};
pub use config::{CacheConfig, ConfigError, SshConfig};
pub use expr::{Context, EvalError, Evaluator, Value, instance_context};
pub use metadata::{ImageCache, NetworkCache, default_user};
pub use pipeline::{InstanceStream, PipelineConfig, PipelineError, stream_instances};
pub use provider::{CloudClient, Image, Instance, Network, ProviderError, RestClient};
pub use ssh::{
    AuthMethod, PrintError, PrintMode, SshError, SshJob, SshResult, SshSession,
};
