// src/lib.rs - Module organization for the StreamFix proxy

// Core modules
pub mod artifacts;
pub mod common;
pub mod constants;
pub mod core;
pub mod handlers;
pub mod metrics;
pub mod provider;
pub mod request;
pub mod schema;
pub mod server;
pub mod utils;

// Public re-exports for easy access
pub use crate::artifacts::{Artifact, ArtifactStatus, ArtifactStore};
pub use crate::core::{ExtractStatus, JsonExtractor, Preprocessor, RootHint};
pub use crate::metrics::{get_global_metrics, init_global_metrics, MetricsCollector};
pub use crate::provider::UpstreamProvider;
pub use crate::request::ChatCompletionRequest;
pub use crate::server::{Config, ProxyServer};
pub use crate::utils::{Logger, ProxyError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Re-export runtime configuration functions
pub use crate::constants::{get_runtime_config, init_runtime_config, RuntimeConfig};
