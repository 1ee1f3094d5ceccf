//! KDL configuration parsing for Hopper.
//!
//! This crate handles parsing of:
//! - Broker configuration (broker.kdl)
//! - Worker configuration (worker.kdl)
//! - Job files submitted by the CLI (jobs.kdl)
//!
//! Every setting has a built-in default, so an empty file is a valid
//! configuration. Binaries layer environment variables and command-line
//! flags on top of what is parsed here.

pub mod broker;
pub mod error;
pub mod jobs;
mod node;
pub mod store;
pub mod worker;

pub use broker::BrokerConfig;
pub use error::{ConfigError, ConfigResult};
pub use jobs::{JobDefinition, JobFile, LayerSource};
pub use store::StoreConfig;
pub use worker::{SandboxConfig, WorkerConfig};
