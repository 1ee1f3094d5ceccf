//! Hopper broker.
//!
//! Accepts clients, workers and artifact transfers on one TCP port, runs the
//! scheduler and serves `/health`, `/stats` and `/events` over HTTP.

pub mod artifacts;
pub mod deps;
pub mod error;
pub mod http;
pub mod server;

pub use deps::PassThroughDeps;
pub use error::{BrokerError, BrokerResult};
pub use server::Broker;
