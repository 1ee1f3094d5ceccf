//! Sandboxed job execution for Hopper workers.
//!
//! [`SandboxExecutor`] runs each job in its own [`IsolationContext`]: a
//! root directory assembled from the job's layers, fresh Linux namespaces
//! (when enabled), cgroup or rlimit resource limits, bounded output capture
//! and a wall-clock timeout.

pub mod assembly;
pub mod capture;
pub mod context;
pub mod error;
pub mod launch;
pub mod limits;
pub mod sandbox;

pub use context::{ContextTracker, IsolationContext, Phase};
pub use error::{ExecutorError, ExecutorResult};
pub use sandbox::{SandboxExecutor, SandboxOptions};

#[cfg(test)]
pub(crate) mod testing {
    use hopper_core::Digest;
    use hopper_core::executor::ResolvedLayer;
    use hopper_store::LayerBuilder;
    use std::path::Path;

    /// Write a layer archive to `dir/name.layer`.
    pub fn write_layer(dir: &Path, name: &str, builder: LayerBuilder) -> ResolvedLayer {
        let bytes = builder.finish();
        let path = dir.join(format!("{name}.layer"));
        std::fs::write(&path, &bytes).unwrap();
        ResolvedLayer {
            digest: Digest::of(&bytes),
            path,
        }
    }
}
