//! Artifact store settings, shared by the broker's `store` section and the
//! worker's `cache` section.

use hopper_core::artifact::RetentionPolicy;
use kdl::KdlNode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::ConfigResult;
use crate::node;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the store.
    pub root: PathBuf,
    /// Byte ceiling the store is pruned down to.
    pub capacity_bytes: u64,
    /// Artifacts used more recently than this are kept regardless of size.
    pub retention: Duration,
}

impl StoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let policy = RetentionPolicy::default();
        Self {
            root: root.into(),
            capacity_bytes: policy.max_size_bytes,
            retention: policy.min_age,
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_size_bytes: self.capacity_bytes,
            min_age: self.retention,
        }
    }

    /// Apply the children of a `store { ... }` or `cache { ... }` node.
    pub(crate) fn apply(&mut self, section: &KdlNode) -> ConfigResult<()> {
        let prefix = node::name(section).to_string();
        for child in node::children(section) {
            let field = format!("{prefix}.{}", node::name(child));
            match node::name(child) {
                "root" => self.root = PathBuf::from(node::string(child, &field)?),
                "capacity-bytes" => self.capacity_bytes = node::u64_arg(child, &field)?,
                "retention-secs" => {
                    self.retention = Duration::from_secs(node::u64_arg(child, &field)?)
                }
                _ => {}
            }
        }
        Ok(())
    }
}
