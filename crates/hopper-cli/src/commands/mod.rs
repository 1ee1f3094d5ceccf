//! CLI command implementations.

pub mod run;
pub mod stats;

use anyhow::{Context, Result};
use bytes::Bytes;
use hopper_client::Client;
use hopper_config::{JobFile, LayerSource};
use hopper_core::Digest;
use hopper_store::LayerBuilder;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    match JobFile::load(path) {
        Ok(file) => {
            let mut ok = true;
            for job in &file.jobs {
                // Placeholder digests: only the job's own fields are checked here.
                let digests = job.layers.iter().map(|_| Digest::of(b"")).collect();
                if let Err(e) = job.to_spec(digests).validate() {
                    println!("Job '{}': {}", job.name, e);
                    ok = false;
                }
                for layer in &job.layers {
                    if let LayerSource::Path { source, .. } = layer {
                        if !source.exists() {
                            println!("Job '{}': layer {} does not exist", job.name, source.display());
                            ok = false;
                        }
                    }
                }
            }
            if !ok {
                std::process::exit(1);
            }
            println!("{} job(s) valid", file.jobs.len());
            Ok(())
        }
        Err(e) => {
            println!("Job file error: {}", e);
            std::process::exit(1);
        }
    }
}

pub async fn push(broker: &str, path: &Path, dest: &str) -> Result<()> {
    let layer = pack(path, dest).await?;
    let size = layer.len();
    let client = Client::connect(broker)
        .await
        .with_context(|| format!("Failed to connect to {broker}"))?;
    let digest = client.push_layer(layer).await?;
    println!("{digest} ({size} bytes)");
    Ok(())
}

/// Pack a host file or directory into a layer rooted at `dest`. A single
/// file pushed to a directory destination keeps its file name.
pub async fn pack(source: &Path, dest: &str) -> Result<Bytes> {
    let source = source.to_path_buf();
    let dest = dest.to_string();
    tokio::task::spawn_blocking(move || {
        let mut dest = dest;
        if source.is_file() && dest.ends_with('/') {
            let name = source
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Bad file name: {}", source.display()))?;
            dest.push_str(name);
        }
        let mut builder = LayerBuilder::new();
        builder
            .add_path_recursive(&source, &dest)
            .with_context(|| format!("Failed to pack {}", source.display()))?;
        Ok(builder.finish())
    })
    .await?
}
