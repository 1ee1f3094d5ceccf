//! Run a job file.

use anyhow::{Context, Result};
use futures::StreamExt;
use hopper_client::{Client, ClientError, JobResult, SubmitOptions};
use hopper_config::{JobFile, LayerSource};
use hopper_core::outcome::CapturedOutput;
use hopper_core::{ClientJobId, Digest, JobOutcome};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::pack;

/// Returns whether every job completed successfully.
pub async fn run(broker: &str, path: &Path, verbose: bool) -> Result<bool> {
    let file = JobFile::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let client = Client::connect(broker)
        .await
        .with_context(|| format!("Failed to connect to {broker}"))?;

    // Each distinct (source, dest) pair is packed and pushed once.
    let mut pushed: HashMap<(PathBuf, String), Digest> = HashMap::new();
    let mut handles = Vec::new();
    let mut names: HashMap<ClientJobId, String> = HashMap::new();
    let mut failed = 0usize;

    for job in &file.jobs {
        let mut digests = Vec::with_capacity(job.layers.len());
        for layer in &job.layers {
            let digest = match layer {
                LayerSource::Digest(digest) => *digest,
                LayerSource::Path { source, dest } => {
                    let key = (source.clone(), dest.clone());
                    match pushed.get(&key) {
                        Some(digest) => *digest,
                        None => {
                            let data = pack(source, dest).await?;
                            let digest = client
                                .push_layer(data)
                                .await
                                .with_context(|| format!("Failed to push {}", source.display()))?;
                            pushed.insert(key, digest);
                            digest
                        }
                    }
                }
            };
            digests.push(digest);
        }

        let options = SubmitOptions {
            queue_timeout: job.queue_timeout,
        };
        match client.submit_with(job.to_spec(digests), options).await {
            Ok(handle) => {
                names.insert(handle.client_job_id(), job.name.clone());
                handles.push(handle);
            }
            Err(ClientError::Rejected(message)) => {
                println!("REJECTED {}: {}", job.name, message);
                failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut passed = 0usize;
    let mut results = client.results(handles);
    while let Some(result) = results.next().await {
        let result = result?;
        let name = names
            .get(&result.client_job_id)
            .map(String::as_str)
            .unwrap_or("?");
        if report(name, &result, verbose) {
            passed += 1;
        } else {
            failed += 1;
        }
    }

    println!();
    println!("{passed} passed, {failed} failed");
    Ok(failed == 0)
}

fn report(name: &str, result: &JobResult, verbose: bool) -> bool {
    match &result.outcome {
        JobOutcome::Completed(completed) => {
            let success = completed.exit_status.success();
            let label = if success { "PASS" } else { "FAIL" };
            println!(
                "{label} {name} ({}, {:.2}s)",
                completed.exit_status,
                completed.usage.wall_time.as_secs_f64()
            );
            if !success || verbose {
                print_output("stdout", &completed.stdout);
                print_output("stderr", &completed.stderr);
            }
            success
        }
        JobOutcome::Failed(reason) => {
            println!("FAIL {name}: {reason}");
            false
        }
    }
}

fn print_output(stream: &str, output: &CapturedOutput) {
    if output.data.is_empty() {
        return;
    }
    println!("--- {stream} ---");
    print!("{}", output.data);
    if !output.data.ends_with('\n') {
        println!();
    }
    if output.truncated > 0 {
        println!("[{} bytes truncated]", output.truncated);
    }
}
