//! Broker statistics.

use anyhow::{Context, Result};
use hopper_scheduler::SchedulerSnapshot;

pub async fn show(http: &str, json: bool) -> Result<()> {
    let url = format!("{}/stats", http.trim_end_matches('/'));
    let snapshot: SchedulerSnapshot = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let stats = &snapshot.statistics;
    let states = &stats.job_states;
    println!("Workers:     {}", stats.workers.len());
    println!("Clients:     {}", stats.clients);
    println!("Queue depth: {}", stats.queue_depth);
    println!(
        "Jobs:        {} queued, {} assigned, {} running, {} completed, {} failed, {} cancelled",
        states.queued,
        states.assigned,
        states.running,
        states.completed,
        states.failed,
        states.cancelled
    );
    println!("Requeues:    {}", stats.requeues);
    println!("Store bytes: {}", stats.store_bytes);

    if !stats.workers.is_empty() {
        println!();
        println!("{:<48} {:>6} {:>6} {:>8}", "WORKER", "SLOTS", "FREE", "CACHED");
        for worker in &stats.workers {
            println!(
                "{:<48} {:>6} {:>6} {:>8}",
                worker.worker_id.to_string(),
                worker.slots,
                worker.free_slots,
                worker.cached_artifacts
            );
        }
    }
    Ok(())
}
