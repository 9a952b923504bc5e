//! Periodic sync loop with interval jitter.

use log::debug;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::sync::engine::SyncEngine;

/// Maximum jitter added to each periodic interval.
pub const INTERVAL_JITTER_MS: u64 = 5_000;

fn jittered(interval: Duration) -> Duration {
    let cap = INTERVAL_JITTER_MS.min(interval.as_millis() as u64 / 4 + 1);
    let jitter = rand::thread_rng().gen_range(0..=cap);
    interval + Duration::from_millis(jitter)
}

/// Drives periodic cycles; the debouncer handles push-after-edit.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Start the background loop; restarting replaces the previous loop.
    pub async fn start(&self) {
        let engine = Arc::clone(&self.engine);
        let interval = self.interval;

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(interval)).await;

                // Honor the failure backoff recorded by the engine.
                let due = match engine.store_status() {
                    Ok(status) => status
                        .next_retry_at
                        .as_deref()
                        .and_then(|at| chrono::DateTime::parse_from_rfc3339(at).ok())
                        .map(|at| chrono::Utc::now() >= at)
                        .unwrap_or(true),
                    Err(_) => true,
                };
                if !due {
                    debug!("[Sync] periodic cycle skipped: backing off");
                    continue;
                }

                if let Err(err) = engine.trigger_sync().await {
                    debug!("[Sync] periodic cycle failed: {}", err);
                }
            }
        });

        let mut handle = self.handle.lock().await;
        if let Some(previous) = handle.replace(task) {
            previous.abort();
        }
    }

    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(task) = handle.take() {
            task.abort();
        }
    }
}
