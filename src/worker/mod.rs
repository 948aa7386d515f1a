// Worker pool: a fixed number of parallel drivers pulling pending scans off
// the claim queue and running them to a terminal state.

pub mod state_machine;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::db::claimer::JobClaimer;
use crate::db::store::ScanStore;
use crate::utils::generate_worker_id;
use state_machine::ScanDriver;

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const MAX_BACKOFF_SECONDS: u64 = 60;

/// Shared stop flag: graceful shutdown sets this so workers stop claiming
/// new scans, but lets whatever each worker is currently driving finish.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Spawns `config.worker_concurrency` driver loops and a retry-sweep task.
/// Returns the join handles so the caller can await them on shutdown.
pub fn spawn_pool(
    store: ScanStore,
    claimer: JobClaimer,
    config: Arc<Config>,
    shutdown: ShutdownFlag,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(config.worker_concurrency as usize + 1);

    for slot in 0..config.worker_concurrency as usize {
        let store = store.clone();
        let claimer = claimer.clone();
        let config = Arc::clone(&config);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(slot, store, claimer, config, shutdown).await;
        }));
    }

    {
        let store = store.clone();
        let config = Arc::clone(&config);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            retry_sweep_loop(store, config, shutdown).await;
        }));
    }

    handles
}

/// One driver: claim, drive to terminal, repeat. Tracks consecutive
/// errors unrelated to a specific scan (claim/poll failures) and exits
/// after too many so a supervisor can restart it; sleeps with capped
/// exponential backoff between such errors.
async fn worker_loop(
    slot: usize,
    store: ScanStore,
    claimer: JobClaimer,
    config: Arc<Config>,
    shutdown: ShutdownFlag,
) {
    let worker_id = generate_worker_id(slot);
    tracing::info!(worker_id = %worker_id, "worker started");

    let mut consecutive_errors: u32 = 0;
    let mut empty_last_check = false;

    loop {
        if shutdown.is_set() {
            tracing::info!(worker_id = %worker_id, "shutdown flag set, worker exiting claim loop");
            break;
        }

        if empty_last_check {
            tokio::time::sleep(Duration::from_secs(config.poll_interval_seconds)).await;
        }

        match claimer.claim_next(&worker_id).await {
            Ok(Some(claimed)) => {
                consecutive_errors = 0;
                empty_last_check = false;
                tracing::info!(worker_id = %worker_id, scan_id = %claimed.id, image = %claimed.image.reference(), "claimed scan");
                let driver = ScanDriver::new(&store, &config, &worker_id);
                driver.drive(claimed).await;
            }
            Ok(None) => {
                empty_last_check = true;
            }
            Err(e) => {
                consecutive_errors += 1;
                empty_last_check = true;
                tracing::error!(worker_id = %worker_id, error = %e, consecutive_errors, "claim attempt failed");
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!(worker_id = %worker_id, "too many consecutive errors, worker exiting for supervisor restart");
                    break;
                }
                let backoff = 2u64.saturating_pow(consecutive_errors).min(MAX_BACKOFF_SECONDS);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }
    }
}

/// Periodically re-enqueues failed scans eligible for retry (§7 retry
/// policy) as fresh pending rows for the pool to claim like any submission.
async fn retry_sweep_loop(store: ScanStore, config: Arc<Config>, shutdown: ShutdownFlag) {
    loop {
        if shutdown.is_set() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(config.poll_interval_seconds * 6)).await;

        match store.retry_candidates(config.max_retries).await {
            Ok(candidates) => {
                for scan in candidates {
                    if let Err(e) = store.requeue_for_retry(scan.id).await {
                        tracing::warn!(scan_id = %scan.id, error = %e, "failed to requeue retry candidate");
                        continue;
                    }
                    tracing::info!(scan_id = %scan.id, retry_count = scan.retry_count, "requeued failed scan for retry");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "retry-candidate query failed");
            }
        }
    }
}
