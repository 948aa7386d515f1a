// Small helpers shared across the worker pool and submission path.

/// Short, readable identifier for a worker process: hostname (if available)
/// plus its pool slot and a random suffix, so audit rows and the scan's
/// `worker_id` column are traceable in logs without a separate registration
/// step.
pub fn generate_worker_id(slot: usize) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{slot}-{}", &uuid::Uuid::new_v4().to_string()[..8])
}
