// Fixed-window submission-endpoint rate limiting, backed by `cache::CacheService`.

/// Key the limiter on the caller's IP. There is no per-tenant auth in this
/// core (multi-tenant isolation is a non-goal), so IP is the only identity
/// available at the submission endpoint.
pub fn rate_limit_key(ip: Option<&str>) -> String {
    match ip {
        Some(ip) => format!("ip:{ip}"),
        None => "unknown".to_string(),
    }
}
