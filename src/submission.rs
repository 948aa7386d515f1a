// Normalizes image references, enforces idempotency, and admits new scans.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::db::models::{Scan, ScanStatus};
use crate::db::store::ScanStore;
use crate::errors::ScanError;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._/-]*[a-z0-9]$|^[a-z0-9]$").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").unwrap());

const DEFAULT_TAG: &str = "latest";
const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub raw_image_name: String,
    pub raw_tag: Option<String>,
    pub raw_registry: Option<String>,
    pub force_rescan: bool,
    pub actor: String,
}

#[derive(Debug)]
pub struct SubmissionOutcome {
    pub scan: Scan,
    pub cache_hit: bool,
    pub newly_created: bool,
}

#[derive(Debug, Clone)]
struct NormalizedImage {
    registry: String,
    name: String,
    tag: String,
}

fn normalize(request: &SubmissionRequest) -> Result<NormalizedImage, ScanError> {
    let mut name = request.raw_image_name.trim().to_lowercase();
    name = name.trim_matches('/').to_string();

    let mut tag = request.raw_tag.clone();
    if tag.is_none() {
        if let Some(idx) = name.rfind(':') {
            // Only split on a trailing `:tag`, not a registry port like
            // `localhost:5000/name`.
            if !name[idx + 1..].contains('/') {
                tag = Some(name[idx + 1..].to_string());
                name = name[..idx].to_string();
            }
        }
    }

    let mut registry = request.raw_registry.clone();
    if registry.is_none() {
        if let Some(slash_idx) = name.find('/') {
            let first_segment = &name[..slash_idx];
            if first_segment.contains('.') || first_segment.contains(':') || first_segment == "localhost" {
                registry = Some(first_segment.to_string());
                name = name[slash_idx + 1..].to_string();
            }
        }
    }

    let tag = tag.unwrap_or_else(|| DEFAULT_TAG.to_string());
    let registry = registry.unwrap_or_else(|| DEFAULT_REGISTRY.to_string());

    if !NAME_RE.is_match(&name) {
        return Err(ScanError::Validation(format!("invalid image name: {name}")));
    }
    if !TAG_RE.is_match(&tag) || tag.starts_with('-') || tag.starts_with('.') {
        return Err(ScanError::Validation(format!("invalid image tag: {tag}")));
    }

    Ok(NormalizedImage { registry, name, tag })
}

/// `sha256(registry/name:tag:bucket)`, bucket = now floored to the TTL window.
fn idempotency_key(image: &NormalizedImage, ttl_minutes: i64) -> String {
    let ttl_minutes = ttl_minutes.max(1);
    let now = Utc::now();
    let epoch_minutes = now.timestamp() / 60;
    let bucket = (epoch_minutes / ttl_minutes) * ttl_minutes;

    let payload = format!("{}/{}:{}:{}", image.registry, image.name, image.tag, bucket);
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

pub struct SubmissionService<'a> {
    store: &'a ScanStore,
    cache_ttl_minutes: i64,
}

impl<'a> SubmissionService<'a> {
    pub fn new(store: &'a ScanStore, cache_ttl_minutes: i64) -> Self {
        Self { store, cache_ttl_minutes }
    }

    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmissionOutcome, ScanError> {
        let image = normalize(&request)?;

        if !request.force_rescan {
            if let Some(scan) = self
                .store
                .find_cached_scan(&image.registry, &image.name, &image.tag, self.cache_ttl_minutes)
                .await?
            {
                return Ok(SubmissionOutcome {
                    scan,
                    cache_hit: true,
                    newly_created: false,
                });
            }

            if let Some(scan) = self
                .store
                .find_in_progress(&image.registry, &image.name, &image.tag)
                .await?
            {
                return Ok(SubmissionOutcome {
                    scan,
                    cache_hit: false,
                    newly_created: false,
                });
            }
        }

        // `force_rescan` means bypass dedup entirely: inserting under the
        // deterministic bucketed key here would collide with whatever scan
        // (this one's own past run included) already holds it this window.
        let key = (!request.force_rescan).then(|| idempotency_key(&image, self.cache_ttl_minutes));
        let scan = match self
            .store
            .create(&image.registry, &image.name, &image.tag, key.as_deref())
            .await
        {
            Ok(scan) => scan,
            Err(e) if crate::errors::is_unique_violation(&e) => {
                return Err(ScanError::DuplicateSubmission(format!(
                    "a scan with idempotency key {key:?} was just created by another request"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        debug_assert_eq!(scan.status, ScanStatus::Pending);

        Ok(SubmissionOutcome {
            scan,
            cache_hit: false,
            newly_created: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str) -> SubmissionRequest {
        SubmissionRequest {
            raw_image_name: name.to_string(),
            raw_tag: None,
            raw_registry: None,
            force_rescan: false,
            actor: "test".to_string(),
        }
    }

    #[test]
    fn defaults_tag_and_registry() {
        let image = normalize(&req("nginx")).unwrap();
        assert_eq!(image.registry, "docker.io");
        assert_eq!(image.name, "nginx");
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn splits_trailing_tag_on_rightmost_colon() {
        let image = normalize(&req("redis:7.0")).unwrap();
        assert_eq!(image.name, "redis");
        assert_eq!(image.tag, "7.0");
    }

    #[test]
    fn lifts_registry_with_dot() {
        let image = normalize(&req("my.registry.example.com/team/app:v1")).unwrap();
        assert_eq!(image.registry, "my.registry.example.com");
        assert_eq!(image.name, "team/app");
        assert_eq!(image.tag, "v1");
    }

    #[test]
    fn lifts_localhost_registry() {
        let image = normalize(&req("localhost/app")).unwrap();
        assert_eq!(image.registry, "localhost");
        assert_eq!(image.name, "app");
    }

    #[test]
    fn lifts_registry_with_port() {
        let image = normalize(&req("localhost:5000/app")).unwrap();
        assert_eq!(image.registry, "localhost:5000");
        assert_eq!(image.name, "app");
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn strips_leading_and_trailing_slashes() {
        let image = normalize(&req("/nginx/")).unwrap();
        assert_eq!(image.name, "nginx");
    }

    #[test]
    fn rejects_invalid_tag_starting_with_dash() {
        let result = normalize(&SubmissionRequest {
            raw_tag: Some("-bad".to_string()),
            ..req("nginx")
        });
        assert!(matches!(result, Err(ScanError::Validation(_))));
    }

    #[test]
    fn rejects_invalid_name() {
        let result = normalize(&req("UPPER_not_allowed!!"));
        assert!(result.is_err());
    }

    #[test]
    fn idempotency_key_is_deterministic_within_bucket() {
        let image = NormalizedImage {
            registry: "docker.io".to_string(),
            name: "nginx".to_string(),
            tag: "latest".to_string(),
        };
        let a = idempotency_key(&image, 60);
        let b = idempotency_key(&image, 60);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
