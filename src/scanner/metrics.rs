// Scanner JSON output -> risk metrics.

use serde::Deserialize;

use crate::config::RiskWeights;
use crate::db::models::ComplianceStatus;

#[derive(Debug, Deserialize)]
pub struct ScannerDocument {
    #[serde(default)]
    #[serde(rename = "SchemaVersion")]
    pub schema_version: Option<i64>,
    #[serde(default)]
    #[serde(rename = "Results")]
    pub results: Option<Vec<ScannerResult>>,
    #[serde(default)]
    #[serde(rename = "Metadata")]
    pub metadata: Option<ScannerMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct ScannerMetadata {
    #[serde(default)]
    #[serde(rename = "RepoDigests")]
    pub repo_digests: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ScannerResult {
    #[serde(default)]
    #[serde(rename = "Vulnerabilities")]
    pub vulnerabilities: Option<Vec<ScannerVulnerability>>,
}

#[derive(Debug, Deserialize)]
pub struct ScannerVulnerability {
    #[serde(rename = "VulnerabilityID")]
    pub vulnerability_id: String,
    #[serde(rename = "PkgName")]
    pub package_name: String,
    #[serde(rename = "InstalledVersion")]
    pub installed_version: String,
    #[serde(default)]
    #[serde(rename = "FixedVersion")]
    pub fixed_version: Option<String>,
    #[serde(rename = "Severity")]
    pub severity: String,
    #[serde(default)]
    #[serde(rename = "CVSS")]
    pub cvss: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ScannerVulnerability {
    pub fn is_fixable(&self) -> bool {
        self.fixed_version
            .as_deref()
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }

    /// CVSS.nvd.V3Score, then any source's V3Score, then CVSS.nvd.V2Score,
    /// then any source's V2Score.
    pub fn cvss_score(&self) -> Option<f64> {
        let cvss = self.cvss.as_ref()?;

        if let Some(score) = cvss
            .get("nvd")
            .and_then(|v| v.get("V3Score"))
            .and_then(|v| v.as_f64())
        {
            return Some(score);
        }
        if let Some(score) = cvss.values().find_map(|v| v.get("V3Score")).and_then(|v| v.as_f64()) {
            return Some(score);
        }
        if let Some(score) = cvss
            .get("nvd")
            .and_then(|v| v.get("V2Score"))
            .and_then(|v| v.as_f64())
        {
            return Some(score);
        }
        cvss.values().find_map(|v| v.get("V2Score")).and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "MEDIUM" => Severity::Medium,
            "LOW" => Severity::Low,
            _ => Severity::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedMetrics {
    pub critical_count: i32,
    pub high_count: i32,
    pub medium_count: i32,
    pub low_count: i32,
    pub unknown_count: i32,
    pub total_vulnerabilities: i32,
    pub fixable_count: i32,
    pub unfixable_count: i32,
    pub risk_score: i32,
    pub max_cvss_score: Option<f64>,
    pub avg_cvss_score: Option<f64>,
    pub is_compliant: bool,
    pub compliance_status: ComplianceStatus,
    pub image_digest: Option<String>,
    pub per_finding: Vec<FindingRow>,
}

#[derive(Debug, Clone)]
pub struct FindingRow {
    pub vulnerability_id: String,
    pub package_name: String,
    pub package_version: String,
    pub fixed_version: Option<String>,
    pub severity: String,
    pub cvss_score: Option<f64>,
    pub is_fixable: bool,
}

pub fn extract(document: &ScannerDocument, weights: &RiskWeights) -> ExtractedMetrics {
    let mut metrics = ExtractedMetrics::default();
    let mut cvss_scores: Vec<f64> = Vec::new();

    let results = document.results.as_deref().unwrap_or(&[]);
    for result in results {
        let vulns = result.vulnerabilities.as_deref().unwrap_or(&[]);
        for vuln in vulns {
            let severity = Severity::parse(&vuln.severity);
            match severity {
                Severity::Critical => metrics.critical_count += 1,
                Severity::High => metrics.high_count += 1,
                Severity::Medium => metrics.medium_count += 1,
                Severity::Low => metrics.low_count += 1,
                Severity::Unknown => metrics.unknown_count += 1,
            }

            let is_fixable = vuln.is_fixable();
            if is_fixable {
                metrics.fixable_count += 1;
            } else {
                metrics.unfixable_count += 1;
            }

            if let Some(score) = vuln.cvss_score() {
                cvss_scores.push(score);
            }

            metrics.per_finding.push(FindingRow {
                vulnerability_id: vuln.vulnerability_id.clone(),
                package_name: vuln.package_name.clone(),
                package_version: vuln.installed_version.clone(),
                fixed_version: vuln.fixed_version.clone(),
                severity: vuln.severity.clone(),
                cvss_score: vuln.cvss_score(),
                is_fixable,
            });
        }
    }

    metrics.total_vulnerabilities = metrics.critical_count
        + metrics.high_count
        + metrics.medium_count
        + metrics.low_count
        + metrics.unknown_count;

    metrics.risk_score = weights.critical * metrics.critical_count
        + weights.high * metrics.high_count
        + weights.medium * metrics.medium_count
        + weights.low * metrics.low_count;

    if !cvss_scores.is_empty() {
        let max = cvss_scores.iter().cloned().fold(f64::MIN, f64::max);
        let sum: f64 = cvss_scores.iter().sum();
        let avg = (sum / cvss_scores.len() as f64 * 100.0).round() / 100.0;
        metrics.max_cvss_score = Some(max);
        metrics.avg_cvss_score = Some(avg);
    }

    metrics.is_compliant = metrics.critical_count == 0 && metrics.high_count == 0;
    metrics.compliance_status = if metrics.critical_count > 0 || metrics.high_count > 0 {
        ComplianceStatus::NonCompliant
    } else if metrics.medium_count > 0 || metrics.low_count > 0 {
        ComplianceStatus::PendingReview
    } else {
        ComplianceStatus::Compliant
    };

    metrics.image_digest = document
        .metadata
        .as_ref()
        .and_then(|m| m.repo_digests.as_ref())
        .and_then(|d| d.first())
        .cloned();

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_from(json: serde_json::Value) -> ScannerDocument {
        serde_json::from_value(json).unwrap()
    }

    fn default_weights() -> RiskWeights {
        RiskWeights::default()
    }

    #[test]
    fn missing_results_key_yields_all_zeros_and_compliant() {
        let doc = doc_from(serde_json::json!({ "SchemaVersion": 2 }));
        let metrics = extract(&doc, &default_weights());
        assert_eq!(metrics.total_vulnerabilities, 0);
        assert!(metrics.is_compliant);
        assert_eq!(metrics.compliance_status, ComplianceStatus::Compliant);
    }

    #[test]
    fn null_vulnerabilities_contribute_zero_findings() {
        let doc = doc_from(serde_json::json!({
            "Results": [{ "Vulnerabilities": null }]
        }));
        let metrics = extract(&doc, &default_weights());
        assert_eq!(metrics.total_vulnerabilities, 0);
    }

    #[test]
    fn risk_score_arithmetic_matches_scenario() {
        let doc = doc_from(serde_json::json!({
            "Results": [{
                "Vulnerabilities": [
                    { "VulnerabilityID": "C1", "PkgName": "a", "InstalledVersion": "1", "Severity": "CRITICAL" },
                    { "VulnerabilityID": "C2", "PkgName": "a", "InstalledVersion": "1", "Severity": "critical" },
                    { "VulnerabilityID": "H1", "PkgName": "b", "InstalledVersion": "1", "Severity": "HIGH" },
                    { "VulnerabilityID": "M1", "PkgName": "c", "InstalledVersion": "1", "Severity": "MEDIUM" },
                    { "VulnerabilityID": "L1", "PkgName": "d", "InstalledVersion": "1", "Severity": "LOW" },
                    { "VulnerabilityID": "L2", "PkgName": "d", "InstalledVersion": "1", "Severity": "LOW" }
                ]
            }]
        }));
        let metrics = extract(&doc, &default_weights());
        assert_eq!(metrics.critical_count, 2);
        assert_eq!(metrics.high_count, 1);
        assert_eq!(metrics.medium_count, 1);
        assert_eq!(metrics.low_count, 2);
        assert_eq!(metrics.risk_score, 262);
        assert_eq!(metrics.compliance_status, ComplianceStatus::NonCompliant);
    }

    #[test]
    fn pending_review_classification_matches_scenario() {
        let doc = doc_from(serde_json::json!({
            "Results": [{
                "Vulnerabilities": [
                    {
                        "VulnerabilityID": "M1", "PkgName": "a", "InstalledVersion": "1",
                        "FixedVersion": "1.2", "Severity": "MEDIUM",
                        "CVSS": { "nvd": { "V3Score": 5.0 } }
                    },
                    {
                        "VulnerabilityID": "M2", "PkgName": "b", "InstalledVersion": "1",
                        "FixedVersion": "2.0", "Severity": "MEDIUM",
                        "CVSS": { "nvd": { "V3Score": 4.5 } }
                    }
                ]
            }]
        }));
        let metrics = extract(&doc, &default_weights());
        assert_eq!(metrics.critical_count, 0);
        assert_eq!(metrics.high_count, 0);
        assert_eq!(metrics.medium_count, 2);
        assert_eq!(metrics.fixable_count, 2);
        assert!(!metrics.is_compliant);
        assert_eq!(metrics.compliance_status, ComplianceStatus::PendingReview);
        assert_eq!(metrics.risk_score, 20);
        assert_eq!(metrics.max_cvss_score, Some(5.0));
        assert_eq!(metrics.avg_cvss_score, Some(4.75));
    }

    #[test]
    fn whitespace_fixed_version_is_unfixable() {
        let doc = doc_from(serde_json::json!({
            "Results": [{
                "Vulnerabilities": [
                    { "VulnerabilityID": "L1", "PkgName": "a", "InstalledVersion": "1", "FixedVersion": "   ", "Severity": "LOW" }
                ]
            }]
        }));
        let metrics = extract(&doc, &default_weights());
        assert_eq!(metrics.fixable_count, 0);
        assert_eq!(metrics.unfixable_count, 1);
    }

    #[test]
    fn unknown_severity_counted_but_zero_weighted() {
        let doc = doc_from(serde_json::json!({
            "Results": [{
                "Vulnerabilities": [
                    { "VulnerabilityID": "X1", "PkgName": "a", "InstalledVersion": "1", "Severity": "WEIRD" }
                ]
            }]
        }));
        let metrics = extract(&doc, &default_weights());
        assert_eq!(metrics.unknown_count, 1);
        assert_eq!(metrics.risk_score, 0);
    }

    #[test]
    fn cvss_priority_falls_back_to_other_source_v3_then_v2() {
        let vuln: ScannerVulnerability = serde_json::from_value(serde_json::json!({
            "VulnerabilityID": "C1", "PkgName": "a", "InstalledVersion": "1", "Severity": "HIGH",
            "CVSS": { "redhat": { "V3Score": 7.1 } }
        }))
        .unwrap();
        assert_eq!(vuln.cvss_score(), Some(7.1));

        let vuln_v2: ScannerVulnerability = serde_json::from_value(serde_json::json!({
            "VulnerabilityID": "C2", "PkgName": "a", "InstalledVersion": "1", "Severity": "HIGH",
            "CVSS": { "nvd": { "V2Score": 6.0 } }
        }))
        .unwrap();
        assert_eq!(vuln_v2.cvss_score(), Some(6.0));
    }

    #[test]
    fn image_digest_picked_from_repo_digests_first_entry() {
        let doc = doc_from(serde_json::json!({
            "Results": [],
            "Metadata": { "RepoDigests": ["nginx@sha256:abc", "nginx@sha256:def"] }
        }));
        let metrics = extract(&doc, &default_weights());
        assert_eq!(metrics.image_digest.as_deref(), Some("nginx@sha256:abc"));
    }
}
