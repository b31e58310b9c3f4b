use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored domain as stored in the `domains` table.
///
/// Hostnames are normalized (trimmed, lowercased) by the storage layer on
/// insert, and unique across the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: i64,
    pub hostname: String,
    pub is_active: bool,
    pub last_scanned: Option<DateTime<Utc>>,
    pub next_scan: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome classification of a completed scan.
///
/// # Examples
///
/// ```
/// use certwatch_common::types::ScanStatus;
///
/// let status: ScanStatus = "VALID".parse().unwrap();
/// assert_eq!(status, ScanStatus::Valid);
/// assert_eq!(status.to_string(), "VALID");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanStatus {
    /// The certificate was retrieved and parsed. The certificate itself may
    /// already be expired; see `days_until_expiry`.
    Valid,
    /// A certificate was presented but rejected by strict verification.
    Invalid,
    /// The probe failed: no certificate could be retrieved.
    Failed,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStatus::Valid => write!(f, "VALID"),
            ScanStatus::Invalid => write!(f, "INVALID"),
            ScanStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "VALID" => Ok(ScanStatus::Valid),
            "INVALID" => Ok(ScanStatus::Invalid),
            "FAILED" => Ok(ScanStatus::Failed),
            _ => Err(format!("unknown scan status: {s}")),
        }
    }
}

/// Facts extracted from a leaf certificate during a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateFacts {
    pub common_name: Option<String>,
    pub san_list: Vec<String>,
    pub issuer: String,
    pub subject: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Issuer string equals subject string. String identity, not a
    /// cryptographic check.
    pub self_signed: bool,
    pub key_bits: Option<i32>,
    pub signature_algorithm: String,
    /// The probe time falls within [not_before, not_after].
    pub is_valid: bool,
    /// Whole days until not_after; negative once expired.
    pub days_until_expiry: i64,
}

/// One finished probe for one domain. Ephemeral: produced by the scanner,
/// consumed by the result sink, not retained beyond persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanAttempt {
    pub domain_id: i64,
    pub hostname: String,
    pub scanned_at: DateTime<Utc>,
    pub status: ScanStatus,
    pub facts: Option<CertificateFacts>,
    pub error: Option<String>,
    /// Status code from the optional secondary HTTP check.
    pub http_status: Option<u16>,
    pub elapsed_ms: u64,
}

/// Aggregated statistics for one completed scheduler run. Append-only
/// audit trail in the `scan_runs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRunSummary {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_domains: u32,
    pub valid_count: u32,
    pub invalid_count: u32,
    pub failed_count: u32,
    /// Domains with `days_until_expiry < 7`, including already-expired ones.
    pub expiring_soon_count: u32,
    pub duration_secs: i64,
}

impl ScanRunSummary {
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            id: crate::id::next_id(),
            started_at,
            finished_at: started_at,
            total_domains: 0,
            valid_count: 0,
            invalid_count: 0,
            failed_count: 0,
            expiring_soon_count: 0,
            duration_secs: 0,
        }
    }

    /// Fold one attempt into the running counters.
    pub fn record(&mut self, attempt: &ScanAttempt) {
        self.total_domains += 1;
        match attempt.status {
            ScanStatus::Valid => {
                self.valid_count += 1;
                if let Some(facts) = &attempt.facts {
                    if facts.days_until_expiry < 7 {
                        self.expiring_soon_count += 1;
                    }
                }
            }
            ScanStatus::Invalid => self.invalid_count += 1,
            ScanStatus::Failed => self.failed_count += 1,
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        self.duration_secs = (finished_at - self.started_at).num_seconds();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn attempt(status: ScanStatus, days: i64) -> ScanAttempt {
        let now = Utc::now();
        let facts = (status == ScanStatus::Valid).then(|| CertificateFacts {
            common_name: Some("example.com".into()),
            san_list: vec!["example.com".into()],
            issuer: "CN=issuer".into(),
            subject: "CN=example.com".into(),
            serial_number: "01".into(),
            not_before: now - Duration::days(30),
            not_after: now + Duration::days(days),
            self_signed: false,
            key_bits: Some(2048),
            signature_algorithm: "SHA256withRSA".into(),
            is_valid: days > 0,
            days_until_expiry: days,
        });
        ScanAttempt {
            domain_id: 1,
            hostname: "example.com".into(),
            scanned_at: now,
            status,
            facts,
            error: None,
            http_status: None,
            elapsed_ms: 10,
        }
    }

    #[test]
    fn scan_status_roundtrip() {
        for s in ["VALID", "INVALID", "FAILED"] {
            let parsed: ScanStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("PENDING".parse::<ScanStatus>().is_err());
    }

    #[test]
    fn summary_counts_expiring_soon_including_negative_days() {
        let mut summary = ScanRunSummary::begin(Utc::now());
        summary.record(&attempt(ScanStatus::Valid, 40));
        summary.record(&attempt(ScanStatus::Valid, 3));
        summary.record(&attempt(ScanStatus::Valid, -5));
        summary.record(&attempt(ScanStatus::Failed, 0));
        summary.record(&attempt(ScanStatus::Invalid, 0));

        assert_eq!(summary.total_domains, 5);
        assert_eq!(summary.valid_count, 3);
        assert_eq!(summary.invalid_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.expiring_soon_count, 2);
    }
}
